//! Per-note resolved link state: the current entity-link set with
//! quality signals, the survival history across edits, and the log of
//! links the engine itself applied.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, Result, params};

use crate::store::now;

/// Quality signals feeding the stored link weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkSignals {
    pub edits_survived: u32,
    pub co_sessions: u32,
    pub source_access: u32,
}

/// `weight = 1 + 0.5·min(edits,4) + 0.3·min(sessions,3) + 0.2·min(access,5)`,
/// which keeps the scoring layer derived from it inside [0, +4].
pub fn weight_from_signals(s: LinkSignals) -> f64 {
    1.0 + 0.5 * s.edits_survived.min(4) as f64
        + 0.3 * s.co_sessions.min(3) as f64
        + 0.2 * s.source_access.min(5) as f64
}

/// Current stored entity-link set for a note.
pub fn link_set(db: &Connection, path: &str) -> Result<HashSet<String>> {
    let mut stmt = db.prepare("SELECT entity FROM note_links WHERE path = ?1")?;
    let rows = stmt.query_map(params![path], |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// Replace a note's link set in one transaction. Rows for entities
/// that stay linked are kept untouched so their quality signals
/// survive the edit; a concurrent reader never sees the note with no
/// links at all.
pub fn replace_link_set(
    db: &mut Connection,
    path: &str,
    entities: &HashSet<String>,
) -> Result<()> {
    let tx = db.transaction()?;
    let existing: HashSet<String> = {
        let mut stmt = tx.prepare("SELECT entity FROM note_links WHERE path = ?1")?;
        let rows = stmt.query_map(params![path], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<_>>()?
    };
    for gone in existing.difference(entities) {
        tx.execute(
            "DELETE FROM note_links WHERE path = ?1 AND entity = ?2",
            params![path, gone],
        )?;
    }
    {
        let ts = now();
        let mut stmt = tx.prepare(
            "INSERT INTO note_links (path, entity, weight, updated_at) VALUES (?1, ?2, 1.0, ?3)",
        )?;
        for added in entities.difference(&existing) {
            stmt.execute(params![path, added, ts])?;
        }
    }
    tx.execute(
        "INSERT INTO fts_metadata (component, built_at) VALUES ('note_links', strftime('%s','now'))
         ON CONFLICT(component) DO UPDATE SET built_at = excluded.built_at",
        [],
    )?;
    tx.commit()?;
    Ok(())
}

/// Bump survival counts: every entity still linked after this edit
/// survived one more edit.
pub fn record_survivals(db: &Connection, path: &str, survivors: &HashSet<String>) -> Result<()> {
    let ts = now();
    for entity in survivors {
        db.execute(
            "INSERT INTO note_link_history (path, entity, survived_edits, first_seen, last_seen)
             VALUES (?1, ?2, 1, ?3, ?3)
             ON CONFLICT(path, entity) DO UPDATE SET
               survived_edits = survived_edits + 1,
               last_seen = excluded.last_seen",
            params![path, entity, ts],
        )?;
    }
    Ok(())
}

pub fn survived_edits(db: &Connection, path: &str, entity: &str) -> Result<u32> {
    let n: Option<u32> = db
        .query_row(
            "SELECT survived_edits FROM note_link_history WHERE path = ?1 AND entity = ?2",
            params![path, entity],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(n.unwrap_or(0))
}

/// Recompute stored weights from the signal columns. Staleness-gated
/// by the caller.
pub fn recompute_weights(db: &Connection, path: &str) -> Result<()> {
    let mut stmt = db.prepare(
        "SELECT entity, edits_survived, co_sessions, source_access FROM note_links WHERE path = ?1",
    )?;
    let rows: Vec<(String, LinkSignals)> = stmt
        .query_map(params![path], |r| {
            Ok((
                r.get::<_, String>(0)?,
                LinkSignals {
                    edits_survived: r.get(1)?,
                    co_sessions: r.get(2)?,
                    source_access: r.get(3)?,
                },
            ))
        })?
        .collect::<Result<_>>()?;

    for (entity, signals) in rows {
        db.execute(
            "UPDATE note_links SET weight = ?3, updated_at = ?4 WHERE path = ?1 AND entity = ?2",
            params![path, entity, weight_from_signals(signals), now()],
        )?;
    }
    Ok(())
}

pub fn sync_history_signal(db: &Connection, path: &str) -> Result<()> {
    db.execute(
        "UPDATE note_links SET edits_survived = COALESCE(
           (SELECT survived_edits FROM note_link_history h
             WHERE h.path = note_links.path AND h.entity = note_links.entity), 0)
         WHERE path = ?1",
        params![path],
    )?;
    Ok(())
}

/// Average stored weight per entity across the vault, for the edge
/// weight scoring layer.
pub fn average_weights(db: &Connection) -> Result<HashMap<String, f64>> {
    let mut stmt = db.prepare("SELECT entity, AVG(weight) FROM note_links GROUP BY entity")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?;
    rows.collect()
}

/// Record that the engine applied a link during a rewrite.
pub fn record_application(db: &Connection, path: &str, entity: &str) -> Result<()> {
    db.execute(
        "INSERT INTO wikilink_applications (path, entity, status, applied_at)
         VALUES (?1, ?2, 'applied', ?3)",
        params![path, entity, now()],
    )?;
    Ok(())
}

/// Entities the engine applied to this note and still considers live.
pub fn applied_entities(db: &Connection, path: &str) -> Result<HashSet<String>> {
    let mut stmt = db.prepare(
        "SELECT DISTINCT entity FROM wikilink_applications WHERE path = ?1 AND status = 'applied'",
    )?;
    let rows = stmt.query_map(params![path], |r| r.get::<_, String>(0))?;
    rows.collect()
}

pub fn mark_application(db: &Connection, path: &str, entity: &str, status: &str) -> Result<()> {
    db.execute(
        "UPDATE wikilink_applications SET status = ?3 WHERE path = ?1 AND entity = ?2",
        params![path, entity, status],
    )?;
    Ok(())
}

/// Rewrite every path-keyed row after a rename.
pub fn rename_path(db: &Connection, from: &str, to: &str) -> Result<()> {
    db.execute(
        "UPDATE wikilink_applications SET path = ?2 WHERE path = ?1",
        params![from, to],
    )?;
    db.execute(
        "UPDATE OR REPLACE note_links SET path = ?2 WHERE path = ?1",
        params![from, to],
    )?;
    db.execute(
        "UPDATE OR REPLACE note_link_history SET path = ?2 WHERE path = ?1",
        params![from, to],
    )?;
    db.execute(
        "UPDATE OR REPLACE note_tags SET path = ?2 WHERE path = ?1",
        params![from, to],
    )?;
    Ok(())
}

pub fn remove_note(db: &Connection, path: &str) -> Result<()> {
    db.execute("DELETE FROM note_links WHERE path = ?1", params![path])?;
    db.execute("DELETE FROM note_link_history WHERE path = ?1", params![path])?;
    db.execute("DELETE FROM wikilink_applications WHERE path = ?1", params![path])?;
    db.execute("DELETE FROM note_tags WHERE path = ?1", params![path])?;
    Ok(())
}
