//! Persistent suggestion feedback: explicit and implicit signals,
//! accuracy stats, and the suppression list derived from them.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, Result, params};

use crate::store::now;

/// Minimum samples before an entity can be suppressed globally.
pub const GLOBAL_SUPPRESSION_MIN_SAMPLES: u32 = 10;
/// Minimum samples before an entity can be suppressed in one folder.
pub const FOLDER_SUPPRESSION_MIN_SAMPLES: u32 = 5;
/// False-positive rate at which suppression kicks in (and below
/// which it is lifted again).
pub const SUPPRESSION_FP_RATE: f64 = 0.30;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccuracyStats {
    pub correct: u32,
    pub total: u32,
}

impl AccuracyStats {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }

    pub fn fp_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total - self.correct) as f64 / self.total as f64
    }
}

pub fn record(
    db: &Connection,
    entity: &str,
    context: &str,
    note_path: &str,
    correct: bool,
) -> Result<()> {
    db.execute(
        "INSERT INTO wikilink_feedback (entity, context, note_path, correct, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![entity, context, note_path, correct as i64, now()],
    )?;
    Ok(())
}

/// Global accuracy per entity.
pub fn global_stats(db: &Connection) -> Result<HashMap<String, AccuracyStats>> {
    let mut stmt = db.prepare(
        "SELECT entity, SUM(correct), COUNT(*) FROM wikilink_feedback GROUP BY entity",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            AccuracyStats {
                correct: r.get(1)?,
                total: r.get(2)?,
            },
        ))
    })?;
    rows.collect()
}

/// Accuracy per (folder, entity); the folder is the first path
/// segment of the note the feedback was recorded against.
pub fn folder_stats(db: &Connection) -> Result<HashMap<(String, String), AccuracyStats>> {
    let mut stmt = db.prepare(
        "SELECT CASE WHEN instr(note_path, '/') = 0 THEN ''
                ELSE substr(note_path, 1, instr(note_path, '/') - 1) END AS folder,
                entity, SUM(correct), COUNT(*)
         FROM wikilink_feedback GROUP BY folder, entity",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
            AccuracyStats {
                correct: r.get(2)?,
                total: r.get(3)?,
            },
        ))
    })?;
    rows.collect()
}

/// Recompute the suppression table from current stats. Entities whose
/// false-positive rate climbed past the threshold are suppressed;
/// entities that recovered are released.
pub fn recompute_suppressions(db: &Connection) -> Result<()> {
    let ts = now();

    for (entity, stats) in global_stats(db)? {
        if stats.total >= GLOBAL_SUPPRESSION_MIN_SAMPLES && stats.fp_rate() >= SUPPRESSION_FP_RATE {
            db.execute(
                "INSERT INTO wikilink_suppressions (entity, folder, fp_rate, sample_count, created_at)
                 VALUES (?1, '', ?2, ?3, ?4)
                 ON CONFLICT(entity, folder) DO UPDATE SET
                   fp_rate = excluded.fp_rate, sample_count = excluded.sample_count",
                params![entity, stats.fp_rate(), stats.total, ts],
            )?;
        } else {
            db.execute(
                "DELETE FROM wikilink_suppressions WHERE entity = ?1 AND folder = ''",
                params![entity],
            )?;
        }
    }

    for ((folder, entity), stats) in folder_stats(db)? {
        if folder.is_empty() {
            continue;
        }
        if stats.total >= FOLDER_SUPPRESSION_MIN_SAMPLES && stats.fp_rate() >= SUPPRESSION_FP_RATE {
            db.execute(
                "INSERT INTO wikilink_suppressions (entity, folder, fp_rate, sample_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entity, folder) DO UPDATE SET
                   fp_rate = excluded.fp_rate, sample_count = excluded.sample_count",
                params![entity, folder, stats.fp_rate(), stats.total, ts],
            )?;
        } else {
            db.execute(
                "DELETE FROM wikilink_suppressions WHERE entity = ?1 AND folder = ?2",
                params![entity, folder],
            )?;
        }
    }

    Ok(())
}

/// Globally suppressed entity names.
pub fn suppressed(db: &Connection) -> Result<HashSet<String>> {
    let mut stmt = db.prepare("SELECT entity FROM wikilink_suppressions WHERE folder = ''")?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    rows.collect()
}

/// (folder, entity) pairs suppressed within a single folder.
pub fn folder_suppressed(db: &Connection) -> Result<HashSet<(String, String)>> {
    let mut stmt = db.prepare(
        "SELECT folder, entity FROM wikilink_suppressions WHERE folder != ''",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    rows.collect()
}

/// Manual suppression, exposed through the feedback surface.
pub fn suppress(db: &Connection, entity: &str) -> Result<()> {
    db.execute(
        "INSERT OR REPLACE INTO wikilink_suppressions (entity, folder, fp_rate, sample_count, created_at)
         VALUES (?1, '', 1.0, 0, ?2)",
        params![entity, now()],
    )?;
    Ok(())
}

pub fn unsuppress(db: &Connection, entity: &str) -> Result<()> {
    db.execute(
        "DELETE FROM wikilink_suppressions WHERE entity = ?1",
        params![entity],
    )?;
    Ok(())
}

/// Drop all feedback state for an entity whose backing note is gone.
pub fn remove_entity(db: &Connection, entity: &str) -> Result<()> {
    db.execute("DELETE FROM wikilink_feedback WHERE entity = ?1", params![entity])?;
    db.execute(
        "DELETE FROM wikilink_suppressions WHERE entity = ?1",
        params![entity],
    )?;
    Ok(())
}
