//! Embedded state store. Every table here is derived from the
//! markdown on disk and can be dropped and rebuilt from scratch.

use rusqlite::{Connection, Result, ffi::sqlite3_auto_extension, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;

/// Current schema version; bump together with a new entry in
/// `MIGRATIONS`.
pub const SCHEMA_VERSION: i64 = 2;

/// Register sqlite-vec for every connection opened by this process.
fn register_vec_extension() {
    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut i8,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> i32,
        >(sqlite3_vec_init as *const ())));
    }
}

/// Open the state db with the sqlite-vec extension registered and
/// WAL journaling enabled.
pub fn state_db(path: &Path) -> Result<Connection> {
    register_vec_extension();
    let db = Connection::open(path)?;
    db.pragma_update(None, "journal_mode", "WAL")?;
    db.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(db)
}

/// Async wrapper around the same connection for use inside request
/// handlers and the pipeline.
pub async fn async_db(path: &Path) -> tokio_rusqlite::Result<tokio_rusqlite::Connection> {
    register_vec_extension();
    let db = tokio_rusqlite::Connection::open(path).await?;
    db.call(|conn| {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    })
    .await?;
    Ok(db)
}

/// Create all tables. Safe to run any number of times.
pub fn initialize_db(db: &Connection) -> Result<()> {
    db.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS entities (
    -- Display form of the title backing this entity
    name TEXT PRIMARY KEY,
    -- Lowercased, .md stripped; unique across the index
    name_lower TEXT NOT NULL UNIQUE,
    -- Vault-relative path of the backing note
    path TEXT NOT NULL,
    category TEXT NOT NULL,
    -- JSON array of declared aliases
    aliases TEXT NOT NULL DEFAULT '[]',
    -- backlinks + forward links of the backing note
    hub_score INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS recency (
    entity TEXT PRIMARY KEY,
    last_mentioned INTEGER NOT NULL,
    mention_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS cooccurrence (
    entity_a TEXT NOT NULL,
    entity_b TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity_a, entity_b)
);

CREATE TABLE IF NOT EXISTS note_links (
    path TEXT NOT NULL,
    entity TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    edits_survived INTEGER NOT NULL DEFAULT 0,
    co_sessions INTEGER NOT NULL DEFAULT 0,
    source_access INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (path, entity)
);

CREATE TABLE IF NOT EXISTS note_link_history (
    path TEXT NOT NULL,
    entity TEXT NOT NULL,
    survived_edits INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    PRIMARY KEY (path, entity)
);

CREATE TABLE IF NOT EXISTS wikilink_applications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL,
    entity TEXT NOT NULL,
    -- applied | removed | reconciled
    status TEXT NOT NULL DEFAULT 'applied',
    applied_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_applications_path ON wikilink_applications(path);

CREATE TABLE IF NOT EXISTS wikilink_feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    context TEXT NOT NULL,
    note_path TEXT NOT NULL,
    correct INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_entity ON wikilink_feedback(entity);

CREATE TABLE IF NOT EXISTS wikilink_suppressions (
    entity TEXT NOT NULL,
    -- empty string scopes the suppression globally
    folder TEXT NOT NULL DEFAULT '',
    fp_rate REAL NOT NULL,
    sample_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (entity, folder)
);

CREATE TABLE IF NOT EXISTS note_embedding_meta (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_embedding_meta (
    name TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_index_cache (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    payload TEXT NOT NULL,
    note_count INTEGER NOT NULL,
    built_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS note_moves (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_path TEXT NOT NULL,
    to_path TEXT NOT NULL,
    moved_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS note_tags (
    path TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (path, tag)
);

CREATE TABLE IF NOT EXISTS task_cache (
    path TEXT NOT NULL,
    line INTEGER NOT NULL,
    text TEXT NOT NULL,
    done INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (path, line)
);

CREATE TABLE IF NOT EXISTS index_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    step TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS fts_metadata (
    component TEXT PRIMARY KEY,
    built_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);
",
    )?;

    // Vector virtual tables can't take IF NOT EXISTS on every sqlite
    // build, so probe first. A missing vec extension degrades the
    // engine to lexical scoring instead of failing initialization.
    let have_note_vec: i64 = db.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'note_vec'",
        [],
        |r| r.get(0),
    )?;
    if have_note_vec == 0 {
        let created = db.execute(
            "CREATE VIRTUAL TABLE note_vec USING vec0(
path TEXT PRIMARY KEY,
embedding float[384]
);",
            [],
        );
        if let Err(e) = created {
            tracing::warn!("Create note vec table failed: {}", e);
        }
    }
    let have_entity_vec: i64 = db.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'entity_vec'",
        [],
        |r| r.get(0),
    )?;
    if have_entity_vec == 0 {
        let created = db.execute(
            "CREATE VIRTUAL TABLE entity_vec USING vec0(
name TEXT PRIMARY KEY,
embedding float[384]
);",
            [],
        );
        if let Err(e) = created {
            tracing::warn!("Create entity vec table failed: {}", e);
        }
    }

    db.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Ordered, idempotent migrations. Each runs at most once, guarded by
/// `schema_version`.
pub fn migrate_db(db: &mut Connection) -> Result<()> {
    let current: i64 = db
        .query_row("SELECT MAX(version) FROM schema_version", [], |r| {
            r.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0);

    // 2025-05-12 v1 -> v2: folder scoping for suppressions
    if current < 2 {
        let tx = db.transaction()?;
        tx.execute_batch(
            r"
CREATE TABLE IF NOT EXISTS wikilink_suppressions_new (
    entity TEXT NOT NULL,
    folder TEXT NOT NULL DEFAULT '',
    fp_rate REAL NOT NULL,
    sample_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (entity, folder)
);
INSERT OR IGNORE INTO wikilink_suppressions_new (entity, folder, fp_rate, sample_count, created_at)
SELECT entity, '', fp_rate, sample_count, created_at FROM wikilink_suppressions;
DROP TABLE wikilink_suppressions;
ALTER TABLE wikilink_suppressions_new RENAME TO wikilink_suppressions;
",
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (2)",
            [],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Atomic-swap rebuild: delete + bulk insert + metadata bump in one
/// transaction so readers never observe an empty table.
pub fn atomic_swap<F>(
    db: &mut Connection,
    component: &str,
    delete_sql: &str,
    insert: F,
) -> Result<usize>
where
    F: FnOnce(&rusqlite::Transaction) -> Result<usize>,
{
    let tx = db.transaction()?;
    tx.execute_batch(delete_sql)?;
    let inserted = insert(&tx)?;
    tx.execute(
        "INSERT INTO fts_metadata (component, built_at) VALUES (?1, strftime('%s','now'))
         ON CONFLICT(component) DO UPDATE SET built_at = excluded.built_at",
        params![component],
    )?;
    tx.commit()?;
    Ok(inserted)
}

/// Seconds since the named derived component was last rebuilt, or
/// None if it never was.
pub fn component_age_secs(db: &Connection, component: &str) -> Result<Option<i64>> {
    let built: Option<i64> = db
        .query_row(
            "SELECT built_at FROM fts_metadata WHERE component = ?1",
            params![component],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(built.map(|b| chrono::Utc::now().timestamp() - b))
}

pub fn mark_component_built(db: &Connection, component: &str) -> Result<()> {
    db.execute(
        "INSERT INTO fts_metadata (component, built_at) VALUES (?1, strftime('%s','now'))
         ON CONFLICT(component) DO UPDATE SET built_at = excluded.built_at",
        params![component],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn test_db() -> Connection {
    register_vec_extension();
    let db = Connection::open_in_memory().expect("in-memory db");
    initialize_db(&db).expect("initialize test db");
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let db = test_db();
        initialize_db(&db).unwrap();
        let version: i64 = db
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_atomic_swap_replaces_rows_and_bumps_metadata() {
        let mut db = test_db();
        db.execute(
            "INSERT INTO task_cache (path, line, text, done) VALUES ('a.md', 1, 'old', 0)",
            [],
        )
        .unwrap();

        let inserted = atomic_swap(&mut db, "task_cache", "DELETE FROM task_cache", |tx| {
            tx.execute(
                "INSERT INTO task_cache (path, line, text, done) VALUES ('a.md', 2, 'new', 1)",
                [],
            )
        })
        .unwrap();
        assert_eq!(inserted, 1);

        let (line, text): (i64, String) = db
            .query_row("SELECT line, text FROM task_cache", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!((line, text.as_str()), (2, "new"));
        assert!(component_age_secs(&db, "task_cache").unwrap().is_some());
    }

    #[test]
    fn test_component_age_unknown_component() {
        let db = test_db();
        assert_eq!(component_age_secs(&db, "nope").unwrap(), None);
    }
}
