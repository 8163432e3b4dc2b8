//! Pipeline run metadata, rename history, and the metadata k/v table.

use rusqlite::{Connection, Result, params};
use serde::Serialize;

use crate::store::now;

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub batch_id: String,
    pub step: String,
    pub duration_ms: i64,
    pub outcome: String,
    pub detail: Option<String>,
}

pub fn record_step(db: &Connection, record: &StepRecord) -> Result<()> {
    db.execute(
        "INSERT INTO index_events (batch_id, step, duration_ms, outcome, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.batch_id,
            record.step,
            record.duration_ms,
            record.outcome,
            record.detail,
            now(),
        ],
    )?;
    Ok(())
}

pub fn recent_steps(db: &Connection, limit: usize) -> Result<Vec<StepRecord>> {
    let mut stmt = db.prepare(
        "SELECT batch_id, step, duration_ms, outcome, detail
         FROM index_events ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |r| {
        Ok(StepRecord {
            batch_id: r.get(0)?,
            step: r.get(1)?,
            duration_ms: r.get(2)?,
            outcome: r.get(3)?,
            detail: r.get(4)?,
        })
    })?;
    rows.collect()
}

pub fn record_move(db: &Connection, from: &str, to: &str) -> Result<()> {
    db.execute(
        "INSERT INTO note_moves (from_path, to_path, moved_at) VALUES (?1, ?2, ?3)",
        params![from, to, now()],
    )?;
    Ok(())
}

pub fn metadata_get(db: &Connection, key: &str) -> Result<Option<String>> {
    db.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        params![key],
        |r| r.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

pub fn metadata_set(db: &Connection, key: &str, value: &str) -> Result<()> {
    db.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_step_records_come_back_newest_first() {
        let db = test_db();
        for step in ["parse", "entities", "recency"] {
            record_step(
                &db,
                &StepRecord {
                    batch_id: "b1".to_string(),
                    step: step.to_string(),
                    duration_ms: 5,
                    outcome: "ok".to_string(),
                    detail: None,
                },
            )
            .unwrap();
        }
        let steps = recent_steps(&db, 2).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step, "recency");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let db = test_db();
        assert_eq!(metadata_get(&db, "k").unwrap(), None);
        metadata_set(&db, "k", "v1").unwrap();
        metadata_set(&db, "k", "v2").unwrap();
        assert_eq!(metadata_get(&db, "k").unwrap().as_deref(), Some("v2"));
    }
}
