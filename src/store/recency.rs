//! Last-mention tracking per entity, one of the scoring signals.

use std::collections::HashMap;

use rusqlite::{Connection, Result, params};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecencyRow {
    pub last_mentioned: i64,
    pub mention_count: u32,
}

pub fn bump(db: &Connection, entity: &str, at: i64) -> Result<()> {
    db.execute(
        "INSERT INTO recency (entity, last_mentioned, mention_count) VALUES (?1, ?2, 1)
         ON CONFLICT(entity) DO UPDATE SET
           last_mentioned = MAX(last_mentioned, excluded.last_mentioned),
           mention_count = mention_count + 1",
        params![entity, at],
    )?;
    Ok(())
}

pub fn remove(db: &Connection, entity: &str) -> Result<()> {
    db.execute("DELETE FROM recency WHERE entity = ?1", params![entity])?;
    Ok(())
}

pub fn all(db: &Connection) -> Result<HashMap<String, RecencyRow>> {
    let mut stmt = db.prepare("SELECT entity, last_mentioned, mention_count FROM recency")?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            RecencyRow {
                last_mentioned: r.get(1)?,
                mention_count: r.get(2)?,
            },
        ))
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_bump_accumulates_and_keeps_latest() {
        let db = test_db();
        bump(&db, "Turbopump", 100).unwrap();
        bump(&db, "Turbopump", 50).unwrap();
        let rows = all(&db).unwrap();
        let row = rows.get("Turbopump").unwrap();
        assert_eq!(row.last_mentioned, 100);
        assert_eq!(row.mention_count, 2);
    }
}
