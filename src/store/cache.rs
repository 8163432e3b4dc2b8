//! Serialized vault index for fast restart.

use rusqlite::{Connection, Result, params};

use crate::store::now;

pub struct CachedIndex {
    pub payload: String,
    pub note_count: usize,
    pub built_at: i64,
}

pub fn save(db: &Connection, payload: &str, note_count: usize) -> Result<()> {
    db.execute(
        "INSERT INTO vault_index_cache (id, payload, note_count, built_at) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
           payload = excluded.payload,
           note_count = excluded.note_count,
           built_at = excluded.built_at",
        params![payload, note_count as i64, now()],
    )?;
    Ok(())
}

pub fn load(db: &Connection) -> Result<Option<CachedIndex>> {
    db.query_row(
        "SELECT payload, note_count, built_at FROM vault_index_cache WHERE id = 1",
        [],
        |r| {
            Ok(CachedIndex {
                payload: r.get(0)?,
                note_count: r.get::<_, i64>(1)? as usize,
                built_at: r.get(2)?,
            })
        },
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

pub fn clear(db: &Connection) -> Result<()> {
    db.execute("DELETE FROM vault_index_cache", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_cache_roundtrip() {
        let db = test_db();
        assert!(load(&db).unwrap().is_none());
        save(&db, "{\"notes\":{}}", 42).unwrap();
        let cached = load(&db).unwrap().unwrap();
        assert_eq!(cached.note_count, 42);
        assert_eq!(cached.payload, "{\"notes\":{}}");
    }
}
