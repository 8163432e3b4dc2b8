//! Stored vectors for notes and entities, with content hashes so
//! unchanged rows are skipped on rebuild.

use std::collections::HashMap;

use rusqlite::{Connection, Result, params};
use zerocopy::IntoBytes;

use crate::store::now;

fn stored_hash(db: &Connection, table: &str, key_col: &str, key: &str) -> Result<Option<String>> {
    let sql = format!("SELECT content_hash FROM {table} WHERE {key_col} = ?1");
    db.query_row(&sql, params![key], |r| r.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
}

pub fn note_hash(db: &Connection, path: &str) -> Result<Option<String>> {
    stored_hash(db, "note_embedding_meta", "path", path)
}

pub fn entity_hash(db: &Connection, name: &str) -> Result<Option<String>> {
    stored_hash(db, "entity_embedding_meta", "name", name)
}

/// Upserts are not supported by sqlite for virtual tables like the
/// vector table, so this inserts and falls back to an update.
fn upsert_vector(
    db: &Connection,
    table: &str,
    key_col: &str,
    key: &str,
    embedding: &[f32],
) -> Result<()> {
    let insert = format!("INSERT INTO {table} ({key_col}, embedding) VALUES (?1, ?2)");
    let update = format!("UPDATE {table} SET embedding = ?2 WHERE {key_col} = ?1");
    let inserted = db.execute(&insert, params![key, embedding.as_bytes()]);
    if inserted.is_err() {
        db.execute(&update, params![key, embedding.as_bytes()])?;
    }
    Ok(())
}

pub fn upsert_note_embedding(
    db: &Connection,
    path: &str,
    content_hash: &str,
    embedding: &[f32],
) -> Result<()> {
    upsert_vector(db, "note_vec", "path", path, embedding)?;
    db.execute(
        "INSERT INTO note_embedding_meta (path, content_hash, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET
           content_hash = excluded.content_hash, updated_at = excluded.updated_at",
        params![path, content_hash, now()],
    )?;
    Ok(())
}

pub fn upsert_entity_embedding(
    db: &Connection,
    name: &str,
    content_hash: &str,
    embedding: &[f32],
) -> Result<()> {
    upsert_vector(db, "entity_vec", "name", name, embedding)?;
    db.execute(
        "INSERT INTO entity_embedding_meta (name, content_hash, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
           content_hash = excluded.content_hash, updated_at = excluded.updated_at",
        params![name, content_hash, now()],
    )?;
    Ok(())
}

fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Load every entity vector into memory for O(entities) cosine
/// search at scoring time.
pub fn all_entity_embeddings(db: &Connection) -> Result<HashMap<String, Vec<f32>>> {
    let mut stmt = match db.prepare("SELECT name, embedding FROM entity_vec") {
        Ok(s) => s,
        // Vector table missing (no vec extension); scoring degrades.
        Err(_) => return Ok(HashMap::new()),
    };
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (name, bytes) = row?;
        map.insert(name, bytes_to_f32(&bytes));
    }
    Ok(map)
}

pub fn remove_note(db: &Connection, path: &str) -> Result<()> {
    let _ = db.execute("DELETE FROM note_vec WHERE path = ?1", params![path]);
    db.execute("DELETE FROM note_embedding_meta WHERE path = ?1", params![path])?;
    Ok(())
}

pub fn remove_entity(db: &Connection, name: &str) -> Result<()> {
    let _ = db.execute("DELETE FROM entity_vec WHERE name = ?1", params![name]);
    db.execute("DELETE FROM entity_embedding_meta WHERE name = ?1", params![name])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_entity_embedding_roundtrip() {
        let db = test_db();
        let vec: Vec<f32> = (0..384).map(|i| i as f32 / 384.0).collect();
        upsert_entity_embedding(&db, "Turbopump", "hash1", &vec).unwrap();
        let all = all_entity_embeddings(&db).unwrap();
        assert_eq!(all["Turbopump"].len(), 384);
        assert!((all["Turbopump"][383] - 383.0 / 384.0).abs() < 1e-6);
    }

    #[test]
    fn test_hash_staleness_tracking() {
        let db = test_db();
        assert_eq!(note_hash(&db, "a.md").unwrap(), None);
        let vec = vec![0.0f32; 384];
        upsert_note_embedding(&db, "a.md", "h1", &vec).unwrap();
        assert_eq!(note_hash(&db, "a.md").unwrap().as_deref(), Some("h1"));
        upsert_note_embedding(&db, "a.md", "h2", &vec).unwrap();
        assert_eq!(note_hash(&db, "a.md").unwrap().as_deref(), Some("h2"));
    }

    #[test]
    fn test_remove_entity_clears_meta() {
        let db = test_db();
        upsert_entity_embedding(&db, "X", "h", &vec![0.0f32; 384]).unwrap();
        remove_entity(&db, "X").unwrap();
        assert_eq!(entity_hash(&db, "X").unwrap(), None);
        assert!(all_entity_embeddings(&db).unwrap().is_empty());
    }
}
