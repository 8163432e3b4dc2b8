//! Stored per-note tag sets, kept for change detection between
//! batches.

use std::collections::BTreeSet;

use rusqlite::{Connection, Result, params};

pub fn tag_set(db: &Connection, path: &str) -> Result<BTreeSet<String>> {
    let mut stmt = db.prepare("SELECT tag FROM note_tags WHERE path = ?1")?;
    let rows = stmt.query_map(params![path], |r| r.get::<_, String>(0))?;
    rows.collect()
}

pub fn replace_tag_set(db: &mut Connection, path: &str, tags: &BTreeSet<String>) -> Result<()> {
    let tx = db.transaction()?;
    tx.execute("DELETE FROM note_tags WHERE path = ?1", params![path])?;
    {
        let mut stmt = tx.prepare("INSERT INTO note_tags (path, tag) VALUES (?1, ?2)")?;
        for tag in tags {
            stmt.execute(params![path, tag])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// True when this note has no stored tag row yet (first run: seed
/// without emitting a delta).
pub fn is_first_run(db: &Connection, path: &str) -> Result<bool> {
    let count: i64 = db.query_row(
        "SELECT COUNT(*) FROM note_tags WHERE path = ?1",
        params![path],
        |r| r.get(0),
    )?;
    Ok(count == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_tag_set_replacement() {
        let mut db = test_db();
        let tags: BTreeSet<String> = ["work", "urgent"].iter().map(|s| s.to_string()).collect();
        assert!(is_first_run(&db, "a.md").unwrap());
        replace_tag_set(&mut db, "a.md", &tags).unwrap();
        assert!(!is_first_run(&db, "a.md").unwrap());
        assert_eq!(tag_set(&db, "a.md").unwrap(), tags);

        let fewer: BTreeSet<String> = ["work"].iter().map(|s| s.to_string()).collect();
        replace_tag_set(&mut db, "a.md", &fewer).unwrap();
        assert_eq!(tag_set(&db, "a.md").unwrap(), fewer);
    }
}
