//! Entity co-occurrence counts, maintained incrementally per note.
//! A note's contribution is the unordered pairs of its resolved
//! entity-link set; updating a note subtracts its previous pairs and
//! adds the new ones.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use rusqlite::{Connection, Result, params};

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn pairs(entities: &HashSet<String>) -> Vec<(String, String)> {
    entities
        .iter()
        .sorted()
        .tuple_combinations()
        .map(|(a, b)| ordered(a, b))
        .collect()
}

/// Replace a note's contribution: decrement pairs from `previous`,
/// increment pairs from `current`.
pub fn update_for_note(
    db: &Connection,
    previous: &HashSet<String>,
    current: &HashSet<String>,
) -> Result<()> {
    for (a, b) in pairs(previous) {
        db.execute(
            "UPDATE cooccurrence SET count = MAX(count - 1, 0) WHERE entity_a = ?1 AND entity_b = ?2",
            params![a, b],
        )?;
    }
    db.execute("DELETE FROM cooccurrence WHERE count = 0", [])?;
    for (a, b) in pairs(current) {
        db.execute(
            "INSERT INTO cooccurrence (entity_a, entity_b, count) VALUES (?1, ?2, 1)
             ON CONFLICT(entity_a, entity_b) DO UPDATE SET count = count + 1",
            params![a, b],
        )?;
    }
    Ok(())
}

/// All co-occurring partners per entity, for the in-memory
/// suggestion index.
pub fn partners(db: &Connection) -> Result<HashMap<String, Vec<String>>> {
    let mut stmt =
        db.prepare("SELECT entity_a, entity_b FROM cooccurrence WHERE count > 0")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;

    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let (a, b) = row?;
        map.entry(a.clone()).or_default().push(b.clone());
        map.entry(b).or_default().push(a);
    }
    Ok(map)
}

pub fn remove_entity(db: &Connection, entity: &str) -> Result<()> {
    db.execute(
        "DELETE FROM cooccurrence WHERE entity_a = ?1 OR entity_b = ?1",
        params![entity],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_note_contribution_is_replaced_not_duplicated() {
        let db = test_db();
        update_for_note(&db, &HashSet::new(), &set(&["A", "B", "C"])).unwrap();
        let map = partners(&db).unwrap();
        assert_eq!(map["A"].len(), 2);

        // The note drops C; the A-C and B-C pairs must go away.
        update_for_note(&db, &set(&["A", "B", "C"]), &set(&["A", "B"])).unwrap();
        let map = partners(&db).unwrap();
        assert_eq!(map["A"], vec!["B".to_string()]);
        assert!(!map.contains_key("C"));
    }

    #[test]
    fn test_two_notes_stack_counts() {
        let db = test_db();
        update_for_note(&db, &HashSet::new(), &set(&["A", "B"])).unwrap();
        update_for_note(&db, &HashSet::new(), &set(&["A", "B"])).unwrap();
        let count: i64 = db
            .query_row(
                "SELECT count FROM cooccurrence WHERE entity_a = 'A' AND entity_b = 'B'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
