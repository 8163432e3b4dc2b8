//! Canonical entity rows.

use rusqlite::{Connection, Result, params};

use crate::entity::{Category, Entity};
use crate::store::now;

pub fn upsert(db: &Connection, entity: &Entity) -> Result<()> {
    let aliases = serde_json::to_string(&entity.aliases).unwrap_or_else(|_| "[]".to_string());
    db.execute(
        "INSERT INTO entities (name, name_lower, path, category, aliases, hub_score, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name) DO UPDATE SET
           name_lower = excluded.name_lower,
           path = excluded.path,
           category = excluded.category,
           aliases = excluded.aliases,
           hub_score = excluded.hub_score,
           updated_at = excluded.updated_at",
        params![
            entity.name,
            entity.name_lower,
            entity.path,
            entity.category.as_str(),
            aliases,
            entity.hub_score,
            now(),
        ],
    )?;
    Ok(())
}

pub fn remove(db: &Connection, name: &str) -> Result<()> {
    db.execute("DELETE FROM entities WHERE name = ?1", params![name])?;
    Ok(())
}

pub fn set_hub_score(db: &Connection, name: &str, hub_score: u32) -> Result<()> {
    db.execute(
        "UPDATE entities SET hub_score = ?2, updated_at = ?3 WHERE name = ?1",
        params![name, hub_score, now()],
    )?;
    Ok(())
}

pub fn all(db: &Connection) -> Result<Vec<Entity>> {
    let mut stmt = db.prepare(
        "SELECT name, name_lower, path, category, aliases, hub_score FROM entities",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, u32>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (name, name_lower, path, category_str, aliases_json, hub_score) = row?;
        // The column only ever stores canonical category names; a
        // value that no longer parses is corruption in a rebuildable
        // table. Drop the row rather than misfile it.
        let Some(category) = Category::parse(&category_str) else {
            tracing::warn!(
                "Dropping entity row {:?} with corrupt category {:?}",
                name,
                category_str
            );
            continue;
        };
        out.push(Entity {
            name,
            name_lower,
            path,
            category,
            aliases: serde_json::from_str(&aliases_json).unwrap_or_default(),
            hub_score,
        });
    }
    Ok(out)
}

/// Rewrite the backing path when a note is renamed.
pub fn rename_path(db: &Connection, from: &str, to: &str) -> Result<usize> {
    db.execute(
        "UPDATE entities SET path = ?2, updated_at = ?3 WHERE path = ?1",
        params![from, to, now()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn sample() -> Entity {
        Entity {
            name: "Turbopump".to_string(),
            name_lower: "turbopump".to_string(),
            path: "projects/Turbopump.md".to_string(),
            category: Category::Projects,
            aliases: vec!["The Pump".to_string()],
            hub_score: 3,
        }
    }

    #[test]
    fn test_upsert_then_read_back() {
        let db = test_db();
        upsert(&db, &sample()).unwrap();
        let all = all(&db).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Turbopump");
        assert_eq!(all[0].category, Category::Projects);
        assert_eq!(all[0].aliases, vec!["The Pump"]);
    }

    #[test]
    fn test_upsert_twice_updates_in_place() {
        let db = test_db();
        upsert(&db, &sample()).unwrap();
        let mut changed = sample();
        changed.hub_score = 9;
        upsert(&db, &changed).unwrap();
        let all = all(&db).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hub_score, 9);
    }

    #[test]
    fn test_corrupt_category_rows_are_dropped() {
        let db = test_db();
        upsert(&db, &sample()).unwrap();
        db.execute(
            "UPDATE entities SET category = 'martian' WHERE name = 'Turbopump'",
            [],
        )
        .unwrap();
        assert!(all(&db).unwrap().is_empty());
    }

    #[test]
    fn test_rename_path_rewrites_backing_note() {
        let db = test_db();
        upsert(&db, &sample()).unwrap();
        let n = rename_path(&db, "projects/Turbopump.md", "archive/Turbopump.md").unwrap();
        assert_eq!(n, 1);
        assert_eq!(all(&db).unwrap()[0].path, "archive/Turbopump.md");
    }
}
