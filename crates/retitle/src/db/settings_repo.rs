//! Key/value overrides for runtime settings.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};

use super::DatabaseError;

/// All stored overrides, keyed by dotted setting name.
pub fn list(conn: &Connection) -> Result<BTreeMap<String, String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

pub fn save(conn: &Connection, key: &str, value: &str, now: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    Ok(())
}

/// Removes an override. Returns whether one existed.
pub fn delete(conn: &Connection, key: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
    Ok(changed == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_save_list_delete() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            save(conn, "llm.model", "gpt-4o-mini", "t0")?;
            save(conn, "auto_apply_titles", "false", "t0")?;
            save(conn, "llm.model", "llama3", "t1")?;

            let all = list(conn)?;
            assert_eq!(all.get("llm.model").map(String::as_str), Some("llama3"));
            assert_eq!(all.len(), 2);
            assert_eq!(all.keys().next().map(String::as_str), Some("auto_apply_titles"));

            assert!(delete(conn, "llm.model")?);
            assert!(!delete(conn, "llm.model")?);
            assert!(!list(conn)?.contains_key("llm.model"));
            Ok(())
        })
        .unwrap();
    }
}
