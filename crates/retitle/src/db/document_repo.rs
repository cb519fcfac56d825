//! Document record repository: the `documents` table.
//!
//! One row per document, holding the latest processing outcome. Writers
//! read the current row, merge their changes and upsert it back inside the
//! same transaction as the job transition.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};

use super::DatabaseError;
use crate::status::DocumentStatus;

/// Current-state record of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub document_id: i64,
    pub status: DocumentStatus,
    pub original_title: Option<String>,
    pub ai_title: Option<String>,
    pub confidence: Option<f64>,
    pub lock_reason: Option<String>,
    pub last_error: Option<String>,
    pub processed_at: Option<String>,
    /// Free-form metadata: tag slugs, correspondent, the pending plan.
    pub extra: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRecord {
    /// A fresh record with no history.
    pub fn new(document_id: i64, status: DocumentStatus, now: &str) -> Self {
        Self {
            document_id,
            status,
            original_title: None,
            ai_title: None,
            confidence: None,
            lock_reason: None,
            last_error: None,
            processed_at: None,
            extra: Map::new(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let extra = match row.get::<_, Value>("extra")? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            document_id: row.get("document_id")?,
            status: row.get("status")?,
            original_title: row.get("original_title")?,
            ai_title: row.get("ai_title")?,
            confidence: row.get("confidence")?,
            lock_reason: row.get("lock_reason")?,
            last_error: row.get("last_error")?,
            processed_at: row.get("processed_at")?,
            extra,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Finds the record for a document.
pub fn find(conn: &Connection, document_id: i64) -> Result<Option<DocumentRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM documents WHERE document_id = ?1",
            params![document_id],
            DocumentRecord::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Inserts or replaces the record. `created_at` of an existing row is kept.
pub fn upsert(conn: &Connection, record: &DocumentRecord) -> Result<(), DatabaseError> {
    let extra = serde_json::to_string(&record.extra)?;
    conn.execute(
        "INSERT INTO documents (document_id, status, original_title, ai_title, confidence,
         lock_reason, last_error, processed_at, extra, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(document_id) DO UPDATE SET
            status = excluded.status,
            original_title = excluded.original_title,
            ai_title = excluded.ai_title,
            confidence = excluded.confidence,
            lock_reason = excluded.lock_reason,
            last_error = excluded.last_error,
            processed_at = excluded.processed_at,
            extra = excluded.extra,
            updated_at = excluded.updated_at",
        params![
            record.document_id,
            record.status,
            record.original_title,
            record.ai_title,
            record.confidence,
            record.lock_reason,
            record.last_error,
            record.processed_at,
            extra,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

/// Records with the given status, oldest update first, plus the total.
pub fn list_by_status(
    conn: &Connection,
    status: DocumentStatus,
    limit: u64,
    offset: u64,
) -> Result<(Vec<DocumentRecord>, u64), DatabaseError> {
    let total: u64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE status = ?1",
        params![status],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT * FROM documents WHERE status = ?1
         ORDER BY updated_at ASC, document_id ASC LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(
            params![status, limit as i64, offset as i64],
            DocumentRecord::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((rows, total))
}

/// Number of records per status.
pub fn count_by_status(
    conn: &Connection,
) -> Result<BTreeMap<DocumentStatus, u64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")?;
    let counts = stmt
        .query_map([], |r| {
            Ok((r.get::<_, DocumentStatus>(0)?, r.get::<_, u64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    const T0: &str = "2026-01-01T00:00:00.000Z";
    const T1: &str = "2026-01-01T00:01:00.000Z";

    #[test]
    fn test_upsert_insert_then_update() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let mut record = DocumentRecord::new(9, DocumentStatus::AwaitingApproval, T0);
            record.extra.insert("pending".into(), json!({"job_id": 1}));
            upsert(conn, &record)?;

            let stored = find(conn, 9)?.unwrap();
            assert_eq!(stored, record);

            record.status = DocumentStatus::Completed;
            record.ai_title = Some("Invoice 2024".into());
            record.confidence = Some(0.8);
            record.extra.remove("pending");
            record.created_at = T1.to_string();
            record.updated_at = T1.to_string();
            upsert(conn, &record)?;

            let stored = find(conn, 9)?.unwrap();
            assert_eq!(stored.status, DocumentStatus::Completed);
            assert_eq!(stored.ai_title.as_deref(), Some("Invoice 2024"));
            assert!(stored.extra.get("pending").is_none());
            assert_eq!(stored.created_at, T0);
            assert_eq!(stored.updated_at, T1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_find_missing() {
        let db = Database::open_in_memory().unwrap();
        let found = db.with_conn(|conn| find(conn, 1)).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_listing_and_counts() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert(conn, &DocumentRecord::new(1, DocumentStatus::Completed, T0))?;
            upsert(conn, &DocumentRecord::new(2, DocumentStatus::AwaitingApproval, T0))?;
            upsert(conn, &DocumentRecord::new(3, DocumentStatus::AwaitingApproval, T1))?;

            let (rows, total) = list_by_status(conn, DocumentStatus::AwaitingApproval, 1, 0)?;
            assert_eq!(total, 2);
            assert_eq!(rows[0].document_id, 2);

            let counts = count_by_status(conn)?;
            assert_eq!(counts[&DocumentStatus::AwaitingApproval], 2);
            Ok(())
        })
        .unwrap();
    }
}
