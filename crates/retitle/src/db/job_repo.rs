//! Job repository: the `processing_jobs` table.
//!
//! Every status write is conditional on the current status, using the
//! predecessor sets from [`JobStatus::predecessors`]. A write that finds the
//! row elsewhere reports why instead of overwriting it.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::DatabaseError;
use crate::status::{sql_in_list, JobId, JobSource, JobStatus};

/// A job row from the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRow {
    pub id: JobId,
    pub document_id: i64,
    pub status: JobStatus,
    pub source: JobSource,
    pub reason: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub llm_response: Option<Value>,
    pub plan_snapshot: Option<Value>,
    pub queued_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_id: row.get("document_id")?,
            status: row.get("status")?,
            source: row.get("source")?,
            reason: row.get("reason")?,
            attempt_count: row.get("attempt_count")?,
            last_error: row.get("last_error")?,
            llm_response: row.get("llm_response")?,
            plan_snapshot: row.get("plan_snapshot")?,
            queued_at: row.get("queued_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Result of trying to claim a job for a delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The job is now `running` under this attempt.
    Claimed(JobRow),
    /// Another delivery already claimed this or a later attempt.
    Duplicate(JobRow),
    /// The job has left the worker's hands (terminal or awaiting approval).
    Settled(JobRow),
    /// No such job.
    Missing,
}

/// Optional columns written alongside a status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionFields {
    pub reason: Option<String>,
    pub last_error: Option<String>,
    pub llm_response: Option<Value>,
    /// Stamp `completed_at` with the transition time.
    pub completed: bool,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub source: Option<JobSource>,
    pub document_id: Option<i64>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Oldest first instead of newest first.
    pub ascending: bool,
}

/// Inserts a new `queued` job and returns the stored row.
///
/// Fails with a constraint violation (see
/// [`DatabaseError::is_unique_violation`]) when the document already has an
/// active job.
pub fn insert_queued(
    conn: &Connection,
    document_id: i64,
    source: JobSource,
    reason: Option<&str>,
    now: &str,
) -> Result<JobRow, DatabaseError> {
    conn.execute(
        "INSERT INTO processing_jobs (document_id, status, source, reason, attempt_count,
         queued_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5, ?5)",
        params![document_id, JobStatus::Queued, source, reason, now],
    )?;
    let id = JobId(conn.last_insert_rowid());
    find_by_id(conn, id)?.ok_or(DatabaseError::JobNotFound(id))
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: JobId) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM processing_jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Returns the document's active job, if any. The unique index guarantees
/// there is at most one.
pub fn find_active_for_document(
    conn: &Connection,
    document_id: i64,
) -> Result<Option<JobRow>, DatabaseError> {
    let sql = format!(
        "SELECT * FROM processing_jobs WHERE document_id = ?1 AND status IN ({})",
        sql_in_list(&JobStatus::ACTIVE)
    );
    let row = conn
        .query_row(&sql, params![document_id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Claims a job for delivery `attempt`.
///
/// The row moves to `running` only if it is queued or running under an
/// earlier attempt, so a duplicate delivery of the same attempt never
/// double-counts.
pub fn claim(
    conn: &Connection,
    id: JobId,
    attempt: u32,
    now: &str,
) -> Result<Claim, DatabaseError> {
    let sql = format!(
        "UPDATE processing_jobs SET status = ?1, attempt_count = ?2, started_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status IN ({}) AND attempt_count < ?2",
        sql_in_list(&JobStatus::predecessors(JobStatus::Running))
    );
    let changed = conn.execute(&sql, params![JobStatus::Running, attempt, now, id])?;

    let Some(row) = find_by_id(conn, id)? else {
        return Ok(Claim::Missing);
    };
    if changed == 1 {
        return Ok(Claim::Claimed(row));
    }
    match row.status {
        JobStatus::Queued | JobStatus::Running => Ok(Claim::Duplicate(row)),
        JobStatus::AwaitingApproval
        | JobStatus::Completed
        | JobStatus::Skipped
        | JobStatus::Failed
        | JobStatus::Rejected => Ok(Claim::Settled(row)),
    }
}

/// Moves a job to `next` if its current status permits it.
///
/// Returns `Ok(true)` when the row changed and `Ok(false)` when the job is
/// already in `next`, which makes a repeated terminal write a no-op.
pub fn transition(
    conn: &Connection,
    id: JobId,
    next: JobStatus,
    fields: &TransitionFields,
    now: &str,
) -> Result<bool, DatabaseError> {
    let predecessors: Vec<JobStatus> = JobStatus::predecessors(next)
        .into_iter()
        .filter(|status| *status != next)
        .collect();

    if !predecessors.is_empty() {
        let sql = format!(
            "UPDATE processing_jobs SET
                status = ?1,
                reason = COALESCE(?2, reason),
                last_error = COALESCE(?3, last_error),
                llm_response = COALESCE(?4, llm_response),
                completed_at = CASE WHEN ?5 THEN ?6 ELSE completed_at END,
                updated_at = ?6
             WHERE id = ?7 AND status IN ({})",
            sql_in_list(&predecessors)
        );
        let changed = conn.execute(
            &sql,
            params![
                next,
                fields.reason,
                fields.last_error,
                fields.llm_response,
                fields.completed,
                now,
                id
            ],
        )?;
        if changed == 1 {
            return Ok(true);
        }
    }

    match find_by_id(conn, id)? {
        None => Err(DatabaseError::JobNotFound(id)),
        Some(row) if row.status == next => Ok(false),
        Some(row) => Err(DatabaseError::InvalidTransition {
            job_id: id,
            from: row.status,
            to: next,
        }),
    }
}

/// Records the error of a failed attempt that will be retried. Only a
/// `running` job is touched.
pub fn record_attempt_error(
    conn: &Connection,
    id: JobId,
    error: &str,
    now: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE processing_jobs SET last_error = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![error, now, id, JobStatus::Running],
    )?;
    Ok(changed == 1)
}

/// Stores the plan that is about to be applied, so a redelivery can resume
/// from it instead of asking the model again.
pub fn store_plan_snapshot(
    conn: &Connection,
    id: JobId,
    snapshot: &Value,
    now: &str,
) -> Result<bool, DatabaseError> {
    let sql = format!(
        "UPDATE processing_jobs SET plan_snapshot = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
        sql_in_list(&[JobStatus::Running, JobStatus::AwaitingApproval])
    );
    let changed = conn.execute(&sql, params![snapshot, now, id])?;
    Ok(changed == 1)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status));
    }
    if let Some(source) = filter.source {
        conditions.push(format!("source = ?{}", param_values.len() + 1));
        param_values.push(Box::new(source));
    }
    if let Some(document_id) = filter.document_id {
        conditions.push(format!("document_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(document_id));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM processing_jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let order = if filter.ascending { "ASC" } else { "DESC" };
    let query_sql = format!(
        "SELECT * FROM processing_jobs {} ORDER BY created_at {order}, id {order} LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Number of jobs per status. Statuses with no jobs are omitted.
pub fn status_counts(conn: &Connection) -> Result<BTreeMap<JobStatus, u64>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM processing_jobs GROUP BY status")?;
    let counts = stmt
        .query_map([], |r| Ok((r.get::<_, JobStatus>(0)?, r.get::<_, u64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
}

/// Number of jobs completed at or after `since`.
pub fn count_completed_since(conn: &Connection, since: &str) -> Result<u64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM processing_jobs WHERE status = ?1 AND completed_at >= ?2",
        params![JobStatus::Completed, since],
        |r| r.get(0),
    )?;
    Ok(count)
}

/// Running jobs whose latest attempt started before `older_than`.
pub fn find_stale_running(
    conn: &Connection,
    older_than: &str,
) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM processing_jobs
         WHERE status = ?1 AND COALESCE(started_at, queued_at) < ?2
         ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![JobStatus::Running, older_than], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Queued jobs admitted before `before`, oldest first.
pub fn find_queued_before(conn: &Connection, before: &str) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM processing_jobs WHERE status = ?1 AND queued_at < ?2 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![JobStatus::Queued, before], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
