//! Outcome application: turn a plan into durable state and, for accepted
//! titles, into writes against the document system.
//!
//! Every branch is safe to repeat for the same job. External writes are
//! checked against the current document before they are made, and the job
//! and record rows change together in one transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::client::{Document, DocumentSystem, UpstreamError};
use crate::config::Settings;
use crate::db::document_repo::{self, DocumentRecord};
use crate::db::job_repo::{self, JobRow, TransitionFields};
use crate::db::{self, Database, DatabaseError};
use crate::plan::{Plan, PlanDecision};
use crate::status::{DocumentStatus, JobId, JobStatus};

/// Written to the original-title field when the document had no title.
pub const EMPTY_TITLE_PLACEHOLDER: &str = "[empty before AI]";

/// Key of the pending plan inside `DocumentRecord::extra`.
pub const PENDING_KEY: &str = "pending";

/// Key of the reviewer claim held while an approval writes to the document system.
pub const APPROVAL_CLAIM_KEY: &str = "approval_claim";

const FAILURE_REASON_CHARS: usize = 240;

/// Plan awaiting a reviewer, stored under `extra.pending`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPlan {
    pub job_id: JobId,
    pub plan: Plan,
    pub created_at: String,
}

/// Who triggered an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Auto,
    /// Approved by a reviewer; `stale` when the document changed since planning.
    Reviewer { stale: bool },
}

impl ApplyMode {
    fn label(self) -> &'static str {
        match self {
            ApplyMode::Auto => "auto",
            ApplyMode::Reviewer { .. } => "reviewer",
        }
    }
}

#[derive(Error, Debug)]
pub enum OutcomeError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to encode plan: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Plan for document {0} carries no new title")]
    NoTitle(i64),
}

impl OutcomeError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OutcomeError::Upstream(e) => e.is_retryable(),
            OutcomeError::Database(e) => e.is_busy(),
            OutcomeError::Encode(_) | OutcomeError::NoTitle(_) => false,
        }
    }
}

/// Confidence at or above the threshold counts; a missing confidence counts too.
pub fn meets_threshold(confidence: Option<f64>, threshold: f64) -> bool {
    confidence.map_or(true, |c| c >= threshold)
}

/// First line of an error, at most 240 characters.
pub fn failure_reason(error: &str) -> String {
    let first_line = error.trim().lines().next().unwrap_or_default().trim();
    if first_line.is_empty() {
        return "error".to_string();
    }
    if first_line.chars().count() > FAILURE_REASON_CHARS {
        let head: String = first_line.chars().take(FAILURE_REASON_CHARS - 3).collect();
        return format!("{head}...");
    }
    first_line.to_string()
}

#[derive(Clone)]
pub struct OutcomeApplier {
    db: Database,
    documents: Arc<dyn DocumentSystem>,
}

impl OutcomeApplier {
    pub fn new(db: Database, documents: Arc<dyn DocumentSystem>) -> Self {
        Self { db, documents }
    }

    /// Routes a freshly built plan. Returns the status the job ended in.
    pub fn apply(
        &self,
        job: &JobRow,
        plan: &Plan,
        settings: &Settings,
    ) -> Result<JobStatus, OutcomeError> {
        match &plan.decision {
            PlanDecision::Ineligible { reason } | PlanDecision::NoChangeNeeded { reason } => {
                self.mark_skipped(job.id, plan, reason)
            }
            PlanDecision::NewTitle { confidence, .. } => {
                let threshold = settings.llm.confidence_threshold;
                let confident = meets_threshold(*confidence, threshold);
                if confident && settings.auto_apply_titles {
                    return self.apply_plan(job.id, plan, settings, ApplyMode::Auto);
                }
                let reason = match confidence {
                    Some(c) if !confident => {
                        debug!(
                            document_id = plan.document_id,
                            "confidence {:.3} below threshold {:.3}, routing to approval", c, threshold
                        );
                        format!(
                            "{} (confidence {:.2} < threshold {:.2})",
                            plan.reason(),
                            c,
                            threshold
                        )
                    }
                    _ => plan.reason().to_string(),
                };
                self.store_pending_plan(job.id, plan, &reason)
            }
        }
    }

    /// Writes the new title. The plan is first persisted as the job's
    /// snapshot so a redelivery after a crash resumes with the same plan.
    pub fn apply_plan(
        &self,
        job_id: JobId,
        plan: &Plan,
        settings: &Settings,
        mode: ApplyMode,
    ) -> Result<JobStatus, OutcomeError> {
        let _span = info_span!("apply_plan", job_id = %job_id, document_id = plan.document_id)
            .entered();

        let snapshot = serde_json::to_value(plan)?;
        let now = db::now_timestamp();
        self.db
            .with_conn(|conn| job_repo::store_plan_snapshot(conn, job_id, &snapshot, &now))?;

        let current = {
            let _step = info_span!("fetch_document").entered();
            self.documents.fetch(plan.document_id)?
        };
        self.apply_plan_to(job_id, plan, &current, settings, mode)
    }

    /// Same as [`apply_plan`](Self::apply_plan) against an already fetched
    /// document. Each external write is skipped when the document already
    /// shows it.
    pub fn apply_plan_to(
        &self,
        job_id: JobId,
        plan: &Plan,
        current: &Document,
        settings: &Settings,
        mode: ApplyMode,
    ) -> Result<JobStatus, OutcomeError> {
        let document_id = plan.document_id;
        let title = plan.proposed_title().ok_or(OutcomeError::NoTitle(document_id))?;

        if let Some(field) = settings.original_title_field() {
            let _step = info_span!("store_original_title").entered();
            if current.custom_field(field).is_some() {
                debug!(document_id, field, "original title field already set");
            } else {
                let value = plan
                    .existing_title
                    .as_deref()
                    .unwrap_or(EMPTY_TITLE_PLACEHOLDER);
                self.documents.set_custom_field(document_id, field, value)?;
            }
        }

        {
            let _step = info_span!("update_title").entered();
            if current.existing_title() == Some(title) {
                debug!(document_id, "title already applied");
            } else {
                self.documents.update_title(document_id, title)?;
            }
        }

        let now = db::now_timestamp();
        let _step = info_span!("record_completion").entered();
        self.db.with_tx(|tx| -> Result<(), OutcomeError> {
            job_repo::transition(
                tx,
                job_id,
                JobStatus::Completed,
                &TransitionFields {
                    reason: Some(plan.reason().to_string()),
                    llm_response: plan.raw_response.clone(),
                    completed: true,
                    ..Default::default()
                },
                &now,
            )?;

            let mut record = load_record(tx, document_id, &now)?;
            record.status = DocumentStatus::Completed;
            if record.original_title.is_none() {
                record.original_title =
                    Some(plan.existing_title.clone().unwrap_or_else(|| title.to_string()));
            }
            record.ai_title = Some(title.to_string());
            record.confidence = plan.confidence();
            record.lock_reason = None;
            record.last_error = None;
            record.processed_at = Some(now.clone());
            record.updated_at = now.clone();
            apply_metadata(&mut record.extra, plan, None);
            record
                .extra
                .insert("applied_by".to_string(), json!(mode.label()));
            record.extra.insert("job_id".to_string(), json!(job_id));
            match mode {
                ApplyMode::Reviewer { stale: true } => {
                    record.extra.insert("stale_on_approval".to_string(), json!(true));
                }
                ApplyMode::Reviewer { stale: false } | ApplyMode::Auto => {
                    record.extra.remove("stale_on_approval");
                }
            }
            document_repo::upsert(tx, &record)?;
            Ok(())
        })?;

        info!(job_id = %job_id, document_id, title, "title applied");
        Ok(JobStatus::Completed)
    }

    /// Parks a plan for review. Nothing is written to the document system.
    pub fn store_pending_plan(
        &self,
        job_id: JobId,
        plan: &Plan,
        reason: &str,
    ) -> Result<JobStatus, OutcomeError> {
        let document_id = plan.document_id;
        let title = plan.proposed_title().ok_or(OutcomeError::NoTitle(document_id))?;
        let now = db::now_timestamp();
        let pending = serde_json::to_value(PendingPlan {
            job_id,
            plan: plan.clone(),
            created_at: now.clone(),
        })?;

        self.db.with_tx(|tx| -> Result<(), OutcomeError> {
            job_repo::transition(
                tx,
                job_id,
                JobStatus::AwaitingApproval,
                &TransitionFields {
                    reason: Some(reason.to_string()),
                    llm_response: plan.raw_response.clone(),
                    ..Default::default()
                },
                &now,
            )?;

            let mut record = load_record(tx, document_id, &now)?;
            record.status = DocumentStatus::AwaitingApproval;
            if record.original_title.is_none() {
                record.original_title =
                    Some(plan.existing_title.clone().unwrap_or_else(|| title.to_string()));
            }
            record.ai_title = None;
            record.confidence = plan.confidence();
            record.lock_reason = Some(reason.to_string());
            record.last_error = None;
            record.processed_at = None;
            record.updated_at = now.clone();
            apply_metadata(&mut record.extra, plan, Some(pending));
            document_repo::upsert(tx, &record)?;
            Ok(())
        })?;

        info!(job_id = %job_id, document_id, "plan awaiting approval");
        Ok(JobStatus::AwaitingApproval)
    }

    /// Closes a job whose plan needs no external change.
    pub fn mark_skipped(
        &self,
        job_id: JobId,
        plan: &Plan,
        reason: &str,
    ) -> Result<JobStatus, OutcomeError> {
        let document_id = plan.document_id;
        let now = db::now_timestamp();

        self.db.with_tx(|tx| -> Result<(), OutcomeError> {
            job_repo::transition(
                tx,
                job_id,
                JobStatus::Skipped,
                &TransitionFields {
                    reason: Some(reason.to_string()),
                    llm_response: plan.raw_response.clone(),
                    completed: true,
                    ..Default::default()
                },
                &now,
            )?;

            let mut record = load_record(tx, document_id, &now)?;
            record.status = DocumentStatus::Skipped;
            record.lock_reason = Some(reason.to_string());
            record.processed_at = Some(now.clone());
            record.updated_at = now.clone();
            apply_metadata(&mut record.extra, plan, None);
            document_repo::upsert(tx, &record)?;
            Ok(())
        })?;

        info!(job_id = %job_id, document_id, reason, "job skipped");
        Ok(JobStatus::Skipped)
    }

    /// Marks a job failed. The document record is left as it was.
    ///
    /// Returns `Ok(false)` when the job had already settled elsewhere, which
    /// is logged rather than raised so a late failure never rewrites history.
    pub fn mark_failure(&self, job_id: JobId, error: &str) -> Result<bool, DatabaseError> {
        let now = db::now_timestamp();
        let fields = TransitionFields {
            reason: Some(failure_reason(error)),
            last_error: Some(error.to_string()),
            completed: true,
            ..Default::default()
        };
        let result = self
            .db
            .with_conn(|conn| job_repo::transition(conn, job_id, JobStatus::Failed, &fields, &now));
        match result {
            Ok(changed) => {
                if changed {
                    warn!(job_id = %job_id, error, "job failed");
                }
                Ok(changed)
            }
            Err(DatabaseError::InvalidTransition { from, .. }) => {
                warn!(
                    job_id = %job_id,
                    status = %from,
                    error,
                    "job already settled, failure not recorded"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn load_record(
    conn: &rusqlite::Connection,
    document_id: i64,
    now: &str,
) -> Result<DocumentRecord, DatabaseError> {
    Ok(document_repo::find(conn, document_id)?
        .unwrap_or_else(|| DocumentRecord::new(document_id, DocumentStatus::Skipped, now)))
}

/// Records the planning-time metadata and sets or clears the pending plan.
/// Any reviewer claim on the old pending plan is dropped.
fn apply_metadata(extra: &mut Map<String, Value>, plan: &Plan, pending: Option<Value>) {
    extra.remove(APPROVAL_CLAIM_KEY);
    extra.insert("tags".to_string(), json!(plan.tags));
    extra.insert("correspondent".to_string(), json!(plan.correspondent));
    match pending {
        Some(pending) => {
            extra.insert(PENDING_KEY.to_string(), pending);
        }
        None => {
            extra.remove(PENDING_KEY);
        }
    }
}
