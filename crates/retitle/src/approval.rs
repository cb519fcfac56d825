//! Reviewer decisions on plans parked in `awaiting_approval`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::client::{DocumentSystem, UpstreamError};
use crate::config::Settings;
use crate::db::document_repo::{self, DocumentRecord};
use crate::db::job_repo::{self, JobRow, TransitionFields};
use crate::db::{self, Database, DatabaseError};
use crate::outcome::{
    ApplyMode, OutcomeApplier, OutcomeError, PendingPlan, APPROVAL_CLAIM_KEY, PENDING_KEY,
};
use crate::status::{DocumentStatus, JobId, JobStatus};

pub const DEFAULT_DENY_REASON: &str = "denied by reviewer";

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Job {0} is not awaiting approval")]
    NotFound(JobId),

    #[error("Pending plan for job {job_id} is unusable: {reason}")]
    Corrupted { job_id: JobId, reason: String },

    #[error("Job {job_id} is being approved elsewhere (claim held until {until})")]
    InProgress { job_id: JobId, until: String },

    #[error("Document {document_id} changed since job {job_id} was planned")]
    Stale { job_id: JobId, document_id: i64 },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Outcome(#[from] OutcomeError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// A document waiting for a reviewer, with its decoded plan when readable.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub record: DocumentRecord,
    pub pending: Option<PendingPlan>,
}

#[derive(Clone)]
pub struct ApprovalGateway {
    db: Database,
    documents: Arc<dyn DocumentSystem>,
    outcome: OutcomeApplier,
}

impl ApprovalGateway {
    pub fn new(db: Database, documents: Arc<dyn DocumentSystem>) -> Self {
        let outcome = OutcomeApplier::new(db.clone(), Arc::clone(&documents));
        Self {
            db,
            documents,
            outcome,
        }
    }

    /// Applies the stored plan of an awaiting job.
    ///
    /// The job is claimed for this reviewer before anything is written to the
    /// document system; while the claim holds, other approvals and denials
    /// of the same job are refused. The document is then re-fetched. When its
    /// title moved away from the one the plan was built against, the
    /// approval is either applied with a warning or refused, depending on
    /// `reject_stale_approvals`. A failed approval releases its claim.
    pub fn approve_pending(
        &self,
        job_id: JobId,
        settings: &Settings,
    ) -> Result<JobStatus, ApprovalError> {
        let _span = info_span!("approve_pending", job_id = %job_id).entered();

        let claim = ReviewClaim::new(settings.job_timeout());
        let (job, pending) = match self.claim_pending(job_id, &claim) {
            Err(ApprovalError::Corrupted { job_id, reason }) => {
                warn!(job_id = %job_id, %reason, "pending plan corrupted");
                self.outcome
                    .mark_failure(job_id, &format!("corrupted pending plan: {reason}"))?;
                return Err(ApprovalError::Corrupted { job_id, reason });
            }
            claimed => claimed?,
        };

        let result = self.apply_claimed(&job, &pending, settings);
        if result.is_err() {
            if let Err(e) = self.release_claim(&job, &claim) {
                warn!(job_id = %job_id, error = %e, "failed to release approval claim");
            }
        }
        result
    }

    /// Rejects an awaiting job. Nothing is written to the document system.
    /// Refused with `NotFound` while an approval holds its claim.
    pub fn deny_pending(
        &self,
        job_id: JobId,
        reviewer_reason: Option<&str>,
    ) -> Result<JobStatus, ApprovalError> {
        let reason = reviewer_reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_DENY_REASON)
            .to_string();
        let now = db::now_timestamp();

        let document_id = self.db.with_tx(|tx| -> Result<i64, ApprovalError> {
            let job = match job_repo::find_by_id(tx, job_id)? {
                Some(job) if job.status == JobStatus::AwaitingApproval => job,
                _ => return Err(ApprovalError::NotFound(job_id)),
            };
            let record = document_repo::find(tx, job.document_id)?;
            if let Some(held) = record.as_ref().and_then(|r| live_claim(r, &now)) {
                debug!(job_id = %job_id, until = %held.expires_at, "approval in progress, deny refused");
                return Err(ApprovalError::NotFound(job_id));
            }
            job_repo::transition(
                tx,
                job_id,
                JobStatus::Rejected,
                &TransitionFields {
                    reason: Some(reason.clone()),
                    completed: true,
                    ..Default::default()
                },
                &now,
            )?;

            let mut record = record.unwrap_or_else(|| {
                DocumentRecord::new(job.document_id, DocumentStatus::Rejected, &now)
            });
            record.status = DocumentStatus::Rejected;
            record.ai_title = None;
            record.lock_reason = Some(reason.clone());
            record.processed_at = Some(now.clone());
            record.updated_at = now.clone();
            record.extra.remove(PENDING_KEY);
            record.extra.remove(APPROVAL_CLAIM_KEY);
            document_repo::upsert(tx, &record)?;
            Ok(job.document_id)
        })?;

        info!(job_id = %job_id, document_id, %reason, "approval denied");
        Ok(JobStatus::Rejected)
    }

    /// Documents awaiting review, oldest first, plus the total count.
    pub fn list_pending(
        &self,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<PendingApproval>, u64), ApprovalError> {
        let (records, total) = self.db.with_conn(|conn| {
            document_repo::list_by_status(conn, DocumentStatus::AwaitingApproval, limit, offset)
        })?;
        let items = records
            .into_iter()
            .map(|record| {
                let pending = record
                    .extra
                    .get(PENDING_KEY)
                    .cloned()
                    .and_then(|value| serde_json::from_value(value).ok());
                PendingApproval { record, pending }
            })
            .collect();
        Ok((items, total))
    }

    /// Takes the reviewer claim in one transaction: the job must be
    /// awaiting approval, its pending plan must decode, and no other
    /// unexpired claim may be present.
    fn claim_pending(
        &self,
        job_id: JobId,
        claim: &ReviewClaim,
    ) -> Result<(JobRow, PendingPlan), ApprovalError> {
        let now = db::now_timestamp();
        self.db.with_tx(|tx| -> Result<(JobRow, PendingPlan), ApprovalError> {
            let job = match job_repo::find_by_id(tx, job_id)? {
                Some(job) if job.status == JobStatus::AwaitingApproval => job,
                _ => return Err(ApprovalError::NotFound(job_id)),
            };
            let record = document_repo::find(tx, job.document_id)?;
            let pending = decode_pending(&job, record.as_ref())
                .map_err(|reason| ApprovalError::Corrupted { job_id, reason })?;
            let Some(mut record) = record else {
                return Err(ApprovalError::NotFound(job_id));
            };
            if let Some(held) = live_claim(&record, &now) {
                return Err(ApprovalError::InProgress {
                    job_id,
                    until: held.expires_at,
                });
            }
            record.extra.insert(APPROVAL_CLAIM_KEY.to_string(), claim.to_value());
            record.updated_at = now.clone();
            document_repo::upsert(tx, &record)?;
            Ok((job, pending))
        })
    }

    fn apply_claimed(
        &self,
        job: &JobRow,
        pending: &PendingPlan,
        settings: &Settings,
    ) -> Result<JobStatus, ApprovalError> {
        let current = self.documents.fetch(job.document_id)?;
        // A title already equal to the proposal is a retried approval, not a stale one.
        let stale = current.existing_title() != pending.plan.existing_title.as_deref()
            && current.existing_title() != pending.plan.proposed_title();
        if stale {
            if settings.reject_stale_approvals {
                return Err(ApprovalError::Stale {
                    job_id: job.id,
                    document_id: job.document_id,
                });
            }
            warn!(
                job_id = %job.id,
                document_id = job.document_id,
                "document title changed since planning, applying anyway"
            );
        }

        let status = self.outcome.apply_plan_to(
            job.id,
            &pending.plan,
            &current,
            settings,
            ApplyMode::Reviewer { stale },
        )?;
        info!(job_id = %job.id, document_id = job.document_id, "approval applied");
        Ok(status)
    }

    /// Drops the claim if it is still ours.
    fn release_claim(&self, job: &JobRow, claim: &ReviewClaim) -> Result<(), DatabaseError> {
        let now = db::now_timestamp();
        self.db.with_tx(|tx| -> Result<(), DatabaseError> {
            let Some(mut record) = document_repo::find(tx, job.document_id)? else {
                return Ok(());
            };
            let ours = ReviewClaim::decode(&record).is_some_and(|held| held.token == claim.token);
            if ours {
                record.extra.remove(APPROVAL_CLAIM_KEY);
                record.updated_at = now;
                document_repo::upsert(tx, &record)?;
            }
            Ok(())
        })
    }
}

/// Marker stored under `extra.approval_claim` while an approval runs.
/// It lapses at `expires_at` so a crashed reviewer cannot block the job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ReviewClaim {
    token: String,
    expires_at: String,
}

impl ReviewClaim {
    fn new(lease: Duration) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let token = format!(
            "{}-{}-{}",
            std::process::id(),
            db::now_timestamp(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            token,
            expires_at: db::timestamp_after(lease),
        }
    }

    fn decode(record: &DocumentRecord) -> Option<Self> {
        let value = record.extra.get(APPROVAL_CLAIM_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    fn to_value(&self) -> Value {
        json!({ "token": self.token, "expires_at": self.expires_at })
    }
}

/// The claim on `record`, unless it is missing, unreadable or expired.
fn live_claim(record: &DocumentRecord, now: &str) -> Option<ReviewClaim> {
    ReviewClaim::decode(record).filter(|claim| claim.expires_at.as_str() > now)
}

fn decode_pending(job: &JobRow, record: Option<&DocumentRecord>) -> Result<PendingPlan, String> {
    let record = record.ok_or_else(|| "document record missing".to_string())?;
    let value = record
        .extra
        .get(PENDING_KEY)
        .cloned()
        .ok_or_else(|| "no pending payload".to_string())?;
    let pending: PendingPlan =
        serde_json::from_value(value).map_err(|e| format!("undecodable payload: {e}"))?;
    if pending.job_id != job.id {
        return Err(format!("payload belongs to job {}", pending.job_id));
    }
    if pending.plan.document_id != job.document_id {
        return Err(format!("payload is for document {}", pending.plan.document_id));
    }
    if pending.plan.proposed_title().is_none() {
        return Err("payload carries no new title".to_string());
    }
    Ok(pending)
}
