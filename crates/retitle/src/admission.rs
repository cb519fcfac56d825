//! Job admission: the only place `processing_jobs` rows are created.
//!
//! The one-active-job-per-document rule is enforced by a partial unique
//! index, checked inside an IMMEDIATE transaction so concurrent producers
//! (scanner, hooks, CLI, other processes) cannot both win.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use thiserror::Error;

use crate::broker::{Broker, BrokerError, TaskMessage, TaskOptions};
use crate::config::SettingsService;
use crate::db::job_repo::{self, TransitionFields};
use crate::db::{self, document_repo, Database, DatabaseError};
use crate::error::ConfigError;
use crate::status::{DocumentStatus, JobId, JobSource, JobStatus};

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Document {document_id} already has active job {active_job}")]
    Conflict { document_id: i64, active_job: JobId },

    #[error("Document {document_id} is already {status}")]
    AlreadyFinalized {
        document_id: i64,
        status: DocumentStatus,
    },

    #[error("Failed to queue job {job_id}: {source}")]
    Broker {
        job_id: JobId,
        #[source]
        source: BrokerError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Settings error: {0}")]
    Config(#[from] ConfigError),
}

impl AdmissionError {
    /// Refusals that leave nothing to do, as opposed to failures.
    pub fn is_noop(&self) -> bool {
        match self {
            AdmissionError::Conflict { .. } | AdmissionError::AlreadyFinalized { .. } => true,
            AdmissionError::Broker { .. }
            | AdmissionError::Database(_)
            | AdmissionError::Config(_) => false,
        }
    }
}

/// Per-call overrides of the task policy taken from settings.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub backoff: Option<Vec<Duration>>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedDocument {
    pub document_id: i64,
    pub reason: String,
}

/// Result of a bulk enqueue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnqueueSummary {
    pub queued: Vec<(i64, JobId)>,
    pub skipped: Vec<SkippedDocument>,
}

#[derive(Clone)]
pub struct Admission {
    db: Database,
    broker: Arc<dyn Broker>,
    settings: SettingsService,
}

impl Admission {
    pub fn new(db: Database, broker: Arc<dyn Broker>, settings: SettingsService) -> Self {
        Self {
            db,
            broker,
            settings,
        }
    }

    /// Creates a `queued` job for the document and hands it to the broker.
    ///
    /// Passive sources do nothing for documents whose record is finalized.
    /// If the broker refuses the task, the new job is marked `failed` so it
    /// does not sit in `queued` forever.
    pub fn enqueue_document(
        &self,
        document_id: i64,
        source: JobSource,
        reason: Option<&str>,
        options: &EnqueueOptions,
    ) -> Result<JobId, AdmissionError> {
        let settings = self.settings.snapshot()?;
        let now = db::now_timestamp();

        let job = self.db.with_tx(|tx| -> Result<_, AdmissionError> {
            if source.is_passive() {
                if let Some(record) = document_repo::find(tx, document_id)? {
                    if record.status.is_finalized() {
                        return Err(AdmissionError::AlreadyFinalized {
                            document_id,
                            status: record.status,
                        });
                    }
                }
            }

            if let Some(active) = job_repo::find_active_for_document(tx, document_id)? {
                return Err(AdmissionError::Conflict {
                    document_id,
                    active_job: active.id,
                });
            }

            match job_repo::insert_queued(tx, document_id, source, reason, &now) {
                Ok(job) => Ok(job),
                Err(e) if e.is_unique_violation() => {
                    let active = job_repo::find_active_for_document(tx, document_id)?;
                    Err(AdmissionError::Conflict {
                        document_id,
                        active_job: active.map(|job| job.id).unwrap_or(JobId(0)),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })?;

        let mut task_options = TaskOptions::from_settings(&settings);
        if let Some(backoff) = &options.backoff {
            task_options.backoff = backoff.clone();
        }
        if let Some(timeout) = options.timeout {
            task_options.timeout = timeout;
        }

        let message = TaskMessage {
            job_id: job.id,
            document_id,
        };
        if let Err(e) = self.broker.push(message, task_options) {
            error!("Failed to queue job {} for document {}: {}", job.id, document_id, e);
            self.fail_unqueued(job.id, &e);
            return Err(AdmissionError::Broker {
                job_id: job.id,
                source: e,
            });
        }

        info!(
            "Queued job {} for document {} (source: {})",
            job.id, document_id, source
        );
        Ok(job.id)
    }

    /// Enqueues several documents, collecting refusals instead of stopping
    /// at the first one. Duplicate ids are enqueued once.
    pub fn enqueue_many(
        &self,
        document_ids: &[i64],
        source: JobSource,
        reason: Option<&str>,
    ) -> Result<EnqueueSummary, AdmissionError> {
        let mut summary = EnqueueSummary::default();
        let unique: BTreeSet<i64> = document_ids.iter().copied().collect();

        for document_id in unique {
            match self.enqueue_document(document_id, source, reason, &EnqueueOptions::default()) {
                Ok(job_id) => summary.queued.push((document_id, job_id)),
                Err(e) if e.is_noop() => {
                    debug!("Not enqueuing document {}: {}", document_id, e);
                    summary.skipped.push(SkippedDocument {
                        document_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Enqueued {} documents, skipped {}",
            summary.queued.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }

    fn fail_unqueued(&self, job_id: JobId, cause: &BrokerError) {
        let now = db::now_timestamp();
        let fields = TransitionFields {
            reason: Some("broker push failed".to_string()),
            last_error: Some(cause.to_string()),
            completed: true,
            ..Default::default()
        };
        if let Err(e) = self
            .db
            .with_conn(|conn| job_repo::transition(conn, job_id, JobStatus::Failed, &fields, &now))
        {
            error!("Failed to mark unqueued job {} failed: {}", job_id, e);
        }
    }
}
