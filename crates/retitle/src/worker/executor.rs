//! Execution of a single broker delivery.

use log::{debug, error, warn};
use tracing::info_span;

use std::sync::Arc;

use super::events::{JobEvent, JobEventBroadcaster, JobEventKind};
use crate::broker::{Broker, Delivery};
use crate::config::SettingsService;
use crate::db::job_repo::{self, Claim, JobRow};
use crate::db::{self, Database};
use crate::error::RetitleError;
use crate::outcome::{ApplyMode, OutcomeApplier};
use crate::plan::{Plan, PlanBuilder};
use crate::status::JobStatus;

/// Everything a worker thread needs to run jobs. Cheap to clone; each
/// worker owns its own copy.
#[derive(Clone)]
pub struct JobExecutor {
    db: Database,
    settings: SettingsService,
    planner: PlanBuilder,
    outcome: OutcomeApplier,
    broker: Arc<dyn Broker>,
    events: Option<JobEventBroadcaster>,
}

impl JobExecutor {
    pub fn new(
        db: Database,
        settings: SettingsService,
        planner: PlanBuilder,
        outcome: OutcomeApplier,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            db,
            settings,
            planner,
            outcome,
            broker,
            events: None,
        }
    }

    pub fn with_events(mut self, events: JobEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Runs one delivery to its end and settles it with the broker.
    ///
    /// Returns the event that was emitted for it.
    pub fn process_delivery(&self, delivery: Delivery) -> JobEvent {
        let message = delivery.message;
        let _span = info_span!(
            "job",
            job_id = %message.job_id,
            document_id = message.document_id,
            attempt = delivery.attempt
        )
        .entered();

        let now = db::now_timestamp();
        let claim = self
            .db
            .with_conn(|conn| job_repo::claim(conn, message.job_id, delivery.attempt, &now));

        let job = match claim {
            Ok(Claim::Claimed(job)) => job,
            Ok(Claim::Duplicate(job)) => {
                return self.ignore(&delivery, format!("attempt {} already claimed", job.attempt_count));
            }
            Ok(Claim::Settled(job)) => {
                return self.ignore(&delivery, format!("job already {}", job.status));
            }
            Ok(Claim::Missing) => {
                warn!("Job {} does not exist, dropping task", message.job_id);
                return self.ignore(&delivery, "job not found".to_string());
            }
            Err(e) => {
                // The job row was never touched, so it can be retried as is.
                error!("Failed to claim job {}: {}", message.job_id, e);
                return self.release(delivery, e.to_string());
            }
        };

        self.emit(JobEvent::new(
            job.id,
            job.document_id,
            delivery.attempt,
            JobEventKind::Started,
        ));

        match self.run(&job) {
            Ok(status) => {
                self.ack(&delivery);
                self.emit(JobEvent::new(
                    job.id,
                    job.document_id,
                    delivery.attempt,
                    JobEventKind::Finished { status },
                ))
            }
            Err(e) if e.is_retryable() && !delivery.is_last_attempt() => {
                let text = e.to_string();
                warn!(
                    "Job {} attempt {} failed, will retry: {}",
                    job.id, delivery.attempt, text
                );
                let now = db::now_timestamp();
                if let Err(db_err) = self
                    .db
                    .with_conn(|conn| job_repo::record_attempt_error(conn, job.id, &text, &now))
                {
                    error!("Failed to record attempt error for job {}: {}", job.id, db_err);
                }
                self.release(delivery, text)
            }
            Err(e) => {
                let text = e.to_string();
                if let Err(db_err) = self.outcome.mark_failure(job.id, &text) {
                    error!("Failed to mark job {} failed: {}", job.id, db_err);
                }
                self.ack(&delivery);
                self.emit(JobEvent::new(
                    job.id,
                    job.document_id,
                    delivery.attempt,
                    JobEventKind::Failed { error: text },
                ))
            }
        }
    }

    /// Resumes from the stored plan when a previous attempt got as far as
    /// applying it; otherwise plans from scratch.
    fn run(&self, job: &JobRow) -> Result<JobStatus, RetitleError> {
        let settings = self.settings.snapshot()?;

        if let Some(snapshot) = &job.plan_snapshot {
            match serde_json::from_value::<Plan>(snapshot.clone()) {
                Ok(plan) => {
                    debug!("Resuming job {} from stored plan", job.id);
                    return Ok(self
                        .outcome
                        .apply_plan(job.id, &plan, &settings, ApplyMode::Auto)?);
                }
                Err(e) => warn!("Ignoring unreadable plan snapshot of job {}: {}", job.id, e),
            }
        }

        let plan = self.planner.build_plan(job.document_id, &settings)?;
        Ok(self.outcome.apply(job, &plan, &settings)?)
    }

    fn ignore(&self, delivery: &Delivery, reason: String) -> JobEvent {
        debug!("Ignoring delivery for job {}: {}", delivery.message.job_id, reason);
        self.ack(delivery);
        self.emit(JobEvent::new(
            delivery.message.job_id,
            delivery.message.document_id,
            delivery.attempt,
            JobEventKind::Ignored { reason },
        ))
    }

    /// Hands the delivery back for a later attempt.
    fn release(&self, delivery: Delivery, error: String) -> JobEvent {
        let message = delivery.message;
        let attempt = delivery.attempt;
        match self.broker.nack(delivery) {
            Ok(true) => {}
            Ok(false) => warn!("Task for job {} was not rescheduled", message.job_id),
            Err(e) => error!("Failed to nack job {}: {}", message.job_id, e),
        }
        self.emit(JobEvent::new(
            message.job_id,
            message.document_id,
            attempt,
            JobEventKind::Retrying { error },
        ))
    }

    fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery) {
            error!("Failed to ack job {}: {}", delivery.message.job_id, e);
        }
    }

    fn emit(&self, event: JobEvent) -> JobEvent {
        if let Some(events) = &self.events {
            events.send(event.clone());
        }
        event
    }
}
