//! Recovery passes for jobs the queue lost track of.
//!
//! `fail_stale` closes `running` jobs no worker will ever finish (their
//! last delivery was dropped after its lease expired). `requeue_orphaned`
//! pushes `queued` jobs the broker does not hold, e.g. rows admitted by
//! another process or left behind by a flushed broker.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::broker::{Broker, BrokerError, TaskMessage, TaskOptions};
use crate::config::Settings;
use crate::db::job_repo::{self, JobRow, TransitionFields};
use crate::db::{self, Database, DatabaseError};
use crate::status::{JobId, JobStatus};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub failed: Vec<JobId>,
    pub requeued: Vec<JobId>,
}

/// Running jobs whose latest attempt started more than `older_than` ago.
pub fn find_stale_running(db: &Database, older_than: Duration) -> Result<Vec<JobRow>, DatabaseError> {
    let cutoff = db::timestamp_before(older_than);
    db.with_conn(|conn| job_repo::find_stale_running(conn, &cutoff))
}

/// Marks stale running jobs `failed`. Jobs that settle concurrently are left alone.
pub fn fail_stale(db: &Database, older_than: Duration) -> Result<Vec<JobId>, DatabaseError> {
    let stale = find_stale_running(db, older_than)?;
    let message = format!(
        "stale: no terminal status after {}s",
        older_than.as_secs()
    );
    let mut failed = Vec::new();

    for job in stale {
        let now = db::now_timestamp();
        let fields = TransitionFields {
            reason: Some(message.clone()),
            last_error: Some(message.clone()),
            completed: true,
            ..Default::default()
        };
        match db.with_conn(|conn| job_repo::transition(conn, job.id, JobStatus::Failed, &fields, &now)) {
            Ok(true) => {
                log::warn!("Job {} for document {} marked failed: {}", job.id, job.document_id, message);
                failed.push(job.id);
            }
            Ok(false) => {}
            Err(DatabaseError::InvalidTransition { from, .. }) => {
                log::debug!("Job {} settled as {} before it could be failed", job.id, from);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}

/// Pushes queued jobs older than `min_age` that the broker does not hold.
pub fn requeue_orphaned(
    db: &Database,
    broker: &dyn Broker,
    options: &TaskOptions,
    min_age: Duration,
) -> Result<Vec<JobId>, crate::error::RetitleError> {
    let cutoff = db::timestamp_before(min_age);
    let queued = db.with_conn(|conn| job_repo::find_queued_before(conn, &cutoff))?;
    let mut requeued = Vec::new();

    for job in queued {
        if broker.holds(job.id) {
            continue;
        }
        let message = TaskMessage {
            job_id: job.id,
            document_id: job.document_id,
        };
        match broker.push(message, options.clone()) {
            Ok(()) => {
                log::info!("Requeued orphaned job {} for document {}", job.id, job.document_id);
                requeued.push(job.id);
            }
            Err(BrokerError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(requeued)
}

/// Age after which a running job can no longer be finished by any delivery:
/// every attempt's lease plus every backoff delay, doubled.
pub fn stale_after(settings: &Settings) -> Duration {
    let options = TaskOptions::from_settings(settings);
    let leases = options.timeout * options.max_attempts();
    let backoff: Duration = options.backoff.iter().sum();
    (leases + backoff) * 2
}

/// Runs both passes once.
pub fn sweep(
    db: &Database,
    broker: &dyn Broker,
    settings: &Settings,
    orphan_min_age: Duration,
) -> Result<SweepResult, crate::error::RetitleError> {
    let failed = fail_stale(db, stale_after(settings))?;
    let options = TaskOptions::from_settings(settings);
    let requeued = requeue_orphaned(db, broker, &options, orphan_min_age)?;
    Ok(SweepResult { failed, requeued })
}

/// Background thread running [`sweep`] on a fixed interval.
pub struct SweepScheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl SweepScheduler {
    pub fn start(
        db: Database,
        broker: Arc<dyn Broker>,
        settings: crate::config::SettingsService,
        interval: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let snapshot = match settings.snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("Sweep skipped, settings unavailable: {}", e);
                    continue;
                }
            };
            match sweep(&db, broker.as_ref(), &snapshot, interval) {
                Ok(result) if !result.failed.is_empty() || !result.requeued.is_empty() => {
                    log::info!(
                        "Sweep: {} stale jobs failed, {} orphaned jobs requeued",
                        result.failed.len(),
                        result.requeued.len()
                    );
                }
                Ok(_) => {}
                Err(e) => log::error!("Sweep failed: {}", e),
            }
        });

        Self { stop_tx, handle }
    }

    /// Signals the thread and waits for it.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            log::error!("Sweep thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::status::JobSource;

    const LONG_AGO: &str = "2020-01-01T00:00:00.000Z";

    fn options() -> TaskOptions {
        TaskOptions {
            backoff: vec![],
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_fail_stale_marks_old_running_jobs() {
        let db = Database::open_in_memory().unwrap();
        let (old, fresh) = db
            .with_conn(|conn| {
                let old = job_repo::insert_queued(conn, 1, JobSource::Scanner, None, LONG_AGO)?;
                job_repo::claim(conn, old.id, 1, LONG_AGO)?;
                let fresh =
                    job_repo::insert_queued(conn, 2, JobSource::Scanner, None, &db::now_timestamp())?;
                job_repo::claim(conn, fresh.id, 1, &db::now_timestamp())?;
                Ok((old, fresh))
            })
            .unwrap();

        let failed = fail_stale(&db, Duration::from_secs(3600)).unwrap();
        assert_eq!(failed, vec![old.id]);

        let row = db
            .with_conn(|conn| job_repo::find_by_id(conn, old.id))
            .unwrap()
            .unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("stale: no terminal status after 3600s"));
        assert!(row.completed_at.is_some());

        let fresh = db
            .with_conn(|conn| job_repo::find_by_id(conn, fresh.id))
            .unwrap()
            .unwrap();
        assert_eq!(fresh.status, JobStatus::Running);
    }

    #[test]
    fn test_requeue_orphaned_skips_held_jobs() {
        let db = Database::open_in_memory().unwrap();
        let broker = MemoryBroker::new();
        let (orphan, held) = db
            .with_conn(|conn| {
                let orphan = job_repo::insert_queued(conn, 1, JobSource::Hook, None, LONG_AGO)?;
                let held = job_repo::insert_queued(conn, 2, JobSource::Hook, None, LONG_AGO)?;
                Ok((orphan, held))
            })
            .unwrap();
        broker
            .push(
                TaskMessage {
                    job_id: held.id,
                    document_id: 2,
                },
                options(),
            )
            .unwrap();

        let requeued = requeue_orphaned(&db, &broker, &options(), Duration::from_secs(60)).unwrap();
        assert_eq!(requeued, vec![orphan.id]);
        assert!(broker.holds(orphan.id));
        assert_eq!(broker.len(), 2);

        let again = requeue_orphaned(&db, &broker, &options(), Duration::from_secs(60)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_stale_after_covers_every_attempt() {
        let settings = Settings::default();
        let options = TaskOptions::from_settings(&settings);
        assert!(stale_after(&settings) > options.timeout * options.max_attempts());
    }
}
