//! Composition root: wires the store, collaborators, broker and services.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::admission::Admission;
use crate::approval::ApprovalGateway;
use crate::broker::{Broker, MemoryBroker};
use crate::client::{DocumentSystem, OpenAiTitleEvaluator, PaperlessClient, TitleEvaluator};
use crate::config::{Settings, SettingsService};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{self, document_repo, Database};
use crate::error::{ConfigError, Result};
use crate::outcome::OutcomeApplier;
use crate::plan::PlanBuilder;
use crate::reconcile::SweepScheduler;
use crate::status::{DocumentStatus, JobStatus};
use crate::worker::{JobEventBroadcaster, JobExecutor, WorkerPool};

/// Counters for the `stats` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub jobs: BTreeMap<JobStatus, u64>,
    pub documents: BTreeMap<DocumentStatus, u64>,
    pub completed_last_24h: u64,
    pub broker_len: usize,
}

#[derive(Clone)]
pub struct Engine {
    db: Database,
    settings: SettingsService,
    documents: Arc<dyn DocumentSystem>,
    broker: Arc<dyn Broker>,
    planner: PlanBuilder,
    outcome: OutcomeApplier,
    events: JobEventBroadcaster,
}

impl Engine {
    /// Opens the configured database and builds the HTTP collaborators and
    /// an in-process broker.
    pub fn open(settings: Settings) -> Result<Self> {
        let path = match &settings.database_path {
            Some(path) => PathBuf::from(path),
            None => db::default_database_path().ok_or_else(|| ConfigError::Validation {
                message: "cannot determine home directory for the database".to_string(),
            })?,
        };
        let db = Database::open(&path)?;

        let documents: Arc<dyn DocumentSystem> = Arc::new(PaperlessClient::new(&settings.paperless)?);
        let evaluator: Arc<dyn TitleEvaluator> = Arc::new(OpenAiTitleEvaluator::new(&settings.llm)?);
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        Ok(Self::with_parts(db, settings, documents, evaluator, broker))
    }

    pub fn with_parts(
        db: Database,
        settings: Settings,
        documents: Arc<dyn DocumentSystem>,
        evaluator: Arc<dyn TitleEvaluator>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let settings = SettingsService::new(settings, db.clone());
        let planner = PlanBuilder::new(Arc::clone(&documents), evaluator);
        let outcome = OutcomeApplier::new(db.clone(), Arc::clone(&documents));
        Self {
            db,
            settings,
            documents,
            broker,
            planner,
            outcome,
            events: JobEventBroadcaster::default(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn events(&self) -> &JobEventBroadcaster {
        &self.events
    }

    pub fn planner(&self) -> &PlanBuilder {
        &self.planner
    }

    pub fn outcome(&self) -> &OutcomeApplier {
        &self.outcome
    }

    pub fn admission(&self) -> Admission {
        Admission::new(self.db.clone(), Arc::clone(&self.broker), self.settings.clone())
    }

    pub fn approval(&self) -> ApprovalGateway {
        ApprovalGateway::new(self.db.clone(), Arc::clone(&self.documents))
    }

    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.db.clone(),
            self.settings.clone(),
            self.planner.clone(),
            self.outcome.clone(),
            Arc::clone(&self.broker),
        )
        .with_events(self.events.clone())
    }

    pub fn start_workers(&self, worker_count: usize) -> WorkerPool {
        WorkerPool::start(self.executor(), worker_count)
    }

    pub fn start_sweeper(&self, interval: Duration) -> SweepScheduler {
        SweepScheduler::start(
            self.db.clone(),
            Arc::clone(&self.broker),
            self.settings.clone(),
            interval,
        )
    }

    pub fn jobs(&self, filter: &JobFilter) -> Result<(Vec<JobRow>, u64)> {
        Ok(self.db.with_conn(|conn| job_repo::query(conn, filter))?)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let since = db::timestamp_before(Duration::from_secs(24 * 60 * 60));
        let (jobs, documents, completed_last_24h) = self.db.with_conn(|conn| {
            Ok((
                job_repo::status_counts(conn)?,
                document_repo::count_by_status(conn)?,
                job_repo::count_completed_since(conn, &since)?,
            ))
        })?;
        Ok(QueueStats {
            jobs,
            documents,
            completed_last_24h,
            broker_len: self.broker.len(),
        })
    }
}
