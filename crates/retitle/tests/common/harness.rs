//! Test harness for isolated engine execution.
//!
//! The `TestHarness` wires an [`Engine`] over an in-memory database, an
//! in-process broker and the fakes from [`super::fakes`], and drives
//! deliveries synchronously so tests stay deterministic.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use retitle::db::document_repo::{self, DocumentRecord};
use retitle::db::job_repo::{self, JobRow};
use retitle::{
    Broker, Database, Document, Engine, EnqueueOptions, JobEvent, JobId, JobSource, MemoryBroker,
    Settings, TitleVerdict,
};

use super::builders::{keep, SettingsBuilder};
use super::fakes::{FakeDocuments, ScriptedEvaluator};

const RECEIVE_WAIT: Duration = Duration::from_millis(20);
const MAX_DELIVERIES: usize = 100;

pub struct TestHarness {
    pub engine: Engine,
    pub db: Database,
    pub documents: Arc<FakeDocuments>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub broker: Arc<MemoryBroker>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(SettingsBuilder::new().build())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self::with_parts(settings, keep())
    }

    pub fn with_parts(settings: Settings, fallback: TitleVerdict) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let documents = Arc::new(FakeDocuments::default());
        let evaluator = Arc::new(ScriptedEvaluator::new(fallback));
        let broker = Arc::new(MemoryBroker::new());

        let engine = Engine::with_parts(
            db.clone(),
            settings,
            documents.clone(),
            evaluator.clone(),
            broker.clone(),
        );

        Self {
            engine,
            db,
            documents,
            evaluator,
            broker,
        }
    }

    pub fn add_document(&self, document: Document) {
        self.documents.insert(document);
    }

    pub fn enqueue(&self, document_id: i64, source: JobSource) -> JobId {
        self.engine
            .admission()
            .enqueue_document(document_id, source, None, &EnqueueOptions::default())
            .expect("enqueue failed")
    }

    /// Processes deliveries until the broker is empty.
    pub fn drain(&self) -> Vec<JobEvent> {
        let executor = self.engine.executor();
        let mut events = Vec::new();
        for _ in 0..MAX_DELIVERIES {
            match self.broker.receive(RECEIVE_WAIT).expect("broker closed") {
                Some(delivery) => events.push(executor.process_delivery(delivery)),
                None if self.broker.is_empty() => return events,
                None => {}
            }
        }
        panic!("broker did not drain after {MAX_DELIVERIES} deliveries");
    }

    pub fn job(&self, job_id: JobId) -> JobRow {
        self.db
            .with_conn(|conn| job_repo::find_by_id(conn, job_id))
            .unwrap()
            .expect("job not found")
    }

    pub fn record(&self, document_id: i64) -> Option<DocumentRecord> {
        self.db
            .with_conn(|conn| document_repo::find(conn, document_id))
            .unwrap()
    }

    pub fn jobs_for(&self, document_id: i64) -> Vec<JobRow> {
        let filter = job_repo::JobFilter {
            document_id: Some(document_id),
            ascending: true,
            ..Default::default()
        };
        self.engine.jobs(&filter).unwrap().0
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.engine.settings().snapshot().unwrap()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
