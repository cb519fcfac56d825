pub mod admission;
pub mod approval;
pub mod broker;
pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod outcome;
pub mod plan;
pub mod reconcile;
pub mod status;
pub mod worker;

pub use admission::{Admission, AdmissionError, EnqueueOptions, EnqueueSummary};
pub use approval::{ApprovalError, ApprovalGateway, PendingApproval};
pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, TaskMessage, TaskOptions};
pub use client::{Document, DocumentSystem, TitleEvaluator, TitleVerdict, UpstreamError, Verdict};
pub use config::{load_settings, Settings, SettingsService};
pub use db::{Database, DatabaseError};
pub use engine::{Engine, QueueStats};
pub use error::{ConfigError, Result, RetitleError};
pub use outcome::{OutcomeApplier, OutcomeError, PendingPlan};
pub use plan::{Plan, PlanBuilder, PlanDecision, PlanError};
pub use status::{DocumentStatus, JobId, JobSource, JobStatus};
pub use worker::{JobEvent, JobEventBroadcaster, JobEventKind, JobExecutor, WorkerPool};
