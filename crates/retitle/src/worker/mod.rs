//! Worker pool consuming broker deliveries.

pub mod events;
pub mod executor;
pub mod pool;

pub use events::{JobEvent, JobEventBroadcaster, JobEventKind};
pub use executor::JobExecutor;
pub use pool::WorkerPool;
