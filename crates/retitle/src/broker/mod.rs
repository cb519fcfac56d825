//! Work queue between admission and the worker pool.
//!
//! The broker carries nothing but a [`TaskMessage`]; all job state lives in
//! the record store. Delivery is at-least-once, so every consumer must
//! tolerate seeing the same job twice.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::status::JobId;

mod memory;

pub use memory::MemoryBroker;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker is closed")]
    Closed,

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// The whole task payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: JobId,
    pub document_id: i64,
}

/// Retry and lease policy attached to a task when it is pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    /// Delay before each retry. One more attempt than there are delays.
    pub backoff: Vec<Duration>,
    /// How long a delivery may stay unacknowledged before it is re-presented.
    pub timeout: Duration,
}

impl TaskOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            backoff: settings.retry_delays(),
            timeout: settings.job_timeout(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.backoff.len())
            .unwrap_or(u32::MAX - 1)
            .saturating_add(1)
    }

    /// Delay before the attempt after `attempt`, if there is one.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        let index = usize::try_from(attempt.checked_sub(1)?).ok()?;
        self.backoff.get(index).copied()
    }
}

/// A task handed to a consumer. `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: TaskMessage,
    pub options: TaskOptions,
    pub attempt: u32,
    lease: u64,
}

impl Delivery {
    pub(crate) fn new(message: TaskMessage, options: TaskOptions, attempt: u32, lease: u64) -> Self {
        Self {
            message,
            options,
            attempt,
            lease,
        }
    }

    pub fn lease_id(&self) -> u64 {
        self.lease
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.options.max_attempts()
    }
}

/// Queue transport used by admission (producer) and workers (consumers).
pub trait Broker: Send + Sync {
    fn push(&self, message: TaskMessage, options: TaskOptions) -> Result<(), BrokerError>;

    /// Waits up to `wait` for the next ready delivery.
    fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledges a delivery. Acks for an expired lease are ignored.
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Gives a delivery back for a retry after its backoff delay. Returns
    /// false when no attempts remain and the task was dropped.
    fn nack(&self, delivery: Delivery) -> Result<bool, BrokerError>;

    /// Tasks ready, delayed or in flight.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every task. The record store is not touched.
    fn flush(&self);

    /// Refuses further pushes and wakes waiting consumers.
    fn close(&self);

    /// Whether a task for the job is ready, delayed or in flight.
    fn holds(&self, job_id: JobId) -> bool;
}
