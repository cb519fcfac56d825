//! Job and document status state machine.
//!
//! Every status that is persisted is one of the closed enums below. Store
//! writes derive their `WHERE status IN (...)` guards from
//! [`JobStatus::can_transition_to`], so adding a variant forces every match
//! in the crate to be revisited.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// Primary key of a row in `processing_jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        JobId(value)
    }
}

/// Lifecycle status of a single processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Skipped,
    Failed,
    Rejected,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::AwaitingApproval,
        JobStatus::Completed,
        JobStatus::Skipped,
        JobStatus::Failed,
        JobStatus::Rejected,
    ];

    /// Statuses that count against the one-active-job-per-document rule.
    pub const ACTIVE: [JobStatus; 3] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::AwaitingApproval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Completed => "completed",
            JobStatus::Skipped => "skipped",
            JobStatus::Failed => "failed",
            JobStatus::Rejected => "rejected",
        }
    }

    pub fn is_active(self) -> bool {
        match self {
            JobStatus::Queued | JobStatus::Running | JobStatus::AwaitingApproval => true,
            JobStatus::Completed | JobStatus::Skipped | JobStatus::Failed | JobStatus::Rejected => {
                false
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Returns true if a job may move from `self` to `next`.
    ///
    /// `running -> running` is a re-claim by a later broker delivery.
    /// `queued -> failed` covers a broker push that never landed, and
    /// `awaiting_approval -> failed` a pending payload that cannot be decoded.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Running) | (Queued, Failed) => true,
            (Running, Running | Completed | AwaitingApproval | Skipped | Failed) => true,
            (AwaitingApproval, Completed | Rejected | Failed) => true,
            (Queued, _) | (Running, _) | (AwaitingApproval, _) => false,
            (Completed | Skipped | Failed | Rejected, _) => false,
        }
    }

    /// All statuses from which `next` may be entered.
    pub fn predecessors(next: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// Current-state projection of a document's processing outcome.
///
/// There is no `failed` variant: a failed job leaves the record untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Completed,
    Skipped,
    Rejected,
    AwaitingApproval,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 4] = [
        DocumentStatus::Completed,
        DocumentStatus::Skipped,
        DocumentStatus::Rejected,
        DocumentStatus::AwaitingApproval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Completed => "completed",
            DocumentStatus::Skipped => "skipped",
            DocumentStatus::Rejected => "rejected",
            DocumentStatus::AwaitingApproval => "awaiting_approval",
        }
    }

    /// Finalized documents are not picked up again by passive discovery.
    pub fn is_finalized(self) -> bool {
        match self {
            DocumentStatus::Completed | DocumentStatus::Skipped | DocumentStatus::Rejected => true,
            DocumentStatus::AwaitingApproval => false,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError {
                kind: "document status",
                value: s.to_string(),
            })
    }
}

/// Who asked for a job to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobSource {
    #[serde(rename = "scanner")]
    Scanner,
    #[serde(rename = "hook")]
    Hook,
    #[serde(rename = "api")]
    Api,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "force-reprocess")]
    ForceReprocess,
}

impl JobSource {
    pub const ALL: [JobSource; 5] = [
        JobSource::Scanner,
        JobSource::Hook,
        JobSource::Api,
        JobSource::Manual,
        JobSource::ForceReprocess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobSource::Scanner => "scanner",
            JobSource::Hook => "hook",
            JobSource::Api => "api",
            JobSource::Manual => "manual",
            JobSource::ForceReprocess => "force-reprocess",
        }
    }

    /// Passive sources never re-enqueue a document whose record is finalized.
    pub fn is_passive(self) -> bool {
        match self {
            JobSource::Scanner | JobSource::Hook => true,
            JobSource::Api | JobSource::Manual | JobSource::ForceReprocess => false,
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobSource {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        JobSource::ALL
            .into_iter()
            .find(|source| source.as_str() == needle)
            .ok_or_else(|| ParseStatusError {
                kind: "job source",
                value: s.to_string(),
            })
    }
}

/// Renders a list of statuses as a SQL `IN` list body, e.g. `'queued','running'`.
///
/// Only the fixed `as_str` values are interpolated.
pub(crate) fn sql_in_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}
