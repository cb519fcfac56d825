//! External collaborators: the document system and the title evaluator.
//!
//! The engine only sees the [`DocumentSystem`] and [`TitleEvaluator`] traits;
//! [`paperless::PaperlessClient`] and [`llm::OpenAiTitleEvaluator`] are the
//! HTTP implementations.

pub mod llm;
pub mod paperless;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use llm::OpenAiTitleEvaluator;
pub use paperless::PaperlessClient;

/// Failure talking to an external system. Never stringified before it
/// reaches the job-completion boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("{service} timed out after {after:?}")]
    Timeout {
        service: &'static str,
        after: Duration,
    },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{service} rejected the request ({status}): {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

impl UpstreamError {
    /// Transient failures that a later delivery may get past.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Unavailable { .. } | UpstreamError::Timeout { .. } => true,
            UpstreamError::NotFound { .. }
            | UpstreamError::Rejected { .. }
            | UpstreamError::InvalidResponse { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

/// Document as seen by the plan builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Vec<Tag>,
    /// Custom field values keyed by lowercase field name (and slug, when known).
    pub custom_fields: BTreeMap<String, String>,
    pub correspondent: Option<String>,
    pub document_type: Option<String>,
    pub created: Option<String>,
}

impl Document {
    /// Title with surrounding whitespace removed, `None` when blank.
    pub fn existing_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
    }

    pub fn has_content(&self) -> bool {
        self.content
            .as_deref()
            .is_some_and(|content| !content.trim().is_empty())
    }

    /// Whether a tag matches `needle` by slug or name, ignoring case and
    /// surrounding whitespace.
    pub fn has_tag(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        self.tags.iter().any(|tag| {
            tag.slug.trim().to_lowercase() == needle || tag.name.trim().to_lowercase() == needle
        })
    }

    /// Non-blank value of a custom field.
    pub fn custom_field(&self, name: &str) -> Option<&str> {
        self.custom_fields
            .get(&name.trim().to_lowercase())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn tag_slugs(&self) -> Vec<String> {
        self.tags.iter().map(|tag| tag.slug.clone()).collect()
    }
}

/// The external document-management system.
pub trait DocumentSystem: Send + Sync {
    fn fetch(&self, document_id: i64) -> Result<Document, UpstreamError>;

    fn update_title(&self, document_id: i64, title: &str) -> Result<(), UpstreamError>;

    /// Sets a custom field, identified by name or slug.
    fn set_custom_field(&self, document_id: i64, field: &str, value: &str)
        -> Result<(), UpstreamError>;
}

/// What the evaluator is asked about.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub document: &'a Document,
    pub existing_title: Option<&'a str>,
    pub prompt_char_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Keep,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TitleVerdict {
    pub verdict: Verdict,
    pub proposed_title: Option<String>,
    pub confidence: Option<f64>,
    /// Raw model output kept for audit.
    pub raw_response: Value,
}

/// Judges an existing title and proposes a better one.
pub trait TitleEvaluator: Send + Sync {
    fn evaluate(&self, context: &EvaluationContext<'_>) -> Result<TitleVerdict, UpstreamError>;
}

/// Maps a `reqwest` failure onto the upstream taxonomy.
pub(crate) fn map_transport_error(
    service: &'static str,
    timeout: Duration,
    err: reqwest::Error,
) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::Timeout {
            service,
            after: timeout,
        };
    }
    if let Some(status) = err.status() {
        return map_status(service, status.as_u16(), err.to_string());
    }
    if err.is_decode() {
        return UpstreamError::InvalidResponse {
            service,
            message: err.to_string(),
        };
    }
    UpstreamError::Unavailable {
        service,
        message: err.to_string(),
    }
}

/// Maps a non-success HTTP status onto the upstream taxonomy.
pub(crate) fn map_status(service: &'static str, status: u16, message: String) -> UpstreamError {
    match status {
        404 => UpstreamError::NotFound {
            what: format!("{service} resource"),
        },
        408 | 429 | 500..=599 => UpstreamError::Unavailable {
            service,
            message: format!("HTTP {status}: {message}"),
        },
        _ => UpstreamError::Rejected {
            service,
            status,
            message,
        },
    }
}
