//! Plan building: fetch a document, apply the eligibility rules, consult the
//! title evaluator and decide. Nothing here writes anywhere, so a failed
//! build can simply be retried.

mod builder;
pub mod eligibility;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::client::UpstreamError;

pub use builder::PlanBuilder;
pub use eligibility::Eligibility;

/// Characters of document content kept in a plan for reviewers.
pub const OCR_EXCERPT_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanDecision {
    Ineligible {
        reason: String,
    },
    NoChangeNeeded {
        reason: String,
    },
    NewTitle {
        title: String,
        confidence: Option<f64>,
        reason: String,
    },
}

/// Immutable decision for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub document_id: i64,
    pub decision: PlanDecision,
    pub existing_title: Option<String>,
    /// Tag slugs at planning time.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub correspondent: Option<String>,
    #[serde(default)]
    pub ocr_excerpt: Option<String>,
    #[serde(default)]
    pub raw_response: Option<Value>,
}

impl Plan {
    pub fn reason(&self) -> &str {
        match &self.decision {
            PlanDecision::Ineligible { reason }
            | PlanDecision::NoChangeNeeded { reason }
            | PlanDecision::NewTitle { reason, .. } => reason,
        }
    }

    pub fn proposed_title(&self) -> Option<&str> {
        match &self.decision {
            PlanDecision::NewTitle { title, .. } => Some(title),
            PlanDecision::Ineligible { .. } | PlanDecision::NoChangeNeeded { .. } => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match &self.decision {
            PlanDecision::NewTitle { confidence, .. } => *confidence,
            PlanDecision::Ineligible { .. } | PlanDecision::NoChangeNeeded { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("Invalid evaluator response: {0}")]
    InvalidResponse(String),
}

impl PlanError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PlanError::Upstream(e) => e.is_retryable(),
            PlanError::InvalidResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_serializes_with_decision_kind() {
        let plan = Plan {
            document_id: 9,
            decision: PlanDecision::NewTitle {
                title: "ACME Invoice".into(),
                confidence: Some(0.4),
                reason: "missing existing title".into(),
            },
            existing_title: None,
            tags: vec!["inbox".into()],
            correspondent: None,
            ocr_excerpt: Some("text".into()),
            raw_response: Some(json!({"suggestion": {}})),
        };
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["decision"]["kind"], "new_title");
        assert_eq!(value["decision"]["title"], "ACME Invoice");

        let back: Plan = serde_json::from_value(value).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.proposed_title(), Some("ACME Invoice"));
        assert_eq!(back.confidence(), Some(0.4));
        assert_eq!(back.reason(), "missing existing title");
    }

    #[test]
    fn test_plan_error_retryability() {
        let unavailable = PlanError::Upstream(UpstreamError::Unavailable {
            service: "paperless",
            message: "connection refused".into(),
        });
        assert!(unavailable.is_retryable());
        assert!(!PlanError::InvalidResponse("empty title".into()).is_retryable());
    }
}
