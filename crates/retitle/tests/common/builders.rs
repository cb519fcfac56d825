//! Builders for test documents, verdicts and settings.

#![allow(dead_code)]

use std::time::Duration;

use retitle::client::Tag;
use retitle::{Document, Settings, TitleVerdict, UpstreamError, Verdict};
use serde_json::json;

/// Builder for `Document` instances.
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// A document with OCR content and no title.
    pub fn new(id: i64) -> Self {
        Self {
            document: Document {
                id,
                content: Some(format!("Invoice number {id} from ACME Corp, total 120.00 EUR")),
                ..Default::default()
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.document.title = Some(title.to_string());
        self
    }

    pub fn content(mut self, content: &str) -> Self {
        self.document.content = Some(content.to_string());
        self
    }

    pub fn tag(mut self, slug: &str) -> Self {
        let id = self.document.tags.len() as i64 + 1;
        self.document.tags.push(Tag {
            id,
            name: slug.to_string(),
            slug: slug.to_string(),
        });
        self
    }

    pub fn custom_field(mut self, name: &str, value: &str) -> Self {
        self.document
            .custom_fields
            .insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn correspondent(mut self, name: &str) -> Self {
        self.document.correspondent = Some(name.to_string());
        self
    }

    pub fn build(self) -> Document {
        self.document
    }
}

pub fn replace(title: &str, confidence: Option<f64>) -> TitleVerdict {
    TitleVerdict {
        verdict: Verdict::Replace,
        proposed_title: Some(title.to_string()),
        confidence,
        raw_response: json!({"suggestion": {"title": title, "confidence": confidence}}),
    }
}

pub fn keep() -> TitleVerdict {
    TitleVerdict {
        verdict: Verdict::Keep,
        proposed_title: None,
        confidence: Some(0.9),
        raw_response: json!({"evaluation": {"verdict": "GOOD", "acceptable": true}}),
    }
}

pub fn unavailable() -> UpstreamError {
    UpstreamError::Unavailable {
        service: "llm",
        message: "connection refused".to_string(),
    }
}

pub fn timeout() -> UpstreamError {
    UpstreamError::Timeout {
        service: "paperless",
        after: Duration::from_secs(30),
    }
}

/// Builder for `Settings` tuned for fast tests: zero backoff, short leases.
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        let mut settings = Settings::default();
        settings.queue.retry_delays_secs = vec![0, 0];
        settings.queue.job_timeout_secs = Some(30);
        settings.worker_count = 2;
        Self { settings }
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.settings.llm.confidence_threshold = threshold;
        self
    }

    pub fn auto_apply(mut self, enabled: bool) -> Self {
        self.settings.auto_apply_titles = enabled;
        self
    }

    pub fn retry_delays(mut self, delays: Vec<u64>) -> Self {
        self.settings.queue.retry_delays_secs = delays;
        self
    }

    pub fn exclude_tag(mut self, tag: &str) -> Self {
        self.settings.tags.exclude.push(tag.to_string());
        self
    }

    pub fn lock_tag(mut self, tag: &str) -> Self {
        self.settings.tags.lock = Some(tag.to_string());
        self
    }

    pub fn reject_stale_approvals(mut self) -> Self {
        self.settings.reject_stale_approvals = true;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
