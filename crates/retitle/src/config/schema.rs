use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime settings. Every field has a default so an empty `{}` file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: String,
    /// Overrides `~/.retitle/data/retitle.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub paperless: PaperlessConfig,
    #[serde(default)]
    pub tags: TagRules,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default = "default_true")]
    pub auto_apply_titles: bool,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Refuse to approve a plan when the document title changed since the
    /// plan was built.
    #[serde(default)]
    pub reject_stale_approvals: bool,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: None,
            paperless: PaperlessConfig::default(),
            tags: TagRules::default(),
            llm: LlmConfig::default(),
            auto_apply_titles: true,
            queue: QueueConfig::default(),
            worker_count: default_worker_count(),
            log_level: default_log_level(),
            reject_stale_approvals: false,
        }
    }
}

impl Settings {
    /// Name of the custom field that receives the pre-AI title, if enabled.
    pub fn original_title_field(&self) -> Option<&str> {
        self.paperless
            .original_title_field
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Broker backoff between delivery attempts.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.queue
            .retry_delays_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    /// Execution timeout of a single delivery. Defaults to the LLM request
    /// timeout plus ten seconds.
    pub fn job_timeout(&self) -> Duration {
        let secs = self
            .queue
            .job_timeout_secs
            .unwrap_or(self.llm.request_timeout_secs + 10);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperlessConfig {
    #[serde(default = "default_paperless_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_original_title_field")]
    pub original_title_field: Option<String>,
    #[serde(default = "default_paperless_timeout")]
    pub request_timeout_secs: u64,
    /// How long custom field definitions are cached.
    #[serde(default = "default_field_cache_ttl")]
    pub field_cache_ttl_secs: u64,
}

fn default_paperless_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_original_title_field() -> Option<String> {
    Some("original_title".to_string())
}

fn default_paperless_timeout() -> u64 {
    30
}

fn default_field_cache_ttl() -> u64 {
    300
}

impl Default for PaperlessConfig {
    fn default() -> Self {
        Self {
            base_url: default_paperless_url(),
            api_token: String::new(),
            original_title_field: default_original_title_field(),
            request_timeout_secs: default_paperless_timeout(),
            field_cache_ttl_secs: default_field_cache_ttl(),
        }
    }
}

/// Tag filters deciding which documents are eligible.
///
/// Entries match a tag's slug or name, case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagRules {
    /// If non-empty, at least one must be present.
    #[serde(default)]
    pub include: Vec<String>,
    /// None may be present.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// All must be present.
    #[serde(default)]
    pub require: Vec<String>,
    /// Marks a document as permanently excluded.
    #[serde(default)]
    pub lock: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_prompt_char_limit")]
    pub prompt_char_limit: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout() -> u64 {
    300
}

fn default_prompt_char_limit() -> usize {
    8000
}

fn default_confidence_threshold() -> f64 {
    0.6
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_url(),
            api_token: None,
            model: default_model(),
            request_timeout_secs: default_llm_timeout(),
            prompt_char_limit: default_prompt_char_limit(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// One entry per retry; the number of delivery attempts is one more.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

fn default_retry_delays() -> Vec<u64> {
    vec![30, 90, 300]
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_delays_secs: default_retry_delays(),
            job_timeout_secs: None,
        }
    }
}
