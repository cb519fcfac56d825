use std::path::{Path, PathBuf};

use crate::config::schema::Settings;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/settings-v1.json");

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Returns the canonical settings path: `~/.retitle/settings.json`.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".retitle").join("settings.json"))
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let settings: Settings = serde_json::from_value(json_value)?;

    validate_settings(&settings)?;

    Ok(settings)
}

/// Schema plus semantic validation of an already-typed value, used when
/// overrides are merged in.
pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let json_value = serde_json::to_value(settings)?;
    validate_schema(&json_value)?;
    validate_settings(settings)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported settings version: {}", settings.version),
        });
    }

    let threshold = settings.llm.confidence_threshold;
    if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::InvalidValue {
            key: "llm.confidence_threshold".to_string(),
            reason: format!("{} is outside [0, 1]", threshold),
        });
    }

    if settings.llm.prompt_char_limit < 500 {
        return Err(ConfigError::InvalidValue {
            key: "llm.prompt_char_limit".to_string(),
            reason: "must be at least 500".to_string(),
        });
    }

    if settings.worker_count == 0 {
        return Err(ConfigError::InvalidValue {
            key: "worker_count".to_string(),
            reason: "must be at least 1".to_string(),
        });
    }

    if !LOG_LEVELS.contains(&settings.log_level.as_str()) {
        return Err(ConfigError::InvalidValue {
            key: "log_level".to_string(),
            reason: format!("expected one of {}", LOG_LEVELS.join(", ")),
        });
    }

    for (key, url) in [
        ("paperless.base_url", &settings.paperless.base_url),
        ("llm.base_url", &settings.llm.base_url),
    ] {
        let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
    }

    Ok(())
}
