//! Hot-reloadable settings: file-based base settings plus overrides stored
//! in the `settings` table.
//!
//! Workers call [`SettingsService::snapshot`] at the start of every job, so an
//! override saved by the CLI is picked up without a restart and a running
//! job never sees a half-applied change.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::loader;
use super::schema::Settings;
use crate::db::{self, settings_repo, Database};
use crate::error::ConfigError;

/// How a stored override string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    /// Empty string clears the value.
    OptionalText,
    Float,
    Integer,
    /// Empty string clears the value.
    OptionalInteger,
    Bool,
    /// Comma separated.
    IntegerList,
    /// Comma separated, blanks dropped.
    TextList,
}

/// A setting that may be overridden at runtime.
#[derive(Debug, Clone, Copy)]
pub struct ConfigurableKey {
    pub key: &'static str,
    pub kind: ValueKind,
    pub description: &'static str,
}

pub const CONFIGURABLE_KEYS: &[ConfigurableKey] = &[
    ConfigurableKey {
        key: "paperless.original_title_field",
        kind: ValueKind::OptionalText,
        description: "Custom field receiving the pre-AI title",
    },
    ConfigurableKey {
        key: "tags.include",
        kind: ValueKind::TextList,
        description: "At least one of these tags must be present",
    },
    ConfigurableKey {
        key: "tags.exclude",
        kind: ValueKind::TextList,
        description: "Documents with any of these tags are skipped",
    },
    ConfigurableKey {
        key: "tags.require",
        kind: ValueKind::TextList,
        description: "All of these tags must be present",
    },
    ConfigurableKey {
        key: "tags.lock",
        kind: ValueKind::OptionalText,
        description: "Tag marking a document as permanently excluded",
    },
    ConfigurableKey {
        key: "llm.model",
        kind: ValueKind::Text,
        description: "Chat model name",
    },
    ConfigurableKey {
        key: "llm.request_timeout_secs",
        kind: ValueKind::Integer,
        description: "LLM request timeout in seconds",
    },
    ConfigurableKey {
        key: "llm.prompt_char_limit",
        kind: ValueKind::Integer,
        description: "Maximum document characters sent to the LLM",
    },
    ConfigurableKey {
        key: "llm.confidence_threshold",
        kind: ValueKind::Float,
        description: "Minimum confidence for automatic application",
    },
    ConfigurableKey {
        key: "auto_apply_titles",
        kind: ValueKind::Bool,
        description: "Apply confident titles without review",
    },
    ConfigurableKey {
        key: "queue.retry_delays_secs",
        kind: ValueKind::IntegerList,
        description: "Backoff before each retry, in seconds",
    },
    ConfigurableKey {
        key: "queue.job_timeout_secs",
        kind: ValueKind::OptionalInteger,
        description: "Execution timeout of one delivery",
    },
    ConfigurableKey {
        key: "reject_stale_approvals",
        kind: ValueKind::Bool,
        description: "Refuse approvals for documents retitled since planning",
    },
];

pub fn find_key(key: &str) -> Option<&'static ConfigurableKey> {
    CONFIGURABLE_KEYS.iter().find(|k| k.key == key)
}

impl ValueKind {
    /// Parses a raw override into the JSON value it stands for.
    pub fn parse(self, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        match self {
            ValueKind::Text => {
                if trimmed.is_empty() {
                    Err("must not be empty".to_string())
                } else {
                    Ok(Value::String(trimmed.to_string()))
                }
            }
            ValueKind::OptionalText => {
                if trimmed.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(Value::String(trimmed.to_string()))
                }
            }
            ValueKind::Float => {
                let value: f64 = trimmed
                    .parse()
                    .map_err(|_| format!("'{}' is not a number", trimmed))?;
                serde_json::Number::from_f64(value)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' is not finite", trimmed))
            }
            ValueKind::Integer => parse_integer(trimmed).map(Value::from),
            ValueKind::OptionalInteger => {
                if trimmed.is_empty() {
                    Ok(Value::Null)
                } else {
                    parse_integer(trimmed).map(Value::from)
                }
            }
            ValueKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", trimmed)),
            },
            ValueKind::IntegerList => trimmed
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| parse_integer(part).map(Value::from))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ValueKind::TextList => Ok(Value::Array(
                trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
        }
    }
}

fn parse_integer(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>()
        .map_err(|_| format!("'{}' is not a non-negative integer", raw))
}

/// Writes `value` at a dotted path inside a JSON object.
fn set_path(root: &mut Value, key: &str, value: Value) -> Result<(), ConfigError> {
    let (parent, leaf) = match key.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, key),
    };
    let mut target = root;
    if let Some(parent) = parent {
        for part in parent.split('.') {
            target = target
                .get_mut(part)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        }
    }
    target
        .as_object_mut()
        .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?
        .insert(leaf.to_string(), value);
    Ok(())
}

fn merge(
    base: &Settings,
    overrides: &BTreeMap<String, String>,
    strict: bool,
) -> Result<Settings, ConfigError> {
    let mut root = serde_json::to_value(base)?;
    for (key, raw) in overrides {
        let Some(spec) = find_key(key) else {
            if strict {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
            log::warn!("Ignoring unknown setting override '{}'", key);
            continue;
        };
        match spec.kind.parse(raw) {
            Ok(value) => set_path(&mut root, key, value)?,
            Err(reason) if strict => {
                return Err(ConfigError::InvalidValue {
                    key: key.clone(),
                    reason,
                })
            }
            Err(reason) => log::warn!("Ignoring invalid override for '{}': {}", key, reason),
        }
    }
    let merged: Settings = serde_json::from_value(root)?;
    loader::validate(&merged)?;
    Ok(merged)
}

/// Settings source shared by the engine and the CLI.
#[derive(Clone)]
pub struct SettingsService {
    base: Arc<Settings>,
    db: Database,
}

impl SettingsService {
    pub fn new(base: Settings, db: Database) -> Self {
        Self {
            base: Arc::new(base),
            db,
        }
    }

    /// File-based settings without overrides.
    pub fn base(&self) -> &Settings {
        &self.base
    }

    /// Current settings: base merged with stored overrides.
    ///
    /// Unknown or unparsable overrides are skipped with a warning. If the
    /// merged result does not validate, the base settings are used.
    pub fn snapshot(&self) -> Result<Arc<Settings>, ConfigError> {
        let overrides = self.db.with_conn(settings_repo::list)?;
        if overrides.is_empty() {
            return Ok(Arc::clone(&self.base));
        }
        match merge(&self.base, &overrides, false) {
            Ok(merged) => Ok(Arc::new(merged)),
            Err(e) => {
                log::warn!("Stored setting overrides are invalid, using base settings: {}", e);
                Ok(Arc::clone(&self.base))
            }
        }
    }

    /// Stored overrides, raw.
    pub fn overrides(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        Ok(self.db.with_conn(settings_repo::list)?)
    }

    /// Validates and stores an override. Returns the resulting settings.
    pub fn save(&self, key: &str, raw: &str) -> Result<Arc<Settings>, ConfigError> {
        let spec = find_key(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        spec.kind
            .parse(raw)
            .map_err(|reason| ConfigError::InvalidValue {
                key: key.to_string(),
                reason,
            })?;

        let mut overrides = self.db.with_conn(settings_repo::list)?;
        overrides.retain(|k, _| find_key(k).is_some());
        overrides.insert(key.to_string(), raw.trim().to_string());
        let merged = merge(&self.base, &overrides, true)?;

        let now = db::now_timestamp();
        self.db
            .with_conn(|conn| settings_repo::save(conn, key, raw.trim(), &now))?;
        log::info!("Setting '{}' updated", key);
        Ok(Arc::new(merged))
    }

    /// Removes an override. Returns whether one existed.
    pub fn delete(&self, key: &str) -> Result<bool, ConfigError> {
        let removed = self.db.with_conn(|conn| settings_repo::delete(conn, key))?;
        if removed {
            log::info!("Setting '{}' reset", key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SettingsService {
        let db = Database::open_in_memory().unwrap();
        SettingsService::new(Settings::default(), db)
    }

    #[test]
    fn test_snapshot_without_overrides_is_base() {
        let service = service();
        let snapshot = service.snapshot().unwrap();
        assert_eq!(*snapshot, *service.base());
    }

    #[test]
    fn test_save_is_visible_in_next_snapshot() {
        let service = service();
        let before = service.snapshot().unwrap();

        service.save("llm.confidence_threshold", "0.85").unwrap();
        service.save("auto_apply_titles", "off").unwrap();
        service.save("tags.exclude", "no-ai, private ,").unwrap();
        service.save("queue.retry_delays_secs", "1,2,3").unwrap();

        let after = service.snapshot().unwrap();
        assert_eq!(before.llm.confidence_threshold, 0.6);
        assert_eq!(after.llm.confidence_threshold, 0.85);
        assert!(!after.auto_apply_titles);
        assert_eq!(after.tags.exclude, vec!["no-ai", "private"]);
        assert_eq!(after.queue.retry_delays_secs, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_rejects_unknown_key() {
        let service = service();
        let err = service.save("paperless.api_token", "x").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn test_save_rejects_invalid_values() {
        let service = service();
        assert!(matches!(
            service.save("auto_apply_titles", "maybe").unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
        assert!(service.save("llm.confidence_threshold", "1.2").is_err());
        assert!(service.save("llm.prompt_char_limit", "10").is_err());
        assert!(service.overrides().unwrap().is_empty());
    }

    #[test]
    fn test_optional_values_clear() {
        let service = service();
        service.save("paperless.original_title_field", "").unwrap();
        service.save("tags.lock", "locked").unwrap();
        let snapshot = service.snapshot().unwrap();
        assert_eq!(snapshot.original_title_field(), None);
        assert_eq!(snapshot.tags.lock.as_deref(), Some("locked"));
    }

    #[test]
    fn test_unknown_stored_override_is_ignored() {
        let service = service();
        service
            .db
            .with_conn(|conn| settings_repo::save(conn, "bogus.key", "1", "t"))
            .unwrap();
        service.save("llm.model", "llama3").unwrap();
        let snapshot = service.snapshot().unwrap();
        assert_eq!(snapshot.llm.model, "llama3");
    }

    #[test]
    fn test_delete_restores_base() {
        let service = service();
        service.save("llm.model", "llama3").unwrap();
        assert!(service.delete("llm.model").unwrap());
        assert!(!service.delete("llm.model").unwrap());
        assert_eq!(service.snapshot().unwrap().llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_value_kind_parsing() {
        assert_eq!(ValueKind::Integer.parse(" 42 ").unwrap(), Value::from(42u64));
        assert!(ValueKind::Integer.parse("-1").is_err());
        assert_eq!(ValueKind::OptionalInteger.parse("").unwrap(), Value::Null);
        assert!(ValueKind::Text.parse("  ").is_err());
        assert!(ValueKind::Float.parse("abc").is_err());
    }
}
