pub mod loader;
pub mod schema;
pub mod service;

pub use loader::{default_settings_path, load_settings, load_settings_from_str};
pub use schema::{LlmConfig, PaperlessConfig, QueueConfig, Settings, TagRules};
pub use service::{SettingsService, CONFIGURABLE_KEYS};
