//! Process-wide log setup.

use std::sync::OnceLock;

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` wins over `level`.
///
/// `log` records from the store, broker and worker are forwarded into
/// tracing. Safe to call more than once; only the first call has an effect.
pub fn init(level: &str, json: bool) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        if let Err(e) = tracing_log::LogTracer::init() {
            eprintln!("log bridge already installed: {e}");
        }

        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            tracing::subscriber::set_global_default(
                registry.with(fmt::layer().json().with_target(false)),
            )
        } else {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(false)))
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {e}");
        }
    });
}
