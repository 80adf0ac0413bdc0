//! Tracing setup for the runtime and the inspection CLI.
//!
//! `RUST_LOG` overrides the configured level and `DURABLE_LOG_FORMAT=json`
//! overrides the configured format.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber with default settings.
pub fn init_tracing() {
    init_tracing_with(&ObservabilityConfig::default());
}

/// Install the global subscriber. Only the first call in a process has any
/// effect; an already-installed foreign subscriber is left alone.
pub fn init_tracing_with(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let format: Box<dyn Layer<Registry> + Send + Sync> = if wants_json(config) {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().compact().boxed()
        };

        let result = tracing_subscriber::registry()
            .with(format)
            .with(level_filter(config))
            .try_init();
        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn level_filter(config: &ObservabilityConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

fn wants_json(config: &ObservabilityConfig) -> bool {
    match std::env::var("DURABLE_LOG_FORMAT") {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => config.json_logs,
    }
}
