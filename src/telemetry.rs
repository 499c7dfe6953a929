//! Logging configuration for the broker.
//!
//! Structured logging with pretty-print or line-oriented JSON output.
//! Levels are controlled through `RUST_LOG`; the output format through
//! `LOG_FORMAT`.
//!
//! ```rust,no_run
//! use broadsheet::telemetry::{init_logging, LogFormat};
//!
//! init_logging(LogFormat::from_env()).expect("failed to init logging");
//! ```

use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty-print format (default).
    #[default]
    Pretty,
    /// Line-oriented JSON for log aggregators.
    Json,
}

impl LogFormat {
    /// Interpret a `LOG_FORMAT` setting: `json` in any casing selects
    /// JSON output; every other value is pretty.
    fn from_setting(value: &str) -> LogFormat {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }

    /// Resolve the format from the `LOG_FORMAT` environment variable.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) => LogFormat::from_setting(&value),
            Err(_) => LogFormat::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber with the given format.
///
/// Levels default to `info` and are overridden by `RUST_LOG`. Returns an
/// error if a global subscriber was already installed.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false).compact())
                .try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
    }
    Ok(())
}
