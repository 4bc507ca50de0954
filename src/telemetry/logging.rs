//! Logging configuration and initialization.
//!
//! RUST_LOG wins over the `[logging]` section of the configuration file;
//! output is pretty, compact or JSON.

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// `[logging]` section of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
    /// Output format: pretty, compact, json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Initializes the logging system.
///
/// Priority:
/// 1. RUST_LOG environment variable (if set)
/// 2. config parameter (if provided)
/// 3. Default: info level, pretty format
///
/// Installing a second subscriber is silently ignored.
pub fn init_logging(config: Option<&LogConfig>) {
    // Determine log level filter
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        // RUST_LOG takes priority
        EnvFilter::from_default_env()
    } else if let Some(cfg) = config {
        // Use config file setting
        // Keep our own crate at the requested level, dependencies at warn
        let level = parse_level(&cfg.level);
        EnvFilter::new(format!("warn,sleepproxy={}", level.as_str().to_lowercase()))
    } else {
        // Default to info
        EnvFilter::new("warn,sleepproxy=info")
    };

    // Get format from config or default
    let format = config.map(|c| c.format.as_str()).unwrap_or("pretty");

    // Build and set subscriber based on format
    match format {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            );
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        _ => {
            // "pretty" or default
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

/// Parses a log level string into a Level.
fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
