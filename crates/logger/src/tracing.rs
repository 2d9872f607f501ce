use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Parse a format name, anything unknown falls back to compact.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Compact,
        }
    }
}

pub fn init() {
    init_tracing();
}

/// Initialize tracing with INFO as default level, format taken from `RUST_LOG_FORMAT`.
pub fn init_tracing() {
    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
        })
        .unwrap_or_default();

    init_with(LevelFilter::INFO, LogFormat::from_name(&log_format));
}

/// Initialize tracing subscriber with an explicit default level and format.
///
/// `RUST_LOG` still takes precedence over `level`, and `RUST_LOG_FORMAT=json`
/// forces JSON output regardless of `format`.
pub fn init_with(level: LevelFilter, format: LogFormat) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let format = match var("RUST_LOG_FORMAT") {
        Ok(value) if LogFormat::from_name(&value) == LogFormat::Json => LogFormat::Json,
        _ => format,
    };

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
    };

    // try_init so tests and repeated CLI invocations don't panic on a second call
    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}
