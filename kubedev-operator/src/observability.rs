//! Log subscriber setup with format selection.

use crate::error::{OperatorError, OperatorResult};
use std::env;
use std::str::FromStr;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON, one object per line.
    Json,
    /// Human-readable multi-line format.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Output format.
    pub log_format: LogFormat,
    /// Filter directives (e.g. "info,kubedev_operator=debug").
    pub log_filter: String,
    /// Include file and line of each event.
    pub include_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info,kube=info".to_string(),
            include_location: false,
        }
    }
}

impl TracingConfig {
    /// Read `KUBEDEV_LOG_FORMAT` and `KUBEDEV_LOG_LEVEL`, falling back to
    /// `RUST_LOG` for the filter.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(format) = env::var("KUBEDEV_LOG_FORMAT") {
            config.log_format = format.parse().unwrap_or_default();
        }
        if let Ok(filter) = env::var("KUBEDEV_LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            config.log_filter = filter;
        }
        config
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> OperatorResult<()> {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
    };
    result.map_err(|e| OperatorError::Internal(format!("failed to initialize logging: {e}")))
}
