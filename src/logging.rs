//! Subscriber installation for applications embedding the pipeline.
//!
//! Library code only emits `tracing` events. An application installs one
//! global subscriber at startup; `RUST_LOG` directives take precedence over
//! the configured level. Every pipeline thread is named (`cam{id}-dispatch`,
//! `cam{id}-worker-N`, ...), so thread names are always printed.
//!
//! ```no_run
//! use camera_capture::{config::CaptureConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::CaptureConfig;
use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Install the subscriber described by the `[application]` section.
pub fn init_from_config(config: &CaptureConfig) -> AppResult<()> {
    init(&config.application.log_level, config.application.log_format)
}

/// Install the global subscriber at `level` unless one is already present.
pub fn init(level: &str, format: LogFormat) -> AppResult<()> {
    let level = parse_level(level)?;

    if tracing::dispatcher::has_been_set() {
        tracing::debug!("Global subscriber already installed");
        return Ok(());
    }

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let layer = fmt::layer().with_thread_names(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|e| CaptureError::Configuration(format!("cannot install subscriber: {e}")))
}

fn parse_level(level: &str) -> AppResult<LevelFilter> {
    level
        .parse()
        .map_err(|_| CaptureError::Configuration(format!("unknown log level '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("WARN").unwrap(), LevelFilter::WARN);
        assert!(matches!(
            parse_level("loud"),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn test_format_from_toml() {
        #[derive(Deserialize)]
        struct Section {
            format: LogFormat,
        }
        let section: Section = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(section.format, LogFormat::Json);
        assert_eq!(LogFormat::default(), LogFormat::Compact);
    }
}
