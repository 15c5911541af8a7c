//! Configuration loading using Figment.
//!
//! Configuration is loaded from two sources, in order:
//! 1. `config/capture.toml`, the base configuration
//! 2. environment variables prefixed with `CAMERA_CAPTURE_`, using `__` as the
//!    section separator
//!
//! # Example
//! ```no_run
//! use camera_capture::config::CaptureConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::load()?;
//! config.validate()?;
//! println!("Workers: {}", config.device.concurrency);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, CaptureError};
use crate::error_stats::DEFAULT_HISTORY_LEN;
use crate::image::PixelFormat;
use crate::logging::LogFormat;
use crate::retry::RetryPolicies;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/capture.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CAMERA_CAPTURE_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device session settings.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Retry policies.
    #[serde(default)]
    pub retry: RetryPolicies,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line layout (pretty, compact, json).
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Device session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of image buffers and callback workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Pixel format of captured images.
    #[serde(default)]
    pub pixel_format: PixelFormat,
    /// History entries kept per capture error category.
    #[serde(default = "default_history_len")]
    pub error_history_len: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_history_len() -> usize {
    DEFAULT_HISTORY_LEN
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pixel_format: PixelFormat::default(),
            error_history_len: default_history_len(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from `config/capture.toml` and environment variables.
    ///
    /// Environment variables override the file, e.g.
    /// `CAMERA_CAPTURE_DEVICE__CONCURRENCY=8`.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider chain used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(CaptureConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CaptureError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.device.concurrency == 0 {
            return Err(CaptureError::Configuration(
                "device.concurrency must be at least 1".to_string(),
            ));
        }

        if self.device.error_history_len == 0 {
            return Err(CaptureError::Configuration(
                "device.error_history_len must be at least 1".to_string(),
            ));
        }

        for (name, policy) in [
            ("firmware_upload", &self.retry.firmware_upload),
            ("close", &self.retry.close),
        ] {
            if policy.max_attempts.is_none() || policy.max_attempts == Some(0) {
                return Err(CaptureError::Configuration(format!(
                    "retry.{name}.max_attempts must be a positive number"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.device.concurrency, 5);
        assert_eq!(config.device.pixel_format, PixelFormat::Rgb16);
        assert_eq!(config.retry.firmware_upload.max_attempts, Some(3));
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = CaptureConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, CaptureConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[device]
concurrency = 8
pixel_format = "mono8"

[retry.close]
max_attempts = 5
backoff_delay = "50ms"
"#
        )
        .unwrap();

        let config = CaptureConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.device.concurrency, 8);
        assert_eq!(config.device.pixel_format, PixelFormat::Mono8);
        assert_eq!(
            config.retry.close,
            RetryPolicy::bounded(5, Duration::from_millis(50))
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.retry.signal.max_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[device]\nconcurrency = 2").unwrap();

        std::env::set_var("CAMERA_CAPTURE_DEVICE__CONCURRENCY", "7");
        let result = CaptureConfig::load_from(file.path());
        std::env::remove_var("CAMERA_CAPTURE_DEVICE__CONCURRENCY");

        assert_eq!(result.unwrap().device.concurrency, 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = CaptureConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.device.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = CaptureConfig::default();
        config.retry.close.max_attempts = None;
        assert!(config.validate().is_err());
    }
}
