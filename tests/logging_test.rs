//! Global subscriber installation.
//!
//! Lives in its own test binary: the unit tests use `tracing-test`, which
//! installs its own global subscriber.

use camera_capture::config::CaptureConfig;
use camera_capture::logging::{self, LogFormat};

#[test]
fn test_init_is_idempotent() {
    let config = CaptureConfig::default();
    logging::init_from_config(&config).unwrap();

    // A second installation is tolerated, whatever the format.
    logging::init("debug", LogFormat::Json).unwrap();
    tracing::info!("logging initialized twice");
}

#[test]
fn test_invalid_level_is_rejected() {
    let mut config = CaptureConfig::default();
    config.application.log_level = "loud".to_string();
    assert!(logging::init_from_config(&config).is_err());
}
