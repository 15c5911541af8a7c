//! Shared helpers for the integration tests

#![allow(dead_code)]

use camera_capture::device::{DeviceSession, DeviceSessionBuilder};
use camera_capture::discovery::list_cameras;
use camera_capture::driver::mock::{MockConfig, MockDriver};
use camera_capture::retry::{RetryPolicies, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generous upper bound for anything the pipeline does asynchronously.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Mock whose sensor can run at 100 fps on the initial pixel clock.
pub fn fast_mock() -> MockDriver {
    MockDriver::with_config(MockConfig {
        fps_per_mhz: 5.0,
        ..Default::default()
    })
}

/// Retry policies with 1 ms backoff so failure paths run quickly.
pub fn quick_retries() -> RetryPolicies {
    RetryPolicies {
        firmware_upload: RetryPolicy::bounded(3, Duration::from_millis(1)),
        close: RetryPolicy::bounded(3, Duration::from_millis(1)),
        signal: RetryPolicy::unbounded(Duration::from_millis(1)),
    }
}

/// Builder for the first camera of `driver`.
pub fn builder(driver: &MockDriver) -> DeviceSessionBuilder {
    let camera = list_cameras(driver).unwrap().remove(0);
    DeviceSession::builder(Arc::new(driver.clone()), camera).retry(quick_retries())
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    true
}

/// Index of the first call named `name`.
pub fn position(calls: &[&'static str], name: &str) -> usize {
    calls
        .iter()
        .position(|call| *call == name)
        .unwrap_or_else(|| panic!("{name} was never called"))
}
