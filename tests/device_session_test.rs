//! Integration tests for opening, configuring and closing a device session
//! against the mock driver.

mod common;

use camera_capture::device::{DeviceState, UploadState, WhiteBalance};
use camera_capture::discovery::list_cameras;
use camera_capture::driver::mock::{MockConfig, MockDriver, PixelClockMode};
use camera_capture::driver::{
    status, AwbSupport, AwbType, CaptureErrorKind, ColorMode, PixelClockRange,
};
use camera_capture::image::PixelFormat;
use camera_capture::retry::RetryPolicy;
use camera_capture::CaptureError;
use common::{builder, position, wait_until};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Open and teardown
// =============================================================================

#[test]
fn test_open_sets_up_device() {
    let mock = MockDriver::new();
    let device = builder(&mock).concurrency(3).open().unwrap();

    assert_eq!(device.state(), DeviceState::Open);
    assert_eq!(device.buffer_count(), 3);
    assert_eq!(device.resolution(), (64, 48));
    assert!(mock.is_open());
    assert_eq!(mock.allocated_buffers(), 3);
    assert_eq!(mock.sequence_len(), 3);
    assert_eq!(mock.registered_events(), 4);
    assert_eq!(mock.color_mode(), ColorMode::Rgb12Unpacked);
    assert!(mock.auto_exposure_enabled());
    assert!(mock.awb_enabled());
    assert_eq!(mock.awb_type(), Some(AwbType::ColorTemperature));

    let calls = mock.calls();
    let order = [
        "init_camera",
        "reset_to_default",
        "sensor_info",
        "set_color_mode",
        "alloc_image_mem",
        "set_capture_to_memory",
        "event_init",
        "event_enable",
        "aes_set_enabled",
        "awb_set_type",
    ];
    for pair in order.windows(2) {
        assert!(
            position(&calls, pair[0]) < position(&calls, pair[1]),
            "{} should come before {}",
            pair[0],
            pair[1]
        );
    }

    // Camera shows as in use while open.
    assert!(!list_cameras(&mock).unwrap()[0].available);

    drop(device);
    assert!(!mock.is_open());
    assert_eq!(mock.allocated_buffers(), 0);
    assert_eq!(mock.registered_events(), 0);
    assert!(list_cameras(&mock).unwrap()[0].available);
}

#[test]
fn test_teardown_order() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.clear_calls();

    device.close().unwrap();

    let calls = mock.calls();
    assert!(position(&calls, "event_set") < position(&calls, "event_disable"));
    assert!(position(&calls, "event_disable") < position(&calls, "event_exit"));
    assert!(position(&calls, "event_exit") < position(&calls, "free_image_mem"));
    assert!(position(&calls, "free_image_mem") < position(&calls, "exit_camera"));
    assert_eq!(mock.call_count("exit_camera"), 1);
}

#[test]
fn test_mono_format_disables_auto_white_balance() {
    let mock = MockDriver::new();
    let device = builder(&mock)
        .pixel_format(PixelFormat::Mono8)
        .open()
        .unwrap();

    assert_eq!(device.pixel_format(), PixelFormat::Mono8);
    assert_eq!(mock.color_mode(), ColorMode::Mono8);
    assert!(!mock.awb_enabled());
}

#[test]
fn test_open_failure_is_reported() {
    let mock = MockDriver::new();
    mock.fail_next("init_camera", status::CANT_OPEN_DEVICE, 1);

    let err = builder(&mock).open().unwrap_err();
    assert_eq!(err.driver_code(), Some(status::CANT_OPEN_DEVICE));
    assert!(err
        .to_string()
        .contains("opening camera with device id 1 failed"));
    assert!(!mock.is_open());
}

#[test]
fn test_setup_failure_tears_down() {
    let mock = MockDriver::new();
    mock.fail_always("awb_set_type", status::NO_SUCCESS);

    let err = builder(&mock).open().unwrap_err();
    assert_eq!(err.driver_code(), Some(status::NO_SUCCESS));

    // The observer was running; it must have been stopped and everything freed.
    assert!(!mock.is_open());
    assert_eq!(mock.allocated_buffers(), 0);
    assert_eq!(mock.registered_events(), 0);
    assert_eq!(mock.call_count("exit_camera"), 1);
}

#[test]
fn test_no_buffers_fails_open() {
    let mock = MockDriver::new();
    mock.fail_always("alloc_image_mem", status::OUT_OF_MEMORY);

    let err = builder(&mock).open().unwrap_err();
    assert!(matches!(err, CaptureError::NoBuffers));
    assert!(!mock.is_open());
    // Events were never registered, so there was no observer to stop.
    assert_eq!(mock.call_count("event_set"), 0);
}

#[test]
fn test_close_gives_up_after_policy() {
    let mock = MockDriver::new();
    let device = builder(&mock)
        .retry(camera_capture::retry::RetryPolicies {
            close: RetryPolicy::bounded(2, Duration::from_millis(1)),
            ..common::quick_retries()
        })
        .open()
        .unwrap();
    mock.fail_always("exit_camera", status::NO_SUCCESS);

    assert!(device.close().is_err());
    assert_eq!(mock.call_count("exit_camera"), 2);
}

#[test]
fn test_terminate_signal_is_retried() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.fail_next("event_set", status::NO_SUCCESS, 3);

    // Would hang on join if the observer never saw the terminate event.
    drop(device);
    assert_eq!(mock.call_count("event_set"), 4);
    assert!(!mock.is_open());
}

#[tokio::test]
async fn test_open_async() {
    let mock = MockDriver::new();
    let device = builder(&mock).open_async().await.unwrap();
    assert_eq!(device.state(), DeviceState::Open);
    assert!(mock.is_open());
}

// =============================================================================
// Starter firmware upload
// =============================================================================

#[test]
fn test_firmware_upload_then_open() {
    let mock = MockDriver::with_config(MockConfig {
        needs_firmware_upload: true,
        ..Default::default()
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();

    let device = builder(&mock)
        .on_firmware_upload(move |_camera, estimate, progress| {
            let outcome = progress.wait_timeout(estimate);
            seen_in_handler.lock().unwrap().push((estimate, outcome));
        })
        .open()
        .unwrap();

    assert!(mock.is_open());
    assert_eq!(mock.call_count("init_camera"), 2);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, Duration::from_millis(1020));
    assert_eq!(seen[0].1, UploadState::Complete);
    drop(device);
}

#[test]
fn test_firmware_upload_recovers_after_pairing_failure() {
    let mock = MockDriver::with_config(MockConfig {
        needs_firmware_upload: true,
        upload_failures: vec![status::DEVICE_ALREADY_PAIRED],
        ..Default::default()
    });

    let device = builder(&mock).open().unwrap();
    // plain, upload (fails), plain, upload (succeeds)
    assert_eq!(mock.call_count("init_camera"), 4);
    // The failed pairing attempt closes the handle before retrying.
    assert!(mock.call_count("exit_camera") >= 1);
    drop(device);
}

#[test]
fn test_firmware_upload_retries_exhausted() {
    let mock = MockDriver::with_config(MockConfig {
        needs_firmware_upload: true,
        upload_failures: vec![status::CANT_OPEN_DEVICE; 5],
        ..Default::default()
    });
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let outcomes_in_handler = outcomes.clone();

    let err = builder(&mock)
        .on_firmware_upload(move |_camera, _estimate, progress| {
            let outcome = progress.wait_timeout(Duration::from_secs(5));
            outcomes_in_handler.lock().unwrap().push(outcome);
        })
        .open()
        .unwrap_err();

    assert!(matches!(
        err,
        CaptureError::FirmwareUploadRetriesExhausted { attempts: 3 }
    ));
    assert_eq!(mock.call_count("init_camera"), 6);
    assert_eq!(mock.call_count("exit_camera"), 3);
    assert_eq!(*outcomes.lock().unwrap(), vec![UploadState::Failure; 3]);
    assert!(!mock.is_open());
}

#[test]
fn test_firmware_duration_failure_is_fatal() {
    let mock = MockDriver::with_config(MockConfig {
        needs_firmware_upload: true,
        ..Default::default()
    });
    mock.fail_next("firmware_upload_duration", status::NO_SUCCESS, 1);

    let err = builder(&mock).open().unwrap_err();
    assert!(err
        .to_string()
        .contains("could not request info for starter firmware upload"));
    assert_eq!(mock.call_count("init_camera"), 1);
}

// =============================================================================
// Frame rate
// =============================================================================

#[test]
fn test_set_fps_raises_pixel_clock() {
    // 20 MHz supports 7.5 fps; 30 MHz supports 11.25 fps.
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    let actual = device.set_fps(10.0).unwrap();
    assert_eq!(actual, 10.0);
    assert_eq!(mock.current_pixel_clock(), 30);
    assert_eq!(mock.frame_rate(), 10.0);
}

#[test]
fn test_set_fps_keeps_clock_when_fast_enough() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    assert_eq!(device.set_fps(5.0).unwrap(), 5.0);
    assert_eq!(mock.current_pixel_clock(), 20);
    assert_eq!(mock.call_count("set_pixel_clock"), 0);
}

#[test]
fn test_set_fps_caps_at_fastest_clock() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    let actual = device.set_fps(100.0).unwrap();
    assert_eq!(mock.current_pixel_clock(), 40);
    assert!((actual - 15.0).abs() < 1e-6);
}

#[test]
fn test_set_fps_with_clock_range() {
    let mock = MockDriver::with_config(MockConfig {
        pixel_clocks: PixelClockMode::Range(PixelClockRange {
            min: 10,
            max: 50,
            increment: 5,
        }),
        ..Default::default()
    });
    let device = builder(&mock).open().unwrap();

    // 10 fps needs at least 26.7 MHz; the walk stops at the first step above.
    device.set_fps(10.0).unwrap();
    assert_eq!(mock.current_pixel_clock(), 30);
    assert_eq!(mock.call_count("pixel_clock_list"), 0);
}

#[test]
fn test_set_fps_falls_back_to_clock_list() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.fail_always("pixel_clock_range", status::NOT_SUPPORTED);

    assert_eq!(device.set_fps(10.0).unwrap(), 10.0);
    assert_eq!(mock.current_pixel_clock(), 30);
    assert_eq!(mock.call_count("pixel_clock_list"), 1);
}

#[test]
fn test_pixel_clock_query_failure() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.fail_always("pixel_clock_range", status::NOT_SUPPORTED);
    mock.fail_always("pixel_clock_count", status::NOT_SUPPORTED);

    let err = device.set_fps(10.0).unwrap_err();
    assert!(matches!(err, CaptureError::PixelClockQuery));
    assert_eq!(mock.current_pixel_clock(), 20);
}

// =============================================================================
// White balance
// =============================================================================

#[test]
fn test_white_balance_presets() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    assert!(mock.awb_enabled());

    device.set_white_balance(WhiteBalance::Sunlight).unwrap();
    assert!(!mock.awb_enabled());
    assert_eq!(mock.color_temperature(), 5650);

    device.set_white_balance(WhiteBalance::Auto).unwrap();
    assert!(mock.awb_enabled());
}

#[test]
fn test_white_balance_kelvin_is_clamped() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    assert_eq!(device.set_white_balance_kelvin(20_000).unwrap(), 10_000);
    assert_eq!(mock.color_temperature(), 10_000);
    assert_eq!(device.set_white_balance_kelvin(1_000).unwrap(), 2_200);

    // Without a range, the value goes through unchanged.
    mock.fail_next("color_temperature_range", status::NOT_SUPPORTED, 1);
    assert_eq!(device.set_white_balance_kelvin(9_000).unwrap(), 9_000);
}

#[test]
fn test_auto_white_balance_falls_back_to_grey_world() {
    let mock = MockDriver::with_config(MockConfig {
        awb: AwbSupport {
            color_temperature: false,
            grey_world: true,
        },
        ..Default::default()
    });
    let _device = builder(&mock).open().unwrap();
    assert_eq!(mock.awb_type(), Some(AwbType::GreyWorld));
}

#[test]
fn test_no_auto_white_balance_fails_open() {
    let mock = MockDriver::with_config(MockConfig {
        awb: AwbSupport {
            color_temperature: false,
            grey_world: false,
        },
        ..Default::default()
    });
    let err = builder(&mock).open().unwrap_err();
    assert!(matches!(err, CaptureError::UnsupportedWhiteBalance));
    assert!(!mock.is_open());
}

// =============================================================================
// Capture error statistics
// =============================================================================

#[test]
fn test_capture_errors_reach_stats_and_callback() {
    let mock = MockDriver::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in_callback = events.clone();
    let device = builder(&mock)
        .on_capture_error(move |event| events_in_callback.lock().unwrap().push(event.clone()))
        .open()
        .unwrap();

    mock.raise_capture_error(CaptureErrorKind::DevTimeout, 2);
    assert!(wait_until(|| device.error_stats().count(CaptureErrorKind::DevTimeout) == 2));

    mock.raise_capture_error(CaptureErrorKind::DevTimeout, 3);
    mock.raise_capture_error(CaptureErrorKind::UsbTransferFailed, 1);
    assert!(wait_until(|| device.error_stats().total() == 6));

    let stats = device.error_stats();
    assert_eq!(stats.count(CaptureErrorKind::DevTimeout), 5);
    assert_eq!(stats.count(CaptureErrorKind::UsbTransferFailed), 1);

    // The last two raises may be observed together or separately.
    let reported = |kind: CaptureErrorKind| -> u64 {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| u64::from(e.new_events))
            .sum()
    };
    assert!(wait_until(|| reported(CaptureErrorKind::DevTimeout) == 5
        && reported(CaptureErrorKind::UsbTransferFailed) == 1));

    let events = events.lock().unwrap();
    assert_eq!(events[0].kind, CaptureErrorKind::DevTimeout);
    assert_eq!(events[0].new_events, 2);
    assert_eq!(events[0].total, 2);
}

#[test]
fn test_reset_error_stats() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    mock.raise_capture_error(CaptureErrorKind::DevMissedImages, 4);
    assert!(wait_until(|| device.error_stats().total() == 4));

    device.reset_error_stats().unwrap();
    assert!(device.error_stats().is_empty());

    // Driver counters restarted too, so a new error counts once.
    mock.raise_capture_error(CaptureErrorKind::DevMissedImages, 1);
    assert!(wait_until(|| device.error_stats().total() == 1));
}

#[test]
fn test_last_error() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.set_last_error(status::TIMED_OUT, "transfer timed out");

    assert_eq!(
        device.last_error().unwrap(),
        (status::TIMED_OUT, "transfer timed out".to_string())
    );
}
