//! Integration tests for frame dispatch in continuous and triggered mode.

mod common;

use anyhow::bail;
use camera_capture::capture::{CaptureState, Continuous, Triggered};
use camera_capture::driver::mock::{pattern_sample, MockDriver};
use camera_capture::driver::{
    status, CameraDriver, CameraHandle, CaptureErrorKind, ColorMode, DriverEvent,
    TriggerMode,
};
use camera_capture::image::{PixelFormat, RGB12_TO_16_SCALE};
use camera_capture::ImageView;
use common::{builder, fast_mock, wait_until};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Continuous mode
// =============================================================================

#[test]
fn test_continuous_capture_delivers_frames() {
    let mock = fast_mock();
    let device = builder(&mock).open().unwrap();
    device.set_fps(100.0).unwrap();

    let frames = Arc::new(Mutex::new(Vec::new()));
    let frames_in_callback = frames.clone();
    let mut session = device
        .capture::<Continuous, _>(move |image, meta| {
            assert_eq!((image.width(), image.height()), (64, 48));
            frames_in_callback.lock().unwrap().push(meta.frame_number);
            Ok(())
        })
        .unwrap();

    assert_eq!(session.state(), CaptureState::Capturing);
    assert!(mock.is_live());
    assert_eq!(mock.trigger_mode(), TriggerMode::Software);
    assert!(wait_until(|| frames.lock().unwrap().len() >= 5));

    session.stop();
    assert_eq!(session.state(), CaptureState::Stopped);
    assert!(!mock.is_live());
    assert_eq!(mock.trigger_mode(), TriggerMode::Off);
    assert_eq!(mock.locked_buffers(), 0);

    let stats = session.stats();
    assert!(stats.frames_dispatched >= 5);
    assert_eq!(stats.frames_dispatched, stats.frames_completed);
    assert_eq!(stats.callback_failures, 0);
}

#[test]
fn test_stop_is_idempotent() {
    let mock = fast_mock();
    let device = builder(&mock).open().unwrap();
    let mut session = device.capture::<Continuous, _>(|_, _| Ok(())).unwrap();

    session.stop();
    let calls = mock.call_count("stop_live_video");
    session.stop();
    drop(session);
    assert_eq!(mock.call_count("stop_live_video"), calls);
}

// =============================================================================
// Triggered mode
// =============================================================================

#[test]
fn test_triggered_capture_one_frame_per_trigger() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    let frames = Arc::new(Mutex::new(Vec::new()));
    let frames_in_callback = frames.clone();
    let session = device
        .capture::<Triggered, _>(move |_, meta| {
            frames_in_callback.lock().unwrap().push(meta);
            Ok(())
        })
        .unwrap();
    assert!(!mock.is_live());

    for n in 1..=3 {
        session.trigger(true).unwrap();
        assert!(wait_until(|| frames.lock().unwrap().len() == n));
    }
    drop(session);

    let frames = frames.lock().unwrap();
    let numbers: Vec<u64> = frames.iter().map(|m| m.frame_number).collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    assert!(frames[1].device_timestamp > frames[0].device_timestamp);
    assert!(frames[0].timestamp <= frames[2].timestamp);
    assert_eq!(mock.frames_emitted(), 3);
    assert_eq!(mock.locked_buffers(), 0);
}

#[test]
fn test_sessions_can_restart() {
    let mock = fast_mock();
    let device = builder(&mock).open().unwrap();

    let session = device.capture::<Continuous, _>(|_, _| Ok(())).unwrap();
    drop(session);

    // The terminate event is manual-reset; a second session must not see it.
    let count = Arc::new(AtomicU64::new(0));
    let count_in_callback = count.clone();
    let session = device
        .capture::<Triggered, _>(move |_, _| {
            count_in_callback.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    session.trigger(true).unwrap();
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));
}

// =============================================================================
// Image contents
// =============================================================================

#[test]
fn test_mono8_view_matches_driver_memory() {
    let mock = MockDriver::new();
    let device = builder(&mock)
        .pixel_format(PixelFormat::Mono8)
        .open()
        .unwrap();

    let checked = Arc::new(AtomicBool::new(false));
    let checked_in_callback = checked.clone();
    let session = device
        .capture::<Triggered, _>(move |image, meta| {
            let format = image.format();
            let ImageView::Mono8(buffer) = image else {
                bail!("expected Mono8, got {format}");
            };
            assert_eq!(buffer.channels(), 1);
            assert_eq!(buffer.as_slice().len(), 64 * 48);
            for (index, sample) in buffer.as_slice().iter().enumerate() {
                let expected = pattern_sample(ColorMode::Mono8, index, meta.frame_number);
                assert_eq!(u16::from(*sample), expected, "sample {index}");
            }
            checked_in_callback.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    session.trigger(true).unwrap();
    assert!(wait_until(|| checked.load(Ordering::SeqCst)));
    session.wait_idle();
    assert_eq!(session.stats().callback_failures, 0);
}

#[test]
fn test_rgb16_view_is_depth_corrected() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    assert_eq!(device.pixel_format(), PixelFormat::Rgb16);

    let checked = Arc::new(AtomicBool::new(false));
    let checked_in_callback = checked.clone();
    let session = device
        .capture::<Triggered, _>(move |image, meta| {
            let format = image.format();
            let ImageView::Rgb16(buffer) = image else {
                bail!("expected Rgb16, got {format}");
            };
            assert_eq!(buffer.channels(), 3);
            assert_eq!(buffer.pixel(1, 0).map(<[u16]>::len), Some(3));
            for (index, sample) in buffer.as_slice().iter().enumerate().take(4096) {
                let raw = pattern_sample(ColorMode::Rgb12Unpacked, index, meta.frame_number);
                assert_eq!(*sample, raw * RGB12_TO_16_SCALE, "sample {index}");
            }
            checked_in_callback.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    session.trigger(true).unwrap();
    assert!(wait_until(|| checked.load(Ordering::SeqCst)));
}

// =============================================================================
// Failure handling and back-pressure
// =============================================================================

#[test]
fn test_buffer_exhaustion_counts_out_of_buffers() {
    let mock = MockDriver::new();
    let device = builder(&mock).concurrency(2).open().unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let release_in_callback = release.clone();
    let session = device
        .capture::<Triggered, _>(move |_, _| {
            while !release_in_callback.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();

    // Both buffers end up held by blocked callbacks.
    session.trigger(true).unwrap();
    assert!(wait_until(|| mock.locked_buffers() == 1));
    session.trigger(true).unwrap();
    assert!(wait_until(|| mock.locked_buffers() == 2));
    assert_eq!(session.pending_frames(), 2);

    // No free buffer: the driver drops every further frame and reports each.
    for _ in 0..2 {
        session.trigger(true).unwrap();
    }
    assert!(wait_until(|| {
        device.error_stats().count(CaptureErrorKind::DrvOutOfBuffers) == 2
    }));
    assert_eq!(mock.locked_buffers(), 2);

    release.store(true, Ordering::SeqCst);
    session.wait_idle();
    assert!(wait_until(|| mock.locked_buffers() == 0));
    assert_eq!(session.stats().frames_dispatched, 2);
}

#[test]
fn test_repeated_frame_event_does_not_redispatch_held_buffer() {
    let mock = MockDriver::new();
    let device = builder(&mock).concurrency(3).open().unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (release_in_callback, seen_in_callback) = (release.clone(), seen.clone());
    let session = device
        .capture::<Triggered, _>(move |image, meta| {
            let format = image.format();
            let ImageView::Rgb16(buffer) = image else {
                bail!("expected Rgb16, got {format}");
            };
            seen_in_callback
                .lock()
                .unwrap()
                .push((meta.buffer, meta.frame_number, buffer.as_slice()[1]));
            while !release_in_callback.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .unwrap();

    session.trigger(true).unwrap();
    assert!(wait_until(|| seen.lock().unwrap().len() == 1));

    // A second wake-up while the only completed frame is still in a callback.
    mock.event_set(CameraHandle(1), DriverEvent::FrameReady).unwrap();
    assert!(wait_until(|| session.stats().frames_dropped == 1));

    release.store(true, Ordering::SeqCst);
    session.wait_idle();
    assert!(wait_until(|| mock.locked_buffers() == 0));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let raw = pattern_sample(ColorMode::Rgb12Unpacked, 1, seen[0].1);
    assert_eq!(seen[0].2, raw * RGB12_TO_16_SCALE);
    assert_eq!(session.stats().frames_dispatched, 1);
}

#[test]
fn test_callback_failures_release_buffers() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    let seen = Arc::new(AtomicU64::new(0));
    let seen_in_callback = seen.clone();
    let session = device
        .capture::<Triggered, _>(move |_, meta| {
            seen_in_callback.fetch_add(1, Ordering::SeqCst);
            match meta.frame_number {
                0 => bail!("rejected frame {}", meta.frame_number),
                1 => panic!("callback panic"),
                _ => Ok(()),
            }
        })
        .unwrap();

    for n in 1..=4 {
        session.trigger(true).unwrap();
        assert!(wait_until(|| session.stats().frames_completed == n));
    }

    assert_eq!(seen.load(Ordering::SeqCst), 4);
    let stats = session.stats();
    assert_eq!(stats.callback_failures, 2);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(mock.locked_buffers(), 0);
}

#[test]
fn test_metadata_failure_unlocks_buffer() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    let delivered_in_callback = delivered.clone();
    let session = device
        .capture::<Triggered, _>(move |_, _| {
            delivered_in_callback.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    mock.fail_next("image_info", status::NO_SUCCESS, 1);
    session.trigger(true).unwrap();
    assert!(wait_until(|| session.stats().frames_dropped == 1));
    assert_eq!(mock.locked_buffers(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);

    session.trigger(true).unwrap();
    assert!(wait_until(|| delivered.load(Ordering::SeqCst) == 1));
}

#[test]
fn test_workers_match_allocated_buffers() {
    let mock = MockDriver::new();
    mock.fail_next("alloc_image_mem", status::OUT_OF_MEMORY, 1);
    let device = builder(&mock).concurrency(3).open().unwrap();
    assert_eq!(device.buffer_count(), 2);

    let session = device.capture::<Triggered, _>(|_, _| Ok(())).unwrap();
    assert_eq!(session.worker_count(), 2);
}

#[test]
fn test_start_failure_stops_threads() {
    let mock = MockDriver::new();
    let device = builder(&mock).open().unwrap();
    mock.fail_next("capture_video", status::NO_SUCCESS, 1);

    let err = device
        .capture::<Continuous, _>(|_, _| Ok(()))
        .unwrap_err();
    assert_eq!(err.driver_code(), Some(status::NO_SUCCESS));
    assert_eq!(mock.trigger_mode(), TriggerMode::Off);

    // The device is still usable.
    let session = device.capture::<Triggered, _>(|_, _| Ok(())).unwrap();
    session.trigger(true).unwrap();
    assert!(wait_until(|| session.stats().frames_completed == 1));
}
