//! Capture sessions: frame dispatch from the driver to user callbacks.
//!
//! A [`CaptureSession`] runs one dispatcher thread plus a [`WorkerPool`] with
//! one worker per allocated image buffer. Per completed frame:
//!
//! 1. the dispatcher wakes on the frame-ready event and looks up the most
//!    recently completed buffer; a buffer already held by a task is skipped
//! 2. the buffer is locked so the driver cannot overwrite it
//! 3. metadata is read and the host timestamp converted to UTC
//! 4. a task is queued that builds an [`ImageView`], calls the user callback
//!    and unlocks the buffer whatever the callback did
//!
//! At most `concurrency` callbacks run at once. When all buffers are locked the
//! driver drops frames and counts them as `DRV_OUT_OF_BUFFERS`, which shows up
//! in the device's error statistics.
//!
//! # Modes
//!
//! The mode is part of the type. [`Continuous`] starts free-running video
//! right away. [`Triggered`] waits for [`CaptureSession::trigger`], which only
//! exists for triggered sessions:
//!
//! ```compile_fail
//! use camera_capture::capture::{CaptureSession, Continuous};
//!
//! fn fire(session: &CaptureSession<'_, Continuous>) {
//!     session.trigger(false).ok();
//! }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use camera_capture::capture::Triggered;
//! use camera_capture::device::DeviceSession;
//! use camera_capture::discovery::list_cameras;
//! use camera_capture::driver::mock::MockDriver;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Arc::new(MockDriver::new());
//! let camera = list_cameras(&*driver)?.remove(0);
//! let device = DeviceSession::builder(driver, camera).open()?;
//!
//! let session = device.capture::<Triggered, _>(|image, meta| {
//!     println!("frame {} {}x{}", meta.frame_number, image.width(), image.height());
//!     Ok(())
//! })?;
//! session.trigger(true)?;
//! # Ok(())
//! # }
//! ```

use crate::device::{DeviceSession, DeviceShared};
use crate::driver::{BufferAddress, BufferId, DriverEvent, SystemTimestamp, TriggerMode};
use crate::error::{AppResult, CaptureError};
use crate::image::ImageView;
use capture_pool::WorkerPool;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// User frame callback. Runs on a worker thread; the view is only valid for
/// the duration of the call.
pub type FrameCallback = Arc<dyn Fn(ImageView<'_>, FrameMeta) -> anyhow::Result<()> + Send + Sync>;

mod sealed {
    pub trait Sealed {}
}

/// Capture mode marker.
pub trait CaptureMode: sealed::Sealed + Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;
    /// Start free-running video when the session starts.
    const FREE_RUNNING: bool;
}

/// Free-running video.
#[derive(Debug)]
pub enum Continuous {}

/// One frame per software trigger.
#[derive(Debug)]
pub enum Triggered {}

impl sealed::Sealed for Continuous {}
impl sealed::Sealed for Triggered {}

impl CaptureMode for Continuous {
    const NAME: &'static str = "continuous";
    const FREE_RUNNING: bool = true;
}

impl CaptureMode for Triggered {
    const NAME: &'static str = "triggered";
    const FREE_RUNNING: bool = false;
}

/// Metadata delivered with each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMeta {
    /// Device timestamp in 0.1 µs ticks.
    pub device_timestamp: u64,
    /// Driver frame counter.
    pub frame_number: u64,
    /// Host arrival time.
    pub timestamp: DateTime<Utc>,
    /// Buffer holding the frame.
    pub buffer: BufferId,
}

/// Lifecycle of a capture session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    /// Dispatcher running.
    Capturing,
    /// Shutting down.
    Stopping,
    /// All threads joined and tasks drained.
    Stopped,
}

/// Frame accounting of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames handed to a worker.
    pub frames_dispatched: u64,
    /// Frames discarded by the dispatcher.
    pub frames_dropped: u64,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: u64,
    /// Callbacks that finished, successfully or not.
    pub frames_completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
    completed: AtomicU64,
    /// Buffers locked by the dispatcher and not yet unlocked.
    held: Mutex<HashSet<BufferId>>,
}

impl Counters {
    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_dispatched: self.dispatched.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            callback_failures: self.failures.load(Ordering::Relaxed),
            frames_completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Running acquisition on a [`DeviceSession`].
///
/// Borrows the device, so the device outlives every frame callback. Stopped
/// on drop.
pub struct CaptureSession<'dev, M: CaptureMode> {
    device: &'dev DeviceSession,
    pool: Arc<WorkerPool>,
    dispatcher: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    state: CaptureState,
    _mode: PhantomData<M>,
}

impl<'dev, M: CaptureMode> CaptureSession<'dev, M> {
    pub(crate) fn start(device: &'dev DeviceSession, callback: FrameCallback) -> AppResult<Self> {
        let shared = device.shared().clone();
        let device_id = shared.camera.device_id;

        // A frame holds its buffer for the whole task; extra workers would idle.
        let pool = Arc::new(WorkerPool::new(
            format!("cam{device_id}-worker"),
            device.buffer_count(),
        )?);
        let counters = Arc::new(Counters::default());

        let dispatcher = {
            let shared = shared.clone();
            let pool = pool.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name(format!("cam{device_id}-dispatch"))
                .spawn(move || run_dispatcher(shared, pool, counters, callback))?
        };

        // From here on, dropping `session` on error stops everything again.
        let session = Self {
            device,
            pool,
            dispatcher: Some(dispatcher),
            counters,
            state: CaptureState::Capturing,
            _mode: PhantomData,
        };

        let api = shared.api();
        let handle = shared.handle;
        api.call("set_external_trigger", |d| {
            d.set_external_trigger(handle, TriggerMode::Software)
        })?;
        if M::FREE_RUNNING {
            api.call("capture_video", |d| d.capture_video(handle, false))?;
        }

        info!(
            camera = %shared.label,
            mode = M::NAME,
            workers = session.pool.thread_count(),
            "Capture started"
        );
        Ok(session)
    }

    /// Current state.
    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Frame accounting so far.
    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// Worker threads, one per allocated buffer.
    pub fn worker_count(&self) -> usize {
        self.pool.thread_count()
    }

    /// Callbacks queued or running.
    pub fn pending_frames(&self) -> usize {
        self.pool.queued() + self.pool.in_flight()
    }

    /// Block until every dispatched frame has been handled.
    pub fn wait_idle(&self) {
        self.pool.wait_for_tasks();
    }

    /// Stop acquisition, join the dispatcher and drain pending callbacks.
    ///
    /// Safe to call more than once. Driver failures during stop are logged,
    /// not returned.
    pub fn stop(&mut self) {
        if self.state == CaptureState::Stopped {
            return;
        }
        self.state = CaptureState::Stopping;

        let shared = self.device.shared();
        let api = shared.api();
        let handle = shared.handle;

        let _ = api.call("force_trigger", |d| d.force_trigger(handle));
        let _ = api.call("set_external_trigger", |d| {
            d.set_external_trigger(handle, TriggerMode::Off)
        });
        if let Ok(mode) = api.call("trigger_status", |d| d.trigger_status(handle)) {
            debug!(camera = %shared.label, ?mode, "Trigger mode after stop");
        }
        let _ = api.call("stop_live_video", |d| d.stop_live_video(handle, true));

        shared.signal_event(DriverEvent::TerminateCaptureThreads);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                error!(camera = %shared.label, "Frame dispatcher panicked");
            }
        }
        self.pool.wait_for_tasks();
        // Manual-reset event; a later session must not see it signalled.
        shared.reset_event(DriverEvent::TerminateCaptureThreads);

        self.state = CaptureState::Stopped;
        let stats = self.stats();
        info!(
            camera = %shared.label,
            mode = M::NAME,
            dispatched = stats.frames_dispatched,
            dropped = stats.frames_dropped,
            failures = stats.callback_failures,
            "Capture stopped"
        );
    }
}

impl CaptureSession<'_, Triggered> {
    /// Request one frame.
    ///
    /// With `wait` the call returns after the frame is in memory; otherwise
    /// triggers may be pipelined, up to one per buffer in flight.
    pub fn trigger(&self, wait: bool) -> AppResult<()> {
        let shared = self.device.shared();
        let handle = shared.handle;
        shared
            .api()
            .call("freeze_video", |d| d.freeze_video(handle, wait))
    }
}

impl<M: CaptureMode> Drop for CaptureSession<'_, M> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<M: CaptureMode> std::fmt::Debug for CaptureSession<'_, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("camera", &self.device.shared().label)
            .field("mode", &M::NAME)
            .field("state", &self.state)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Convert the driver's broken-down local time to UTC.
pub fn system_time_to_utc(time: &SystemTimestamp) -> AppResult<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(
        i32::from(time.year),
        u32::from(time.month),
        u32::from(time.day),
    )
    .and_then(|date| {
        date.and_hms_milli_opt(
            u32::from(time.hour),
            u32::from(time.minute),
            u32::from(time.second),
            u32::from(time.millisecond),
        )
    })
    .ok_or_else(|| CaptureError::InvalidTimestamp(format!("{time:?}")))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| CaptureError::InvalidTimestamp(format!("{naive} does not exist locally")))
}

fn run_dispatcher(
    shared: Arc<DeviceShared>,
    pool: Arc<WorkerPool>,
    counters: Arc<Counters>,
    callback: FrameCallback,
) {
    let api = shared.api();
    let handle = shared.handle;
    let events = [DriverEvent::FrameReady, DriverEvent::TerminateCaptureThreads];
    debug!(camera = %shared.label, "Frame dispatcher started");

    loop {
        match api.call("event_wait", |d| d.event_wait(handle, &events, None)) {
            Ok(DriverEvent::TerminateCaptureThreads) => break,
            Ok(DriverEvent::FrameReady) => {
                if let Err(e) = dispatch_frame(&shared, &pool, &counters, &callback) {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(camera = %shared.label, error = %e, "Dropping frame");
                }
            }
            Ok(other) => debug!(camera = %shared.label, ?other, "Ignoring unexpected event"),
            Err(_) => thread::sleep(shared.retry.signal.backoff_delay),
        }
    }

    debug!(camera = %shared.label, "Frame dispatcher stopped");
}

fn dispatch_frame(
    shared: &Arc<DeviceShared>,
    pool: &WorkerPool,
    counters: &Arc<Counters>,
    callback: &FrameCallback,
) -> AppResult<()> {
    let api = shared.api();
    let handle = shared.handle;

    let active = api.call("active_sequence_buffer", |d| d.active_sequence_buffer(handle))?;
    let address = active.last;
    let id = shared.pool.read().id_of(address)?;

    // Spurious or coalesced events can point at a frame a task still owns.
    if !counters.held.lock().insert(id) {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(camera = %shared.label, buffer = id.0, "Buffer already in flight");
        return Ok(());
    }

    if let Err(e) = api.call("lock_seq_buf", |d| d.lock_seq_buf(handle, id, address)) {
        counters.held.lock().remove(&id);
        return Err(e);
    }

    // Locked from here on; every failure path must unlock.
    let meta = api
        .call("image_info", |d| d.image_info(handle, id))
        .and_then(|info| {
            Ok(FrameMeta {
                device_timestamp: info.device_timestamp,
                frame_number: info.frame_number,
                timestamp: system_time_to_utc(&info.system_time)?,
                buffer: id,
            })
        });
    let meta = match meta {
        Ok(meta) => meta,
        Err(e) => {
            unlock(shared, counters, id, address);
            return Err(e);
        }
    };

    counters.dispatched.fetch_add(1, Ordering::Relaxed);
    let shared = shared.clone();
    let counters = counters.clone();
    let callback = callback.clone();
    pool.execute(move || process_frame(&shared, &counters, &callback, id, address, meta));
    Ok(())
}

fn process_frame(
    shared: &DeviceShared,
    counters: &Counters,
    callback: &FrameCallback,
    id: BufferId,
    address: BufferAddress,
    meta: FrameMeta,
) {
    let buffer_len = shared.pool.read().buffer_len();
    let (width, height) = (shared.sensor.max_width, shared.sensor.max_height);

    // SAFETY: the buffer stays locked until `unlock` below, so the driver does
    // not write to it, and the dispatcher's held set keeps it out of every
    // other task. The pool memory is freed only at device teardown, which
    // cannot start while this capture session borrows the device and waits
    // for its tasks.
    #[allow(unsafe_code)]
    let view = unsafe {
        ImageView::from_raw(
            shared.pixel_format,
            address.as_ptr(),
            buffer_len,
            width,
            height,
        )
    };

    let outcome = view.and_then(|mut view| {
        view.apply_depth_correction();
        match catch_unwind(AssertUnwindSafe(|| callback(view, meta))) {
            Ok(result) => result.map_err(|e| CaptureError::Callback(format!("{e:#}"))),
            Err(_) => Err(CaptureError::Callback("callback panicked".to_string())),
        }
    });

    if let Err(e) = outcome {
        counters.failures.fetch_add(1, Ordering::Relaxed);
        error!(
            camera = %shared.label,
            frame = meta.frame_number,
            error = %e,
            "Frame processing failed"
        );
    }

    unlock(shared, counters, id, address);
    counters.completed.fetch_add(1, Ordering::Relaxed);
}

fn unlock(shared: &DeviceShared, counters: &Counters, id: BufferId, address: BufferAddress) {
    let handle = shared.handle;
    let _ = shared
        .api()
        .call("unlock_seq_buf", |d| d.unlock_seq_buf(handle, id, address));
    counters.held.lock().remove(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_system_time_to_utc() {
        let time = SystemTimestamp {
            year: 2024,
            month: 3,
            day: 14,
            hour: 12,
            minute: 30,
            second: 15,
            millisecond: 250,
        };
        let utc = system_time_to_utc(&time).unwrap();
        assert_eq!(utc.with_timezone(&Local).minute(), 30);
        assert_eq!(utc.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_invalid_system_time_rejected() {
        let time = SystemTimestamp {
            year: 2024,
            month: 2,
            day: 30,
            ..Default::default()
        };
        assert!(matches!(
            system_time_to_utc(&time),
            Err(CaptureError::InvalidTimestamp(_))
        ));
        assert!(system_time_to_utc(&SystemTimestamp::default()).is_err());
    }

    #[test]
    fn test_mode_markers() {
        assert!(Continuous::FREE_RUNNING);
        assert!(!Triggered::FREE_RUNNING);
        assert_eq!(Triggered::NAME, "triggered");
    }
}
