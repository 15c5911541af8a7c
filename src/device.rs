//! Device session: an open camera with its buffers, events and status observer.
//!
//! [`DeviceSession`] owns everything tied to one hardware handle. Resources are
//! acquired during [`DeviceSessionBuilder::open`] and released in reverse by
//! `Drop`.
//!
//! # Opening
//!
//! 1. Open the camera. When the device asks for a starter firmware upload,
//!    retry with upload allowed under the `firmware_upload` retry policy. The
//!    user's progress handler runs on its own thread while the upload blocks.
//! 2. Reset to defaults and read the sensor description.
//! 3. Set the color mode, allocate the buffer pool, route capture to memory.
//! 4. Register and enable the four events, then start the status observer.
//! 5. Apply auto exposure defaults (HDR if available) and automatic white
//!    balance.
//!
//! A failure in steps 2-5 tears everything down again before the error is
//! returned; a session is never left half-open.
//!
//! # Teardown Order
//!
//! stop threads → disable and unregister events → free buffers → close handle.
//!
//! Capture sessions borrow the device session, so the compiler guarantees
//! all capture threads are gone before teardown starts.

use crate::buffer_pool::BufferPool;
use crate::capture::{CaptureMode, CaptureSession, FrameCallback, FrameMeta};
use crate::config::CaptureConfig;
use crate::discovery::CameraInfo;
use crate::driver::api::Api;
use crate::driver::{
    status, AwbType, CameraDriver, CameraHandle, DriverEvent, EventInit, SensorInfo,
};
use crate::error::{AppResult, CaptureError};
use crate::error_stats::{
    CaptureErrorEvent, ErrorCallback, ErrorStats, ErrorStatsSnapshot, DEFAULT_HISTORY_LEN,
};
use crate::image::{ImageView, PixelFormat};
use crate::retry::{RetryPolicies, RetryPolicy};
use chrono::Utc;
use parking_lot::{Condvar, Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Added to the driver's firmware upload estimate.
const UPLOAD_ESTIMATE_MARGIN: Duration = Duration::from_secs(1);

const ALL_EVENTS: [DriverEvent; 4] = [
    DriverEvent::FrameReady,
    DriverEvent::CaptureStatus,
    DriverEvent::TerminateHandleThreads,
    DriverEvent::TerminateCaptureThreads,
];

/// Lifecycle of a device session.
///
/// A session handed out by [`DeviceSessionBuilder::open`] is always `Open`.
/// The other states are passed through while the session is built or torn
/// down and only show up in the `state`/`to` fields of the lifecycle logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Open call in progress.
    Opening,
    /// Waiting for a starter firmware upload to finish.
    FirmwareUploadPending,
    /// Fully set up.
    Open,
    /// Teardown in progress.
    Closing,
    /// Hardware handle released.
    Closed,
}

/// Outcome of a starter firmware upload as seen by the progress handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    /// Upload still in progress.
    Running,
    /// Upload finished and the device opened.
    Complete,
    /// Upload finished but the device did not open.
    Failure,
}

/// Shared upload state handed to the firmware upload progress handler.
#[derive(Debug)]
pub struct UploadProgress {
    state: Mutex<UploadState>,
    changed: Condvar,
}

impl UploadProgress {
    fn new() -> Self {
        Self {
            state: Mutex::new(UploadState::Running),
            changed: Condvar::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> UploadState {
        *self.state.lock()
    }

    /// Block until the upload finishes or `timeout` elapses; returns the state
    /// at that point.
    pub fn wait_timeout(&self, timeout: Duration) -> UploadState {
        let mut state = self.state.lock();
        if *state == UploadState::Running {
            self.changed
                .wait_while_for(&mut state, |s| *s == UploadState::Running, timeout);
        }
        *state
    }

    fn finish(&self, outcome: UploadState) {
        *self.state.lock() = outcome;
        self.changed.notify_all();
    }
}

/// Firmware upload progress handler: camera, estimated duration, live state.
pub type UploadProgressCallback =
    Arc<dyn Fn(&CameraInfo, Duration, &UploadProgress) + Send + Sync>;

/// Preset white balance modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhiteBalance {
    /// Automatic white balance.
    Auto,
    /// 2800 K.
    Incandescent,
    /// 3200 K.
    Halogen,
    /// 4000 K.
    Fluorescent,
    /// 5000 K.
    Dusk,
    /// 5000 K.
    Dawn,
    /// 5650 K.
    Sunlight,
    /// 6000 K.
    Flash,
    /// 6000 K.
    Strobe,
    /// 7000 K.
    Clouds,
    /// 7000 K.
    Overcast,
    /// 8000 K.
    Fog,
}

impl WhiteBalance {
    /// Color temperature of the preset; `None` for [`WhiteBalance::Auto`].
    pub fn kelvin(self) -> Option<u32> {
        match self {
            WhiteBalance::Auto => None,
            WhiteBalance::Incandescent => Some(2800),
            WhiteBalance::Halogen => Some(3200),
            WhiteBalance::Fluorescent => Some(4000),
            WhiteBalance::Dusk | WhiteBalance::Dawn => Some(5000),
            WhiteBalance::Sunlight => Some(5650),
            WhiteBalance::Flash | WhiteBalance::Strobe => Some(6000),
            WhiteBalance::Clouds | WhiteBalance::Overcast => Some(7000),
            WhiteBalance::Fog => Some(8000),
        }
    }
}

/// State shared between the session and its background threads.
pub(crate) struct DeviceShared {
    pub(crate) driver: Arc<dyn CameraDriver>,
    pub(crate) handle: CameraHandle,
    pub(crate) camera: CameraInfo,
    pub(crate) label: String,
    pub(crate) sensor: SensorInfo,
    pub(crate) pixel_format: PixelFormat,
    pub(crate) concurrency: usize,
    pub(crate) retry: RetryPolicies,
    pub(crate) pool: RwLock<BufferPool>,
    pub(crate) error_stats: ErrorStats,
    status_callback: Option<ErrorCallback>,
    state: Mutex<DeviceState>,
}

impl DeviceShared {
    pub(crate) fn api(&self) -> Api<'_> {
        Api::new(&*self.driver, Some(self.handle), &self.label)
    }

    /// Signal a user event, retrying under the signal policy.
    pub(crate) fn signal_event(&self, event: DriverEvent) {
        let api = self.api();
        let result = self.retry.signal.run("signal event", |_| {
            api.call("event_set", |d| d.event_set(self.handle, event))
        });
        if let Err(e) = result {
            error!(camera = %self.label, ?event, error = %e, "Giving up signalling event");
        }
    }

    /// Clear a manual-reset event, retrying under the signal policy.
    pub(crate) fn reset_event(&self, event: DriverEvent) {
        let api = self.api();
        let result = self.retry.signal.run("reset event", |_| {
            api.call("event_reset", |d| d.event_reset(self.handle, event))
        });
        if let Err(e) = result {
            error!(camera = %self.label, ?event, error = %e, "Giving up resetting event");
        }
    }

    fn transition(&self, to: DeviceState) {
        let mut state = self.state.lock();
        debug!(camera = %self.label, from = ?*state, ?to, "Device state change");
        *state = to;
    }
}

/// Builder for [`DeviceSession`].
pub struct DeviceSessionBuilder {
    driver: Arc<dyn CameraDriver>,
    camera: CameraInfo,
    pixel_format: PixelFormat,
    concurrency: usize,
    error_history_len: usize,
    retry: RetryPolicies,
    status_callback: Option<ErrorCallback>,
    upload_progress: Option<UploadProgressCallback>,
}

impl DeviceSessionBuilder {
    /// Pixel format of captured images (default `Rgb16`).
    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format;
        self
    }

    /// Number of image buffers and callback workers (default 5).
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// History entries kept per capture error category.
    pub fn error_history_len(mut self, len: usize) -> Self {
        self.error_history_len = len;
        self
    }

    /// Retry policies.
    pub fn retry(mut self, retry: RetryPolicies) -> Self {
        self.retry = retry;
        self
    }

    /// Apply the `device` and `retry` sections of a loaded configuration.
    pub fn with_config(self, config: &CaptureConfig) -> Self {
        self.pixel_format(config.device.pixel_format)
            .concurrency(config.device.concurrency)
            .error_history_len(config.device.error_history_len)
            .retry(config.retry.clone())
    }

    /// Called on the observer thread for every capture error category that
    /// grew.
    pub fn on_capture_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CaptureErrorEvent) + Send + Sync + 'static,
    {
        self.status_callback = Some(Arc::new(callback));
        self
    }

    /// Called on a dedicated thread while a starter firmware upload runs.
    pub fn on_firmware_upload<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CameraInfo, Duration, &UploadProgress) + Send + Sync + 'static,
    {
        self.upload_progress = Some(Arc::new(callback));
        self
    }

    /// Open and fully set up the device.
    pub fn open(self) -> AppResult<DeviceSession> {
        let label = self.camera.label();
        info!(camera = %label, "Opening camera");

        let handle = open_handle(
            &*self.driver,
            &self.camera,
            &label,
            &self.retry,
            self.upload_progress.as_ref(),
        )?;

        let api = Api::new(&*self.driver, Some(handle), &label);
        let sensor = match api
            .call("reset_to_default", |d| d.reset_to_default(handle))
            .and_then(|()| api.call("sensor_info", |d| d.sensor_info(handle)))
        {
            Ok(sensor) => sensor,
            Err(e) => {
                close_handle(&api, handle, &self.retry.close);
                return Err(e);
            }
        };
        info!(
            camera = %label,
            sensor = %sensor.name,
            width = sensor.max_width,
            height = sensor.max_height,
            color = ?sensor.color,
            "Sensor detected"
        );

        let mut session = DeviceSession {
            shared: Arc::new(DeviceShared {
                driver: self.driver.clone(),
                handle,
                camera: self.camera,
                label,
                sensor,
                pixel_format: self.pixel_format,
                concurrency: self.concurrency,
                retry: self.retry,
                pool: RwLock::new(BufferPool::new()),
                error_stats: ErrorStats::new(self.error_history_len),
                status_callback: self.status_callback,
                state: Mutex::new(DeviceState::Opening),
            }),
            observer: None,
            events_registered: false,
            closed: false,
        };

        // Dropping `session` on error runs the full teardown.
        if let Err(e) = session.setup() {
            error!(camera = %session.shared.label, error = %e, "Device setup failed; tearing down");
            return Err(e);
        }

        session.shared.transition(DeviceState::Open);
        info!(camera = %session.shared.label, "Camera opened and initialized");
        Ok(session)
    }

    /// [`open`](Self::open) on the tokio blocking pool.
    pub async fn open_async(self) -> AppResult<DeviceSession> {
        tokio::task::spawn_blocking(move || self.open()).await?
    }
}

/// An open camera.
///
/// Not `Clone`: exactly one owner releases the hardware handle.
pub struct DeviceSession {
    shared: Arc<DeviceShared>,
    observer: Option<JoinHandle<()>>,
    events_registered: bool,
    closed: bool,
}

impl DeviceSession {
    /// Start configuring a session for `camera`.
    pub fn builder(driver: Arc<dyn CameraDriver>, camera: CameraInfo) -> DeviceSessionBuilder {
        DeviceSessionBuilder {
            driver,
            camera,
            pixel_format: PixelFormat::default(),
            concurrency: 5,
            error_history_len: DEFAULT_HISTORY_LEN,
            retry: RetryPolicies::default(),
            status_callback: None,
            upload_progress: None,
        }
    }

    fn setup(&mut self) -> AppResult<()> {
        let shared = self.shared.clone();
        let api = shared.api();
        let handle = shared.handle;

        api.call("set_color_mode", |d| {
            d.set_color_mode(handle, shared.pixel_format.color_mode())
        })?;

        shared.pool.write().initialize(
            &api,
            handle,
            shared.concurrency,
            shared.sensor.max_width,
            shared.sensor.max_height,
            shared.pixel_format.bits_per_pixel(),
        )?;

        api.call("set_capture_to_memory", |d| d.set_capture_to_memory(handle))?;

        self.init_events(&api)?;
        self.spawn_observer()?;

        self.set_auto_control_defaults(&api)?;
        self.set_white_balance(WhiteBalance::Auto)?;
        Ok(())
    }

    fn init_events(&mut self, api: &Api<'_>) -> AppResult<()> {
        let handle = self.shared.handle;
        let inits = [
            EventInit {
                event: DriverEvent::FrameReady,
                manual_reset: false,
                initially_signalled: false,
            },
            // Fires once right away so the observer reads a baseline.
            EventInit {
                event: DriverEvent::CaptureStatus,
                manual_reset: false,
                initially_signalled: true,
            },
            EventInit {
                event: DriverEvent::TerminateHandleThreads,
                manual_reset: true,
                initially_signalled: false,
            },
            EventInit {
                event: DriverEvent::TerminateCaptureThreads,
                manual_reset: true,
                initially_signalled: false,
            },
        ];
        api.call("event_init", |d| d.event_init(handle, &inits))?;
        self.events_registered = true;
        api.call("event_enable", |d| d.event_enable(handle, &ALL_EVENTS))?;
        Ok(())
    }

    fn spawn_observer(&mut self) -> AppResult<()> {
        let shared = self.shared.clone();
        let observer = thread::Builder::new()
            .name(format!("cam{}-status", self.shared.camera.device_id))
            .spawn(move || run_status_observer(shared))?;
        self.observer = Some(observer);
        Ok(())
    }

    fn set_auto_control_defaults(&self, api: &Api<'_>) -> AppResult<()> {
        let handle = self.shared.handle;

        // HDR is optional; failures only get logged.
        if let Ok(true) = api.call("hdr_supported", |d| d.hdr_supported(handle)) {
            if api.call("enable_hdr", |d| d.enable_hdr(handle)).is_ok() {
                debug!(camera = %self.shared.label, "HDR enabled");
            }
        }

        let aes = api.call("aes_default_configuration", |d| {
            d.aes_default_configuration(handle)
        })?;
        api.call("aes_set_enabled", |d| d.aes_set_enabled(handle, true))?;
        api.call("aes_set_configuration", |d| d.aes_set_configuration(handle, &aes))?;
        Ok(())
    }

    /// Set the frame rate, raising the pixel clock if the current one is too
    /// slow.
    ///
    /// The clock is walked upwards one step at a time and stops at the first
    /// value that supports `fps`, so the lowest sufficient clock is used. If
    /// no clock is fast enough the highest one stays set and the driver clamps
    /// the rate. Returns the frame rate actually applied.
    pub fn set_fps(&self, fps: f64) -> AppResult<f64> {
        let shared = &self.shared;
        let api = shared.api();
        let handle = shared.handle;

        let range = api.call("frame_time_range", |d| d.frame_time_range(handle))?;
        let mut max_fps = 1.0 / range.min;

        if fps > max_fps {
            let current = api.call("pixel_clock", |d| d.pixel_clock(handle))?;
            let mut clocks = self.pixel_clocks(&api)?;
            clocks.sort_unstable();

            for clock in clocks.into_iter().filter(|clock| *clock > current) {
                api.call("set_pixel_clock", |d| d.set_pixel_clock(handle, clock))?;
                let range = api.call("frame_time_range", |d| d.frame_time_range(handle))?;
                max_fps = 1.0 / range.min;
                debug!(camera = %shared.label, clock, max_fps, "Raised pixel clock");
                if fps <= max_fps {
                    break;
                }
            }
        }

        let actual = api.call("set_frame_rate", |d| d.set_frame_rate(handle, fps))?;
        info!(camera = %shared.label, requested = fps, actual, max_fps, "Frame rate set");
        Ok(actual)
    }

    fn pixel_clocks(&self, api: &Api<'_>) -> AppResult<Vec<u32>> {
        let handle = self.shared.handle;
        // Cameras with discrete clocks reject the range query or report a
        // zero increment; both fall back to the list.
        match api.call("pixel_clock_range", |d| d.pixel_clock_range(handle)) {
            Ok(range) if range.increment > 0 => {
                return Ok((range.min..=range.max)
                    .step_by(range.increment as usize)
                    .collect());
            }
            Ok(_) => {}
            Err(e) => debug!(camera = %self.shared.label, error = %e, "No pixel clock range"),
        }

        let count = api
            .call("pixel_clock_count", |d| d.pixel_clock_count(handle))
            .map_err(|_| CaptureError::PixelClockQuery)?;
        if count == 0 {
            return Err(CaptureError::PixelClockQuery);
        }
        let list = api
            .call("pixel_clock_list", |d| d.pixel_clock_list(handle))
            .map_err(|_| CaptureError::PixelClockQuery)?;
        if list.is_empty() {
            return Err(CaptureError::PixelClockQuery);
        }
        Ok(list)
    }

    /// Apply a white balance preset or automatic white balance.
    pub fn set_white_balance(&self, mode: WhiteBalance) -> AppResult<()> {
        match mode.kelvin() {
            None => self.set_auto_white_balance(),
            Some(kelvin) => self.set_white_balance_kelvin(kelvin).map(|_| ()),
        }
    }

    fn set_auto_white_balance(&self) -> AppResult<()> {
        let shared = &self.shared;
        let api = shared.api();
        let handle = shared.handle;

        let supported = api.call("awb_supported_types", |d| d.awb_supported_types(handle))?;
        let awb = if supported.color_temperature {
            AwbType::ColorTemperature
        } else if supported.grey_world {
            AwbType::GreyWorld
        } else {
            return Err(CaptureError::UnsupportedWhiteBalance);
        };
        api.call("awb_set_type", |d| d.awb_set_type(handle, awb))?;

        let model = api.call("color_model_default", |d| d.color_model_default(handle))?;
        api.call("set_color_model", |d| d.set_color_model(handle, model))?;
        // Not every sensor lets the AWB algorithm choose its color model.
        let _ = api.call("awb_set_color_model", |d| d.awb_set_color_model(handle, model));

        let enable = shared.pixel_format.is_color();
        api.call("awb_set_enabled", |d| d.awb_set_enabled(handle, enable))?;
        info!(camera = %shared.label, ?awb, enabled = enable, "Automatic white balance configured");
        Ok(())
    }

    /// Disable automatic white balance and set a fixed color temperature.
    ///
    /// The value is clamped to the device range when it can be queried.
    /// Returns the temperature applied.
    pub fn set_white_balance_kelvin(&self, kelvin: u32) -> AppResult<u32> {
        let shared = &self.shared;
        let api = shared.api();
        let handle = shared.handle;

        api.call("awb_set_enabled", |d| d.awb_set_enabled(handle, false))?;

        if let Ok(model) = api.call("color_model_default", |d| d.color_model_default(handle)) {
            let _ = api.call("set_color_model", |d| d.set_color_model(handle, model));
        }

        let kelvin = match api.call("color_temperature_range", |d| {
            d.color_temperature_range(handle)
        }) {
            Ok((min, max)) => kelvin.clamp(min, max),
            Err(_) => kelvin,
        };

        api.call("set_color_temperature", |d| d.set_color_temperature(handle, kelvin))?;
        info!(camera = %shared.label, kelvin, "Color temperature set");
        Ok(kelvin)
    }

    /// Zero the driver's capture error counters and the local statistics.
    pub fn reset_error_stats(&self) -> AppResult<()> {
        let api = self.shared.api();
        let handle = self.shared.handle;
        api.call("reset_capture_status", |d| d.reset_capture_status(handle))?;
        self.shared.error_stats.reset();
        Ok(())
    }

    /// Driver's last error code and message for this camera.
    pub fn last_error(&self) -> AppResult<(i32, String)> {
        let handle = self.shared.handle;
        self.shared
            .api()
            .call("last_error", |d| d.last_error(handle))
    }

    /// Start a capture session delivering frames to `callback`.
    ///
    /// See [`CaptureSession`] for the two modes.
    pub fn capture<M, F>(&self, callback: F) -> AppResult<CaptureSession<'_, M>>
    where
        M: CaptureMode,
        F: Fn(ImageView<'_>, FrameMeta) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: FrameCallback = Arc::new(callback);
        CaptureSession::start(self, callback)
    }

    /// Camera identity.
    pub fn camera(&self) -> &CameraInfo {
        &self.shared.camera
    }

    /// Sensor description.
    pub fn sensor(&self) -> &SensorInfo {
        &self.shared.sensor
    }

    /// Full sensor resolution as (width, height).
    pub fn resolution(&self) -> (u32, u32) {
        (self.shared.sensor.max_width, self.shared.sensor.max_height)
    }

    /// Pixel format of captured images.
    pub fn pixel_format(&self) -> PixelFormat {
        self.shared.pixel_format
    }

    /// Buffer and worker count.
    pub fn concurrency(&self) -> usize {
        self.shared.concurrency
    }

    /// Buffers that made it into the capture sequence.
    pub fn buffer_count(&self) -> usize {
        self.shared.pool.read().len()
    }

    /// Snapshot of the capture error statistics.
    pub fn error_stats(&self) -> ErrorStatsSnapshot {
        self.shared.error_stats.snapshot()
    }

    /// Current lifecycle state; `Open` for any session a caller can reach.
    pub fn state(&self) -> DeviceState {
        *self.shared.state.lock()
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    /// Tear down explicitly.
    ///
    /// Same as dropping the session, but reports whether the hardware handle
    /// could be closed.
    pub fn close(mut self) -> AppResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let shared = self.shared.clone();
        shared.transition(DeviceState::Closing);
        let api = shared.api();
        let handle = shared.handle;

        // 1. Background threads
        if let Some(observer) = self.observer.take() {
            shared.signal_event(DriverEvent::TerminateHandleThreads);
            if observer.join().is_err() {
                error!(camera = %shared.label, "Status observer panicked");
            }
        }

        // 2. Events
        if self.events_registered {
            let _ = api.call("event_disable", |d| d.event_disable(handle, &ALL_EVENTS));
            let _ = api.call("event_exit", |d| d.event_exit(handle, &ALL_EVENTS));
            self.events_registered = false;
        }

        // 3. Buffers
        shared.pool.write().cleanup(&api, handle);

        // 4. Handle
        let result = shared.retry.close.run("close camera", |_| {
            api.call("exit_camera", |d| d.exit_camera(handle))
        });
        shared.transition(DeviceState::Closed);
        match &result {
            Ok(()) => info!(camera = %shared.label, "Camera closed"),
            Err(e) => error!(camera = %shared.label, error = %e, "Failed closing camera; giving up"),
        }
        result
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("camera", &self.shared.label)
            .field("handle", &self.shared.handle)
            .field("pixel_format", &self.shared.pixel_format)
            .field("concurrency", &self.shared.concurrency)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

/// Open the hardware handle, uploading starter firmware when required.
fn open_handle(
    driver: &dyn CameraDriver,
    camera: &CameraInfo,
    label: &str,
    retry: &RetryPolicies,
    upload_progress: Option<&UploadProgressCallback>,
) -> AppResult<CameraHandle> {
    let api = Api::new(driver, None, label);
    let policy = &retry.firmware_upload;
    let camera_id = camera.camera_id;
    let open_failed = format!("opening camera with device id {} failed", camera.device_id);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        debug!(camera = %label, attempt, state = ?DeviceState::Opening, "Opening device");

        match api.call_msg("init_camera", &open_failed, |d| d.init_camera(camera_id, false)) {
            Ok(handle) => return Ok(handle),
            Err(e) if e.driver_code() == Some(status::STARTER_FW_UPLOAD_NEEDED) => {}
            Err(e) => return Err(e),
        }

        info!(camera = %label, "Camera requires new starter firmware");
        let estimate = api.call_msg(
            "firmware_upload_duration",
            "could not request info for starter firmware upload",
            |d| d.firmware_upload_duration(camera_id),
        )? + UPLOAD_ESTIMATE_MARGIN;
        debug!(
            camera = %label,
            estimate_ms = estimate.as_millis() as u64,
            state = ?DeviceState::FirmwareUploadPending,
            "Starting firmware upload"
        );

        let progress = UploadProgress::new();
        let result = thread::scope(|scope| {
            let handler = thread::Builder::new()
                .name("fw-upload-progress".to_string())
                .spawn_scoped(scope, || match upload_progress {
                    Some(callback) => callback(camera, estimate, &progress),
                    None => default_upload_progress(camera, estimate, &progress),
                });
            if let Err(e) = &handler {
                warn!(camera = %label, error = %e, "Could not start firmware upload progress handler");
            }

            let result = api.call("init_camera", |d| d.init_camera(camera_id, true));
            progress.finish(if result.is_ok() {
                UploadState::Complete
            } else {
                UploadState::Failure
            });

            if let Ok(handler) = handler {
                if handler.join().is_err() {
                    warn!(camera = %label, "Firmware upload progress handler panicked");
                }
            }
            result
        });

        match result {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                if matches!(
                    e.driver_code(),
                    Some(status::CANT_OPEN_DEVICE | status::DEVICE_ALREADY_PAIRED)
                ) {
                    close_handle(&api, CameraHandle(camera_id), &retry.close);
                }
                info!(
                    camera = %label,
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    "Failed to open camera after starter firmware upload"
                );
            }
        }

        if !policy.allows(attempt) {
            warn!(camera = %label, attempt, "Starter firmware upload retry limit reached");
            return Err(CaptureError::FirmwareUploadRetriesExhausted { attempts: attempt });
        }
        thread::sleep(policy.backoff_delay);
    }
}

fn default_upload_progress(camera: &CameraInfo, estimate: Duration, progress: &UploadProgress) {
    info!(
        camera = %camera.label(),
        estimate_ms = estimate.as_millis() as u64,
        "Uploading starter firmware"
    );
    let outcome = progress.wait_timeout(estimate);
    debug!(camera = %camera.label(), ?outcome, "Firmware upload progress handler done");
}

fn close_handle(api: &Api<'_>, handle: CameraHandle, policy: &RetryPolicy) {
    let result = policy.run("close camera", |_| {
        api.call("exit_camera", |d| d.exit_camera(handle))
    });
    if let Err(e) = result {
        error!(camera = api.label(), error = %e, "Failed closing camera; giving up");
    }
}

fn run_status_observer(shared: Arc<DeviceShared>) {
    let api = shared.api();
    let handle = shared.handle;
    let events = [DriverEvent::CaptureStatus, DriverEvent::TerminateHandleThreads];
    debug!(camera = %shared.label, "Status observer started");

    loop {
        match api.call("event_wait", |d| d.event_wait(handle, &events, None)) {
            Ok(DriverEvent::TerminateHandleThreads) => break,
            Ok(DriverEvent::CaptureStatus) => {
                let Ok(status) = api.call("capture_status", |d| d.capture_status(handle)) else {
                    continue;
                };
                for event in shared.error_stats.merge(&status, Utc::now()) {
                    warn!(
                        camera = %shared.label,
                        code = event.kind.code(),
                        kind = event.kind.name(),
                        new_events = event.new_events,
                        total = event.total,
                        "Capture error: {}",
                        event.kind.description()
                    );
                    if let Some(callback) = &shared.status_callback {
                        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                            error!(camera = %shared.label, "Capture error callback panicked");
                        }
                    }
                }
            }
            Ok(other) => debug!(camera = %shared.label, ?other, "Ignoring unexpected event"),
            Err(_) => thread::sleep(shared.retry.signal.backoff_delay),
        }
    }

    debug!(camera = %shared.label, "Status observer stopped");
}
