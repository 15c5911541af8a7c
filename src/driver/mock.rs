//! Simulated camera driver for hardware-free testing and demos.
//!
//! `MockDriver` implements [`CameraDriver`] entirely in process:
//!
//! - image buffers are real heap allocations, so typed views over them work
//! - events use auto-reset/manual-reset semantics backed by a condition variable
//! - frames are produced on demand ([`MockDriver::emit_frame`]), by `freeze_video`,
//!   or by a free-running thread after `capture_video`
//! - when every sequence buffer is locked, a new frame is dropped and counted as
//!   `DRV_OUT_OF_BUFFERS`, just like the hardware does
//! - any call can be made to fail with [`MockDriver::fail_next`] /
//!   [`MockDriver::fail_always`]
//! - every call is recorded by name for assertions ([`MockDriver::call_count`])

use super::{
    status, ActiveBuffer, AesConfiguration, AwbSupport, AwbType, BufferAddress, BufferId,
    CameraDriver, CameraHandle, CameraListEntry, CaptureErrorKind, CaptureStatusInfo, ColorMode,
    DriverEvent, DriverResult, EventInit, FrameTimeRange, ImageInfo, IpCapabilities,
    PixelClockRange, SensorColor, SensorInfo, SystemTimestamp, TriggerMode,
};
use chrono::{Datelike, Local, Timelike};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Device timestamp increment per frame, in 0.1 µs ticks (10 ms).
const TICKS_PER_FRAME: u64 = 100_000;

/// Network settings of a simulated GigE camera.
#[derive(Clone, Debug, Default)]
pub struct MockNetwork {
    /// Persistent address and subnet mask.
    pub persistent: Option<(Ipv4Addr, Ipv4Addr)>,
    /// Autoconfiguration range.
    pub autoconfig: Option<(Ipv4Addr, Ipv4Addr)>,
}

/// One simulated camera on the bus.
#[derive(Clone, Debug)]
pub struct MockCamera {
    /// Camera id.
    pub camera_id: u32,
    /// Device id.
    pub device_id: u32,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Already opened elsewhere.
    pub in_use: bool,
    /// `None` for USB cameras.
    pub network: Option<MockNetwork>,
}

impl MockCamera {
    /// USB camera with the given ids.
    pub fn usb(camera_id: u32, device_id: u32) -> Self {
        Self {
            camera_id,
            device_id,
            model: "MOCK-USB".to_string(),
            serial: format!("41000{device_id:05}"),
            in_use: false,
            network: None,
        }
    }

    /// GigE camera with the given network settings.
    pub fn ethernet(camera_id: u32, device_id: u32, network: MockNetwork) -> Self {
        Self {
            model: "MOCK-GIGE".to_string(),
            network: Some(network),
            ..Self::usb(camera_id, device_id)
        }
    }
}

/// How the simulated device reports its pixel clocks.
#[derive(Clone, Debug)]
pub enum PixelClockMode {
    /// Continuous range with a non-zero step.
    Range(PixelClockRange),
    /// Discrete list only; the range query reports an increment of 0.
    Discrete(Vec<u32>),
}

impl PixelClockMode {
    fn values(&self) -> Vec<u32> {
        match self {
            PixelClockMode::Range(range) if range.increment > 0 => (range.min..=range.max)
                .step_by(range.increment as usize)
                .collect(),
            PixelClockMode::Range(range) => vec![range.min],
            PixelClockMode::Discrete(list) => list.clone(),
        }
    }
}

/// Configuration for [`MockDriver`].
#[derive(Clone, Debug)]
pub struct MockConfig {
    /// Cameras on the bus.
    pub cameras: Vec<MockCamera>,
    /// Sensor of every camera.
    pub sensor: SensorInfo,
    /// Opening requires a starter firmware upload first.
    pub needs_firmware_upload: bool,
    /// Status codes returned by successive upload attempts before one succeeds.
    pub upload_failures: Vec<i32>,
    /// Reported firmware upload duration.
    pub upload_duration: Duration,
    /// Pixel clocks offered by the device.
    pub pixel_clocks: PixelClockMode,
    /// Pixel clock after open, in MHz.
    pub initial_pixel_clock: u32,
    /// Maximum frame rate per MHz of pixel clock.
    pub fps_per_mhz: f64,
    /// Lowest frame rate the device accepts.
    pub min_fps: f64,
    /// Supported AWB algorithms.
    pub awb: AwbSupport,
    /// Supported color temperature range in Kelvin.
    pub color_temperature_range: (u32, u32),
    /// HDR available.
    pub hdr_supported: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            cameras: vec![MockCamera::usb(1, 1)],
            sensor: SensorInfo {
                name: "MockSensor".to_string(),
                max_width: 64,
                max_height: 48,
                color: SensorColor::Bayer,
            },
            needs_firmware_upload: false,
            upload_failures: Vec::new(),
            upload_duration: Duration::from_millis(20),
            pixel_clocks: PixelClockMode::Discrete(vec![10, 20, 30, 40]),
            initial_pixel_clock: 20,
            fps_per_mhz: 0.375,
            min_fps: 0.5,
            awb: AwbSupport {
                color_temperature: true,
                grey_world: true,
            },
            color_temperature_range: (2200, 10_000),
            hdr_supported: false,
        }
    }
}

/// Sample value the mock writes at `index` of frame `frame_number`.
///
/// 12-bit RGB samples stay below 4096 so the 12 to 16 bit rescale is observable.
pub fn pattern_sample(mode: ColorMode, index: usize, frame_number: u64) -> u16 {
    let base = index as u64 + frame_number;
    match mode {
        ColorMode::Mono8 | ColorMode::Rgb8Packed => (base % 256) as u16,
        ColorMode::Mono16 => ((base * 13) % 65_536) as u16,
        ColorMode::Rgb12Unpacked => (base % 4096) as u16,
    }
}

#[derive(Clone, Copy, Debug)]
struct Fault {
    code: i32,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct EventSlot {
    manual_reset: bool,
    enabled: bool,
    signalled: bool,
}

struct MockBuffer {
    // u64 backing keeps every buffer 8-byte aligned. Never resized, so the
    // heap block stays at `address` until the buffer is freed.
    memory: Vec<u64>,
    len_bytes: usize,
    address: BufferAddress,
    locked: bool,
    info: ImageInfo,
}

struct MockState {
    calls: Vec<&'static str>,
    faults: HashMap<&'static str, Fault>,
    last_error: (i32, String),
    firmware_pending: bool,
    upload_failures: VecDeque<i32>,
    open: Option<CameraHandle>,

    color_mode: ColorMode,
    next_buffer_id: i32,
    buffers: BTreeMap<BufferId, MockBuffer>,
    sequence: Vec<BufferId>,
    next_slot: usize,
    last_completed: Option<BufferId>,
    frame_counter: u64,

    events: HashMap<DriverEvent, EventSlot>,
    status: CaptureStatusInfo,

    trigger: TriggerMode,
    live: bool,
    live_thread: Option<JoinHandle<()>>,

    pixel_clock: u32,
    fps: f64,
    hdr_enabled: bool,
    aes_enabled: bool,
    awb_enabled: bool,
    awb_type: Option<AwbType>,
    color_model: u32,
    color_temperature: u32,
}

struct Inner {
    config: MockConfig,
    state: Mutex<MockState>,
    /// Wakes event waiters.
    signal: Condvar,
    /// Wakes the free-running frame thread.
    live_wake: Condvar,
}

/// In-process simulated camera driver.
#[derive(Clone)]
pub struct MockDriver {
    inner: Arc<Inner>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("cameras", &self.inner.config.cameras.len())
            .field("open", &self.inner.state.lock().open)
            .finish()
    }
}

impl MockDriver {
    /// Single USB camera with a 64x48 Bayer sensor.
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    /// Driver with a custom configuration.
    pub fn with_config(config: MockConfig) -> Self {
        let state = MockState {
            calls: Vec::new(),
            faults: HashMap::new(),
            last_error: (status::SUCCESS, String::new()),
            firmware_pending: config.needs_firmware_upload,
            upload_failures: config.upload_failures.iter().copied().collect(),
            open: None,
            color_mode: ColorMode::Mono8,
            next_buffer_id: 1,
            buffers: BTreeMap::new(),
            sequence: Vec::new(),
            next_slot: 0,
            last_completed: None,
            frame_counter: 0,
            events: HashMap::new(),
            status: CaptureStatusInfo::default(),
            trigger: TriggerMode::Off,
            live: false,
            live_thread: None,
            pixel_clock: config.initial_pixel_clock,
            fps: 10.0,
            hdr_enabled: false,
            aes_enabled: false,
            awb_enabled: false,
            awb_type: None,
            color_model: 0,
            color_temperature: 5000,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                signal: Condvar::new(),
                live_wake: Condvar::new(),
            }),
        }
    }

    // --- Fault injection --------------------------------------------------

    /// Make the next `times` calls to `call` fail with `code`.
    pub fn fail_next(&self, call: &'static str, code: i32, times: u32) {
        self.inner.state.lock().faults.insert(
            call,
            Fault {
                code,
                remaining: Some(times),
            },
        );
    }

    /// Make every call to `call` fail with `code`.
    pub fn fail_always(&self, call: &'static str, code: i32) {
        self.inner.state.lock().faults.insert(
            call,
            Fault {
                code,
                remaining: None,
            },
        );
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.inner.state.lock().faults.clear();
    }

    /// Set the message returned by the last-error query.
    pub fn set_last_error(&self, code: i32, message: impl Into<String>) {
        self.inner.state.lock().last_error = (code, message.into());
    }

    // --- Inspection -------------------------------------------------------

    /// Names of all calls made so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner.state.lock().calls.clone()
    }

    /// How many times `call` was made.
    pub fn call_count(&self, call: &str) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        self.inner.state.lock().calls.clear();
    }

    /// A camera is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open.is_some()
    }

    /// Allocated image buffers.
    pub fn allocated_buffers(&self) -> usize {
        self.inner.state.lock().buffers.len()
    }

    /// Buffers currently in the capture sequence.
    pub fn sequence_len(&self) -> usize {
        self.inner.state.lock().sequence.len()
    }

    /// Buffers currently locked by the application.
    pub fn locked_buffers(&self) -> usize {
        self.inner
            .state
            .lock()
            .buffers
            .values()
            .filter(|b| b.locked)
            .count()
    }

    /// Events currently registered.
    pub fn registered_events(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// Color mode currently configured.
    pub fn color_mode(&self) -> ColorMode {
        self.inner.state.lock().color_mode
    }

    /// Trigger source currently configured.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.inner.state.lock().trigger
    }

    /// Free-running capture is active.
    pub fn is_live(&self) -> bool {
        self.inner.state.lock().live
    }

    /// Current pixel clock in MHz.
    pub fn current_pixel_clock(&self) -> u32 {
        self.inner.state.lock().pixel_clock
    }

    /// Frame rate currently applied.
    pub fn frame_rate(&self) -> f64 {
        self.inner.state.lock().fps
    }

    /// AWB enabled.
    pub fn awb_enabled(&self) -> bool {
        self.inner.state.lock().awb_enabled
    }

    /// Selected AWB algorithm.
    pub fn awb_type(&self) -> Option<AwbType> {
        self.inner.state.lock().awb_type
    }

    /// Color temperature in Kelvin.
    pub fn color_temperature(&self) -> u32 {
        self.inner.state.lock().color_temperature
    }

    /// Auto exposure enabled.
    pub fn auto_exposure_enabled(&self) -> bool {
        self.inner.state.lock().aes_enabled
    }

    /// Frames written so far.
    pub fn frames_emitted(&self) -> u64 {
        self.inner.state.lock().frame_counter
    }

    // --- Stimuli ----------------------------------------------------------

    /// Produce one frame into the next unlocked sequence buffer.
    ///
    /// Returns `false` when no buffer was free; the frame is then counted as
    /// `DRV_OUT_OF_BUFFERS` and the capture-status event fires.
    pub fn emit_frame(&self) -> bool {
        let mut st = self.inner.state.lock();
        let emitted = Self::produce_frame(&mut st);
        drop(st);
        self.inner.signal.notify_all();
        emitted
    }

    /// Bump a capture error counter and signal the capture-status event.
    pub fn raise_capture_error(&self, kind: CaptureErrorKind, count: u32) {
        let mut st = self.inner.state.lock();
        *st.status.counts.entry(kind).or_insert(0) += count;
        st.status.total += count;
        Self::signal_event(&mut st, DriverEvent::CaptureStatus);
        drop(st);
        self.inner.signal.notify_all();
    }

    fn produce_frame(st: &mut MockState) -> bool {
        if st.open.is_none() || st.sequence.is_empty() {
            return false;
        }

        let len = st.sequence.len();
        let free_slot = (0..len)
            .map(|offset| (st.next_slot + offset) % len)
            .find(|slot| {
                st.buffers
                    .get(&st.sequence[*slot])
                    .is_some_and(|buffer| !buffer.locked)
            });

        let Some(slot) = free_slot else {
            *st
                .status
                .counts
                .entry(CaptureErrorKind::DrvOutOfBuffers)
                .or_insert(0) += 1;
            st.status.total += 1;
            Self::signal_event(st, DriverEvent::CaptureStatus);
            trace!("Mock frame dropped: all buffers locked");
            return false;
        };

        let id = st.sequence[slot];
        let frame_number = st.frame_counter;
        let mode = st.color_mode;
        if let Some(buffer) = st.buffers.get_mut(&id) {
            fill_pattern(buffer, mode, frame_number);
            buffer.info = ImageInfo {
                device_timestamp: frame_number * TICKS_PER_FRAME,
                frame_number,
                system_time: now_timestamp(),
            };
        }
        st.frame_counter += 1;
        st.last_completed = Some(id);
        st.next_slot = (slot + 1) % len;
        Self::signal_event(st, DriverEvent::FrameReady);
        true
    }

    fn signal_event(st: &mut MockState, event: DriverEvent) {
        if let Some(slot) = st.events.get_mut(&event) {
            if slot.enabled {
                slot.signalled = true;
            }
        }
    }

    /// Record the call and apply any injected fault.
    fn enter(st: &mut MockState, call: &'static str) -> DriverResult<()> {
        st.calls.push(call);
        let Some(fault) = st.faults.get_mut(call) else {
            return Ok(());
        };
        let code = fault.code;
        match fault.remaining.as_mut() {
            Some(0) => {
                st.faults.remove(call);
                return Ok(());
            }
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    st.faults.remove(call);
                }
            }
            None => {}
        }
        st.last_error = (code, format!("injected failure in {call}"));
        Err(code)
    }

    /// Like [`enter`](Self::enter) but also validates the handle.
    fn enter_open(
        st: &mut MockState,
        call: &'static str,
        handle: CameraHandle,
    ) -> DriverResult<()> {
        Self::enter(st, call)?;
        if st.open != Some(handle) {
            st.last_error = (
                status::INVALID_CAMERA_HANDLE,
                "invalid camera handle".to_string(),
            );
            return Err(status::INVALID_CAMERA_HANDLE);
        }
        Ok(())
    }

    fn camera(&self, device_id: u32) -> Option<&MockCamera> {
        self.inner
            .config
            .cameras
            .iter()
            .find(|c| c.device_id == device_id)
    }

    fn max_fps(&self, clock: u32) -> f64 {
        f64::from(clock) * self.inner.config.fps_per_mhz
    }

    fn spawn_live_thread(&self) -> std::io::Result<JoinHandle<()>> {
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name("mock-free-run".to_string())
            .spawn(move || loop {
                let mut st = inner.state.lock();
                let period = Duration::from_secs_f64(1.0 / st.fps.max(0.001))
                    .max(Duration::from_millis(1));
                let deadline = Instant::now() + period;
                while st.live && Instant::now() < deadline {
                    if inner.live_wake.wait_until(&mut st, deadline).timed_out() {
                        break;
                    }
                }
                if !st.live {
                    return;
                }
                MockDriver::produce_frame(&mut st);
                drop(st);
                inner.signal.notify_all();
            })
    }

    fn stop_live_thread(&self) {
        let handle = {
            let mut st = self.inner.state.lock();
            st.live = false;
            st.live_thread.take()
        };
        self.inner.live_wake.notify_all();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn fill_pattern(buffer: &mut MockBuffer, mode: ColorMode, frame_number: u64) {
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut buffer.memory[..]);
    let bytes = &mut bytes[..buffer.len_bytes];
    match mode {
        ColorMode::Mono8 | ColorMode::Rgb8Packed => {
            for (index, byte) in bytes.iter_mut().enumerate() {
                *byte = pattern_sample(mode, index, frame_number) as u8;
            }
        }
        ColorMode::Mono16 | ColorMode::Rgb12Unpacked => {
            let samples: &mut [u16] = bytemuck::cast_slice_mut(&mut bytes[..buffer.len_bytes & !1]);
            for (index, sample) in samples.iter_mut().enumerate() {
                *sample = pattern_sample(mode, index, frame_number);
            }
        }
    }
}

fn now_timestamp() -> SystemTimestamp {
    let now = Local::now();
    SystemTimestamp {
        year: now.year() as u16,
        month: now.month() as u8,
        day: now.day() as u8,
        hour: now.hour() as u8,
        minute: now.minute() as u8,
        second: now.second().min(59) as u8,
        millisecond: (now.timestamp_subsec_millis() % 1000) as u16,
    }
}

fn ip_to_le(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

impl CameraDriver for MockDriver {
    fn camera_list(&self) -> DriverResult<Vec<CameraListEntry>> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "camera_list")?;
        let open = st.open;
        Ok(self
            .inner
            .config
            .cameras
            .iter()
            .map(|c| CameraListEntry {
                camera_id: c.camera_id,
                device_id: c.device_id,
                model: c.model.clone(),
                serial: c.serial.clone(),
                in_use: c.in_use || open == Some(CameraHandle(c.camera_id)),
            })
            .collect())
    }

    fn ip_capabilities(&self, device_id: u32) -> DriverResult<IpCapabilities> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "ip_capabilities")?;
        let camera = self.camera(device_id).ok_or(status::INVALID_PARAMETER)?;
        let network = camera.network.as_ref().ok_or(status::NOT_SUPPORTED)?;
        Ok(IpCapabilities {
            persistent: network.persistent.is_some(),
            autoconfig: network.autoconfig.is_some(),
        })
    }

    fn persistent_ip(&self, device_id: u32) -> DriverResult<(u32, u32)> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "persistent_ip")?;
        let (ip, mask) = self
            .camera(device_id)
            .and_then(|c| c.network.as_ref())
            .and_then(|n| n.persistent)
            .ok_or(status::NOT_SUPPORTED)?;
        Ok((ip_to_le(ip), ip_to_le(mask)))
    }

    fn autoconfig_ip_range(&self, device_id: u32) -> DriverResult<(u32, u32)> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "autoconfig_ip_range")?;
        let (begin, end) = self
            .camera(device_id)
            .and_then(|c| c.network.as_ref())
            .and_then(|n| n.autoconfig)
            .ok_or(status::NOT_SUPPORTED)?;
        Ok((ip_to_le(begin), ip_to_le(end)))
    }

    fn init_camera(
        &self,
        camera_id: u32,
        allow_firmware_upload: bool,
    ) -> DriverResult<CameraHandle> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "init_camera")?;
        if !self
            .inner
            .config
            .cameras
            .iter()
            .any(|c| c.camera_id == camera_id)
            || st.open.is_some()
        {
            return Err(status::CANT_OPEN_DEVICE);
        }
        if st.firmware_pending {
            if !allow_firmware_upload {
                return Err(status::STARTER_FW_UPLOAD_NEEDED);
            }
            if let Some(code) = st.upload_failures.pop_front() {
                return Err(code);
            }
            st.firmware_pending = false;
        }
        let handle = CameraHandle(camera_id);
        st.open = Some(handle);
        debug!(camera_id, "Mock camera opened");
        Ok(handle)
    }

    fn firmware_upload_duration(&self, _camera_id: u32) -> DriverResult<Duration> {
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "firmware_upload_duration")?;
        Ok(self.inner.config.upload_duration)
    }

    fn exit_camera(&self, handle: CameraHandle) -> DriverResult<()> {
        self.stop_live_thread();
        let mut st = self.inner.state.lock();
        Self::enter(&mut st, "exit_camera")?;
        if st.open == Some(handle) {
            st.open = None;
            st.events.clear();
            st.sequence.clear();
            debug!(camera_id = handle.0, "Mock camera closed");
        }
        Ok(())
    }

    fn reset_to_default(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "reset_to_default", handle)?;
        st.pixel_clock = self.inner.config.initial_pixel_clock;
        st.trigger = TriggerMode::Off;
        st.awb_enabled = false;
        st.aes_enabled = false;
        Ok(())
    }

    fn sensor_info(&self, handle: CameraHandle) -> DriverResult<SensorInfo> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "sensor_info", handle)?;
        Ok(self.inner.config.sensor.clone())
    }

    fn last_error(&self, _handle: CameraHandle) -> DriverResult<(i32, String)> {
        let st = self.inner.state.lock();
        Ok(st.last_error.clone())
    }

    fn set_color_mode(&self, handle: CameraHandle, mode: ColorMode) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_color_mode", handle)?;
        st.color_mode = mode;
        Ok(())
    }

    fn set_capture_to_memory(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_capture_to_memory", handle)
    }

    fn alloc_image_mem(
        &self,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> DriverResult<(BufferAddress, BufferId)> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "alloc_image_mem", handle)?;
        let len_bytes = (width as usize * height as usize * bits_per_pixel as usize).div_ceil(8);
        if len_bytes == 0 {
            return Err(status::INVALID_PARAMETER);
        }
        let mut memory = vec![0u64; len_bytes.div_ceil(8)];
        let address = BufferAddress::from_ptr(memory.as_mut_ptr().cast::<u8>());
        let id = BufferId(st.next_buffer_id);
        st.next_buffer_id += 1;
        st.buffers.insert(
            id,
            MockBuffer {
                memory,
                len_bytes,
                address,
                locked: false,
                info: ImageInfo::default(),
            },
        );
        Ok((address, id))
    }

    fn add_to_sequence(
        &self,
        handle: CameraHandle,
        address: BufferAddress,
        id: BufferId,
    ) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "add_to_sequence", handle)?;
        match st.buffers.get(&id) {
            Some(buffer) if buffer.address == address => {
                st.sequence.push(id);
                Ok(())
            }
            _ => Err(status::INVALID_PARAMETER),
        }
    }

    fn clear_sequence(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "clear_sequence", handle)?;
        st.sequence.clear();
        st.next_slot = 0;
        st.last_completed = None;
        Ok(())
    }

    fn free_image_mem(
        &self,
        handle: CameraHandle,
        address: BufferAddress,
        id: BufferId,
    ) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "free_image_mem", handle)?;
        match st.buffers.get(&id) {
            Some(buffer) if buffer.address == address => {
                st.buffers.remove(&id);
                st.sequence.retain(|seq_id| *seq_id != id);
                Ok(())
            }
            _ => Err(status::INVALID_PARAMETER),
        }
    }

    fn event_init(&self, handle: CameraHandle, events: &[EventInit]) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_init", handle)?;
        for init in events {
            st.events.insert(
                init.event,
                EventSlot {
                    manual_reset: init.manual_reset,
                    enabled: false,
                    signalled: init.initially_signalled,
                },
            );
        }
        Ok(())
    }

    fn event_enable(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_enable", handle)?;
        for event in events {
            st.events
                .get_mut(event)
                .ok_or(status::INVALID_PARAMETER)?
                .enabled = true;
        }
        drop(st);
        self.inner.signal.notify_all();
        Ok(())
    }

    fn event_disable(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_disable", handle)?;
        for event in events {
            if let Some(slot) = st.events.get_mut(event) {
                slot.enabled = false;
            }
        }
        Ok(())
    }

    fn event_exit(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_exit", handle)?;
        for event in events {
            st.events.remove(event);
        }
        Ok(())
    }

    fn event_wait(
        &self,
        handle: CameraHandle,
        events: &[DriverEvent],
        timeout: Option<Duration>,
    ) -> DriverResult<DriverEvent> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_wait", handle)?;
        loop {
            for event in events {
                let slot = st.events.get_mut(event).ok_or(status::NO_SUCCESS)?;
                if slot.enabled && slot.signalled {
                    if !slot.manual_reset {
                        slot.signalled = false;
                    }
                    return Ok(*event);
                }
            }
            match deadline {
                None => self.inner.signal.wait(&mut st),
                Some(deadline) => {
                    if self.inner.signal.wait_until(&mut st, deadline).timed_out() {
                        return Err(status::TIMED_OUT);
                    }
                }
            }
        }
    }

    fn event_set(&self, handle: CameraHandle, event: DriverEvent) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_set", handle)?;
        st.events
            .get_mut(&event)
            .ok_or(status::INVALID_PARAMETER)?
            .signalled = true;
        drop(st);
        self.inner.signal.notify_all();
        Ok(())
    }

    fn event_reset(&self, handle: CameraHandle, event: DriverEvent) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "event_reset", handle)?;
        st.events
            .get_mut(&event)
            .ok_or(status::INVALID_PARAMETER)?
            .signalled = false;
        Ok(())
    }

    fn capture_status(&self, handle: CameraHandle) -> DriverResult<CaptureStatusInfo> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "capture_status", handle)?;
        Ok(st.status.clone())
    }

    fn reset_capture_status(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "reset_capture_status", handle)?;
        st.status = CaptureStatusInfo::default();
        Ok(())
    }

    fn active_sequence_buffer(&self, handle: CameraHandle) -> DriverResult<ActiveBuffer> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "active_sequence_buffer", handle)?;
        let address_of = |id: Option<BufferId>| {
            id.and_then(|id| st.buffers.get(&id))
                .map_or(BufferAddress::from_ptr(std::ptr::null_mut()), |b| b.address)
        };
        let current = st.sequence.get(st.next_slot).copied();
        Ok(ActiveBuffer {
            number: st.next_slot as i32 + 1,
            current: address_of(current),
            last: address_of(st.last_completed),
        })
    }

    fn lock_seq_buf(
        &self,
        handle: CameraHandle,
        id: BufferId,
        address: BufferAddress,
    ) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "lock_seq_buf", handle)?;
        match st.buffers.get_mut(&id) {
            Some(buffer) if buffer.address == address => {
                buffer.locked = true;
                Ok(())
            }
            _ => Err(status::INVALID_PARAMETER),
        }
    }

    fn unlock_seq_buf(
        &self,
        handle: CameraHandle,
        id: BufferId,
        address: BufferAddress,
    ) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "unlock_seq_buf", handle)?;
        match st.buffers.get_mut(&id) {
            Some(buffer) if buffer.address == address => {
                buffer.locked = false;
                Ok(())
            }
            _ => Err(status::INVALID_PARAMETER),
        }
    }

    fn image_info(&self, handle: CameraHandle, id: BufferId) -> DriverResult<ImageInfo> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "image_info", handle)?;
        st.buffers
            .get(&id)
            .map(|b| b.info)
            .ok_or(status::INVALID_PARAMETER)
    }

    fn set_external_trigger(&self, handle: CameraHandle, mode: TriggerMode) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_external_trigger", handle)?;
        st.trigger = mode;
        Ok(())
    }

    fn trigger_status(&self, handle: CameraHandle) -> DriverResult<TriggerMode> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "trigger_status", handle)?;
        Ok(st.trigger)
    }

    fn capture_video(&self, handle: CameraHandle, _wait: bool) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "capture_video", handle)?;
        if st.live {
            return Ok(());
        }
        st.live = true;
        drop(st);
        match self.spawn_live_thread() {
            Ok(thread) => {
                self.inner.state.lock().live_thread = Some(thread);
                Ok(())
            }
            Err(_) => {
                self.inner.state.lock().live = false;
                Err(status::NO_SUCCESS)
            }
        }
    }

    fn freeze_video(&self, handle: CameraHandle, _wait: bool) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "freeze_video", handle)?;
        Self::produce_frame(&mut st);
        drop(st);
        self.inner.signal.notify_all();
        Ok(())
    }

    fn force_trigger(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "force_trigger", handle)
    }

    fn stop_live_video(&self, handle: CameraHandle, _wait: bool) -> DriverResult<()> {
        {
            let mut st = self.inner.state.lock();
            Self::enter_open(&mut st, "stop_live_video", handle)?;
        }
        self.stop_live_thread();
        Ok(())
    }

    fn frame_time_range(&self, handle: CameraHandle) -> DriverResult<FrameTimeRange> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "frame_time_range", handle)?;
        Ok(FrameTimeRange {
            min: 1.0 / self.max_fps(st.pixel_clock),
            max: 1.0 / self.inner.config.min_fps,
            increment: 1e-4,
        })
    }

    fn pixel_clock(&self, handle: CameraHandle) -> DriverResult<u32> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "pixel_clock", handle)?;
        Ok(st.pixel_clock)
    }

    fn pixel_clock_range(&self, handle: CameraHandle) -> DriverResult<PixelClockRange> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "pixel_clock_range", handle)?;
        Ok(match &self.inner.config.pixel_clocks {
            PixelClockMode::Range(range) => *range,
            PixelClockMode::Discrete(list) => PixelClockRange {
                min: list.first().copied().unwrap_or(0),
                max: list.last().copied().unwrap_or(0),
                increment: 0,
            },
        })
    }

    fn pixel_clock_count(&self, handle: CameraHandle) -> DriverResult<u32> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "pixel_clock_count", handle)?;
        Ok(self.inner.config.pixel_clocks.values().len() as u32)
    }

    fn pixel_clock_list(&self, handle: CameraHandle) -> DriverResult<Vec<u32>> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "pixel_clock_list", handle)?;
        Ok(self.inner.config.pixel_clocks.values())
    }

    fn set_pixel_clock(&self, handle: CameraHandle, clock: u32) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_pixel_clock", handle)?;
        if !self.inner.config.pixel_clocks.values().contains(&clock) {
            return Err(status::INVALID_PARAMETER);
        }
        st.pixel_clock = clock;
        let max_fps = self.max_fps(clock);
        if st.fps > max_fps {
            st.fps = max_fps;
        }
        Ok(())
    }

    fn set_frame_rate(&self, handle: CameraHandle, fps: f64) -> DriverResult<f64> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_frame_rate", handle)?;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(status::INVALID_PARAMETER);
        }
        let actual = fps.clamp(self.inner.config.min_fps, self.max_fps(st.pixel_clock));
        st.fps = actual;
        drop(st);
        self.inner.live_wake.notify_all();
        Ok(actual)
    }

    fn hdr_supported(&self, handle: CameraHandle) -> DriverResult<bool> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "hdr_supported", handle)?;
        Ok(self.inner.config.hdr_supported)
    }

    fn enable_hdr(&self, handle: CameraHandle) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "enable_hdr", handle)?;
        if !self.inner.config.hdr_supported {
            return Err(status::NOT_SUPPORTED);
        }
        st.hdr_enabled = true;
        Ok(())
    }

    fn aes_default_configuration(&self, handle: CameraHandle) -> DriverResult<AesConfiguration> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "aes_default_configuration", handle)?;
        Ok(AesConfiguration(vec![0x80, 0x04, 0x00, 0x00]))
    }

    fn aes_set_enabled(&self, handle: CameraHandle, enabled: bool) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "aes_set_enabled", handle)?;
        st.aes_enabled = enabled;
        Ok(())
    }

    fn aes_set_configuration(
        &self,
        handle: CameraHandle,
        _config: &AesConfiguration,
    ) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "aes_set_configuration", handle)
    }

    fn awb_supported_types(&self, handle: CameraHandle) -> DriverResult<AwbSupport> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "awb_supported_types", handle)?;
        Ok(self.inner.config.awb)
    }

    fn awb_set_type(&self, handle: CameraHandle, awb: AwbType) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "awb_set_type", handle)?;
        st.awb_type = Some(awb);
        Ok(())
    }

    fn awb_set_color_model(&self, handle: CameraHandle, _model: u32) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "awb_set_color_model", handle)
    }

    fn awb_set_enabled(&self, handle: CameraHandle, enabled: bool) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "awb_set_enabled", handle)?;
        st.awb_enabled = enabled;
        Ok(())
    }

    fn color_model_default(&self, handle: CameraHandle) -> DriverResult<u32> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "color_model_default", handle)?;
        Ok(2)
    }

    fn set_color_model(&self, handle: CameraHandle, model: u32) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_color_model", handle)?;
        st.color_model = model;
        Ok(())
    }

    fn color_temperature_range(&self, handle: CameraHandle) -> DriverResult<(u32, u32)> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "color_temperature_range", handle)?;
        Ok(self.inner.config.color_temperature_range)
    }

    fn set_color_temperature(&self, handle: CameraHandle, kelvin: u32) -> DriverResult<()> {
        let mut st = self.inner.state.lock();
        Self::enter_open(&mut st, "set_color_temperature", handle)?;
        let (min, max) = self.inner.config.color_temperature_range;
        if !(min..=max).contains(&kelvin) {
            return Err(status::INVALID_PARAMETER);
        }
        st.color_temperature = kelvin;
        Ok(())
    }
}
