//! Vendor camera driver interface.
//!
//! The vendor SDK is a C library: every function takes a camera handle plus
//! arguments and returns an integer status, where `0` means success. This
//! module models that surface as the [`CameraDriver`] trait. Each method
//! returns `Result<T, i32>`, and the error value is the raw, non-zero driver
//! status.
//!
//! The rest of the crate never talks to a driver directly. Every call goes
//! through [`api::Api`], which logs the call and turns failures into
//! [`CaptureError::Driver`](crate::CaptureError::Driver).
//!
//! Two implementations exist:
//! - Hardware bindings, which live outside this crate and implement the trait
//!   over FFI
//! - [`mock::MockDriver`], an in-process simulated camera used by the tests
//!   and the demo binary

pub mod api;
pub mod mock;

use std::collections::BTreeMap;
use std::time::Duration;

/// Raw driver result: `Err` carries the non-zero status code.
pub type DriverResult<T> = Result<T, i32>;

/// Driver status codes used by this crate.
pub mod status {
    /// Call succeeded.
    pub const SUCCESS: i32 = 0;
    /// Generic failure; details are available through the last-error query.
    pub const NO_SUCCESS: i32 = -1;
    /// The handle does not refer to an open camera.
    pub const INVALID_CAMERA_HANDLE: i32 = 1;
    /// The device could not be opened.
    pub const CANT_OPEN_DEVICE: i32 = 3;
    /// Memory allocation failed.
    pub const OUT_OF_MEMORY: i32 = 34;
    /// A wait timed out.
    pub const TIMED_OUT: i32 = 122;
    /// A parameter was out of range.
    pub const INVALID_PARAMETER: i32 = 125;
    /// The function is not supported by this device.
    pub const NOT_SUPPORTED: i32 = 155;
    /// The device needs a starter firmware upload before it can be opened.
    pub const STARTER_FW_UPLOAD_NEEDED: i32 = 182;
    /// The device is already paired with another host.
    pub const DEVICE_ALREADY_PAIRED: i32 = 197;
}

/// Opaque hardware handle returned by [`CameraDriver::init_camera`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CameraHandle(pub u32);

/// Driver-assigned id of an image buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub i32);

/// Address of driver-owned image memory.
///
/// Stored as an integer so it can cross threads; it is only turned back into
/// a pointer while the buffer is locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferAddress(usize);

impl BufferAddress {
    /// Wrap a raw buffer pointer.
    pub fn from_ptr(ptr: *mut u8) -> Self {
        Self(ptr as usize)
    }

    /// Raw pointer to the start of the buffer.
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Numeric address.
    pub fn get(self) -> usize {
        self.0
    }

    /// True for the null address the driver reports when no buffer is active.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Events the driver can signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverEvent {
    /// A frame finished transferring into a sequence buffer.
    FrameReady,
    /// Capture-status counters changed.
    CaptureStatus,
    /// User event: stop the device status observer.
    TerminateHandleThreads,
    /// User event: stop the capture dispatcher.
    TerminateCaptureThreads,
}

/// Event registration parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventInit {
    /// Event being registered.
    pub event: DriverEvent,
    /// Manual-reset events stay signalled until reset; auto-reset events are
    /// cleared by the wait that observes them.
    pub manual_reset: bool,
    /// Signalled immediately after registration.
    pub initially_signalled: bool,
}

/// Driver-level color modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorMode {
    /// 8-bit monochrome.
    Mono8,
    /// 16-bit monochrome.
    Mono16,
    /// 8-bit RGB, packed.
    Rgb8Packed,
    /// 12-bit RGB stored in 16-bit containers.
    Rgb12Unpacked,
}

/// Color filter arrangement of the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorColor {
    /// No color filter.
    Monochrome,
    /// Bayer color filter.
    Bayer,
    /// Any other arrangement, by raw driver value.
    Other(u8),
}

/// Static sensor description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorInfo {
    /// Sensor model name.
    pub name: String,
    /// Full-frame width in pixels.
    pub max_width: u32,
    /// Full-frame height in pixels.
    pub max_height: u32,
    /// Color filter arrangement.
    pub color: SensorColor,
}

/// One row of the driver's camera list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraListEntry {
    /// User-assignable camera id.
    pub camera_id: u32,
    /// Driver-assigned device id.
    pub device_id: u32,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Device is currently opened by some process.
    pub in_use: bool,
}

/// IP configuration features of a network device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct IpCapabilities {
    /// A persistent IP address can be configured.
    pub persistent: bool,
    /// An autoconfiguration address range can be configured.
    pub autoconfig: bool,
}

/// Broken-down local system time attached to a frame by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SystemTimestamp {
    /// Calendar year.
    pub year: u16,
    /// Month, 1-12.
    pub month: u8,
    /// Day of month, 1-31.
    pub day: u8,
    /// Hour, 0-23.
    pub hour: u8,
    /// Minute, 0-59.
    pub minute: u8,
    /// Second, 0-59.
    pub second: u8,
    /// Millisecond, 0-999.
    pub millisecond: u16,
}

/// Per-frame metadata reported by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ImageInfo {
    /// Device timestamp in 0.1 µs ticks.
    pub device_timestamp: u64,
    /// Monotonic frame counter.
    pub frame_number: u64,
    /// Host time the frame arrived.
    pub system_time: SystemTimestamp,
}

/// Result of the active sequence buffer query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveBuffer {
    /// Sequence number of the buffer currently being filled.
    pub number: i32,
    /// Buffer currently being filled.
    pub current: BufferAddress,
    /// Most recently completed buffer.
    pub last: BufferAddress,
}

/// External trigger source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free-running; no trigger.
    Off,
    /// Software trigger.
    Software,
}

/// Frame time limits at the current pixel clock, in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameTimeRange {
    /// Shortest frame time.
    pub min: f64,
    /// Longest frame time.
    pub max: f64,
    /// Step between frame times.
    pub increment: f64,
}

/// Pixel clock limits in MHz. An `increment` of 0 means only the discrete
/// list is valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelClockRange {
    /// Lowest clock.
    pub min: u32,
    /// Highest clock.
    pub max: u32,
    /// Step between clocks.
    pub increment: u32,
}

/// Automatic white balance algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AwbType {
    /// Color temperature estimation.
    ColorTemperature,
    /// Grey world assumption.
    GreyWorld,
}

/// AWB algorithms supported by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AwbSupport {
    /// [`AwbType::ColorTemperature`] is available.
    pub color_temperature: bool,
    /// [`AwbType::GreyWorld`] is available.
    pub grey_world: bool,
}

/// Device-defined auto exposure configuration block.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AesConfiguration(pub Vec<u8>);

/// Hardware-defined capture error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaptureErrorKind {
    /// No destination memory for the copy.
    ApiNoDestMem,
    /// Color conversion failed.
    ApiConversionFailed,
    /// Destination buffer was locked; frame dropped.
    ApiImageLocked,
    /// No free driver buffer.
    DrvOutOfBuffers,
    /// Device not ready.
    DrvDeviceNotReady,
    /// USB transfer failed.
    UsbTransferFailed,
    /// Device timed out.
    DevTimeout,
    /// Network receive buffer overrun.
    EthBufferOverrun,
    /// Device missed images.
    DevMissedImages,
}

impl CaptureErrorKind {
    /// Every category, in driver order.
    pub const ALL: [CaptureErrorKind; 9] = [
        CaptureErrorKind::ApiNoDestMem,
        CaptureErrorKind::ApiConversionFailed,
        CaptureErrorKind::ApiImageLocked,
        CaptureErrorKind::DrvOutOfBuffers,
        CaptureErrorKind::DrvDeviceNotReady,
        CaptureErrorKind::UsbTransferFailed,
        CaptureErrorKind::DevTimeout,
        CaptureErrorKind::EthBufferOverrun,
        CaptureErrorKind::DevMissedImages,
    ];

    /// Driver status code for the category.
    pub fn code(self) -> u32 {
        match self {
            CaptureErrorKind::ApiNoDestMem => 0xa2,
            CaptureErrorKind::ApiConversionFailed => 0xa3,
            CaptureErrorKind::ApiImageLocked => 0xa5,
            CaptureErrorKind::DrvOutOfBuffers => 0xb2,
            CaptureErrorKind::DrvDeviceNotReady => 0xb4,
            CaptureErrorKind::UsbTransferFailed => 0xc7,
            CaptureErrorKind::DevTimeout => 0xd6,
            CaptureErrorKind::EthBufferOverrun => 0xe4,
            CaptureErrorKind::DevMissedImages => 0xe5,
        }
    }

    /// Short upper-case name, as the vendor documents it.
    pub fn name(self) -> &'static str {
        match self {
            CaptureErrorKind::ApiNoDestMem => "API_NO_DEST_MEM",
            CaptureErrorKind::ApiConversionFailed => "API_CONVERSION_FAILED",
            CaptureErrorKind::ApiImageLocked => "API_IMAGE_LOCKED",
            CaptureErrorKind::DrvOutOfBuffers => "DRV_OUT_OF_BUFFERS",
            CaptureErrorKind::DrvDeviceNotReady => "DRV_DEVICE_NOT_READY",
            CaptureErrorKind::UsbTransferFailed => "USB_TRANSFER_FAILED",
            CaptureErrorKind::DevTimeout => "DEV_TIMEOUT",
            CaptureErrorKind::EthBufferOverrun => "ETH_BUFFER_OVERRUN",
            CaptureErrorKind::DevMissedImages => "DEV_MISSED_IMAGES",
        }
    }

    /// Human-readable explanation.
    pub fn description(self) -> &'static str {
        match self {
            CaptureErrorKind::ApiNoDestMem => {
                "there is no destination memory for copying the finished image"
            }
            CaptureErrorKind::ApiConversionFailed => {
                "the current image could not be processed correctly"
            }
            CaptureErrorKind::ApiImageLocked => "the destination buffers are locked",
            CaptureErrorKind::DrvOutOfBuffers => "no free internal image memory is available",
            CaptureErrorKind::DrvDeviceNotReady => "the camera is no longer available",
            CaptureErrorKind::UsbTransferFailed => {
                "the image was not transferred over the USB bus"
            }
            CaptureErrorKind::DevTimeout => "the maximum allowable time for image capturing was exceeded",
            CaptureErrorKind::EthBufferOverrun => {
                "the sensor transfers more data than the internal camera memory can hold"
            }
            CaptureErrorKind::DevMissedImages => {
                "images could not be transferred because of insufficient bandwidth"
            }
        }
    }
}

impl std::fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregate capture-status counters since the last reset.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CaptureStatusInfo {
    /// Sum of all category counters.
    pub total: u32,
    /// Counter per category; categories that never fired may be absent.
    pub counts: BTreeMap<CaptureErrorKind, u32>,
}

impl CaptureStatusInfo {
    /// Counter for one category, 0 when absent.
    pub fn count(&self, kind: CaptureErrorKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Native camera driver surface.
///
/// Implementations must be thread-safe: the status observer, the capture
/// dispatcher and the callback workers all issue calls concurrently.
pub trait CameraDriver: Send + Sync {
    // --- Enumeration -----------------------------------------------------

    /// List all connected cameras.
    fn camera_list(&self) -> DriverResult<Vec<CameraListEntry>>;
    /// IP configuration features; `NOT_SUPPORTED` for USB devices.
    fn ip_capabilities(&self, device_id: u32) -> DriverResult<IpCapabilities>;
    /// Persistent IP address and subnet mask, little-endian.
    fn persistent_ip(&self, device_id: u32) -> DriverResult<(u32, u32)>;
    /// First and last address of the autoconfiguration range, little-endian.
    fn autoconfig_ip_range(&self, device_id: u32) -> DriverResult<(u32, u32)>;

    // --- Lifecycle -------------------------------------------------------

    /// Open a camera, optionally allowing a starter firmware upload.
    fn init_camera(&self, camera_id: u32, allow_firmware_upload: bool)
        -> DriverResult<CameraHandle>;
    /// Estimated duration of a starter firmware upload.
    fn firmware_upload_duration(&self, camera_id: u32) -> DriverResult<Duration>;
    /// Close a camera.
    fn exit_camera(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Reset all parameters to defaults.
    fn reset_to_default(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Static sensor description.
    fn sensor_info(&self, handle: CameraHandle) -> DriverResult<SensorInfo>;
    /// Last error code and message for the handle.
    fn last_error(&self, handle: CameraHandle) -> DriverResult<(i32, String)>;

    // --- Format and memory -----------------------------------------------

    /// Select the color mode of captured images.
    fn set_color_mode(&self, handle: CameraHandle, mode: ColorMode) -> DriverResult<()>;
    /// Route captured images into user memory (device-independent bitmap mode).
    fn set_capture_to_memory(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Allocate one image buffer.
    fn alloc_image_mem(
        &self,
        handle: CameraHandle,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> DriverResult<(BufferAddress, BufferId)>;
    /// Append a buffer to the capture ring.
    fn add_to_sequence(
        &self,
        handle: CameraHandle,
        address: BufferAddress,
        id: BufferId,
    ) -> DriverResult<()>;
    /// Remove every buffer from the capture ring.
    fn clear_sequence(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Release one image buffer.
    fn free_image_mem(
        &self,
        handle: CameraHandle,
        address: BufferAddress,
        id: BufferId,
    ) -> DriverResult<()>;

    // --- Events ----------------------------------------------------------

    /// Register events.
    fn event_init(&self, handle: CameraHandle, events: &[EventInit]) -> DriverResult<()>;
    /// Enable registered events.
    fn event_enable(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()>;
    /// Disable events.
    fn event_disable(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()>;
    /// Unregister events.
    fn event_exit(&self, handle: CameraHandle, events: &[DriverEvent]) -> DriverResult<()>;
    /// Block until one of `events` is signalled and return it.
    /// `None` waits forever; a timeout returns `TIMED_OUT`.
    fn event_wait(
        &self,
        handle: CameraHandle,
        events: &[DriverEvent],
        timeout: Option<Duration>,
    ) -> DriverResult<DriverEvent>;
    /// Signal a user event.
    fn event_set(&self, handle: CameraHandle, event: DriverEvent) -> DriverResult<()>;
    /// Clear a manual-reset event.
    fn event_reset(&self, handle: CameraHandle, event: DriverEvent) -> DriverResult<()>;

    // --- Capture status --------------------------------------------------

    /// Aggregate capture error counters.
    fn capture_status(&self, handle: CameraHandle) -> DriverResult<CaptureStatusInfo>;
    /// Zero the capture error counters.
    fn reset_capture_status(&self, handle: CameraHandle) -> DriverResult<()>;

    // --- Acquisition -----------------------------------------------------

    /// Buffer currently being filled and the most recently completed one.
    fn active_sequence_buffer(&self, handle: CameraHandle) -> DriverResult<ActiveBuffer>;
    /// Protect a buffer from being overwritten.
    fn lock_seq_buf(&self, handle: CameraHandle, id: BufferId, address: BufferAddress)
        -> DriverResult<()>;
    /// Return a buffer to the capture ring.
    fn unlock_seq_buf(
        &self,
        handle: CameraHandle,
        id: BufferId,
        address: BufferAddress,
    ) -> DriverResult<()>;
    /// Metadata of the image in a buffer.
    fn image_info(&self, handle: CameraHandle, id: BufferId) -> DriverResult<ImageInfo>;
    /// Select the trigger source.
    fn set_external_trigger(&self, handle: CameraHandle, mode: TriggerMode) -> DriverResult<()>;
    /// Current trigger source.
    fn trigger_status(&self, handle: CameraHandle) -> DriverResult<TriggerMode>;
    /// Start free-running capture.
    fn capture_video(&self, handle: CameraHandle, wait: bool) -> DriverResult<()>;
    /// Capture a single frame.
    fn freeze_video(&self, handle: CameraHandle, wait: bool) -> DriverResult<()>;
    /// Fire a pending trigger immediately.
    fn force_trigger(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Stop free-running capture.
    fn stop_live_video(&self, handle: CameraHandle, wait: bool) -> DriverResult<()>;

    // --- Timing ----------------------------------------------------------

    /// Frame time limits at the current pixel clock.
    fn frame_time_range(&self, handle: CameraHandle) -> DriverResult<FrameTimeRange>;
    /// Current pixel clock in MHz.
    fn pixel_clock(&self, handle: CameraHandle) -> DriverResult<u32>;
    /// Pixel clock range.
    fn pixel_clock_range(&self, handle: CameraHandle) -> DriverResult<PixelClockRange>;
    /// Number of discrete pixel clocks.
    fn pixel_clock_count(&self, handle: CameraHandle) -> DriverResult<u32>;
    /// Discrete pixel clocks, ascending.
    fn pixel_clock_list(&self, handle: CameraHandle) -> DriverResult<Vec<u32>>;
    /// Set the pixel clock.
    fn set_pixel_clock(&self, handle: CameraHandle, clock: u32) -> DriverResult<()>;
    /// Request a frame rate; returns the rate actually applied.
    fn set_frame_rate(&self, handle: CameraHandle, fps: f64) -> DriverResult<f64>;

    // --- Auto features ---------------------------------------------------

    /// Whether the sensor supports HDR.
    fn hdr_supported(&self, handle: CameraHandle) -> DriverResult<bool>;
    /// Enable HDR.
    fn enable_hdr(&self, handle: CameraHandle) -> DriverResult<()>;
    /// Default auto exposure configuration.
    fn aes_default_configuration(&self, handle: CameraHandle) -> DriverResult<AesConfiguration>;
    /// Enable or disable auto exposure.
    fn aes_set_enabled(&self, handle: CameraHandle, enabled: bool) -> DriverResult<()>;
    /// Apply an auto exposure configuration.
    fn aes_set_configuration(
        &self,
        handle: CameraHandle,
        config: &AesConfiguration,
    ) -> DriverResult<()>;
    /// Supported AWB algorithms.
    fn awb_supported_types(&self, handle: CameraHandle) -> DriverResult<AwbSupport>;
    /// Select the AWB algorithm.
    fn awb_set_type(&self, handle: CameraHandle, awb: AwbType) -> DriverResult<()>;
    /// Color model the AWB algorithm works in.
    fn awb_set_color_model(&self, handle: CameraHandle, model: u32) -> DriverResult<()>;
    /// Enable or disable AWB.
    fn awb_set_enabled(&self, handle: CameraHandle, enabled: bool) -> DriverResult<()>;
    /// Default color model of the sensor.
    fn color_model_default(&self, handle: CameraHandle) -> DriverResult<u32>;
    /// Set the color model used for color temperature.
    fn set_color_model(&self, handle: CameraHandle, model: u32) -> DriverResult<()>;
    /// Supported color temperature range in Kelvin.
    fn color_temperature_range(&self, handle: CameraHandle) -> DriverResult<(u32, u32)>;
    /// Set the color temperature in Kelvin.
    fn set_color_temperature(&self, handle: CameraHandle, kelvin: u32) -> DriverResult<()>;
}
