//! # Camera Capture Library
//!
//! Event-driven image acquisition for USB and GigE industrial cameras. The
//! crate wraps a vendor camera driver behind the [`driver::CameraDriver`] trait
//! and turns it into two owned, drop-safe sessions:
//!
//! - a [`device::DeviceSession`] owns the opened camera, its buffer pool, its
//!   driver events and a status observer thread that folds asynchronous
//!   capture errors into [`error_stats::ErrorStats`]
//! - a [`capture::CaptureSession`] borrows a device session and feeds every
//!   completed frame to a user callback on a bounded worker pool
//!
//! ## Crate Structure
//!
//! - **`driver`**: The `CameraDriver` trait, its value types, the status-code
//!   wrapper `Api`, and the in-process `MockDriver`.
//! - **`discovery`**: Enumeration of connected cameras and their connection type.
//! - **`buffer_pool`**: Driver image memory, indexed by address.
//! - **`device`**: Opening (with starter firmware upload), setup, parameters,
//!   teardown.
//! - **`capture`**: Frame dispatch in continuous and triggered mode.
//! - **`image`**: Pixel formats and typed views over frame memory.
//! - **`error_stats`**: Per-category capture error accounting.
//! - **`retry`**: Retry policies for the operations the driver may refuse
//!   transiently.
//! - **`config`**: Figment-based configuration loading.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`error`**: The `CaptureError` enum used throughout.
//!
//! ## Quick Start
//!
//! ```no_run
//! use camera_capture::capture::Continuous;
//! use camera_capture::device::DeviceSession;
//! use camera_capture::discovery::list_cameras;
//! use camera_capture::driver::mock::MockDriver;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Arc::new(MockDriver::new());
//! let camera = list_cameras(&*driver)?.remove(0);
//! let device = DeviceSession::builder(driver, camera)
//!     .concurrency(4)
//!     .on_capture_error(|event| eprintln!("{}: +{}", event.kind, event.new_events))
//!     .open()?;
//! device.set_fps(10.0)?;
//!
//! let session = device.capture::<Continuous, _>(|image, meta| {
//!     println!("frame {} ({:?})", meta.frame_number, image.format());
//!     Ok(())
//! })?;
//! std::thread::sleep(Duration::from_secs(1));
//! drop(session);
//! # Ok(())
//! # }
//! ```

pub mod buffer_pool;
pub mod capture;
pub mod config;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod error_stats;
pub mod image;
pub mod logging;
pub mod retry;

pub use capture::{CaptureSession, Continuous, FrameMeta, Triggered};
pub use device::{DeviceSession, WhiteBalance};
pub use error::{AppResult, CaptureError};
pub use image::{ImageView, PixelFormat};
