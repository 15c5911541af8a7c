//! Custom error types for the capture library.
//!
//! This module defines the primary error type, `CaptureError`, used by every
//! fallible operation in the crate. It is built with the `thiserror` crate.
//!
//! ## Error Hierarchy
//!
//! `CaptureError` groups failures by where they come from and how the caller is
//! expected to react:
//!
//! - **`Driver`**: A driver call returned a non-zero status code. It carries:
//!   - the call name
//!   - the raw code
//!   - a normalized message, taken from the driver's last-error query when the
//!     call site did not supply one
//!
//!   Most of these are environmental: the device was disconnected, was busy,
//!   or is misconfigured.
//! - **`UnknownBuffer`**: A buffer address was not registered with the buffer
//!   pool. This is a *logic error*: the driver and the pool disagree about
//!   which memory is live. It is kept separate from driver failures so callers
//!   can tell the two apart (see [`CaptureError::is_logic_error`]).
//! - **`NoBuffers`**: Buffer pool initialization produced zero usable buffers.
//! - **`FirmwareUploadRetriesExhausted`**: The device kept asking for a starter
//!   firmware upload and the retry policy ran out.
//! - **`UnsupportedWhiteBalance`** / **`PixelClockQuery`**: Parameter plumbing
//!   could not find a usable mode.
//! - **`InvalidTimestamp`** / **`ImageLayout`**: Per-frame failures in the
//!   dispatcher. These are logged and drop a single frame.
//! - **`Callback`**: A user frame callback failed. Logged and counted; the
//!   buffer is still released.
//! - **`Config`** / **`Configuration`**: Configuration could not be parsed, or
//!   it parsed but failed validation.
//! - **`Io`** / **`Join`**: Thread spawn failures and async facade failures.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Errors produced by the capture library.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// A driver call returned a non-zero status.
    #[error("{message}; {call}() returned with code {code}")]
    Driver {
        /// Name of the driver call.
        call: &'static str,
        /// Raw status code returned by the driver.
        code: i32,
        /// Normalized error message.
        message: String,
    },

    /// A buffer address was not found in the buffer pool.
    #[error("buffer address {0:#x} is not managed by the buffer pool")]
    UnknownBuffer(usize),

    /// No image buffer could be allocated and registered.
    #[error("failed to allocate any image buffers")]
    NoBuffers,

    /// Starter firmware upload kept failing.
    #[error("opening camera failed; too many firmware upload retries ({attempts})")]
    FirmwareUploadRetriesExhausted {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Neither the color-temperature nor the grey-world AWB mode is available.
    #[error("no known automatic white balance modes supported")]
    UnsupportedWhiteBalance,

    /// The pixel clock list could not be obtained.
    #[error("failed to query the supported pixel clock values")]
    PixelClockQuery,

    /// The driver reported a system timestamp that does not form a valid date.
    #[error("invalid frame timestamp: {0}")]
    InvalidTimestamp(String),

    /// A buffer could not be viewed as the configured pixel format.
    #[error("image layout error: {0}")]
    ImageLayout(String),

    /// A frame callback returned an error or panicked.
    #[error("frame callback failed: {0}")]
    Callback(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure, typically while spawning a thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task on the async runtime failed to complete.
    #[error("Tokio runtime error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<figment::Error> for CaptureError {
    fn from(err: figment::Error) -> Self {
        CaptureError::Config(Box::new(err))
    }
}

impl CaptureError {
    /// True for programming errors, as opposed to driver or environment failures.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, CaptureError::UnknownBuffer(_))
    }

    /// Raw driver status code, if this error came from a driver call.
    pub fn driver_code(&self) -> Option<i32> {
        match self {
            CaptureError::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}
