//! Logging wrapper around every driver call.
//!
//! Every driver call site is written as
//!
//! ```ignore
//! let (address, id) = api.call("alloc_image_mem", |d| d.alloc_image_mem(h, w, ht, bpp))?;
//! ```
//!
//! The wrapper does the following:
//! - on success, logs the call at debug level
//! - on failure, logs a warning carrying the call name, the caller's source
//!   location, the camera label and a normalized message
//! - if a cleanup closure was supplied, runs it before returning
//! - returns [`CaptureError::Driver`], so driver failures stay distinguishable
//!   from logic errors
//!
//! When the caller supplies no message and the driver answered with the
//! generic `NO_SUCCESS` code, the message comes from the driver's own
//! last-error query.

use super::{status, CameraDriver, CameraHandle, DriverResult};
use crate::error::{AppResult, CaptureError};
use std::panic::Location;
use tracing::{debug, warn};

/// Rendered when no message could be obtained.
const EMPTY_MESSAGE: &str = "<empty>";

/// Call context: driver, optional open handle and a label for log lines.
#[derive(Clone, Copy)]
pub struct Api<'a> {
    driver: &'a dyn CameraDriver,
    handle: Option<CameraHandle>,
    label: &'a str,
}

impl<'a> Api<'a> {
    /// Create a call context.
    ///
    /// `handle` is used for the last-error query and may be `None` before the
    /// camera is open.
    pub fn new(driver: &'a dyn CameraDriver, handle: Option<CameraHandle>, label: &'a str) -> Self {
        Self {
            driver,
            handle,
            label,
        }
    }

    /// Invoke a driver call.
    #[track_caller]
    pub fn call<T>(
        &self,
        name: &'static str,
        f: impl FnOnce(&dyn CameraDriver) -> DriverResult<T>,
    ) -> AppResult<T> {
        self.invoke(name, "", f, None::<fn()>, Location::caller())
    }

    /// Invoke a driver call with an explicit failure message.
    #[track_caller]
    pub fn call_msg<T>(
        &self,
        name: &'static str,
        message: &str,
        f: impl FnOnce(&dyn CameraDriver) -> DriverResult<T>,
    ) -> AppResult<T> {
        self.invoke(name, message, f, None::<fn()>, Location::caller())
    }

    /// Invoke a driver call and run `cleanup` if it fails.
    #[track_caller]
    pub fn call_or_cleanup<T>(
        &self,
        name: &'static str,
        f: impl FnOnce(&dyn CameraDriver) -> DriverResult<T>,
        cleanup: impl FnOnce(),
    ) -> AppResult<T> {
        self.invoke(name, "", f, Some(cleanup), Location::caller())
    }

    fn invoke<T, C: FnOnce()>(
        &self,
        name: &'static str,
        message: &str,
        f: impl FnOnce(&dyn CameraDriver) -> DriverResult<T>,
        cleanup: Option<C>,
        caller: &'static Location<'static>,
    ) -> AppResult<T> {
        match f(self.driver) {
            Ok(value) => {
                debug!(call = name, camera = self.label, caller = %caller, "Driver call succeeded");
                Ok(value)
            }
            Err(code) => {
                let message = self.normalize_message(code, message);
                warn!(
                    call = name,
                    code,
                    camera = self.label,
                    caller = %caller,
                    "Driver call failed: {}",
                    message
                );
                if let Some(cleanup) = cleanup {
                    cleanup();
                }
                Err(CaptureError::Driver {
                    call: name,
                    code,
                    message,
                })
            }
        }
    }

    fn normalize_message(&self, code: i32, message: &str) -> String {
        if !message.is_empty() {
            return message.to_string();
        }
        if code == status::NO_SUCCESS {
            if let Some(handle) = self.handle {
                if let Ok((_, text)) = self.driver.last_error(handle) {
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
        }
        EMPTY_MESSAGE.to_string()
    }

    /// The wrapped driver.
    pub fn driver(&self) -> &'a dyn CameraDriver {
        self.driver
    }

    /// Open handle, if any.
    pub fn handle(&self) -> Option<CameraHandle> {
        self.handle
    }

    /// Label used in log lines.
    pub fn label(&self) -> &'a str {
        self.label
    }
}
