//! Driver image buffer lifecycle.
//!
//! The pool owns the set of image buffers registered with the driver's capture
//! sequence. It maps each buffer's memory address, which is what the driver
//! reports for a completed frame, to the driver buffer id that lock, unlock
//! and metadata calls need.
//!
//! ## Lifecycle
//!
//! 1. [`BufferPool::initialize`] allocates up to `count` buffers and appends
//!    each one to the sequence. A buffer that fails either step is released
//!    and skipped. Only zero usable buffers is fatal.
//! 2. While capturing, the map is read-only; [`BufferPool::id_of`] resolves
//!    addresses.
//! 3. [`BufferPool::cleanup`] clears the sequence and then frees buffers one
//!    by one. Failures are logged and never abort the loop. An empty pool
//!    makes no driver calls.

use crate::driver::api::Api;
use crate::driver::{BufferAddress, BufferId, CameraHandle};
use crate::error::{AppResult, CaptureError};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Address-to-id map of the buffers registered with the driver.
#[derive(Debug, Default)]
pub struct BufferPool {
    entries: BTreeMap<BufferAddress, BufferId>,
    buffer_len: usize,
}

impl BufferPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and register up to `count` buffers of `width` x `height` at
    /// `bits_per_pixel`.
    ///
    /// Returns the number of buffers that made it into the sequence. An
    /// already initialized pool is cleaned up first.
    pub fn initialize(
        &mut self,
        api: &Api<'_>,
        handle: CameraHandle,
        count: usize,
        width: u32,
        height: u32,
        bits_per_pixel: u32,
    ) -> AppResult<usize> {
        if !self.entries.is_empty() {
            self.cleanup(api, handle);
        }

        self.buffer_len =
            (width as usize * height as usize * bits_per_pixel as usize).div_ceil(8);

        for index in 0..count {
            let (address, id) = match api.call("alloc_image_mem", |d| {
                d.alloc_image_mem(handle, width, height, bits_per_pixel)
            }) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!(camera = api.label(), index, error = %e, "Skipping image buffer");
                    continue;
                }
            };

            let registered = api.call_or_cleanup(
                "add_to_sequence",
                |d| d.add_to_sequence(handle, address, id),
                || {
                    let _ = api.call("free_image_mem", |d| d.free_image_mem(handle, address, id));
                },
            );
            match registered {
                Ok(()) => {
                    debug!(camera = api.label(), index, buffer_id = id.0, "Image buffer registered");
                    self.entries.insert(address, id);
                }
                Err(e) => {
                    warn!(camera = api.label(), index, error = %e, "Skipping image buffer");
                }
            }
        }

        if self.entries.is_empty() {
            return Err(CaptureError::NoBuffers);
        }

        info!(
            camera = api.label(),
            requested = count,
            allocated = self.entries.len(),
            buffer_bytes = self.buffer_len,
            "Buffer pool initialized"
        );
        Ok(self.entries.len())
    }

    /// Driver id of the buffer at `address`.
    ///
    /// An unknown address is a logic error, not a driver failure.
    pub fn id_of(&self, address: BufferAddress) -> AppResult<BufferId> {
        self.entries
            .get(&address)
            .copied()
            .ok_or(CaptureError::UnknownBuffer(address.get()))
    }

    /// Release every buffer.
    pub fn cleanup(&mut self, api: &Api<'_>, handle: CameraHandle) {
        if self.entries.is_empty() {
            return;
        }

        // Errors are already logged by the call wrapper.
        let _ = api.call("clear_sequence", |d| d.clear_sequence(handle));

        let mut failed = 0usize;
        for (address, id) in std::mem::take(&mut self.entries) {
            if api
                .call("free_image_mem", |d| d.free_image_mem(handle, address, id))
                .is_err()
            {
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(camera = api.label(), failed, "Some image buffers could not be freed");
        } else {
            debug!(camera = api.label(), "Buffer pool released");
        }
    }

    /// Registered buffers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No buffers registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size in bytes of each buffer.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Registered `(address, id)` pairs, ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = (BufferAddress, BufferId)> + '_ {
        self.entries.iter().map(|(address, id)| (*address, *id))
    }
}
