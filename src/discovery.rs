//! Camera enumeration.
//!
//! [`list_cameras`] turns the driver's camera list into [`CameraInfo`]
//! records. For each camera it also works out how the camera is connected:
//!
//! - USB devices report the IP configuration query as unsupported.
//! - GigE devices report either a persistent address, rendered `a.b.c.d/cidr`,
//!   or an autoconfiguration range, rendered `first:last`.

use crate::driver::api::Api;
use crate::driver::{status, CameraDriver};
use crate::error::{AppResult, CaptureError};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::debug;

/// How a camera is attached to the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    /// USB attached.
    Usb,
    /// Network attached.
    Ethernet {
        /// `a.b.c.d/cidr` for a persistent address, `first:last` for an
        /// autoconfiguration range.
        address: String,
        /// Address comes from the autoconfiguration range.
        autoconf: bool,
    },
}

/// Identity of one connected camera.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    /// Camera id used to open the device.
    pub camera_id: u32,
    /// Driver device id.
    pub device_id: u32,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Not opened by any process.
    pub available: bool,
    /// Connection type.
    pub connection: ConnectionKind,
}

impl CameraInfo {
    /// Label used in log lines, e.g. `1 (MODEL [#1234])`.
    pub fn label(&self) -> String {
        format!("{} ({} [#{}])", self.device_id, self.model, self.serial)
    }
}

/// Enumerate every connected camera.
pub fn list_cameras(driver: &dyn CameraDriver) -> AppResult<Vec<CameraInfo>> {
    let api = Api::new(driver, None, "bus");
    let entries = api.call_msg("camera_list", "could not enumerate cameras", |d| {
        d.camera_list()
    })?;

    let mut cameras = Vec::with_capacity(entries.len());
    for entry in entries {
        let connection = connection_kind(&api, entry.device_id)?;
        debug!(
            device_id = entry.device_id,
            model = %entry.model,
            ?connection,
            "Found camera"
        );
        cameras.push(CameraInfo {
            camera_id: entry.camera_id,
            device_id: entry.device_id,
            model: entry.model,
            serial: entry.serial,
            available: !entry.in_use,
            connection,
        });
    }
    Ok(cameras)
}

fn connection_kind(api: &Api<'_>, device_id: u32) -> AppResult<ConnectionKind> {
    let capabilities = match api.driver().ip_capabilities(device_id) {
        Ok(capabilities) => capabilities,
        Err(status::NOT_SUPPORTED) => return Ok(ConnectionKind::Usb),
        Err(code) => {
            return Err(CaptureError::Driver {
                call: "ip_capabilities",
                code,
                message: format!("could not query IP configuration of device {device_id}"),
            })
        }
    };

    if capabilities.persistent {
        let (address, mask) = api.call("persistent_ip", |d| d.persistent_ip(device_id))?;
        return Ok(ConnectionKind::Ethernet {
            address: format!(
                "{}/{}",
                ip_from_le_u32(address),
                netmask_to_cidr(ip_from_le_u32(mask))
            ),
            autoconf: false,
        });
    }

    if capabilities.autoconfig {
        let (first, last) = api.call("autoconfig_ip_range", |d| d.autoconfig_ip_range(device_id))?;
        return Ok(ConnectionKind::Ethernet {
            address: format!("{}:{}", ip_from_le_u32(first), ip_from_le_u32(last)),
            autoconf: true,
        });
    }

    Ok(ConnectionKind::Usb)
}

/// Address stored by the driver with the first octet in the lowest byte.
pub fn ip_from_le_u32(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_le_bytes())
}

/// Prefix length of a subnet mask.
pub fn netmask_to_cidr(mask: Ipv4Addr) -> u32 {
    u32::from(mask).leading_ones()
}
