//! Input device enumeration

use crate::audio::{negotiate_format, AudioFormat, DeviceCaps};
use crate::device::InputBackend;
use std::fmt;
use tracing::{debug, warn};

/// Information about an input device
#[derive(Clone)]
pub struct DeviceInfo {
    /// Device index as used by open
    pub index: u32,
    pub caps: DeviceCaps,
    /// Format the controller would negotiate for this device
    pub format: AudioFormat,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_marker = if self.index == 0 { " (default)" } else { "" };
        write!(f, "{}{}", self.caps, default_marker)
    }
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("index", &self.index)
            .field("name", &self.caps.name)
            .field("channels", &self.caps.channels)
            .field("formats", &self.caps.formats.names())
            .field("format", &self.format.to_string())
            .finish()
    }
}

/// List every input device whose capabilities can be read
///
/// Devices whose capability query fails are skipped with a warning.
pub fn enumerate_input_devices(backend: &dyn InputBackend) -> Vec<DeviceInfo> {
    let count = backend.device_count();
    debug!("Found {} input devices", count);

    let mut devices = Vec::with_capacity(count as usize);
    for index in 0..count {
        match backend.capabilities(index) {
            Ok(caps) => devices.push(DeviceInfo {
                index,
                format: negotiate_format(&caps),
                caps,
            }),
            Err(e) => warn!("Skipping input device {}: {}", index, e),
        }
    }

    devices
}
