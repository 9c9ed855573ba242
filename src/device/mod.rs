//! Platform audio input surface
//!
//! The controller talks to the OS through three traits: an
//! [`InputBackend`] that enumerates and opens devices, the opened
//! [`CaptureDevice`], and a [`DeviceCallback`] the device drives from its
//! own thread.

mod enumerator;
pub mod simulated;
#[cfg(windows)]
pub mod wavein;

pub use enumerator::{enumerate_input_devices, DeviceInfo};
pub use simulated::{FaultPoint, SimulatedBackend};
#[cfg(windows)]
pub use wavein::WaveInBackend;

use crate::audio::{AudioFormat, CaptureBuffer, DeviceCaps};
use crate::error::OsError;
use std::sync::Arc;

/// Device enumeration and open
pub trait InputBackend: Send + Sync {
    /// Number of input devices currently present
    fn device_count(&self) -> u32;

    /// Query capabilities of the device at `index`
    fn capabilities(&self, index: u32) -> Result<DeviceCaps, OsError>;

    /// Open the device at `index` for input in `format`
    ///
    /// `callback` receives every filled buffer and the close notification
    /// until the device acknowledges close.
    fn open(
        &self,
        index: u32,
        format: &AudioFormat,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Arc<dyn CaptureDevice>, OsError>;

    /// Translate an error code into text
    fn error_text(&self, code: u32) -> String;
}

/// A buffer the device refused to take, handed back with the error
#[derive(Debug)]
pub struct Rejected {
    pub error: OsError,
    pub buffer: CaptureBuffer,
}

/// An opened input device
///
/// Methods take `&self` because the callback thread re-queues buffers
/// while the caller thread may be tearing the device down.
pub trait CaptureDevice: Send + Sync {
    /// Register a buffer with the device before queueing it
    ///
    /// A registered buffer stays registered across re-queues until
    /// `unprepare`.
    fn prepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError>;

    /// Queue a prepared buffer for filling
    fn enqueue(&self, buffer: CaptureBuffer) -> Result<(), Rejected>;

    fn start(&self) -> Result<(), OsError>;

    /// Samples captured since open
    fn position(&self) -> Result<u64, OsError>;

    /// Stop capture and return every buffer still queued, in queue order
    fn reset(&self) -> Result<Vec<CaptureBuffer>, OsError>;

    fn unprepare(&self, buffer: &mut CaptureBuffer) -> Result<(), OsError>;

    /// Close the device; the close notification follows on the callback
    fn close(&self) -> Result<(), OsError>;
}

/// Receiver of device notifications, invoked from the device's thread
pub trait DeviceCallback: Send + Sync {
    /// A queued buffer was filled (or returned early by a reset)
    fn on_data(&self, device: &dyn CaptureDevice, buffer: CaptureBuffer);

    /// The device finished closing
    fn on_close(&self);
}

/// The input backend for this platform
///
/// waveIn on Windows. Other platforms get a simulated backend with no
/// devices, so capture start reports a missing input device.
pub fn default_backend() -> Arc<dyn InputBackend> {
    #[cfg(windows)]
    {
        Arc::new(WaveInBackend::new())
    }

    #[cfg(not(windows))]
    {
        Arc::new(SimulatedBackend::new(Vec::new()))
    }
}

/// winmm result codes used across backends
pub mod mmsys {
    pub const NOERROR: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const BADDEVICEID: u32 = 2;
    pub const ALLOCATED: u32 = 4;
    pub const INVALHANDLE: u32 = 5;
    pub const NODRIVER: u32 = 6;
    pub const NOMEM: u32 = 7;
    pub const INVALPARAM: u32 = 11;
    pub const WAVERR_BADFORMAT: u32 = 32;
    pub const WAVERR_STILLPLAYING: u32 = 33;
    pub const WAVERR_UNPREPARED: u32 = 34;

    /// Text for a result code, worded like the system message table
    pub fn error_text(code: u32) -> String {
        match code {
            NOERROR => "The command completed successfully.",
            ERROR => "Undefined external error.",
            BADDEVICEID => "A device ID has been used that is out of range for your system.",
            ALLOCATED => "The specified device is already in use. Wait until it is free, and then try again.",
            INVALHANDLE => "The device handle is invalid.",
            NODRIVER => "There is no driver installed on your system.",
            NOMEM => "There is not enough memory available for this task.",
            INVALPARAM => "An invalid parameter was passed to a system function.",
            WAVERR_BADFORMAT => "The specified format is not supported or cannot be translated.",
            WAVERR_STILLPLAYING => "Cannot perform this operation while media data is still playing.",
            WAVERR_UNPREPARED => "The wave header was not prepared.",
            _ => return format!("Unknown error (code {})", code),
        }
        .to_string()
    }
}
