//! pcmcap - raw PCM capture from a sound input device
//!
//! Negotiates a 16-bit PCM format with the input device, keeps a small
//! pool of capture buffers queued on it, and streams every filled buffer
//! to a pluggable sink until stopped.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod sink;

pub use error::{CaptureError, OsError, Result, SinkError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
