//! Unified error types for pcmcap

use crate::audio::ControllerState;
use thiserror::Error;

/// Error reported by the platform audio input layer
///
/// `text` is the OS translation of `code` (waveInGetErrorText on Windows).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{text}")]
pub struct OsError {
    pub code: u32,
    pub text: String,
}

impl OsError {
    pub fn new(code: u32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

/// Main error type for capture controller operations
///
/// Every OS-derived variant renders as `"<context>: <os-error-text>"`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No capture device present at start
    #[error("Can not find input device")]
    NoInputDevice,

    #[error("capability query failed: {0}")]
    CapabilityQueryFailed(OsError),

    #[error("device open failed: {0}")]
    OpenFailed(OsError),

    #[error("buffer prepare failed: {0}")]
    BufferPrepareFailed(OsError),

    #[error("buffer enqueue failed: {0}")]
    EnqueueFailed(OsError),

    #[error("capture start failed: {0}")]
    StartFailed(OsError),

    #[error("position query failed: {0}")]
    PositionQueryFailed(OsError),

    #[error("device reset failed: {0}")]
    ResetFailed(OsError),

    #[error("buffer unprepare failed: {0}")]
    UnprepareFailed(OsError),

    #[error("device close failed: {0}")]
    CloseFailed(OsError),

    /// Operation not allowed in the current controller state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, CaptureError>;

impl CaptureError {
    /// The underlying OS error, if this failure came from the platform layer
    pub fn os_error(&self) -> Option<&OsError> {
        match self {
            CaptureError::CapabilityQueryFailed(e)
            | CaptureError::OpenFailed(e)
            | CaptureError::BufferPrepareFailed(e)
            | CaptureError::EnqueueFailed(e)
            | CaptureError::StartFailed(e)
            | CaptureError::PositionQueryFailed(e)
            | CaptureError::ResetFailed(e)
            | CaptureError::UnprepareFailed(e)
            | CaptureError::CloseFailed(e) => Some(e),
            CaptureError::NoInputDevice | CaptureError::InvalidState { .. } => None,
        }
    }

    /// Misuse errors are returned to the caller but never latched
    pub fn is_misuse(&self) -> bool {
        matches!(self, CaptureError::InvalidState { .. })
    }
}

/// Errors raised inside a data sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink write to '{path}' failed: {source}")]
    WriteFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("sink already closed")]
    Closed,

    #[error("WAV conversion failed: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
