//! Consumers of captured sample data

mod memory;
mod raw_file;
mod wav;

pub use memory::MemorySink;
pub use raw_file::{RawFileSink, StagingBuffer, DEFAULT_OUTPUT_PATH, RECORD_BUFFER_SIZE};
pub use wav::wrap_raw_as_wav;

use crate::error::SinkError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receiver of captured sample bytes
///
/// Called from the device callback thread, so implementations must not
/// block for long. Errors stay inside the sink: the controller logs them
/// and carries on.
pub trait DataSink: Send {
    /// One filled capture buffer, in capture order
    fn on_new_data(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// End of stream; called once after the device has closed
    fn on_stopped(&mut self) -> Result<(), SinkError>;
}

/// A sink shared between its owner and the capture controller
pub type SharedSink = Arc<Mutex<dyn DataSink>>;

/// Wrap a sink for attaching to a controller while keeping a typed handle
pub fn shared<S: DataSink + 'static>(sink: S) -> Arc<Mutex<S>> {
    Arc::new(Mutex::new(sink))
}
