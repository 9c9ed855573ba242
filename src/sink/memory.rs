//! In-memory sink

use crate::error::SinkError;
use crate::sink::DataSink;

/// Collects captured bytes in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    chunks: Vec<usize>,
    stops: usize,
    data_after_stop: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delivered byte, concatenated in delivery order
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of each delivered chunk
    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    /// Number of end-of-stream notifications received
    pub fn stop_count(&self) -> usize {
        self.stops
    }

    /// Whether any data arrived after an end-of-stream notification
    pub fn saw_data_after_stop(&self) -> bool {
        self.data_after_stop
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        self.chunks.clear();
        std::mem::take(&mut self.data)
    }
}

impl DataSink for MemorySink {
    fn on_new_data(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if self.stops > 0 {
            self.data_after_stop = true;
        }
        self.data.extend_from_slice(data);
        self.chunks.push(data.len());
        Ok(())
    }

    fn on_stopped(&mut self) -> Result<(), SinkError> {
        self.stops += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_order_and_stops() {
        let mut sink = MemorySink::new();
        sink.on_new_data(&[1, 2]).unwrap();
        sink.on_new_data(&[3]).unwrap();
        sink.on_stopped().unwrap();

        assert_eq!(sink.data(), &[1, 2, 3]);
        assert_eq!(sink.chunks(), &[2, 1]);
        assert_eq!(sink.stop_count(), 1);
        assert!(!sink.saw_data_after_stop());

        sink.on_new_data(&[4]).unwrap();
        assert!(sink.saw_data_after_stop());
        assert_eq!(sink.take_data(), vec![1, 2, 3, 4]);
        assert!(sink.chunks().is_empty());
    }
}
