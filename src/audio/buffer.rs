//! Fixed-size capture buffers lent to the input device

/// Nominal size of one capture buffer in bytes
pub const DATABLOCK_SIZE: usize = 32_768;

/// A fixed-size byte region filled by the device
///
/// The controller owns every buffer. While a buffer is queued on the
/// device it is moved into the backend, which hands it back through the
/// data callback or from `reset`.
#[derive(Debug)]
pub struct CaptureBuffer {
    id: usize,
    data: Box<[u8]>,
    bytes_recorded: usize,
    prepared: bool,
}

impl CaptureBuffer {
    /// Create a zeroed buffer of `capacity` bytes
    pub fn new(id: usize, capacity: usize) -> Self {
        Self {
            id,
            data: vec![0u8; capacity].into_boxed_slice(),
            bytes_recorded: 0,
            prepared: false,
        }
    }

    /// Capacity rounded down so that a full buffer holds whole frames
    pub fn aligned_capacity(block_align: usize) -> usize {
        if block_align == 0 {
            return DATABLOCK_SIZE;
        }
        (DATABLOCK_SIZE - DATABLOCK_SIZE % block_align).max(block_align)
    }

    /// Pool-unique identifier, stable across re-queues
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_recorded(&self) -> usize {
        self.bytes_recorded
    }

    /// Set the fill level reported by the device (clamped to capacity)
    pub fn set_bytes_recorded(&mut self, bytes: usize) {
        self.bytes_recorded = bytes.min(self.data.len());
    }

    /// The recorded prefix of the buffer
    pub fn recorded(&self) -> &[u8] {
        &self.data[..self.bytes_recorded]
    }

    /// Whole backing storage, for backends that hand it to the OS
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_full(&self) -> bool {
        self.bytes_recorded == self.data.len()
    }

    /// Append as much of `input` as fits; returns bytes consumed
    pub fn fill_from(&mut self, input: &[u8]) -> usize {
        let n = input.len().min(self.data.len() - self.bytes_recorded);
        self.data[self.bytes_recorded..self.bytes_recorded + n].copy_from_slice(&input[..n]);
        self.bytes_recorded += n;
        n
    }

    /// Forget recorded content before handing the buffer back to the device
    pub fn clear(&mut self) {
        self.bytes_recorded = 0;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Set by backends when header registration succeeds or is undone
    pub fn set_prepared(&mut self, prepared: bool) {
        self.prepared = prepared;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_capacity() {
        assert_eq!(CaptureBuffer::aligned_capacity(4), DATABLOCK_SIZE);
        assert_eq!(CaptureBuffer::aligned_capacity(2), DATABLOCK_SIZE);
        // Six channels of 16-bit samples do not divide 32 KB
        assert_eq!(CaptureBuffer::aligned_capacity(12), 32_760);
        assert_eq!(CaptureBuffer::aligned_capacity(6) % 6, 0);
    }

    #[test]
    fn test_fill_stops_at_capacity() {
        let mut buffer = CaptureBuffer::new(0, 8);
        assert_eq!(buffer.fill_from(&[1, 2, 3, 4, 5]), 5);
        assert!(!buffer.is_full());
        assert_eq!(buffer.fill_from(&[6, 7, 8, 9, 10]), 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.recorded(), &[1, 2, 3, 4, 5, 6, 7, 8]);

        buffer.clear();
        assert!(buffer.recorded().is_empty());
    }

    #[test]
    fn test_bytes_recorded_clamped() {
        let mut buffer = CaptureBuffer::new(3, 16);
        buffer.set_bytes_recorded(100);
        assert_eq!(buffer.bytes_recorded(), 16);
        assert_eq!(buffer.id(), 3);
    }
}
