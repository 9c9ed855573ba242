//! Audio format negotiation, capture buffers and the capture controller

mod buffer;
mod controller;
mod negotiate;

pub use buffer::{CaptureBuffer, DATABLOCK_SIZE};
pub use controller::{CaptureController, ControllerConfig, ControllerState, ResidualPolicy};
pub use negotiate::{negotiate_format, DeviceCaps, FormatFlags};

/// WAVE_FORMAT_PCM format tag
pub const FORMAT_TAG_PCM: u16 = 1;

/// Audio format information
///
/// Samples are signed little-endian integers interleaved by channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub const BITS_PER_SAMPLE: u16 = 16;

    /// 16-bit PCM at the given rate and channel count
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: Self::BITS_PER_SAMPLE,
        }
    }

    /// Bytes in one multi-channel sample frame
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    /// Calculate bytes per second
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Calculate buffer size in bytes for given milliseconds
    pub fn buffer_size_for_ms(&self, ms: u32) -> usize {
        ((self.bytes_per_second() as u64 * ms as u64) / 1000) as usize
    }

    /// Duration in milliseconds covered by `bytes` of audio
    pub fn bytes_to_ms(&self, bytes: usize) -> u64 {
        match self.bytes_per_second() {
            0 => 0,
            rate => bytes as u64 * 1000 / rate as u64,
        }
    }

    /// Calculate number of frames for given bytes
    pub fn bytes_to_frames(&self, bytes: usize) -> u64 {
        match self.block_align() {
            0 => 0,
            align => (bytes / align as usize) as u64,
        }
    }

    /// Round `bytes` down to a whole number of frames
    pub fn align_down(&self, bytes: usize) -> usize {
        match self.block_align() as usize {
            0 => 0,
            align => bytes - bytes % align,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_fields() {
        let stereo = AudioFormat::pcm16(44_100, 2);
        assert_eq!(stereo.block_align(), 4);
        assert_eq!(stereo.bytes_per_second(), 176_400);

        let mono = AudioFormat::pcm16(22_050, 1);
        assert_eq!(mono.block_align(), 2);
        assert_eq!(mono.bytes_per_second(), 44_100);
    }

    #[test]
    fn test_frame_math() {
        let format = AudioFormat::pcm16(44_100, 2);
        assert_eq!(format.bytes_to_frames(32_768), 8_192);
        assert_eq!(format.align_down(32_770), 32_768);
        assert_eq!(format.buffer_size_for_ms(1000), 176_400);
        // One 32 KB block at CD stereo is a little under 186 ms
        assert_eq!(format.bytes_to_ms(32_768), 185);
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::pcm16(22_050, 1).to_string(), "22050Hz 1ch 16bit");
    }
}
