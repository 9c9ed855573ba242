//! Capture format selection from reported device capabilities

use crate::audio::AudioFormat;
use std::fmt;
use tracing::debug;

/// Supported-format bitmask in the waveIn `WAVE_FORMAT_*` layout
///
/// Bit names read `<rate><layout><bits>`: rate 1 = 11.025 kHz,
/// 2 = 22.05 kHz, 4 = 44.1 kHz; layout M = mono, S = stereo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatFlags(pub u32);

impl FormatFlags {
    pub const F1M08: u32 = 0x0000_0001;
    pub const F1S08: u32 = 0x0000_0002;
    pub const F1M16: u32 = 0x0000_0004;
    pub const F1S16: u32 = 0x0000_0008;
    pub const F2M08: u32 = 0x0000_0010;
    pub const F2S08: u32 = 0x0000_0020;
    pub const F2M16: u32 = 0x0000_0040;
    pub const F2S16: u32 = 0x0000_0080;
    pub const F4M08: u32 = 0x0000_0100;
    pub const F4S08: u32 = 0x0000_0200;
    pub const F4M16: u32 = 0x0000_0400;
    pub const F4S16: u32 = 0x0000_0800;

    const NAMES: [(u32, &'static str); 12] = [
        (Self::F1M08, "11.025 kHz mono 8-bit"),
        (Self::F1S08, "11.025 kHz stereo 8-bit"),
        (Self::F1M16, "11.025 kHz mono 16-bit"),
        (Self::F1S16, "11.025 kHz stereo 16-bit"),
        (Self::F2M08, "22.05 kHz mono 8-bit"),
        (Self::F2S08, "22.05 kHz stereo 8-bit"),
        (Self::F2M16, "22.05 kHz mono 16-bit"),
        (Self::F2S16, "22.05 kHz stereo 16-bit"),
        (Self::F4M08, "44.1 kHz mono 8-bit"),
        (Self::F4S08, "44.1 kHz stereo 8-bit"),
        (Self::F4M16, "44.1 kHz mono 16-bit"),
        (Self::F4S16, "44.1 kHz stereo 16-bit"),
    ];

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Human-readable names of every advertised format
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Capabilities reported by an input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Product name as reported by the driver
    pub name: String,
    pub formats: FormatFlags,
    pub channels: u16,
}

impl DeviceCaps {
    pub fn new(name: impl Into<String>, formats: u32, channels: u16) -> Self {
        Self {
            name: name.into(),
            formats: FormatFlags(formats),
            channels,
        }
    }

    /// Whether the device can record 44.1 kHz 16-bit stereo
    pub fn supports_cd_stereo(&self) -> bool {
        self.formats.contains(FormatFlags::F4S16)
    }
}

impl fmt::Display for DeviceCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}ch)", self.name, self.channels)
    }
}

/// Pick the capture format for a device
///
/// 44.1 kHz stereo when advertised, otherwise 22.05 kHz with the
/// device's own channel count. Always 16-bit PCM.
pub fn negotiate_format(caps: &DeviceCaps) -> AudioFormat {
    let format = if caps.supports_cd_stereo() {
        AudioFormat::pcm16(44_100, 2)
    } else {
        AudioFormat::pcm16(22_050, caps.channels.max(1))
    };

    debug!("Negotiated {} for '{}'", format, caps.name);
    format
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cd_stereo_preferred() {
        let caps = DeviceCaps::new("Line In", FormatFlags::F4S16 | FormatFlags::F2M16, 2);
        assert_eq!(negotiate_format(&caps), AudioFormat::pcm16(44_100, 2));
    }

    #[test]
    fn test_fallback_uses_device_channels() {
        let caps = DeviceCaps::new("Headset", FormatFlags::F4M16 | FormatFlags::F2M16, 1);
        let format = negotiate_format(&caps);
        assert_eq!(format.sample_rate, 22_050);
        assert_eq!(format.channels, 1);
        assert_eq!(format.bits_per_sample, 16);
    }

    #[test]
    fn test_zero_channel_report_clamped() {
        let caps = DeviceCaps::new("Broken driver", 0, 0);
        assert_eq!(negotiate_format(&caps).channels, 1);
    }

    #[test]
    fn test_every_negotiated_format_is_valid() {
        for formats in 0..0x1000u32 {
            for channels in [0u16, 1, 2, 4, 6] {
                let f = negotiate_format(&DeviceCaps::new("dev", formats, channels));
                assert_eq!(f.bits_per_sample, 16);
                assert!(f.channels >= 1);
                assert!(f.sample_rate == 22_050 || f.sample_rate == 44_100);
                assert_eq!(
                    f.block_align() as u32 * f.sample_rate,
                    f.bytes_per_second()
                );
            }
        }
    }

    #[test]
    fn test_flag_names() {
        let flags = FormatFlags(FormatFlags::F1M08 | FormatFlags::F4S16);
        assert_eq!(
            flags.names(),
            vec!["11.025 kHz mono 8-bit", "44.1 kHz stereo 16-bit"]
        );
        assert!(FormatFlags::default().names().is_empty());
    }
}
