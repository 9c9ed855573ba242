//! RIFF/WAV wrapping of raw captures

use crate::audio::AudioFormat;
use crate::error::SinkError;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

impl From<&AudioFormat> for WavSpec {
    fn from(format: &AudioFormat) -> Self {
        WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: SampleFormat::Int,
        }
    }
}

/// Copy a raw 16-bit little-endian capture into a WAV file
///
/// Returns the number of frames written. A trailing partial frame in the
/// raw file is padded with silent samples; a stray odd byte is dropped.
pub fn wrap_raw_as_wav(raw: &Path, wav: &Path, format: &AudioFormat) -> Result<u64, SinkError> {
    let mut reader = BufReader::new(File::open(raw)?);
    let mut writer = WavWriter::create(wav, WavSpec::from(format))?;

    let mut chunk = vec![0u8; format.buffer_size_for_ms(100).max(2)];
    let mut carry: Option<u8> = None;
    let mut samples: u64 = 0;

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }

        let mut bytes = &chunk[..n];
        if let Some(low) = carry.take() {
            writer.write_sample(i16::from_le_bytes([low, bytes[0]]))?;
            samples += 1;
            bytes = &bytes[1..];
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            samples += 1;
        }
        carry = pairs.remainder().first().copied();
    }

    if carry.is_some() {
        warn!("Raw capture ends mid-sample; last byte dropped");
    }

    // hound refuses to finalize a partial frame, so pad it out with silence
    let channels = format.channels.max(1) as u64;
    while samples % channels != 0 {
        writer.write_sample(0i16)?;
        samples += 1;
    }

    writer.finalize()?;

    let frames = samples / channels;
    debug!("Wrapped {} frames of {} into {}", frames, format, wav.display());
    Ok(frames)
}
