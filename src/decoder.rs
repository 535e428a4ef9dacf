//! Decoder — raw captured or imported bytes to canonical PCM.
//!
//! Pure format normalisation: no resampling, no channel mixing, no gain.

use std::io::Cursor;

use tracing::debug;

use crate::error::{RecorderError, Result};
use crate::pcm::PcmBuffer;

/// Container formats recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
}

/// Sniff the container format from magic bytes.
pub fn detect_format(bytes: &[u8]) -> Option<AudioFormat> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return Some(AudioFormat::Wav);
    }
    if bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
    {
        return Some(AudioFormat::Mp3);
    }
    None
}

/// Decode `bytes` into a [`PcmBuffer`].
///
/// Fails with `UnsupportedFormat` for unknown containers or encodings, and
/// with `CorruptData` for recognised but damaged input.
pub fn decode(bytes: &[u8]) -> Result<PcmBuffer> {
    if bytes.is_empty() {
        return Err(RecorderError::UnsupportedFormat("empty input".to_string()));
    }
    let buffer = match detect_format(bytes) {
        Some(AudioFormat::Wav) => decode_wav(bytes)?,
        Some(AudioFormat::Mp3) => decode_mp3(bytes)?,
        None => {
            return Err(RecorderError::UnsupportedFormat(
                "unrecognised audio container".to_string(),
            ));
        }
    };
    debug!(
        sample_rate = buffer.sample_rate(),
        channels = buffer.num_channels(),
        frames = buffer.frame_count(),
        "decoded audio"
    );
    Ok(buffer)
}

/// Integer sample to float, inverting the encoder's asymmetric scaling:
/// negatives divide by 2^(bits-1), positives by 2^(bits-1) - 1.
#[inline]
pub fn dequantize(sample: i32, bits: u16) -> f32 {
    let half = (1u64 << (bits - 1)) as f64;
    if sample < 0 {
        (sample as f64 / half) as f32
    } else {
        (sample as f64 / (half - 1.0)) as f32
    }
}

fn decode_wav(bytes: &[u8]) -> Result<PcmBuffer> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(RecorderError::CorruptData("WAV declares zero channels".to_string()));
    }
    if spec.sample_rate == 0 {
        return Err(RecorderError::CorruptData("WAV declares zero sample rate".to_string()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                return Err(RecorderError::UnsupportedFormat(format!(
                    "{}-bit float WAV",
                    spec.bits_per_sample
                )));
            }
            reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if !(8..=32).contains(&bits) {
                return Err(RecorderError::UnsupportedFormat(format!("{bits}-bit integer WAV")));
            }
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| dequantize(s, bits)))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    PcmBuffer::from_interleaved(&samples, spec.channels as usize, spec.sample_rate)
}

#[cfg(feature = "mp3")]
fn decode_mp3(bytes: &[u8]) -> Result<PcmBuffer> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut channels = 0usize;
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if channels == 0 {
                    channels = frame.channels;
                    sample_rate = frame.sample_rate as u32;
                } else if frame.channels != channels || frame.sample_rate as u32 != sample_rate {
                    return Err(RecorderError::CorruptData(
                        "MP3 stream changes layout mid-stream".to_string(),
                    ));
                }
                samples.extend(frame.data.iter().map(|&s| dequantize(s as i32, 16)));
            }
            Err(minimp3::Error::Eof) | Err(minimp3::Error::InsufficientData) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => return Err(RecorderError::CorruptData(format!("MP3: {e:?}"))),
        }
    }

    if channels == 0 {
        return Err(RecorderError::CorruptData("no MPEG audio frames".to_string()));
    }
    PcmBuffer::from_interleaved(&samples, channels, sample_rate)
}

#[cfg(not(feature = "mp3"))]
fn decode_mp3(_bytes: &[u8]) -> Result<PcmBuffer> {
    Err(RecorderError::UnsupportedFormat(
        "MP3 support not compiled in (enable the `mp3` feature)".to_string(),
    ))
}
