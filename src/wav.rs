//! WAV encoder — canonical 16-bit PCM RIFF/WAVE bytes.
//!
//! Write-only. Reading a stored sound back goes through [`crate::decoder`].

use crate::error::{RecorderError, Result};
use crate::pcm::PcmBuffer;

/// Size of the canonical header in bytes.
pub const HEADER_LEN: usize = 44;

/// Size of the data chunk for `frames` frames of `channels` 16-bit samples.
///
/// RIFF lengths are 32-bit, so anything that does not fit beside the header
/// is refused with `RenderFailure`.
pub fn data_len(frames: usize, channels: usize) -> Result<u32> {
    frames
        .checked_mul(channels)
        .and_then(|samples| samples.checked_mul(2))
        .and_then(|bytes| u32::try_from(bytes).ok())
        .filter(|&bytes| bytes <= u32::MAX - 36)
        .ok_or_else(|| {
            RecorderError::RenderFailure(format!(
                "{frames} frames of {channels} channels exceed the WAV size limit"
            ))
        })
}

/// Encode a buffer as interleaved 16-bit little-endian PCM WAV.
pub fn encode(buffer: &PcmBuffer) -> Result<Vec<u8>> {
    let channels = u16::try_from(buffer.num_channels())
        .map_err(|_| RecorderError::RenderFailure(format!("too many channels: {}", buffer.num_channels())))?;
    let sample_rate = buffer.sample_rate();
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate
        .checked_mul(channels as u32 * (bits_per_sample as u32 / 8))
        .ok_or_else(|| RecorderError::RenderFailure(format!("byte rate overflows at {sample_rate} Hz")))?;
    let block_align = channels
        .checked_mul(bits_per_sample / 8)
        .ok_or_else(|| RecorderError::RenderFailure(format!("too many channels: {channels}")))?;
    let data_size = data_len(buffer.frame_count(), buffer.num_channels())?;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(HEADER_LEN + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for i in 0..buffer.frame_count() {
        for ch in buffer.channels() {
            buf.extend_from_slice(&quantize(ch[i]).to_le_bytes());
        }
    }

    Ok(buf)
}

/// Clamp to [-1, 1] and scale asymmetrically so both -1.0 and 1.0 land on
/// the ends of the i16 range. NaN maps to silence.
#[inline]
pub fn quantize(s: f32) -> i16 {
    if s.is_nan() {
        return 0;
    }
    let s = s.clamp(-1.0, 1.0) as f64;
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(wav: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([wav[at], wav[at + 1], wav[at + 2], wav[at + 3]])
    }

    fn u16_at(wav: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([wav[at], wav[at + 1]])
    }

    #[test]
    fn wav_header_valid() {
        let buf = PcmBuffer::silence(22050, 2, 10).unwrap();
        let wav = encode(&buf).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32_at(&wav, 4) as usize, wav.len() - 8);
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(u32_at(&wav, 16), 16);
        assert_eq!(u16_at(&wav, 20), 1);
        assert_eq!(u16_at(&wav, 22), 2);
        assert_eq!(u32_at(&wav, 24), 22050);
        assert_eq!(u32_at(&wav, 28), 22050 * 2 * 2);
        assert_eq!(u16_at(&wav, 32), 4);
        assert_eq!(u16_at(&wav, 34), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32_at(&wav, 40), 40);
    }

    #[test]
    fn wav_size_correct() {
        // 1 s mono at 44.1 kHz
        let buf = PcmBuffer::silence(44100, 1, 44100).unwrap();
        let wav = encode(&buf).unwrap();
        assert_eq!(wav.len(), 44100 * 2 + 44);
        assert_eq!(u32_at(&wav, 40), 88200);
    }

    #[test]
    fn frames_are_interleaved() {
        let buf = PcmBuffer::new(8000, vec![vec![1.0, 0.0], vec![-1.0, 0.5]]).unwrap();
        let wav = encode(&buf).unwrap();
        let samples: Vec<i16> = wav[HEADER_LEN..]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![32767, -32768, 0, 16384]);
    }

    #[test]
    fn out_of_range_clamps_to_full_scale() {
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32768);
        assert_eq!(quantize(1.7), 32767);
        assert_eq!(quantize(-3.2), -32768);
        assert_eq!(quantize(f32::INFINITY), 32767);
        assert_eq!(quantize(f32::NEG_INFINITY), -32768);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn asymmetric_scaling() {
        assert_eq!(quantize(0.5), 16384); // round(16383.5)
        assert_eq!(quantize(-0.5), -16384);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn data_len_refuses_what_riff_cannot_describe() {
        assert_eq!(data_len(44100, 2).unwrap(), 176400);
        let max_frames = (u32::MAX as usize - 36) / 2;
        assert!(data_len(max_frames, 1).is_ok());
        assert!(matches!(
            data_len(max_frames + 1, 1),
            Err(RecorderError::RenderFailure(_))
        ));
        assert!(data_len(1 << 31, 2).is_err());
        assert!(data_len(usize::MAX, 2).is_err());
    }
}
