//! Canonical PCM representation shared by every stage of the recorder.

use std::time::Duration;

use crate::error::{RecorderError, Result};

/// Decoded, planar audio. Never mutated in place once built; sessions share
/// it behind an `Arc` and replace it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
    frame_count: usize,
}

impl PcmBuffer {
    /// Build a buffer from per-channel sample arrays.
    ///
    /// Fails with `CorruptData` if the rate is zero, there are no channels,
    /// or the channels disagree on length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(RecorderError::CorruptData("sample rate is zero".to_string()));
        }
        let Some(first) = channels.first() else {
            return Err(RecorderError::CorruptData("no channels".to_string()));
        };
        let frame_count = first.len();
        if let Some((i, ch)) = channels
            .iter()
            .enumerate()
            .find(|(_, ch)| ch.len() != frame_count)
        {
            return Err(RecorderError::CorruptData(format!(
                "channel {i} has {} frames, expected {frame_count}",
                ch.len()
            )));
        }
        Ok(PcmBuffer {
            sample_rate,
            channels,
            frame_count,
        })
    }

    /// De-interleave `samples` into `num_channels` channels. A trailing
    /// partial frame is rejected as corrupt.
    pub fn from_interleaved(samples: &[f32], num_channels: usize, sample_rate: u32) -> Result<Self> {
        if num_channels == 0 {
            return Err(RecorderError::CorruptData("no channels".to_string()));
        }
        if samples.len() % num_channels != 0 {
            return Err(RecorderError::CorruptData(format!(
                "{} samples do not divide into {num_channels} channels",
                samples.len()
            )));
        }
        let frames = samples.len() / num_channels;
        let mut channels = vec![Vec::with_capacity(frames); num_channels];
        for frame in samples.chunks_exact(num_channels) {
            for (ch, &s) in channels.iter_mut().zip(frame) {
                ch.push(s);
            }
        }
        PcmBuffer::new(sample_rate, channels)
    }

    pub fn silence(sample_rate: u32, num_channels: usize, frames: usize) -> Result<Self> {
        PcmBuffer::new(sample_rate, vec![vec![0.0; frames]; num_channels])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_count as f64 / self.sample_rate as f64)
    }

    /// Channel-interleaved copy, frame by frame.
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frame_count * self.channels.len());
        for i in 0..self.frame_count {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }
}

/// Read a sample with linear interpolation at a fractional position.
/// Positions past the last sample hold the last value; negative positions
/// and empty data read as silence.
#[inline]
pub fn read_interpolated(data: &[f32], position: f64) -> f32 {
    if data.is_empty() || position < 0.0 {
        return 0.0;
    }

    let idx = position as usize;
    if idx >= data.len() - 1 {
        return data[data.len() - 1];
    }

    let frac = (position - idx as f64) as f32;
    data[idx] * (1.0 - frac) + data[idx + 1] * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_channels() {
        let err = PcmBuffer::new(44100, vec![vec![0.0; 4], vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, RecorderError::CorruptData(_)));
    }

    #[test]
    fn rejects_zero_rate_and_no_channels() {
        assert!(PcmBuffer::new(0, vec![vec![0.0]]).is_err());
        assert!(PcmBuffer::new(44100, vec![]).is_err());
    }

    #[test]
    fn interleave_round_trip() {
        let samples = [0.1, -0.1, 0.2, -0.2, 0.3, -0.3];
        let buf = PcmBuffer::from_interleaved(&samples, 2, 8000).unwrap();
        assert_eq!(buf.frame_count(), 3);
        assert_eq!(buf.channel(0), &[0.1, 0.2, 0.3]);
        assert_eq!(buf.channel(1), &[-0.1, -0.2, -0.3]);
        assert_eq!(buf.interleaved(), samples.to_vec());
    }

    #[test]
    fn partial_frame_is_corrupt() {
        assert!(PcmBuffer::from_interleaved(&[0.0; 5], 2, 8000).is_err());
    }

    #[test]
    fn duration_from_rate() {
        let buf = PcmBuffer::silence(22050, 1, 11025).unwrap();
        assert_eq!(buf.duration(), Duration::from_millis(500));
    }

    #[test]
    fn interpolation() {
        let data = [0.0, 1.0, 0.0, -1.0];
        assert!((read_interpolated(&data, 0.5) - 0.5).abs() < 1e-6);
        assert!((read_interpolated(&data, 1.5) - 0.5).abs() < 1e-6);
        assert_eq!(read_interpolated(&data, 2.0), 0.0);
        assert_eq!(read_interpolated(&data, 10.0), -1.0);
        assert_eq!(read_interpolated(&[], 0.0), 0.0);
    }
}
