//! Offline renderer — evaluates the effect chain to completion.
//!
//! Output depends only on `(buffer, params)`: no clock, no device, no state
//! carried over from previews. There is no way to cancel a render once it
//! has started.

use tracing::{debug, instrument};

use crate::error::{RecorderError, Result};
use crate::params::EffectParameters;
use crate::pcm::PcmBuffer;
use crate::wav;

use super::chain::EffectChain;

/// Runs the effect chain over a whole buffer at the buffer's own rate.
#[derive(Debug, Clone, Default)]
pub struct OfflineRenderer;

impl OfflineRenderer {
    pub fn new() -> Self {
        OfflineRenderer
    }

    /// Render `buffer` through the chain built from `params`.
    ///
    /// Produces exactly `ceil(frame_count / pitch)` frames. Fails with
    /// `RenderFailure` on non-finite parameters or output; never returns a
    /// partial buffer.
    #[instrument(level = "debug", skip(self, buffer), fields(frames = buffer.frame_count()))]
    pub fn render(&self, buffer: &PcmBuffer, params: EffectParameters) -> Result<PcmBuffer> {
        let chain = EffectChain::new(params)?;
        let mut instance = chain.instantiate(buffer, buffer.sample_rate());
        let frames = instance.total_frames();

        let mut out = vec![vec![0.0f32; frames]; buffer.num_channels()];
        let written = instance.process(buffer, &mut out);
        if written != frames || !instance.is_finished() {
            return Err(RecorderError::RenderFailure(format!(
                "chain produced {written} of {frames} frames"
            )));
        }
        if let Some((c, i)) = first_non_finite(&out) {
            return Err(RecorderError::RenderFailure(format!(
                "non-finite sample at channel {c}, frame {i}"
            )));
        }

        debug!(frames, "offline render complete");
        PcmBuffer::new(buffer.sample_rate(), out)
            .map_err(|e| RecorderError::RenderFailure(e.to_string()))
    }

    /// Render and encode in one step.
    pub fn render_wav(&self, buffer: &PcmBuffer, params: EffectParameters) -> Result<Vec<u8>> {
        let rendered = self.render(buffer, params)?;
        wav::encode(&rendered)
    }
}

fn first_non_finite(channels: &[Vec<f32>]) -> Option<(usize, usize)> {
    channels.iter().enumerate().find_map(|(c, ch)| {
        ch.iter().position(|s| !s.is_finite()).map(|i| (c, i))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(frames: usize, channels: usize) -> PcmBuffer {
        let data: Vec<f32> = (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin() * 0.8)
            .collect();
        PcmBuffer::new(44100, vec![data; channels]).unwrap()
    }

    #[test]
    fn duration_law_over_pitch_range() {
        let buf = tone(44100, 1);
        let renderer = OfflineRenderer::new();
        let mut pitch = 0.5;
        while pitch <= 2.0 {
            let out = renderer
                .render(&buf, EffectParameters::new(pitch, 0.0, 1.0))
                .unwrap();
            let expected = (44100.0f64 / pitch).ceil() as usize;
            assert_eq!(out.frame_count(), expected, "pitch={pitch}");
            pitch += 0.125;
        }
    }

    #[test]
    fn duration_law_holds_for_non_dyadic_pitches() {
        let renderer = OfflineRenderer::new();
        for rate in [11025, 44100] {
            for n in [1, 23, 46, 92, 311] {
                let buf = PcmBuffer::silence(rate, 1, n).unwrap();
                for k in 0..=150 {
                    let params = EffectParameters::new(0.5 + 0.01 * k as f64, 0.0, 1.0);
                    let out = renderer.render(&buf, params).unwrap();
                    let expected = (n as f64 / params.pitch).ceil() as usize;
                    assert_eq!(out.frame_count(), expected, "rate={rate} n={n} pitch={}", params.pitch);
                }
            }
        }
    }

    #[test]
    fn scenario_a_and_b_frame_counts() {
        let buf = tone(44100, 1);
        let renderer = OfflineRenderer::new();
        let a = renderer.render(&buf, EffectParameters::new(1.0, 0.0, 1.0)).unwrap();
        assert_eq!(a.frame_count(), 44100);
        let b = renderer.render(&buf, EffectParameters::new(2.0, 0.0, 1.0)).unwrap();
        assert_eq!(b.frame_count(), 22050);
    }

    #[test]
    fn render_is_bit_reproducible() {
        let buf = tone(5000, 2);
        let params = EffectParameters::new(0.77, 333.0, 1.9);
        let renderer = OfflineRenderer::new();
        let a = renderer.render(&buf, params).unwrap();
        let b = renderer.render(&buf, params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.num_channels(), 2);
        assert_eq!(a.sample_rate(), 44100);
    }

    #[test]
    fn non_finite_params_fail() {
        let buf = tone(100, 1);
        let err = OfflineRenderer::new()
            .render(&buf, EffectParameters::new(1.0, 0.0, f64::NAN))
            .unwrap_err();
        assert!(matches!(err, RecorderError::RenderFailure(_)));
    }

    #[test]
    fn non_finite_source_is_bounded_by_curve() {
        let renderer = OfflineRenderer::new();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let buf = PcmBuffer::new(8000, vec![vec![0.0, bad, 0.0]]).unwrap();
            let out = renderer.render(&buf, EffectParameters::default()).unwrap();
            assert!(out.channel(0).iter().all(|s| s.is_finite()));
        }
    }

    #[test]
    fn empty_buffer_renders_empty() {
        let buf = PcmBuffer::silence(44100, 1, 0).unwrap();
        let out = OfflineRenderer::new().render(&buf, EffectParameters::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn render_wav_size() {
        let buf = tone(44100, 1);
        let wav = OfflineRenderer::new()
            .render_wav(&buf, EffectParameters::default())
            .unwrap();
        assert_eq!(wav.len(), 88244);
    }
}
