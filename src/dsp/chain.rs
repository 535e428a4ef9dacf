//! Effect chain — speed-scale → waveshape → gain.
//!
//! One topology serves both the realtime preview and the offline renderer.
//! Every stage works sample by sample with at most one sample of state, so an
//! instance fed in device-sized blocks produces exactly the samples an
//! instance fed in one large block does.

use std::sync::Arc;

use crate::error::{RecorderError, Result};
use crate::params::EffectParameters;
use crate::pcm::{PcmBuffer, read_interpolated};

use super::curve::{self, DistortionCurve};

/// Oversampling factor of the waveshaper.
pub const OVERSAMPLE: usize = 4;

/// Number of output frames a source of `source_frames` yields when read with
/// `step` source frames per output frame.
pub fn output_frames(source_frames: usize, step: f64) -> usize {
    if source_frames == 0 {
        return 0;
    }
    (source_frames as f64 / step).ceil() as usize
}

/// Reads a source channel at `step` frames per output frame.
#[derive(Debug, Clone)]
pub struct SpeedScale {
    step: f64,
    frame: usize,
    total: usize,
}

impl SpeedScale {
    pub fn new(step: f64, source_frames: usize) -> Self {
        SpeedScale {
            step,
            frame: 0,
            total: output_frames(source_frames, step),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total - self.frame
    }

    /// Fill the front of `block`; returns how many frames were written.
    pub fn fill(&mut self, source: &[f32], block: &mut [f32]) -> usize {
        let n = block.len().min(self.remaining());
        for out in block.iter_mut().take(n) {
            // Position by multiplication so long sources do not drift.
            *out = read_interpolated(source, self.frame as f64 * self.step);
            self.frame += 1;
        }
        n
    }
}

/// Curve lookup with 4x oversampling.
///
/// Each input is upsampled by linear interpolation from the previous input,
/// the sub-samples are shaped, and the shaped values are averaged back down.
#[derive(Debug, Clone)]
pub struct Waveshaper {
    curve: Arc<DistortionCurve>,
    prev: f32,
}

impl Waveshaper {
    pub fn new(curve: Arc<DistortionCurve>) -> Self {
        Waveshaper { curve, prev: 0.0 }
    }

    #[inline]
    pub fn process(&mut self, x: f32) -> f32 {
        let mut acc = 0.0f32;
        for k in 1..=OVERSAMPLE {
            let t = k as f32 / OVERSAMPLE as f32;
            acc += self.curve.lookup(self.prev + (x - self.prev) * t);
        }
        self.prev = x;
        acc / OVERSAMPLE as f32
    }

    pub fn process_block(&mut self, block: &mut [f32]) {
        for s in block.iter_mut() {
            *s = self.process(*s);
        }
    }
}

/// Linear gain. Never clamps; out-of-range values are the encoder's problem.
#[derive(Debug, Clone, Copy)]
pub struct Gain {
    pub volume: f32,
}

impl Gain {
    pub fn process_block(&self, block: &mut [f32]) {
        for s in block.iter_mut() {
            *s *= self.volume;
        }
    }
}

/// The three stages for one source channel.
#[derive(Debug, Clone)]
struct ChannelChain {
    speed: SpeedScale,
    shaper: Waveshaper,
    gain: Gain,
}

impl ChannelChain {
    fn process(&mut self, source: &[f32], block: &mut [f32]) -> usize {
        let n = self.speed.fill(source, block);
        self.shaper.process_block(&mut block[..n]);
        self.gain.process_block(&mut block[..n]);
        n
    }
}

/// The graph description: a parameter snapshot plus the curve built from it.
#[derive(Debug, Clone)]
pub struct EffectChain {
    params: EffectParameters,
    curve: Arc<DistortionCurve>,
}

impl EffectChain {
    /// Fails with `RenderFailure` if any parameter is not finite.
    pub fn new(params: EffectParameters) -> Result<Self> {
        if !params.is_finite() {
            return Err(RecorderError::RenderFailure(format!(
                "non-finite effect parameters: {params:?}"
            )));
        }
        Ok(EffectChain {
            params,
            curve: Arc::new(curve::generate(params.crunch)),
        })
    }

    pub fn params(&self) -> EffectParameters {
        self.params
    }

    pub fn curve(&self) -> &Arc<DistortionCurve> {
        &self.curve
    }

    /// Build a running instance that reads `source` and produces frames at
    /// `output_rate`.
    ///
    /// At the source's own rate the step is exactly `pitch`, so the output
    /// has `ceil(frames / pitch)` frames with no rounding from a rate ratio.
    pub fn instantiate(&self, source: &PcmBuffer, output_rate: u32) -> ChainInstance {
        let step = if output_rate == source.sample_rate() {
            self.params.pitch
        } else {
            self.params.pitch * source.sample_rate() as f64 / output_rate as f64
        };
        let channels = (0..source.num_channels())
            .map(|_| ChannelChain {
                speed: SpeedScale::new(step, source.frame_count()),
                shaper: Waveshaper::new(Arc::clone(&self.curve)),
                gain: Gain {
                    volume: self.params.volume as f32,
                },
            })
            .collect();
        ChainInstance {
            channels,
            total_frames: output_frames(source.frame_count(), step),
        }
    }
}

/// A stateful instance of the chain, one lane per source channel.
#[derive(Debug, Clone)]
pub struct ChainInstance {
    channels: Vec<ChannelChain>,
    total_frames: usize,
}

impl ChainInstance {
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn remaining(&self) -> usize {
        self.channels.first().map_or(0, |c| c.speed.remaining())
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Process up to one block per channel. `out[c]` receives channel `c`;
    /// all slices must be the same length. Returns frames written.
    pub fn process(&mut self, source: &PcmBuffer, out: &mut [Vec<f32>]) -> usize {
        let mut written = 0;
        for (c, (lane, block)) in self.channels.iter_mut().zip(out.iter_mut()).enumerate() {
            written = lane.process(source.channel(c), block);
        }
        written
    }
}
