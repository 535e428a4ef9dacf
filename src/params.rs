//! Effect parameter snapshots.

use serde::{Deserialize, Serialize};

pub const PITCH_MIN: f64 = 0.5;
pub const PITCH_MAX: f64 = 2.0;
pub const CRUNCH_MIN: f64 = 0.0;
pub const CRUNCH_MAX: f64 = 400.0;
pub const VOLUME_MIN: f64 = 0.0;
pub const VOLUME_MAX: f64 = 2.0;

/// One immutable snapshot of the user's settings. A new one is taken for
/// every preview start and every render.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectParameters {
    /// Playback speed multiplier; also shifts pitch.
    pub pitch: f64,
    /// Distortion intensity. 0 is the mildest curve, not a bypass.
    pub crunch: f64,
    /// Linear output gain.
    pub volume: f64,
}

impl EffectParameters {
    /// Finite values are clamped into their ranges. Non-finite values are
    /// kept so that rendering can reject them.
    pub fn new(pitch: f64, crunch: f64, volume: f64) -> Self {
        EffectParameters {
            pitch: clamp_finite(pitch, PITCH_MIN, PITCH_MAX),
            crunch: clamp_finite(crunch, CRUNCH_MIN, CRUNCH_MAX),
            volume: clamp_finite(volume, VOLUME_MIN, VOLUME_MAX),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.pitch.is_finite() && self.crunch.is_finite() && self.volume.is_finite()
    }

    pub fn with_pitch(self, pitch: f64) -> Self {
        EffectParameters::new(pitch, self.crunch, self.volume)
    }

    pub fn with_crunch(self, crunch: f64) -> Self {
        EffectParameters::new(self.pitch, crunch, self.volume)
    }

    pub fn with_volume(self, volume: f64) -> Self {
        EffectParameters::new(self.pitch, self.crunch, volume)
    }
}

impl Default for EffectParameters {
    fn default() -> Self {
        EffectParameters {
            pitch: 1.0,
            crunch: 0.0,
            volume: 1.0,
        }
    }
}

fn clamp_finite(v: f64, min: f64, max: f64) -> f64 {
    if v.is_finite() { v.clamp(min, max) } else { v }
}
