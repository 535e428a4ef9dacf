//! Recorder configuration, loaded from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecorderError, Result};

/// Tunables for the realtime side of the recorder. Rendering output does not
/// depend on any of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Frames processed per realtime block.
    pub block_frames: usize,
    /// Minimum time between two level-meter readings.
    pub meter_interval_ms: u64,
    /// Meter readings buffered before new ones are dropped.
    pub meter_capacity: usize,
    /// Whether the headless backend paces playback to wall-clock time.
    pub realtime_pacing: bool,
    pub headless_sample_rate: u32,
    pub headless_channels: u16,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            block_frames: 512,
            meter_interval_ms: 50,
            meter_capacity: 16,
            realtime_pacing: true,
            headless_sample_rate: 44100,
            headless_channels: 2,
        }
    }
}

impl RecorderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RecorderConfig =
            serde_json::from_str(json).map_err(|e| RecorderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RecorderError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_frames == 0 {
            return Err(RecorderError::Config("block_frames must be positive".to_string()));
        }
        if self.meter_capacity == 0 {
            return Err(RecorderError::Config("meter_capacity must be positive".to_string()));
        }
        if self.headless_sample_rate == 0 || self.headless_channels == 0 {
            return Err(RecorderError::Config(
                "headless device needs a sample rate and at least one channel".to_string(),
            ));
        }
        Ok(())
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }

    /// Meter window expressed in frames at `sample_rate`; never zero.
    pub fn meter_interval_frames(&self, sample_rate: u32) -> usize {
        (self.meter_interval().as_secs_f64() * sample_rate as f64).round().max(1.0) as usize
    }
}
