pub mod capture;
pub mod config;
#[cfg(feature = "cpal")]
pub mod cpal_device;
pub mod decoder;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod params;
pub mod pcm;
pub mod session;
pub mod storage;
pub mod wav;

pub use crate::capture::{CaptureDevice, CaptureHandle, CaptureSource, MemoryCaptureDevice, RawAudio};
pub use crate::config::RecorderConfig;
pub use crate::dsp::chain::EffectChain;
pub use crate::dsp::curve::DistortionCurve;
pub use crate::dsp::preview::{LivePreviewPlayer, MeterReading, PreviewSession};
pub use crate::dsp::renderer::OfflineRenderer;
pub use crate::engine::{AudioBackend, AudioEngine, HeadlessBackend};
pub use crate::error::{RecorderError, Result};
pub use crate::params::EffectParameters;
pub use crate::pcm::PcmBuffer;
pub use crate::session::{RecorderSession, SessionState};
pub use crate::storage::{RenderedSound, SoundRecord};

use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn js_err(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Decode `bytes`, render them with the given settings and encode the result.
pub fn render_bytes(bytes: &[u8], params: EffectParameters) -> Result<RenderedSound> {
    let buffer = decoder::decode(bytes)?;
    if buffer.is_empty() {
        return Err(RecorderError::EmptyCapture);
    }
    let rendered = OfflineRenderer::new().render(&buffer, params)?;
    RenderedSound::from_buffer(&rendered)
}

/// WASM-exposed: return the sfx_recorder_core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// WASM-exposed: decode an audio file, apply pitch/crunch/volume and return
/// the storable `data:audio/wav;base64,...` string.
#[wasm_bindgen]
pub fn render_to_storable(bytes: &[u8], pitch: f64, crunch: f64, volume: f64) -> std::result::Result<String, JsValue> {
    render_bytes(bytes, EffectParameters::new(pitch, crunch, volume))
        .map(RenderedSound::into_storable)
        .map_err(js_err)
}

/// WASM-exposed: the waveshaper table for `crunch`, for drawing.
#[wasm_bindgen]
pub fn distortion_curve(crunch: f64) -> Vec<f32> {
    dsp::curve::generate(crunch).table().to_vec()
}

/// WASM-exposed: render and wrap as a `{id, name, data}` library record.
#[wasm_bindgen]
pub fn sound_record(
    id: &str,
    name: &str,
    bytes: &[u8],
    pitch: f64,
    crunch: f64,
    volume: f64,
) -> std::result::Result<JsValue, JsValue> {
    let sound = render_bytes(bytes, EffectParameters::new(pitch, crunch, volume)).map_err(js_err)?;
    let record = SoundRecord::new(id, name, sound);
    serde_wasm_bindgen::to_value(&record).map_err(js_err)
}
