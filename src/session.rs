//! Recorder session — one editing session from capture to saved sound.
//!
//! ```text
//! Idle → Capturing → Decoding → Ready ⇄ Previewing
//!                                 ↓
//!                             Rendering → Saved
//! ```
//!
//! Capture and decode failures drop back to `Idle`. A failed render leaves
//! the decoded buffer and parameters exactly as they were.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureHandle, CaptureSource, RawAudio};
use crate::decoder;
use crate::dsp::preview::{LivePreviewPlayer, PreviewSession};
use crate::dsp::renderer::OfflineRenderer;
use crate::engine::AudioEngine;
use crate::error::{RecorderError, Result};
use crate::params::EffectParameters;
use crate::pcm::PcmBuffer;
use crate::storage::{self, RenderedSound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Decoding,
    Ready,
    Previewing,
    Rendering,
    Saved,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::Decoding => "decoding",
            SessionState::Ready => "ready",
            SessionState::Previewing => "previewing",
            SessionState::Rendering => "rendering",
            SessionState::Saved => "saved",
        };
        f.write_str(name)
    }
}

pub struct RecorderSession {
    engine: AudioEngine,
    capture: CaptureSource,
    player: LivePreviewPlayer,
    renderer: OfflineRenderer,
    // Never `Previewing`; that is derived from the player.
    state: SessionState,
    handle: Option<CaptureHandle>,
    buffer: Option<Arc<PcmBuffer>>,
    params: EffectParameters,
}

impl fmt::Debug for RecorderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderSession")
            .field("state", &self.state())
            .field("params", &self.params)
            .field("frames", &self.buffer.as_ref().map(|b| b.frame_count()))
            .finish()
    }
}

impl RecorderSession {
    /// New session on `engine`. The engine is disposed when the session is
    /// closed.
    pub fn new(engine: AudioEngine) -> Self {
        RecorderSession {
            capture: CaptureSource::new(&engine),
            renderer: engine.offline_renderer(),
            engine,
            player: LivePreviewPlayer::new(),
            state: SessionState::Idle,
            handle: None,
            buffer: None,
            params: EffectParameters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            SessionState::Ready | SessionState::Saved if self.player.is_playing() => SessionState::Previewing,
            other => other,
        }
    }

    /// The decoded sound being edited, if any.
    pub fn buffer(&self) -> Option<&Arc<PcmBuffer>> {
        self.buffer.as_ref()
    }

    pub fn parameters(&self) -> EffectParameters {
        self.params
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(RecorderError::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    /// Start recording from the capture device.
    ///
    /// Allowed with nothing loaded or over an existing sound, which is
    /// discarded once the new capture decodes.
    #[instrument(level = "debug", skip(self))]
    pub fn begin_capture(&mut self) -> Result<()> {
        use SessionState::*;
        self.require("begin capture", &[Idle, Ready, Previewing, Saved])?;
        self.player.stop_current();
        let handle = self.capture.begin_capture()?;
        self.handle = Some(handle);
        self.state = Capturing;
        info!("capture started");
        Ok(())
    }

    /// Resolves `true` once the device is actually recording, `false` if the
    /// capture ended before that (permission denied, device error).
    pub async fn capture_started(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => handle.wait_started().await,
            None => false,
        }
    }

    /// Stop recording and decode what was captured.
    #[instrument(level = "debug", skip(self))]
    pub async fn end_capture(&mut self) -> Result<()> {
        self.require("end capture", &[SessionState::Capturing])?;
        let Some(handle) = self.handle.take() else {
            self.reset();
            return Err(RecorderError::EmptyCapture);
        };
        self.state = SessionState::Decoding;
        match self.capture.end_capture(handle).await {
            Ok(raw) => self.decode_raw(raw).await,
            Err(e) => {
                warn!("capture failed: {e}");
                self.reset();
                Err(e)
            }
        }
    }

    /// Load an audio file instead of recording.
    #[instrument(level = "debug", skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn import(&mut self, bytes: Vec<u8>) -> Result<()> {
        use SessionState::*;
        self.require("import", &[Idle, Ready, Previewing, Saved])?;
        self.player.stop_current();
        let raw = self.capture.import_file(bytes);
        self.state = Decoding;
        self.decode_raw(raw).await
    }

    /// Reopen a previously saved sound for further editing.
    #[instrument(level = "debug", skip(self, storable))]
    pub async fn load_storable(&mut self, storable: &str) -> Result<()> {
        use SessionState::*;
        self.require("load", &[Idle, Ready, Previewing, Saved])?;
        self.player.stop_current();
        self.state = Decoding;
        match storage::from_storable(storable) {
            Ok(bytes) => {
                let raw = self.capture.import_file(bytes);
                self.decode_raw(raw).await
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    async fn decode_raw(&mut self, raw: RawAudio) -> Result<()> {
        let origin = raw.origin;
        let decoded = tokio::task::spawn_blocking(move || decoder::decode(&raw.bytes))
            .await
            .map_err(|e| RecorderError::CorruptData(format!("decode task failed: {e}")))
            .and_then(|r| r)
            .and_then(|buffer| {
                if buffer.is_empty() {
                    Err(RecorderError::EmptyCapture)
                } else {
                    Ok(buffer)
                }
            });
        match decoded {
            Ok(buffer) => {
                info!(
                    ?origin,
                    sample_rate = buffer.sample_rate(),
                    channels = buffer.num_channels(),
                    frames = buffer.frame_count(),
                    "sound ready"
                );
                self.buffer = Some(Arc::new(buffer));
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(?origin, "decode failed: {e}");
                self.reset();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.player.stop_current();
        self.handle = None;
        self.buffer = None;
        self.state = SessionState::Idle;
    }

    /// Replace the parameter snapshot used by the next preview or save.
    /// A preview already playing keeps the snapshot it started with.
    pub fn set_parameters(&mut self, params: EffectParameters) -> Result<()> {
        use SessionState::*;
        self.require("set parameters", &[Ready, Previewing, Saved])?;
        debug!(pitch = params.pitch, crunch = params.crunch, volume = params.volume, "parameters set");
        self.params = params;
        self.state = Ready;
        Ok(())
    }

    /// Play the sound through the effect chain. Replaces any running preview.
    #[instrument(level = "debug", skip(self))]
    pub async fn preview(&mut self) -> Result<PreviewSession> {
        use SessionState::*;
        self.require("preview", &[Ready, Previewing, Saved])?;
        let buffer = self.loaded("preview")?;
        self.player.start(&self.engine, buffer, self.params).await
    }

    /// Stop the running preview, if any.
    pub fn stop_preview(&mut self) {
        self.player.stop_current();
    }

    /// Render with the current parameters and encode to a storable sound.
    ///
    /// On failure the session returns to `Ready` with buffer and parameters
    /// unchanged, and no sound is produced.
    #[instrument(level = "debug", skip(self))]
    pub async fn save(&mut self) -> Result<RenderedSound> {
        use SessionState::*;
        self.require("save", &[Ready, Previewing, Saved])?;
        let buffer = self.loaded("save")?;
        self.player.stop_current();

        let prior = self.state;
        self.state = Rendering;
        let renderer = self.renderer.clone();
        let params = self.params;
        let rendered = tokio::task::spawn_blocking(move || {
            renderer
                .render(&buffer, params)
                .and_then(|out| RenderedSound::from_buffer(&out))
        })
        .await
        .map_err(RecorderError::from)
        .and_then(|r| r);

        match rendered {
            Ok(sound) => {
                info!(duration = ?sound.duration(), "sound saved");
                self.state = Saved;
                Ok(sound)
            }
            Err(e) => {
                warn!("render failed: {e}");
                self.state = if prior == Saved { Saved } else { Ready };
                Err(e)
            }
        }
    }

    fn loaded(&self, operation: &'static str) -> Result<Arc<PcmBuffer>> {
        self.buffer.clone().ok_or_else(|| RecorderError::InvalidState {
            operation,
            state: "nothing is loaded".to_string(),
        })
    }

    /// Stop everything and dispose of the engine.
    pub fn close(mut self) {
        self.player.stop_current();
        // Dropping the handle aborts a capture in flight.
        self.handle = None;
        self.engine.dispose();
        debug!("session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureDevice, MemoryCaptureDevice, Permission};
    use crate::config::RecorderConfig;
    use crate::engine::DeviceState;
    use crate::wav;
    use std::time::Duration;

    fn config() -> RecorderConfig {
        RecorderConfig {
            realtime_pacing: true,
            headless_sample_rate: 8000,
            headless_channels: 1,
            ..RecorderConfig::default()
        }
    }

    fn clip(frames: usize) -> Vec<u8> {
        let data = (0..frames).map(|i| ((i % 40) as f32 / 20.0) - 1.0).collect();
        wav::encode(&PcmBuffer::new(8000, vec![data]).unwrap()).unwrap()
    }

    fn session_with(device: MemoryCaptureDevice) -> (RecorderSession, Arc<MemoryCaptureDevice>) {
        let device = Arc::new(device);
        let engine =
            AudioEngine::headless(config()).unwrap().with_capture_device(Arc::clone(&device) as Arc<dyn CaptureDevice>);
        (RecorderSession::new(engine), device)
    }

    #[tokio::test]
    async fn capture_to_saved_sound() {
        let (mut session, device) = session_with(MemoryCaptureDevice::new(clip(8000)));
        assert_eq!(session.state(), SessionState::Idle);

        session.begin_capture().unwrap();
        assert_eq!(session.state(), SessionState::Capturing);
        assert!(session.capture_started().await);
        session.end_capture().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!device.is_held());
        assert_eq!(session.buffer().unwrap().frame_count(), 8000);

        session.set_parameters(EffectParameters::new(2.0, 50.0, 1.0)).unwrap();
        let sound = session.save().await.unwrap();
        assert_eq!(session.state(), SessionState::Saved);
        assert_eq!(sound.duration(), Duration::from_millis(500));

        // Saved keeps everything; saving again re-renders.
        let again = session.save().await.unwrap();
        assert_eq!(again, sound);
    }

    #[tokio::test]
    async fn preview_is_transient() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(clip(80000)));
        session.import(clip(80000)).await.unwrap();

        let preview = session.preview().await.unwrap();
        assert_eq!(session.state(), SessionState::Previewing);
        assert_eq!(session.engine().state(), DeviceState::Running);

        session.stop_preview();
        assert!(!preview.is_active());
        assert_eq!(session.state(), SessionState::Ready);
        session.stop_preview();
    }

    #[tokio::test]
    async fn denied_permission_returns_to_idle() {
        let (mut session, device) =
            session_with(MemoryCaptureDevice::new(clip(100)).with_permission(Permission::Denied));
        session.begin_capture().unwrap();
        assert!(!session.capture_started().await);
        let err = session.end_capture().await.unwrap_err();
        assert!(matches!(err, RecorderError::DeviceUnavailable(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(device.release_count(), 1);
    }

    #[tokio::test]
    async fn release_before_grant_is_empty_capture() {
        let (mut session, device) =
            session_with(MemoryCaptureDevice::new(clip(100)).with_grant_delay(Duration::from_millis(30)));
        session.begin_capture().unwrap();
        let err = session.end_capture().await.unwrap_err();
        assert!(matches!(err, RecorderError::EmptyCapture));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(device.start_count(), 0);
        assert!(!device.is_held());
    }

    #[tokio::test]
    async fn zero_frame_recording_is_empty_capture() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(clip(0)));
        session.begin_capture().unwrap();
        assert!(session.capture_started().await);
        let err = session.end_capture().await.unwrap_err();
        assert!(matches!(err, RecorderError::EmptyCapture));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.buffer().is_none());
    }

    #[tokio::test]
    async fn bad_import_returns_to_idle() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(Vec::new()));
        let err = session.import(b"not audio".to_vec()).await.unwrap_err();
        assert!(matches!(err, RecorderError::UnsupportedFormat(_)));
        assert_eq!(session.state(), SessionState::Idle);

        let err = session.load_storable("data:audio/wav,plain").await.unwrap_err();
        assert!(matches!(err, RecorderError::InvalidEncoding(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_render_keeps_ready_data() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(Vec::new()));
        session.import(clip(400)).await.unwrap();
        let before = Arc::clone(session.buffer().unwrap());

        let bad = EffectParameters::new(f64::NAN, 0.0, 1.0);
        session.set_parameters(bad).unwrap();
        let err = session.save().await.unwrap_err();
        assert!(matches!(err, RecorderError::RenderFailure(_)));
        assert_eq!(session.state(), SessionState::Ready);
        assert!(Arc::ptr_eq(session.buffer().unwrap(), &before));
        assert!(session.parameters().pitch.is_nan());

        session.set_parameters(EffectParameters::default()).unwrap();
        assert!(session.save().await.is_ok());
    }

    #[tokio::test]
    async fn saved_sound_reloads_for_editing() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(Vec::new()));
        session.import(clip(800)).await.unwrap();
        let sound = session.save().await.unwrap();

        session.load_storable(sound.as_storable()).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.buffer().unwrap().frame_count(), 800);
    }

    #[tokio::test]
    async fn out_of_order_calls_are_rejected() {
        let (mut session, _) = session_with(MemoryCaptureDevice::new(clip(100)));
        let err = session.save().await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot save while idle");
        assert!(session.preview().await.is_err());
        assert!(session.end_capture().await.is_err());
        assert!(session.set_parameters(EffectParameters::default()).is_err());

        session.begin_capture().unwrap();
        assert!(matches!(
            session.import(clip(10)).await,
            Err(RecorderError::InvalidState { operation: "import", .. })
        ));
        assert!(session.begin_capture().is_err());
        assert_eq!(session.state(), SessionState::Capturing);
    }

    #[tokio::test]
    async fn close_disposes_engine_and_releases_device() {
        let (mut session, device) = session_with(MemoryCaptureDevice::new(clip(100)));
        let engine = session.engine().clone();
        session.begin_capture().unwrap();
        assert!(session.capture_started().await);
        session.close();
        assert_eq!(engine.state(), DeviceState::Closed);
        for _ in 0..100 {
            if !device.is_held() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(!device.is_held());
    }
}
