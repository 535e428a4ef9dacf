//! Audio engine handle and output backends.
//!
//! There is no global audio context: a session creates one [`AudioEngine`],
//! passes it by reference to the capture source, preview player and renderer,
//! and disposes of it when the session ends.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capture::CaptureDevice;
use crate::config::RecorderConfig;
use crate::dsp::renderer::OfflineRenderer;
use crate::error::{RecorderError, Result};

/// Activity state of an output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Suspended,
    Running,
    Closed,
}

/// What a render callback wants after filling a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Continue,
    Finished,
}

/// Fills one interleaved output buffer with `channels()` channels.
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) -> StreamStatus + Send + 'static>;

/// Told about stream failures that happen after the stream started.
pub type ErrorCallback = Box<dyn FnMut(String) + Send + 'static>;

/// A running output stream. Stopping is immediate and idempotent; dropping
/// the stream stops it.
pub trait OutputStream: Send {
    fn stop(&mut self);
}

/// An audio output device.
#[async_trait]
pub trait AudioBackend: Send + Sync + Debug {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn state(&self) -> DeviceState;

    /// Bring a suspended device to `Running`. Resolves once the transition
    /// is complete.
    async fn resume(&self) -> Result<()>;

    /// Start pulling audio from `render`. The device must be running.
    fn open_stream(&self, render: RenderCallback, on_error: ErrorCallback) -> Result<Box<dyn OutputStream>>;

    fn close(&self);
}

/// Output device driven by a plain thread instead of hardware.
///
/// Starts suspended, like a freshly created browser audio context. With
/// pacing on it consumes audio at wall-clock speed; with pacing off it pulls
/// as fast as the callback can fill. An optional tap keeps everything played.
#[derive(Debug)]
pub struct HeadlessBackend {
    sample_rate: u32,
    channels: u16,
    block_frames: usize,
    pacing: bool,
    resume_delay: Duration,
    state: Mutex<DeviceState>,
    tap: Option<Arc<Mutex<Vec<f32>>>>,
}

impl HeadlessBackend {
    pub fn new(config: &RecorderConfig) -> Self {
        HeadlessBackend {
            sample_rate: config.headless_sample_rate,
            channels: config.headless_channels,
            block_frames: config.block_frames,
            pacing: config.realtime_pacing,
            resume_delay: Duration::ZERO,
            state: Mutex::new(DeviceState::Suspended),
            tap: None,
        }
    }

    /// Keep a copy of every interleaved sample the device plays.
    pub fn with_tap(mut self) -> Self {
        self.tap = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Simulate a device that takes a while to become active.
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    /// Everything played so far, interleaved. Empty without a tap.
    pub fn tapped(&self) -> Vec<f32> {
        self.tap.as_ref().map(|t| t.lock().clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AudioBackend for HeadlessBackend {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    async fn resume(&self) -> Result<()> {
        if self.state() == DeviceState::Closed {
            return Err(RecorderError::DeviceUnavailable("output device is closed".to_string()));
        }
        if !self.resume_delay.is_zero() {
            tokio::time::sleep(self.resume_delay).await;
        }
        let mut state = self.state.lock();
        if *state == DeviceState::Closed {
            return Err(RecorderError::DeviceUnavailable("output device is closed".to_string()));
        }
        *state = DeviceState::Running;
        Ok(())
    }

    fn open_stream(&self, mut render: RenderCallback, _on_error: ErrorCallback) -> Result<Box<dyn OutputStream>> {
        if self.state() != DeviceState::Running {
            return Err(RecorderError::DeviceUnavailable(format!(
                "output device is {:?}",
                self.state()
            )));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let tap = self.tap.clone();
        let samples = self.block_frames * self.channels as usize;
        let block_time = Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate as f64);
        let pacing = self.pacing;

        let thread = std::thread::Builder::new()
            .name("headless-output".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; samples];
                while !stop_flag.load(Ordering::Acquire) {
                    block.fill(0.0);
                    let status = render(&mut block);
                    if let Some(tap) = &tap {
                        tap.lock().extend_from_slice(&block);
                    }
                    if status == StreamStatus::Finished {
                        break;
                    }
                    if pacing {
                        std::thread::sleep(block_time);
                    }
                }
            })
            .map_err(|e| RecorderError::DeviceUnavailable(format!("cannot start output thread: {e}")))?;

        Ok(Box::new(HeadlessStream {
            stop,
            thread: Some(thread),
        }))
    }

    fn close(&self) {
        *self.state.lock() = DeviceState::Closed;
    }
}

struct HeadlessStream {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for HeadlessStream {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("headless output thread panicked");
            }
        }
    }
}

impl Drop for HeadlessStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The explicit audio context of one recorder session.
#[derive(Debug, Clone)]
pub struct AudioEngine {
    backend: Arc<dyn AudioBackend>,
    capture: Option<Arc<dyn CaptureDevice>>,
    config: RecorderConfig,
}

impl AudioEngine {
    /// Fails with `Config` for an invalid configuration and with
    /// `DeviceUnavailable` for a backend without a rate or channels.
    pub fn new(backend: Arc<dyn AudioBackend>, config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        if backend.sample_rate() == 0 || backend.channels() == 0 {
            return Err(RecorderError::DeviceUnavailable(format!(
                "output device reports {} Hz, {} channels",
                backend.sample_rate(),
                backend.channels()
            )));
        }
        Ok(AudioEngine {
            backend,
            capture: None,
            config,
        })
    }

    /// Engine on a [`HeadlessBackend`] built from `config`.
    pub fn headless(config: RecorderConfig) -> Result<Self> {
        let backend = Arc::new(HeadlessBackend::new(&config));
        AudioEngine::new(backend, config)
    }

    /// Engine on the default cpal output and input devices.
    #[cfg(feature = "cpal")]
    pub fn cpal(config: RecorderConfig) -> Result<Self> {
        let backend = Arc::new(crate::cpal_device::CpalBackend::new()?);
        let capture = Arc::new(crate::cpal_device::CpalCaptureDevice::new());
        Ok(AudioEngine::new(backend, config)?.with_capture_device(capture))
    }

    pub fn with_capture_device(mut self, device: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(device);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    /// The capture device, or `DeviceUnavailable` if the engine has none.
    pub fn capture_device(&self) -> Result<Arc<dyn CaptureDevice>> {
        self.capture
            .clone()
            .ok_or_else(|| RecorderError::DeviceUnavailable("no capture device".to_string()))
    }

    pub fn sample_rate(&self) -> u32 {
        self.backend.sample_rate()
    }

    pub fn channels(&self) -> u16 {
        self.backend.channels()
    }

    pub fn state(&self) -> DeviceState {
        self.backend.state()
    }

    /// Activate the output device if needed and confirm it is running.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_running(&self) -> Result<()> {
        match self.backend.state() {
            DeviceState::Running => return Ok(()),
            DeviceState::Closed => {
                return Err(RecorderError::DeviceUnavailable("audio engine disposed".to_string()));
            }
            DeviceState::Suspended => {}
        }
        debug!("resuming suspended output device");
        self.backend.resume().await?;
        match self.backend.state() {
            DeviceState::Running => {
                info!(sample_rate = self.sample_rate(), channels = self.channels(), "output device running");
                Ok(())
            }
            other => Err(RecorderError::DeviceUnavailable(format!(
                "output device did not start (state {other:?})"
            ))),
        }
    }

    /// Renderer that shares nothing with the realtime side.
    pub fn offline_renderer(&self) -> OfflineRenderer {
        OfflineRenderer::new()
    }

    pub fn dispose(&self) {
        debug!("disposing audio engine");
        self.backend.close();
    }
}
