//! Capture source — microphone or imported file to raw encoded bytes.
//!
//! A capture runs as a background task that first awaits the device's
//! permission grant, then records until [`CaptureSource::end_capture`]. The
//! handle's cancellation token is checked after the permission await: if the
//! user let go before the grant resolved, nothing is recorded and the bytes
//! are discarded. The device is released on every path.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::AudioEngine;
use crate::error::{RecorderError, Result};

/// An exclusive capture device.
#[async_trait]
pub trait CaptureDevice: Send + Sync + Debug {
    /// Await the permission grant and open the device.
    async fn acquire(&self) -> Result<()>;
    /// Begin recording.
    fn start(&self) -> Result<()>;
    /// Stop recording and return the encoded bytes.
    fn finish(&self) -> Result<Vec<u8>>;
    /// Give the device back. Called on every path, including when
    /// `acquire` failed.
    fn release(&self);
}

/// Where a chunk of raw audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioOrigin {
    Captured,
    Imported,
}

/// Encoded audio, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub bytes: Vec<u8>,
    pub origin: AudioOrigin,
}

/// Ties the device release and the exclusivity permit to one scope.
struct DeviceLease {
    device: Arc<dyn CaptureDevice>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.device.release();
        debug!("capture device released");
    }
}

/// A capture in flight. Dropping it without calling `end_capture` stops the
/// capture and discards what was recorded.
#[derive(Debug)]
pub struct CaptureHandle {
    token: CancellationToken,
    started: watch::Receiver<bool>,
    task: Option<JoinHandle<Result<Option<Vec<u8>>>>>,
}

impl CaptureHandle {
    /// Resolves `true` once recording has actually started, or `false` if
    /// the capture ended first (permission denied, aborted).
    pub async fn wait_started(&mut self) -> bool {
        self.started.wait_for(|started| *started).await.is_ok()
    }

    pub fn is_recording(&self) -> bool {
        *self.started.borrow() && !self.token.is_cancelled()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Front door for capture and import.
#[derive(Debug)]
pub struct CaptureSource {
    device: Option<Arc<dyn CaptureDevice>>,
    exclusive: Arc<Semaphore>,
}

impl CaptureSource {
    /// Capture source over the engine's capture device, if it has one.
    pub fn new(engine: &AudioEngine) -> Self {
        CaptureSource {
            device: engine.capture_device().ok(),
            exclusive: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn with_device(device: Arc<dyn CaptureDevice>) -> Self {
        CaptureSource {
            device: Some(device),
            exclusive: Arc::new(Semaphore::new(1)),
        }
    }

    /// True while a capture holds the device.
    pub fn is_busy(&self) -> bool {
        self.exclusive.available_permits() == 0
    }

    /// Start a capture. Must be called inside a tokio runtime.
    ///
    /// Fails with `DeviceUnavailable` when there is no device or another
    /// capture still holds it. A denied permission surfaces from
    /// `end_capture` (and makes `wait_started` resolve `false`).
    pub fn begin_capture(&self) -> Result<CaptureHandle> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| RecorderError::DeviceUnavailable("no capture device".to_string()))?;
        let permit = Arc::clone(&self.exclusive)
            .try_acquire_owned()
            .map_err(|_| RecorderError::DeviceUnavailable("capture device is busy".to_string()))?;

        let token = CancellationToken::new();
        let (started_tx, started_rx) = watch::channel(false);
        let lease = DeviceLease {
            device,
            _permit: permit,
        };
        let task = tokio::spawn(run_capture(lease, token.clone(), started_tx));
        debug!("capture requested");

        Ok(CaptureHandle {
            token,
            started: started_rx,
            task: Some(task),
        })
    }

    /// Finish a capture and hand back its bytes.
    ///
    /// Returns `EmptyCapture` if the capture was aborted before recording
    /// started or recorded nothing.
    pub async fn end_capture(&self, mut handle: CaptureHandle) -> Result<RawAudio> {
        handle.token.cancel();
        let Some(task) = handle.task.take() else {
            return Err(RecorderError::EmptyCapture);
        };
        let recorded = task
            .await
            .map_err(|e| RecorderError::DeviceUnavailable(format!("capture task failed: {e}")))??;
        match recorded {
            Some(bytes) if !bytes.is_empty() => {
                info!(bytes = bytes.len(), "capture finished");
                Ok(RawAudio {
                    bytes,
                    origin: AudioOrigin::Captured,
                })
            }
            Some(_) => {
                warn!("capture produced zero bytes");
                Err(RecorderError::EmptyCapture)
            }
            None => Err(RecorderError::EmptyCapture),
        }
    }

    /// Bypass the device entirely.
    pub fn import_file(&self, bytes: Vec<u8>) -> RawAudio {
        RawAudio {
            bytes,
            origin: AudioOrigin::Imported,
        }
    }
}

async fn run_capture(
    lease: DeviceLease,
    token: CancellationToken,
    started: watch::Sender<bool>,
) -> Result<Option<Vec<u8>>> {
    lease.device.acquire().await?;
    if token.is_cancelled() {
        debug!("capture ended before permission resolved; discarding");
        return Ok(None);
    }
    lease.device.start()?;
    let _ = started.send(true);

    token.cancelled().await;
    let bytes = lease.device.finish()?;
    Ok(Some(bytes))
}

/// Outcome of the simulated permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Default)]
struct MemoryDeviceState {
    held: bool,
    recording: bool,
    acquires: usize,
    starts: usize,
    releases: usize,
}

/// Capture device that "records" a preset clip. Used headless and in tests.
#[derive(Debug)]
pub struct MemoryCaptureDevice {
    clip: Vec<u8>,
    permission: Permission,
    grant_delay: Duration,
    state: Mutex<MemoryDeviceState>,
}

impl MemoryCaptureDevice {
    pub fn new(clip: Vec<u8>) -> Self {
        MemoryCaptureDevice {
            clip,
            permission: Permission::Granted,
            grant_delay: Duration::ZERO,
            state: Mutex::new(MemoryDeviceState::default()),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    /// Time the permission prompt takes to resolve.
    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = delay;
        self
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    pub fn acquire_count(&self) -> usize {
        self.state.lock().acquires
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().starts
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().releases
    }
}

#[async_trait]
impl CaptureDevice for MemoryCaptureDevice {
    async fn acquire(&self) -> Result<()> {
        if !self.grant_delay.is_zero() {
            tokio::time::sleep(self.grant_delay).await;
        }
        if self.permission == Permission::Denied {
            return Err(RecorderError::DeviceUnavailable("permission denied".to_string()));
        }
        let mut state = self.state.lock();
        if state.held {
            return Err(RecorderError::DeviceUnavailable("device already held".to_string()));
        }
        state.held = true;
        state.acquires += 1;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.held {
            return Err(RecorderError::DeviceUnavailable("device not acquired".to_string()));
        }
        state.recording = true;
        state.starts += 1;
        Ok(())
    }

    fn finish(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.recording {
            return Err(RecorderError::EmptyCapture);
        }
        state.recording = false;
        Ok(self.clip.clone())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.held = false;
        state.recording = false;
        state.releases += 1;
    }
}
