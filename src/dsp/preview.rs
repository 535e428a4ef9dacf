//! Live preview — plays the effect chain through the engine's output device.
//!
//! A player owns at most one active session. Starting a new one stops the
//! old one first, and stopping is immediate and idempotent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::engine::{AudioEngine, OutputStream, StreamStatus};
use crate::error::Result;
use crate::params::EffectParameters;
use crate::pcm::PcmBuffer;

use super::chain::{ChainInstance, EffectChain};

/// Coarse level for UI meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReading {
    /// Peak absolute sample value over the meter window.
    pub level: f32,
    /// Playback position at the end of the window.
    pub position: Duration,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct SessionInner {
    id: u64,
    stopped: AtomicBool,
    finished: Arc<AtomicBool>,
    stream: Mutex<Option<Box<dyn OutputStream>>>,
    meter: Mutex<Option<mpsc::Receiver<MeterReading>>>,
}

/// Handle to one preview. Clones refer to the same session.
#[derive(Clone)]
pub struct PreviewSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for PreviewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewSession")
            .field("id", &self.inner.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl PreviewSession {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Playing: not stopped, not played out, no stream failure.
    pub fn is_active(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire) && !self.inner.finished.load(Ordering::Acquire)
    }

    /// Take the meter stream. Only the first caller gets it.
    pub fn take_meter(&self) -> Option<mpsc::Receiver<MeterReading>> {
        self.inner.meter.lock().take()
    }

    /// Stop playback and free the stream. Further calls do nothing.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let stream = self.inner.stream.lock().take();
        if let Some(mut stream) = stream {
            stream.stop();
        }
        debug!(id = self.inner.id, "preview stopped");
    }
}

/// Emits at most one reading per window; drops readings the UI has not
/// picked up rather than blocking the audio thread.
struct LevelMeter {
    tx: mpsc::Sender<MeterReading>,
    window: usize,
    sample_rate: u32,
    count: usize,
    played: u64,
    peak: f32,
}

impl LevelMeter {
    fn observe(&mut self, lanes: &[Vec<f32>], frames: usize) {
        for f in 0..frames {
            let m = lanes.iter().map(|l| l[f].abs()).fold(0.0f32, f32::max);
            self.peak = self.peak.max(m);
            self.count += 1;
            self.played += 1;
            if self.count >= self.window {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        let _ = self.tx.try_send(MeterReading {
            level: self.peak,
            position: Duration::from_secs_f64(self.played as f64 / self.sample_rate as f64),
        });
        self.count = 0;
        self.peak = 0.0;
    }

    fn flush(&mut self) {
        if self.count > 0 {
            self.emit();
        }
    }
}

/// The realtime side of one session: chain instance plus channel mapping.
struct PreviewVoice {
    source: Arc<PcmBuffer>,
    chain: ChainInstance,
    lanes: Vec<Vec<f32>>,
    block_frames: usize,
    out_channels: usize,
    meter: LevelMeter,
    finished: Arc<AtomicBool>,
}

impl PreviewVoice {
    fn render(&mut self, out: &mut [f32]) -> StreamStatus {
        let frames = out.len() / self.out_channels;
        let last_lane = self.lanes.len() - 1;
        let mut done = 0;
        while done < frames {
            let want = (frames - done).min(self.block_frames);
            for lane in self.lanes.iter_mut() {
                lane.resize(want, 0.0);
            }
            let n = self.chain.process(&self.source, &mut self.lanes);
            for f in 0..n {
                let frame = &mut out[(done + f) * self.out_channels..(done + f + 1) * self.out_channels];
                for (c, slot) in frame.iter_mut().enumerate() {
                    *slot = self.lanes[c.min(last_lane)][f];
                }
            }
            self.meter.observe(&self.lanes, n);
            done += n;
            if n < want {
                break;
            }
        }
        out[done * self.out_channels..].fill(0.0);

        if self.chain.is_finished() {
            self.meter.flush();
            self.finished.store(true, Ordering::Release);
            StreamStatus::Finished
        } else {
            StreamStatus::Continue
        }
    }
}

/// Plays previews; keeps track of the one that is current.
#[derive(Debug, Default)]
pub struct LivePreviewPlayer {
    current: Option<PreviewSession>,
}

impl LivePreviewPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an audible preview of `buffer` under `params`.
    ///
    /// Stops the previous session, activates the output device if it is
    /// suspended, and resolves once playback has started.
    #[instrument(level = "debug", skip(self, engine, buffer))]
    pub async fn start(
        &mut self,
        engine: &AudioEngine,
        buffer: Arc<PcmBuffer>,
        params: EffectParameters,
    ) -> Result<PreviewSession> {
        self.stop_current();

        let chain = EffectChain::new(params)?;
        engine.ensure_running().await?;

        let config = engine.config();
        let out_rate = engine.sample_rate();
        let out_channels = engine.channels() as usize;
        let (tx, rx) = mpsc::channel(config.meter_capacity);
        let finished = Arc::new(AtomicBool::new(false));

        let mut voice = PreviewVoice {
            chain: chain.instantiate(&buffer, out_rate),
            lanes: vec![Vec::with_capacity(config.block_frames); buffer.num_channels()],
            source: buffer,
            block_frames: config.block_frames,
            out_channels,
            meter: LevelMeter {
                tx,
                window: config.meter_interval_frames(out_rate),
                sample_rate: out_rate,
                count: 0,
                played: 0,
                peak: 0.0,
            },
            finished: Arc::clone(&finished),
        };

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let failed = Arc::clone(&finished);
        let stream = engine.backend().open_stream(
            Box::new(move |out| voice.render(out)),
            Box::new(move |err| {
                error!(id, "preview stream failed: {err}");
                failed.store(true, Ordering::Release);
            }),
        )?;

        let session = PreviewSession {
            inner: Arc::new(SessionInner {
                id,
                stopped: AtomicBool::new(false),
                finished,
                stream: Mutex::new(Some(stream)),
                meter: Mutex::new(Some(rx)),
            }),
        };
        info!(id, pitch = params.pitch, crunch = params.crunch, volume = params.volume, "preview started");
        self.current = Some(session.clone());
        Ok(session)
    }

    /// Stop `session`. Stopping an already stopped session does nothing.
    pub fn stop(&mut self, session: &PreviewSession) {
        session.stop();
        if self.current.as_ref().is_some_and(|c| c.id() == session.id()) {
            self.current = None;
        }
    }

    /// Stop whatever is playing, if anything.
    pub fn stop_current(&mut self) {
        if let Some(session) = self.current.take() {
            session.stop();
        }
    }

    pub fn current(&self) -> Option<&PreviewSession> {
        self.current.as_ref()
    }

    pub fn is_playing(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use crate::dsp::renderer::OfflineRenderer;
    use crate::engine::{DeviceState, HeadlessBackend};
    use crate::error::RecorderError;

    fn config(pacing: bool, rate: u32, channels: u16) -> RecorderConfig {
        RecorderConfig {
            realtime_pacing: pacing,
            block_frames: 128,
            headless_sample_rate: rate,
            headless_channels: channels,
            ..RecorderConfig::default()
        }
    }

    fn tone(rate: u32, frames: usize) -> Arc<PcmBuffer> {
        let data = (0..frames)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.9)
            .collect();
        Arc::new(PcmBuffer::new(rate, vec![data]).unwrap())
    }

    async fn wait_finished(session: &PreviewSession) {
        for _ in 0..500 {
            if !session.is_active() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("preview never finished");
    }

    #[tokio::test]
    async fn preview_plays_what_render_produces() {
        let cfg = config(false, 8000, 1);
        let backend = Arc::new(HeadlessBackend::new(&cfg).with_tap());
        let engine = AudioEngine::new(backend.clone(), cfg).unwrap();
        let buffer = tone(8000, 3000);
        let params = EffectParameters::new(1.25, 150.0, 1.6);

        let mut player = LivePreviewPlayer::new();
        let session = player.start(&engine, Arc::clone(&buffer), params).await.unwrap();
        wait_finished(&session).await;
        player.stop(&session);

        let rendered = OfflineRenderer::new().render(&buffer, params).unwrap();
        let tapped = backend.tapped();
        let frames = rendered.frame_count();
        assert!(tapped.len() >= frames);
        assert_eq!(&tapped[..frames], rendered.channel(0));
        assert!(tapped[frames..].iter().all(|&s| s == 0.0));
    }

    #[tokio::test]
    async fn mono_source_fills_every_output_channel() {
        let cfg = config(false, 8000, 2);
        let backend = Arc::new(HeadlessBackend::new(&cfg).with_tap());
        let engine = AudioEngine::new(backend.clone(), cfg).unwrap();
        let buffer = tone(8000, 500);

        let mut player = LivePreviewPlayer::new();
        let session = player
            .start(&engine, buffer, EffectParameters::default())
            .await
            .unwrap();
        wait_finished(&session).await;
        session.stop();

        let tapped = backend.tapped();
        for frame in tapped.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
    }

    #[tokio::test]
    async fn start_activates_suspended_device() {
        let cfg = config(false, 8000, 1);
        let engine = AudioEngine::headless(cfg).unwrap();
        assert_eq!(engine.state(), DeviceState::Suspended);
        let mut player = LivePreviewPlayer::new();
        let session = player
            .start(&engine, tone(8000, 100), EffectParameters::default())
            .await
            .unwrap();
        assert_eq!(engine.state(), DeviceState::Running);
        player.stop(&session);
    }

    #[tokio::test]
    async fn new_session_replaces_old_and_stop_is_idempotent() {
        let engine = AudioEngine::headless(config(true, 8000, 1)).unwrap();
        let buffer = tone(8000, 80000);
        let mut player = LivePreviewPlayer::new();

        let first = player
            .start(&engine, Arc::clone(&buffer), EffectParameters::default())
            .await
            .unwrap();
        assert!(first.is_active());

        let second = player
            .start(&engine, buffer, EffectParameters::default().with_pitch(2.0))
            .await
            .unwrap();
        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(player.current().map(|s| s.id()), Some(second.id()));

        player.stop(&second);
        assert!(!second.is_active());
        assert!(!player.is_playing());
        player.stop(&second);
        player.stop(&first);
        player.stop_current();
        assert!(player.current().is_none());
    }

    #[tokio::test]
    async fn meter_stream_is_bounded_and_advances() {
        let cfg = RecorderConfig {
            meter_capacity: 4,
            ..config(false, 8000, 1)
        };
        let engine = AudioEngine::headless(cfg).unwrap();
        let mut player = LivePreviewPlayer::new();
        let session = player
            .start(&engine, tone(8000, 8000), EffectParameters::default())
            .await
            .unwrap();
        let mut meter = session.take_meter().unwrap();
        assert!(session.take_meter().is_none());
        wait_finished(&session).await;
        player.stop(&session);

        let mut readings = Vec::new();
        while let Ok(r) = meter.try_recv() {
            readings.push(r);
        }
        assert!(!readings.is_empty());
        assert!(readings.len() <= 4);
        for pair in readings.windows(2) {
            assert!(pair[1].position > pair[0].position);
        }
        assert!(readings.iter().all(|r| r.level > 0.0 && r.level.is_finite()));
    }

    #[tokio::test]
    async fn non_finite_params_do_not_start() {
        let engine = AudioEngine::headless(config(false, 8000, 1)).unwrap();
        let mut player = LivePreviewPlayer::new();
        let err = player
            .start(&engine, tone(8000, 10), EffectParameters::new(f64::NAN, 0.0, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::RenderFailure(_)));
        assert!(player.current().is_none());
    }
}
