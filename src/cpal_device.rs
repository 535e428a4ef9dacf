//! Hardware devices through [cpal](https://crates.io/crates/cpal).
//!
//! cpal streams are not `Send`, so every stream lives on its own thread and
//! is controlled over a channel; dropping the control end stops the stream.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::capture::CaptureDevice;
use crate::engine::{AudioBackend, DeviceState, ErrorCallback, OutputStream, RenderCallback, StreamStatus};
use crate::error::{RecorderError, Result};
use crate::pcm::PcmBuffer;
use crate::wav;

fn unavailable(e: impl std::fmt::Display) -> RecorderError {
    RecorderError::DeviceUnavailable(e.to_string())
}

/// Name and default-ness of one host device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default_input: bool,
    pub is_default_output: bool,
}

pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_in = host.default_input_device().and_then(|d| d.name().ok());
    let default_out = host.default_output_device().and_then(|d| d.name().ok());

    let mut out = Vec::new();
    for dev in host.devices().map_err(unavailable)? {
        let name = dev.name().unwrap_or_else(|_| "<unknown>".to_string());
        out.push(DeviceInfo {
            is_default_input: default_in.as_deref() == Some(name.as_str()),
            is_default_output: default_out.as_deref() == Some(name.as_str()),
            name,
        });
    }
    Ok(out)
}

/// The default output device.
#[derive(Debug)]
pub struct CpalBackend {
    sample_rate: u32,
    channels: u16,
    state: Mutex<DeviceState>,
}

impl CpalBackend {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| unavailable("no default output device"))?;
        let config = device.default_output_config().map_err(unavailable)?;
        Ok(CpalBackend {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            state: Mutex::new(DeviceState::Suspended),
        })
    }

    fn stream_make<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut render: RenderCallback,
        mut on_error: ErrorCallback,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32>,
    {
        let mut scratch: Vec<f32> = Vec::new();
        let mut finished = false;
        device
            .build_output_stream(
                config,
                move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.clear();
                    scratch.resize(output.len(), 0.0);
                    if !finished {
                        finished = render(&mut scratch) == StreamStatus::Finished;
                    }
                    for (o, &s) in output.iter_mut().zip(&scratch) {
                        *o = T::from_sample(s);
                    }
                },
                move |err| on_error(err.to_string()),
                None,
            )
            .map_err(unavailable)
    }
}

#[async_trait]
impl AudioBackend for CpalBackend {
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
        if cpal::default_host().default_output_device().is_none() {
            return Err(unavailable("output device disappeared"));
        }
        let mut state = self.state.lock();
        if *state == DeviceState::Closed {
            return Err(unavailable("output device is closed"));
        }
        *state = DeviceState::Running;
        Ok(())
    }

    fn open_stream(&self, render: RenderCallback, on_error: ErrorCallback) -> Result<Box<dyn OutputStream>> {
        if self.state() != DeviceState::Running {
            return Err(unavailable(format!("output device is {:?}", self.state())));
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("cpal-output".to_string())
            .spawn(move || {
                let built = (|| {
                    let device = cpal::default_host()
                        .default_output_device()
                        .ok_or_else(|| unavailable("no default output device"))?;
                    let supported = device.default_output_config().map_err(unavailable)?;
                    let config: StreamConfig = supported.config();
                    let stream = match supported.sample_format() {
                        cpal::SampleFormat::F32 => Self::stream_make::<f32>(&device, &config, render, on_error)?,
                        cpal::SampleFormat::I16 => Self::stream_make::<i16>(&device, &config, render, on_error)?,
                        cpal::SampleFormat::U16 => Self::stream_make::<u16>(&device, &config, render, on_error)?,
                        other => return Err(unavailable(format!("unsupported output format {other:?}"))),
                    };
                    stream.play().map_err(unavailable)?;
                    Ok(stream)
                })();
                match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Blocks until the handle sends or is dropped.
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(unavailable)?;

        ready_rx
            .recv()
            .map_err(|_| unavailable("output thread exited during setup"))??;
        debug!("cpal output stream playing");
        Ok(Box::new(ThreadStream {
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }

    fn close(&self) {
        *self.state.lock() = DeviceState::Closed;
    }
}

struct ThreadStream {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for ThreadStream {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("cpal stream thread panicked");
            }
        }
    }
}

impl Drop for ThreadStream {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Recording {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    samples: Arc<Mutex<Vec<f32>>>,
    sample_rate: u32,
    channels: u16,
}

/// The default input device. Hands back what it heard as 16-bit WAV bytes.
#[derive(Default)]
pub struct CpalCaptureDevice {
    acquired: Mutex<bool>,
    recording: Mutex<Option<Recording>>,
}

impl std::fmt::Debug for CpalCaptureDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpalCaptureDevice")
            .field("acquired", &*self.acquired.lock())
            .field("recording", &self.recording.lock().is_some())
            .finish()
    }
}

impl CpalCaptureDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn input_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        samples: Arc<Mutex<Vec<f32>>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    samples
                        .lock()
                        .extend(data.iter().map(|&s| <f32 as FromSample<T>>::from_sample_(s)));
                },
                move |err| error!("input stream error: {err}"),
                None,
            )
            .map_err(unavailable)
    }
}

#[async_trait]
impl CaptureDevice for CpalCaptureDevice {
    async fn acquire(&self) -> Result<()> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| unavailable("no default input device"))?;
        device.default_input_config().map_err(unavailable)?;
        let mut acquired = self.acquired.lock();
        if *acquired {
            return Err(unavailable("input device already held"));
        }
        *acquired = true;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| unavailable("no default input device"))?;
        let supported = device.default_input_config().map_err(unavailable)?;
        let config: StreamConfig = supported.config();
        let format = supported.sample_format();
        let samples = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread_samples = Arc::clone(&samples);
        let thread_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("cpal-input".to_string())
            .spawn(move || {
                let built = match format {
                    cpal::SampleFormat::F32 => Self::input_stream::<f32>(&device, &thread_config, thread_samples),
                    cpal::SampleFormat::I16 => Self::input_stream::<i16>(&device, &thread_config, thread_samples),
                    cpal::SampleFormat::U16 => Self::input_stream::<u16>(&device, &thread_config, thread_samples),
                    other => Err(unavailable(format!("unsupported input format {other:?}"))),
                }
                .and_then(|stream| stream.play().map(|_| stream).map_err(unavailable));
                match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(unavailable)?;

        ready_rx
            .recv()
            .map_err(|_| unavailable("input thread exited during setup"))??;
        *self.recording.lock() = Some(Recording {
            stop: stop_tx,
            thread,
            samples,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        });
        Ok(())
    }

    fn finish(&self) -> Result<Vec<u8>> {
        let recording = self.recording.lock().take().ok_or(RecorderError::EmptyCapture)?;
        let _ = recording.stop.send(());
        if recording.thread.join().is_err() {
            warn!("cpal input thread panicked");
        }
        let samples = std::mem::take(&mut *recording.samples.lock());
        if samples.is_empty() {
            return Err(RecorderError::EmptyCapture);
        }
        let frames = samples.len() / recording.channels as usize;
        let usable = frames * recording.channels as usize;
        let pcm = PcmBuffer::from_interleaved(&samples[..usable], recording.channels as usize, recording.sample_rate)?;
        wav::encode(&pcm)
    }

    fn release(&self) {
        if let Some(recording) = self.recording.lock().take() {
            let _ = recording.stop.send(());
            let _ = recording.thread.join();
        }
        *self.acquired.lock() = false;
    }
}
