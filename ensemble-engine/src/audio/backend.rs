//! Audio backend adapter
//!
//! Thin contract over a callback-driven output device. The mixer's `fill`
//! fulfills the callback; the backend guarantees one callback at a time and
//! delivers interleaved f32 at the negotiated rate and channel count.
//!
//! `CpalBackend` owns its `cpal::Stream` on a dedicated thread (streams are
//! not `Send`), controlled over a channel. `OfflineBackend` drives the same
//! mixer synchronously for tests and offline rendering.

use crate::error::{Error, Result};
use crate::playback::mixer::Mixer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::{bounded, Sender};
use ensemble_common::{AudioConfig, EngineEvent, EventBus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Contract the engine needs from a platform output device.
pub trait AudioBackend: Send {
    /// Open the device and begin invoking `mixer.fill` from the real-time
    /// callback.
    fn start(&mut self, mixer: Mixer) -> Result<()>;

    /// Stop the callback and release the device.
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Frames the device requests per callback.
    fn frames_per_buffer(&self) -> usize;
}

/// List available output device names.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Backend(format!("failed to enumerate devices: {}", e)))?
        .filter_map(|device| device.name().ok())
        .collect();
    debug!("found {} output devices", devices.len());
    Ok(devices)
}

enum StreamCommand {
    Shutdown,
}

/// cpal-backed output device.
pub struct CpalBackend {
    config: AudioConfig,
    device_name: Option<String>,
    events: Arc<EventBus>,

    control: Option<Sender<StreamCommand>>,
    thread: Option<std::thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl CpalBackend {
    /// Prepare a backend for the configured format. The device itself is
    /// opened on `start`, on the stream thread.
    pub fn new(config: &AudioConfig, device_name: Option<String>, events: Arc<EventBus>) -> Self {
        Self {
            config: *config,
            device_name,
            events,
            control: None,
            thread: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn open_stream(
        config: &AudioConfig,
        device_name: Option<&str>,
        mut mixer: Mixer,
        events: Arc<EventBus>,
    ) -> Result<cpal::Stream> {
        let host = cpal::default_host();

        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Backend(format!("failed to enumerate devices: {}", e)))?
                .find(|d| d.name().ok().as_deref() == Some(name))
                .ok_or_else(|| Error::Backend(format!("device '{}' not found", name)))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Backend("no default output device".to_string()))?,
        };

        info!(
            "using audio device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let supported = device
            .supported_output_configs()
            .map_err(|e| Error::Backend(format!("failed to query device configs: {}", e)))?
            .find(|c| {
                c.channels() == config.channels
                    && c.min_sample_rate().0 <= config.sample_rate
                    && c.max_sample_rate().0 >= config.sample_rate
                    && c.sample_format() == SampleFormat::F32
            })
            .ok_or_else(|| {
                Error::Backend(format!(
                    "device does not support {} Hz / {} ch f32 output",
                    config.sample_rate, config.channels
                ))
            })?;

        let mut stream_config = supported
            .with_sample_rate(cpal::SampleRate(config.sample_rate))
            .config();
        stream_config.buffer_size = cpal::BufferSize::Fixed(config.buffer_size_frames as u32);

        let channels = config.channels as usize;
        let chunk_samples = config.buffer_size_frames
            * crate::playback::mixer::MAX_FILL_FRAMES_MULTIPLE
            * channels;

        let error_events = Arc::clone(&events);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // Devices may hand over more than one engine buffer at
                    // once; the mixer caps a single fill, so feed it chunks.
                    for chunk in data.chunks_mut(chunk_samples) {
                        let frames = chunk.len() / channels;
                        mixer.fill(chunk, frames);
                    }
                },
                move |err| {
                    warn!("audio stream error: {}", err);
                    error_events.emit_lossy(EngineEvent::DeviceStateChanged {
                        running: false,
                        detail: err.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                },
                None,
            )
            .map_err(|e| Error::Backend(format!("failed to build stream: {}", e)))?;

        Ok(stream)
    }
}

impl AudioBackend for CpalBackend {
    fn start(&mut self, mixer: Mixer) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let (control_tx, control_rx) = bounded::<StreamCommand>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let config = self.config;
        let device_name = self.device_name.clone();
        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);

        // The stream is not Send: build it on the thread that owns it and
        // keep it alive there until shutdown.
        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match Self::open_stream(
                    &config,
                    device_name.as_deref(),
                    mixer,
                    Arc::clone(&events),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx
                        .send(Err(Error::Backend(format!("failed to start stream: {}", e))));
                    return;
                }

                running.store(true, Ordering::Release);
                events.emit_lossy(EngineEvent::DeviceStateChanged {
                    running: true,
                    detail: "stream started".to_string(),
                    timestamp: chrono::Utc::now(),
                });
                let _ = ready_tx.send(Ok(()));

                // Park until shutdown; the callback does all the work.
                let _ = control_rx.recv();

                drop(stream);
                running.store(false, Ordering::Release);
                events.emit_lossy(EngineEvent::DeviceStateChanged {
                    running: false,
                    detail: "stream stopped".to_string(),
                    timestamp: chrono::Utc::now(),
                });
            })
            .map_err(|e| Error::Backend(format!("failed to spawn stream thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.control = Some(control_tx);
                self.thread = Some(thread);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Backend("stream thread died during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(control) = self.control.take() {
            let _ = control.send(StreamCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn frames_per_buffer(&self) -> usize {
        self.config.buffer_size_frames
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Offline backend: the render loop calls `render` instead of a device
/// callback. Used by tests and offline bounce.
pub struct OfflineBackend {
    config: AudioConfig,
    mixer: Arc<Mutex<Option<Mixer>>>,
    running: bool,
}

impl OfflineBackend {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: *config,
            mixer: Arc::new(Mutex::new(None)),
            running: false,
        }
    }

    /// Handle for driving fills after `start` moved the mixer in.
    pub fn renderer(&self) -> OfflineRenderer {
        OfflineRenderer {
            mixer: Arc::clone(&self.mixer),
            channels: self.config.channels as usize,
        }
    }
}

/// Drives an offline mixer synchronously.
#[derive(Clone)]
pub struct OfflineRenderer {
    mixer: Arc<Mutex<Option<Mixer>>>,
    channels: usize,
}

impl OfflineRenderer {
    /// Render `frames` frames into `out`; returns frames written (0 when
    /// the backend has not been started).
    pub fn render(&self, out: &mut [f32], frames: usize) -> usize {
        let mut guard = self.mixer.lock();
        match guard.as_mut() {
            Some(mixer) => mixer.fill(out, frames.min(out.len() / self.channels)),
            None => 0,
        }
    }
}

impl AudioBackend for OfflineBackend {
    fn start(&mut self, mixer: Mixer) -> Result<()> {
        mixer.clock().set_mode(ensemble_common::ClockMode::Offline);
        *self.mixer.lock() = Some(mixer);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn frames_per_buffer(&self) -> usize {
        self.config.buffer_size_frames
    }
}
