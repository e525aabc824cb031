//! Transport controller
//!
//! Play/Pause/Stop/Seek semantics over the track set and the mixer. Owns
//! track lifecycle: tracks are created on `add_track`, attached to the mixer
//! on `play`, detached on `stop`, destroyed on `remove_track`.
//!
//! Control operations may block briefly (pre-roll wait, decode thread join);
//! callers on UI threads should invoke them from a worker task.

use crate::audio::backend::AudioBackend;
use crate::error::{Error, Result};
use crate::playback::effects::Effect;
use crate::playback::mixer::{mixer, Mixer, MixerHandle};
use crate::playback::pool::BufferPool;
use crate::playback::track::Track;
use crate::state::SharedState;
use ensemble_common::{
    AudioConfig, EngineEvent, EngineParams, EventBus, MasterClock, PlaybackState, TrackState,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transport controller over the track set, mixer, and backend device.
pub struct Transport {
    config: AudioConfig,
    params: EngineParams,

    mixer: MixerHandle,

    /// Consumed by the backend on first start
    pending_mixer: Mutex<Option<Mixer>>,
    backend: Mutex<Box<dyn AudioBackend>>,

    tracks: RwLock<Vec<Track>>,
    pool: BufferPool,

    state: Arc<SharedState>,
    events: Arc<EventBus>,

    /// Timeline position while not playing (the clock is authoritative
    /// while playing)
    stopped_position: Mutex<f64>,

    tempo_percent_bits: AtomicU32,
    pitch_semitones_bits: AtomicU32,

    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Transport {
    /// Build the engine around a backend. Must be called inside a tokio
    /// runtime (spawns the dropout drain and position tasks).
    pub fn new(
        config: AudioConfig,
        params: EngineParams,
        backend: Box<dyn AudioBackend>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let (mx, handle, dropout_rx) = mixer(&config, params.dropout_queue_depth);

        let pool_buffer_samples =
            crate::audio::resampler::RESAMPLER_CHUNK_FRAMES * config.channels as usize * 4;

        let transport = Arc::new(Self {
            config,
            params: params.clone(),
            mixer: handle,
            pending_mixer: Mutex::new(Some(mx)),
            backend: Mutex::new(backend),
            tracks: RwLock::new(Vec::new()),
            pool: BufferPool::new(pool_buffer_samples, 32),
            state: Arc::new(SharedState::new()),
            events,
            stopped_position: Mutex::new(0.0),
            tempo_percent_bits: AtomicU32::new(100.0f32.to_bits()),
            pitch_semitones_bits: AtomicU32::new(0.0f32.to_bits()),
            tasks: Mutex::new(Vec::new()),
        });

        transport.spawn_dropout_drain(dropout_rx);
        transport.spawn_position_reporter();
        transport
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<MasterClock> {
        self.mixer.clock()
    }

    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ------------------------------------------------------------------
    // Track lifecycle
    // ------------------------------------------------------------------

    /// Load a file into a new track. The track is not attached to the mixer
    /// until `play`.
    pub async fn add_track(&self, path: &Path) -> Result<Uuid> {
        let track = Track::load(path, &self.config, &self.params, &self.pool)?;
        track.attach_clock(self.mixer.clock());

        let id = track.id();
        self.tracks.write().await.push(track);
        info!("added track {} from {}", id, path.display());
        Ok(id)
    }

    /// Detach and dispose a track.
    pub async fn remove_track(&self, id: Uuid) -> Result<()> {
        let _ = self.mixer.detach(id);

        let mut tracks = self.tracks.write().await;
        let index = tracks
            .iter()
            .position(|t| t.id() == id)
            .ok_or(Error::TrackNotFound(id))?;
        let track = tracks.remove(index);
        drop(tracks);

        // Dropping joins the decode thread (bounded waits only).
        drop(track);
        info!("removed track {}", id);
        Ok(())
    }

    pub async fn track_ids(&self) -> Vec<Uuid> {
        self.tracks.read().await.iter().map(|t| t.id()).collect()
    }

    pub async fn track_state(&self, id: Uuid) -> Result<TrackState> {
        let tracks = self.tracks.read().await;
        tracks
            .iter()
            .find(|t| t.id() == id)
            .map(|t| t.state())
            .ok_or(Error::TrackNotFound(id))
    }

    /// Frames a track has delivered since its last seek (alignment
    /// diagnostics).
    pub async fn track_delivered_frames(&self, id: Uuid) -> Result<u64> {
        let tracks = self.tracks.read().await;
        tracks
            .iter()
            .find(|t| t.id() == id)
            .map(|t| t.shared().delivered_frames())
            .ok_or(Error::TrackNotFound(id))
    }

    /// Timeline position of a track's next sample, in seconds.
    pub async fn track_position_seconds(&self, id: Uuid) -> Result<f64> {
        let tracks = self.tracks.read().await;
        tracks
            .iter()
            .find(|t| t.id() == id)
            .map(|t| t.shared().position_seconds())
            .ok_or(Error::TrackNotFound(id))
    }

    // ------------------------------------------------------------------
    // Transport operations
    // ------------------------------------------------------------------

    /// Start or resume playback.
    ///
    /// From Stopped: attaches every track, aligns the clock to the current
    /// position, seeks and pre-rolls each source (bounded timeout; sources
    /// not ready in time start Faulted), then starts the backend.
    /// From Paused: rewinds the clock to the pause position and resumes
    /// without discarding buffered audio.
    pub async fn play(&self) -> Result<()> {
        let previous = self.state.playback_state().await;
        if previous == PlaybackState::Playing {
            return Ok(());
        }

        let position = *self.stopped_position.lock();

        if previous == PlaybackState::Paused {
            // Fast resume: ring contents were retained; put the clock back
            // where the sources stopped delivering.
            self.clock().seek(position);
            let tracks = self.tracks.read().await;
            for track in tracks.iter() {
                track.play();
            }
        } else {
            let tracks = self.tracks.read().await;
            self.clock().seek(position);

            for track in tracks.iter() {
                if let Err(e) = self.mixer.attach(track.shared()) {
                    // Surfaced, not fatal to the rest of the set
                    warn!("attach failed for '{}': {}", track.name(), e);
                    track.mark_faulted();
                    continue;
                }
                track.seek(position);
                track.play();
            }

            self.wait_for_preroll(&tracks).await;
        }

        self.ensure_backend_started()?;
        self.set_playback_state(PlaybackState::Playing).await;
        info!("playback started at {:.3}s", position);
        Ok(())
    }

    /// Pause: sources stop delivering, the backend keeps running and
    /// produces silence (avoids device cold-start on resume).
    pub async fn pause(&self) -> Result<()> {
        if self.state.playback_state().await != PlaybackState::Playing {
            return Ok(());
        }

        *self.stopped_position.lock() = self.clock().current_timestamp();

        let tracks = self.tracks.read().await;
        for track in tracks.iter() {
            track.pause();
        }
        drop(tracks);

        self.set_playback_state(PlaybackState::Paused).await;
        info!("playback paused");
        Ok(())
    }

    /// Stop: detach all sources, zero the clock, reset the position.
    pub async fn stop(&self) -> Result<()> {
        self.mixer.detach_all();

        let tracks = self.tracks.read().await;
        for track in tracks.iter() {
            track.stop();
        }
        drop(tracks);

        self.clock().reset();
        *self.stopped_position.lock() = 0.0;
        self.set_playback_state(PlaybackState::Stopped).await;
        info!("playback stopped");
        Ok(())
    }

    /// Seek the shared timeline.
    ///
    /// While playing: brake the pump (pause each source), move the clock and
    /// every source, then resume.
    pub async fn seek(&self, seconds: f64) -> Result<()> {
        let seconds = seconds.max(0.0);
        let playing = self.state.playback_state().await == PlaybackState::Playing;

        let tracks = self.tracks.read().await;
        if playing {
            for track in tracks.iter() {
                track.pause();
            }
        }

        self.clock().seek(seconds);
        *self.stopped_position.lock() = seconds;
        for track in tracks.iter() {
            track.seek(seconds);
        }

        if playing {
            for track in tracks.iter() {
                track.play();
            }
        }
        drop(tracks);

        debug!("seeked to {:.3}s", seconds);
        Ok(())
    }

    pub async fn is_playing(&self) -> bool {
        self.state.playback_state().await == PlaybackState::Playing
    }

    /// Current timeline position in seconds.
    pub async fn position_seconds(&self) -> f64 {
        if self.state.playback_state().await == PlaybackState::Playing {
            self.clock().current_timestamp()
        } else {
            *self.stopped_position.lock()
        }
    }

    /// Longest source duration after tempo scaling.
    pub async fn total_duration_seconds(&self) -> f64 {
        let tracks = self.tracks.read().await;
        tracks
            .iter()
            .map(|t| t.effective_duration_seconds())
            .fold(0.0, f64::max)
    }

    // ------------------------------------------------------------------
    // Mix controls
    // ------------------------------------------------------------------

    pub fn set_master_volume(&self, volume: f32) {
        self.mixer.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.mixer.master_volume()
    }

    /// Set the global tempo in percent, clamped to the configured band.
    /// Smooth updates keep in-flight buffers; hard updates resynchronize
    /// every source to the clock.
    pub async fn set_tempo_percent(&self, percent: f32, smooth: bool) -> f32 {
        let clamped = self.params.clamp_tempo_percent(percent);
        self.tempo_percent_bits
            .store(clamped.to_bits(), Ordering::Relaxed);
        let multiplier = clamped as f64 / 100.0;

        let tracks = self.tracks.read().await;
        for track in tracks.iter() {
            track.set_tempo(multiplier, smooth);
        }
        drop(tracks);

        if !smooth {
            // Hard tempo reset: re-align everything to the running clock.
            let position = self.position_seconds().await;
            let _ = self.seek(position).await;
        }
        clamped
    }

    pub fn tempo_percent(&self) -> f32 {
        f32::from_bits(self.tempo_percent_bits.load(Ordering::Relaxed))
    }

    pub async fn set_pitch_semitones(&self, semitones: f32, smooth: bool) {
        self.pitch_semitones_bits
            .store(semitones.to_bits(), Ordering::Relaxed);

        let tracks = self.tracks.read().await;
        for track in tracks.iter() {
            track.set_pitch(semitones as f64, smooth);
        }
        drop(tracks);

        if !smooth {
            let position = self.position_seconds().await;
            let _ = self.seek(position).await;
        }
    }

    pub fn pitch_semitones(&self) -> f32 {
        f32::from_bits(self.pitch_semitones_bits.load(Ordering::Relaxed))
    }

    pub async fn set_track_gain(&self, id: Uuid, gain: f32) -> Result<()> {
        self.with_track(id, |t| t.set_gain(gain)).await
    }

    pub async fn set_track_muted(&self, id: Uuid, muted: bool) -> Result<()> {
        self.with_track(id, |t| t.set_muted(muted)).await
    }

    pub async fn set_track_soloed(&self, id: Uuid, soloed: bool) -> Result<()> {
        self.with_track(id, |t| t.set_soloed(soloed)).await
    }

    pub fn add_master_effect(&self, effect: Box<dyn Effect>) -> Uuid {
        self.mixer.add_master_effect(effect)
    }

    pub fn remove_master_effect(&self, id: Uuid) {
        self.mixer.remove_master_effect(id);
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop playback, the backend device, and the service tasks.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.stop().await;
        self.backend.lock().stop()?;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn with_track<F: FnOnce(&Track)>(&self, id: Uuid, f: F) -> Result<()> {
        let tracks = self.tracks.read().await;
        let track = tracks
            .iter()
            .find(|t| t.id() == id)
            .ok_or(Error::TrackNotFound(id))?;
        f(track);
        Ok(())
    }

    /// Wait until every track is pre-rolled or the deadline passes; tracks
    /// still not ready start Faulted.
    async fn wait_for_preroll(&self, tracks: &[Track]) {
        let deadline = Instant::now() + self.params.preroll_timeout;
        loop {
            let pending = tracks
                .iter()
                .filter(|t| !t.is_ready() && t.state() != TrackState::Faulted)
                .count();
            if pending == 0 {
                return;
            }
            if Instant::now() >= deadline {
                for track in tracks.iter().filter(|t| !t.is_ready()) {
                    if track.state() != TrackState::Faulted {
                        warn!("track '{}' missed pre-roll deadline", track.name());
                        track.mark_faulted();
                    }
                }
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn ensure_backend_started(&self) -> Result<()> {
        let mut backend = self.backend.lock();
        if backend.is_running() {
            return Ok(());
        }
        let mixer = self
            .pending_mixer
            .lock()
            .take()
            .ok_or_else(|| Error::Backend("backend was shut down".to_string()))?;
        backend.start(mixer)
    }

    async fn set_playback_state(&self, new_state: PlaybackState) {
        let old_state = self.state.set_playback_state(new_state).await;
        if old_state != new_state {
            self.events.emit_lossy(EngineEvent::PlaybackStateChanged {
                old_state,
                new_state,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    fn spawn_dropout_drain(
        self: &Arc<Self>,
        mut dropout_rx: tokio::sync::mpsc::Receiver<ensemble_common::DropoutEvent>,
    ) {
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        let task = tokio::spawn(async move {
            while let Some(event) = dropout_rx.recv().await {
                let total = state.record_dropout(&event).await;
                if total <= 3 || total % 100 == 0 {
                    warn!(
                        "dropout #{}: {:?} on '{}' ({} frames at {:.3}s)",
                        total,
                        event.reason,
                        event.track_name,
                        event.missed_frames,
                        event.timestamp_secs
                    );
                }
                events.emit_lossy(EngineEvent::Dropout {
                    track_id: event.track_id,
                    track_name: event.track_name.to_string(),
                    position_secs: event.timestamp_secs,
                    missed_frames: event.missed_frames,
                    reason: event.reason,
                    timestamp: chrono::Utc::now(),
                });
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_position_reporter(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.params.position_event_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if transport.is_playing().await {
                    transport.events.emit_lossy(EngineEvent::PositionUpdate {
                        position_secs: transport.clock().current_timestamp(),
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        });
        self.tasks.lock().push(task);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
