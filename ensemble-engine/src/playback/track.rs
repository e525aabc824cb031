//! Track source: one decoded stream bound to the master clock
//!
//! A track presents a sample-accurate, clock-locked view of one decoded
//! audio stream to the mixer. It is split across three execution contexts:
//!
//! - **Control plane** (`Track`): play/pause/stop/seek, tempo/pitch, gain,
//!   mute/solo. Owns the decode thread handle.
//! - **Decode thread**: symphonia decode → channel normalize → resample →
//!   tempo/pitch transform → ring write. Blocks only on a bounded condvar
//!   wait when the ring is full, or on file IO.
//! - **Audio callback** (`TrackShared::read`): pops samples, corrects drift
//!   against the master clock, pads silence on underrun. Never locks.
//!
//! Timeline bookkeeping: `head_frame` is the engine-timeline position of the
//! next sample the mixer will receive; `produce_frame` is the position of
//! the next sample the decoder will write. The master clock value is the
//! position both should match. A seek republishes all three.

use crate::audio::decoder::{probe, SourceInfo, StreamingDecoder};
use crate::audio::resampler::{StreamResampler, RESAMPLER_CHUNK_FRAMES};
use crate::audio::types::convert_channels;
use crate::error::{Error, Result};
use crate::playback::pool::BufferPool;
use crate::playback::ring_buffer::SampleRing;
use crate::playback::transform::{RateTransform, TempoTransform};
use ensemble_common::{AudioConfig, EngineParams, MasterClock, TrackState};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Composite tempo/pitch parameter record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformParams {
    pub tempo: f64,
    pub pitch_semitones: f64,

    /// Smooth updates keep in-flight buffers; hard updates restart decode at
    /// the current clock position
    pub smooth: bool,
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            tempo: 1.0,
            pitch_semitones: 0.0,
            smooth: true,
        }
    }
}

/// Generation-counted double-buffered parameter cell.
///
/// The control plane stores a full record and bumps the generation; the
/// decode thread polls between packets. A seqlock-style re-check keeps the
/// reader from observing a torn record without any reader-side lock.
pub(crate) struct ParamCell {
    slots: [UnsafeCell<TransformParams>; 2],
    generation: AtomicU64,
    writers: Mutex<()>,
}

// SAFETY: readers copy from a slot and validate the generation afterwards;
// writers are serialized by `writers` and only touch the inactive slot.
unsafe impl Sync for ParamCell {}

impl ParamCell {
    fn new(initial: TransformParams) -> Self {
        Self {
            slots: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
            generation: AtomicU64::new(0),
            writers: Mutex::new(()),
        }
    }

    pub(crate) fn store(&self, params: TransformParams) {
        let _guard = self.writers.lock();
        let next = self.generation.load(Ordering::Relaxed) + 1;
        unsafe {
            *self.slots[(next & 1) as usize].get() = params;
        }
        self.generation.store(next, Ordering::Release);
    }

    /// Returns the current record when its generation differs from
    /// `last_seen`, updating `last_seen`.
    pub(crate) fn load_if_changed(&self, last_seen: &mut u64) -> Option<TransformParams> {
        let mut generation = self.generation.load(Ordering::Acquire);
        if generation == *last_seen {
            return None;
        }
        loop {
            let params = unsafe { *self.slots[(generation & 1) as usize].get() };
            let reread = self.generation.load(Ordering::Acquire);
            if reread == generation {
                *last_seen = generation;
                return Some(params);
            }
            generation = reread;
        }
    }

    fn current(&self) -> TransformParams {
        let mut last_seen = u64::MAX;
        self.load_if_changed(&mut last_seen)
            .expect("generation can never equal u64::MAX")
    }
}

/// What a `read` call observed, for the mixer's dropout accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// Track not delivering (Idle/Buffering/Paused/Ended); silence, no
    /// dropout
    Inactive,

    /// Full delivery
    Ok,

    /// Ring ran dry mid-fill
    Underrun { missed: u32 },

    /// First read after the track faulted
    Fault,
}

/// State shared between control plane, decode thread and audio callback.
pub struct TrackShared {
    id: Uuid,
    name: Arc<str>,

    /// Engine output format (the produced stream always matches it)
    sample_rate: u32,
    channels: u16,

    ring: SampleRing,
    state: AtomicU8,

    gain_bits: AtomicU32,
    muted: AtomicBool,
    soloed: AtomicBool,

    params: ParamCell,

    /// Engine-timeline position of the ring head (next frame the mixer gets)
    head_frame: AtomicU64,

    /// Engine-timeline position of the ring tail (next frame decoded)
    produce_frame: AtomicU64,

    /// Decoder skip target published by seeks and drift correction
    drift_target: AtomicU64,

    /// Timeline origin of the last seek, for delivered-sample accounting
    seek_base: AtomicU64,

    drift_tolerance_frames: u64,
    preroll_frames: u64,

    eof: AtomicBool,
    fault_reported: AtomicBool,

    clock: OnceLock<Weak<MasterClock>>,
}

impl TrackShared {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn state(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sample rate of the produced stream (always the engine rate).
    pub fn output_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count of the produced stream (always the engine layout).
    pub fn output_channels(&self) -> u16 {
        self.channels
    }

    fn set_state(&self, state: TrackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: TrackState, to: TrackState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain_bits
            .store(gain.clamp(0.0, 4.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_soloed(&self) -> bool {
        self.soloed.load(Ordering::Relaxed)
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.soloed.store(soloed, Ordering::Relaxed);
    }

    /// Bind this track's notion of "where it should be" to the master clock.
    ///
    /// The clock is not owned by the track; rebinding to a different clock
    /// within one session is not supported.
    pub fn attach_clock(&self, clock: &Arc<MasterClock>) {
        let _ = self.clock.set(Arc::downgrade(clock));
    }

    fn clock(&self) -> Option<Arc<MasterClock>> {
        self.clock.get().and_then(Weak::upgrade)
    }

    /// Engine-timeline position of the next frame the mixer will receive.
    pub fn position_seconds(&self) -> f64 {
        self.head_frame.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    /// Frames delivered since the last seek (real content, not padding).
    pub fn delivered_frames(&self) -> u64 {
        self.head_frame
            .load(Ordering::Relaxed)
            .saturating_sub(self.seek_base.load(Ordering::Relaxed))
    }

    /// Buffered audio currently in the ring, in frames.
    pub fn buffered_frames(&self) -> u64 {
        (self.ring.available_read() / self.channels as usize) as u64
    }

    /// Ready for playback: pre-rolled, already delivering, or at EOF.
    pub fn is_ready(&self) -> bool {
        match self.state() {
            TrackState::Playing | TrackState::Ended => true,
            TrackState::Buffering => self.eof.load(Ordering::Acquire),
            _ => false,
        }
    }

    /// Read up to `dst.len() / channels` frames into `dst` (interleaved).
    ///
    /// Audio-callback only: wait-free, allocation-free. Pads the remainder
    /// of the requested range with silence and reports what happened.
    pub(crate) fn read(&self, dst: &mut [f32]) -> (usize, ReadStatus) {
        let channels = self.channels as usize;
        let frames_wanted = dst.len() / channels;
        let samples_wanted = frames_wanted * channels;

        match self.state() {
            TrackState::Playing => {}
            TrackState::Faulted => {
                dst[..samples_wanted].fill(0.0);
                if !self.fault_reported.swap(true, Ordering::AcqRel) {
                    return (0, ReadStatus::Fault);
                }
                return (0, ReadStatus::Inactive);
            }
            _ => {
                dst[..samples_wanted].fill(0.0);
                return (0, ReadStatus::Inactive);
            }
        }

        let head = self.head_frame.load(Ordering::Relaxed);
        if let Some(clock) = self.clock() {
            let now = clock.current_sample_position();
            let tolerance = self.drift_tolerance_frames;

            if head > now + tolerance {
                // Content is ahead of the clock (clock was seeked back):
                // hold it and emit silence until the clock catches up.
                dst[..samples_wanted].fill(0.0);
                return (0, ReadStatus::Ok);
            }

            if head + tolerance < now {
                // Content is stale: discard to catch up, bounded per
                // callback to keep transient stalls inaudible.
                let lag = (now - head) as usize;
                let bound = frames_wanted + tolerance as usize;
                let discarded = self.ring.skip(lag.min(bound) * channels) / channels;
                self.head_frame.fetch_add(discarded as u64, Ordering::Relaxed);

                if self.ring.available_read() == 0 && head + (discarded as u64) + tolerance < now {
                    // Ring exhausted before reaching "now": tell the decoder
                    // to skip forward to the clock.
                    self.drift_target.store(now, Ordering::Release);
                }
            }
        }

        let got = self.ring.read(&mut dst[..samples_wanted]);
        debug_assert_eq!(got % channels, 0);
        let frames_got = got / channels;
        self.head_frame.fetch_add(frames_got as u64, Ordering::Relaxed);

        if frames_got == frames_wanted {
            return (frames_got, ReadStatus::Ok);
        }

        dst[got..samples_wanted].fill(0.0);

        if self.eof.load(Ordering::Acquire) && self.ring.available_read() == 0 {
            // Clean end of stream; not a dropout. No logging here: this
            // runs on the audio callback.
            self.transition(TrackState::Playing, TrackState::Ended);
            return (frames_got, ReadStatus::Inactive);
        }

        (
            frames_got,
            ReadStatus::Underrun {
                missed: (frames_wanted - frames_got) as u32,
            },
        )
    }
}

/// Decode thread control block.
struct DecodeCtl {
    lock: Mutex<CtlState>,
    condvar: Condvar,
}

struct CtlState {
    /// Fill when true (play); idle when false (pause/stop)
    run: bool,

    /// Absolute engine-timeline seek target, consumed by the decode thread
    pending_seek: Option<f64>,

    /// Thread shutdown
    stop: bool,
}

impl DecodeCtl {
    fn new() -> Self {
        Self {
            lock: Mutex::new(CtlState {
                run: false,
                pending_seek: None,
                stop: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn notify<F: FnOnce(&mut CtlState)>(&self, update: F) {
        let mut state = self.lock.lock();
        update(&mut state);
        drop(state);
        self.condvar.notify_one();
    }

    /// True when the decode thread should abandon its current chunk.
    fn interrupted(&self) -> bool {
        let state = self.lock.lock();
        state.stop || state.pending_seek.is_some()
    }
}

/// One track: control-plane handle owning the decode thread.
pub struct Track {
    shared: Arc<TrackShared>,
    ctl: Arc<DecodeCtl>,
    worker: Option<std::thread::JoinHandle<()>>,

    /// Control-side cache backing read-modify-write of the param cell
    control_params: Mutex<TransformParams>,

    info: SourceInfo,
    path: PathBuf,
}

impl Track {
    /// Load a file and spawn its decode thread (parked until `play`).
    ///
    /// Fails synchronously when the file cannot be probed.
    pub fn load(
        path: &Path,
        config: &AudioConfig,
        params: &EngineParams,
        pool: &BufferPool,
    ) -> Result<Self> {
        let info = probe(path)?;

        let name: Arc<str> = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("track")
            .into();

        let ring_samples =
            config.samples_per_buffer() * params.ring_buffer_multiple.max(8);
        let preroll_samples =
            params.preroll_frames(config.sample_rate) as usize * config.channels as usize;

        let shared = Arc::new(TrackShared {
            id: Uuid::new_v4(),
            name: Arc::clone(&name),
            sample_rate: config.sample_rate,
            channels: config.channels,
            ring: SampleRing::new(ring_samples.max(preroll_samples * 2)),
            state: AtomicU8::new(TrackState::Idle as u8),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            soloed: AtomicBool::new(false),
            params: ParamCell::new(TransformParams::default()),
            head_frame: AtomicU64::new(0),
            produce_frame: AtomicU64::new(0),
            drift_target: AtomicU64::new(0),
            seek_base: AtomicU64::new(0),
            drift_tolerance_frames: params.drift_tolerance_frames(config.sample_rate),
            preroll_frames: params.preroll_frames(config.sample_rate),
            eof: AtomicBool::new(false),
            fault_reported: AtomicBool::new(false),
            clock: OnceLock::new(),
        });

        let ctl = Arc::new(DecodeCtl::new());
        let worker = DecodeWorker {
            shared: Arc::clone(&shared),
            ctl: Arc::clone(&ctl),
            pool: pool.clone(),
            path: path.to_path_buf(),
        };

        let thread_name = format!("decode-{}", name);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())
            .map_err(|e| Error::Playback(format!("failed to spawn decode thread: {}", e)))?;

        info!(
            "loaded track '{}' ({} Hz, {} ch, {:.3} s)",
            name, info.sample_rate, info.channels, info.duration_seconds
        );

        Ok(Self {
            shared,
            ctl: Arc::clone(&ctl),
            worker: Some(handle),
            control_params: Mutex::new(TransformParams::default()),
            info,
            path: path.to_path_buf(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Source duration in seconds, before tempo scaling.
    pub fn source_duration_seconds(&self) -> f64 {
        self.info.duration_seconds
    }

    /// Playback duration in seconds after the current tempo.
    pub fn effective_duration_seconds(&self) -> f64 {
        let params = self.control_params.lock();
        let rate = params.tempo * (params.pitch_semitones / 12.0).exp2();
        if rate <= 0.0 {
            return self.info.duration_seconds;
        }
        self.info.duration_seconds / rate
    }

    pub fn state(&self) -> TrackState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    pub fn shared(&self) -> &Arc<TrackShared> {
        &self.shared
    }

    pub fn attach_clock(&self, clock: &Arc<MasterClock>) {
        self.shared.attach_clock(clock);
    }

    /// Begin (or resume) delivering audio.
    ///
    /// Idle → Buffering (decoder fills toward pre-roll, then flips to
    /// Playing); Paused → Playing immediately (contents were retained).
    pub fn play(&self) {
        match self.shared.state() {
            TrackState::Paused => {
                self.shared.set_state(TrackState::Playing);
            }
            TrackState::Idle | TrackState::Ended => {
                self.shared.set_state(TrackState::Buffering);
            }
            _ => {}
        }
        self.ctl.notify(|state| state.run = true);
    }

    /// Stop delivering; decoder idles without discarding ring contents.
    pub fn pause(&self) {
        let state = self.shared.state();
        if matches!(state, TrackState::Playing | TrackState::Buffering) {
            self.shared.set_state(TrackState::Paused);
        }
        self.ctl.notify(|state| state.run = false);
    }

    /// Stop and release pending buffers; next `play` rebuffers from the
    /// current position.
    pub fn stop(&self) {
        self.shared.set_state(TrackState::Idle);
        self.ctl.notify(|state| {
            state.run = false;
            state.pending_seek = None;
        });
    }

    /// Seek to an absolute timeline position: clears the ring and restarts
    /// decode at that point. The track rebuffers before delivering again.
    pub fn seek(&self, seconds: f64) {
        let seconds = seconds.max(0.0);
        if self.shared.state() != TrackState::Idle {
            self.shared.set_state(TrackState::Buffering);
        }
        self.shared.fault_reported.store(false, Ordering::Release);
        self.ctl.notify(|state| state.pending_seek = Some(seconds));
    }

    pub fn set_tempo(&self, multiplier: f64, smooth: bool) {
        let mut params = self.control_params.lock();
        params.tempo = multiplier;
        params.smooth = smooth;
        self.shared.params.store(*params);
    }

    pub fn set_pitch(&self, semitones: f64, smooth: bool) {
        let mut params = self.control_params.lock();
        params.pitch_semitones = semitones;
        params.smooth = smooth;
        self.shared.params.store(*params);
    }

    pub fn set_gain(&self, gain: f32) {
        self.shared.set_gain(gain);
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.set_muted(muted);
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.shared.set_soloed(soloed);
    }

    /// Force the track into Faulted (pre-roll deadline expired).
    pub fn mark_faulted(&self) {
        warn!("track '{}' marked faulted", self.shared.name);
        self.shared.set_state(TrackState::Faulted);
        self.ctl.notify(|state| state.run = false);
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        self.ctl.notify(|state| state.stop = true);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// What the decode loop decided to do after inspecting control state.
enum DecodeAction {
    Shutdown,
    Seek(f64),
    Fill,
}

/// The decode thread body.
struct DecodeWorker {
    shared: Arc<TrackShared>,
    ctl: Arc<DecodeCtl>,
    pool: BufferPool,
    path: PathBuf,
}

/// Open decode pipeline: container/codec reader plus the resampler matched
/// to its source rate.
struct Pipeline {
    decoder: StreamingDecoder,
    resampler: StreamResampler,
    source_channels: u16,
}

impl Pipeline {
    fn open(path: &Path, engine_rate: u32, engine_channels: u16) -> Result<Self> {
        let decoder = StreamingDecoder::open(path)?;
        let source_channels = decoder.channels();
        let resampler = StreamResampler::new(decoder.sample_rate(), engine_rate, engine_channels)?;
        Ok(Self {
            decoder,
            resampler,
            source_channels,
        })
    }
}

impl DecodeWorker {
    fn run(self) {
        let shared = Arc::clone(&self.shared);
        let channels = shared.channels as usize;

        // Staging buffers rented once; the steady-state loop never allocates.
        let mut decoded = self.pool.rent();
        let mut converted = self.pool.rent();
        let mut resampled = self.pool.rent();
        let mut transformed = self.pool.rent();

        let mut pipeline: Option<Pipeline> = None;
        let mut transform = RateTransform::new(shared.channels);
        let mut params_generation = 0u64;

        debug!("decode thread for '{}' started", shared.name);

        loop {
            let action = self.wait_for_work();
            match action {
                DecodeAction::Shutdown => break,
                DecodeAction::Seek(target) => {
                    self.handle_seek(target, &mut pipeline, &mut transform);
                    converted.clear();
                }
                DecodeAction::Fill => {
                    // Pick up tempo/pitch changes between packets
                    if let Some(params) = shared.params.load_if_changed(&mut params_generation) {
                        transform.set_tempo(params.tempo);
                        transform.set_pitch(params.pitch_semitones);
                        if !params.smooth {
                            // Hard change: restart at the current head so the
                            // already-transformed ring contents are discarded.
                            let head = shared.position_seconds();
                            self.ctl
                                .notify(|state| state.pending_seek = Some(head));
                            continue;
                        }
                    }

                    if self.fill_once(
                        &mut pipeline,
                        &mut transform,
                        &mut decoded,
                        &mut converted,
                        &mut resampled,
                        &mut transformed,
                        channels,
                    ) {
                        continue;
                    }
                }
            }
        }

        debug!("decode thread for '{}' exiting", shared.name);
    }

    /// Park until there is something to do; bounded waits only.
    fn wait_for_work(&self) -> DecodeAction {
        let mut ctl = self.ctl.lock.lock();
        loop {
            if ctl.stop {
                return DecodeAction::Shutdown;
            }
            if let Some(target) = ctl.pending_seek.take() {
                return DecodeAction::Seek(target);
            }

            let state = self.shared.state();
            if state == TrackState::Idle && self.shared.ring.available_read() > 0 {
                // `stop` releases pending audio; the audio side does not
                // read an Idle track, so clearing here is exclusive.
                self.shared.ring.clear();
            }

            let fillable = matches!(state, TrackState::Buffering | TrackState::Playing);
            if ctl.run && fillable && !self.shared.eof.load(Ordering::Acquire) {
                let space = self.shared.ring.available_write();
                if space >= self.shared.channels as usize {
                    return DecodeAction::Fill;
                }
            }

            self.ctl
                .condvar
                .wait_for(&mut ctl, Duration::from_millis(20));
        }
    }

    /// Decode one packet and push it through the chain. Returns true when
    /// the caller should re-enter the control loop immediately.
    #[allow(clippy::too_many_arguments)]
    fn fill_once(
        &self,
        pipeline: &mut Option<Pipeline>,
        transform: &mut RateTransform,
        decoded: &mut Vec<f32>,
        converted: &mut Vec<f32>,
        resampled: &mut Vec<f32>,
        transformed: &mut Vec<f32>,
        channels: usize,
    ) -> bool {
        let shared = &self.shared;

        if pipeline.is_none() {
            match Pipeline::open(&self.path, shared.sample_rate, shared.channels) {
                Ok(p) => *pipeline = Some(p),
                Err(e) => {
                    self.fault(e);
                    return true;
                }
            }
        }
        let pipe = pipeline.as_mut().expect("pipeline just ensured");

        decoded.clear();
        match pipe.decoder.next_chunk(decoded) {
            Ok(true) => {
                convert_channels(decoded, pipe.source_channels, shared.channels, converted);

                let chunk_samples = RESAMPLER_CHUNK_FRAMES * channels;
                while converted.len() >= chunk_samples {
                    resampled.clear();
                    if let Err(e) = pipe
                        .resampler
                        .process_chunk(&converted[..chunk_samples], resampled)
                    {
                        self.fault(e);
                        return true;
                    }
                    converted.drain(..chunk_samples);

                    transformed.clear();
                    transform.process(resampled, transformed);
                    if !self.write_to_ring(transformed, channels) {
                        return true; // interrupted by seek/stop
                    }
                }
                false
            }
            Ok(false) => {
                // Flush the partial resampler chunk with zero padding, then
                // mark end of stream.
                if !converted.is_empty() && !pipe.resampler.is_pass_through() {
                    let chunk_samples = RESAMPLER_CHUNK_FRAMES * channels;
                    converted.resize(chunk_samples, 0.0);
                    resampled.clear();
                    if pipe
                        .resampler
                        .process_chunk(&converted[..chunk_samples], resampled)
                        .is_ok()
                    {
                        converted.clear();
                        transformed.clear();
                        transform.process(resampled, transformed);
                        let _ = self.write_to_ring(transformed, channels);
                    }
                } else if !converted.is_empty() {
                    transformed.clear();
                    transform.process(converted, transformed);
                    converted.clear();
                    let _ = self.write_to_ring(transformed, channels);
                }

                shared.eof.store(true, Ordering::Release);
                self.maybe_finish_preroll();
                debug!("track '{}' reached end of stream", shared.name);
                true
            }
            Err(e) => {
                self.fault(e);
                true
            }
        }
    }

    /// Write whole frames into the ring, honoring the published drift
    /// target and parking (bounded) while the ring is full.
    ///
    /// Returns false when interrupted by a pending seek or shutdown.
    fn write_to_ring(&self, samples: &[f32], channels: usize) -> bool {
        let shared = &self.shared;
        let mut offset = 0;

        while offset < samples.len() {
            if self.ctl.interrupted() {
                return false;
            }

            // Drift skip: drop output frames until the decoder catches up
            // with the target published by the audio side.
            let target = shared.drift_target.load(Ordering::Acquire);
            let produce = shared.produce_frame.load(Ordering::Relaxed);
            if produce < target {
                let remaining_frames = (samples.len() - offset) / channels;
                let skip = ((target - produce) as usize).min(remaining_frames);
                offset += skip * channels;
                shared
                    .produce_frame
                    .fetch_add(skip as u64, Ordering::Relaxed);
                continue;
            }

            let space_frames = shared.ring.available_write() / channels;
            if space_frames == 0 {
                let mut ctl = self.ctl.lock.lock();
                if ctl.stop || ctl.pending_seek.is_some() {
                    return false;
                }
                self.ctl
                    .condvar
                    .wait_for(&mut ctl, Duration::from_millis(10));
                continue;
            }

            // The ring head inherits the produce position while empty, so
            // the audio side sees the correct content timeline after skips.
            if shared.ring.available_read() == 0 {
                shared.head_frame.store(produce, Ordering::Relaxed);
            }

            let writable = (samples.len() - offset).min(space_frames * channels);
            let writable = writable - (writable % channels);
            let written = shared.ring.write(&samples[offset..offset + writable]);
            debug_assert_eq!(written % channels, 0);
            offset += written;
            shared
                .produce_frame
                .fetch_add((written / channels) as u64, Ordering::Relaxed);

            self.maybe_finish_preroll();
        }
        true
    }

    fn maybe_finish_preroll(&self) {
        let shared = &self.shared;
        if shared.state() == TrackState::Buffering
            && (shared.buffered_frames() >= shared.preroll_frames
                || shared.eof.load(Ordering::Acquire))
            && shared.transition(TrackState::Buffering, TrackState::Playing)
        {
            debug!(
                "track '{}' pre-roll complete ({} frames buffered)",
                shared.name,
                shared.buffered_frames()
            );
        }
    }

    /// Restart decode at an absolute engine-timeline position.
    ///
    /// The audio side does not read the ring in Buffering/Idle, so the
    /// clear below is exclusive.
    fn handle_seek(
        &self,
        timeline_seconds: f64,
        pipeline: &mut Option<Pipeline>,
        transform: &mut RateTransform,
    ) {
        let shared = &self.shared;
        // The control plane moved the track out of Playing before queueing
        // the seek; let a callback already inside `read` drain before the
        // exclusive clear below.
        std::thread::sleep(Duration::from_millis(2));
        shared.ring.clear();
        shared.eof.store(false, Ordering::Release);

        if pipeline.is_none() {
            match Pipeline::open(&self.path, shared.sample_rate, shared.channels) {
                Ok(p) => *pipeline = Some(p),
                Err(e) => {
                    self.fault(e);
                    return;
                }
            }
        }
        let pipe = pipeline.as_mut().expect("pipeline just ensured");

        // Timeline seconds map to source seconds through the transform rate
        // (tempo 0.5 puts timeline 10 s at source 5 s).
        let params = shared.params.current();
        let source_rate_factor = params.tempo * (params.pitch_semitones / 12.0).exp2();
        let source_target = timeline_seconds * source_rate_factor;

        match pipe.decoder.seek_to(source_target) {
            Ok(actual_source) => {
                pipe.resampler.reset();
                transform.reset();

                let target_frame =
                    (timeline_seconds * shared.sample_rate as f64).round() as u64;
                // The container landed at or before the target; the
                // difference is consumed by the drift-skip on the next
                // write, giving sample-accurate positioning.
                let actual_timeline = if source_rate_factor > 0.0 {
                    actual_source / source_rate_factor
                } else {
                    actual_source
                };
                let produce_frame =
                    (actual_timeline * shared.sample_rate as f64).round() as u64;

                shared
                    .produce_frame
                    .store(produce_frame.min(target_frame), Ordering::Relaxed);
                shared.head_frame.store(target_frame, Ordering::Relaxed);
                shared.seek_base.store(target_frame, Ordering::Relaxed);
                shared.drift_target.store(target_frame, Ordering::Release);

                debug!(
                    "track '{}' seeked to {:.3}s (source {:.3}s)",
                    shared.name, timeline_seconds, actual_source
                );
            }
            Err(e) => self.fault(e),
        }
    }

    fn fault(&self, error: Error) {
        error!("track '{}' faulted: {}", self.shared.name, error);
        self.shared.set_state(TrackState::Faulted);
        self.shared.eof.store(true, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Bare `TrackShared` in Playing state, for mixer and track unit tests.
    pub(crate) fn shared(sample_rate: u32, channels: u16) -> Arc<TrackShared> {
        Arc::new(TrackShared {
            id: Uuid::new_v4(),
            name: "test".into(),
            sample_rate,
            channels,
            ring: SampleRing::new(4096),
            state: AtomicU8::new(TrackState::Playing as u8),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            soloed: AtomicBool::new(false),
            params: ParamCell::new(TransformParams::default()),
            head_frame: AtomicU64::new(0),
            produce_frame: AtomicU64::new(0),
            drift_target: AtomicU64::new(0),
            seek_base: AtomicU64::new(0),
            drift_tolerance_frames: 441,
            preroll_frames: 8_820,
            eof: AtomicBool::new(false),
            fault_reported: AtomicBool::new(false),
            clock: OnceLock::new(),
        })
    }

    impl TrackShared {
        pub(crate) fn test_write_ring(&self, samples: &[f32]) -> usize {
            self.ring.write(samples)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::shared as test_shared;
    use super::*;
    use ensemble_common::ClockMode;

    #[test]
    fn param_cell_publishes_composite_updates() {
        let cell = ParamCell::new(TransformParams::default());
        let mut seen = 0u64;
        assert!(cell.load_if_changed(&mut seen).is_none());

        cell.store(TransformParams {
            tempo: 0.5,
            pitch_semitones: 2.0,
            smooth: false,
        });
        let params = cell.load_if_changed(&mut seen).unwrap();
        assert_eq!(params.tempo, 0.5);
        assert_eq!(params.pitch_semitones, 2.0);
        assert!(!params.smooth);

        // Same generation: no spurious re-delivery
        assert!(cell.load_if_changed(&mut seen).is_none());
    }

    #[test]
    fn read_pads_silence_and_reports_underrun() {
        let shared = test_shared(44_100, 2);
        shared.ring.write(&[0.5; 8]); // 4 frames

        let mut dst = [9.0f32; 16]; // want 8 frames
        let (frames, status) = shared.read(&mut dst);
        assert_eq!(frames, 4);
        assert_eq!(status, ReadStatus::Underrun { missed: 4 });
        assert_eq!(&dst[..8], &[0.5; 8]);
        assert_eq!(&dst[8..], &[0.0; 8]);
    }

    #[test]
    fn read_reports_clean_end_at_eof() {
        let shared = test_shared(44_100, 2);
        shared.ring.write(&[0.25; 4]);
        shared.eof.store(true, Ordering::Release);

        let mut dst = [0.0f32; 8];
        let (frames, status) = shared.read(&mut dst);
        assert_eq!(frames, 2);
        assert_eq!(status, ReadStatus::Inactive);
        assert_eq!(shared.state(), TrackState::Ended);
    }

    #[test]
    fn read_inactive_when_not_playing() {
        let shared = test_shared(44_100, 2);
        shared.set_state(TrackState::Buffering);
        shared.ring.write(&[0.5; 8]);

        let mut dst = [1.0f32; 8];
        let (frames, status) = shared.read(&mut dst);
        assert_eq!(frames, 0);
        assert_eq!(status, ReadStatus::Inactive);
        assert_eq!(dst, [0.0; 8]); // silence, contents untouched
        assert_eq!(shared.ring.available_read(), 8);
    }

    #[test]
    fn faulted_read_reports_once() {
        let shared = test_shared(44_100, 2);
        shared.set_state(TrackState::Faulted);

        let mut dst = [1.0f32; 4];
        let (_, status) = shared.read(&mut dst);
        assert_eq!(status, ReadStatus::Fault);
        assert_eq!(dst, [0.0; 4]);

        let (_, status) = shared.read(&mut dst);
        assert_eq!(status, ReadStatus::Inactive);
    }

    #[test]
    fn stale_content_is_discarded_toward_clock() {
        let shared = test_shared(44_100, 2);
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::Offline));
        shared.attach_clock(&clock);

        // 1000 frames buffered at head position 0, clock already at 600
        let samples = vec![0.5f32; 2000];
        shared.ring.write(&samples);
        clock.seek_frames(600);

        let mut dst = [0.0f32; 128]; // 64 frames
        let (frames, status) = shared.read(&mut dst);
        assert_eq!(frames, 64);
        assert_eq!(status, ReadStatus::Ok);

        // Correction is bounded per callback: at most frames_wanted +
        // tolerance = 505 frames discarded, then 64 read.
        assert_eq!(shared.head_frame.load(Ordering::Relaxed), 505 + 64);
        // Ring still holds content, so no decoder skip was requested.
        assert_eq!(shared.drift_target.load(Ordering::Acquire), 0);
    }

    #[test]
    fn content_ahead_of_clock_waits_in_silence() {
        let shared = test_shared(44_100, 2);
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::Offline));
        shared.attach_clock(&clock);

        shared.head_frame.store(10_000, Ordering::Relaxed);
        shared.ring.write(&[0.5; 256]);

        let mut dst = [1.0f32; 64];
        let (frames, status) = shared.read(&mut dst);
        assert_eq!(frames, 0);
        assert_eq!(status, ReadStatus::Ok);
        assert_eq!(dst, [0.0; 64]);
        // Content retained for when the clock catches up
        assert_eq!(shared.ring.available_read(), 256);
    }

    #[test]
    fn deep_stall_publishes_decoder_skip_target() {
        let shared = test_shared(44_100, 2);
        let clock = Arc::new(MasterClock::new(44_100, ClockMode::Offline));
        shared.attach_clock(&clock);

        // Ring empty, clock far ahead of head: reader cannot catch up by
        // discarding, so it must tell the decoder where to resume.
        clock.seek_frames(22_050);
        let mut dst = [0.0f32; 128];
        let (_, status) = shared.read(&mut dst);
        assert!(matches!(status, ReadStatus::Underrun { .. }));
        assert_eq!(shared.drift_target.load(Ordering::Acquire), 22_050);
    }
}
