//! Audio mixer
//!
//! Drives the audio callback: reads every attached track, applies per-source
//! gain and mute/solo policy, sums with master gain, runs the master effect
//! chain in place, advances the master clock by the frame count, and reports
//! per-source shortfalls as dropout events.
//!
//! # Real-time discipline
//!
//! `fill` never allocates, locks, or performs IO:
//! - The source list is an immutable plan behind an `ArcSwap`; the control
//!   plane builds a new snapshot off-thread and swaps it in with one store.
//!   The callback takes one acquire load per fill.
//! - Effect-chain changes arrive over a bounded lock-free channel and are
//!   applied between fills' work; removed effects are shipped back over a
//!   reclamation channel and dropped off the audio thread.
//! - Dropouts are pushed with `try_send` into a bounded queue drained by a
//!   non-audio task; overflow is counted, never waited on.

use crate::playback::effects::Effect;
use crate::playback::track::{ReadStatus, TrackShared};
use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use ensemble_common::{AudioConfig, ClockMode, DropoutEvent, DropoutReason, MasterClock};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Most effects the chain will hold; the callback-side Vec is pre-reserved
/// to this capacity so pushes never reallocate on the audio thread.
const MAX_EFFECTS: usize = 16;

/// Callback requests larger than this are filled in chunks by the backend.
pub const MAX_FILL_FRAMES_MULTIPLE: usize = 4;

/// Immutable snapshot of the attached sources, in deterministic attach
/// order.
pub struct MixerPlan {
    tracks: Vec<Arc<TrackShared>>,
}

impl MixerPlan {
    fn empty() -> Self {
        Self { tracks: Vec::new() }
    }

    pub fn tracks(&self) -> &[Arc<TrackShared>] {
        &self.tracks
    }
}

enum EffectCommand {
    Add { id: Uuid, effect: Box<dyn Effect> },
    Remove { id: Uuid },
}

/// Audio-callback half of the mixer. Moved into the backend's callback
/// closure (or driven directly by an offline render loop).
pub struct Mixer {
    clock: Arc<MasterClock>,
    plan: Arc<ArcSwap<MixerPlan>>,
    master_gain_bits: Arc<AtomicU32>,

    effects: Vec<(Uuid, Box<dyn Effect>)>,
    effect_rx: Receiver<EffectCommand>,
    trash_tx: Sender<Box<dyn Effect>>,

    dropout_tx: tokio::sync::mpsc::Sender<DropoutEvent>,
    dropouts_dropped: Arc<AtomicU64>,

    scratch: Vec<f32>,
    channels: usize,
    max_frames: usize,
}

/// Control-plane half: attach/detach sources, manage the effect chain, set
/// master volume.
pub struct MixerHandle {
    clock: Arc<MasterClock>,
    plan: Arc<ArcSwap<MixerPlan>>,
    master_gain_bits: Arc<AtomicU32>,
    effect_tx: Sender<EffectCommand>,
    trash_rx: Receiver<Box<dyn Effect>>,
    dropouts_dropped: Arc<AtomicU64>,
    config: AudioConfig,

    /// Serializes snapshot construction across control threads
    plan_edit: Mutex<()>,
}

/// Create the mixer pair plus the dropout queue receiver.
pub fn mixer(
    config: &AudioConfig,
    dropout_queue_depth: usize,
) -> (Mixer, MixerHandle, tokio::sync::mpsc::Receiver<DropoutEvent>) {
    let clock = Arc::new(MasterClock::new(config.sample_rate, ClockMode::Realtime));
    let plan = Arc::new(ArcSwap::from_pointee(MixerPlan::empty()));
    let master_gain_bits = Arc::new(AtomicU32::new(1.0f32.to_bits()));
    let dropouts_dropped = Arc::new(AtomicU64::new(0));

    let (effect_tx, effect_rx) = crossbeam_channel::bounded(MAX_EFFECTS * 2);
    let (trash_tx, trash_rx) = crossbeam_channel::bounded(MAX_EFFECTS * 2);
    let (dropout_tx, dropout_rx) = tokio::sync::mpsc::channel(dropout_queue_depth.max(16));

    let max_frames = config.buffer_size_frames * MAX_FILL_FRAMES_MULTIPLE;
    let mut effects = Vec::new();
    effects.reserve_exact(MAX_EFFECTS);

    let mixer = Mixer {
        clock: Arc::clone(&clock),
        plan: Arc::clone(&plan),
        master_gain_bits: Arc::clone(&master_gain_bits),
        effects,
        effect_rx,
        trash_tx,
        dropout_tx,
        dropouts_dropped: Arc::clone(&dropouts_dropped),
        scratch: vec![0.0; max_frames * config.channels as usize],
        channels: config.channels as usize,
        max_frames,
    };

    let handle = MixerHandle {
        clock,
        plan,
        master_gain_bits,
        effect_tx,
        trash_rx,
        dropouts_dropped,
        config: *config,
        plan_edit: Mutex::new(()),
    };

    (mixer, handle, dropout_rx)
}

impl Mixer {
    /// Fill `output` with up to `frames` interleaved frames of mixed audio.
    ///
    /// Called from the backend's real-time callback. Returns the frames
    /// written (always the full request; total starvation produces
    /// silence).
    pub fn fill(&mut self, output: &mut [f32], frames: usize) -> usize {
        let frames = frames
            .min(self.max_frames)
            .min(output.len() / self.channels);
        let samples = frames * self.channels;
        let out = &mut output[..samples];

        self.apply_effect_commands();

        out.fill(0.0);

        let timestamp = self.clock.current_timestamp();
        let plan = self.plan.load_full();
        let any_solo = plan.tracks.iter().any(|track| track.is_soloed());
        let master = f32::from_bits(self.master_gain_bits.load(Ordering::Relaxed));

        for track in plan.tracks.iter() {
            let scratch = &mut self.scratch[..samples];
            let (got_frames, status) = track.read(scratch);

            match status {
                ReadStatus::Underrun { missed } => {
                    Self::push_dropout(
                        &self.dropout_tx,
                        &self.dropouts_dropped,
                        track,
                        timestamp,
                        missed,
                        DropoutReason::Underrun,
                    );
                }
                ReadStatus::Fault => {
                    Self::push_dropout(
                        &self.dropout_tx,
                        &self.dropouts_dropped,
                        track,
                        timestamp,
                        frames as u32,
                        DropoutReason::DecodeError,
                    );
                }
                ReadStatus::Ok | ReadStatus::Inactive => {}
            }

            // Solo always wins: any soloed source silences every non-solo
            // source regardless of its own mute/gain.
            let gain = if any_solo {
                if track.is_soloed() {
                    track.gain()
                } else {
                    0.0
                }
            } else if track.is_muted() {
                0.0
            } else {
                track.gain()
            } * master;

            if gain != 0.0 && got_frames > 0 {
                let mixed = got_frames * self.channels;
                for (o, s) in out[..mixed].iter_mut().zip(scratch[..mixed].iter()) {
                    *o += *s * gain;
                }
            }
        }

        for (_, effect) in self.effects.iter_mut() {
            if effect.is_enabled() {
                effect.process(out, frames);
            }
        }

        // Clock update is publication-ordered after the output is final:
        // sample F of this fill corresponds to position P + F.
        self.clock.advance(frames as u64);
        frames
    }

    pub fn clock(&self) -> &Arc<MasterClock> {
        &self.clock
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn apply_effect_commands(&mut self) {
        while let Ok(command) = self.effect_rx.try_recv() {
            match command {
                EffectCommand::Add { id, effect } => {
                    if self.effects.len() < MAX_EFFECTS {
                        self.effects.push((id, effect));
                    } else if self.trash_tx.try_send(effect).is_err() {
                        // chain and trash both full: drop here, accepting a
                        // one-off deallocation on the audio thread
                    }
                }
                EffectCommand::Remove { id } => {
                    if let Some(index) = self.effects.iter().position(|(fx_id, _)| *fx_id == id) {
                        let (_, effect) = self.effects.remove(index);
                        if let Err(TrySendError::Full(effect)) = self.trash_tx.try_send(effect) {
                            drop(effect);
                        }
                    }
                }
            }
        }
    }

    fn push_dropout(
        tx: &tokio::sync::mpsc::Sender<DropoutEvent>,
        dropped: &AtomicU64,
        track: &TrackShared,
        timestamp: f64,
        missed: u32,
        reason: DropoutReason,
    ) {
        let event = DropoutEvent {
            track_id: track.id(),
            track_name: Arc::clone(track.name()),
            timestamp_secs: timestamp,
            missed_frames: missed,
            reason,
        };
        if tx.try_send(event).is_err() {
            dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl MixerHandle {
    pub fn clock(&self) -> &Arc<MasterClock> {
        &self.clock
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Attach a source by swapping in a new plan snapshot.
    ///
    /// Rejects synchronously when the source's produced format does not
    /// match the engine configuration; the track stays detached.
    pub fn attach(&self, shared: &Arc<TrackShared>) -> Result<()> {
        if shared.output_rate() != self.config.sample_rate
            || shared.output_channels() != self.config.channels
        {
            return Err(Error::FormatMismatch {
                engine_rate: self.config.sample_rate,
                engine_channels: self.config.channels,
                source_rate: shared.output_rate(),
                source_channels: shared.output_channels(),
            });
        }

        let _guard = self.plan_edit.lock();
        let current = self.plan.load_full();
        if current.tracks.iter().any(|t| t.id() == shared.id()) {
            return Ok(());
        }

        let mut tracks = Vec::with_capacity(current.tracks.len() + 1);
        tracks.extend(current.tracks.iter().cloned());
        tracks.push(Arc::clone(shared));
        self.plan.store(Arc::new(MixerPlan { tracks }));

        debug!("attached track {} to mixer", shared.id());
        Ok(())
    }

    /// Detach a source. The old snapshot is reclaimed once the callback
    /// finishes its current fill (the swap itself is atomic).
    pub fn detach(&self, track_id: Uuid) -> Result<()> {
        let _guard = self.plan_edit.lock();
        let current = self.plan.load_full();
        if !current.tracks.iter().any(|t| t.id() == track_id) {
            return Err(Error::TrackNotFound(track_id));
        }

        let tracks: Vec<_> = current
            .tracks
            .iter()
            .filter(|t| t.id() != track_id)
            .cloned()
            .collect();
        self.plan.store(Arc::new(MixerPlan { tracks }));

        debug!("detached track {} from mixer", track_id);
        Ok(())
    }

    /// Detach every source.
    pub fn detach_all(&self) {
        let _guard = self.plan_edit.lock();
        self.plan.store(Arc::new(MixerPlan::empty()));
    }

    pub fn attached_count(&self) -> usize {
        self.plan.load().tracks.len()
    }

    /// Add an effect to the end of the master chain. The effect is
    /// initialized here, off the audio thread, exactly once.
    pub fn add_master_effect(&self, mut effect: Box<dyn Effect>) -> Uuid {
        effect.initialize(&self.config);
        let id = Uuid::new_v4();
        info!("adding master effect '{}' ({})", effect.name(), id);
        // Bounded channel: blocks briefly only if the callback has a large
        // backlog, which the next fill clears.
        let _ = self.effect_tx.send(EffectCommand::Add { id, effect });
        self.reclaim_effects();
        id
    }

    /// Remove an effect by the id returned from `add_master_effect`.
    pub fn remove_master_effect(&self, id: Uuid) {
        let _ = self.effect_tx.send(EffectCommand::Remove { id });
        self.reclaim_effects();
    }

    /// Drop effects the callback shipped back for reclamation.
    pub fn reclaim_effects(&self) {
        for effect in self.trash_rx.try_iter() {
            drop(effect);
        }
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master_gain_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_gain_bits.load(Ordering::Relaxed))
    }

    /// Dropout events lost to a full queue so far.
    pub fn dropouts_dropped(&self) -> u64 {
        self.dropouts_dropped.load(Ordering::Relaxed)
    }
}
