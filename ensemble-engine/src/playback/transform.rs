//! Tempo / pitch transform seam
//!
//! The engine consumes tempo and pitch through the [`TempoTransform`] trait
//! on the decode thread, after resampling to the engine rate. A
//! formant-preserving time-stretcher can be slotted behind the same trait;
//! the shipped [`RateTransform`] realizes both controls as combined
//! varispeed playback-rate conversion with linear interpolation.
//!
//! Duration semantics: a tempo multiplier `m` consumes `m` input frames per
//! output frame, so source duration scales by `1/m` while the master clock
//! keeps advancing at device rate. Pitch semitones contribute a factor of
//! `2^(semitones/12)` to the same rate.

/// Transform-preserving sample source stage.
pub trait TempoTransform: Send {
    /// Set the tempo multiplier (1.0 = original speed).
    fn set_tempo(&mut self, multiplier: f64);

    /// Set the pitch shift in semitones (0.0 = original pitch).
    fn set_pitch(&mut self, semitones: f64);

    /// Consume interleaved input frames, appending transformed interleaved
    /// frames to `out`. May retain a partial frame of input across calls.
    fn process(&mut self, input: &[f32], out: &mut Vec<f32>);

    /// Drop retained input and interpolation state (used across seeks).
    fn reset(&mut self);

    /// Output frames produced per input frame at current settings.
    fn ratio(&self) -> f64;
}

/// Varispeed rate transform with linear interpolation.
pub struct RateTransform {
    channels: usize,
    tempo: f64,
    pitch_semitones: f64,

    /// Input frames consumed per output frame
    step: f64,

    /// Fractional read position into `pending`, in frames
    position: f64,

    /// Retained interleaved input frames not yet fully consumed
    pending: Vec<f32>,
}

impl RateTransform {
    pub fn new(channels: u16) -> Self {
        Self {
            channels: channels as usize,
            tempo: 1.0,
            pitch_semitones: 0.0,
            step: 1.0,
            position: 0.0,
            pending: Vec::new(),
        }
    }

    fn recompute_step(&mut self) {
        self.step = self.tempo * (self.pitch_semitones / 12.0).exp2();
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.channels
    }

    fn is_identity(&self) -> bool {
        self.step == 1.0
    }
}

impl TempoTransform for RateTransform {
    fn set_tempo(&mut self, multiplier: f64) {
        self.tempo = multiplier.max(0.01);
        self.recompute_step();
    }

    fn set_pitch(&mut self, semitones: f64) {
        self.pitch_semitones = semitones.clamp(-24.0, 24.0);
        self.recompute_step();
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        debug_assert_eq!(input.len() % self.channels, 0);

        if self.is_identity() && self.pending.is_empty() {
            out.extend_from_slice(input);
            return;
        }

        self.pending.extend_from_slice(input);
        let channels = self.channels;
        let frames = self.pending_frames();
        if frames < 2 {
            return;
        }

        // Interpolate while a complete pair of source frames is available
        while self.position + 1.0 < frames as f64 {
            let base = self.position as usize;
            let frac = (self.position - base as f64) as f32;
            let lo = base * channels;
            let hi = lo + channels;
            for ch in 0..channels {
                let a = self.pending[lo + ch];
                let b = self.pending[hi + ch];
                out.push(a + (b - a) * frac);
            }
            self.position += self.step;
        }

        // Retain only the frames still needed for interpolation
        let consumed = (self.position as usize).min(frames.saturating_sub(1));
        if consumed > 0 {
            self.pending.drain(..consumed * channels);
            self.position -= consumed as f64;
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.position = 0.0;
    }

    fn ratio(&self) -> f64 {
        1.0 / self.step
    }
}
