//! Master effect chain
//!
//! Ordered list of real-time-safe DSP processors run in place on the mixed
//! output. `initialize` is called exactly once per session per effect,
//! before the effect reaches the audio thread; `process` runs on every fill
//! for enabled effects only and must not allocate, lock, or perform IO.
//! Disabled effects retain their state; `reset` zeroes state and is called
//! off the audio thread.

mod eq;
mod limiter;
mod overdrive;

pub use eq::GraphicEq;
pub use limiter::Limiter;
pub use overdrive::Overdrive;

use ensemble_common::AudioConfig;

/// A real-time-safe processor in the master chain.
pub trait Effect: Send {
    fn name(&self) -> &str;

    /// Called once per session, off the audio thread, with the engine
    /// configuration. `process` will never be asked for more than
    /// `config.buffer_size_frames` frames.
    fn initialize(&mut self, config: &AudioConfig);

    /// Process `frames` interleaved frames of `buffer` in place.
    fn process(&mut self, buffer: &mut [f32], frames: usize);

    /// Zero internal state. Off the audio thread only.
    fn reset(&mut self);

    fn is_enabled(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);

    /// Dry/wet blend in [0, 1] where meaningful; effects without a sensible
    /// blend (the limiter) report 1.0 and ignore writes.
    fn mix(&self) -> f32;
    fn set_mix(&mut self, mix: f32);
}

/// Peaking biquad filter section (RBJ cookbook), transposed direct form II.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Biquad {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    z1: f32,
    z2: f32,
}

impl Biquad {
    pub(crate) fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    /// Peaking EQ at `frequency` with bandwidth set by `q` and boost/cut
    /// `gain_db`.
    pub(crate) fn peaking(sample_rate: f32, frequency: f32, q: f32, gain_db: f32) -> Self {
        let a = 10.0f32.powf(gain_db / 40.0);
        let omega = 2.0 * std::f32::consts::PI * (frequency / sample_rate).min(0.499);
        let alpha = omega.sin() / (2.0 * q);
        let cos_omega = omega.cos();

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_omega) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_omega) / a0,
            a2: (1.0 - alpha / a) / a0,
            z1: 0.0,
            z2: 0.0,
        }
    }

    #[inline]
    pub(crate) fn process_sample(&mut self, x: f32) -> f32 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    pub(crate) fn reset_state(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_biquad_passes_signal() {
        let mut biquad = Biquad::identity();
        for i in 0..32 {
            let x = (i as f32 * 0.1).sin();
            assert!((biquad.process_sample(x) - x).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_gain_peaking_is_transparent() {
        let mut biquad = Biquad::peaking(44_100.0, 1_000.0, 4.0, 0.0);
        for i in 0..64 {
            let x = (i as f32 * 0.05).sin();
            assert!((biquad.process_sample(x) - x).abs() < 1e-4);
        }
    }

    #[test]
    fn boost_raises_band_energy() {
        // Feed a 1 kHz sine through a +12 dB peak at 1 kHz
        let sample_rate = 44_100.0;
        let mut biquad = Biquad::peaking(sample_rate, 1_000.0, 4.0, 12.0);

        let mut energy_in = 0.0f64;
        let mut energy_out = 0.0f64;
        for i in 0..4_410 {
            let x = (2.0 * std::f32::consts::PI * 1_000.0 * i as f32 / sample_rate).sin();
            let y = biquad.process_sample(x);
            if i > 441 {
                // skip transient
                energy_in += (x * x) as f64;
                energy_out += (y * y) as f64;
            }
        }
        assert!(energy_out > energy_in * 2.0);
    }
}
