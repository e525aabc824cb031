//! Output limiter
//!
//! Envelope-following gain reduction that keeps peaks at or below the
//! threshold. Runs last in a typical chain. Ignores the dry/wet mix: a
//! partially-applied limiter would defeat its purpose.

use super::Effect;
use ensemble_common::AudioConfig;

pub struct Limiter {
    /// Linear ceiling
    threshold: f32,

    attack_coeff: f32,
    release_coeff: f32,

    /// Per-channel envelope followers
    envelope: [f32; 8],
    channels: usize,

    enabled: bool,

    attack_ms: f32,
    release_ms: f32,
}

impl Limiter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.01, 1.0),
            attack_coeff: 0.0,
            release_coeff: 0.0,
            envelope: [0.0; 8],
            channels: 2,
            enabled: true,
            attack_ms: 1.0,
            release_ms: 80.0,
        }
    }

    pub fn with_times(mut self, attack_ms: f32, release_ms: f32) -> Self {
        self.attack_ms = attack_ms.max(0.05);
        self.release_ms = release_ms.max(1.0);
        self
    }

    fn coeff(time_ms: f32, sample_rate: f32) -> f32 {
        (-1.0 / (time_ms * 0.001 * sample_rate)).exp()
    }
}

impl Effect for Limiter {
    fn name(&self) -> &str {
        "limiter"
    }

    fn initialize(&mut self, config: &AudioConfig) {
        let sample_rate = config.sample_rate as f32;
        self.attack_coeff = Self::coeff(self.attack_ms, sample_rate);
        self.release_coeff = Self::coeff(self.release_ms, sample_rate);
        self.channels = (config.channels as usize).min(self.envelope.len());
    }

    fn process(&mut self, buffer: &mut [f32], frames: usize) {
        let channels = self.channels;
        for frame in buffer[..frames * channels].chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let level = sample.abs();
                let env = &mut self.envelope[ch];
                let coeff = if level > *env {
                    self.attack_coeff
                } else {
                    self.release_coeff
                };
                *env = level + coeff * (*env - level);

                if *env > self.threshold {
                    *sample *= self.threshold / *env;
                }
            }
        }
    }

    fn reset(&mut self) {
        self.envelope = [0.0; 8];
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn mix(&self) -> f32 {
        1.0
    }

    fn set_mix(&mut self, _mix: f32) {
        // limiters ignore dry/wet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 44_100,
            channels: 2,
            buffer_size_frames: 512,
        }
    }

    #[test]
    fn quiet_signal_passes_unchanged() {
        let mut limiter = Limiter::new(0.9);
        limiter.initialize(&config());

        let mut buffer = vec![0.1f32; 256];
        let original = buffer.clone();
        limiter.process(&mut buffer, 128);

        for (a, b) in buffer.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn sustained_loud_signal_is_reduced_to_threshold() {
        let mut limiter = Limiter::new(0.5);
        limiter.initialize(&config());

        let mut buffer = vec![1.0f32; 44_100 * 2];
        limiter.process(&mut buffer, 44_100);

        // After the attack settles, samples sit at the ceiling
        let tail = &buffer[buffer.len() - 64..];
        for &sample in tail {
            assert!(sample <= 0.501, "sample {} above ceiling", sample);
            assert!(sample > 0.45);
        }
    }

    #[test]
    fn mix_is_ignored() {
        let mut limiter = Limiter::new(0.5);
        limiter.set_mix(0.2);
        assert_eq!(limiter.mix(), 1.0);
    }

    #[test]
    fn reset_clears_envelope() {
        let mut limiter = Limiter::new(0.5);
        limiter.initialize(&config());
        let mut buffer = vec![1.0f32; 512];
        limiter.process(&mut buffer, 256);
        limiter.reset();
        assert_eq!(limiter.envelope, [0.0; 8]);
    }
}
