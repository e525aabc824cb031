//! Overdrive waveshaper
//!
//! tanh soft clipping with a drive control and dry/wet blend.

use super::Effect;
use ensemble_common::AudioConfig;

pub struct Overdrive {
    /// Input gain into the waveshaper, >= 1.0
    drive: f32,

    /// Normalization so unity input maps to unity output
    norm: f32,

    mix: f32,
    enabled: bool,
    channels: usize,
}

impl Overdrive {
    pub fn new(drive: f32) -> Self {
        let drive = drive.clamp(1.0, 20.0);
        Self {
            drive,
            norm: 1.0 / drive.tanh(),
            mix: 1.0,
            enabled: true,
            channels: 2,
        }
    }

    pub fn set_drive(&mut self, drive: f32) {
        self.drive = drive.clamp(1.0, 20.0);
        self.norm = 1.0 / self.drive.tanh();
    }
}

impl Effect for Overdrive {
    fn name(&self) -> &str {
        "overdrive"
    }

    fn initialize(&mut self, config: &AudioConfig) {
        self.channels = config.channels as usize;
    }

    fn process(&mut self, buffer: &mut [f32], frames: usize) {
        let mix = self.mix;
        let dry = 1.0 - mix;
        let samples = (frames * self.channels).min(buffer.len());
        for sample in buffer[..samples].iter_mut() {
            let wet = (*sample * self.drive).tanh() * self.norm;
            *sample = *sample * dry + wet * mix;
        }
    }

    fn reset(&mut self) {
        // no state
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn mix(&self) -> f32 {
        self.mix
    }

    fn set_mix(&mut self, mix: f32) {
        self.mix = mix.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_drive_full_mix_is_gentle() {
        let mut overdrive = Overdrive::new(1.0);
        let mut buffer = vec![0.5f32; 64];
        overdrive.process(&mut buffer, 64);
        // normalized tanh at drive 1 keeps small signals close to input
        assert!((buffer[0] - 0.5).abs() < 0.12);
    }

    #[test]
    fn high_drive_clamps_peaks() {
        let mut overdrive = Overdrive::new(10.0);
        let mut buffer = vec![1.0f32; 16];
        overdrive.process(&mut buffer, 16);
        for &sample in &buffer {
            assert!(sample.abs() <= 1.01);
        }
    }

    #[test]
    fn zero_mix_is_dry() {
        let mut overdrive = Overdrive::new(8.0);
        overdrive.set_mix(0.0);
        let mut buffer = vec![0.3f32; 32];
        overdrive.process(&mut buffer, 32);
        for &sample in &buffer {
            assert!((sample - 0.3).abs() < 1e-6);
        }
    }
}
