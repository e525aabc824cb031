//! 30-band graphic equalizer
//!
//! Third-octave peaking filter bank from 25 Hz to 20 kHz. Band gains are set
//! before the effect is handed to the mixer; `initialize` bakes the biquad
//! coefficients for the session sample rate.

use super::{Biquad, Effect};
use ensemble_common::AudioConfig;

/// Number of bands (third-octave, 25 Hz .. ~20 kHz).
pub const EQ_BANDS: usize = 30;

/// Filter Q for a third-octave band.
const BAND_Q: f32 = 4.318;

/// Center frequency of band `index`.
pub fn band_frequency(index: usize) -> f32 {
    25.0 * 2.0f32.powf(index as f32 / 3.0)
}

pub struct GraphicEq {
    /// Requested boost/cut per band, dB
    gains_db: [f32; EQ_BANDS],

    /// One filter per (band, channel); identity for 0 dB bands
    filters: Vec<Biquad>,

    /// Bands with non-zero gain, precomputed so flat bands cost nothing
    active_bands: Vec<usize>,

    channels: usize,
    mix: f32,
    enabled: bool,
}

impl GraphicEq {
    /// Flat EQ.
    pub fn new() -> Self {
        Self {
            gains_db: [0.0; EQ_BANDS],
            filters: Vec::new(),
            active_bands: Vec::new(),
            channels: 2,
            mix: 1.0,
            enabled: true,
        }
    }

    /// Set one band's boost/cut in dB (clamped to ±15 dB).
    ///
    /// Only meaningful before the effect is added to the mixer.
    pub fn set_band_gain(&mut self, band: usize, gain_db: f32) {
        if band < EQ_BANDS {
            self.gains_db[band] = gain_db.clamp(-15.0, 15.0);
        }
    }

    pub fn band_gain(&self, band: usize) -> f32 {
        self.gains_db.get(band).copied().unwrap_or(0.0)
    }
}

impl Default for GraphicEq {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for GraphicEq {
    fn name(&self) -> &str {
        "graphic-eq"
    }

    fn initialize(&mut self, config: &AudioConfig) {
        self.channels = config.channels as usize;
        let sample_rate = config.sample_rate as f32;

        self.filters.clear();
        self.active_bands.clear();
        for band in 0..EQ_BANDS {
            let gain_db = self.gains_db[band];
            for _ in 0..self.channels {
                if gain_db == 0.0 {
                    self.filters.push(Biquad::identity());
                } else {
                    self.filters
                        .push(Biquad::peaking(sample_rate, band_frequency(band), BAND_Q, gain_db));
                }
            }
            if gain_db != 0.0 {
                self.active_bands.push(band);
            }
        }
    }

    fn process(&mut self, buffer: &mut [f32], frames: usize) {
        if self.active_bands.is_empty() {
            return;
        }
        let channels = self.channels;
        let mix = self.mix;
        let dry = 1.0 - mix;
        let samples = (frames * channels).min(buffer.len());

        for (i, sample) in buffer[..samples].iter_mut().enumerate() {
            let channel = i % channels;
            let x = *sample;
            let mut y = x;
            for band_idx in 0..self.active_bands.len() {
                let band = self.active_bands[band_idx];
                let filter = band * channels + channel;
                y = self.filters[filter].process_sample(y);
            }
            *sample = x * dry + y * mix;
        }
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset_state();
        }
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

    fn config() -> AudioConfig {
        AudioConfig {
            sample_rate: 44_100,
            channels: 2,
            buffer_size_frames: 512,
        }
    }

    #[test]
    fn thirty_bands_span_audio_range() {
        assert!((band_frequency(0) - 25.0).abs() < 0.01);
        let top = band_frequency(EQ_BANDS - 1);
        assert!(top > 19_000.0 && top < 21_000.0);
    }

    #[test]
    fn flat_eq_is_transparent() {
        let mut eq = GraphicEq::new();
        eq.initialize(&config());

        let mut buffer: Vec<f32> = (0..256).map(|i| (i as f32 * 0.07).sin()).collect();
        let original = buffer.clone();
        eq.process(&mut buffer, 128);
        assert_eq!(buffer, original);
    }

    #[test]
    fn boosted_band_raises_matching_tone() {
        let mut eq = GraphicEq::new();
        // band 10 = 25 * 2^(10/3) ≈ 252 Hz
        eq.set_band_gain(10, 12.0);
        eq.initialize(&config());

        let freq = band_frequency(10);
        let sample_rate = 44_100.0;
        let mut buffer: Vec<f32> = (0..8_192)
            .flat_map(|i| {
                let s = (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin() * 0.25;
                [s, s]
            })
            .collect();

        let energy_in: f64 = buffer.iter().map(|&s| (s * s) as f64).sum();
        eq.process(&mut buffer, 8_192);
        let energy_out: f64 = buffer.iter().map(|&s| (s * s) as f64).sum();
        assert!(energy_out > energy_in * 1.5);
    }

    #[test]
    fn gain_is_clamped() {
        let mut eq = GraphicEq::new();
        eq.set_band_gain(5, 40.0);
        assert_eq!(eq.band_gain(5), 15.0);
        eq.set_band_gain(99, 3.0); // out of range: ignored
        assert_eq!(eq.band_gain(99), 0.0);
    }
}
