//! Engine configuration
//!
//! `AudioConfig` is the immutable per-session record shared by every
//! component: once an engine is constructed around it, sample rate, channel
//! count and callback buffer size never change. Bootstrap settings come from
//! a TOML file with command-line overrides applied by the binary.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// Configuration violations are the only process-fatal error class; they are
/// reported before any audio thread exists.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Immutable audio session configuration.
///
/// Installed once per engine session; every component (tracks, mixer, effect
/// chain, sync server) reads the same record. The produced output of every
/// track must match `sample_rate` and `channels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AudioConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count (interleaved)
    pub channels: u16,

    /// Frames requested per audio callback
    pub buffer_size_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            buffer_size_frames: 1024,
        }
    }
}

impl AudioConfig {
    /// Validate the configuration at startup.
    ///
    /// Violations here are fatal to the process; nothing else is.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate < 8_000 || self.sample_rate > 192_000 {
            return Err(ConfigError::Invalid(format!(
                "sample rate {} outside supported range 8000..=192000",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(ConfigError::Invalid(format!(
                "channel count {} outside supported range 1..=8",
                self.channels
            )));
        }
        if self.buffer_size_frames == 0 || self.buffer_size_frames > 65_536 {
            return Err(ConfigError::Invalid(format!(
                "buffer size {} frames outside supported range 1..=65536",
                self.buffer_size_frames
            )));
        }
        Ok(())
    }

    /// Interleaved samples per callback buffer (frames × channels).
    pub fn samples_per_buffer(&self) -> usize {
        self.buffer_size_frames * self.channels as usize
    }

    /// Convert a timeline position in seconds to output frames (rounded).
    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        (seconds * self.sample_rate as f64).round() as u64
    }

    /// Convert an output frame count to timeline seconds.
    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

/// Bootstrap settings loaded from the TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlSettings {
    /// Audio session configuration (defaults applied per-field when absent)
    #[serde(default)]
    pub audio: AudioSection,

    /// Sync UDP port
    pub sync_port: Option<u16>,

    /// Permit local transport control while disconnected from a sync server
    #[serde(default)]
    pub allow_offline_playback: bool,
}

/// `[audio]` section of the TOML file; all fields optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AudioSection {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub buffer_size_frames: Option<usize>,
}

/// Runtime settings combining the TOML file and command-line overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub audio: AudioConfig,
    pub sync_port: u16,
    pub allow_offline_playback: bool,
}

impl Settings {
    /// Load settings from a TOML file with optional overrides.
    ///
    /// A missing file yields defaults; overrides win over file values.
    pub fn load(
        config_path: Option<&Path>,
        sample_rate_override: Option<u32>,
        sync_port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let toml_settings = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str::<TomlSettings>(&text)?
            }
            None => TomlSettings::default(),
        };

        let defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: sample_rate_override
                .or(toml_settings.audio.sample_rate)
                .unwrap_or(defaults.sample_rate),
            channels: toml_settings.audio.channels.unwrap_or(defaults.channels),
            buffer_size_frames: toml_settings
                .audio
                .buffer_size_frames
                .unwrap_or(defaults.buffer_size_frames),
        };
        audio.validate()?;

        Ok(Settings {
            audio,
            sync_port: sync_port_override
                .or(toml_settings.sync_port)
                .unwrap_or(crate::params::DEFAULT_SYNC_PORT),
            allow_offline_playback: toml_settings.allow_offline_playback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        assert!(AudioConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_channels() {
        let config = AudioConfig {
            channels: 0,
            ..AudioConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let config = AudioConfig {
            sample_rate: 1_000_000,
            ..AudioConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn seconds_frames_round_trip() {
        let config = AudioConfig {
            sample_rate: 48_000,
            ..AudioConfig::default()
        };
        assert_eq!(config.seconds_to_frames(5.0), 240_000);
        assert_eq!(config.frames_to_seconds(240_000), 5.0);
        assert_eq!(config.seconds_to_frames(-1.0), 0);
    }

    #[test]
    fn load_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "sync_port = 4000\n[audio]\nsample_rate = 48000\nchannels = 2"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path()), None, Some(5000)).unwrap();
        assert_eq!(settings.audio.sample_rate, 48_000);
        assert_eq!(settings.sync_port, 5000); // override wins
        assert_eq!(
            settings.audio.buffer_size_frames,
            AudioConfig::default().buffer_size_frames
        );
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let settings = Settings::load(None, None, None).unwrap();
        assert_eq!(settings.audio, AudioConfig::default());
        assert_eq!(settings.sync_port, crate::params::DEFAULT_SYNC_PORT);
        assert!(!settings.allow_offline_playback);
    }
}
