//! Error types for the playback engine
//!
//! Control-plane operations return `Result<T>`; real-time paths never do.
//! The audio callback records problems into event queues instead (see
//! `playback::mixer`).

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the playback engine.
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Decoding-specific errors
    #[error("Decode error: {0}")]
    Decode(String),

    /// Audio backend errors (device open, stream build, start/stop)
    #[error("Audio backend error: {0}")]
    Backend(String),

    /// Transport/playback errors
    #[error("Playback error: {0}")]
    Playback(String),

    /// Source format does not match the engine configuration
    #[error("Format mismatch: engine is {engine_rate} Hz / {engine_channels} ch, source is {source_rate} Hz / {source_channels} ch")]
    FormatMismatch {
        engine_rate: u32,
        engine_channels: u16,
        source_rate: u32,
        source_channels: u16,
    },

    /// Unknown track identity
    #[error("No such track: {0}")]
    TrackNotFound(Uuid),

    /// Not all tracks reached pre-roll before the deadline
    #[error("Pre-roll timed out after {waited_ms} ms ({pending} track(s) not ready)")]
    PrerollTimeout { waited_ms: u64, pending: usize },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ensemble_common::config::ConfigError),
}

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mismatch_message_names_both_sides() {
        let err = Error::FormatMismatch {
            engine_rate: 48_000,
            engine_channels: 2,
            source_rate: 44_100,
            source_channels: 1,
        };
        let text = err.to_string();
        assert!(text.contains("48000"));
        assert!(text.contains("44100"));
    }
}
