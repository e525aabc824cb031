//! Engine tuning parameters
//!
//! One explicit parameter record passed through construction. There is no
//! global parameter singleton: the engine handle owns its `EngineParams` and
//! components copy the scalars they need at construction time.

use std::time::Duration;

/// Default UDP port for the sync protocol.
pub const DEFAULT_SYNC_PORT: u16 = 9876;

/// Clock broadcast cadence for the sync server.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(10);

/// Ping cadence for the sync client.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// A peer silent longer than this is evicted / the server considered lost.
pub const STALE_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunable engine parameters.
#[derive(Debug, Clone)]
pub struct EngineParams {
    /// Audio that must be buffered before a track is ready to play
    pub preroll: Duration,

    /// Bound on `play` waiting for all tracks to reach pre-roll
    pub preroll_timeout: Duration,

    /// Per-track drift tolerance before correction kicks in
    pub drift_tolerance: Duration,

    /// Per-track ring capacity as a multiple of the callback buffer
    pub ring_buffer_multiple: usize,

    /// Bounded dropout queue depth between the audio callback and the drain
    /// task
    pub dropout_queue_depth: usize,

    /// Cadence of position events on the bus while playing
    pub position_event_interval: Duration,

    /// Tempo clamp band in percent (inclusive)
    pub tempo_min_percent: f32,
    pub tempo_max_percent: f32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            preroll: Duration::from_millis(200),
            preroll_timeout: Duration::from_secs(5),
            drift_tolerance: Duration::from_millis(10),
            ring_buffer_multiple: 8,
            dropout_queue_depth: 256,
            position_event_interval: Duration::from_millis(1000),
            tempo_min_percent: 80.0,
            tempo_max_percent: 120.0,
        }
    }
}

impl EngineParams {
    /// Pre-roll threshold in frames at the given sample rate.
    pub fn preroll_frames(&self, sample_rate: u32) -> u64 {
        (self.preroll.as_secs_f64() * sample_rate as f64).round() as u64
    }

    /// Drift tolerance in frames at the given sample rate.
    pub fn drift_tolerance_frames(&self, sample_rate: u32) -> u64 {
        (self.drift_tolerance.as_secs_f64() * sample_rate as f64).round() as u64
    }

    /// Clamp a tempo request (percent) into the configured band.
    pub fn clamp_tempo_percent(&self, percent: f32) -> f32 {
        percent.clamp(self.tempo_min_percent, self.tempo_max_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preroll_frames_at_48k() {
        let params = EngineParams::default();
        assert_eq!(params.preroll_frames(48_000), 9_600);
    }

    #[test]
    fn drift_tolerance_frames_at_44k1() {
        let params = EngineParams::default();
        assert_eq!(params.drift_tolerance_frames(44_100), 441);
    }

    #[test]
    fn tempo_clamps_to_band() {
        let params = EngineParams::default();
        assert_eq!(params.clamp_tempo_percent(50.0), 80.0);
        assert_eq!(params.clamp_tempo_percent(100.0), 100.0);
        assert_eq!(params.clamp_tempo_percent(150.0), 120.0);
    }
}
