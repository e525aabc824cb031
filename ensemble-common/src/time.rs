//! Wall-clock tick helpers for network timestamps
//!
//! Network packets carry reference-clock timestamps in **ticks**: 100 ns
//! units since the Unix epoch (10,000,000 ticks per second). Ticks are `i64`,
//! which covers ±29,000 years around the epoch; all arithmetic here stays
//! far inside that range.
//!
//! Timeline positions inside the engine are frames (see
//! [`crate::clock::MasterClock`]); ticks exist only at the network boundary.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ticks per second (one tick = 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Current wall-clock time in ticks since the Unix epoch.
pub fn now_ticks() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => duration_to_ticks(elapsed),
        // Clock before epoch: treat as epoch rather than panic.
        Err(_) => 0,
    }
}

/// Convert a duration to ticks (truncating below 100 ns).
pub fn duration_to_ticks(duration: Duration) -> i64 {
    (duration.as_nanos() / 100) as i64
}

/// Convert ticks to seconds.
pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// Convert seconds to ticks (rounded).
pub fn seconds_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversions_round_trip() {
        assert_eq!(seconds_to_ticks(1.0), TICKS_PER_SECOND);
        assert_eq!(ticks_to_seconds(TICKS_PER_SECOND), 1.0);
        assert_eq!(seconds_to_ticks(0.5), 5_000_000);
        assert_eq!(ticks_to_seconds(seconds_to_ticks(3.25)), 3.25);
    }

    #[test]
    fn duration_conversion_truncates_sub_tick() {
        assert_eq!(duration_to_ticks(Duration::from_nanos(99)), 0);
        assert_eq!(duration_to_ticks(Duration::from_nanos(100)), 1);
        assert_eq!(duration_to_ticks(Duration::from_millis(5)), 50_000);
    }

    #[test]
    fn now_is_after_2020() {
        // 2020-01-01 in ticks since the Unix epoch
        let ticks_2020 = 1_577_836_800 * TICKS_PER_SECOND;
        assert!(now_ticks() > ticks_2020);
    }
}
