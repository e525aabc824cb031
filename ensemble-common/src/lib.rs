//! # Ensemble Common (ensemble-common)
//!
//! Shared types for the Ensemble multi-track playback engine.
//!
//! **Purpose:** Audio configuration, the master clock, event definitions and
//! the EventBus, wall-clock tick helpers, and engine tuning parameters shared
//! by `ensemble-engine` and `ensemble-sync`.

pub mod clock;
pub mod config;
pub mod events;
pub mod params;
pub mod time;

pub use clock::{ClockMode, MasterClock};
pub use config::AudioConfig;
pub use events::{
    ConnectionState, DropoutEvent, DropoutReason, EngineEvent, EventBus, PlaybackState, TrackState,
};
pub use params::EngineParams;
