//! # Ensemble Engine (ensemble-engine)
//!
//! Sample-accurate multi-track playback and synchronization engine.
//!
//! **Purpose:** Decode several audio files on independent threads, keep them
//! temporally aligned against a shared master clock while mixing them to one
//! output device, and expose transport control (play/pause/stop/seek, tempo,
//! pitch, per-track gain/mute/solo, master effects).
//!
//! **Architecture:** Per-track decode pipeline (symphonia → rubato →
//! tempo/pitch transform → lock-free ring) feeding a real-time mixer invoked
//! from the cpal output callback.

pub mod audio;
pub mod error;
pub mod playback;
pub mod state;

pub use error::{Error, Result};
pub use playback::{Mixer, MixerHandle, Track, Transport};
pub use state::SharedState;
