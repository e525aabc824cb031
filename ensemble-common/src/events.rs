//! Event types and EventBus
//!
//! # Architecture
//!
//! Ensemble uses hybrid communication:
//! - **EventBus** (`tokio::broadcast`): one-to-many engine events for
//!   observers (UI, logging, sync server)
//! - **Bounded MPSC queues**: audio-thread → drain-task delivery (dropouts)
//! - **Atomics / shared state**: read-heavy scalar access
//!
//! The audio callback never touches the bus; it pushes [`DropoutEvent`]s into
//! a bounded queue and a drain task re-broadcasts them as
//! [`EngineEvent::Dropout`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Transport-level playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Per-track reader state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrackState {
    /// Created or stopped; decoder parked
    Idle = 0,

    /// Decoder filling the ring toward the pre-roll threshold
    Buffering = 1,

    /// Delivering samples to the mixer
    Playing = 2,

    /// Decoder idle, ring contents retained
    Paused = 3,

    /// Decoder hit end of stream and the ring drained
    Ended = 4,

    /// Unrecoverable decode error; reads return silence
    Faulted = 5,
}

impl TrackState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TrackState::Buffering,
            2 => TrackState::Playing,
            3 => TrackState::Paused,
            4 => TrackState::Ended,
            5 => TrackState::Faulted,
            _ => TrackState::Idle,
        }
    }
}

/// Sync client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Synced = 3,
}

impl ConnectionState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Synced,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Why a source delivered fewer frames than the mixer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropoutReason {
    /// Ring empty during an active fill
    Underrun,

    /// Source hit a permanent decode failure
    DecodeError,

    /// Source format did not match the engine configuration
    FormatMismatch,
}

/// One shortfall observed by the mixer for one source.
///
/// Constructed on the audio callback: every field is either `Copy` or a
/// pre-existing `Arc`, so creating one never allocates.
#[derive(Debug, Clone)]
pub struct DropoutEvent {
    pub track_id: Uuid,
    pub track_name: Arc<str>,

    /// Master-clock timestamp at the fill that observed the shortfall
    pub timestamp_secs: f64,

    pub missed_frames: u32,
    pub reason: DropoutReason,
}

/// Engine events broadcast on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Transport state changed (Stopped/Playing/Paused)
    PlaybackStateChanged {
        old_state: PlaybackState,
        new_state: PlaybackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track moved through its state machine
    TrackStateChanged {
        track_id: Uuid,
        state: TrackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Re-broadcast of a drained dropout
    Dropout {
        track_id: Uuid,
        track_name: String,
        position_secs: f64,
        missed_frames: u32,
        reason: DropoutReason,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic position report while playing
    PositionUpdate {
        position_secs: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Output device started, stopped, or failed
    DeviceStateChanged {
        running: bool,
        detail: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Sync client connection state changed
    SyncConnectionChanged {
        state: ConnectionState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// One-to-many event broadcaster over `tokio::broadcast`.
///
/// Lagging subscribers lose the oldest events rather than blocking emitters.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; errors when no subscriber is attached.
    pub fn emit(&self, event: EngineEvent) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.sender.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_counts_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.capacity(), 16);
    }

    #[test]
    fn emit_without_subscribers_errors() {
        let bus = EventBus::new(16);
        let event = EngineEvent::PositionUpdate {
            position_secs: 1.0,
            timestamp: chrono::Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        // lossy variant must not panic
        bus.emit_lossy(event);
    }

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::PlaybackStateChanged {
            old_state: PlaybackState::Stopped,
            new_state: PlaybackState::Playing,
            timestamp: chrono::Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::PlaybackStateChanged {
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(old_state, PlaybackState::Stopped);
                assert_eq!(new_state, PlaybackState::Playing);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn track_state_round_trips_through_u8() {
        for state in [
            TrackState::Idle,
            TrackState::Buffering,
            TrackState::Playing,
            TrackState::Paused,
            TrackState::Ended,
            TrackState::Faulted,
        ] {
            assert_eq!(TrackState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn connection_state_round_trips_through_u8() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Synced,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }
}
