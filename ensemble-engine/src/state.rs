//! Shared observable engine state
//!
//! Read-heavy surface for UIs and the sync layer: playback state, dropout
//! accounting, connection state. Written by the transport controller and the
//! dropout drain task.

use ensemble_common::{ConnectionState, DropoutEvent, PlaybackState};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Last dropout, simplified for display.
#[derive(Debug, Clone)]
pub struct DropoutInfo {
    pub track_name: String,
    pub position_secs: f64,
    pub missed_frames: u32,
    pub message: String,
}

/// Thread-safe shared state accessible by all components.
pub struct SharedState {
    playback_state: RwLock<PlaybackState>,
    connection_state: RwLock<ConnectionState>,

    dropout_count: AtomicU64,
    last_dropout: RwLock<Option<DropoutInfo>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            playback_state: RwLock::new(PlaybackState::Stopped),
            connection_state: RwLock::new(ConnectionState::Disconnected),
            dropout_count: AtomicU64::new(0),
            last_dropout: RwLock::new(None),
        }
    }

    pub async fn playback_state(&self) -> PlaybackState {
        *self.playback_state.read().await
    }

    pub async fn set_playback_state(&self, state: PlaybackState) -> PlaybackState {
        let mut guard = self.playback_state.write().await;
        std::mem::replace(&mut *guard, state)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read().await
    }

    pub async fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.write().await = state;
    }

    pub fn dropout_count(&self) -> u64 {
        self.dropout_count.load(Ordering::Relaxed)
    }

    pub async fn last_dropout(&self) -> Option<DropoutInfo> {
        self.last_dropout.read().await.clone()
    }

    /// Record one drained dropout; returns the running total.
    pub async fn record_dropout(&self, event: &DropoutEvent) -> u64 {
        let total = self.dropout_count.fetch_add(1, Ordering::Relaxed) + 1;
        let info = DropoutInfo {
            track_name: event.track_name.to_string(),
            position_secs: event.timestamp_secs,
            missed_frames: event.missed_frames,
            message: format!(
                "{:?}: {} missed {} frames at {:.3}s",
                event.reason, event.track_name, event.missed_frames, event.timestamp_secs
            ),
        };
        *self.last_dropout.write().await = Some(info);
        total
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
