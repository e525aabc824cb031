//! # Ensemble Sync (ensemble-sync)
//!
//! UDP synchronization layer for the Ensemble playback engine: fixed-size
//! wire protocol, tiered network time provider, the 100 Hz clock-sync
//! server, and the disciplined client.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod time_provider;

pub use client::{ClientEvent, SyncClient, SyncClientConfig};
pub use error::{Error, Result};
pub use protocol::{Command, CommandKind, DEFAULT_PORT, PACKET_LEN, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use server::{SyncServer, SyncServerConfig};
pub use time_provider::{NetworkTimeProvider, SyncTier};
