//! Error types for the sync layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket errors (bind, send, receive)
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization target too small
    #[error("wire buffer too small: {len} bytes, need {needed}")]
    BufferTooSmall { len: usize, needed: usize },

    /// No time source reachable within its deadline
    #[error("time sync failed: {0}")]
    TimeSync(String),
}

pub type Result<T> = std::result::Result<T, Error>;
