//! Audio IO: backend adapter, decoding, resampling, sample-type helpers.

pub mod backend;
pub mod decoder;
pub mod resampler;
pub mod types;

pub use backend::{AudioBackend, CpalBackend, OfflineBackend, OfflineRenderer};
