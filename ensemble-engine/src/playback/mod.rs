//! Real-time playback core: ring buffer, buffer pool, tracks, mixer, effect
//! chain, and the transport controller.

pub mod effects;
pub mod mixer;
pub mod pool;
pub mod ring_buffer;
pub mod track;
pub mod transform;
pub mod transport;

pub use mixer::{Mixer, MixerHandle};
pub use ring_buffer::{RingStats, SampleRing};
pub use track::Track;
pub use transport::Transport;
