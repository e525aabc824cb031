//! Audio resampling using rubato
//!
//! Converts decoded source audio to the engine sample rate on the decode
//! thread. The resampler is stateful: one instance lives for the whole life
//! of a decode pipeline so filter state carries across chunks and no phase
//! discontinuities appear at chunk boundaries.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use tracing::debug;

/// Fixed input chunk size fed to the resampler, in frames.
pub const RESAMPLER_CHUNK_FRAMES: usize = 1024;

/// Stateful resampler from a source rate to the engine rate.
///
/// `PassThrough` when the rates already match. The active variant owns its
/// planar staging buffers so the steady-state path does not allocate.
pub enum StreamResampler {
    PassThrough,

    Active {
        resampler: FastFixedIn<f32>,
        channels: usize,

        /// Reused planar input, one inner Vec per channel
        planar_in: Vec<Vec<f32>>,

        /// Reused planar output, pre-sized to the resampler's maximum
        planar_out: Vec<Vec<f32>>,
    },
}

impl StreamResampler {
    /// Create a resampler from `input_rate` to `output_rate`.
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self::PassThrough);
        }

        debug!(
            "creating resampler: {} Hz -> {} Hz ({} channels)",
            input_rate, output_rate, channels
        );

        let resampler = FastFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            PolynomialDegree::Septic,
            RESAMPLER_CHUNK_FRAMES,
            channels as usize,
        )
        .map_err(|e| Error::Decode(format!("failed to create resampler: {}", e)))?;

        let max_out = resampler.output_frames_max();
        let channels = channels as usize;
        Ok(Self::Active {
            resampler,
            channels,
            planar_in: vec![Vec::with_capacity(RESAMPLER_CHUNK_FRAMES); channels],
            planar_out: vec![vec![0.0; max_out]; channels],
        })
    }

    /// Chunk size this resampler expects, in frames.
    ///
    /// `process_chunk` must be fed exactly this many frames for the active
    /// variant; pass-through accepts any size.
    pub fn chunk_frames(&self) -> usize {
        match self {
            Self::PassThrough => RESAMPLER_CHUNK_FRAMES,
            Self::Active { .. } => RESAMPLER_CHUNK_FRAMES,
        }
    }

    /// Resample one interleaved chunk, appending interleaved output to `out`.
    pub fn process_chunk(&mut self, input: &[f32], out: &mut Vec<f32>) -> Result<()> {
        match self {
            Self::PassThrough => {
                out.extend_from_slice(input);
                Ok(())
            }
            Self::Active {
                resampler,
                channels,
                planar_in,
                planar_out,
            } => {
                let channels = *channels;
                debug_assert_eq!(input.len(), RESAMPLER_CHUNK_FRAMES * channels);

                // De-interleave into the reused planar staging
                for plane in planar_in.iter_mut() {
                    plane.clear();
                }
                for frame in input.chunks_exact(channels) {
                    for (ch, &sample) in frame.iter().enumerate() {
                        planar_in[ch].push(sample);
                    }
                }

                let (_, frames_out) = resampler
                    .process_into_buffer(planar_in, planar_out, None)
                    .map_err(|e| Error::Decode(format!("resampling failed: {}", e)))?;

                // Re-interleave
                for i in 0..frames_out {
                    for plane in planar_out.iter() {
                        out.push(plane[i]);
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop accumulated filter state (used across seeks).
    pub fn reset(&mut self) {
        if let Self::Active { resampler, .. } = self {
            resampler.reset();
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }
}
