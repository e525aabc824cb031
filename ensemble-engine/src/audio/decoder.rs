//! Streaming audio decoder using symphonia
//!
//! Decodes MP3/FLAC/WAV/OGG/AAC to interleaved f32 PCM, one packet at a
//! time, on the track's decode thread. Seeking uses the container's accurate
//! seek followed by a decoder reset.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

/// Probed facts about a source file.
#[derive(Debug, Clone, Copy)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: u16,

    /// Total duration in seconds; 0.0 when the container does not declare it
    pub duration_seconds: f64,
}

/// Probe a file without decoding it.
pub fn probe(path: &Path) -> Result<SourceInfo> {
    let decoder = StreamingDecoder::open(path)?;
    Ok(decoder.info())
}

/// One open decode pipeline: container reader + codec decoder + f32
/// conversion buffer.
pub struct StreamingDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    duration_seconds: f64,
    sample_buf: Option<SampleBuffer<f32>>,
    path: PathBuf,
}

impl std::fmt::Debug for StreamingDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDecoder")
            .field("track_id", &self.track_id)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_seconds", &self.duration_seconds)
            .field("path", &self.path)
            .finish()
    }
}

impl StreamingDecoder {
    /// Open a file and prepare the default audio track for decoding.
    pub fn open(path: &Path) -> Result<Self> {
        debug!("opening decoder for {}", path.display());

        let file = std::fs::File::open(path).map_err(|e| {
            Error::Decode(format!("failed to open {}: {}", path.display(), e))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| Error::Decode(format!("failed to probe format: {}", e)))?;

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::Decode("no audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| Error::Decode("sample rate not declared".to_string()))?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::Decode("channel count not declared".to_string()))?;

        let duration_seconds = match (codec_params.n_frames, codec_params.time_base) {
            (Some(n_frames), Some(time_base)) => {
                let time = time_base.calc_time(n_frames);
                time.seconds as f64 + time.frac
            }
            (Some(n_frames), None) => n_frames as f64 / sample_rate as f64,
            _ => 0.0,
        };

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| Error::Decode(format!("failed to create decoder: {}", e)))?;

        debug!(
            "decoder ready: {} Hz, {} ch, {:.3} s",
            sample_rate, channels, duration_seconds
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            duration_seconds,
            sample_buf: None,
            path: path.to_path_buf(),
        })
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            sample_rate: self.sample_rate,
            channels: self.channels,
            duration_seconds: self.duration_seconds,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode the next packet, appending interleaved f32 samples to `out`.
    ///
    /// Returns `Ok(false)` at end of stream. Corrupt packets are skipped
    /// with a warning; only unrecoverable conditions surface as `Err`.
    pub fn next_chunk(&mut self, out: &mut Vec<f32>) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode(format!(
                        "failed to read packet from {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if self.sample_buf.is_none() {
                        let spec = *decoded.spec();
                        self.sample_buf =
                            Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
                    }
                    let sample_buf = self.sample_buf.as_mut().expect("buffer just ensured");
                    sample_buf.copy_interleaved_ref(decoded);
                    out.extend_from_slice(sample_buf.samples());
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable per-packet corruption: skip and continue
                    warn!("skipping corrupt packet in {}: {}", self.path.display(), e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode(format!(
                        "decode failed for {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
    }

    /// Seek to an absolute source position, returning the actual position
    /// reached (containers land on packet boundaries at or before the
    /// target).
    pub fn seek_to(&mut self, seconds: f64) -> Result<f64> {
        let seconds = seconds.max(0.0);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| Error::Decode(format!("seek to {:.3}s failed: {}", seconds, e)))?;

        self.decoder.reset();

        let actual = match self
            .format
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)
            .and_then(|t| t.codec_params.time_base)
        {
            Some(time_base) => {
                let time = time_base.calc_time(seeked.actual_ts);
                time.seconds as f64 + time.frac
            }
            None => seeked.actual_ts as f64 / self.sample_rate as f64,
        };

        debug!("seeked {} to {:.3}s (asked {:.3}s)", self.path.display(), actual, seconds);
        Ok(actual)
    }
}
