//! Boundary to the external codec service.
//!
//! The pipeline never touches container formats itself: it asks a [`Codec`]
//! to describe a file, to turn it into raw PCM, and to turn raw PCM back into
//! a file. Raw PCM is always signed, interleaved, little-endian at
//! [`SAMPLE_BITS`] bits per sample.

mod ffmpeg;

#[cfg(test)]
pub(crate) mod fake;

use std::path::Path;

use crate::Result;

pub use ffmpeg::FfmpegCodec;

/// Bit depth raw audio is held at while loaded.
pub const SAMPLE_BITS: u32 = 16;

/// Sample rate assumed when a probe does not report one.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Bit rate (bits per second) assumed when a probe does not report one.
pub const DEFAULT_BIT_RATE: u64 = 192_000;

/// Stream description obtained from probing an audio file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u64,
    pub format_name: String,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 2,
            bit_rate: DEFAULT_BIT_RATE,
            format_name: String::new(),
        }
    }
}

/// Probe/decode/encode contract of the codec service.
///
/// Every call may fail; callers treat failures as recoverable for the single
/// file involved.
pub trait Codec: Send + Sync {
    /// Reads the stream layout of `path`.
    fn probe(&self, path: &Path) -> Result<StreamInfo>;

    /// Decodes `path` to interleaved samples in the stream's native channel
    /// count.
    fn decode(&self, path: &Path, info: &StreamInfo) -> Result<Vec<i16>>;

    /// Encodes `samples` to `dest` with `gain_db` applied, keeping the sample
    /// rate, bit rate and container of `info`.
    fn encode(&self, samples: &[i16], info: &StreamInfo, gain_db: f64, dest: &Path) -> Result<()>;
}

impl<C: Codec + ?Sized> Codec for std::sync::Arc<C> {
    fn probe(&self, path: &Path) -> Result<StreamInfo> {
        (**self).probe(path)
    }

    fn decode(&self, path: &Path, info: &StreamInfo) -> Result<Vec<i16>> {
        (**self).decode(path, info)
    }

    fn encode(&self, samples: &[i16], info: &StreamInfo, gain_db: f64, dest: &Path) -> Result<()> {
        (**self).encode(samples, info, gain_db, dest)
    }
}

/// Reinterprets little-endian PCM bytes as samples. A trailing odd byte is
/// ignored.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Serialises samples as little-endian PCM bytes.
pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|sample| sample.to_le_bytes()).collect()
}
