//! In-memory stand-in for the codec service used by tests.
//!
//! Files are stored as one channel-count byte followed by little-endian
//! samples, which keeps fixtures readable and lets encode apply real gain.

use std::{
    collections::HashSet,
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::{samples_from_le_bytes, samples_to_le_bytes, Codec, StreamInfo};
use crate::{NormalizerError, Result};

#[derive(Debug, Default)]
pub(crate) struct FakeCodec {
    fail_decode: HashSet<String>,
    fail_encode: HashSet<String>,
    decodes: AtomicUsize,
    encodes: AtomicUsize,
}

impl FakeCodec {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes decoding of every file named `filename` fail.
    pub(crate) fn failing_decode(mut self, filename: &str) -> Self {
        self.fail_decode.insert(filename.to_string());
        self
    }

    /// Makes encoding to every file named `filename` fail after leaving a
    /// truncated file behind.
    pub(crate) fn failing_encode(mut self, filename: &str) -> Self {
        self.fail_encode.insert(filename.to_string());
        self
    }

    pub(crate) fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn encode_count(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Codec for FakeCodec {
    fn probe(&self, path: &Path) -> Result<StreamInfo> {
        let bytes = fs::read(path)?;
        match bytes.first() {
            Some(&channels @ (1 | 2)) => Ok(StreamInfo {
                channels: u16::from(channels),
                format_name: "fake".to_string(),
                ..StreamInfo::default()
            }),
            _ => Err(NormalizerError::codec(path, "not a fake audio file")),
        }
    }

    fn decode(&self, path: &Path, _info: &StreamInfo) -> Result<Vec<i16>> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_decode.contains(&file_name(path)) {
            return Err(NormalizerError::codec(path, "decode failed"));
        }
        let bytes = fs::read(path)?;
        Ok(samples_from_le_bytes(bytes.get(1..).unwrap_or_default()))
    }

    fn encode(&self, samples: &[i16], info: &StreamInfo, gain_db: f64, dest: &Path) -> Result<()> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_encode.contains(&file_name(dest)) {
            fs::write(dest, [0xff])?;
            return Err(NormalizerError::codec(dest, "encode failed"));
        }
        if !gain_db.is_finite() {
            return Err(NormalizerError::codec(dest, "non-finite gain"));
        }
        let factor = 10_f64.powf(gain_db / 20.0);
        let scaled: Vec<i16> = samples
            .iter()
            .map(|&sample| {
                (f64::from(sample) * factor)
                    .round()
                    .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect();
        write_audio(dest, info.channels as u8, &scaled)
    }
}

/// Writes a fixture file readable by [`FakeCodec`].
pub(crate) fn write_audio(path: &Path, channels: u8, samples: &[i16]) -> Result<()> {
    let mut bytes = vec![channels];
    bytes.extend(samples_to_le_bytes(samples));
    fs::write(path, bytes)?;
    Ok(())
}

/// Reads a fixture file back as (channels, samples).
pub(crate) fn read_audio(path: &Path) -> Result<(u8, Vec<i16>)> {
    let bytes = fs::read(path)?;
    let channels = *bytes
        .first()
        .ok_or_else(|| NormalizerError::codec(path, "empty fake audio file"))?;
    Ok((channels, samples_from_le_bytes(&bytes[1..])))
}
