//! Core library for the stem normalizer.
//!
//! A song is a folder of audio stems plus a chart file. Each module owns one
//! step of bringing every song in a library to a common loudness: discovery,
//! decoding through an external codec, mixing, measurement, the export or copy
//! decision, the persistent change cache and the scheduler that drives it all.

pub mod analysis;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod gain;
pub mod library;
pub mod mixer;
pub mod processor;
pub mod scheduler;

pub use cache::{CacheData, CacheStore};
pub use codec::{Codec, FfmpegCodec, StreamInfo};
pub use config::{NormalizerConfig, RunPaths};
pub use error::{NormalizerError, Result};
pub use gain::{GainAction, GainDecision};
pub use library::Song;
pub use mixer::AudioComponent;
pub use processor::{ProcessingOutcome, SongProcessor, SongReport};
pub use scheduler::{RunSummary, Scheduler, SongEvent, WorkerFailure};
