use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{NormalizerError, Result};

/// Folder scanned for songs when no input root is given.
pub const INPUT_FOLDER: &str = "Songs";
/// Folder normalized songs are written to. Created on demand.
pub const OUTPUT_FOLDER: &str = "Normalized";
/// Default location of the configuration file.
pub const CONFIG_FILENAME: &str = "normalizer_config.toml";
/// Default location of the cache file.
pub const CACHE_FILENAME: &str = "normalizer_cache.json";

/// User-tunable settings, read once at startup and never mutated afterwards.
///
/// The on-disk keys keep their historical spelling, spaces included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Target loudness in dBFS. Must be negative.
    #[serde(rename = "target volume")]
    pub target_volume: i32,
    /// Songs within this many dB of the target are copied instead of re-encoded.
    pub headroom: i32,
    /// Show FFmpeg diagnostics while decoding.
    #[serde(rename = "load debug")]
    pub load_debug: bool,
    /// Show FFmpeg diagnostics while encoding.
    #[serde(rename = "export debug")]
    pub export_debug: bool,
    /// Process one song per logical core instead of sequentially.
    pub multithreading: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            target_volume: -16,
            headroom: 1,
            load_debug: false,
            export_debug: false,
            multithreading: true,
        }
    }
}

impl NormalizerConfig {
    /// Loads the configuration at `path`.
    ///
    /// A missing file is created with the defaults. A file that fails to parse
    /// or validate is replaced wholesale by the defaults; partially valid
    /// files are never merged.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.is_file() {
            tracing::info!(path = %path.display(), "no config found, writing defaults");
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let text = fs::read_to_string(path)?;
        match Self::parse(&text) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "bad config, remaking");
                let config = Self::default();
                config.save(path)?;
                Ok(config)
            }
        }
    }

    /// Parses and validates a configuration document.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the value ranges the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.target_volume >= 0 {
            return Err(NormalizerError::msg(format!(
                "target volume must be below 0 dBFS, got {}",
                self.target_volume
            )));
        }
        if self.headroom < 0 {
            return Err(NormalizerError::msg(format!(
                "headroom must not be negative, got {}",
                self.headroom
            )));
        }
        Ok(())
    }

    /// Writes the configuration to `path`, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn target_dbfs(&self) -> f64 {
        f64::from(self.target_volume)
    }

    pub fn headroom_db(&self) -> f64 {
        f64::from(self.headroom)
    }
}

/// Input and output roots of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
}

impl Default for RunPaths {
    fn default() -> Self {
        Self::new(INPUT_FOLDER, OUTPUT_FOLDER)
    }
}

impl RunPaths {
    pub fn new(input_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
        }
    }

    /// Mirrors `song_path` from under the input root to under the output root.
    pub fn destination_for(&self, song_path: &Path) -> PathBuf {
        match song_path.strip_prefix(&self.input_root) {
            Ok(relative) => self.output_root.join(relative),
            // Songs always come from discovery under the input root; anything
            // else is mirrored by its last component.
            Err(_) => match song_path.file_name() {
                Some(name) => self.output_root.join(name),
                None => self.output_root.clone(),
            },
        }
    }
}
