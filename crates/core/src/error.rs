use std::path::PathBuf;

/// Result alias that carries the custom [`NormalizerError`] type.
pub type Result<T> = std::result::Result<T, NormalizerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum NormalizerError {
    /// Free-form failure that does not warrant its own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The codec gateway could not probe, decode or encode a file.
    #[error("codec failure on {}: {message}", path.display())]
    Codec { path: PathBuf, message: String },
    /// A folder was treated as a song but holds no chart file.
    #[error("chart file not found in {}", .0.display())]
    ChartMissing(PathBuf),
    /// The cache file exists but is not a valid cache document.
    #[error("malformed cache file: {0}")]
    CacheFormat(#[from] serde_json::Error),
    /// The configuration file could not be parsed.
    #[error("malformed config file: {0}")]
    ConfigFormat(#[from] toml::de::Error),
    /// The configuration could not be serialised back to disk.
    #[error("unable to write config file: {0}")]
    ConfigWrite(#[from] toml::ser::Error),
    /// A worker failed unexpectedly while processing `song`.
    #[error("worker failed while processing {song}: {cause}")]
    Worker { song: String, cause: String },
}

impl NormalizerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a codec error for `path`.
    pub fn codec(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Codec {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<&str> for NormalizerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for NormalizerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
