use std::path::{Path, PathBuf};

/// Result alias that carries the custom [`PitchSyncError`] type.
pub type Result<T> = std::result::Result<T, PitchSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum PitchSyncError {
    /// An audio device could not be opened, configured or started. Engines
    /// that own a device fail construction with this variant.
    #[error("audio device error: {0}")]
    Device(String),
    /// A track could not be opened or decoded.
    #[error("cannot decode {}: {reason}", .path.display())]
    Decode { path: PathBuf, reason: String },
    /// Configuration values that cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("fft failure: {0}")]
    Fft(#[from] realfft::FftError),
}

impl PitchSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn device<T: std::fmt::Display>(err: T) -> Self {
        Self::Device(err.to_string())
    }

    pub fn decode<T: std::fmt::Display>(path: &Path, reason: T) -> Self {
        Self::Decode {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for failures the playback engine recovers from.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

impl From<&str> for PitchSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for PitchSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_names_the_track() {
        let err = PitchSyncError::decode(Path::new("songs/missing.ogg"), "no such file");
        assert!(err.is_decode());
        assert_eq!(
            err.to_string(),
            "cannot decode songs/missing.ogg: no such file"
        );
    }
}
