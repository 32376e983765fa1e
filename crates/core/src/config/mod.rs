use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PitchSyncError, Result, TIMESTEP};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
    pub sync: SyncConfig,
    pub analysis: AnalyzerConfig,
}

impl AppConfig {
    /// Parses a (possibly partial) JSON document. Missing fields keep their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.playback.validate()?;
        self.capture.validate()?;
        self.sync.validate()?;
        self.analysis.validate()
    }
}

/// Configuration for the playback engine and its output device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name, `None` for the system default.
    pub device: Option<String>,
    /// Seconds into the track where previews start.
    pub preview_offset: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            preview_offset: 30.0,
        }
    }
}

impl PlaybackConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.preview_offset.is_finite() || self.preview_offset < 0.0 {
            return Err(PitchSyncError::Config(format!(
                "preview offset must be a non-negative number of seconds, got {}",
                self.preview_offset
            )));
        }
        Ok(())
    }
}

/// Configuration specific to the capture subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub channels: usize,
    /// Input device name, `None` for the system default.
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Frames per callback for devices that let us choose.
    pub period_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            device: None,
            sample_rate: 48_000,
            period_frames: 512,
        }
    }
}

impl CaptureConfig {
    fn validate(&self) -> Result<()> {
        if self.channels == 0 {
            return Err(PitchSyncError::Config(
                "capture needs at least one channel".into(),
            ));
        }
        if self.sample_rate == 0 || self.period_frames == 0 {
            return Err(PitchSyncError::Config(
                "capture sample rate and period must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Scheduling parameters for the synchronization engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds of playback between two pitch samples.
    pub timestep: f64,
    /// Fraction of the remaining time to sleep before re-checking the clock.
    pub wake_ahead: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timestep: TIMESTEP,
            wake_ahead: 0.6,
        }
    }
}

impl SyncConfig {
    pub fn with_timestep(timestep: f64) -> Self {
        Self {
            timestep,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.timestep.is_finite() && self.timestep > 0.0) {
            return Err(PitchSyncError::Config(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if !(self.wake_ahead > 0.0 && self.wake_ahead <= 1.0) {
            return Err(PitchSyncError::Config(format!(
                "wake-ahead factor must lie in (0, 1], got {}",
                self.wake_ahead
            )));
        }
        Ok(())
    }
}

/// Tuning for [`crate::SpectralAnalyzer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub fft_size: usize,
    /// Fresh samples required before the window is analysed again.
    pub hop_size: usize,
    pub min_frequency: f64,
    pub max_frequency: f64,
    /// Peaks quieter than this (dBFS) are not reported as tones.
    pub min_level_db: f64,
    /// Capacity of the lock-free input ring, in samples.
    pub buffer_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            hop_size: 1024,
            min_frequency: 60.0,
            max_frequency: 1600.0,
            min_level_db: -60.0,
            buffer_capacity: 32_768,
        }
    }
}

impl AnalyzerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.fft_size < 64 || !self.fft_size.is_power_of_two() {
            return Err(PitchSyncError::Config(format!(
                "fft size must be a power of two >= 64, got {}",
                self.fft_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.fft_size {
            return Err(PitchSyncError::Config(format!(
                "hop size must lie in 1..={}, got {}",
                self.fft_size, self.hop_size
            )));
        }
        if !(self.min_frequency > 0.0 && self.min_frequency < self.max_frequency) {
            return Err(PitchSyncError::Config(format!(
                "frequency range {}..{} is empty",
                self.min_frequency, self.max_frequency
            )));
        }
        if self.buffer_capacity < self.hop_size {
            return Err(PitchSyncError::Config(
                "input buffer must hold at least one hop".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AppConfig::from_json_str(r#"{ "capture": { "channels": 1 }, "sync": { "timestep": 0.02 } }"#)
                .unwrap();

        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.capture.sample_rate, 48_000);
        assert_eq!(config.sync.timestep, 0.02);
        assert_eq!(config.sync.wake_ahead, 0.6);
        assert_eq!(config.playback.preview_offset, 30.0);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(AppConfig::from_json_str(r#"{ "capture": { "channels": 0 } }"#).is_err());
        assert!(AppConfig::from_json_str(r#"{ "sync": { "timestep": 0.0 } }"#).is_err());
        assert!(AppConfig::from_json_str(r#"{ "sync": { "wake_ahead": 1.5 } }"#).is_err());
        assert!(AppConfig::from_json_str(r#"{ "analysis": { "fft_size": 1000 } }"#).is_err());
    }

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }
}
