//! Pitch analysis seam.
//!
//! An [`Analyzer`] is fed raw samples from the capture callback and queried
//! for a dominant tone by the synchronization worker. Both roles call through
//! `&self` from different threads, so implementations synchronise
//! internally: `input` must never block or allocate.

mod spectral;

use serde::{Deserialize, Serialize};

use crate::ChannelSamples;

pub use spectral::SpectralAnalyzer;

/// Dominant tone reported by an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    /// Frequency in Hz.
    pub freq: f64,
    /// Level of the most recent analysis window, dBFS.
    pub db: f64,
    /// Level smoothed over the time the tone has been held, dBFS.
    pub stable_db: f64,
}

pub trait Analyzer: Send + Sync {
    /// Accepts one channel's share of a capture buffer. Called on the audio
    /// device thread.
    fn input(&self, samples: ChannelSamples<'_>);

    /// Processes whatever has accumulated since the previous call.
    fn process(&self);

    /// Returns the current dominant tone, if any.
    fn find_tone(&self) -> Option<Tone>;
}
