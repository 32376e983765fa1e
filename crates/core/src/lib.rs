//! Core library for PitchSync.
//!
//! Three engines cooperate:
//!
//! - [`PlaybackEngine`] plays a track on its own worker thread and exposes
//!   non-blocking transport commands plus the playback clock.
//! - [`CaptureEngine`] feeds every input channel of a capture device into
//!   its own [`Analyzer`] straight from the device callback.
//! - [`SyncEngine`] follows the playback clock and appends one pitch sample
//!   per player for every elapsed [`TIMESTEP`].
//!
//! Devices and decoders sit behind [`PlaybackBackend`] and [`CaptureDevice`].
//! Real cpal/symphonia bindings are available with the `device` feature;
//! [`VirtualOutput`] and [`SyntheticCapture`] need no hardware.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod record;
pub mod timeline;

pub use analysis::{Analyzer, SpectralAnalyzer, Tone};
#[cfg(feature = "device")]
pub use audio::DeviceOutput;
pub use audio::{PlaybackBackend, PlaybackEngine, VirtualOutput, MAX_VOLUME};
pub use config::{AnalyzerConfig, AppConfig, CaptureConfig, PlaybackConfig, SyncConfig};
pub use error::{PitchSyncError, Result};
#[cfg(feature = "device")]
pub use record::DeviceCapture;
pub use record::{CaptureCallback, CaptureDevice, CaptureEngine, ChannelSamples, SyntheticCapture};
pub use timeline::{AudioClock, Color, PitchSample, Player, SyncEngine, TIMESTEP};

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::*;

    /// Virtual playback, synthetic voices and spectral analyzers end to end.
    #[test]
    fn pipeline_records_aligned_voiced_histories() {
        let audio = Arc::new(
            PlaybackEngine::new(
                VirtualOutput::new().with_track("duet.ogg", 1.0),
                &PlaybackConfig::default(),
            )
            .unwrap(),
        );
        audio.wait();

        let capture_config = CaptureConfig {
            channels: 2,
            sample_rate: 16_000,
            period_frames: 256,
            ..CaptureConfig::default()
        };
        let analysis = AnalyzerConfig {
            fft_size: 1024,
            hop_size: 256,
            ..AnalyzerConfig::default()
        };
        let capture = CaptureEngine::with_spectral(
            SyntheticCapture::new(&capture_config, &[Some(220.0), Some(330.0)]),
            &analysis,
        )
        .unwrap();

        let clock: Arc<dyn AudioClock> = audio.clone();
        let mut sync = SyncEngine::new(
            clock,
            capture.analyzers().iter().cloned(),
            &SyncConfig::with_timestep(0.05),
        )
        .unwrap();

        audio.play_music("duet.ogg");
        audio.wait();
        let deadline = Instant::now() + Duration::from_secs(10);
        while audio.is_playing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        sync.shutdown();

        let players = sync.players();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].len(), players[1].len());
        // One second at 50 ms per step.
        assert!((19..=21).contains(&players[0].len()), "len = {}", players[0].len());

        for (player, expected) in players.iter().zip([220.0, 330.0]) {
            let voiced: Vec<f64> = player
                .pitch()
                .iter()
                .filter(|sample| sample.is_voiced())
                .map(|sample| sample.freq)
                .collect();
            assert!(voiced.len() > player.len() / 2);
            assert!(voiced.iter().all(|freq| (freq - expected).abs() < 8.0));
        }
    }
}
