use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};

use super::PlaybackBackend;
use crate::{PitchSyncError, Result};

/// Backend without a device: a catalog of known tracks whose playhead
/// follows the wall clock.
#[derive(Debug, Default)]
pub struct VirtualOutput {
    catalog: HashMap<PathBuf, f64>,
    length: f64,
    loaded: bool,
    started: bool,
    paused: bool,
    /// Position when `anchor` was taken.
    offset: f64,
    /// Running since this instant, `None` while stopped or paused.
    anchor: Option<Instant>,
    volume: f32,
}

impl VirtualOutput {
    pub fn new() -> Self {
        Self {
            volume: 1.0,
            ..Self::default()
        }
    }

    /// Registers a track that `load` will accept.
    pub fn with_track(mut self, path: impl Into<PathBuf>, length: f64) -> Self {
        self.add_track(path, length);
        self
    }

    pub fn add_track(&mut self, path: impl Into<PathBuf>, length: f64) {
        self.catalog.insert(path.into(), length.max(0.0));
    }

    /// Current linear gain.
    pub fn volume(&self) -> f32 {
        self.volume
    }
}

impl PlaybackBackend for VirtualOutput {
    fn load(&mut self, path: &Path) -> Result<f64> {
        self.stop();
        let length = *self
            .catalog
            .get(path)
            .ok_or_else(|| PitchSyncError::decode(path, "unknown track"))?;
        self.length = length;
        self.loaded = true;
        Ok(length)
    }

    fn start(&mut self) -> Result<()> {
        if !self.loaded {
            return Err(PitchSyncError::msg("no track loaded"));
        }
        self.started = true;
        if !self.paused {
            self.anchor = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.loaded = false;
        self.started = false;
        self.paused = false;
        self.offset = 0.0;
        self.anchor = None;
    }

    fn pause(&mut self, paused: bool) {
        if paused == self.paused {
            return;
        }
        self.offset = self.position();
        self.paused = paused;
        self.anchor = (self.started && !paused).then(Instant::now);
    }

    fn seek(&mut self, delta: f64) {
        self.offset = (self.position() + delta).clamp(0.0, self.length);
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
    }

    fn position(&self) -> f64 {
        let running = self
            .anchor
            .map(|anchor| anchor.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (self.offset + running).min(self.length)
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    fn is_finished(&self) -> bool {
        self.started && self.position() >= self.length
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unknown_track_is_a_decode_error() {
        let mut output = VirtualOutput::new();
        let err = output.load(Path::new("nowhere.ogg")).unwrap_err();
        assert!(err.is_decode());
        assert!(output.start().is_err());
    }

    #[test]
    fn seek_before_start_sets_the_starting_point() {
        let mut output = VirtualOutput::new().with_track("song.ogg", 60.0);
        assert_eq!(output.load(Path::new("song.ogg")).unwrap(), 60.0);

        output.seek(30.0);
        assert_eq!(output.position(), 30.0);
        output.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(output.position() > 30.0);
        assert!(!output.is_finished());
    }

    #[test]
    fn finishes_at_the_end_of_the_track() {
        let mut output = VirtualOutput::new().with_track("song.ogg", 5.0);
        output.load(Path::new("song.ogg")).unwrap();
        output.start().unwrap();
        output.seek(10.0);

        assert_eq!(output.position(), 5.0);
        assert!(output.is_finished());
    }
}
