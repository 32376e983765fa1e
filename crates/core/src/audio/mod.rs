//! Track playback.
//!
//! [`PlaybackEngine`] runs a worker thread that owns the decode/output
//! session. Callers post the desired action into a single command slot and
//! return immediately; the worker always acts on the latest command, never a
//! backlog.

#[cfg(feature = "device")]
mod device;
mod virtual_output;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};

use crate::{AudioClock, PlaybackConfig, Result};

#[cfg(feature = "device")]
pub use device::DeviceOutput;
pub use virtual_output::VirtualOutput;

/// Loudest volume on the external 0..=100 scale.
pub const MAX_VOLUME: u32 = 100;

/// Decoder plus output device.
///
/// The engine hands the backend to one thread at a time: caller threads
/// reach it behind the session lock, and the worker takes it out of the
/// session for the duration of `load`, so queries never wait on a decode.
pub trait PlaybackBackend: Send {
    /// Opens and decodes `path`, returning its length in seconds.
    fn load(&mut self, path: &Path) -> Result<f64>;

    /// Starts output of the loaded track.
    fn start(&mut self) -> Result<()>;

    /// Ends the current session and releases the output stream.
    fn stop(&mut self);

    fn pause(&mut self, paused: bool);

    /// Moves the playhead by `delta` seconds.
    fn seek(&mut self, delta: f64);

    /// Seconds of the track heard so far.
    fn position(&self) -> f64;

    /// Linear gain in `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);

    /// `true` once the started track has been played to its end.
    fn is_finished(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    Preview,
    Play,
    Quit,
}

struct Control {
    /// Pending command, `None` once the worker has taken it.
    command: Option<Command>,
    filename: Option<PathBuf>,
    /// Worker is parked waiting for a command.
    ready: bool,
}

struct Session {
    /// `None` while the worker is loading a track.
    backend: Option<Box<dyn PlaybackBackend>>,
    length: f64,
    volume: u32,
    paused: bool,
    active: bool,
}

impl Session {
    fn is_running(&self) -> bool {
        self.active
            && self
                .backend
                .as_ref()
                .is_some_and(|backend| !backend.is_finished())
    }

    /// Ends the current track and lends the backend out for a load.
    fn take_for_load(&mut self) -> Option<Box<dyn PlaybackBackend>> {
        self.close();
        self.length = 0.0;
        self.backend.take()
    }

    /// Starts a freshly loaded backend at `offset` and puts it back.
    fn install(
        &mut self,
        mut backend: Box<dyn PlaybackBackend>,
        loaded: Result<f64>,
        offset: f64,
    ) -> Result<()> {
        let started = loaded.and_then(|length| self.open(backend.as_mut(), length, offset));
        if started.is_err() {
            backend.stop();
            self.length = 0.0;
        }
        self.backend = Some(backend);
        started
    }

    fn open(&mut self, backend: &mut dyn PlaybackBackend, length: f64, offset: f64) -> Result<()> {
        self.length = if length.is_finite() { length.max(0.0) } else { 0.0 };
        backend.set_volume(volume_gain(self.volume));
        backend.pause(false);

        let start = start_position(offset, self.length);
        if start > 0.0 {
            backend.seek(start);
        }
        backend.start()?;

        self.paused = false;
        self.active = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.active {
            if let Some(backend) = self.backend.as_mut() {
                backend.stop();
            }
            self.active = false;
            self.paused = false;
            tracing::info!("playback stopped");
        }
    }
}

struct Shared {
    control: Mutex<Control>,
    /// Signalled when a command is posted.
    wake: Condvar,
    /// Signalled when the worker goes back to waiting.
    settled: Condvar,
    session: Mutex<Session>,
    preview_offset: f64,
}

impl Shared {
    fn run(&self) {
        loop {
            let (command, filename) = {
                let mut control = self.control.lock();
                control.ready = true;
                self.settled.notify_all();
                let command = loop {
                    match control.command {
                        Some(command) => break command,
                        None => self.wake.wait(&mut control),
                    }
                };
                control.ready = false;

                if command != Command::Quit {
                    control.command = None;
                }
                (command, control.filename.clone())
            };

            match command {
                Command::Quit => break,
                Command::Stop => self.session.lock().close(),
                Command::Play => self.start(filename, 0.0),
                Command::Preview => self.start(filename, self.preview_offset),
            }
        }

        self.session.lock().close();
        tracing::debug!("playback worker exiting");
    }

    fn start(&self, filename: Option<PathBuf>, offset: f64) {
        let Some(path) = filename else {
            tracing::warn!("play requested without a track");
            return;
        };

        let Some(mut backend) = self.session.lock().take_for_load() else {
            tracing::error!("playback backend is missing");
            return;
        };
        // Decoding can take a while; the session stays unlocked meanwhile.
        let loaded = backend.load(&path);

        let mut session = self.session.lock();
        match session.install(backend, loaded, offset) {
            Ok(()) => {
                tracing::info!(path = %path.display(), length = session.length, offset, "track started");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "cannot play track");
            }
        }
    }
}

/// Thread-safe playback controller.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    /// Spawns the worker over `backend`. The backend's device must already
    /// be open.
    pub fn new<B>(backend: B, config: &PlaybackConfig) -> Result<Self>
    where
        B: PlaybackBackend + 'static,
    {
        config.validate()?;
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                command: None,
                filename: None,
                ready: false,
            }),
            wake: Condvar::new(),
            settled: Condvar::new(),
            session: Mutex::new(Session {
                backend: Some(Box::new(backend)),
                length: 0.0,
                volume: MAX_VOLUME,
                paused: false,
                active: false,
            }),
            preview_offset: config.preview_offset,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("playback".into())
            .spawn(move || worker_shared.run())?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Plays `filename` from the start, replacing whatever is playing.
    pub fn play_music(&self, filename: impl AsRef<Path>) {
        self.post(Command::Play, Some(filename.as_ref()));
    }

    /// Plays `filename` from the preview offset. Tracks no longer than the
    /// offset preview from the start.
    pub fn play_preview(&self, filename: impl AsRef<Path>) {
        self.post(Command::Preview, Some(filename.as_ref()));
    }

    /// Stops the current track, keeping its filename and length.
    pub fn stop_music(&self) {
        self.post(Command::Stop, None);
    }

    fn post(&self, command: Command, filename: Option<&Path>) {
        let mut control = self.shared.control.lock();
        match control.command {
            Some(Command::Quit) => return,
            Some(pending) => {
                tracing::debug!(?pending, ?command, "superseding unconsumed playback command");
            }
            None => {}
        }
        if let Some(filename) = filename {
            control.filename = Some(filename.to_path_buf());
        }
        control.command = Some(command);
        self.shared.wake.notify_one();
    }

    /// Blocks until the worker has acted on every posted command.
    pub fn wait(&self) {
        let mut control = self.shared.control.lock();
        while !control.ready || control.command.is_some() {
            self.shared.settled.wait(&mut control);
        }
    }

    /// Pauses or resumes the current track. Does nothing while idle.
    pub fn toggle_pause(&self) {
        let mut session = self.shared.session.lock();
        if !session.is_running() {
            return;
        }
        let paused = !session.paused;
        session.paused = paused;
        if let Some(backend) = session.backend.as_mut() {
            backend.pause(paused);
        }
    }

    /// `true` while a running track is paused.
    pub fn is_paused(&self) -> bool {
        let session = self.shared.session.lock();
        session.is_running() && session.paused
    }

    /// `true` from a successful start until stop, failure, or the end of the
    /// track.
    pub fn is_playing(&self) -> bool {
        self.shared.session.lock().is_running()
    }

    /// Length in seconds of the current track, 0 until one loads.
    pub fn length(&self) -> f64 {
        self.shared.session.lock().length
    }

    /// Playback position in seconds, or 0 when nothing is playing.
    pub fn position(&self) -> f64 {
        let session = self.shared.session.lock();
        let position = match session.backend.as_ref() {
            Some(backend) if session.is_running() => backend.position(),
            _ => return 0.0,
        };
        if position.is_finite() {
            position.max(0.0)
        } else {
            0.0
        }
    }

    /// Moves the playhead `delta` seconds, clamped to the track.
    pub fn seek(&self, delta: f64) {
        let mut session = self.shared.session.lock();
        if !session.is_running() || !delta.is_finite() {
            return;
        }
        let length = session.length;
        if let Some(backend) = session.backend.as_mut() {
            let current = backend.position();
            let target = (current + delta).clamp(0.0, length);
            backend.seek(target - current);
        }
    }

    /// Volume on the 0..=100 scale.
    pub fn volume(&self) -> u32 {
        self.shared.session.lock().volume
    }

    /// Sets the volume on the 0..=100 scale; larger values clamp.
    pub fn set_volume(&self, volume: u32) {
        let mut session = self.shared.session.lock();
        session.volume = volume.min(MAX_VOLUME);
        let gain = volume_gain(session.volume);
        // While a load has the backend, `install` applies the stored volume.
        if let Some(backend) = session.backend.as_mut() {
            backend.set_volume(gain);
        }
    }

    /// Track most recently requested with play or preview.
    pub fn filename(&self) -> Option<PathBuf> {
        self.shared.control.lock().filename.clone()
    }

    /// Stops playback and joins the worker. Called by `Drop`.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        {
            let mut control = self.shared.control.lock();
            control.command = Some(Command::Quit);
            self.shared.wake.notify_one();
        }

        if worker.join().is_err() {
            tracing::error!("playback worker panicked");
            self.shared.session.lock().close();
        }
    }
}

impl AudioClock for PlaybackEngine {
    fn position(&self) -> f64 {
        PlaybackEngine::position(self)
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.shared.session.lock();
        f.debug_struct("PlaybackEngine")
            .field("active", &session.active)
            .field("length", &session.length)
            .field("volume", &session.volume)
            .field("paused", &session.paused)
            .finish()
    }
}

fn volume_gain(volume: u32) -> f32 {
    volume.min(MAX_VOLUME) as f32 / MAX_VOLUME as f32
}

fn start_position(offset: f64, length: f64) -> f64 {
    if offset > 0.0 && offset < length {
        offset
    } else {
        0.0
    }
}
