//! Pitch history aligned to the playback clock.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Analyzer, Result, SyncConfig};

/// Seconds of playback between two pitch samples.
pub const TIMESTEP: f64 = 0.01;

/// Source of the playback time the scheduler follows.
pub trait AudioClock: Send + Sync {
    /// Seconds into the current track; 0 when nothing is playing.
    fn position(&self) -> f64;
}

/// One entry of a player's pitch history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchSample {
    /// Hz, NaN when no tone was found.
    pub freq: f64,
    /// dB, negative infinity when no tone was found.
    pub stable_db: f64,
}

impl PitchSample {
    pub const SILENT: Self = Self {
        freq: f64::NAN,
        stable_db: f64::NEG_INFINITY,
    };

    /// `false` for the no-tone placeholder.
    pub fn is_voiced(&self) -> bool {
        !self.freq.is_nan()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

const PLAYER_COLORS: [Color; 4] = [
    Color {
        r: 52.0 / 255.0,
        g: 101.0 / 255.0,
        b: 164.0 / 255.0,
    },
    Color {
        r: 1.0,
        g: 0.3,
        b: 0.3,
    },
    Color {
        r: 0.3,
        g: 0.8,
        b: 0.3,
    },
    Color {
        r: 0.9,
        g: 0.7,
        b: 0.2,
    },
];

/// A singer: one analyzer and the pitch history sampled from it.
#[derive(Clone)]
pub struct Player {
    analyzer: Arc<dyn Analyzer>,
    color: Color,
    pitch: Vec<PitchSample>,
    score: f64,
}

impl Player {
    fn new(analyzer: Arc<dyn Analyzer>, index: usize) -> Self {
        Self {
            analyzer,
            color: PLAYER_COLORS[index % PLAYER_COLORS.len()],
            pitch: Vec::new(),
            score: 0.0,
        }
    }

    fn update(&mut self) {
        let sample = match self.analyzer.find_tone() {
            Some(tone) => PitchSample {
                freq: tone.freq,
                stable_db: tone.stable_db,
            },
            None => PitchSample::SILENT,
        };
        self.pitch.push(sample);
    }

    /// One sample per completed step, oldest first.
    pub fn pitch(&self) -> &[PitchSample] {
        &self.pitch
    }

    /// Number of samples recorded so far.
    pub fn len(&self) -> usize {
        self.pitch.len()
    }

    /// `true` before the first step.
    pub fn is_empty(&self) -> bool {
        self.pitch.is_empty()
    }

    /// Display color, assigned by player index.
    pub fn color(&self) -> Color {
        self.color
    }

    /// Running score accumulator.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Analyzer this player is sampled from.
    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.analyzer
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("color", &self.color)
            .field("pitch", &self.pitch.len())
            .field("score", &self.score)
            .finish()
    }
}

struct Roster {
    players: Vec<Player>,
    steps: usize,
}

struct SyncShared {
    roster: Mutex<Roster>,
    quit: AtomicBool,
}

/// Samples every player's analyzer once per `timestep` of playback time.
pub struct SyncEngine {
    shared: Arc<SyncShared>,
    worker: Option<JoinHandle<()>>,
}

impl SyncEngine {
    /// Starts scheduling over `analyzers`, one player each, in order.
    pub fn new<I>(clock: Arc<dyn AudioClock>, analyzers: I, config: &SyncConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn Analyzer>>,
    {
        config.validate()?;

        let players: Vec<Player> = analyzers
            .into_iter()
            .enumerate()
            .map(|(index, analyzer)| Player::new(analyzer, index))
            .collect();
        let analyzers: Vec<Arc<dyn Analyzer>> =
            players.iter().map(|player| player.analyzer.clone()).collect();
        let player_count = players.len();

        let shared = Arc::new(SyncShared {
            roster: Mutex::new(Roster { players, steps: 0 }),
            quit: AtomicBool::new(false),
        });

        let scheduler = Scheduler {
            shared: shared.clone(),
            clock,
            analyzers,
            timestep: config.timestep,
            wake_ahead: config.wake_ahead,
        };
        let worker = std::thread::Builder::new()
            .name("pitch-sync".into())
            .spawn(move || scheduler.run())?;

        tracing::info!(players = player_count, timestep = config.timestep, "pitch sync started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Copy of every player, taken between steps.
    pub fn players(&self) -> Vec<Player> {
        self.shared.roster.lock().players.clone()
    }

    /// Number of completed steps.
    pub fn steps(&self) -> usize {
        self.shared.roster.lock().steps
    }

    /// Stops and joins the worker. Called by `Drop`.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.quit.store(true, Ordering::SeqCst);
        worker.thread().unpark();
        if worker.join().is_err() {
            tracing::error!("pitch sync worker panicked");
        }
        tracing::info!(steps = self.steps(), "pitch sync stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roster = self.shared.roster.lock();
        f.debug_struct("SyncEngine")
            .field("players", &roster.players.len())
            .field("steps", &roster.steps)
            .finish()
    }
}

struct Scheduler {
    shared: Arc<SyncShared>,
    clock: Arc<dyn AudioClock>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    timestep: f64,
    wake_ahead: f64,
}

impl Scheduler {
    fn run(self) {
        let mut step: usize = 0;
        let mut last_position = 0.0;

        while !self.shared.quit.load(Ordering::SeqCst) {
            for analyzer in &self.analyzers {
                analyzer.process();
            }

            let position = self.read_clock(&mut last_position);
            let time_left = step as f64 * self.timestep - position;
            if time_left > 0.0 {
                std::thread::park_timeout(self.pause_for(time_left));
                continue;
            }

            let mut roster = self.shared.roster.lock();
            for player in roster.players.iter_mut() {
                player.update();
            }
            step += 1;
            roster.steps = step;
            tracing::trace!(step, position, "pitch step");
        }
    }

    fn read_clock(&self, last_position: &mut f64) -> f64 {
        let position = self.clock.position();
        if !position.is_finite() {
            tracing::debug!(position, "ignoring non-finite playback position");
            return *last_position;
        }
        if position + self.timestep < *last_position {
            tracing::debug!(from = *last_position, to = position, "playback clock moved backwards");
        }
        *last_position = position;
        position
    }

    /// Never longer than one step, and short of the boundary so it is
    /// re-checked rather than overslept.
    fn pause_for(&self, time_left: f64) -> Duration {
        let seconds = self.timestep.min(time_left * self.wake_ahead).max(0.0);
        Duration::from_secs_f64(seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU64,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{ChannelSamples, Tone};

    /// Clock the test moves by hand.
    #[derive(Default)]
    struct ManualClock {
        bits: AtomicU64,
    }

    impl ManualClock {
        fn set(&self, seconds: f64) {
            self.bits.store(seconds.to_bits(), Ordering::SeqCst);
        }
    }

    impl AudioClock for ManualClock {
        fn position(&self) -> f64 {
            f64::from_bits(self.bits.load(Ordering::SeqCst))
        }
    }

    /// Analyzer that always reports the same tone, or none.
    struct FixedAnalyzer {
        tone: Option<Tone>,
        processed: AtomicU64,
    }

    impl FixedAnalyzer {
        fn new(freq: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                tone: freq.map(|freq| Tone {
                    freq,
                    db: -10.0,
                    stable_db: -12.0,
                }),
                processed: AtomicU64::new(0),
            })
        }
    }

    impl Analyzer for FixedAnalyzer {
        fn input(&self, _samples: ChannelSamples<'_>) {}

        fn process(&self) {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        fn find_tone(&self) -> Option<Tone> {
            self.tone
        }
    }

    fn engine(
        clock: &Arc<ManualClock>,
        analyzers: &[Arc<FixedAnalyzer>],
        timestep: f64,
    ) -> SyncEngine {
        let clock: Arc<dyn AudioClock> = clock.clone();
        let analyzers = analyzers
            .iter()
            .map(|analyzer| analyzer.clone() as Arc<dyn Analyzer>);
        SyncEngine::new(clock, analyzers, &SyncConfig::with_timestep(timestep)).unwrap()
    }

    fn wait_for_steps(sync: &SyncEngine, steps: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if sync.steps() >= steps {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn samples_once_per_elapsed_step() {
        let clock = Arc::new(ManualClock::default());
        let voiced = FixedAnalyzer::new(Some(220.0));
        let silent = FixedAnalyzer::new(None);
        let sync = engine(&clock, &[voiced.clone(), silent.clone()], 0.1);

        clock.set(0.95);
        assert!(wait_for_steps(&sync, 10));
        std::thread::sleep(Duration::from_millis(100));

        let players = sync.players();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].len(), 10);
        assert_eq!(players[1].len(), 10);
        assert!(players[0].pitch().iter().all(|s| s.freq == 220.0 && s.stable_db == -12.0));
        assert!(players[1]
            .pitch()
            .iter()
            .all(|s| s.freq.is_nan() && s.stable_db == f64::NEG_INFINITY));
        assert!(voiced.processed.load(Ordering::SeqCst) > 0);
        assert!(silent.processed.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn follows_a_linearly_advancing_clock() {
        let clock = Arc::new(ManualClock::default());
        let analyzers = [FixedAnalyzer::new(Some(330.0)), FixedAnalyzer::new(Some(440.0))];
        let sync = engine(&clock, &analyzers, 0.1);

        for tick in 0..=19 {
            clock.set(tick as f64 * 0.05);
            std::thread::sleep(Duration::from_millis(10));
            let players = sync.players();
            assert_eq!(players[0].len(), players[1].len());
        }
        assert!(wait_for_steps(&sync, 10));
        std::thread::sleep(Duration::from_millis(50));

        // Boundaries 0.0, 0.1, ..., 0.9 have passed by 0.95.
        let players = sync.players();
        assert_eq!(players[0].len(), 10);
        assert_eq!(players[1].len(), 10);
        assert_eq!(sync.steps(), 10);
    }

    #[test]
    fn regressing_clock_pauses_sampling() {
        let clock = Arc::new(ManualClock::default());
        let analyzers = [FixedAnalyzer::new(Some(200.0))];
        let sync = engine(&clock, &analyzers, 0.1);

        clock.set(0.45);
        assert!(wait_for_steps(&sync, 5));
        clock.set(0.1);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sync.steps(), 5);

        clock.set(f64::NAN);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sync.steps(), 5);

        clock.set(0.65);
        assert!(wait_for_steps(&sync, 7));
    }

    #[test]
    fn snapshot_is_independent_of_later_steps() {
        let clock = Arc::new(ManualClock::default());
        let analyzers = [FixedAnalyzer::new(Some(200.0))];
        let sync = engine(&clock, &analyzers, 0.1);

        clock.set(0.25);
        assert!(wait_for_steps(&sync, 3));
        let before = sync.players();

        clock.set(0.55);
        assert!(wait_for_steps(&sync, 6));
        assert_eq!(before[0].len(), 3);
        assert_eq!(sync.players()[0].len(), 6);
    }

    #[test]
    fn colors_cycle_past_the_palette() {
        let clock = Arc::new(ManualClock::default());
        let analyzers: Vec<_> = (0..6).map(|_| FixedAnalyzer::new(None)).collect();
        let sync = engine(&clock, &analyzers, 0.1);

        let players = sync.players();
        assert_eq!(players.len(), 6);
        assert_eq!(players[0].color(), players[4].color());
        assert_ne!(players[0].color(), players[1].color());
        assert_eq!(players[0].score(), 0.0);
    }

    #[test]
    fn drop_wakes_a_sleeping_worker() {
        let clock = Arc::new(ManualClock::default());
        let analyzers = [FixedAnalyzer::new(None)];
        // Long step: the worker is parked when dropped.
        let sync = engine(&clock, &analyzers, 5.0);
        assert!(wait_for_steps(&sync, 1));

        let started = Instant::now();
        drop(sync);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn rejects_invalid_timestep() {
        let clock: Arc<dyn AudioClock> = Arc::new(ManualClock::default());
        let result = SyncEngine::new(clock, Vec::<Arc<dyn Analyzer>>::new(), &SyncConfig::with_timestep(0.0));
        assert!(result.is_err());
    }
}
