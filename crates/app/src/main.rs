use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use pitchsync_core::{
    AppConfig, AudioClock, CaptureEngine, PitchSyncError, PlaybackEngine, Player, SyncEngine,
    SyntheticCapture, VirtualOutput,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> pitchsync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Simulate {
            length,
            tones,
            preview,
        } => run_simulate(&config, length, &tones, preview),
        #[cfg(feature = "device")]
        Commands::Sing { track, preview } => run_sing(&config, &track, preview),
    }
}

fn run_simulate(
    config: &AppConfig,
    length: f64,
    tones: &[f64],
    preview: bool,
) -> pitchsync_core::Result<()> {
    tracing::info!(length, ?tones, preview, "starting simulation");

    let track = PathBuf::from("simulated-track");
    let output = VirtualOutput::new().with_track(&track, length);
    let audio = Arc::new(PlaybackEngine::new(output, &config.playback)?);

    let mut capture_config = config.capture.clone();
    capture_config.channels = tones.len().max(1);
    // Zero or negative frequencies stand for a silent singer.
    let voices: Vec<Option<f64>> = tones.iter().map(|&freq| (freq > 0.0).then_some(freq)).collect();
    let capture = CaptureEngine::with_spectral(
        SyntheticCapture::new(&capture_config, &voices),
        &config.analysis,
    )?;

    run_session(audio, &capture, config, &track, preview)
}

#[cfg(feature = "device")]
fn run_sing(config: &AppConfig, track: &Path, preview: bool) -> pitchsync_core::Result<()> {
    use pitchsync_core::{DeviceCapture, DeviceOutput};

    tracing::info!(track = %track.display(), preview, "starting session");

    let output = DeviceOutput::open(config.playback.device.as_deref())?;
    let audio = Arc::new(PlaybackEngine::new(output, &config.playback)?);
    let capture =
        CaptureEngine::with_spectral(DeviceCapture::open(&config.capture)?, &config.analysis)?;

    run_session(audio, &capture, config, track, preview)
}

fn run_session(
    audio: Arc<PlaybackEngine>,
    capture: &CaptureEngine,
    config: &AppConfig,
    track: &Path,
    preview: bool,
) -> pitchsync_core::Result<()> {
    audio.wait();

    let clock: Arc<dyn AudioClock> = audio.clone();
    let mut sync = SyncEngine::new(clock, capture.analyzers().iter().cloned(), &config.sync)?;

    if preview {
        audio.play_preview(track);
    } else {
        audio.play_music(track);
    }
    audio.wait();

    if !audio.is_playing() {
        return Err(PitchSyncError::msg(format!(
            "could not play {}",
            track.display()
        )));
    }
    tracing::info!(length = audio.length(), "playing");

    while audio.is_playing() {
        std::thread::sleep(Duration::from_millis(250));
        tracing::debug!(position = audio.position(), steps = sync.steps(), "progress");
    }
    sync.shutdown();

    let report = SessionReport::new(&sync.players(), config.sync.timestep);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Serialize)]
struct SessionReport {
    timestep: f64,
    players: Vec<PlayerReport>,
}

#[derive(Debug, Serialize)]
struct PlayerReport {
    player: usize,
    samples: usize,
    voiced: usize,
    median_freq: Option<f64>,
    score: f64,
}

impl SessionReport {
    fn new(players: &[Player], timestep: f64) -> Self {
        let players = players
            .iter()
            .enumerate()
            .map(|(index, player)| {
                let mut voiced: Vec<f64> = player
                    .pitch()
                    .iter()
                    .filter(|sample| sample.is_voiced())
                    .map(|sample| sample.freq)
                    .collect();
                voiced.sort_by(f64::total_cmp);

                PlayerReport {
                    player: index,
                    samples: player.len(),
                    voiced: voiced.len(),
                    median_freq: voiced.get(voiced.len() / 2).copied(),
                    score: player.score(),
                }
            })
            .collect();

        Self { timestep, players }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Pitch tracking synchronised to music playback", long_about = None)]
struct Cli {
    /// JSON configuration file; missing fields use defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the whole pipeline without audio hardware.
    Simulate {
        /// Length of the virtual track in seconds.
        #[arg(short, long, default_value_t = 5.0)]
        length: f64,
        /// One synthetic voice per channel, in Hz (0 for silence).
        #[arg(short, long, value_delimiter = ',', default_values_t = vec![220.0, 330.0])]
        tones: Vec<f64>,
        /// Start at the preview offset instead of the beginning.
        #[arg(long)]
        preview: bool,
    },
    /// Play a track and track the singers on the default devices.
    #[cfg(feature = "device")]
    Sing {
        /// Audio file to play.
        track: PathBuf,
        #[arg(long)]
        preview: bool,
    },
}
