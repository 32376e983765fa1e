//! Output through cpal, tracks decoded with symphonia.

use std::{
    fs::File,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};

use super::PlaybackBackend;
use crate::{PitchSyncError, Result};

/// Wrapper to hold a `cpal::Stream` in a `Send` context.
struct StreamHandle(cpal::Stream);

// SAFETY: the stream is created by `start` and dropped by `stop`, and the
// owning `DeviceOutput` is only ever used by one thread at a time: behind the
// playback engine's session mutex, or by the worker while it loads.
unsafe impl Send for StreamHandle {}

/// Whole track decoded to interleaved f32.
struct DecodedTrack {
    samples: Vec<f32>,
    channels: usize,
    sample_rate: u32,
}

impl DecodedTrack {
    fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    fn length(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// State shared with the output callback.
struct Playhead {
    /// Fractional source frame, f64 bits.
    frame: AtomicU64,
    paused: AtomicBool,
    /// Linear gain, f32 bits.
    gain: AtomicU32,
    finished: AtomicBool,
}

impl Playhead {
    fn new() -> Self {
        Self {
            frame: AtomicU64::new(0.0f64.to_bits()),
            paused: AtomicBool::new(false),
            gain: AtomicU32::new(1.0f32.to_bits()),
            finished: AtomicBool::new(false),
        }
    }

    fn frame(&self) -> f64 {
        f64::from_bits(self.frame.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.frame.store(0.0f64.to_bits(), Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }
}

/// Playback backend over the system's audio output.
pub struct DeviceOutput {
    device_name: Option<String>,
    config: cpal::StreamConfig,
    track: Option<Arc<DecodedTrack>>,
    playhead: Arc<Playhead>,
    stream: Option<StreamHandle>,
}

impl DeviceOutput {
    /// Opens the named output device, or the system default.
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let device = output_device(device_name)?;
        let config = output_config(&device)?;
        tracing::info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            rate = config.sample_rate.0,
            channels = config.channels,
            "opened output device"
        );

        Ok(Self {
            device_name: device_name.map(str::to_string),
            config,
            track: None,
            playhead: Arc::new(Playhead::new()),
            stream: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl PlaybackBackend for DeviceOutput {
    fn load(&mut self, path: &Path) -> Result<f64> {
        self.stop();
        let track = decode_track(path)?;
        let length = track.length();
        tracing::debug!(
            path = %path.display(),
            rate = track.sample_rate,
            channels = track.channels,
            length,
            "decoded track"
        );
        self.playhead.reset();
        self.track = Some(Arc::new(track));
        Ok(length)
    }

    fn start(&mut self) -> Result<()> {
        let track = self
            .track
            .clone()
            .ok_or_else(|| PitchSyncError::msg("no track loaded"))?;
        let device = output_device(self.device_name.as_deref())?;

        let playhead = self.playhead.clone();
        let channels = usize::from(self.config.channels).max(1);
        let ratio = f64::from(track.sample_rate) / f64::from(self.config.sample_rate.0);

        let stream = device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    render(&track, &playhead, data, channels, ratio)
                },
                |err| tracing::warn!(%err, "output stream error"),
                None,
            )
            .map_err(PitchSyncError::device)?;
        stream.play().map_err(PitchSyncError::device)?;

        self.stream = Some(StreamHandle(stream));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(StreamHandle(stream)) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(%err, "output stream did not pause before close");
            }
        }
        self.track = None;
        self.playhead.reset();
    }

    fn pause(&mut self, paused: bool) {
        self.playhead.paused.store(paused, Ordering::Release);
    }

    fn seek(&mut self, delta: f64) {
        let Some(track) = &self.track else {
            return;
        };
        let rate = f64::from(track.sample_rate);
        let target = (self.playhead.frame() / rate + delta).clamp(0.0, track.length());
        let frame = target * rate;
        self.playhead.frame.store(frame.to_bits(), Ordering::Release);
        self.playhead
            .finished
            .store(frame as usize >= track.frames(), Ordering::Release);
    }

    fn position(&self) -> f64 {
        match &self.track {
            Some(track) => {
                (self.playhead.frame() / f64::from(track.sample_rate)).min(track.length())
            }
            None => 0.0,
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.playhead
            .gain
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.stream.is_some() && self.playhead.finished.load(Ordering::Acquire)
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fills one device buffer. Runs on the device thread.
fn render(track: &DecodedTrack, playhead: &Playhead, out: &mut [f32], channels: usize, ratio: f64) {
    if playhead.paused.load(Ordering::Acquire) {
        out.fill(0.0);
        return;
    }

    let start = playhead.frame.load(Ordering::Acquire);
    let gain = f32::from_bits(playhead.gain.load(Ordering::Relaxed));
    let frames = track.frames();
    let mut cursor = f64::from_bits(start);

    for frame in out.chunks_mut(channels) {
        let index = cursor as usize;
        if index >= frames {
            frame.fill(0.0);
            playhead.finished.store(true, Ordering::Release);
            continue;
        }
        let base = index * track.channels;
        for (channel, sample) in frame.iter_mut().enumerate() {
            *sample = track.samples[base + channel % track.channels] * gain;
        }
        cursor += ratio;
    }

    // A seek that landed during this buffer wins over our advance.
    let _ = playhead.frame.compare_exchange(
        start,
        cursor.to_bits(),
        Ordering::AcqRel,
        Ordering::Relaxed,
    );
}

fn decode_track(path: &Path) -> Result<DecodedTrack> {
    let file = File::open(path).map_err(|err| PitchSyncError::decode(path, err))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|err| PitchSyncError::decode(path, err))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| PitchSyncError::decode(path, "no audio track"))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| PitchSyncError::decode(path, err))?;

    let mut samples = Vec::new();
    let mut spec = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(PitchSyncError::decode(path, err)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let signal = *decoded.spec();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, signal);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
                spec.get_or_insert(signal);
            }
            Err(SymphoniaError::DecodeError(err)) => {
                tracing::debug!(path = %path.display(), err, "skipping corrupt packet");
            }
            Err(err) => return Err(PitchSyncError::decode(path, err)),
        }
    }

    let spec = spec.ok_or_else(|| PitchSyncError::decode(path, "no decodable audio"))?;
    Ok(DecodedTrack {
        samples,
        channels: spec.channels.count().max(1),
        sample_rate: spec.rate,
    })
}

fn output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(PitchSyncError::device)?
            .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| PitchSyncError::Device(format!("output device '{wanted}' not found"))),
        None => host
            .default_output_device()
            .ok_or_else(|| PitchSyncError::Device("no default output device".into())),
    }
}

fn output_config(device: &cpal::Device) -> Result<cpal::StreamConfig> {
    let default = device
        .default_output_config()
        .map_err(PitchSyncError::device)?;
    if default.sample_format() == cpal::SampleFormat::F32 {
        return Ok(default.config());
    }

    let rate = default.sample_rate();
    device
        .supported_output_configs()
        .map_err(PitchSyncError::device)?
        .find(|range| {
            range.sample_format() == cpal::SampleFormat::F32
                && range.min_sample_rate() <= rate
                && rate <= range.max_sample_rate()
        })
        .map(|range| range.with_sample_rate(rate).config())
        .ok_or_else(|| PitchSyncError::Device("output device offers no f32 format".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_track() -> DecodedTrack {
        DecodedTrack {
            samples: (0..8).map(|n| n as f32).collect(),
            channels: 1,
            sample_rate: 4,
        }
    }

    #[test]
    fn render_duplicates_mono_and_advances() {
        let track = ramp_track();
        let playhead = Playhead::new();
        let mut out = [0.0f32; 6];

        render(&track, &playhead, &mut out, 2, 1.0);

        assert_eq!(out, [0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(playhead.frame(), 3.0);
        assert!(!playhead.finished.load(Ordering::Acquire));
    }

    #[test]
    fn render_pads_silence_past_the_end() {
        let track = ramp_track();
        let playhead = Playhead::new();
        playhead.frame.store(6.0f64.to_bits(), Ordering::Release);
        let mut out = [9.0f32; 4];

        render(&track, &playhead, &mut out, 1, 1.0);

        assert_eq!(out, [6.0, 7.0, 0.0, 0.0]);
        assert!(playhead.finished.load(Ordering::Acquire));
    }

    #[test]
    fn paused_render_is_silent_and_still() {
        let track = ramp_track();
        let playhead = Playhead::new();
        playhead.paused.store(true, Ordering::Release);
        let mut out = [1.0f32; 4];

        render(&track, &playhead, &mut out, 1, 1.0);

        assert_eq!(out, [0.0; 4]);
        assert_eq!(playhead.frame(), 0.0);
    }
}
