use std::{f32::consts::PI, fmt, sync::Arc};

use parking_lot::Mutex;
use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use rtrb::{Consumer, Producer, RingBuffer};

use super::{Analyzer, Tone};
use crate::{AnalyzerConfig, ChannelSamples, Result};

/// Ratio of half a semitone. Consecutive peaks closer than this are treated
/// as the same held tone.
const HALF_SEMITONE: f64 = 1.029_302_236_643_492;
const STABLE_SMOOTHING: f64 = 0.25;
const MIN_MAGNITUDE: f64 = 1e-12;

/// FFT peak-picking analyzer.
///
/// The capture side only touches the ring buffer producer, the scheduling
/// side only the detector state, so the two never contend for a lock.
pub struct SpectralAnalyzer {
    sample_rate: u32,
    producer: Mutex<Producer<f32>>,
    state: Mutex<DetectorState>,
}

impl SpectralAnalyzer {
    pub fn new(sample_rate: u32, config: &AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        let (producer, consumer) = RingBuffer::new(config.buffer_capacity);
        let fft = FftResources::new(config.fft_size);

        Ok(Self {
            sample_rate,
            producer: Mutex::new(producer),
            state: Mutex::new(DetectorState {
                consumer,
                config: config.clone(),
                sample_rate: f64::from(sample_rate),
                window: vec![0.0; config.fft_size],
                write_index: 0,
                filled: 0,
                fresh: 0,
                fft,
                tone: None,
            }),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Analyzer for SpectralAnalyzer {
    fn input(&self, samples: ChannelSamples<'_>) {
        // Only the capture callback produces, so this never actually fails;
        // if it did, the block is dropped rather than waited for.
        let Some(mut producer) = self.producer.try_lock() else {
            return;
        };
        for sample in samples {
            if producer.push(sample).is_err() {
                break;
            }
        }
    }

    fn process(&self) {
        let mut state = self.state.lock();
        if let Err(err) = state.process() {
            tracing::warn!(%err, "spectral analysis failed");
            state.tone = None;
        }
    }

    fn find_tone(&self) -> Option<Tone> {
        self.state.lock().tone
    }
}

struct DetectorState {
    consumer: Consumer<f32>,
    config: AnalyzerConfig,
    sample_rate: f64,
    /// Circular window of the most recent `fft_size` samples.
    window: Vec<f32>,
    write_index: usize,
    filled: usize,
    fresh: usize,
    fft: FftResources,
    tone: Option<Tone>,
}

impl DetectorState {
    fn process(&mut self) -> Result<()> {
        let len = self.window.len();
        while let Ok(sample) = self.consumer.pop() {
            self.window[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % len;
            self.filled = (self.filled + 1).min(len);
            self.fresh += 1;
        }

        if self.filled < len || self.fresh < self.config.hop_size {
            return Ok(());
        }
        self.fresh = 0;
        self.analyse()
    }

    fn analyse(&mut self) -> Result<()> {
        let len = self.window.len();
        let fft = &mut self.fft;

        // Oldest sample first.
        for index in 0..len {
            let sample = self.window[(self.write_index + index) % len];
            fft.input[index] = sample * fft.hann[index];
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let bin_hz = self.sample_rate / len as f64;
        let last_bin = fft.spectrum.len() - 2;
        let low = ((self.config.min_frequency / bin_hz).floor() as usize).max(1);
        let high = ((self.config.max_frequency / bin_hz).ceil() as usize).min(last_bin);
        if low >= high {
            self.tone = None;
            return Ok(());
        }

        let magnitude = |bin: usize| f64::from(fft.spectrum[bin].norm());
        let (peak, peak_magnitude) = (low..=high)
            .map(|bin| (bin, magnitude(bin)))
            .fold((low, 0.0), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        let amplitude = 2.0 * peak_magnitude / fft.window_gain;
        let db = 20.0 * amplitude.max(MIN_MAGNITUDE).log10();
        if db < self.config.min_level_db {
            self.tone = None;
            return Ok(());
        }

        let offset = parabolic_offset(
            magnitude(peak - 1),
            peak_magnitude,
            magnitude(peak + 1),
        );
        let freq = (peak as f64 + offset) * bin_hz;

        let stable_db = match self.tone {
            Some(previous) if same_tone(previous.freq, freq) => {
                previous.stable_db + (db - previous.stable_db) * STABLE_SMOOTHING
            }
            _ => db,
        };

        self.tone = Some(Tone {
            freq,
            db,
            stable_db,
        });
        Ok(())
    }
}

/// Vertex of the parabola through three log-magnitudes, in bins relative to
/// the middle one.
fn parabolic_offset(left: f64, centre: f64, right: f64) -> f64 {
    let (a, b, c) = (
        left.max(MIN_MAGNITUDE).ln(),
        centre.max(MIN_MAGNITUDE).ln(),
        right.max(MIN_MAGNITUDE).ln(),
    );
    let denominator = a - 2.0 * b + c;
    if denominator.abs() <= f64::EPSILON {
        return 0.0;
    }
    (0.5 * (a - c) / denominator).clamp(-0.5, 0.5)
}

fn same_tone(previous: f64, current: f64) -> bool {
    let ratio = current / previous;
    ratio.is_finite() && (1.0 / HALF_SEMITONE..=HALF_SEMITONE).contains(&ratio)
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
    hann: Vec<f32>,
    window_gain: f64,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let hann: Vec<f32> = (0..size).map(|index| hann_value(index, size)).collect();
        let window_gain = hann.iter().map(|&w| f64::from(w)).sum::<f64>().max(1.0);

        Self {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
            hann,
            window_gain,
        }
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

impl fmt::Debug for SpectralAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyzer")
            .field("sample_rate", &self.sample_rate)
            .field("tone", &self.find_tone())
            .finish()
    }
}
