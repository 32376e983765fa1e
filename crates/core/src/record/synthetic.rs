use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use super::{CaptureCallback, CaptureDevice};
use crate::{CaptureConfig, PitchSyncError, Result};

/// Capture device that "records" sine tones, one optional frequency per
/// channel, at real-time pace on its own thread.
#[derive(Debug)]
pub struct SyntheticCapture {
    sample_rate: u32,
    period_frames: usize,
    tones: Vec<Option<f64>>,
    amplitude: f32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticCapture {
    /// `tones[c]` is the frequency on channel `c`; missing entries and `None`
    /// are silent. Extra entries beyond `config.channels` are ignored.
    pub fn new(config: &CaptureConfig, tones: &[Option<f64>]) -> Self {
        let tones = (0..config.channels)
            .map(|channel| tones.get(channel).copied().flatten())
            .collect();

        Self {
            sample_rate: config.sample_rate,
            period_frames: config.period_frames.max(1),
            tones,
            amplitude: 0.5,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }
}

impl CaptureDevice for SyntheticCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.tones.len()
    }

    fn start(&mut self, mut callback: CaptureCallback) -> Result<()> {
        self.stop();
        if self.tones.is_empty() {
            return Err(PitchSyncError::Config(
                "synthetic capture needs at least one channel".into(),
            ));
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let rate = f64::from(self.sample_rate);
        let frames = self.period_frames;
        let steps: Vec<f64> = self
            .tones
            .iter()
            .map(|tone| tone.map_or(0.0, |freq| TAU * freq / rate))
            .collect();
        let silent: Vec<bool> = self.tones.iter().map(Option::is_none).collect();
        let amplitude = self.amplitude;
        let period = Duration::from_secs_f64(frames as f64 / rate);

        let worker = std::thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                let channels = steps.len();
                let mut buffer = vec![0.0f32; frames * channels];
                let mut phases = vec![0.0f64; channels];
                let started = Instant::now();
                let mut periods: u32 = 0;

                while running.load(Ordering::SeqCst) {
                    for frame in buffer.chunks_exact_mut(channels) {
                        for (channel, sample) in frame.iter_mut().enumerate() {
                            *sample = if silent[channel] {
                                0.0
                            } else {
                                amplitude * phases[channel].sin() as f32
                            };
                            phases[channel] = (phases[channel] + steps[channel]) % TAU;
                        }
                    }
                    callback(&buffer);

                    periods = periods.wrapping_add(1);
                    let due = started + period * periods;
                    let now = Instant::now();
                    if due > now {
                        std::thread::sleep(due - now);
                    }
                }
            })?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("synthetic capture thread panicked");
            }
        }
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn delivers_interleaved_periods_until_stopped() {
        let config = CaptureConfig {
            channels: 2,
            sample_rate: 8_000,
            period_frames: 80,
            ..CaptureConfig::default()
        };
        let mut device = SyntheticCapture::new(&config, &[Some(440.0)]);
        assert_eq!(device.channels(), 2);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        device
            .start(Box::new(move |data: &[f32]| sink.lock().push(data.to_vec())))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while received.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        device.stop();

        let received = received.lock();
        assert!(received.len() >= 3);
        let first = &received[0];
        assert_eq!(first.len(), 160);
        // Right channel is silent, left carries the tone.
        assert!(first.iter().skip(1).step_by(2).all(|&s| s == 0.0));
        assert!(first.iter().step_by(2).any(|&s| s.abs() > 0.1));
    }
}
