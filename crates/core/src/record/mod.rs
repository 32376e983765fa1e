//! Live capture: one analyzer per input channel, fed straight from the
//! device callback.

#[cfg(feature = "device")]
mod device;
mod synthetic;

use std::{fmt, iter::FusedIterator, sync::Arc};

use crate::{Analyzer, AnalyzerConfig, Result, SpectralAnalyzer};

#[cfg(feature = "device")]
pub use device::DeviceCapture;
pub use synthetic::SyntheticCapture;

/// Callback handed to a [`CaptureDevice`]. Receives one interleaved buffer
/// per device period.
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Binding to an audio input device.
pub trait CaptureDevice {
    /// Sample rate the device actually runs at.
    fn sample_rate(&self) -> u32;

    /// Number of interleaved channels in every callback buffer.
    fn channels(&self) -> usize;

    /// Starts delivering buffers to `callback` on the device's own thread.
    fn start(&mut self, callback: CaptureCallback) -> Result<()>;

    /// Stops delivery. The callback is dropped before this returns.
    fn stop(&mut self);
}

/// One channel of an interleaved buffer, in original order.
#[derive(Debug, Clone)]
pub struct ChannelSamples<'a> {
    data: &'a [f32],
    next: usize,
    stride: usize,
}

impl<'a> ChannelSamples<'a> {
    /// Views channel `channel` of `data`, which interleaves `channels`
    /// channels. A trailing partial frame contributes the samples it has.
    pub fn new(data: &'a [f32], channel: usize, channels: usize) -> Self {
        debug_assert!(channel < channels.max(1));
        Self {
            data,
            next: channel,
            stride: channels.max(1),
        }
    }
}

impl Iterator for ChannelSamples<'_> {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let sample = *self.data.get(self.next)?;
        self.next += self.stride;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.len().saturating_sub(self.next);
        let len = remaining.div_ceil(self.stride);
        (len, Some(len))
    }
}

impl ExactSizeIterator for ChannelSamples<'_> {}

impl FusedIterator for ChannelSamples<'_> {}

/// Demultiplexes device buffers onto the analyzer bank. Runs on the device
/// thread: no locks, no allocation.
struct ChannelRouter {
    analyzers: Vec<Arc<dyn Analyzer>>,
}

impl ChannelRouter {
    fn route(&self, data: &[f32]) {
        let channels = self.analyzers.len();
        if data.is_empty() || channels == 0 {
            return;
        }
        for (channel, analyzer) in self.analyzers.iter().enumerate() {
            analyzer.input(ChannelSamples::new(data, channel, channels));
        }
    }
}

/// Owns an input device and the analyzers its channels feed.
pub struct CaptureEngine {
    device: Box<dyn CaptureDevice>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    sample_rate: u32,
    stopped: bool,
}

impl CaptureEngine {
    /// Creates one analyzer per device channel with `make_analyzer` (called
    /// with the device's sample rate) and starts the device.
    pub fn new<D, F>(device: D, mut make_analyzer: F) -> Result<Self>
    where
        D: CaptureDevice + 'static,
        F: FnMut(u32) -> Result<Arc<dyn Analyzer>>,
    {
        let mut device: Box<dyn CaptureDevice> = Box::new(device);
        let sample_rate = device.sample_rate();
        let channels = device.channels();

        let analyzers = (0..channels)
            .map(|_| make_analyzer(sample_rate))
            .collect::<Result<Vec<_>>>()?;

        let router = ChannelRouter {
            analyzers: analyzers.clone(),
        };
        device.start(Box::new(move |data: &[f32]| router.route(data)))?;
        tracing::info!(channels, sample_rate, "capture started");

        Ok(Self {
            device,
            analyzers,
            sample_rate,
            stopped: false,
        })
    }

    /// Captures into [`SpectralAnalyzer`]s.
    pub fn with_spectral<D>(device: D, config: &AnalyzerConfig) -> Result<Self>
    where
        D: CaptureDevice + 'static,
    {
        Self::new(device, |rate| {
            let analyzer: Arc<dyn Analyzer> = Arc::new(SpectralAnalyzer::new(rate, config)?);
            Ok(analyzer)
        })
    }

    /// The analyzer bank, indexed by channel.
    pub fn analyzers(&self) -> &[Arc<dyn Analyzer>] {
        &self.analyzers
    }

    pub fn channels(&self) -> usize {
        self.analyzers.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stops the device. The analyzer bank stays readable.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.device.stop();
        tracing::info!("capture stopped");
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("channels", &self.analyzers.len())
            .field("sample_rate", &self.sample_rate)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::Tone;

    #[derive(Default)]
    struct RecordingAnalyzer {
        samples: Mutex<Vec<f32>>,
    }

    impl Analyzer for RecordingAnalyzer {
        fn input(&self, samples: ChannelSamples<'_>) {
            self.samples.lock().extend(samples);
        }

        fn process(&self) {}

        fn find_tone(&self) -> Option<Tone> {
            None
        }
    }

    /// Device whose callback is driven by the test.
    struct ManualDevice {
        channels: usize,
        callback: Arc<Mutex<Option<CaptureCallback>>>,
        stopped: Arc<AtomicBool>,
    }

    impl CaptureDevice for ManualDevice {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn channels(&self) -> usize {
            self.channels
        }

        fn start(&mut self, callback: CaptureCallback) -> Result<()> {
            *self.callback.lock() = Some(callback);
            Ok(())
        }

        fn stop(&mut self) {
            self.callback.lock().take();
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    type Feed = Arc<Mutex<Option<CaptureCallback>>>;

    fn engine_with_recorders(
        channels: usize,
    ) -> (CaptureEngine, Vec<Arc<RecordingAnalyzer>>, Feed, Arc<AtomicBool>) {
        let callback = Arc::new(Mutex::new(None));
        let stopped = Arc::new(AtomicBool::new(false));
        let device = ManualDevice {
            channels,
            callback: callback.clone(),
            stopped: stopped.clone(),
        };

        let mut recorders = Vec::new();
        let engine = CaptureEngine::new(device, |_| {
            let recorder = Arc::new(RecordingAnalyzer::default());
            recorders.push(recorder.clone());
            let analyzer: Arc<dyn Analyzer> = recorder;
            Ok(analyzer)
        })
        .unwrap();

        (engine, recorders, callback, stopped)
    }

    fn deliver(feed: &Feed, data: &[f32]) {
        let mut slot = feed.lock();
        let callback = slot.as_mut().expect("device should be started");
        callback(data);
    }

    #[test]
    fn channel_view_strides_through_interleaved_data() {
        let data = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let left: Vec<f32> = ChannelSamples::new(&data, 0, 2).collect();
        let right = ChannelSamples::new(&data, 1, 2);

        assert_eq!(left, vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(right.len(), 3);
        assert_eq!(right.collect::<Vec<_>>(), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn routes_each_channel_to_its_analyzer() {
        let (engine, recorders, feed, _) = engine_with_recorders(2);
        assert_eq!(engine.channels(), 2);

        let buffer: Vec<f32> = (0..8)
            .flat_map(|frame| [frame as f32, 100.0 + frame as f32])
            .collect();
        deliver(&feed, &buffer);

        let left = recorders[0].samples.lock().clone();
        let right = recorders[1].samples.lock().clone();
        assert_eq!(left, (0..8).map(|f| f as f32).collect::<Vec<_>>());
        assert_eq!(right, (0..8).map(|f| 100.0 + f as f32).collect::<Vec<_>>());
    }

    #[test]
    fn preserves_order_across_buffers() {
        let (_engine, recorders, feed, _) = engine_with_recorders(3);
        deliver(&feed, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        deliver(&feed, &[7.0, 8.0, 9.0]);
        deliver(&feed, &[]);

        assert_eq!(*recorders[0].samples.lock(), vec![1.0, 4.0, 7.0]);
        assert_eq!(*recorders[1].samples.lock(), vec![2.0, 5.0, 8.0]);
        assert_eq!(*recorders[2].samples.lock(), vec![3.0, 6.0, 9.0]);
    }

    #[test]
    fn drop_stops_the_device() {
        let (engine, recorders, feed, stopped) = engine_with_recorders(2);
        drop(engine);

        assert!(stopped.load(Ordering::SeqCst));
        assert!(feed.lock().is_none());
        // Analyzers handed out earlier outlive the engine.
        assert!(recorders[0].samples.lock().is_empty());
    }
}
