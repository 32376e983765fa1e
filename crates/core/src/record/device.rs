//! Live input through cpal.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{CaptureCallback, CaptureDevice};
use crate::{CaptureConfig, PitchSyncError, Result};

/// Input device opened through cpal's default host.
pub struct DeviceCapture {
    device: cpal::Device,
    name: String,
    config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
}

impl DeviceCapture {
    /// Opens the named input device, or the system default.
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        let device = input_device(config.device.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let channels = u16::try_from(config.channels)
            .map_err(|_| PitchSyncError::Config(format!("{} channels", config.channels)))?;

        tracing::info!(device = %name, channels, rate = config.sample_rate, "opening input device");

        Ok(Self {
            device,
            name,
            config: cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            stream: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl CaptureDevice for DeviceCapture {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> usize {
        usize::from(self.config.channels)
    }

    fn start(&mut self, mut callback: CaptureCallback) -> Result<()> {
        self.stop();
        let name = self.name.clone();
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| callback(data),
                move |err| tracing::warn!(device = %name, %err, "input stream error"),
                None,
            )
            .map_err(PitchSyncError::device)?;
        stream.play().map_err(PitchSyncError::device)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(%err, "input stream did not pause before close");
            }
        }
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(PitchSyncError::device)?
            .find(|device| device.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| PitchSyncError::Device(format!("input device '{wanted}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| PitchSyncError::Device("no default input device".into())),
    }
}
