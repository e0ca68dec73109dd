//! CPAL Endpoint
//!
//! Hardware PCM streams over the cross-platform cpal transport. The core
//! crate supplies the period callbacks; this module only owns the stream
//! lifecycle and format negotiation (f32 interleaved).

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, Stream, StreamConfig};
use tracing::{error, info};

use crate::error::{PlatformError, PlatformResult};
use crate::traits::{DeviceInfo, EndpointConfig, EndpointDirection, PcmEndpoint};

/// Fills one chunk of interleaved f32 playback samples
pub type PlaybackCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Consumes one chunk of interleaved f32 capture samples
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// One opened cpal stream
///
/// The contained `cpal::Stream` is not `Send`; the endpoint must be created
/// and driven on the thread that owns the device.
pub struct CpalEndpoint {
    #[allow(dead_code)]
    stream: Stream,
    device_name: String,
    running: bool,
}

impl CpalEndpoint {
    /// Open a playback endpoint; `callback` is invoked from the audio thread
    /// to fill each buffer.
    pub fn open_playback(
        config: &EndpointConfig,
        mut callback: PlaybackCallback,
    ) -> PlatformResult<Self> {
        let device = find_device(config, EndpointDirection::Playback)?;
        let device_name = device_label(&device);
        let stream_config = to_stream_config(config);
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info| {
                    callback(data);
                },
                |err| error!(%err, "playback stream error"),
                None,
            )
            .map_err(|e| PlatformError::StreamBuildFailed(e.to_string()))?;
        info!(device = %device_name, "opened playback endpoint");
        Ok(Self {
            stream,
            device_name,
            running: false,
        })
    }

    /// Open a capture endpoint; `callback` receives each captured buffer.
    pub fn open_capture(
        config: &EndpointConfig,
        mut callback: CaptureCallback,
    ) -> PlatformResult<Self> {
        let device = find_device(config, EndpointDirection::Capture)?;
        let device_name = device_label(&device);
        let stream_config = to_stream_config(config);
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info| {
                    callback(data);
                },
                |err| error!(%err, "capture stream error"),
                None,
            )
            .map_err(|e| PlatformError::StreamBuildFailed(e.to_string()))?;
        info!(device = %device_name, "opened capture endpoint");
        Ok(Self {
            stream,
            device_name,
            running: false,
        })
    }
}

impl PcmEndpoint for CpalEndpoint {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn start(&mut self) -> PlatformResult<()> {
        self.stream
            .play()
            .map_err(|e| PlatformError::StreamStartFailed(e.to_string()))?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> PlatformResult<()> {
        self.stream
            .pause()
            .map_err(|e| PlatformError::StreamStopFailed(e.to_string()))?;
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

fn to_stream_config(config: &EndpointConfig) -> StreamConfig {
    StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.period_size),
    }
}

fn device_label(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "<unknown>".to_string())
}

fn find_device(config: &EndpointConfig, direction: EndpointDirection) -> PlatformResult<Device> {
    let host = cpal::default_host();
    match &config.device_name {
        None => {
            let device = match direction {
                EndpointDirection::Playback => host.default_output_device(),
                EndpointDirection::Capture => host.default_input_device(),
            };
            device.ok_or(PlatformError::NoDeviceAvailable)
        }
        Some(name) => {
            let mut devices = match direction {
                EndpointDirection::Playback => host
                    .output_devices()
                    .map_err(|e| PlatformError::Internal(e.to_string()))?,
                EndpointDirection::Capture => host
                    .input_devices()
                    .map_err(|e| PlatformError::Internal(e.to_string()))?,
            };
            devices
                .find(|device| device.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| PlatformError::DeviceNotFound(name.clone()))
        }
    }
}

/// Enumerate the hardware devices of both directions
pub fn enumerate_devices() -> PlatformResult<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let default_input = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                devices.push(DeviceInfo {
                    is_default: Some(&name) == default_output.as_ref(),
                    name,
                    direction: EndpointDirection::Playback,
                });
            }
        }
    }
    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(DeviceInfo {
                    is_default: Some(&name) == default_input.as_ref(),
                    name,
                    direction: EndpointDirection::Capture,
                });
            }
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hardware-dependent tests
    #[test]
    #[ignore = "requires audio hardware"]
    fn test_enumerate_devices() {
        let devices = enumerate_devices().unwrap();
        assert!(!devices.is_empty());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_playback() {
        let config = EndpointConfig::default();
        let mut endpoint =
            CpalEndpoint::open_playback(&config, Box::new(|data| data.fill(0.0))).unwrap();
        endpoint.start().unwrap();
        assert!(endpoint.is_running());
        endpoint.stop().unwrap();
    }

    #[test]
    fn test_unknown_device_rejected() {
        let config = EndpointConfig {
            device_name: Some("no-such-device-xbar".to_string()),
            ..Default::default()
        };
        let result = CpalEndpoint::open_playback(&config, Box::new(|_| {}));
        assert!(result.is_err());
    }
}
