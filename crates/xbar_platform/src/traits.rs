//! Endpoint Contract
//!
//! A PCM endpoint is one opened hardware stream. The core crate drives
//! endpoints exclusively through this contract so that the transport layer
//! stays swappable.

use serde::{Deserialize, Serialize};

use crate::error::PlatformResult;

/// Direction of a PCM endpoint, seen from the crossbar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// The crossbar writes samples to the device (speakers)
    Playback,
    /// The crossbar reads samples from the device (microphone, line-in)
    Capture,
}

/// Requested configuration of a PCM endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// OS device name; `None` selects the default device of the direction
    pub device_name: Option<String>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames per period; the endpoint requests this as its buffer size
    pub period_size: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            channels: 2,
            sample_rate: 48_000,
            period_size: 512,
        }
    }
}

/// Description of one enumerated hardware device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub direction: EndpointDirection,
    pub is_default: bool,
}

/// An opened hardware stream
pub trait PcmEndpoint {
    /// OS name of the underlying device
    fn device_name(&self) -> &str;

    /// Start the sample flow
    fn start(&mut self) -> PlatformResult<()>;

    /// Pause the sample flow; the endpoint stays opened
    fn stop(&mut self) -> PlatformResult<()>;

    fn is_running(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EndpointConfig::default();
        assert_eq!(config.channels, 2);
        assert_eq!(config.sample_rate, 48_000);
        assert!(config.device_name.is_none());
    }

    #[test]
    fn test_device_info_serialization() {
        let info = DeviceInfo {
            name: "Built-in Audio".to_string(),
            direction: EndpointDirection::Playback,
            is_default: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("Built-in Audio"));
    }
}
