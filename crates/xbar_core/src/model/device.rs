//! Audio Devices
//!
//! A device is one logical PCM endpoint with exactly one ring buffer.
//! Devices come in two backend variants sharing the ring-buffer contract:
//! process-local client devices and hardware devices.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::asrc::MIN_ASRC_PERIODS;
use crate::client::{ClientDevice, DeviceDirection};
use crate::error::{CoreError, CoreResult};
use crate::hw_device::HwDeviceHandler;
use crate::ring_buffer::{RingBuffer, SampleFormat};

/// Largest allowed periodic buffer of a device (4 MiB)
pub const MAX_DEVICE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Clock relationship of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockType {
    /// The device is clocked by the crossbar (zone timing)
    Provided,
    /// The device clock is external but synchronous
    Received,
    /// The device clock is external and drifts; an ASRC decouples it
    ReceivedAsync,
}

/// Creation parameters of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceParams {
    pub name: String,
    pub num_channels: u32,
    pub sample_rate: u32,
    pub data_format: SampleFormat,
    pub period_size: u32,
    pub num_periods: u32,
    pub clock_type: ClockType,
    /// Number of periods of the ASRC buffer; required for
    /// [`ClockType::ReceivedAsync`]
    pub num_periods_asrc_buffer: Option<u32>,
}

impl DeviceParams {
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidParam("device without a name".to_string()));
        }
        if self.num_channels == 0
            || self.sample_rate == 0
            || self.period_size == 0
            || self.num_periods == 0
        {
            return Err(CoreError::InvalidParam(format!(
                "device '{}' has a zero-valued parameter",
                self.name
            )));
        }
        let buffer_bytes = self.period_size as usize
            * self.num_periods as usize
            * self.num_channels as usize
            * self.data_format.sample_size();
        if buffer_bytes > MAX_DEVICE_BUFFER_BYTES {
            return Err(CoreError::InvalidParam(format!(
                "device '{}' buffer of {buffer_bytes} bytes exceeds the 4 MiB limit",
                self.name
            )));
        }
        if self.clock_type == ClockType::ReceivedAsync {
            match self.num_periods_asrc_buffer {
                Some(periods) if periods >= MIN_ASRC_PERIODS => {}
                Some(periods) => {
                    return Err(CoreError::InvalidParam(format!(
                        "device '{}' asrc buffer of {periods} periods is below the minimum of {MIN_ASRC_PERIODS}",
                        self.name
                    )));
                }
                None => {
                    return Err(CoreError::InvalidParam(format!(
                        "device '{}' is received-async but has no asrc buffer size",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn capacity_frames(&self) -> u32 {
        self.period_size * self.num_periods
    }
}

/// Backend variant of a device
pub enum DeviceBackend {
    Client(ClientDevice),
    Hw(HwDeviceHandler),
}

/// One audio device of the topology
pub struct AudioDevice {
    params: DeviceParams,
    direction: DeviceDirection,
    ring: Arc<RingBuffer>,
    backend: DeviceBackend,
    started: bool,
}

impl AudioDevice {
    /// Create the device with its ring buffer and backend. Device names with
    /// the `hw:` prefix open a hardware endpoint; everything else becomes a
    /// process-local client device.
    pub fn create(params: DeviceParams, direction: DeviceDirection) -> CoreResult<Self> {
        params.validate()?;
        let ring = RingBuffer::new(
            params.name.clone(),
            params.num_channels,
            params.data_format,
            params.capacity_frames(),
        )?;
        let backend = if params.name.starts_with("hw:") {
            DeviceBackend::Hw(HwDeviceHandler::new(&params, direction, Arc::clone(&ring))?)
        } else {
            DeviceBackend::Client(ClientDevice::new(
                params.name.clone(),
                direction,
                Arc::clone(&ring),
            ))
        };
        Ok(Self {
            params,
            direction,
            ring,
            backend,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn direction(&self) -> DeviceDirection {
        self.direction
    }

    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    pub fn backend(&self) -> &DeviceBackend {
        &self.backend
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn start(&mut self) -> CoreResult<()> {
        match &mut self.backend {
            DeviceBackend::Client(client) => {
                client.enable_event_queue(true);
            }
            DeviceBackend::Hw(hw) => hw.start()?,
        }
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> CoreResult<()> {
        match &mut self.backend {
            DeviceBackend::Client(_) => {}
            DeviceBackend::Hw(hw) => hw.stop()?,
        }
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str) -> DeviceParams {
        DeviceParams {
            name: name.to_string(),
            num_channels: 2,
            sample_rate: 48_000,
            data_format: SampleFormat::Float32,
            period_size: 64,
            num_periods: 4,
            clock_type: ClockType::Provided,
            num_periods_asrc_buffer: None,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(params("dev").validate().is_ok());
    }

    #[test]
    fn test_buffer_size_limit() {
        let mut p = params("big");
        // 2 ch * 4 bytes * 1M frames * 4 periods = 32 MiB
        p.period_size = 1 << 20;
        assert!(matches!(p.validate(), Err(CoreError::InvalidParam(_))));
    }

    #[test]
    fn test_async_requires_asrc_periods() {
        let mut p = params("async");
        p.clock_type = ClockType::ReceivedAsync;
        assert!(p.validate().is_err());
        p.num_periods_asrc_buffer = Some(3);
        assert!(p.validate().is_err());
        p.num_periods_asrc_buffer = Some(4);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_create_client_device() {
        let device = AudioDevice::create(params("app_source"), DeviceDirection::Source).unwrap();
        assert_eq!(device.name(), "app_source");
        assert_eq!(device.ring_buffer().capacity(), 256);
        assert!(matches!(device.backend(), DeviceBackend::Client(_)));
        assert!(!device.is_started());
    }

    #[test]
    fn test_start_stop_client_device() {
        let mut device = AudioDevice::create(params("app"), DeviceDirection::Sink).unwrap();
        device.start().unwrap();
        assert!(device.is_started());
        device.stop().unwrap();
        assert!(!device.is_started());
    }
}
