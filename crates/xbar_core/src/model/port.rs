//! Audio Ports
//!
//! A port is a logical view on a sub-range of channels of its owner's ring
//! buffer. Ports on one device may not overlap and must lie inside the
//! device's channel range.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Direction of a port, matching its owner device's direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Creation parameters of a port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortParams {
    pub name: String,
    /// Id used by the routing API; unique across all ports
    pub id: i32,
    pub direction: PortDirection,
    /// First channel within the owner device
    pub index: u32,
    pub num_channels: u32,
}

impl PortParams {
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidParam("port without a name".to_string()));
        }
        if self.num_channels == 0 {
            return Err(CoreError::InvalidParam(format!(
                "port '{}' with zero channels",
                self.name
            )));
        }
        Ok(())
    }
}

/// One port of the topology
#[derive(Debug, Clone)]
pub struct AudioPort {
    params: PortParams,
    /// Owning device name once attached
    owner: Option<String>,
}

impl AudioPort {
    pub fn new(params: PortParams) -> CoreResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            owner: None,
        })
    }

    pub fn params(&self) -> &PortParams {
        &self.params
    }

    pub fn id(&self) -> i32 {
        self.params.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn direction(&self) -> PortDirection {
        self.params.direction
    }

    pub fn channel_range(&self) -> (u32, u32) {
        (self.params.index, self.params.num_channels)
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Attach the port to a device, validating the channel range against the
    /// device width and against the already attached ports.
    pub fn attach(
        &mut self,
        device_name: &str,
        device_channels: u32,
        sibling_ranges: &[(u32, u32)],
    ) -> CoreResult<()> {
        if self.owner.is_some() {
            return Err(CoreError::AlreadyInUse(self.params.name.clone()));
        }
        let (index, count) = self.channel_range();
        if index + count > device_channels {
            return Err(CoreError::InvalidParam(format!(
                "port '{}' channels [{index}, {}) exceed device width {device_channels}",
                self.params.name,
                index + count
            )));
        }
        for &(other_index, other_count) in sibling_ranges {
            let overlap = index < other_index + other_count && other_index < index + count;
            if overlap {
                return Err(CoreError::AlreadyInUse(format!(
                    "port '{}' overlaps channels [{other_index}, {})",
                    self.params.name,
                    other_index + other_count
                )));
            }
        }
        self.owner = Some(device_name.to_string());
        Ok(())
    }

    pub fn detach(&mut self) {
        self.owner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: i32, index: u32, count: u32) -> AudioPort {
        AudioPort::new(PortParams {
            name: format!("port{id}"),
            id,
            direction: PortDirection::Output,
            index,
            num_channels: count,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_channels_rejected() {
        let result = AudioPort::new(PortParams {
            name: "p".to_string(),
            id: 1,
            direction: PortDirection::Input,
            index: 0,
            num_channels: 0,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_attach_range_check() {
        let mut p = port(1, 4, 2);
        // Device only has 4 channels
        assert!(p.attach("dev", 4, &[]).is_err());
        assert!(p.attach("dev", 6, &[]).is_ok());
        assert_eq!(p.owner(), Some("dev"));
    }

    #[test]
    fn test_attach_overlap_check() {
        let mut p = port(1, 2, 2);
        // Existing sibling covers channels [3, 5)
        assert!(matches!(
            p.attach("dev", 8, &[(3, 2)]),
            Err(CoreError::AlreadyInUse(_))
        ));
        // Adjacent but not overlapping is fine
        assert!(p.attach("dev", 8, &[(0, 2), (4, 2)]).is_ok());
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut p = port(1, 0, 2);
        p.attach("dev", 2, &[]).unwrap();
        assert!(matches!(
            p.attach("dev", 2, &[]),
            Err(CoreError::AlreadyInUse(_))
        ));
        p.detach();
        assert!(p.attach("dev", 2, &[]).is_ok());
    }
}
