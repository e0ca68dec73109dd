//! Model Entities
//!
//! The static topology objects: devices and ports. Entities are keyed by
//! stable ids in the setup registry; cross references go through ids so
//! destruction can cascade without ownership cycles.

mod device;
mod port;

pub use device::{AudioDevice, ClockType, DeviceBackend, DeviceParams, MAX_DEVICE_BUFFER_BYTES};
pub use port::{AudioPort, PortDirection, PortParams};
