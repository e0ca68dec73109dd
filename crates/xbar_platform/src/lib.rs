//! XBAR Platform - Hardware PCM Endpoints
//!
//! Thin transport layer between the crossbar core and the OS audio stack.
//! The core crate owns all buffering and clocking; this crate only opens
//! streams and shuttles interleaved f32 samples through period callbacks.

mod cpal_endpoint;
mod error;
mod traits;

pub use cpal_endpoint::{enumerate_devices, CaptureCallback, CpalEndpoint, PlaybackCallback};
pub use error::{PlatformError, PlatformResult};
pub use traits::{DeviceInfo, EndpointConfig, EndpointDirection, PcmEndpoint};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _config = EndpointConfig::default();
    }
}
