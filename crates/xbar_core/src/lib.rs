//! XBAR Core - Real-Time Audio Crossbar
//!
//! Process-local service connecting many logical audio sources to many
//! logical sinks with in-line DSP, glitch-free under a fixed period clock
//! and arbitrary dynamic connection changes.
//!
//! # Architecture
//!
//! ```text
//! source device ── source ring ── buffer task (jobs, ASRC, probes)
//!                                      │
//!                          zone port conversion rings
//!                                      │
//!                        pipeline (bundles, mixer, modules)
//!                                      │
//!                     sink device ring ── sink device
//! ```
//!
//! Control flows inward through the [`Setup`] and [`Routing`] APIs; both
//! funnel commands into lock-free queues consumed by the per-zone real-time
//! workers at period boundaries.

mod asrc;
mod client;
mod config;
mod diagnostic;
mod error;
mod event;
mod hw_device;
mod model;
mod probe;
mod ring_buffer;
mod routing;
mod setup;
mod switch_matrix;
mod thread_names;
mod zone;

pub use asrc::{Asrc, MIN_ASRC_PERIODS};
pub use client::{
    ClientControl, ClientControlHandle, ClientDevice, ClientResponse, DeviceDirection,
    DeviceEvent, DeviceEventKind,
};
pub use config::{ConfigFile, DiagnosticConfig, SchedPolicy, SchedPriorityAdjust};
pub use diagnostic::{DiagnosticLogWriter, DiagnosticStream, DiagnosticStreamParams, Diagnostics};
pub use error::{CoreError, CoreResult, RingBufferError};
pub use event::{ConnectionEvent, Event, EventProvider, SetupEvent};
pub use hw_device::HwDeviceHandler;
pub use model::{
    AudioDevice, AudioPort, ClockType, DeviceBackend, DeviceParams, PortDirection, PortParams,
    MAX_DEVICE_BUFFER_BYTES,
};
pub use probe::{DataProbe, ProbeMode, ProbeParams};
pub use ring_buffer::{AccessDirection, AudioArea, RingAccess, RingBuffer, SampleFormat};
pub use routing::Routing;
pub use setup::{ModulePinKind, PinKind, Setup};
pub use switch_matrix::{BufferTask, JobParams, SwitchMatrix, SwitchMatrixJob, TaskCommand};
pub use thread_names::{ThreadKind, ThreadNames};
pub use zone::{RoutingZone, ZoneParams, ZoneWorker};

// Re-export the DSP surface used by embedders
pub use xbar_dsp::{
    LinkType, MixerEventType, ModuleRegistry, Pipeline, PipelineParams, PinId, Properties,
    PropertyValue, RampShape,
};

use std::sync::Arc;
use std::time::Duration;

/// The crossbar instance: owns the configuration, the event provider and the
/// topology registry.
pub struct Xbar {
    setup: Setup,
}

impl Xbar {
    /// Create an instance with the configuration loaded from disk
    pub fn new() -> Self {
        Self::with_config(ConfigFile::load())
    }

    /// Create an instance with an explicit configuration
    pub fn with_config(config: ConfigFile) -> Self {
        let events = EventProvider::new();
        Self {
            setup: Setup::new(Arc::new(config), events),
        }
    }

    /// The topology-mutating surface
    pub fn setup(&mut self) -> &mut Setup {
        &mut self.setup
    }

    /// The connect/disconnect surface
    pub fn routing(&mut self) -> Routing<'_> {
        Routing::new(&mut self.setup)
    }

    pub fn events(&self) -> Arc<EventProvider> {
        self.setup.events()
    }

    /// Block until an event is queued, bounded by `timeout_ms`
    pub fn wait_for_event(&self, timeout_ms: u64) -> CoreResult<()> {
        self.setup
            .events()
            .wait_for_event(Duration::from_millis(timeout_ms))
    }

    /// Pop the next queued event
    pub fn next_event(&self) -> CoreResult<Event> {
        self.setup.events().next_event()
    }
}

impl Default for Xbar {
    fn default() -> Self {
        Self::new()
    }
}
