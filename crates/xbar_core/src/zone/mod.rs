//! Routing Zones
//!
//! A routing zone is the period-driven scheduler bound to one sink device.
//! Base zones own a real-time worker thread; derived zones run inside their
//! base zone's loop at an integer multiple of its period.
//!
//! The per-period engine lives in [`RoutingZone::process_period`] so tests
//! and the worker thread drive exactly the same code path.

mod worker;

pub use worker::{DerivedSchedule, ZoneWorker};

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use xbar_dsp::{Pipeline, PinId};

use crate::client::{DeviceEventKind, DeviceDirection};
use crate::error::{CoreError, CoreResult};
use crate::model::{AudioDevice, DeviceBackend};
use crate::ring_buffer::{AccessDirection, RingBuffer, SampleFormat};
use crate::switch_matrix::SwitchMatrix;

/// Periods of head-room in each zone port conversion buffer
const CONVERSION_RING_PERIODS: u32 = 4;

/// Construction parameters of a zone
#[derive(Debug, Clone)]
pub struct ZoneParams {
    pub name: String,
}

/// Link from one zone input port to the sink side
pub struct ZonePortLink {
    /// Id of the zone input port
    pub zone_port_id: i32,
    /// Sink device input port this zone port is linked to
    pub sink_port_id: i32,
    /// Conversion ring buffer owned by the zone port; switch matrix jobs
    /// write into it
    pub ring: Arc<RingBuffer>,
    pub channels: u32,
    /// First channel of the linked sink port within the sink device
    pub sink_index: u32,
    /// Pipeline input pin fed by this port instead of the direct sink copy
    pub pipeline_pin: Option<PinId>,
}

/// Copy of one pipeline output pin into the sink device
pub struct PipelineOutLink {
    pub pin: PinId,
    pub channels: u32,
    pub sink_index: u32,
}

/// One routing zone
pub struct RoutingZone {
    id: u32,
    name: String,
    sink_device: Option<Arc<Mutex<AudioDevice>>>,
    sink_ring: Option<Arc<RingBuffer>>,
    period_size: u32,
    sample_rate: u32,
    base: Option<u32>,
    derived: Vec<u32>,
    pipeline: Option<Pipeline>,
    port_links: Vec<ZonePortLink>,
    pipeline_out_links: Vec<PipelineOutLink>,
    started: bool,
    /// Sink client sent a stop; contribution is paused until it starts again
    client_paused: bool,
    /// Consecutive sink-wait timeouts; zone stops contributing past the
    /// budget
    timeout_strikes: u32,
    /// Periods processed since start
    periods_processed: u64,
    scratch: Vec<f32>,
}

impl RoutingZone {
    pub fn new(id: u32, params: ZoneParams) -> Self {
        Self {
            id,
            name: params.name,
            sink_device: None,
            sink_ring: None,
            period_size: 0,
            sample_rate: 0,
            base: None,
            derived: Vec::new(),
            pipeline: None,
            port_links: Vec::new(),
            pipeline_out_links: Vec::new(),
            started: false,
            client_paused: false,
            timeout_strikes: 0,
            periods_processed: 0,
            scratch: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period_size(&self) -> u32 {
        self.period_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_base(&self) -> bool {
        self.base.is_none()
    }

    pub fn base_zone(&self) -> Option<u32> {
        self.base
    }

    pub fn derived_zones(&self) -> &[u32] {
        &self.derived
    }

    pub fn periods_processed(&self) -> u64 {
        self.periods_processed
    }

    pub fn sink_ring(&self) -> Option<Arc<RingBuffer>> {
        self.sink_ring.clone()
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    pub fn pipeline_mut(&mut self) -> Option<&mut Pipeline> {
        self.pipeline.as_mut()
    }

    pub fn set_pipeline(&mut self, pipeline: Pipeline) -> CoreResult<()> {
        if self.pipeline.is_some() {
            return Err(CoreError::AlreadyInUse(format!(
                "zone '{}' already owns a pipeline",
                self.name
            )));
        }
        if self.period_size != 0 && pipeline.period_size() != self.period_size {
            return Err(CoreError::InvalidParam(format!(
                "pipeline period {} does not match zone period {}",
                pipeline.period_size(),
                self.period_size
            )));
        }
        if self.sample_rate != 0 && pipeline.sample_rate() != self.sample_rate {
            return Err(CoreError::InvalidParam(format!(
                "pipeline rate {} does not match zone rate {}",
                pipeline.sample_rate(),
                self.sample_rate
            )));
        }
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Link the zone to its sink device, adopting the device's period and
    /// sample rate.
    pub fn link_sink_device(&mut self, device: Arc<Mutex<AudioDevice>>) -> CoreResult<()> {
        if self.sink_device.is_some() {
            return Err(CoreError::AlreadyInUse(format!(
                "zone '{}' is already linked to a sink device",
                self.name
            )));
        }
        let (ring, period, rate) = {
            let device = device.lock().unwrap_or_else(|e| e.into_inner());
            if device.direction() != DeviceDirection::Sink {
                return Err(CoreError::InvalidParam(format!(
                    "device '{}' is not a sink",
                    device.name()
                )));
            }
            (
                device.ring_buffer(),
                device.params().period_size,
                device.params().sample_rate,
            )
        };
        self.sink_ring = Some(ring);
        self.period_size = period;
        self.sample_rate = rate;
        self.scratch = vec![0.0; (period * 16) as usize];
        self.sink_device = Some(device);
        info!(zone = %self.name, period, rate, "zone linked to sink device");
        Ok(())
    }

    pub fn unlink_sink_device(&mut self) -> CoreResult<()> {
        if self.started {
            return Err(CoreError::NotAllowed(
                "cannot unlink the sink of a started zone".to_string(),
            ));
        }
        if self.sink_device.take().is_none() {
            return Err(CoreError::NothingRemoved);
        }
        self.sink_ring = None;
        Ok(())
    }

    pub fn sink_device(&self) -> Option<Arc<Mutex<AudioDevice>>> {
        self.sink_device.clone()
    }

    /// Register a derived zone id (topology kept by the setup registry)
    pub fn add_derived(&mut self, derived_id: u32) {
        self.derived.push(derived_id);
    }

    pub fn remove_derived(&mut self, derived_id: u32) -> CoreResult<()> {
        let before = self.derived.len();
        self.derived.retain(|&id| id != derived_id);
        if self.derived.len() == before {
            return Err(CoreError::NothingRemoved);
        }
        Ok(())
    }

    pub fn set_base(&mut self, base: Option<u32>) {
        self.base = base;
    }

    /// Create the conversion ring of a zone input port and link it to a sink
    /// device input port.
    pub fn link_zone_port(
        &mut self,
        zone_port_id: i32,
        sink_port_id: i32,
        channels: u32,
        sink_index: u32,
    ) -> CoreResult<()> {
        if self.period_size == 0 {
            return Err(CoreError::NotInitialized);
        }
        if self
            .port_links
            .iter()
            .any(|link| link.zone_port_id == zone_port_id || link.sink_port_id == sink_port_id)
        {
            return Err(CoreError::AlreadyInUse(format!(
                "zone port {zone_port_id} or sink port {sink_port_id} already linked"
            )));
        }
        let ring = RingBuffer::new(
            format!("{}_port{}", self.name, zone_port_id),
            channels,
            SampleFormat::Float32,
            self.period_size * CONVERSION_RING_PERIODS,
        )?;
        let needed = (self.period_size * channels) as usize;
        if self.scratch.len() < needed {
            self.scratch.resize(needed, 0.0);
        }
        self.port_links.push(ZonePortLink {
            zone_port_id,
            sink_port_id,
            ring,
            channels,
            sink_index,
            pipeline_pin: None,
        });
        info!(
            zone = %self.name,
            zone_port = zone_port_id,
            sink_port = sink_port_id,
            "zone input port linked"
        );
        Ok(())
    }

    pub fn unlink_zone_port(&mut self, zone_port_id: i32, sink_port_id: i32) -> CoreResult<()> {
        let before = self.port_links.len();
        self.port_links
            .retain(|link| !(link.zone_port_id == zone_port_id && link.sink_port_id == sink_port_id));
        if self.port_links.len() == before {
            return Err(CoreError::NothingRemoved);
        }
        Ok(())
    }

    pub fn port_links(&self) -> &[ZonePortLink] {
        &self.port_links
    }

    /// Find the conversion target of a connection by zone-port or sink-port
    /// id
    pub fn find_port_link(&self, port_id: i32) -> Option<&ZonePortLink> {
        self.port_links
            .iter()
            .find(|link| link.zone_port_id == port_id || link.sink_port_id == port_id)
    }

    /// Route a zone input port into a pipeline input pin
    pub fn link_port_to_pin(&mut self, zone_port_id: i32, pin: PinId) -> CoreResult<()> {
        if self.pipeline.is_none() {
            return Err(CoreError::NotInitialized);
        }
        let link = self
            .port_links
            .iter_mut()
            .find(|link| link.zone_port_id == zone_port_id)
            .ok_or_else(|| {
                CoreError::InvalidParam(format!("zone port {zone_port_id} is not linked"))
            })?;
        link.pipeline_pin = Some(pin);
        Ok(())
    }

    /// Route a pipeline output pin into a channel range of the sink device
    pub fn link_pin_to_sink(
        &mut self,
        pin: PinId,
        channels: u32,
        sink_index: u32,
    ) -> CoreResult<()> {
        if self.pipeline.is_none() {
            return Err(CoreError::NotInitialized);
        }
        if self.pipeline_out_links.iter().any(|link| link.pin == pin) {
            return Err(CoreError::AlreadyInUse(format!("pipeline pin {pin}")));
        }
        let needed = (self.period_size * channels) as usize;
        if self.scratch.len() < needed {
            self.scratch.resize(needed, 0.0);
        }
        self.pipeline_out_links.push(PipelineOutLink {
            pin,
            channels,
            sink_index,
        });
        Ok(())
    }

    /// Transition into the started state; freezes the pipeline order.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.started {
            return Err(CoreError::WrongState(format!(
                "zone '{}' is already started",
                self.name
            )));
        }
        if self.sink_ring.is_none() {
            return Err(CoreError::NotInitialized);
        }
        if let Some(pipeline) = self.pipeline.as_mut() {
            if !pipeline.is_frozen() {
                pipeline.init_audio_chain()?;
            }
        }
        if let Some(device) = &self.sink_device {
            device
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .start()?;
        }
        self.started = true;
        self.client_paused = false;
        self.timeout_strikes = 0;
        self.periods_processed = 0;
        info!(zone = %self.name, "zone started");
        Ok(())
    }

    pub fn stop(&mut self) -> CoreResult<()> {
        if !self.started {
            return Err(CoreError::NotRunning);
        }
        self.started = false;
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.reset();
        }
        if let Some(device) = &self.sink_device {
            device.lock().unwrap_or_else(|e| e.into_inner()).stop()?;
        }
        info!(zone = %self.name, "zone stopped");
        Ok(())
    }

    /// Poll session-tagged client events of the sink device. A stop from the
    /// consuming client resets the sink ring and pauses contribution until
    /// the next start.
    fn poll_client_events(&mut self) {
        let Some(device) = &self.sink_device else {
            return;
        };
        let device = device.lock().unwrap_or_else(|e| e.into_inner());
        let DeviceBackend::Client(client) = device.backend() else {
            return;
        };
        while let Ok(event) = client.next_event() {
            match event.kind {
                DeviceEventKind::Stop => {
                    info!(zone = %self.name, "sink client stopped, pausing contribution");
                    if let Some(ring) = &self.sink_ring {
                        ring.reset_from_writer();
                    }
                    self.client_paused = true;
                }
                DeviceEventKind::Start => {
                    info!(zone = %self.name, "sink client started, resuming contribution");
                    self.client_paused = false;
                }
            }
        }
    }

    /// Execute one period of this zone: buffer tasks, port copies, pipeline,
    /// sink commit.
    ///
    /// Returns `false` when the period was skipped (no sink space or paused).
    pub fn process_period(&mut self, matrix: &SwitchMatrix) -> CoreResult<bool> {
        if !self.started {
            return Err(CoreError::NotRunning);
        }
        let period = self.period_size;
        self.poll_client_events();

        // 1. Source buffer tasks run first.
        matrix.run_zone_tasks(self.id);

        let Some(sink_ring) = self.sink_ring.clone() else {
            return Err(CoreError::NotInitialized);
        };
        if self.client_paused {
            // Drain the conversion rings so sources keep their timing, but
            // contribute nothing to the sink.
            for link in &self.port_links {
                let access = link.ring.begin_access(AccessDirection::Read, period)?;
                let frames = access.frames();
                access.commit(frames)?;
            }
            self.periods_processed += 1;
            return Ok(false);
        }

        let mut sink_access = sink_ring.begin_access(AccessDirection::Write, period)?;
        if sink_access.frames() < period {
            debug!(zone = %self.name, granted = sink_access.frames(), "sink not writable, skipping period");
            return Ok(false);
        }

        // 2. Move each zone input port into the pipeline or straight into
        //    the sink.
        for link in &self.port_links {
            let needed = (period * link.channels) as usize;
            let scratch = &mut self.scratch[..needed];
            let access = link.ring.begin_access(AccessDirection::Read, period)?;
            let got = access.frames();
            if got > 0 {
                access.read_into_f32(0, link.channels, got, scratch)?;
            }
            // Underruns become silence.
            scratch[(got * link.channels) as usize..].fill(0.0);
            access.commit(got)?;

            match link.pipeline_pin {
                Some(pin) => {
                    let pipeline = self.pipeline.as_mut().ok_or(CoreError::NotInitialized)?;
                    pipeline.write_input(pin, scratch)?;
                }
                None => {
                    sink_access.write_from_f32(link.sink_index, link.channels, period, scratch)?;
                }
            }
        }

        // 3. Run the DSP chain and copy its outputs to the sink.
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.process()?;
            for out_link in &self.pipeline_out_links {
                let needed = (period * out_link.channels) as usize;
                let scratch = &mut self.scratch[..needed];
                pipeline.read_output(out_link.pin, scratch)?;
                sink_access.write_from_f32(
                    out_link.sink_index,
                    out_link.channels,
                    period,
                    scratch,
                )?;
            }
        }

        // 4. The sink commit is the last act of the period.
        sink_access.commit(period)?;
        self.periods_processed += 1;
        Ok(true)
    }

    /// Count one sink-wait timeout; returns true once the budget is
    /// exhausted.
    pub fn timeout_strike(&mut self, budget: u32) -> bool {
        self.timeout_strikes += 1;
        if self.timeout_strikes >= budget {
            warn!(zone = %self.name, strikes = self.timeout_strikes, "sink wait budget exhausted");
            return true;
        }
        false
    }

    pub fn clear_timeout_strikes(&mut self) {
        self.timeout_strikes = 0;
    }
}
