//! Setup API
//!
//! The topology-mutating surface of the crossbar: devices, ports, routing
//! zones, derived zones, pipelines and module properties. All entities live
//! in id- and name-keyed registries here; cross references go through ids so
//! destruction cascades by walking the maps, never through ownership cycles.
//!
//! Failed operations unwind whatever partial state they created and return a
//! single result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use xbar_dsp::{
    LinkType, ModuleRegistry, Pipeline, PipelineParams, PinId, PoolHandler, Properties,
};

use crate::client::DeviceDirection;
use crate::config::ConfigFile;
use crate::diagnostic::Diagnostics;
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventProvider, SetupEvent};
use crate::model::{AudioDevice, AudioPort, DeviceBackend, DeviceParams, PortDirection, PortParams};
use crate::switch_matrix::SwitchMatrix;
use crate::thread_names::ThreadNames;
use crate::zone::{DerivedSchedule, RoutingZone, ZoneParams, ZoneWorker};

/// One live source->sink connection tracked by the routing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionEntry {
    pub source_id: i32,
    /// Sink id as given by the caller (zone port or sink device port)
    pub sink_id: i32,
    /// Resolved zone input port the jobs write into
    pub zone_port_id: i32,
    pub zone_id: u32,
}

/// The topology registry and setup surface
pub struct Setup {
    config: Arc<ConfigFile>,
    pool: Arc<PoolHandler>,
    module_registry: Arc<ModuleRegistry>,
    events: Arc<EventProvider>,
    matrix: Arc<SwitchMatrix>,
    diagnostics: Arc<Diagnostics>,
    thread_names: Arc<ThreadNames>,
    devices: HashMap<String, Arc<Mutex<AudioDevice>>>,
    /// All ports by routing id
    ports: HashMap<i32, AudioPort>,
    /// Device name -> attached port ids
    device_ports: HashMap<String, Vec<i32>>,
    /// Zone id -> attached zone input port ids
    zone_ports: HashMap<u32, Vec<i32>>,
    zones: HashMap<u32, Arc<Mutex<RoutingZone>>>,
    zone_ids: HashMap<String, u32>,
    /// Sink device name -> zone id it is linked into
    sink_links: HashMap<String, u32>,
    /// Pipeline name -> owning zone id
    pipelines: HashMap<String, u32>,
    workers: HashMap<u32, ZoneWorker>,
    pub(crate) connections: Vec<ConnectionEntry>,
    next_zone_id: u32,
}

impl Setup {
    pub fn new(config: Arc<ConfigFile>, events: Arc<EventProvider>) -> Self {
        let diagnostics = Diagnostics::new(&config);
        Self {
            matrix: SwitchMatrix::new(Arc::clone(&events)),
            pool: PoolHandler::new(),
            module_registry: Arc::new(ModuleRegistry::new()),
            thread_names: ThreadNames::new(),
            diagnostics,
            config,
            events,
            devices: HashMap::new(),
            ports: HashMap::new(),
            device_ports: HashMap::new(),
            zone_ports: HashMap::new(),
            zones: HashMap::new(),
            zone_ids: HashMap::new(),
            sink_links: HashMap::new(),
            pipelines: HashMap::new(),
            workers: HashMap::new(),
            connections: Vec::new(),
            next_zone_id: 1,
        }
    }

    pub fn events(&self) -> Arc<EventProvider> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> Arc<ConfigFile> {
        Arc::clone(&self.config)
    }

    pub(crate) fn matrix(&self) -> Arc<SwitchMatrix> {
        Arc::clone(&self.matrix)
    }

    pub fn diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diagnostics)
    }

    // ---- devices -------------------------------------------------------

    fn create_device(&mut self, params: DeviceParams, direction: DeviceDirection) -> CoreResult<()> {
        if self.devices.contains_key(&params.name) {
            return Err(CoreError::AlreadyInUse(params.name));
        }
        let name = params.name.clone();
        let device = AudioDevice::create(params, direction)?;
        // Hardware devices in async clock mode feed the configured
        // diagnostic stream.
        if let DeviceBackend::Hw(hw) = device.backend() {
            let period_us = device.params().period_size as u64 * 1_000_000
                / device.params().sample_rate as u64;
            if let Some(stream) =
                self.diagnostics
                    .stream_for_device(&self.config, &name, period_us as u32)
            {
                hw.attach_diagnostic(stream);
            }
        }
        self.devices.insert(name.clone(), Arc::new(Mutex::new(device)));
        self.device_ports.insert(name.clone(), Vec::new());
        self.events
            .send(Event::Setup(SetupEvent::DeviceCreated { name: name.clone() }));
        info!(device = %name, ?direction, "device created");
        Ok(())
    }

    pub fn create_audio_source_device(&mut self, params: DeviceParams) -> CoreResult<()> {
        self.create_device(params, DeviceDirection::Source)
    }

    pub fn create_audio_sink_device(&mut self, params: DeviceParams) -> CoreResult<()> {
        self.create_device(params, DeviceDirection::Sink)
    }

    pub fn device(&self, name: &str) -> CoreResult<Arc<Mutex<AudioDevice>>> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown device '{name}'")))
    }

    /// Destroy a device. The device must be stopped; destroying a source
    /// cascades through the switch matrix and severs its connections.
    pub fn destroy_audio_device(&mut self, name: &str) -> CoreResult<()> {
        let device = self.device(name)?;
        {
            let device = device.lock().unwrap_or_else(|e| e.into_inner());
            if device.is_started() {
                return Err(CoreError::NotAllowed(format!(
                    "device '{name}' must be stopped before destruction"
                )));
            }
        }
        if self.sink_links.contains_key(name) {
            return Err(CoreError::NotAllowed(format!(
                "device '{name}' is still linked to a routing zone"
            )));
        }
        let port_ids = self.device_ports.remove(name).unwrap_or_default();
        for port_id in port_ids {
            self.matrix.remove_source(port_id);
            self.connections.retain(|c| c.source_id != port_id);
            if let Some(port) = self.ports.get_mut(&port_id) {
                port.detach();
            }
        }
        self.devices.remove(name);
        self.events.send(Event::Setup(SetupEvent::DeviceDestroyed {
            name: name.to_string(),
        }));
        info!(device = name, "device destroyed");
        Ok(())
    }

    // ---- ports ---------------------------------------------------------

    pub fn create_audio_port(&mut self, params: PortParams) -> CoreResult<()> {
        if self.ports.contains_key(&params.id) {
            return Err(CoreError::AlreadyInUse(format!("port id {}", params.id)));
        }
        let id = params.id;
        self.ports.insert(id, AudioPort::new(params)?);
        Ok(())
    }

    pub fn destroy_audio_port(&mut self, port_id: i32) -> CoreResult<()> {
        let Some(port) = self.ports.get(&port_id) else {
            return Err(CoreError::NothingRemoved);
        };
        if port.owner().is_some() {
            return Err(CoreError::NotAllowed(format!(
                "port {port_id} is still attached"
            )));
        }
        self.ports.remove(&port_id);
        Ok(())
    }

    fn attach_device_port(
        &mut self,
        device_name: &str,
        port_id: i32,
        expected_port_direction: PortDirection,
        expected_device_direction: DeviceDirection,
    ) -> CoreResult<()> {
        let device = self.device(device_name)?;
        let device_channels = {
            let device = device.lock().unwrap_or_else(|e| e.into_inner());
            if device.direction() != expected_device_direction {
                return Err(CoreError::InvalidParam(format!(
                    "device '{device_name}' direction does not fit this port kind"
                )));
            }
            device.params().num_channels
        };
        let sibling_ranges: Vec<(u32, u32)> = self
            .device_ports
            .get(device_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.ports.get(id))
                    .map(|p| p.channel_range())
                    .collect()
            })
            .unwrap_or_default();
        let port = self
            .ports
            .get_mut(&port_id)
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown port {port_id}")))?;
        if port.direction() != expected_port_direction {
            return Err(CoreError::InvalidParam(format!(
                "port {port_id} has the wrong direction"
            )));
        }
        port.attach(device_name, device_channels, &sibling_ranges)?;
        self.device_ports
            .entry(device_name.to_string())
            .or_default()
            .push(port_id);
        Ok(())
    }

    /// Attach an output port to a source device
    pub fn add_audio_output_port(&mut self, device_name: &str, port_id: i32) -> CoreResult<()> {
        self.attach_device_port(
            device_name,
            port_id,
            PortDirection::Output,
            DeviceDirection::Source,
        )
    }

    /// Attach an input port to a sink device
    pub fn add_audio_input_port(&mut self, device_name: &str, port_id: i32) -> CoreResult<()> {
        self.attach_device_port(
            device_name,
            port_id,
            PortDirection::Input,
            DeviceDirection::Sink,
        )
    }

    pub fn delete_audio_port(&mut self, device_name: &str, port_id: i32) -> CoreResult<()> {
        let Some(ids) = self.device_ports.get_mut(device_name) else {
            return Err(CoreError::NothingRemoved);
        };
        let before = ids.len();
        ids.retain(|&id| id != port_id);
        if ids.len() == before {
            return Err(CoreError::NothingRemoved);
        }
        if let Some(port) = self.ports.get_mut(&port_id) {
            port.detach();
        }
        Ok(())
    }

    /// Attach a (deviceless) input port to a routing zone
    pub fn add_zone_input_port(&mut self, zone_name: &str, port_id: i32) -> CoreResult<()> {
        let zone_id = self.zone_id(zone_name)?;
        let port = self
            .ports
            .get_mut(&port_id)
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown port {port_id}")))?;
        if port.direction() != PortDirection::Input {
            return Err(CoreError::InvalidParam(format!(
                "zone input port {port_id} must have input direction"
            )));
        }
        port.attach(zone_name, u32::MAX, &[])?;
        self.zone_ports.entry(zone_id).or_default().push(port_id);
        Ok(())
    }

    pub(crate) fn port(&self, port_id: i32) -> CoreResult<&AudioPort> {
        self.ports
            .get(&port_id)
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown port {port_id}")))
    }

    // ---- routing zones -------------------------------------------------

    pub fn create_routing_zone(&mut self, params: ZoneParams) -> CoreResult<()> {
        if self.zone_ids.contains_key(&params.name) {
            return Err(CoreError::AlreadyInUse(params.name));
        }
        let id = self.next_zone_id;
        self.next_zone_id += 1;
        let name = params.name.clone();
        self.zones
            .insert(id, Arc::new(Mutex::new(RoutingZone::new(id, params))));
        self.zone_ids.insert(name.clone(), id);
        info!(zone = %name, id, "routing zone created");
        Ok(())
    }

    pub fn zone_id(&self, name: &str) -> CoreResult<u32> {
        self.zone_ids
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown zone '{name}'")))
    }

    pub fn zone(&self, name: &str) -> CoreResult<Arc<Mutex<RoutingZone>>> {
        let id = self.zone_id(name)?;
        Ok(Arc::clone(&self.zones[&id]))
    }

    pub(crate) fn zones_iter(&self) -> impl Iterator<Item = (u32, &Arc<Mutex<RoutingZone>>)> {
        self.zones.iter().map(|(&id, zone)| (id, zone))
    }

    pub fn destroy_routing_zone(&mut self, name: &str) -> CoreResult<()> {
        let id = self.zone_id(name)?;
        {
            let zone = self.zones[&id].lock().unwrap_or_else(|e| e.into_inner());
            if zone.is_started() {
                return Err(CoreError::NotAllowed(format!(
                    "zone '{name}' must be stopped before destruction"
                )));
            }
            if !zone.derived_zones().is_empty() {
                return Err(CoreError::NotAllowed(format!(
                    "zone '{name}' still owns derived zones"
                )));
            }
            if let Some(base) = zone.base_zone() {
                return Err(CoreError::NotAllowed(format!(
                    "zone '{name}' is still derived from zone {base}"
                )));
            }
        }
        self.sink_links.retain(|_, &mut zone| zone != id);
        self.pipelines.retain(|_, &mut zone| zone != id);
        self.zone_ports.remove(&id);
        self.zones.remove(&id);
        self.zone_ids.remove(name);
        info!(zone = name, "routing zone destroyed");
        Ok(())
    }

    /// Link a zone to its sink device
    pub fn link_zone_sink(&mut self, zone_name: &str, device_name: &str) -> CoreResult<()> {
        let zone_id = self.zone_id(zone_name)?;
        if let Some(&owner) = self.sink_links.get(device_name) {
            return Err(CoreError::AlreadyInUse(format!(
                "sink device '{device_name}' is already linked to zone {owner}"
            )));
        }
        let device = self.device(device_name)?;
        let zone = Arc::clone(&self.zones[&zone_id]);
        zone.lock()
            .unwrap_or_else(|e| e.into_inner())
            .link_sink_device(device)?;
        self.sink_links.insert(device_name.to_string(), zone_id);
        Ok(())
    }

    pub fn unlink_zone_sink(&mut self, zone_name: &str, device_name: &str) -> CoreResult<()> {
        let zone_id = self.zone_id(zone_name)?;
        if self.sink_links.get(device_name) != Some(&zone_id) {
            return Err(CoreError::NothingRemoved);
        }
        let zone = Arc::clone(&self.zones[&zone_id]);
        zone.lock()
            .unwrap_or_else(|e| e.into_inner())
            .unlink_sink_device()?;
        self.sink_links.remove(device_name);
        Ok(())
    }

    /// Link a zone input port to a sink device input port
    pub fn link_zone_port(&mut self, zone_port_id: i32, sink_port_id: i32) -> CoreResult<()> {
        // Resolve the owning zone of the zone port
        let zone_id = self
            .zone_ports
            .iter()
            .find(|(_, ports)| ports.contains(&zone_port_id))
            .map(|(&id, _)| id)
            .ok_or_else(|| {
                CoreError::InvalidParam(format!("port {zone_port_id} is not a zone input port"))
            })?;
        let (channels, sink_index) = {
            let zone_port = self.port(zone_port_id)?;
            let sink_port = self.port(sink_port_id)?;
            if sink_port.direction() != PortDirection::Input {
                return Err(CoreError::InvalidParam(format!(
                    "port {sink_port_id} is not a sink input port"
                )));
            }
            let (_, zone_channels) = zone_port.channel_range();
            let (sink_idx, sink_channels) = sink_port.channel_range();
            if zone_channels != sink_channels {
                return Err(CoreError::InvalidParam(format!(
                    "zone port has {zone_channels} channels, sink port {sink_channels}"
                )));
            }
            (zone_channels, sink_idx)
        };
        let zone = Arc::clone(&self.zones[&zone_id]);
        let result = zone
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link_zone_port(zone_port_id, sink_port_id, channels, sink_index);
        result
    }

    pub fn unlink_zone_port(&mut self, zone_port_id: i32, sink_port_id: i32) -> CoreResult<()> {
        for zone in self.zones.values() {
            let mut zone = zone.lock().unwrap_or_else(|e| e.into_inner());
            if zone.unlink_zone_port(zone_port_id, sink_port_id).is_ok() {
                return Ok(());
            }
        }
        Err(CoreError::NothingRemoved)
    }

    /// Declare `derived_name` a derived zone of `base_name`.
    ///
    /// Both zones must have equal sample rates and the derived period must
    /// be an integer multiple of the base period.
    pub fn add_derived_zone(&mut self, base_name: &str, derived_name: &str) -> CoreResult<()> {
        let base_id = self.zone_id(base_name)?;
        let derived_id = self.zone_id(derived_name)?;
        if base_id == derived_id {
            return Err(CoreError::InvalidParam(
                "a zone cannot derive from itself".to_string(),
            ));
        }
        let base = Arc::clone(&self.zones[&base_id]);
        let derived = Arc::clone(&self.zones[&derived_id]);
        {
            let mut base = base.lock().unwrap_or_else(|e| e.into_inner());
            let mut derived = derived.lock().unwrap_or_else(|e| e.into_inner());
            if base.base_zone().is_some() {
                return Err(CoreError::NotAllowed(format!(
                    "zone '{base_name}' is itself derived and cannot be a base"
                )));
            }
            if derived.base_zone().is_some() {
                return Err(CoreError::AlreadyInUse(format!(
                    "zone '{derived_name}' is already derived"
                )));
            }
            if base.period_size() == 0 || derived.period_size() == 0 {
                return Err(CoreError::NotInitialized);
            }
            if base.sample_rate() != derived.sample_rate() {
                return Err(CoreError::InvalidParam(format!(
                    "derived zone rate {} differs from base rate {}",
                    derived.sample_rate(),
                    base.sample_rate()
                )));
            }
            if derived.period_size() % base.period_size() != 0 {
                return Err(CoreError::InvalidParam(format!(
                    "derived period {} is not an integer multiple of base period {}",
                    derived.period_size(),
                    base.period_size()
                )));
            }
            base.add_derived(derived_id);
            derived.set_base(Some(base_id));
        }
        info!(base = base_name, derived = derived_name, "derived zone added");
        Ok(())
    }

    pub fn delete_derived_zone(&mut self, base_name: &str, derived_name: &str) -> CoreResult<()> {
        let base_id = self.zone_id(base_name)?;
        let derived_id = self.zone_id(derived_name)?;
        let base = Arc::clone(&self.zones[&base_id]);
        let derived = Arc::clone(&self.zones[&derived_id]);
        let mut base = base.lock().unwrap_or_else(|e| e.into_inner());
        base.remove_derived(derived_id)?;
        derived
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_base(None);
        Ok(())
    }

    /// Start a base zone: start it and its derived zones, then spawn the
    /// real-time worker.
    pub fn start_routing_zone(&mut self, name: &str) -> CoreResult<()> {
        let zone_id = self.zone_id(name)?;
        let zone = Arc::clone(&self.zones[&zone_id]);
        let (derived_ids, base_period) = {
            let mut zone = zone.lock().unwrap_or_else(|e| e.into_inner());
            if !zone.is_base() {
                return Err(CoreError::NotAllowed(format!(
                    "zone '{name}' is derived and runs inside its base zone"
                )));
            }
            zone.start()?;
            (zone.derived_zones().to_vec(), zone.period_size())
        };
        let mut schedules: Vec<DerivedSchedule> = Vec::new();
        for derived_id in derived_ids {
            let derived = Arc::clone(&self.zones[&derived_id]);
            let ratio = {
                let mut derived = derived.lock().unwrap_or_else(|e| e.into_inner());
                if !derived.is_started() {
                    if let Err(err) = derived.start() {
                        // Unwind the partially started family
                        let _ = zone.lock().unwrap_or_else(|e| e.into_inner()).stop();
                        for schedule in &schedules {
                            let mut started =
                                schedule.zone.lock().unwrap_or_else(|e| e.into_inner());
                            let _ = started.stop();
                        }
                        return Err(err);
                    }
                }
                derived.period_size() / base_period
            };
            schedules.push(DerivedSchedule {
                zone: derived,
                ratio,
            });
        }
        let runner_threads = self.config.runner_threads_enabled(name);
        info!(zone = name, runner_threads, "starting zone worker");
        let worker = ZoneWorker::start(
            Arc::clone(&zone),
            schedules,
            Arc::clone(&self.matrix),
            Arc::clone(&self.config),
            Arc::clone(&self.thread_names),
            Arc::clone(&self.events),
        )?;
        self.workers.insert(zone_id, worker);
        self.events.send(Event::Setup(SetupEvent::ZoneStarted {
            name: name.to_string(),
        }));
        Ok(())
    }

    /// Stop a base zone: the worker exits at the next period boundary before
    /// any shared state is torn down.
    pub fn stop_routing_zone(&mut self, name: &str) -> CoreResult<()> {
        let zone_id = self.zone_id(name)?;
        if let Some(mut worker) = self.workers.remove(&zone_id) {
            worker.stop();
        }
        let zone = Arc::clone(&self.zones[&zone_id]);
        let derived_ids = {
            let mut zone = zone.lock().unwrap_or_else(|e| e.into_inner());
            let derived = zone.derived_zones().to_vec();
            zone.stop()?;
            derived
        };
        for derived_id in derived_ids {
            if let Some(derived) = self.zones.get(&derived_id) {
                let mut derived = derived.lock().unwrap_or_else(|e| e.into_inner());
                if derived.is_started() {
                    let _ = derived.stop();
                }
            }
        }
        self.events.send(Event::Setup(SetupEvent::ZoneStopped {
            name: name.to_string(),
        }));
        Ok(())
    }

    // ---- pipelines -----------------------------------------------------

    /// Create a pipeline owned by a zone. Period and rate must match the
    /// zone's sink device.
    pub fn create_pipeline(&mut self, zone_name: &str, params: PipelineParams) -> CoreResult<()> {
        if self.pipelines.contains_key(&params.name) {
            return Err(CoreError::AlreadyInUse(params.name));
        }
        let zone_id = self.zone_id(zone_name)?;
        let pipeline_name = params.name.clone();
        let pipeline = Pipeline::new(
            params,
            Arc::clone(&self.pool),
            Some(self.events.module_sender()),
        )?;
        let zone = Arc::clone(&self.zones[&zone_id]);
        zone.lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_pipeline(pipeline)?;
        self.pipelines.insert(pipeline_name, zone_id);
        Ok(())
    }

    fn pipeline_zone(&self, pipeline_name: &str) -> CoreResult<Arc<Mutex<RoutingZone>>> {
        let zone_id = self
            .pipelines
            .get(pipeline_name)
            .copied()
            .ok_or_else(|| CoreError::InvalidParam(format!("unknown pipeline '{pipeline_name}'")))?;
        Ok(Arc::clone(&self.zones[&zone_id]))
    }

    /// Run a closure against a pipeline
    pub fn with_pipeline<R>(
        &self,
        pipeline_name: &str,
        f: impl FnOnce(&mut Pipeline) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let zone = self.pipeline_zone(pipeline_name)?;
        let mut zone = zone.lock().unwrap_or_else(|e| e.into_inner());
        let pipeline = zone.pipeline_mut().ok_or(CoreError::NotInitialized)?;
        f(pipeline)
    }

    pub fn create_audio_pin(
        &self,
        pipeline_name: &str,
        pin_name: &str,
        channels: u32,
        kind: PinKind,
    ) -> CoreResult<PinId> {
        self.with_pipeline(pipeline_name, |pipeline| {
            let pin = match kind {
                PinKind::PipelineInput => pipeline.add_input_pin(pin_name, channels)?,
                PinKind::PipelineOutput => pipeline.add_output_pin(pin_name, channels)?,
            };
            Ok(pin)
        })
    }

    pub fn add_processing_module(
        &self,
        pipeline_name: &str,
        type_name: &str,
        instance_name: &str,
    ) -> CoreResult<()> {
        let registry = Arc::clone(&self.module_registry);
        self.with_pipeline(pipeline_name, |pipeline| {
            pipeline.add_processing_module(&registry, type_name, instance_name)?;
            Ok(())
        })
    }

    pub fn add_module_pin(
        &self,
        pipeline_name: &str,
        instance_name: &str,
        pin_name: &str,
        channels: u32,
        kind: ModulePinKind,
    ) -> CoreResult<PinId> {
        self.with_pipeline(pipeline_name, |pipeline| {
            let pin = match kind {
                ModulePinKind::Input => {
                    pipeline.add_module_input_pin(instance_name, pin_name, channels)?
                }
                ModulePinKind::Output => {
                    pipeline.add_module_output_pin(instance_name, pin_name, channels)?
                }
                ModulePinKind::InOut => {
                    pipeline.add_module_in_out_pin(instance_name, pin_name, channels)?
                }
            };
            Ok(pin)
        })
    }

    pub fn add_audio_pin_mapping(
        &self,
        pipeline_name: &str,
        instance_name: &str,
        input_pin: PinId,
        output_pin: PinId,
    ) -> CoreResult<()> {
        self.with_pipeline(pipeline_name, |pipeline| {
            pipeline.add_pin_mapping(instance_name, input_pin, output_pin)?;
            Ok(())
        })
    }

    pub fn link_pins(
        &self,
        pipeline_name: &str,
        from: PinId,
        to: PinId,
        link_type: LinkType,
    ) -> CoreResult<()> {
        self.with_pipeline(pipeline_name, |pipeline| {
            pipeline.link_pins(from, to, link_type)?;
            Ok(())
        })
    }

    pub fn init_pipeline_audio_chain(&self, pipeline_name: &str) -> CoreResult<()> {
        self.with_pipeline(pipeline_name, |pipeline| {
            pipeline.init_audio_chain()?;
            Ok(())
        })
    }

    /// Route a zone input port into a pipeline input pin
    pub fn link_port_to_pin(
        &self,
        pipeline_name: &str,
        zone_port_id: i32,
        pin: PinId,
    ) -> CoreResult<()> {
        let zone = self.pipeline_zone(pipeline_name)?;
        let result = zone
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link_port_to_pin(zone_port_id, pin);
        result
    }

    /// Route a pipeline output pin into a sink device input port
    pub fn link_pin_to_sink_port(
        &self,
        pipeline_name: &str,
        pin: PinId,
        sink_port_id: i32,
    ) -> CoreResult<()> {
        let (sink_index, channels) = {
            let port = self.port(sink_port_id)?;
            if port.direction() != PortDirection::Input {
                return Err(CoreError::InvalidParam(format!(
                    "port {sink_port_id} is not a sink input port"
                )));
            }
            port.channel_range()
        };
        let zone = self.pipeline_zone(pipeline_name)?;
        let result = zone
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link_pin_to_sink(pin, channels, sink_index);
        result
    }

    /// Apply configuration properties to a module; only allowed while the
    /// owning zone is stopped.
    pub fn set_properties(
        &self,
        pipeline_name: &str,
        instance_name: &str,
        properties: &Properties,
    ) -> CoreResult<()> {
        let zone = self.pipeline_zone(pipeline_name)?;
        let mut zone = zone.lock().unwrap_or_else(|e| e.into_inner());
        if zone.is_started() {
            return Err(CoreError::NotAllowed(
                "module properties can only change while the zone is stopped".to_string(),
            ));
        }
        let pipeline = zone.pipeline_mut().ok_or(CoreError::NotInitialized)?;
        pipeline.set_module_properties(instance_name, properties)?;
        Ok(())
    }

    /// Sender for runtime commands (mixer balance, gain, ...) to a module
    pub fn module_command_sender(
        &self,
        pipeline_name: &str,
        instance_name: &str,
    ) -> CoreResult<crossbeam_channel::Sender<Properties>> {
        self.with_pipeline(pipeline_name, |pipeline| {
            Ok(pipeline.command_sender(instance_name)?)
        })
    }

    /// Stream id of a pipeline pin, as used by module runtime commands
    pub fn pin_stream_id(&self, pipeline_name: &str, pin: PinId) -> CoreResult<i32> {
        self.with_pipeline(pipeline_name, |pipeline| Ok(pipeline.stream_id_for_pin(pin)?))
    }
}

/// Kind of a pipeline-level pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    PipelineInput,
    PipelineOutput,
}

/// Kind of a module-level pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulePinKind {
    Input,
    Output,
    InOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClockType;
    use crate::ring_buffer::SampleFormat;

    fn setup() -> Setup {
        let config = Arc::new(ConfigFile::default());
        let events = EventProvider::new();
        Setup::new(config, events)
    }

    fn device_params(name: &str) -> DeviceParams {
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

    fn port_params(id: i32, direction: PortDirection) -> PortParams {
        PortParams {
            name: format!("port{id}"),
            id,
            direction,
            index: 0,
            num_channels: 2,
        }
    }

    #[test]
    fn test_device_lifecycle() {
        let mut setup = setup();
        setup
            .create_audio_source_device(device_params("src"))
            .unwrap();
        assert!(matches!(
            setup.create_audio_source_device(device_params("src")),
            Err(CoreError::AlreadyInUse(_))
        ));
        setup.destroy_audio_device("src").unwrap();
        assert!(setup.device("src").is_err());
    }

    #[test]
    fn test_port_attachment_rules() {
        let mut setup = setup();
        setup
            .create_audio_source_device(device_params("src"))
            .unwrap();
        setup
            .create_audio_port(port_params(1, PortDirection::Output))
            .unwrap();
        setup.add_audio_output_port("src", 1).unwrap();

        // Overlapping second port is rejected
        setup
            .create_audio_port(port_params(2, PortDirection::Output))
            .unwrap();
        assert!(matches!(
            setup.add_audio_output_port("src", 2),
            Err(CoreError::AlreadyInUse(_))
        ));

        // Input port cannot attach as output port
        setup
            .create_audio_port(port_params(3, PortDirection::Input))
            .unwrap();
        assert!(setup.add_audio_output_port("src", 3).is_err());
    }

    #[test]
    fn test_destroy_attached_port_rejected() {
        let mut setup = setup();
        setup
            .create_audio_source_device(device_params("src"))
            .unwrap();
        setup
            .create_audio_port(port_params(1, PortDirection::Output))
            .unwrap();
        setup.add_audio_output_port("src", 1).unwrap();
        assert!(matches!(
            setup.destroy_audio_port(1),
            Err(CoreError::NotAllowed(_))
        ));
        setup.delete_audio_port("src", 1).unwrap();
        setup.destroy_audio_port(1).unwrap();
    }

    #[test]
    fn test_zone_sink_link() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink"))
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "z".into() })
            .unwrap();
        setup.link_zone_sink("z", "sink").unwrap();

        // A sink device can only serve one zone
        setup
            .create_routing_zone(ZoneParams { name: "z2".into() })
            .unwrap();
        assert!(matches!(
            setup.link_zone_sink("z2", "sink"),
            Err(CoreError::AlreadyInUse(_))
        ));
    }

    #[test]
    fn test_destroy_linked_sink_rejected() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink"))
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "z".into() })
            .unwrap();
        setup.link_zone_sink("z", "sink").unwrap();
        assert!(matches!(
            setup.destroy_audio_device("sink"),
            Err(CoreError::NotAllowed(_))
        ));
        setup.unlink_zone_sink("z", "sink").unwrap();
        setup.destroy_audio_device("sink").unwrap();
    }

    #[test]
    fn test_derived_zone_validation() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink_a"))
            .unwrap();
        let mut big = device_params("sink_b");
        big.period_size = 256;
        setup.create_audio_sink_device(big).unwrap();
        let mut odd = device_params("sink_c");
        odd.period_size = 96;
        odd.sample_rate = 44_100;
        setup.create_audio_sink_device(odd).unwrap();

        setup
            .create_routing_zone(ZoneParams { name: "base".into() })
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "derived".into() })
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "wrong_rate".into() })
            .unwrap();
        setup.link_zone_sink("base", "sink_a").unwrap();
        setup.link_zone_sink("derived", "sink_b").unwrap();
        setup.link_zone_sink("wrong_rate", "sink_c").unwrap();

        // Rate mismatch rejected
        assert!(setup.add_derived_zone("base", "wrong_rate").is_err());
        // 256 = 4 * 64 is fine
        setup.add_derived_zone("base", "derived").unwrap();
        // Double derivation rejected
        assert!(matches!(
            setup.add_derived_zone("base", "derived"),
            Err(CoreError::AlreadyInUse(_))
        ));
        setup.delete_derived_zone("base", "derived").unwrap();
    }

    #[test]
    fn test_start_derived_zone_directly_rejected() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink_a"))
            .unwrap();
        let mut big = device_params("sink_b");
        big.period_size = 128;
        setup.create_audio_sink_device(big).unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "base".into() })
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "derived".into() })
            .unwrap();
        setup.link_zone_sink("base", "sink_a").unwrap();
        setup.link_zone_sink("derived", "sink_b").unwrap();
        setup.add_derived_zone("base", "derived").unwrap();

        assert!(matches!(
            setup.start_routing_zone("derived"),
            Err(CoreError::NotAllowed(_))
        ));
    }

    #[test]
    fn test_pipeline_creation_and_chain() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink"))
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "z".into() })
            .unwrap();
        setup.link_zone_sink("z", "sink").unwrap();
        setup
            .create_pipeline(
                "z",
                PipelineParams {
                    name: "pipe".into(),
                    period_size: 64,
                    sample_rate: 48_000,
                },
            )
            .unwrap();

        let input = setup
            .create_audio_pin("pipe", "in", 2, PinKind::PipelineInput)
            .unwrap();
        let output = setup
            .create_audio_pin("pipe", "out", 2, PinKind::PipelineOutput)
            .unwrap();
        setup.add_processing_module("pipe", "gain", "g0").unwrap();
        let g_in = setup
            .add_module_pin("pipe", "g0", "g_in", 2, ModulePinKind::Input)
            .unwrap();
        let g_out = setup
            .add_module_pin("pipe", "g0", "g_out", 2, ModulePinKind::Output)
            .unwrap();
        setup
            .add_audio_pin_mapping("pipe", "g0", g_in, g_out)
            .unwrap();
        setup
            .link_pins("pipe", input, g_in, LinkType::Immediate)
            .unwrap();
        setup
            .link_pins("pipe", g_out, output, LinkType::Immediate)
            .unwrap();
        setup.init_pipeline_audio_chain("pipe").unwrap();

        // Properties only while stopped: zone is stopped, so this works
        let mut props = Properties::new();
        props.set("gain", 0.5f32);
        setup.set_properties("pipe", "g0", &props).unwrap();
    }

    #[test]
    fn test_pipeline_rate_mismatch_rejected() {
        let mut setup = setup();
        setup
            .create_audio_sink_device(device_params("sink"))
            .unwrap();
        setup
            .create_routing_zone(ZoneParams { name: "z".into() })
            .unwrap();
        setup.link_zone_sink("z", "sink").unwrap();
        let result = setup.create_pipeline(
            "z",
            PipelineParams {
                name: "pipe".into(),
                period_size: 128,
                sample_rate: 48_000,
            },
        );
        assert!(result.is_err());
    }
}
