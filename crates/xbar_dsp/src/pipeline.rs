//! Pipeline
//!
//! The pipeline owns the DSP graph of one routing zone: pins, pin links,
//! processing modules and the audio streams flowing between them. Building
//! the chain (`init_audio_chain`) resolves the pin graph into streams and a
//! frozen topological module order; `process` then runs one period on the
//! real-time thread.
//!
//! Immediate links order the graph; delayed links are satisfied by last
//! period's bundles and are ignored for ordering, which is what permits
//! feedback loops.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::buffer_pool::PoolHandler;
use crate::error::{DspError, DspResult};
use crate::module::{ModuleContext, ModuleEventSender, ModuleIo, ProcessingModule, StreamInfo};
use crate::module::ModuleRegistry;
use crate::properties::Properties;
use crate::stream::{AudioStream, BundleArena};

/// Identifier of a pin within its pipeline
pub type PinId = usize;

/// Direction of a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    PipelineInput,
    PipelineOutput,
    ModuleInput,
    ModuleOutput,
    ModuleInOut,
}

impl PinDirection {
    /// Whether the pin can be the source side of a link
    fn is_output_capable(self) -> bool {
        matches!(
            self,
            PinDirection::PipelineInput | PinDirection::ModuleOutput | PinDirection::ModuleInOut
        )
    }

    /// Whether the pin can be the destination side of a link
    fn is_input_capable(self) -> bool {
        matches!(
            self,
            PinDirection::PipelineOutput | PinDirection::ModuleInput | PinDirection::ModuleInOut
        )
    }
}

/// Kind of a pin link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Producer must run before consumer within the same period
    Immediate,
    /// Consumer reads last period's data; breaks feedback loops
    Delayed,
}

/// Construction parameters of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub name: String,
    pub period_size: u32,
    pub sample_rate: u32,
}

struct PinEntry {
    name: String,
    channels: u32,
    direction: PinDirection,
    /// Owning module for module pins
    module: Option<usize>,
    /// Set once the pin is the source side of a link
    linked_from: bool,
    /// Set once the pin is the destination side of a link
    linked_to: bool,
}

struct PinLink {
    from: PinId,
    to: PinId,
    kind: LinkType,
}

struct ModuleSlot {
    type_name: String,
    instance_name: String,
    module: Box<dyn ProcessingModule>,
    properties: Properties,
    input_pins: Vec<PinId>,
    output_pins: Vec<PinId>,
    /// (input position, output position) pin mappings
    mappings: Vec<(usize, usize)>,
    cmd_tx: Sender<Properties>,
    cmd_rx: Receiver<Properties>,
    /// Stream-table indices resolved at chain init
    input_streams: Vec<usize>,
    output_streams: Vec<usize>,
}

/// The DSP chain of one routing zone
pub struct Pipeline {
    params: PipelineParams,
    pool: Arc<PoolHandler>,
    arena: BundleArena,
    pins: Vec<PinEntry>,
    links: Vec<PinLink>,
    modules: Vec<ModuleSlot>,
    streams: Vec<AudioStream>,
    /// Stream-table index per pin, resolved at chain init
    pin_streams: Vec<Option<usize>>,
    /// Frozen module execution order
    order: Vec<usize>,
    frozen: bool,
    events: Option<ModuleEventSender>,
}

impl Pipeline {
    pub fn new(
        params: PipelineParams,
        pool: Arc<PoolHandler>,
        events: Option<ModuleEventSender>,
    ) -> DspResult<Self> {
        if params.period_size == 0 || params.sample_rate == 0 {
            return Err(DspError::InvalidParam(format!(
                "pipeline '{}' with zero period or rate",
                params.name
            )));
        }
        let arena = BundleArena::new(params.period_size);
        Ok(Self {
            params,
            pool,
            arena,
            pins: Vec::new(),
            links: Vec::new(),
            modules: Vec::new(),
            streams: Vec::new(),
            pin_streams: Vec::new(),
            order: Vec::new(),
            frozen: false,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn period_size(&self) -> u32 {
        self.params.period_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_not_frozen(&self) -> DspResult<()> {
        if self.frozen {
            return Err(DspError::InvalidParam(format!(
                "pipeline '{}' is already initialized",
                self.params.name
            )));
        }
        Ok(())
    }

    fn add_pin(
        &mut self,
        name: &str,
        channels: u32,
        direction: PinDirection,
        module: Option<usize>,
    ) -> DspResult<PinId> {
        self.check_not_frozen()?;
        if channels == 0 {
            return Err(DspError::InvalidParam(format!("pin '{name}' with zero channels")));
        }
        if self.pins.iter().any(|pin| pin.name == name) {
            return Err(DspError::AlreadyInUse(name.to_string()));
        }
        self.pins.push(PinEntry {
            name: name.to_string(),
            channels,
            direction,
            module,
            linked_from: false,
            linked_to: false,
        });
        Ok(self.pins.len() - 1)
    }

    /// Add a pin feeding audio into the pipeline
    pub fn add_input_pin(&mut self, name: &str, channels: u32) -> DspResult<PinId> {
        self.add_pin(name, channels, PinDirection::PipelineInput, None)
    }

    /// Add a pin delivering audio out of the pipeline
    pub fn add_output_pin(&mut self, name: &str, channels: u32) -> DspResult<PinId> {
        self.add_pin(name, channels, PinDirection::PipelineOutput, None)
    }

    /// Instantiate a processing module from the registry
    pub fn add_processing_module(
        &mut self,
        registry: &ModuleRegistry,
        type_name: &str,
        instance_name: &str,
    ) -> DspResult<()> {
        self.check_not_frozen()?;
        if self
            .modules
            .iter()
            .any(|slot| slot.instance_name == instance_name)
        {
            return Err(DspError::AlreadyInUse(instance_name.to_string()));
        }
        let module = registry.create(type_name)?;
        let (cmd_tx, cmd_rx) = unbounded();
        self.modules.push(ModuleSlot {
            type_name: type_name.to_string(),
            instance_name: instance_name.to_string(),
            module,
            properties: Properties::new(),
            input_pins: Vec::new(),
            output_pins: Vec::new(),
            mappings: Vec::new(),
            cmd_tx,
            cmd_rx,
            input_streams: Vec::new(),
            output_streams: Vec::new(),
        });
        info!(
            pipeline = %self.params.name,
            type_name, instance_name, "added processing module"
        );
        Ok(())
    }

    fn module_index(&self, instance_name: &str) -> DspResult<usize> {
        self.modules
            .iter()
            .position(|slot| slot.instance_name == instance_name)
            .ok_or_else(|| DspError::InvalidParam(format!("unknown module '{instance_name}'")))
    }

    /// Add an input pin to a module
    pub fn add_module_input_pin(
        &mut self,
        instance_name: &str,
        pin_name: &str,
        channels: u32,
    ) -> DspResult<PinId> {
        let module = self.module_index(instance_name)?;
        let pin = self.add_pin(pin_name, channels, PinDirection::ModuleInput, Some(module))?;
        self.modules[module].input_pins.push(pin);
        Ok(pin)
    }

    /// Add an output pin to a module
    pub fn add_module_output_pin(
        &mut self,
        instance_name: &str,
        pin_name: &str,
        channels: u32,
    ) -> DspResult<PinId> {
        let module = self.module_index(instance_name)?;
        let pin = self.add_pin(pin_name, channels, PinDirection::ModuleOutput, Some(module))?;
        self.modules[module].output_pins.push(pin);
        Ok(pin)
    }

    /// Add an in-place pin to a module; the module reads and mutates the same
    /// stream
    pub fn add_module_in_out_pin(
        &mut self,
        instance_name: &str,
        pin_name: &str,
        channels: u32,
    ) -> DspResult<PinId> {
        let module = self.module_index(instance_name)?;
        let pin = self.add_pin(pin_name, channels, PinDirection::ModuleInOut, Some(module))?;
        self.modules[module].input_pins.push(pin);
        self.modules[module].output_pins.push(pin);
        let input_idx = self.modules[module].input_pins.len() - 1;
        let output_idx = self.modules[module].output_pins.len() - 1;
        self.modules[module].mappings.push((input_idx, output_idx));
        Ok(pin)
    }

    /// Map a module input pin to a module output pin (non-in-place
    /// transform); many inputs may map to one output for reducing modules.
    pub fn add_pin_mapping(
        &mut self,
        instance_name: &str,
        input_pin: PinId,
        output_pin: PinId,
    ) -> DspResult<()> {
        self.check_not_frozen()?;
        let module = self.module_index(instance_name)?;
        let slot = &mut self.modules[module];
        let input_pos = slot
            .input_pins
            .iter()
            .position(|&p| p == input_pin)
            .ok_or_else(|| {
                DspError::InvalidParam(format!("pin {input_pin} is not an input of the module"))
            })?;
        let output_pos = slot
            .output_pins
            .iter()
            .position(|&p| p == output_pin)
            .ok_or_else(|| {
                DspError::InvalidParam(format!("pin {output_pin} is not an output of the module"))
            })?;
        if slot.mappings.contains(&(input_pos, output_pos)) {
            return Err(DspError::AlreadyInUse(format!(
                "mapping {input_pin} -> {output_pin}"
            )));
        }
        slot.mappings.push((input_pos, output_pos));
        Ok(())
    }

    /// Link an output-capable pin to an input-capable pin
    pub fn link_pins(&mut self, from: PinId, to: PinId, kind: LinkType) -> DspResult<()> {
        self.check_not_frozen()?;
        if from >= self.pins.len() || to >= self.pins.len() {
            return Err(DspError::InvalidParam("pin id out of range".to_string()));
        }
        if !self.pins[from].direction.is_output_capable() {
            return Err(DspError::InvalidParam(format!(
                "pin '{}' cannot be a link source",
                self.pins[from].name
            )));
        }
        if !self.pins[to].direction.is_input_capable() {
            return Err(DspError::InvalidParam(format!(
                "pin '{}' cannot be a link destination",
                self.pins[to].name
            )));
        }
        if self.pins[from].channels != self.pins[to].channels {
            return Err(DspError::InvalidParam(format!(
                "channel mismatch on link: {} vs {}",
                self.pins[from].channels, self.pins[to].channels
            )));
        }
        if self.pins[from].linked_from {
            return Err(DspError::AlreadyInUse(self.pins[from].name.clone()));
        }
        if self.pins[to].linked_to {
            return Err(DspError::AlreadyInUse(self.pins[to].name.clone()));
        }
        self.pins[from].linked_from = true;
        self.pins[to].linked_to = true;
        self.links.push(PinLink { from, to, kind });
        Ok(())
    }

    /// Configuration properties for a module; applied only while the owning
    /// zone is stopped (enforced by the caller).
    pub fn set_module_properties(
        &mut self,
        instance_name: &str,
        properties: &Properties,
    ) -> DspResult<()> {
        let module = self.module_index(instance_name)?;
        let slot = &mut self.modules[module];
        slot.properties.merge(properties);
        slot.module.set_properties(properties)
    }

    /// Sender for runtime commands to a module; commands are drained at the
    /// start of the next processed period.
    pub fn command_sender(&self, instance_name: &str) -> DspResult<Sender<Properties>> {
        let module = self.module_index(instance_name)?;
        Ok(self.modules[module].cmd_tx.clone())
    }

    /// Stream id associated with a pin after chain init; this is the id used
    /// by runtime commands such as the mixer's `streamId`.
    pub fn stream_id_for_pin(&self, pin: PinId) -> DspResult<i32> {
        let stream = self
            .pin_streams
            .get(pin)
            .copied()
            .flatten()
            .ok_or_else(|| DspError::InvalidParam(format!("pin {pin} has no stream")))?;
        Ok(self.streams[stream].id())
    }

    /// Resolve the pin graph into streams and a frozen module order.
    ///
    /// 1. Every pipeline input pin and every module output pin originates a
    ///    stream; links propagate stream identity to their destination.
    /// 2. The immediate-edge subgraph between modules is ordered
    ///    topologically; a cycle without a delayed edge is an error.
    /// 3. Module stream bindings are materialized and each module is
    ///    initialized against them.
    pub fn init_audio_chain(&mut self) -> DspResult<()> {
        self.check_not_frozen()?;

        // Streams for all origin pins
        self.pin_streams = vec![None; self.pins.len()];
        for pin_id in 0..self.pins.len() {
            let pin = &self.pins[pin_id];
            let originates = match pin.direction {
                PinDirection::PipelineInput | PinDirection::ModuleOutput => true,
                // An in-place pin originates a stream only when nothing is
                // linked into it; otherwise it adopts the incoming stream.
                PinDirection::ModuleInOut => !pin.linked_to,
                PinDirection::ModuleInput | PinDirection::PipelineOutput => false,
            };
            if originates {
                let stream_id = pin_id as i32 + 1;
                let stream = AudioStream::new(
                    self.pins[pin_id].name.clone(),
                    stream_id,
                    self.pins[pin_id].channels,
                    self.params.period_size,
                    false,
                    &self.pool,
                    &mut self.arena,
                )?;
                self.streams.push(stream);
                self.pin_streams[pin_id] = Some(self.streams.len() - 1);
            }
        }

        // Propagate stream identity along links until stable (links can chain
        // through module inout pins).
        let mut changed = true;
        while changed {
            changed = false;
            for link in &self.links {
                if let Some(stream) = self.pin_streams[link.from] {
                    if self.pin_streams[link.to].is_none() {
                        self.pin_streams[link.to] = Some(stream);
                        changed = true;
                    }
                }
            }
        }

        // Unlinked module inputs get a silent stream of their own
        for pin_id in 0..self.pins.len() {
            if self.pin_streams[pin_id].is_none() {
                let pin = &self.pins[pin_id];
                if pin.direction == PinDirection::ModuleInput {
                    warn!(
                        pipeline = %self.params.name,
                        pin = %pin.name,
                        "module input pin is unlinked, feeding silence"
                    );
                    let stream_id = pin_id as i32 + 1;
                    let stream = AudioStream::new(
                        self.pins[pin_id].name.clone(),
                        stream_id,
                        self.pins[pin_id].channels,
                        self.params.period_size,
                        false,
                        &self.pool,
                        &mut self.arena,
                    )?;
                    self.streams.push(stream);
                    self.pin_streams[pin_id] = Some(self.streams.len() - 1);
                } else if pin.direction == PinDirection::PipelineOutput {
                    return Err(DspError::InitFailed(format!(
                        "pipeline output pin '{}' is not linked",
                        pin.name
                    )));
                }
            }
        }

        // Topological order of modules over immediate edges
        let num_modules = self.modules.len();
        let mut in_degree = vec![0usize; num_modules];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); num_modules];
        for link in &self.links {
            if link.kind != LinkType::Immediate {
                continue;
            }
            let from_module = self.pins[link.from].module;
            let to_module = self.pins[link.to].module;
            if let (Some(a), Some(b)) = (from_module, to_module) {
                if a != b {
                    edges[a].push(b);
                    in_degree[b] += 1;
                }
            }
        }
        let mut ready: Vec<usize> = (0..num_modules).filter(|&m| in_degree[m] == 0).collect();
        let mut order = Vec::with_capacity(num_modules);
        while let Some(module) = ready.pop() {
            order.push(module);
            for &next in &edges[module] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(next);
                }
            }
        }
        if order.len() != num_modules {
            return Err(DspError::ImmediateCycle);
        }
        self.order = order;

        // Materialize stream bindings and init the modules
        for module_idx in 0..self.modules.len() {
            let (input_streams, output_streams) = {
                let slot = &self.modules[module_idx];
                let inputs: Vec<usize> = slot
                    .input_pins
                    .iter()
                    .map(|&pin| self.pin_streams[pin].expect("input pin without stream"))
                    .collect();
                let outputs: Vec<usize> = slot
                    .output_pins
                    .iter()
                    .map(|&pin| self.pin_streams[pin].expect("output pin without stream"))
                    .collect();
                (inputs, outputs)
            };
            let input_infos: Vec<StreamInfo> = input_streams
                .iter()
                .map(|&idx| self.stream_info(idx))
                .collect();
            let output_infos: Vec<StreamInfo> = output_streams
                .iter()
                .map(|&idx| self.stream_info(idx))
                .collect();
            let slot = &mut self.modules[module_idx];
            slot.input_streams = input_streams;
            slot.output_streams = output_streams;
            let ctx = ModuleContext {
                frame_length: self.params.period_size,
                sample_rate: self.params.sample_rate,
                instance_name: &slot.instance_name,
                inputs: &input_infos,
                outputs: &output_infos,
                mappings: &slot.mappings,
                properties: &slot.properties,
                events: self.events.clone(),
            };
            slot.module.init(&ctx)?;
        }

        self.frozen = true;
        info!(
            pipeline = %self.params.name,
            modules = self.modules.len(),
            streams = self.streams.len(),
            "audio chain initialized"
        );
        debug!(order = ?self.order, "frozen module order");
        Ok(())
    }

    fn stream_info(&self, index: usize) -> StreamInfo {
        let stream = &self.streams[index];
        StreamInfo {
            index,
            id: stream.id(),
            name: stream.name().to_string(),
            channels: stream.channels(),
            assignments: stream.assignments().to_vec(),
        }
    }

    /// Feed one period of interleaved samples into a pipeline input pin
    pub fn write_input(&mut self, pin: PinId, samples: &[f32]) -> DspResult<()> {
        if !self.frozen {
            return Err(DspError::NotInitialized);
        }
        if self.pins[pin].direction != PinDirection::PipelineInput {
            return Err(DspError::InvalidParam(format!(
                "pin '{}' is not a pipeline input",
                self.pins[pin].name
            )));
        }
        let stream = self.pin_streams[pin].ok_or(DspError::NotInitialized)?;
        self.streams[stream].write_from_interleaved(samples)
    }

    /// Copy one period of interleaved samples out of a pipeline output pin
    pub fn read_output(&mut self, pin: PinId, out: &mut [f32]) -> DspResult<()> {
        if !self.frozen {
            return Err(DspError::NotInitialized);
        }
        if self.pins[pin].direction != PinDirection::PipelineOutput {
            return Err(DspError::InvalidParam(format!(
                "pin '{}' is not a pipeline output",
                self.pins[pin].name
            )));
        }
        let stream = self.pin_streams[pin].ok_or(DspError::NotInitialized)?;
        self.streams[stream].read_to_interleaved(&self.arena, out)
    }

    /// Run one period: drain module commands, clear module output bundles,
    /// then execute the frozen module order.
    pub fn process(&mut self) -> DspResult<()> {
        if !self.frozen {
            return Err(DspError::NotInitialized);
        }
        for slot in &mut self.modules {
            while let Ok(cmd) = slot.cmd_rx.try_recv() {
                if let Err(err) = slot.module.process_cmd(&cmd) {
                    warn!(
                        module = %slot.instance_name,
                        %err,
                        "module rejected runtime command"
                    );
                }
            }
        }
        // Clear all distinct module output streams (in-place streams are the
        // module's own input and are left untouched).
        let mut cleared: Vec<usize> = Vec::new();
        for slot in &self.modules {
            for &stream in &slot.output_streams {
                if slot.input_streams.contains(&stream) {
                    continue;
                }
                if !cleared.contains(&stream) {
                    cleared.push(stream);
                }
            }
        }
        for stream in cleared {
            self.streams[stream].clear_bundled(&mut self.arena)?;
        }
        for order_idx in 0..self.order.len() {
            let module_idx = self.order[order_idx];
            let slot = &mut self.modules[module_idx];
            let mut io = ModuleIo {
                arena: &mut self.arena,
                streams: &mut self.streams,
                inputs: &slot.input_streams,
                outputs: &slot.output_streams,
            };
            slot.module.process(&mut io)?;
        }
        Ok(())
    }

    /// Reset all modules (zone stop)
    pub fn reset(&mut self) {
        for slot in &mut self.modules {
            slot.module.reset();
        }
    }

    /// Names and channel counts of all pins, for introspection
    pub fn pin_info(&self, pin: PinId) -> DspResult<(String, u32, PinDirection)> {
        let entry = self
            .pins
            .get(pin)
            .ok_or_else(|| DspError::InvalidParam(format!("pin {pin} out of range")))?;
        Ok((entry.name.clone(), entry.channels, entry.direction))
    }

    pub fn module_type(&self, instance_name: &str) -> DspResult<String> {
        let module = self.module_index(instance_name)?;
        Ok(self.modules[module].type_name.clone())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for stream in self.streams.drain(..) {
            stream.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_fixture() -> Pipeline {
        let pool = PoolHandler::new();
        Pipeline::new(
            PipelineParams {
                name: "pipe".to_string(),
                period_size: 8,
                sample_rate: 48_000,
            },
            pool,
            None,
        )
        .unwrap()
    }

    /// in0, in1 -> mixer -> out
    fn mixer_graph() -> (Pipeline, PinId, PinId, PinId) {
        let registry = ModuleRegistry::new();
        let mut pipe = pipeline_fixture();
        let in0 = pipe.add_input_pin("in0", 2).unwrap();
        let in1 = pipe.add_input_pin("in1", 2).unwrap();
        let out = pipe.add_output_pin("out", 2).unwrap();
        pipe.add_processing_module(&registry, "mixer", "mix0").unwrap();
        let mix_in0 = pipe.add_module_input_pin("mix0", "mix_in0", 2).unwrap();
        let mix_in1 = pipe.add_module_input_pin("mix0", "mix_in1", 2).unwrap();
        let mix_out = pipe.add_module_output_pin("mix0", "mix_out", 2).unwrap();
        pipe.add_pin_mapping("mix0", mix_in0, mix_out).unwrap();
        pipe.add_pin_mapping("mix0", mix_in1, mix_out).unwrap();
        pipe.link_pins(in0, mix_in0, LinkType::Immediate).unwrap();
        pipe.link_pins(in1, mix_in1, LinkType::Immediate).unwrap();
        pipe.link_pins(mix_out, out, LinkType::Immediate).unwrap();
        pipe.init_audio_chain().unwrap();
        (pipe, in0, in1, out)
    }

    #[test]
    fn test_mixer_graph_processes() {
        let (mut pipe, in0, in1, out) = mixer_graph();
        pipe.write_input(in0, &[0.25f32; 16]).unwrap();
        pipe.write_input(in1, &[0.5f32; 16]).unwrap();
        pipe.process().unwrap();

        let mut data = vec![0.0f32; 16];
        pipe.read_output(out, &mut data).unwrap();
        assert!(data.iter().all(|&v| v == 0.75));
    }

    #[test]
    fn test_output_cleared_every_period() {
        let (mut pipe, in0, in1, out) = mixer_graph();
        pipe.write_input(in0, &[0.5f32; 16]).unwrap();
        pipe.write_input(in1, &[0.0f32; 16]).unwrap();
        pipe.process().unwrap();
        // Second period with silence: output must not accumulate
        pipe.write_input(in0, &[0.0f32; 16]).unwrap();
        pipe.process().unwrap();

        let mut data = vec![9.0f32; 16];
        pipe.read_output(out, &mut data).unwrap();
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_chained_modules_order() {
        // in -> gain g1 -> gain g2 -> out must order g1 before g2
        let registry = ModuleRegistry::new();
        let mut pipe = pipeline_fixture();
        let input = pipe.add_input_pin("in", 2).unwrap();
        let output = pipe.add_output_pin("out", 2).unwrap();
        pipe.add_processing_module(&registry, "gain", "g1").unwrap();
        pipe.add_processing_module(&registry, "gain", "g2").unwrap();
        let g1_in = pipe.add_module_input_pin("g1", "g1_in", 2).unwrap();
        let g1_out = pipe.add_module_output_pin("g1", "g1_out", 2).unwrap();
        let g2_in = pipe.add_module_input_pin("g2", "g2_in", 2).unwrap();
        let g2_out = pipe.add_module_output_pin("g2", "g2_out", 2).unwrap();
        pipe.add_pin_mapping("g1", g1_in, g1_out).unwrap();
        pipe.add_pin_mapping("g2", g2_in, g2_out).unwrap();
        pipe.link_pins(input, g1_in, LinkType::Immediate).unwrap();
        pipe.link_pins(g1_out, g2_in, LinkType::Immediate).unwrap();
        pipe.link_pins(g2_out, output, LinkType::Immediate).unwrap();
        pipe.init_audio_chain().unwrap();
        assert_eq!(pipe.order, vec![0, 1]);

        pipe.write_input(input, &[0.5f32; 16]).unwrap();
        pipe.process().unwrap();
        let mut data = vec![0.0f32; 16];
        pipe.read_output(output, &mut data).unwrap();
        assert!(data.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_immediate_cycle_rejected() {
        let registry = ModuleRegistry::new();
        let mut pipe = pipeline_fixture();
        pipe.add_processing_module(&registry, "gain", "g1").unwrap();
        pipe.add_processing_module(&registry, "gain", "g2").unwrap();
        let g1_in = pipe.add_module_input_pin("g1", "g1_in", 2).unwrap();
        let g1_out = pipe.add_module_output_pin("g1", "g1_out", 2).unwrap();
        let g2_in = pipe.add_module_input_pin("g2", "g2_in", 2).unwrap();
        let g2_out = pipe.add_module_output_pin("g2", "g2_out", 2).unwrap();
        pipe.add_pin_mapping("g1", g1_in, g1_out).unwrap();
        pipe.add_pin_mapping("g2", g2_in, g2_out).unwrap();
        pipe.link_pins(g1_out, g2_in, LinkType::Immediate).unwrap();
        pipe.link_pins(g2_out, g1_in, LinkType::Immediate).unwrap();
        assert_eq!(pipe.init_audio_chain(), Err(DspError::ImmediateCycle));
    }

    #[test]
    fn test_feedback_with_delayed_edge_is_allowed() {
        let registry = ModuleRegistry::new();
        let mut pipe = pipeline_fixture();
        pipe.add_processing_module(&registry, "gain", "g1").unwrap();
        pipe.add_processing_module(&registry, "gain", "g2").unwrap();
        let g1_in = pipe.add_module_input_pin("g1", "g1_in", 2).unwrap();
        let g1_out = pipe.add_module_output_pin("g1", "g1_out", 2).unwrap();
        let g2_in = pipe.add_module_input_pin("g2", "g2_in", 2).unwrap();
        let g2_out = pipe.add_module_output_pin("g2", "g2_out", 2).unwrap();
        pipe.add_pin_mapping("g1", g1_in, g1_out).unwrap();
        pipe.add_pin_mapping("g2", g2_in, g2_out).unwrap();
        pipe.link_pins(g1_out, g2_in, LinkType::Immediate).unwrap();
        pipe.link_pins(g2_out, g1_in, LinkType::Delayed).unwrap();
        assert!(pipe.init_audio_chain().is_ok());
    }

    #[test]
    fn test_link_validation() {
        let mut pipe = pipeline_fixture();
        let in0 = pipe.add_input_pin("in0", 2).unwrap();
        let in1 = pipe.add_input_pin("in1", 4).unwrap();
        let out = pipe.add_output_pin("out", 2).unwrap();
        // Channel mismatch
        assert!(pipe.link_pins(in1, out, LinkType::Immediate).is_err());
        // Input pin as destination of pipeline input is invalid
        assert!(pipe.link_pins(in0, in1, LinkType::Immediate).is_err());
        // Valid link, then double link on the same destination
        pipe.link_pins(in0, out, LinkType::Immediate).unwrap();
        let in2 = pipe.add_input_pin("in2", 2).unwrap();
        assert_eq!(
            pipe.link_pins(in2, out, LinkType::Immediate),
            Err(DspError::AlreadyInUse("out".to_string()))
        );
    }

    #[test]
    fn test_duplicate_pin_name_rejected() {
        let mut pipe = pipeline_fixture();
        pipe.add_input_pin("dup", 2).unwrap();
        assert_eq!(
            pipe.add_input_pin("dup", 2),
            Err(DspError::AlreadyInUse("dup".to_string()))
        );
    }

    #[test]
    fn test_unknown_module_type() {
        let registry = ModuleRegistry::new();
        let mut pipe = pipeline_fixture();
        assert!(matches!(
            pipe.add_processing_module(&registry, "fancy_eq", "eq0"),
            Err(DspError::UnknownModuleType(_))
        ));
    }

    #[test]
    fn test_process_before_init_fails() {
        let mut pipe = pipeline_fixture();
        assert_eq!(pipe.process(), Err(DspError::NotInitialized));
    }

    #[test]
    fn test_mixer_runtime_cmd_through_pipeline() {
        let (mut pipe, in0, in1, out) = mixer_graph();
        // Mute the first input stream via a gain offset of 0 over 1 period
        let stream_id = pipe.stream_id_for_pin(3).unwrap(); // mix_in0 pin
        let sender = pipe.command_sender("mix0").unwrap();
        let mut cmd = Properties::new();
        cmd.set("cmd", "setInputGainOffset");
        cmd.set("streamId", stream_id);
        cmd.set("gainOffset", 0.0f32);
        sender.send(cmd).unwrap();

        // 100 ms ramp at 48 kHz with period 8 needs 600 periods
        for _ in 0..610 {
            pipe.write_input(in0, &[1.0f32; 16]).unwrap();
            pipe.write_input(in1, &[0.0f32; 16]).unwrap();
            pipe.process().unwrap();
        }
        let mut data = vec![9.0f32; 16];
        pipe.read_output(out, &mut data).unwrap();
        assert!(data.iter().all(|&v| v == 0.0));
    }
}
