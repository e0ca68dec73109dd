//! Processing Modules
//!
//! A processing module is one node of the pipeline's DSP graph. Modules are
//! discovered through the [`ModuleRegistry`] by type name (the plugin seam)
//! and interact with the runtime only through this operation set: `init`,
//! `process`, `process_cmd`, `set_properties`, `reset`.
//!
//! # Real-time Safety Contract
//!
//! `process` runs on the zone's real-time thread. Implementations must not
//! allocate, block on locks, perform I/O, or call back into setup.

use std::collections::HashMap;

use crossbeam_channel::Sender;

use crate::error::{DspError, DspResult};
use crate::properties::Properties;
use crate::ramp::{Ramp, RampShape};
use crate::stream::{AudioStream, BundleArena, BundleAssignment};

/// Static description of one stream as seen by a module at init time
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Index into the pipeline's stream table
    pub index: usize,
    /// Stream id used in runtime commands
    pub id: i32,
    pub name: String,
    pub channels: u32,
    pub assignments: Vec<BundleAssignment>,
}

/// Event emitted by a module (e.g. a finished ramp), dispatched through the
/// process-wide event provider.
#[derive(Debug, Clone)]
pub struct ModuleEvent {
    pub type_name: String,
    pub instance_name: String,
    pub pin_name: String,
    pub properties: Properties,
}

/// Channel end modules use to emit events
pub type ModuleEventSender = Sender<ModuleEvent>;

/// Everything a module needs to configure itself when the chain is frozen
pub struct ModuleContext<'a> {
    pub frame_length: u32,
    pub sample_rate: u32,
    pub instance_name: &'a str,
    pub inputs: &'a [StreamInfo],
    pub outputs: &'a [StreamInfo],
    /// Pin mappings as (input position, output position) pairs
    pub mappings: &'a [(usize, usize)],
    pub properties: &'a Properties,
    pub events: Option<ModuleEventSender>,
}

/// Mutable view of the pipeline state handed to `process`
pub struct ModuleIo<'a> {
    pub arena: &'a mut BundleArena,
    pub streams: &'a mut [AudioStream],
    /// Stream-table indices of the module inputs, in pin order
    pub inputs: &'a [usize],
    /// Stream-table indices of the module outputs, in pin order
    pub outputs: &'a [usize],
}

/// Borrow two distinct streams of a stream table at once
pub fn stream_pair_mut(
    streams: &mut [AudioStream],
    first: usize,
    second: usize,
) -> (&mut AudioStream, &mut AudioStream) {
    assert_ne!(first, second, "stream pair must be disjoint");
    if first < second {
        let (left, right) = streams.split_at_mut(second);
        (&mut left[first], &mut right[0])
    } else {
        let (left, right) = streams.split_at_mut(first);
        (&mut right[0], &mut left[second])
    }
}

/// The module operation set used by the pipeline
pub trait ProcessingModule: Send {
    /// Configure the module against its frozen stream bindings
    fn init(&mut self, ctx: &ModuleContext) -> DspResult<()>;

    /// Process one period
    fn process(&mut self, io: &mut ModuleIo) -> DspResult<()>;

    /// Handle a runtime command (drained from the module command queue at the
    /// start of each period, before `process`)
    fn process_cmd(&mut self, _cmd: &Properties) -> DspResult<()> {
        Ok(())
    }

    /// Apply configuration properties; only called while the owning zone is
    /// stopped
    fn set_properties(&mut self, _props: &Properties) -> DspResult<()> {
        Ok(())
    }

    /// Drop internal state (ramps, delay lines)
    fn reset(&mut self) {}

    fn type_name(&self) -> &'static str;
}

type ModuleFactory = Box<dyn Fn() -> Box<dyn ProcessingModule> + Send + Sync>;

/// Registry of module factories keyed by type name.
///
/// Created at process init; plugin crates register their factories here
/// before any pipeline is built.
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    /// Registry preloaded with the built-in module types
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("mixer", || Box::new(crate::mixer::MixerModule::new()));
        registry.register("gain", || Box::new(GainModule::new()));
        registry
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        factory: impl Fn() -> Box<dyn ProcessingModule> + Send + Sync + 'static,
    ) {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    pub fn create(&self, type_name: &str) -> DspResult<Box<dyn ProcessingModule>> {
        match self.factories.get(type_name) {
            Some(factory) => Ok(factory()),
            None => Err(DspError::UnknownModuleType(type_name.to_string())),
        }
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in per-stream volume module with ramped gain changes
pub struct GainModule {
    frame_length: u32,
    sample_rate: u32,
    /// One (stream id, ramp, gain vector) entry per mapped input
    gains: Vec<GainState>,
    pairs: Vec<(usize, usize)>,
    current_gain: f32,
}

struct GainState {
    stream_id: i32,
    ramp: Ramp,
    vector: Vec<f32>,
    scratch: Vec<f32>,
}

impl GainModule {
    pub fn new() -> Self {
        Self {
            frame_length: 0,
            sample_rate: 0,
            gains: Vec::new(),
            pairs: Vec::new(),
            current_gain: 1.0,
        }
    }
}

impl Default for GainModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingModule for GainModule {
    fn init(&mut self, ctx: &ModuleContext) -> DspResult<()> {
        if ctx.mappings.is_empty() {
            return Err(DspError::InitFailed(format!(
                "gain module '{}' has no pin mappings",
                ctx.instance_name
            )));
        }
        self.frame_length = ctx.frame_length;
        self.sample_rate = ctx.sample_rate;
        self.current_gain = ctx.properties.get_f32("gain").unwrap_or(1.0);
        self.pairs.clear();
        self.gains.clear();
        for &(input_pos, output_pos) in ctx.mappings {
            let input = &ctx.inputs[input_pos];
            let output = &ctx.outputs[output_pos];
            if input.channels != output.channels {
                return Err(DspError::InitFailed(format!(
                    "gain mapping channel mismatch: {} vs {}",
                    input.channels, output.channels
                )));
            }
            self.pairs.push((input.index, output.index));
            let mut ramp = Ramp::new(ctx.sample_rate, ctx.frame_length);
            ramp.set_timed_ramp(self.current_gain, self.current_gain, 1, RampShape::Linear)?;
            self.gains.push(GainState {
                stream_id: input.id,
                ramp,
                vector: vec![self.current_gain; ctx.frame_length as usize],
                scratch: vec![0.0; (ctx.frame_length * input.channels) as usize],
            });
        }
        Ok(())
    }

    fn process(&mut self, io: &mut ModuleIo) -> DspResult<()> {
        for (state, &(in_idx, out_idx)) in self.gains.iter_mut().zip(&self.pairs) {
            state.ramp.ramp_values(&mut state.vector)?;
            if in_idx == out_idx {
                let stream = &mut io.streams[in_idx];
                stream.as_interleaved(io.arena)?;
                let channels = stream.channels() as usize;
                stream.read_to_interleaved(io.arena, &mut state.scratch)?;
                for (frame_idx, gain) in state.vector.iter().enumerate() {
                    for sample in
                        &mut state.scratch[frame_idx * channels..(frame_idx + 1) * channels]
                    {
                        *sample *= gain;
                    }
                }
                stream.write_from_interleaved(&state.scratch)?;
            } else {
                let (input, output) = stream_pair_mut(io.streams, in_idx, out_idx);
                input.as_interleaved(io.arena)?;
                let channels = input.channels() as usize;
                input.read_to_interleaved(io.arena, &mut state.scratch)?;
                for (frame_idx, gain) in state.vector.iter().enumerate() {
                    for sample in
                        &mut state.scratch[frame_idx * channels..(frame_idx + 1) * channels]
                    {
                        *sample *= gain;
                    }
                }
                output.write_from_interleaved(&state.scratch)?;
                if input.sid_available() {
                    let sid = input.sid();
                    output.set_sid(sid);
                }
            }
        }
        Ok(())
    }

    fn process_cmd(&mut self, cmd: &Properties) -> DspResult<()> {
        let Some(volume) = cmd.get_f32("volume") else {
            return Err(DspError::InvalidParam("gain cmd without 'volume'".to_string()));
        };
        let ramp_ms = cmd.get_i32("rampTime").unwrap_or(100).max(1) as u32;
        let stream_id = cmd.get_i32("streamId");
        let shape = match cmd.get_string("shape").as_deref() {
            Some(text) => RampShape::try_from(text)?,
            None => RampShape::Linear,
        };
        let mut matched = false;
        for state in &mut self.gains {
            if stream_id.is_none() || stream_id == Some(state.stream_id) {
                let from = *state.vector.last().unwrap_or(&self.current_gain);
                state.ramp.set_timed_ramp(from, volume, ramp_ms, shape)?;
                matched = true;
            }
        }
        if !matched {
            return Err(DspError::UnknownStreamId(stream_id.unwrap_or(-1)));
        }
        self.current_gain = volume;
        Ok(())
    }

    fn reset(&mut self) {
        for state in &mut self.gains {
            state.vector.fill(self.current_gain);
            let _ = state.ramp.set_timed_ramp(
                self.current_gain,
                self.current_gain,
                1,
                RampShape::Linear,
            );
        }
    }

    fn type_name(&self) -> &'static str {
        "gain"
    }
}
