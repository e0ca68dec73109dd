//! Mixer
//!
//! The mixer module decomposes into one [`ElementaryMixer`] per output
//! stream. Runtime parameter changes (balance, fader, input gain offset)
//! arrive through lock-free queues and are picked up at the next period.

mod elementary;

pub use elementary::{ElementaryMixer, GainTile, MixerEventType};

use crate::error::{DspError, DspResult};
use crate::module::{ModuleContext, ModuleIo, ProcessingModule};
use crate::properties::Properties;

/// All elementary mixers of one mixer module instance
pub struct MixerCore {
    elementary: Vec<ElementaryMixer>,
}

impl MixerCore {
    pub fn new() -> Self {
        Self {
            elementary: Vec::new(),
        }
    }

    pub fn elementary_mixers(&self) -> &[ElementaryMixer] {
        &self.elementary
    }

    /// Route a balance change to the elementary mixer owning the stream
    pub fn set_balance(&self, stream_id: i32, left: f32, right: f32) -> DspResult<()> {
        self.find(stream_id)?.set_balance(stream_id, left, right)
    }

    /// Route a fader change to the elementary mixer owning the stream
    pub fn set_fader(&self, stream_id: i32, front: f32, rear: f32) -> DspResult<()> {
        self.find(stream_id)?.set_fader(stream_id, front, rear)
    }

    /// Route an input gain offset change to the elementary mixer owning the
    /// stream
    pub fn set_input_gain_offset(&self, stream_id: i32, gain_offset: f32) -> DspResult<()> {
        self.find(stream_id)?
            .set_input_gain_offset(stream_id, gain_offset)
    }

    fn find(&self, stream_id: i32) -> DspResult<&ElementaryMixer> {
        self.elementary
            .iter()
            .find(|mixer| mixer.has_stream(stream_id))
            .ok_or(DspError::UnknownStreamId(stream_id))
    }
}

impl Default for MixerCore {
    fn default() -> Self {
        Self::new()
    }
}

/// The mixer as a pipeline processing module
pub struct MixerModule {
    core: MixerCore,
    inputs: Vec<usize>,
}

impl MixerModule {
    pub fn new() -> Self {
        Self {
            core: MixerCore::new(),
            inputs: Vec::new(),
        }
    }

    pub fn core(&self) -> &MixerCore {
        &self.core
    }
}

impl Default for MixerModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingModule for MixerModule {
    fn init(&mut self, ctx: &ModuleContext) -> DspResult<()> {
        if ctx.outputs.is_empty() {
            return Err(DspError::InitFailed(format!(
                "mixer '{}' has no output streams",
                ctx.instance_name
            )));
        }
        self.core.elementary.clear();
        self.inputs = ctx.inputs.iter().map(|info| info.index).collect();
        for (output_pos, output) in ctx.outputs.iter().enumerate() {
            // All inputs mapped to this output feed its elementary mixer;
            // without explicit mappings every input feeds every output.
            let mapped: Vec<_> = if ctx.mappings.is_empty() {
                ctx.inputs.to_vec()
            } else {
                ctx.mappings
                    .iter()
                    .filter(|(_, out)| *out == output_pos)
                    .map(|(inp, _)| ctx.inputs[*inp].clone())
                    .collect()
            };
            if mapped.is_empty() {
                return Err(DspError::InitFailed(format!(
                    "mixer output '{}' has no mapped inputs",
                    output.name
                )));
            }
            self.core.elementary.push(ElementaryMixer::new(
                ctx.instance_name,
                output,
                &mapped,
                ctx.frame_length,
                ctx.sample_rate,
                ctx.events.clone(),
            )?);
        }
        Ok(())
    }

    fn process(&mut self, io: &mut ModuleIo) -> DspResult<()> {
        for &input in io.inputs {
            io.streams[input].as_bundled(io.arena)?;
        }
        // Output bundles were cleared by the pipeline before the module run.
        for mixer in &mut self.core.elementary {
            mixer.run(io.arena)?;
        }
        Ok(())
    }

    fn process_cmd(&mut self, cmd: &Properties) -> DspResult<()> {
        let Some(command) = cmd.get_string("cmd") else {
            return Err(DspError::InvalidParam("mixer cmd without 'cmd' key".to_string()));
        };
        let stream_id = cmd
            .get_i32("streamId")
            .ok_or_else(|| DspError::InvalidParam("mixer cmd without 'streamId'".to_string()))?;
        match command.as_str() {
            "setBalance" => {
                let left = cmd.get_f32("left").ok_or_else(|| {
                    DspError::InvalidParam("setBalance without 'left'".to_string())
                })?;
                let right = cmd.get_f32("right").ok_or_else(|| {
                    DspError::InvalidParam("setBalance without 'right'".to_string())
                })?;
                self.core.set_balance(stream_id, left, right)
            }
            "setFader" => {
                let front = cmd.get_f32("front").ok_or_else(|| {
                    DspError::InvalidParam("setFader without 'front'".to_string())
                })?;
                let rear = cmd.get_f32("rear").ok_or_else(|| {
                    DspError::InvalidParam("setFader without 'rear'".to_string())
                })?;
                self.core.set_fader(stream_id, front, rear)
            }
            "setInputGainOffset" => {
                let gain = cmd.get_f32("gainOffset").ok_or_else(|| {
                    DspError::InvalidParam("setInputGainOffset without 'gainOffset'".to_string())
                })?;
                self.core.set_input_gain_offset(stream_id, gain)
            }
            other => Err(DspError::InvalidParam(format!("unknown mixer cmd '{other}'"))),
        }
    }

    fn type_name(&self) -> &'static str {
        "mixer"
    }
}
