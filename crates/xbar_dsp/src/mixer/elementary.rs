//! Elementary Mixer
//!
//! Mixes several input streams into one output stream. One elementary mixer
//! exists per mixer output; the inner kernel is a 4x4 gain tile per
//! (output bundle, input bundle) pair, updated per sample while ramps are
//! active and applied as a SIMD multiply-accumulate.

use std::collections::BTreeMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error};

use crate::bundle::CHANNELS_PER_BUNDLE;
use crate::error::{DspError, DspResult};
use crate::module::{ModuleEvent, ModuleEventSender, StreamInfo};
use crate::properties::Properties;
use crate::ramp::{Ramp, RampShape};
use crate::stream::BundleArena;

/// Ramp time used for balance / fader / gain-offset changes
const MIXER_RAMP_MS: u32 = 100;

/// Gains below this are treated as mute when encoding finished events
/// (-144 dB).
const MUTE_THRESHOLD: f32 = 6.309573444801932494e-8;

/// dB*10 sentinel reported for a fully attenuated side
const MUTE_SENTINEL: i32 = 1440;

/// Mixer event types carried in the `eventType` property of finished events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEventType {
    BalanceFinished = 0,
    FaderFinished = 1,
    InputGainOffsetFinished = 2,
}

/// Channel roles of the 6-channel output layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MultichannelIndex {
    FrontLeft = 0,
    FrontRight = 1,
    Lfe = 2,
    Center = 3,
    RearLeft = 4,
    RearRight = 5,
}

/// A 4x4 gain tile: first index output channel, second index input channel
#[derive(Debug, Clone, Copy)]
#[repr(C, align(16))]
pub struct GainTile(pub [[f32; 4]; 4]);

impl GainTile {
    fn zeroed() -> Self {
        Self([[0.0; 4]; 4])
    }
}

/// Position of one gain value inside the tile matrix
#[derive(Debug, Clone, Copy)]
struct TileSlot {
    out_bundle: usize,
    in_bundle: usize,
    out_chan: usize,
    in_chan: usize,
}

struct BalanceParams {
    left: Vec<f32>,
    left_target: f32,
    ramp_left: Ramp,
    right: Vec<f32>,
    right_target: f32,
    ramp_right: Ramp,
    active: bool,
}

struct FadeParams {
    front: Vec<f32>,
    front_target: f32,
    ramp_front: Ramp,
    rear: Vec<f32>,
    rear_target: f32,
    ramp_rear: Ramp,
    active: bool,
}

struct GainOffsetParams {
    offset: Vec<f32>,
    target: f32,
    ramp: Ramp,
    active: bool,
}

struct StreamParams {
    name: String,
    channels: u32,
    balance: BalanceParams,
    fade: FadeParams,
    gain_offset: GainOffsetParams,
    /// One tile slot per output channel
    slots: Vec<TileSlot>,
}

#[derive(Debug, Clone, Copy)]
struct BalanceEntry {
    stream_id: i32,
    left: f32,
    right: f32,
}

#[derive(Debug, Clone, Copy)]
struct FaderEntry {
    stream_id: i32,
    front: f32,
    rear: f32,
}

#[derive(Debug, Clone, Copy)]
struct GainOffsetEntry {
    stream_id: i32,
    gain_offset: f32,
}

/// Mixer for one output stream
pub struct ElementaryMixer {
    frame_length: u32,
    sample_rate: u32,
    instance_name: String,
    output_channels: u32,
    /// Arena indices of the output bundles, sorted and unique
    out_bundles: Vec<usize>,
    /// Arena indices of the input bundles, sorted and unique
    in_bundles: Vec<usize>,
    /// Tile matrix, row-major `[out_bundle][in_bundle]`
    tiles: Vec<GainTile>,
    stream_params: BTreeMap<i32, StreamParams>,
    ramp_active: Vec<i32>,
    multichannel_present: bool,
    balance_tx: Sender<BalanceEntry>,
    balance_rx: Receiver<BalanceEntry>,
    fader_tx: Sender<FaderEntry>,
    fader_rx: Receiver<FaderEntry>,
    gain_tx: Sender<GainOffsetEntry>,
    gain_rx: Receiver<GainOffsetEntry>,
    events: Option<ModuleEventSender>,
}

impl ElementaryMixer {
    pub fn new(
        instance_name: &str,
        output: &StreamInfo,
        inputs: &[StreamInfo],
        frame_length: u32,
        sample_rate: u32,
        events: Option<ModuleEventSender>,
    ) -> DspResult<Self> {
        if output.channels != 2 && output.channels != 4 && output.channels != 6 {
            return Err(DspError::InvalidParam(format!(
                "mixer output must have 2, 4 or 6 channels, got {}",
                output.channels
            )));
        }
        let mut out_bundles: Vec<usize> = output.assignments.iter().map(|a| a.bundle).collect();
        out_bundles.sort_unstable();
        out_bundles.dedup();

        let mut in_bundles: Vec<usize> = inputs
            .iter()
            .flat_map(|info| info.assignments.iter().map(|a| a.bundle))
            .collect();
        in_bundles.sort_unstable();
        in_bundles.dedup();

        let tiles = vec![GainTile::zeroed(); out_bundles.len() * in_bundles.len()];

        // Output channel -> (bundle position, channel within bundle)
        let output_mapping = channel_mapping(output, &out_bundles)?;

        let multichannel_present = inputs.iter().any(|info| info.channels == 6);

        let mut stream_params = BTreeMap::new();
        for info in inputs {
            if info.channels != 1 && info.channels != 2 && info.channels != 6 {
                return Err(DspError::InvalidParam(format!(
                    "mixer input must have 1, 2 or 6 channels, got {}",
                    info.channels
                )));
            }
            let input_mapping = channel_mapping(info, &in_bundles)?;
            let mut slots = Vec::with_capacity(output.channels as usize);
            let mut row = 0usize;
            for (out_pos, out_chan) in output_mapping.iter().take(output.channels as usize) {
                let (in_pos, in_chan) = input_mapping[row];
                slots.push(TileSlot {
                    out_bundle: *out_pos,
                    in_bundle: in_pos,
                    out_chan: *out_chan,
                    in_chan,
                });
                row = (row + 1) % info.channels as usize;
            }
            stream_params.insert(
                info.id,
                StreamParams {
                    name: info.name.clone(),
                    channels: info.channels,
                    balance: BalanceParams {
                        left: vec![1.0; frame_length as usize],
                        left_target: 1.0,
                        ramp_left: Ramp::new(sample_rate, frame_length),
                        right: vec![1.0; frame_length as usize],
                        right_target: 1.0,
                        ramp_right: Ramp::new(sample_rate, frame_length),
                        active: false,
                    },
                    fade: FadeParams {
                        front: vec![1.0; frame_length as usize],
                        front_target: 1.0,
                        ramp_front: Ramp::new(sample_rate, frame_length),
                        rear: vec![1.0; frame_length as usize],
                        rear_target: 1.0,
                        ramp_rear: Ramp::new(sample_rate, frame_length),
                        active: false,
                    },
                    gain_offset: GainOffsetParams {
                        offset: vec![1.0; frame_length as usize],
                        target: 1.0,
                        ramp: Ramp::new(sample_rate, frame_length),
                        active: false,
                    },
                    slots,
                },
            );
        }

        let (balance_tx, balance_rx) = unbounded();
        let (fader_tx, fader_rx) = unbounded();
        let (gain_tx, gain_rx) = unbounded();

        let mut mixer = Self {
            frame_length,
            sample_rate,
            instance_name: instance_name.to_string(),
            output_channels: output.channels,
            out_bundles,
            in_bundles,
            tiles,
            stream_params,
            ramp_active: Vec::new(),
            multichannel_present,
            balance_tx,
            balance_rx,
            fader_tx,
            fader_rx,
            gain_tx,
            gain_rx,
            events,
        };
        mixer.setup_initial_gains();
        Ok(mixer)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn has_stream(&self, stream_id: i32) -> bool {
        self.stream_params.contains_key(&stream_id)
    }

    /// Seed the tile matrix with the static up/down-mix gains.
    ///
    /// Mono and stereo inputs feed only the first two output channels; when a
    /// multichannel input shares the mixer, stereo rears are attenuated by
    /// 0.707 and mono stays off the rear/center/LFE entirely.
    fn setup_initial_gains(&mut self) {
        let num_in = self.in_bundles.len();
        for params in self.stream_params.values() {
            for (j, slot) in params.slots.iter().enumerate() {
                let gain = match params.channels {
                    1 => {
                        if self.multichannel_present && j >= MultichannelIndex::Lfe as usize {
                            0.0
                        } else {
                            1.0
                        }
                    }
                    2 => {
                        if self.multichannel_present {
                            if j < MultichannelIndex::Lfe as usize {
                                1.0
                            } else if j < MultichannelIndex::RearLeft as usize {
                                0.0
                            } else {
                                0.707
                            }
                        } else {
                            1.0
                        }
                    }
                    _ => 1.0,
                };
                self.tiles[slot.out_bundle * num_in + slot.in_bundle].0[slot.out_chan]
                    [slot.in_chan] = gain;
            }
        }
    }

    /// Queue a balance change (linear gains per side)
    pub fn set_balance(&self, stream_id: i32, left: f32, right: f32) -> DspResult<()> {
        if !self.stream_params.contains_key(&stream_id) {
            error!(stream_id, "set_balance: unknown stream id");
            return Err(DspError::UnknownStreamId(stream_id));
        }
        let _ = self.balance_tx.send(BalanceEntry {
            stream_id,
            left,
            right,
        });
        Ok(())
    }

    /// Queue a fader change (linear gains front/rear)
    pub fn set_fader(&self, stream_id: i32, front: f32, rear: f32) -> DspResult<()> {
        if !self.stream_params.contains_key(&stream_id) {
            error!(stream_id, "set_fader: unknown stream id");
            return Err(DspError::UnknownStreamId(stream_id));
        }
        let _ = self.fader_tx.send(FaderEntry {
            stream_id,
            front,
            rear,
        });
        Ok(())
    }

    /// Queue an input gain offset change (linear gain, all channels)
    pub fn set_input_gain_offset(&self, stream_id: i32, gain_offset: f32) -> DspResult<()> {
        if !self.stream_params.contains_key(&stream_id) {
            error!(stream_id, "set_input_gain_offset: unknown stream id");
            return Err(DspError::UnknownStreamId(stream_id));
        }
        let _ = self.gain_tx.send(GainOffsetEntry {
            stream_id,
            gain_offset,
        });
        Ok(())
    }

    /// Execute one period: drain commands, advance ramps, accumulate the
    /// input bundles into the output bundles through the gain tiles.
    pub fn run(&mut self, arena: &mut BundleArena) -> DspResult<()> {
        self.check_queues();

        if !self.ramp_active.is_empty() {
            self.ramp_active.sort_unstable();
            self.ramp_active.dedup();
            for stream_id in self.ramp_active.clone() {
                let Some(params) = self.stream_params.get_mut(&stream_id) else {
                    error!(stream_id, "ramp-active stream disappeared");
                    continue;
                };
                if params.balance.active {
                    params.balance.ramp_left.ramp_values(&mut params.balance.left)?;
                    params
                        .balance
                        .ramp_right
                        .ramp_values(&mut params.balance.right)?;
                }
                if params.fade.active {
                    params.fade.ramp_front.ramp_values(&mut params.fade.front)?;
                    params.fade.ramp_rear.ramp_values(&mut params.fade.rear)?;
                }
                if params.gain_offset.active {
                    params
                        .gain_offset
                        .ramp
                        .ramp_values(&mut params.gain_offset.offset)?;
                }
            }
        }

        let num_in = self.in_bundles.len();
        for (out_pos, &out_idx) in self.out_bundles.iter().enumerate() {
            for (in_pos, &in_idx) in self.in_bundles.iter().enumerate() {
                let (input, output) = arena.pair_mut(in_idx, out_idx);
                let in_data = input.as_slice();
                let out_data = output.as_mut_slice();
                for sample_idx in 0..self.frame_length as usize {
                    update_gain_tiles(
                        &self.ramp_active,
                        &self.stream_params,
                        &mut self.tiles,
                        num_in,
                        self.output_channels,
                        self.multichannel_present,
                        sample_idx,
                    );
                    let tile = &self.tiles[out_pos * num_in + in_pos];
                    accumulate_sample(
                        &mut out_data[4 * sample_idx..4 * sample_idx + 4],
                        &in_data[4 * sample_idx..4 * sample_idx + 4],
                        tile,
                    );
                }
            }
        }

        self.update_ramp_active_streams();
        Ok(())
    }

    fn check_queues(&mut self) {
        while let Ok(entry) = self.balance_rx.try_recv() {
            self.update_balance(entry);
        }
        while let Ok(entry) = self.fader_rx.try_recv() {
            self.update_fader(entry);
        }
        while let Ok(entry) = self.gain_rx.try_recv() {
            self.update_gain_offset(entry);
        }
    }

    fn update_balance(&mut self, entry: BalanceEntry) {
        let frame = self.frame_length as usize;
        let Some(params) = self.stream_params.get_mut(&entry.stream_id) else {
            return;
        };
        params.balance.left_target = entry.left;
        params.balance.right_target = entry.right;
        let _ = params.balance.ramp_left.set_timed_ramp(
            params.balance.left[frame - 1],
            entry.left,
            MIXER_RAMP_MS,
            RampShape::Linear,
        );
        let _ = params.balance.ramp_right.set_timed_ramp(
            params.balance.right[frame - 1],
            entry.right,
            MIXER_RAMP_MS,
            RampShape::Linear,
        );
        debug!(
            stream_id = entry.stream_id,
            left = entry.left,
            right = entry.right,
            "arming balance ramp"
        );
        params.balance.active = true;
        self.ramp_active.push(entry.stream_id);
    }

    fn update_fader(&mut self, entry: FaderEntry) {
        let frame = self.frame_length as usize;
        let Some(params) = self.stream_params.get_mut(&entry.stream_id) else {
            return;
        };
        params.fade.front_target = entry.front;
        params.fade.rear_target = entry.rear;
        let _ = params.fade.ramp_front.set_timed_ramp(
            params.fade.front[frame - 1],
            entry.front,
            MIXER_RAMP_MS,
            RampShape::Linear,
        );
        let _ = params.fade.ramp_rear.set_timed_ramp(
            params.fade.rear[frame - 1],
            entry.rear,
            MIXER_RAMP_MS,
            RampShape::Linear,
        );
        debug!(
            stream_id = entry.stream_id,
            front = entry.front,
            rear = entry.rear,
            "arming fader ramp"
        );
        params.fade.active = true;
        self.ramp_active.push(entry.stream_id);
    }

    fn update_gain_offset(&mut self, entry: GainOffsetEntry) {
        let frame = self.frame_length as usize;
        let Some(params) = self.stream_params.get_mut(&entry.stream_id) else {
            return;
        };
        params.gain_offset.target = entry.gain_offset;
        let _ = params.gain_offset.ramp.set_timed_ramp(
            params.gain_offset.offset[frame - 1],
            entry.gain_offset,
            MIXER_RAMP_MS,
            RampShape::Linear,
        );
        debug!(
            stream_id = entry.stream_id,
            gain_offset = entry.gain_offset,
            "arming gain offset ramp"
        );
        params.gain_offset.active = true;
        self.ramp_active.push(entry.stream_id);
    }

    /// Drop streams whose ramps reached their target from the active list and
    /// emit the corresponding finished events.
    fn update_ramp_active_streams(&mut self) {
        if self.ramp_active.is_empty() {
            return;
        }
        self.ramp_active.sort_unstable();
        self.ramp_active.dedup();
        let frame = self.frame_length as usize;
        let mut finished_events: Vec<ModuleEvent> = Vec::new();
        let mut still_active = Vec::with_capacity(self.ramp_active.len());
        for &stream_id in &self.ramp_active {
            let Some(params) = self.stream_params.get_mut(&stream_id) else {
                continue;
            };
            if params.balance.active
                && params.balance.right[frame - 1] == params.balance.right_target
                && params.balance.left[frame - 1] == params.balance.left_target
            {
                params.balance.active = false;
                finished_events.push(balance_finished_event(
                    &self.instance_name,
                    &params.name,
                    params.balance.left_target,
                    params.balance.right_target,
                ));
            }
            if params.fade.active
                && params.fade.front[frame - 1] == params.fade.front_target
                && params.fade.rear[frame - 1] == params.fade.rear_target
            {
                params.fade.active = false;
                finished_events.push(fader_finished_event(
                    &self.instance_name,
                    &params.name,
                    params.fade.front_target,
                    params.fade.rear_target,
                ));
            }
            if params.gain_offset.active
                && params.gain_offset.offset[frame - 1] == params.gain_offset.target
            {
                params.gain_offset.active = false;
                finished_events.push(gain_offset_finished_event(
                    &self.instance_name,
                    &params.name,
                    params.gain_offset.target,
                ));
            }
            if params.balance.active || params.fade.active || params.gain_offset.active {
                still_active.push(stream_id);
            }
        }
        self.ramp_active = still_active;
        if let Some(events) = &self.events {
            for event in finished_events {
                let _ = events.try_send(event);
            }
        }
    }
}

/// Build the (bundle position, channel) mapping of one stream against a
/// sorted unique bundle list
fn channel_mapping(info: &StreamInfo, bundles: &[usize]) -> DspResult<Vec<(usize, usize)>> {
    let mut mapping = Vec::with_capacity(info.channels as usize);
    for assignment in &info.assignments {
        let Some(position) = bundles.iter().position(|&b| b == assignment.bundle) else {
            return Err(DspError::InitFailed(format!(
                "bundle {} of stream '{}' missing from bundle list",
                assignment.bundle, info.name
            )));
        };
        for chan in 0..assignment.channels {
            mapping.push((position, (assignment.index + chan) as usize));
        }
    }
    if mapping.len() != info.channels as usize {
        return Err(DspError::InitFailed(format!(
            "stream '{}' bundle channels {} do not cover {} declared channels",
            info.name,
            mapping.len(),
            info.channels
        )));
    }
    Ok(mapping)
}

#[allow(clippy::too_many_arguments)]
fn update_gain_tiles(
    ramp_active: &[i32],
    stream_params: &BTreeMap<i32, StreamParams>,
    tiles: &mut [GainTile],
    num_in: usize,
    output_channels: u32,
    multichannel_present: bool,
    sample_idx: usize,
) {
    for stream_id in ramp_active {
        let Some(params) = stream_params.get(stream_id) else {
            continue;
        };
        match output_channels {
            2 => update_matrix_2ch(params, tiles, num_in, sample_idx),
            4 => update_matrix_4ch(params, tiles, num_in, sample_idx),
            _ => update_matrix_6ch(params, tiles, num_in, sample_idx, multichannel_present),
        }
    }
}

#[inline]
fn set_slot(tiles: &mut [GainTile], num_in: usize, slot: TileSlot, value: f32) {
    tiles[slot.out_bundle * num_in + slot.in_bundle].0[slot.out_chan][slot.in_chan] = value;
}

fn update_matrix_2ch(params: &StreamParams, tiles: &mut [GainTile], num_in: usize, idx: usize) {
    let gain = params.gain_offset.offset[idx];
    set_slot(tiles, num_in, params.slots[0], params.balance.left[idx] * gain);
    set_slot(tiles, num_in, params.slots[1], params.balance.right[idx] * gain);
}

fn update_matrix_4ch(params: &StreamParams, tiles: &mut [GainTile], num_in: usize, idx: usize) {
    let gain = params.gain_offset.offset[idx];
    let front = params.fade.front[idx];
    let rear = params.fade.rear[idx];
    set_slot(tiles, num_in, params.slots[0], params.balance.left[idx] * front * gain);
    set_slot(tiles, num_in, params.slots[1], params.balance.right[idx] * front * gain);
    set_slot(tiles, num_in, params.slots[2], params.balance.left[idx] * rear * gain);
    set_slot(tiles, num_in, params.slots[3], params.balance.right[idx] * rear * gain);
}

fn update_matrix_6ch(
    params: &StreamParams,
    tiles: &mut [GainTile],
    num_in: usize,
    idx: usize,
    multichannel_present: bool,
) {
    let gain = params.gain_offset.offset[idx];
    let left = params.balance.left[idx];
    let right = params.balance.right[idx];
    let front = params.fade.front[idx];
    let rear = params.fade.rear[idx];
    if !multichannel_present {
        set_slot(tiles, num_in, params.slots[0], left * front * gain);
        set_slot(tiles, num_in, params.slots[1], right * front * gain);
        set_slot(tiles, num_in, params.slots[2], left * gain);
        set_slot(tiles, num_in, params.slots[3], right * gain);
        set_slot(tiles, num_in, params.slots[4], left * rear * gain);
        set_slot(tiles, num_in, params.slots[5], right * rear * gain);
        return;
    }
    // 6-channel layout: FL FR C LFE RL RR. Balance does not touch C/LFE of
    // 1- and 2-channel inputs; the center attenuation of a 6-channel input
    // follows the spread between the balance sides.
    set_slot(
        tiles,
        num_in,
        params.slots[MultichannelIndex::FrontLeft as usize],
        front * left * gain,
    );
    set_slot(
        tiles,
        num_in,
        params.slots[MultichannelIndex::FrontRight as usize],
        front * right * gain,
    );
    match params.channels {
        1 => {
            set_slot(tiles, num_in, params.slots[MultichannelIndex::Center as usize], 0.0);
            set_slot(tiles, num_in, params.slots[MultichannelIndex::Lfe as usize], 0.0);
        }
        2 => {
            set_slot(tiles, num_in, params.slots[MultichannelIndex::Center as usize], 0.0);
            set_slot(tiles, num_in, params.slots[MultichannelIndex::Lfe as usize], 0.0);
            set_slot(
                tiles,
                num_in,
                params.slots[MultichannelIndex::RearLeft as usize],
                rear * left * gain * 0.707,
            );
            set_slot(
                tiles,
                num_in,
                params.slots[MultichannelIndex::RearRight as usize],
                rear * right * gain * 0.707,
            );
        }
        _ => {
            let center_attenuation = if left == right {
                left
            } else {
                1.0 - (right - left).abs() * 0.5
            };
            set_slot(
                tiles,
                num_in,
                params.slots[MultichannelIndex::Center as usize],
                front * center_attenuation * gain,
            );
            set_slot(tiles, num_in, params.slots[MultichannelIndex::Lfe as usize], gain);
            set_slot(
                tiles,
                num_in,
                params.slots[MultichannelIndex::RearLeft as usize],
                rear * left * gain,
            );
            set_slot(
                tiles,
                num_in,
                params.slots[MultichannelIndex::RearRight as usize],
                rear * right * gain,
            );
        }
    }
}

/// `out[o] += sum_i in[i] * tile[o][i]`, in the fixed SIMD add order
#[inline]
fn accumulate_sample(out: &mut [f32], inp: &[f32], tile: &GainTile) {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { sse_accumulate(out.as_mut_ptr(), inp.as_ptr(), tile) }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        scalar_accumulate(out, inp, tile)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn sse_accumulate(out: *mut f32, inp: *const f32, tile: &GainTile) {
    use std::arch::x86_64::*;
    let v = _mm_loadu_ps(inp);
    let s0 = _mm_mul_ps(v, _mm_load_ps(tile.0[0].as_ptr()));
    let s1 = _mm_mul_ps(v, _mm_load_ps(tile.0[1].as_ptr()));
    let s2 = _mm_mul_ps(v, _mm_load_ps(tile.0[2].as_ptr()));
    let s3 = _mm_mul_ps(v, _mm_load_ps(tile.0[3].as_ptr()));
    let t0 = _mm_add_ps(_mm_unpacklo_ps(s0, s1), _mm_unpackhi_ps(s0, s1));
    let t1 = _mm_add_ps(_mm_unpacklo_ps(s2, s3), _mm_unpackhi_ps(s2, s3));
    let s = _mm_add_ps(_mm_movelh_ps(t0, t1), _mm_movehl_ps(t1, t0));
    let sum = _mm_add_ps(_mm_loadu_ps(out), s);
    _mm_storeu_ps(out, sum);
}

/// Scalar fallback mirroring the SIMD lane add order bit-exactly:
/// `(x0 + x2) + (x1 + x3)` per output channel.
#[allow(dead_code)]
#[inline]
fn scalar_accumulate(out: &mut [f32], inp: &[f32], tile: &GainTile) {
    for o in 0..CHANNELS_PER_BUNDLE as usize {
        let g = &tile.0[o];
        let x0 = inp[0] * g[0];
        let x1 = inp[1] * g[1];
        let x2 = inp[2] * g[2];
        let x3 = inp[3] * g[3];
        out[o] += (x0 + x2) + (x1 + x3);
    }
}

fn make_event(instance_name: &str, pin_name: &str, properties: Properties) -> ModuleEvent {
    ModuleEvent {
        type_name: "mixer".to_string(),
        instance_name: instance_name.to_string(),
        pin_name: pin_name.to_string(),
        properties,
    }
}

/// Encode a finished balance as dB*10: negative when the right side is
/// attenuated, with +-1440 as mute sentinels.
fn balance_finished_event(
    instance_name: &str,
    pin_name: &str,
    left: f32,
    right: f32,
) -> ModuleEvent {
    let balance = if left < MUTE_THRESHOLD {
        MUTE_SENTINEL
    } else if right < MUTE_THRESHOLD {
        -MUTE_SENTINEL
    } else if left < 1.0 {
        (-200.0 * left.log10() + 0.5) as i32
    } else if right < 1.0 {
        (200.0 * right.log10() - 0.5) as i32
    } else {
        0
    };
    let mut properties = Properties::new();
    properties.set("eventType", MixerEventType::BalanceFinished as i32);
    properties.set("balance", balance);
    make_event(instance_name, pin_name, properties)
}

fn fader_finished_event(
    instance_name: &str,
    pin_name: &str,
    front: f32,
    rear: f32,
) -> ModuleEvent {
    let fader = if front < MUTE_THRESHOLD {
        -MUTE_SENTINEL
    } else if rear < MUTE_THRESHOLD {
        MUTE_SENTINEL
    } else if front < 1.0 {
        (200.0 * front.log10() - 0.5) as i32
    } else if rear < 1.0 {
        (-200.0 * rear.log10() + 0.5) as i32
    } else {
        0
    };
    let mut properties = Properties::new();
    properties.set("eventType", MixerEventType::FaderFinished as i32);
    properties.set("fader", fader);
    make_event(instance_name, pin_name, properties)
}

fn gain_offset_finished_event(instance_name: &str, pin_name: &str, gain: f32) -> ModuleEvent {
    let rounding = if gain >= 1.0 { 0.5 } else { -0.5 };
    let encoded = (200.0 * gain.log10() + rounding) as i32;
    let mut properties = Properties::new();
    properties.set("eventType", MixerEventType::InputGainOffsetFinished as i32);
    properties.set("gainOffset", encoded);
    make_event(instance_name, pin_name, properties)
}
