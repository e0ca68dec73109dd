//! Adaptive Sample-Rate Converter
//!
//! Buffered resampler between asynchronous clock domains. The nominal ratio
//! is fixed at construction from the source and sink sample rates; a feedback
//! loop driven by the internal fill level nudges the effective ratio so the
//! consumer neither drains nor overruns the buffer.
//!
//! Start-up is underrun-free by design: output is withheld until the buffer
//! has been filled once (one full ASRC buffer of `periods * period_size`
//! frames).

use std::collections::VecDeque;

use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Minimum number of periods the ASRC buffer must cover
pub const MIN_ASRC_PERIODS: u32 = 4;

/// Proportional gain of the fill-level feedback loop
const FEEDBACK_GAIN: f64 = 0.02;

/// Maximum relative deviation of the adaptive ratio from the nominal one
const MAX_RATIO_DEVIATION: f64 = 0.01;

/// Adaptive resampler for one job or device
pub struct Asrc {
    channels: u32,
    /// Input frames consumed per output frame
    ratio_nominal: f64,
    ratio_adaptive: f64,
    /// Interleaved FIFO of input frames
    fifo: VecDeque<f32>,
    capacity_frames: u32,
    /// Fill level the feedback loop regulates towards
    setpoint_frames: f64,
    /// Fractional read position between FIFO frame 0 and 1
    phase: f64,
    /// Last frame popped from the FIFO, for interpolation across pulls
    history: Vec<f32>,
    history_valid: bool,
    primed: bool,
    total_in: u64,
    total_out: u64,
}

impl Asrc {
    /// `capacity_frames` is `num_periods_asrc_buffer * period_size`; the
    /// period count must be at least [`MIN_ASRC_PERIODS`] (validated by the
    /// device layer).
    pub fn new(
        channels: u32,
        input_rate: u32,
        output_rate: u32,
        capacity_frames: u32,
    ) -> CoreResult<Self> {
        if channels == 0 || input_rate == 0 || output_rate == 0 || capacity_frames == 0 {
            return Err(CoreError::InvalidParam(
                "asrc requires nonzero channels, rates and capacity".to_string(),
            ));
        }
        let ratio = input_rate as f64 / output_rate as f64;
        Ok(Self {
            channels,
            ratio_nominal: ratio,
            ratio_adaptive: ratio,
            fifo: VecDeque::with_capacity((capacity_frames * channels) as usize),
            capacity_frames,
            setpoint_frames: capacity_frames as f64 * 0.5,
            phase: 0.0,
            history: vec![0.0; channels as usize],
            history_valid: false,
            primed: false,
            total_in: 0,
            total_out: 0,
        })
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn nominal_ratio(&self) -> f64 {
        self.ratio_nominal
    }

    pub fn adaptive_ratio(&self) -> f32 {
        self.ratio_adaptive as f32
    }

    /// Current fill level in frames
    pub fn fill_level(&self) -> u32 {
        (self.fifo.len() / self.channels as usize) as u32
    }

    pub fn free_frames(&self) -> u32 {
        self.capacity_frames - self.fill_level()
    }

    /// Total frames ever pushed / pulled, for diagnostics
    pub fn total_frames_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_frames_out(&self) -> u64 {
        self.total_out
    }

    /// Feed interleaved input frames. Returns the number of frames accepted;
    /// frames beyond the free space are not consumed.
    pub fn push(&mut self, samples: &[f32]) -> u32 {
        let frames = (samples.len() / self.channels as usize) as u32;
        let accepted = frames.min(self.free_frames());
        let take = (accepted * self.channels) as usize;
        self.fifo.extend(samples[..take].iter().copied());
        self.total_in += accepted as u64;
        if !self.primed && self.free_frames() == 0 {
            self.primed = true;
            debug!(fill = self.fill_level(), "asrc primed");
        }
        accepted
    }

    /// Pull interleaved output frames into `out`. Returns the number of
    /// frames produced; a short count means the caller carries the remainder
    /// forward to the next period.
    pub fn pull(&mut self, out: &mut [f32]) -> u32 {
        if !self.primed {
            return 0;
        }
        let requested = (out.len() / self.channels as usize) as u32;
        self.update_feedback();

        let channels = self.channels as usize;
        if !self.history_valid {
            if self.fifo.len() < channels {
                return 0;
            }
            for chan in 0..channels {
                self.history[chan] = self.fifo.pop_front().unwrap_or(0.0);
            }
            self.history_valid = true;
        }
        let mut produced = 0u32;
        while produced < requested {
            // Consume whole input frames the phase has moved past.
            while self.phase >= 1.0 {
                if self.fifo.len() < channels {
                    break;
                }
                for chan in 0..channels {
                    self.history[chan] = self.fifo.pop_front().unwrap_or(0.0);
                }
                self.phase -= 1.0;
            }
            if self.phase >= 1.0 || self.fifo.len() < channels {
                break;
            }
            let frac = self.phase as f32;
            for chan in 0..channels {
                let next = self.fifo[chan];
                let prev = self.history[chan];
                out[produced as usize * channels + chan] = prev + (next - prev) * frac;
            }
            self.phase += self.ratio_adaptive;
            produced += 1;
        }
        self.total_out += produced as u64;
        produced
    }

    /// Nudge the effective ratio towards the fill-level setpoint. A fuller
    /// buffer raises the ratio (consume faster); an emptier one lowers it.
    fn update_feedback(&mut self) {
        let fill = self.fill_level() as f64;
        let deviation = (fill - self.setpoint_frames) / self.capacity_frames as f64;
        let adjusted = self.ratio_nominal * (1.0 + FEEDBACK_GAIN * deviation);
        let min = self.ratio_nominal * (1.0 - MAX_RATIO_DEVIATION);
        let max = self.ratio_nominal * (1.0 + MAX_RATIO_DEVIATION);
        self.ratio_adaptive = adjusted.clamp(min, max);
    }

    /// Drop all buffered input and return to the unprimed state
    pub fn reset(&mut self) {
        self.fifo.clear();
        self.history.fill(0.0);
        self.history_valid = false;
        self.phase = 0.0;
        self.primed = false;
        self.ratio_adaptive = self.ratio_nominal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prime(asrc: &mut Asrc, value: f32) {
        while asrc.free_frames() > 0 {
            let chunk = vec![value; 64 * asrc.channels() as usize];
            asrc.push(&chunk);
        }
    }

    #[test]
    fn test_invalid_params() {
        assert!(Asrc::new(0, 48_000, 48_000, 256).is_err());
        assert!(Asrc::new(2, 0, 48_000, 256).is_err());
    }

    #[test]
    fn test_no_output_before_primed() {
        let mut asrc = Asrc::new(2, 48_000, 48_000, 256).unwrap();
        asrc.push(&vec![0.5; 128]);
        let mut out = vec![0.0f32; 128];
        assert_eq!(asrc.pull(&mut out), 0);

        prime(&mut asrc, 0.5);
        assert!(asrc.pull(&mut out) > 0);
    }

    #[test]
    fn test_push_respects_capacity() {
        let mut asrc = Asrc::new(1, 48_000, 48_000, 64).unwrap();
        let accepted = asrc.push(&vec![0.0; 100]);
        assert_eq!(accepted, 64);
        assert_eq!(asrc.fill_level(), 64);
        assert_eq!(asrc.push(&[0.0; 4]), 0);
    }

    #[test]
    fn test_unity_ratio_passes_samples() {
        let mut asrc = Asrc::new(1, 48_000, 48_000, 256).unwrap();
        prime(&mut asrc, 0.25);
        let mut out = vec![0.0f32; 64];
        let produced = asrc.pull(&mut out);
        assert_eq!(produced, 64);
        for &v in &out {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_upsampling_produces_requested_frames() {
        // 8 kHz -> 48 kHz: one input period feeds six output periods
        let mut asrc = Asrc::new(1, 8_000, 48_000, 256).unwrap();
        prime(&mut asrc, 0.5);
        let mut out = vec![0.0f32; 384];
        let produced = asrc.pull(&mut out);
        assert_eq!(produced, 384);
        // Constant input stays constant through interpolation
        for &v in &out {
            assert!((v - 0.5).abs() < 1e-5);
        }
        // Six output frames consumed roughly one input frame each
        assert!(asrc.fill_level() > 256 - 80);
    }

    #[test]
    fn test_adaptive_ratio_tracks_fill() {
        let mut asrc = Asrc::new(1, 48_000, 48_000, 256).unwrap();
        prime(&mut asrc, 0.0);
        // Full buffer: ratio pushed above nominal
        let mut out = vec![0.0f32; 32];
        asrc.pull(&mut out);
        assert!(asrc.adaptive_ratio() > 1.0);

        // Drain most of the buffer: ratio falls below nominal
        let mut big = vec![0.0f32; 400];
        while asrc.fill_level() > 40 {
            if asrc.pull(&mut big) == 0 {
                break;
            }
        }
        asrc.pull(&mut out);
        assert!(asrc.adaptive_ratio() < 1.0);
    }

    #[test]
    fn test_ratio_deviation_clamped() {
        let mut asrc = Asrc::new(1, 44_100, 48_000, 256).unwrap();
        prime(&mut asrc, 0.0);
        let mut out = vec![0.0f32; 64];
        asrc.pull(&mut out);
        let nominal = asrc.nominal_ratio();
        let adaptive = asrc.adaptive_ratio() as f64;
        assert!(adaptive <= nominal * (1.0 + MAX_RATIO_DEVIATION) + 1e-9);
        assert!(adaptive >= nominal * (1.0 - MAX_RATIO_DEVIATION) - 1e-9);
    }

    #[test]
    fn test_reset_unprimes() {
        let mut asrc = Asrc::new(1, 48_000, 48_000, 64).unwrap();
        prime(&mut asrc, 1.0);
        asrc.reset();
        assert_eq!(asrc.fill_level(), 0);
        let mut out = vec![0.0f32; 16];
        assert_eq!(asrc.pull(&mut out), 0);
    }
}
