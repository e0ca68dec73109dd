//! Ramp Generator
//!
//! Produces per-sample gain trajectories between two values over a given
//! time, either linear or exponential. Consumers request one period worth of
//! values at a time and learn how many ramp samples are still pending.

use crate::bundle::CHANNELS_PER_BUNDLE;
use crate::error::{DspError, DspResult};

/// Lowest gain that is still ramped to; stands in for 0.0 on the
/// exponential shape (-144 dB).
pub const MUTE_GAIN: f64 = 6.309573444801930e-8;

/// Shape of the gain trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampShape {
    Linear,
    Exponential,
}

impl TryFrom<&str> for RampShape {
    type Error = DspError;

    fn try_from(value: &str) -> DspResult<Self> {
        match value {
            "linear" => Ok(RampShape::Linear),
            "exponential" => Ok(RampShape::Exponential),
            _ => Err(DspError::UnknownRampShape),
        }
    }
}

/// Ramp generator bound to one sample rate and frame length
#[derive(Debug)]
pub struct Ramp {
    sample_freq: u32,
    frame_length: u32,
    start_value: f64,
    end_value: f64,
    current_value: f64,
    increment_add: f64,
    increment_mult: f64,
    num_ramp_values: u32,
    active: bool,
}

impl Ramp {
    pub fn new(sample_freq: u32, frame_length: u32) -> Self {
        Self {
            sample_freq,
            frame_length,
            start_value: 0.0,
            end_value: 0.0,
            current_value: 0.0,
            increment_add: 0.0,
            increment_mult: 0.0,
            num_ramp_values: 0,
            active: false,
        }
    }

    /// Arm a ramp from `start_value` to `end_value` over `ramp_time_ms`
    pub fn set_timed_ramp(
        &mut self,
        start_value: f32,
        end_value: f32,
        ramp_time_ms: u32,
        shape: RampShape,
    ) -> DspResult<()> {
        if self.sample_freq == 0 || self.frame_length == 0 {
            return Err(DspError::InvalidParam(
                "ramp configured with zero sample rate or frame length".to_string(),
            ));
        }
        if ramp_time_ms == 0 {
            return Err(DspError::ZeroRampTime);
        }
        match shape {
            RampShape::Linear => self.set_linear(start_value as f64, end_value as f64, ramp_time_ms),
            RampShape::Exponential => {
                self.set_exponential(start_value as f64, end_value as f64, ramp_time_ms)
            }
        }
        Ok(())
    }

    fn ramp_samples(&self, ramp_time_ms: u32) -> u32 {
        ((ramp_time_ms as f64) * 0.001 * (self.sample_freq as f64)).floor() as u32
    }

    fn set_linear(&mut self, start_value: f64, end_value: f64, ramp_time_ms: u32) {
        self.start_value = start_value;
        self.end_value = end_value;
        let delta = end_value - start_value;
        if delta != 0.0 {
            self.num_ramp_values = self.ramp_samples(ramp_time_ms);
            self.increment_add = delta / self.num_ramp_values as f64;
        } else {
            self.num_ramp_values = 0;
            self.increment_add = 0.0;
        }
        self.current_value = start_value;
        self.increment_mult = 1.0;
        self.active = true;
    }

    fn set_exponential(&mut self, start_value: f64, end_value: f64, ramp_time_ms: u32) {
        self.start_value = start_value;
        self.end_value = end_value;
        if start_value != end_value {
            // A zero endpoint would make the multiplicative factor degenerate,
            // so it is replaced by -144 dB.
            let from = if start_value == 0.0 { MUTE_GAIN } else { start_value };
            let to = if end_value == 0.0 { MUTE_GAIN } else { end_value };
            self.num_ramp_values = self.ramp_samples(ramp_time_ms);
            self.current_value = from;
            self.increment_mult = (to / from).abs().powf(1.0 / self.num_ramp_values as f64);
        } else {
            self.num_ramp_values = 0;
            self.increment_mult = 0.0;
            self.current_value = start_value;
        }
        self.increment_add = 0.0;
        self.active = true;
    }

    #[inline]
    fn step(&mut self) {
        self.current_value += self.increment_add;
        self.current_value *= self.increment_mult;
        self.num_ramp_values -= 1;
        let overshoot_up = self.current_value > self.end_value && self.start_value < self.end_value;
        let overshoot_down =
            self.current_value < self.end_value && self.start_value > self.end_value;
        if overshoot_up
            || overshoot_down
            || (self.num_ramp_values == 0 && self.current_value != self.end_value)
        {
            self.current_value = self.end_value;
        }
    }

    /// Fill `data[..frame_length]` with the next period of ramp values.
    ///
    /// Returns the number of ramp samples still pending after this period.
    pub fn ramp_values(&mut self, data: &mut [f32]) -> DspResult<u32> {
        if !self.active {
            return Err(DspError::RampNotSet);
        }
        if data.len() < self.frame_length as usize {
            return Err(DspError::BufferSizeMismatch {
                expected: self.frame_length as usize,
                got: data.len(),
            });
        }
        let loop_size = self.num_ramp_values.min(self.frame_length);
        let mut i = 0usize;
        while (i as u32) < loop_size {
            self.step();
            data[i] = self.current_value as f32;
            i += 1;
        }
        // Once the ramp is exhausted the rest of the period carries the target.
        if (i as u32) < self.frame_length && self.current_value != self.end_value {
            self.current_value = self.end_value;
        }
        while (i as u32) < self.frame_length {
            data[i] = self.current_value as f32;
            i += 1;
        }
        Ok(self.num_ramp_values)
    }

    /// Fill `num_channels` channels of a flat bundle slice starting at
    /// `channel_index` with ramp values, one value per sample instant.
    pub fn ramp_values_bundle(
        &mut self,
        data: &mut [f32],
        channel_index: u32,
        num_channels: u32,
    ) -> DspResult<u32> {
        if channel_index >= CHANNELS_PER_BUNDLE
            || num_channels == 0
            || channel_index + num_channels > CHANNELS_PER_BUNDLE
        {
            return Err(DspError::InvalidParam(format!(
                "bundle channel range [{channel_index}, {})",
                channel_index + num_channels
            )));
        }
        if !self.active {
            return Err(DspError::RampNotSet);
        }
        let needed = (self.frame_length * CHANNELS_PER_BUNDLE) as usize;
        if data.len() < needed {
            return Err(DspError::BufferSizeMismatch {
                expected: needed,
                got: data.len(),
            });
        }
        let loop_size = self.num_ramp_values.min(self.frame_length);
        let mut i = 0usize;
        while (i as u32) < loop_size {
            self.step();
            let base = i * CHANNELS_PER_BUNDLE as usize + channel_index as usize;
            for chan in 0..num_channels as usize {
                data[base + chan] = self.current_value as f32;
            }
            i += 1;
        }
        if (i as u32) < self.frame_length && self.current_value != self.end_value {
            self.current_value = self.end_value;
        }
        while (i as u32) < self.frame_length {
            let base = i * CHANNELS_PER_BUNDLE as usize + channel_index as usize;
            for chan in 0..num_channels as usize {
                data[base + chan] = self.current_value as f32;
            }
            i += 1;
        }
        Ok(self.num_ramp_values)
    }

    /// Produce a single ramp value, for consumers that advance sample by sample
    pub fn next_value(&mut self) -> DspResult<f32> {
        if !self.active {
            return Err(DspError::RampNotSet);
        }
        if self.num_ramp_values > 0 {
            self.step();
        } else {
            self.current_value = self.end_value;
        }
        Ok(self.current_value as f32)
    }

    pub fn remaining(&self) -> u32 {
        self.num_ramp_values
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_set() {
        let mut ramp = Ramp::new(48_000, 64);
        let mut data = vec![0.0f32; 64];
        assert_eq!(ramp.ramp_values(&mut data), Err(DspError::RampNotSet));
    }

    #[test]
    fn test_zero_ramp_time() {
        let mut ramp = Ramp::new(48_000, 64);
        assert_eq!(
            ramp.set_timed_ramp(0.0, 1.0, 0, RampShape::Linear),
            Err(DspError::ZeroRampTime)
        );
    }

    #[test]
    fn test_zero_init_params() {
        let mut ramp = Ramp::new(0, 64);
        assert!(matches!(
            ramp.set_timed_ramp(0.0, 1.0, 100, RampShape::Linear),
            Err(DspError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_shape_from_str() {
        assert_eq!(RampShape::try_from("linear").unwrap(), RampShape::Linear);
        assert_eq!(
            RampShape::try_from("exponential").unwrap(),
            RampShape::Exponential
        );
        assert_eq!(RampShape::try_from("bogus"), Err(DspError::UnknownRampShape));
    }

    #[test]
    fn test_constant_ramp_emits_endpoint() {
        // start == end with a nonzero ramp time: all samples carry the value
        // and nothing remains to ramp.
        let mut ramp = Ramp::new(48_000, 64);
        ramp.set_timed_ramp(0.5, 0.5, 100, RampShape::Linear).unwrap();
        let mut data = vec![0.0f32; 64];
        let remaining = ramp.ramp_values(&mut data).unwrap();
        assert_eq!(remaining, 0);
        assert!(data.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_linear_ramp_reaches_target() {
        let fs = 48_000;
        let frame = 64;
        let mut ramp = Ramp::new(fs, frame);
        ramp.set_timed_ramp(1.0, 0.0, 100, RampShape::Linear).unwrap();

        // 100 ms at 48 kHz = 4800 ramp samples = 75 periods of 64
        let mut data = vec![0.0f32; frame as usize];
        let mut periods = 0;
        loop {
            let remaining = ramp.ramp_values(&mut data).unwrap();
            periods += 1;
            if remaining == 0 {
                break;
            }
            assert!(periods < 100, "ramp never finished");
        }
        assert_eq!(periods, 75);
        assert_eq!(data[frame as usize - 1], 0.0);
    }

    #[test]
    fn test_linear_ramp_is_monotonic() {
        let mut ramp = Ramp::new(48_000, 64);
        ramp.set_timed_ramp(0.0, 1.0, 10, RampShape::Linear).unwrap();
        let mut data = vec![0.0f32; 64];
        let mut last = 0.0f32;
        for _ in 0..10 {
            ramp.ramp_values(&mut data).unwrap();
            for &v in &data {
                assert!(v >= last);
                assert!(v <= 1.0);
                last = v;
            }
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_exponential_to_zero_ends_at_zero() {
        let mut ramp = Ramp::new(48_000, 64);
        ramp.set_timed_ramp(1.0, 0.0, 20, RampShape::Exponential)
            .unwrap();
        let mut data = vec![0.0f32; 64];
        loop {
            if ramp.ramp_values(&mut data).unwrap() == 0 {
                break;
            }
        }
        // The exponential shape lands on the true endpoint, not the -144 dB
        // stand-in.
        assert_eq!(data[63], 0.0);
    }

    #[test]
    fn test_exponential_from_zero_is_finite() {
        let mut ramp = Ramp::new(48_000, 64);
        ramp.set_timed_ramp(0.0, 1.0, 20, RampShape::Exponential)
            .unwrap();
        let mut data = vec![0.0f32; 64];
        ramp.ramp_values(&mut data).unwrap();
        assert!(data.iter().all(|v| v.is_finite()));
        assert!(data[0] > 0.0);
    }

    #[test]
    fn test_bundle_variant_strides_channels() {
        let mut ramp = Ramp::new(48_000, 4);
        ramp.set_timed_ramp(0.25, 0.25, 100, RampShape::Linear)
            .unwrap();
        let mut data = vec![0.0f32; 16];
        ramp.ramp_values_bundle(&mut data, 1, 2).unwrap();
        for frame in data.chunks(4) {
            assert_eq!(frame[0], 0.0);
            assert_eq!(frame[1], 0.25);
            assert_eq!(frame[2], 0.25);
            assert_eq!(frame[3], 0.0);
        }
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut ramp = Ramp::new(48_000, 64);
        ramp.set_timed_ramp(0.0, 1.0, 100, RampShape::Linear).unwrap();
        let mut data = vec![0.0f32; 32];
        assert!(matches!(
            ramp.ramp_values(&mut data),
            Err(DspError::BufferSizeMismatch { .. })
        ));
    }
}
