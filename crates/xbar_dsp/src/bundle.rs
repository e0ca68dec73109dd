//! Audio Channel Bundle
//!
//! A bundle is the SIMD unit of the DSP runtime: four interleaved float
//! channels spanning one period. All bundle storage is 16-byte aligned so
//! the x86_64 kernels can operate on whole `__m128` lanes; the scalar
//! fallback produces bit-identical samples.

use crate::error::{DspError, DspResult};

/// Number of interleaved channels per bundle
pub const CHANNELS_PER_BUNDLE: u32 = 4;

/// The frame length of every bundle must be a multiple of this
pub const FRAME_LENGTH_MULTIPLE: u32 = 4;

/// One sample instant of a bundle: four channel samples, 16-byte aligned.
#[derive(Clone, Copy, Default, Debug)]
#[repr(C, align(16))]
struct Frame4([f32; 4]);

/// Aligned block holding `4 x frame_length` float samples
pub struct AudioBundle {
    data: Vec<Frame4>,
    frame_length: u32,
    free_channels: u32,
}

impl AudioBundle {
    /// Create a bundle for one period of `frame_length` samples.
    ///
    /// The frame length must be a multiple of four so that the transpose
    /// kernels can process whole 4x4 blocks.
    pub fn new(frame_length: u32) -> DspResult<Self> {
        if frame_length == 0 || frame_length % FRAME_LENGTH_MULTIPLE != 0 {
            return Err(DspError::BadFrameLength(frame_length, FRAME_LENGTH_MULTIPLE));
        }
        Ok(Self {
            data: vec![Frame4::default(); frame_length as usize],
            frame_length,
            free_channels: CHANNELS_PER_BUNDLE,
        })
    }

    pub fn frame_length(&self) -> u32 {
        self.frame_length
    }

    pub fn free_channels(&self) -> u32 {
        self.free_channels
    }

    /// Forget all channel reservations
    pub fn reset(&mut self) {
        self.free_channels = CHANNELS_PER_BUNDLE;
    }

    /// Zero all samples of all four channels
    pub fn clear(&mut self) {
        for frame in &mut self.data {
            frame.0 = [0.0; 4];
        }
    }

    /// Reserve `num_channels` consecutive channels, returning the start index
    pub fn reserve_channels(&mut self, num_channels: u32) -> DspResult<u32> {
        if num_channels == 0 || num_channels > CHANNELS_PER_BUNDLE {
            return Err(DspError::InvalidParam(format!(
                "cannot reserve {num_channels} channels in a bundle"
            )));
        }
        if self.free_channels < num_channels {
            return Err(DspError::NoSpaceLeft {
                requested: num_channels,
                free: self.free_channels,
            });
        }
        let start = CHANNELS_PER_BUNDLE - self.free_channels;
        self.free_channels -= num_channels;
        Ok(start)
    }

    /// Zero the channels that have not been reserved.
    ///
    /// Streams call this after writing a partial bundle so that unused lanes
    /// carry silence instead of stale samples.
    pub fn zero_pad_free_channels(&mut self) {
        let used = (CHANNELS_PER_BUNDLE - self.free_channels) as usize;
        if used == CHANNELS_PER_BUNDLE as usize {
            return;
        }
        for frame in &mut self.data {
            for chan in used..CHANNELS_PER_BUNDLE as usize {
                frame.0[chan] = 0.0;
            }
        }
    }

    /// Flat interleaved view: `[c0 c1 c2 c3, c0 c1 c2 c3, ...]`
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        // Frame4 is #[repr(C)] over [f32; 4] with no padding.
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr() as *const f32,
                self.data.len() * CHANNELS_PER_BUNDLE as usize,
            )
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr() as *mut f32,
                self.data.len() * CHANNELS_PER_BUNDLE as usize,
            )
        }
    }

    /// Write up to four separate channel buffers into the bundle at `offset`.
    ///
    /// Each input slice must hold at least `frame_length` samples. Channels
    /// `[offset, offset + channels.len())` are overwritten, the others are
    /// left untouched.
    pub fn write_from_non_interleaved(&mut self, offset: u32, channels: &[&[f32]]) -> DspResult<()> {
        let n = channels.len() as u32;
        self.check_channel_range(offset, n)?;
        for channel in channels {
            if channel.len() < self.frame_length as usize {
                return Err(DspError::BufferSizeMismatch {
                    expected: self.frame_length as usize,
                    got: channel.len(),
                });
            }
        }
        #[cfg(target_arch = "x86_64")]
        if offset == 0 && n == CHANNELS_PER_BUNDLE {
            unsafe {
                sse::write_four_channels(
                    self.as_mut_slice(),
                    channels[0],
                    channels[1],
                    channels[2],
                    channels[3],
                );
            }
            return Ok(());
        }
        let offset = offset as usize;
        for (frame_idx, frame) in self.data.iter_mut().enumerate() {
            for (chan_idx, channel) in channels.iter().enumerate() {
                frame.0[offset + chan_idx] = channel[frame_idx];
            }
        }
        Ok(())
    }

    /// Write `num_channels` channels from an interleaved buffer with stride
    /// `src_stride` (samples per source frame) into the bundle at `offset`.
    pub fn write_from_interleaved(
        &mut self,
        offset: u32,
        num_channels: u32,
        src_stride: usize,
        samples: &[f32],
    ) -> DspResult<()> {
        self.check_channel_range(offset, num_channels)?;
        if src_stride < num_channels as usize {
            return Err(DspError::InvalidParam(format!(
                "source stride {src_stride} below channel count {num_channels}"
            )));
        }
        let needed = (self.frame_length as usize - 1) * src_stride + num_channels as usize;
        if samples.len() < needed {
            return Err(DspError::BufferSizeMismatch {
                expected: needed,
                got: samples.len(),
            });
        }
        let offset = offset as usize;
        for (frame_idx, frame) in self.data.iter_mut().enumerate() {
            let src = &samples[frame_idx * src_stride..];
            for chan_idx in 0..num_channels as usize {
                frame.0[offset + chan_idx] = src[chan_idx];
            }
        }
        Ok(())
    }

    /// Read one channel into `out`
    pub fn read_channel(&self, offset: u32, out: &mut [f32]) -> DspResult<()> {
        self.check_channel_range(offset, 1)?;
        if out.len() < self.frame_length as usize {
            return Err(DspError::BufferSizeMismatch {
                expected: self.frame_length as usize,
                got: out.len(),
            });
        }
        let offset = offset as usize;
        for (frame_idx, frame) in self.data.iter().enumerate() {
            out[frame_idx] = frame.0[offset];
        }
        Ok(())
    }

    /// Read up to four channels into separate channel buffers
    pub fn read_to_non_interleaved(&self, offset: u32, outs: &mut [&mut [f32]]) -> DspResult<()> {
        let n = outs.len() as u32;
        self.check_channel_range(offset, n)?;
        for out in outs.iter() {
            if out.len() < self.frame_length as usize {
                return Err(DspError::BufferSizeMismatch {
                    expected: self.frame_length as usize,
                    got: out.len(),
                });
            }
        }
        #[cfg(target_arch = "x86_64")]
        if offset == 0 && n == CHANNELS_PER_BUNDLE {
            let (first, rest) = outs.split_at_mut(1);
            let (second, rest) = rest.split_at_mut(1);
            let (third, fourth) = rest.split_at_mut(1);
            unsafe {
                sse::read_four_channels(
                    self.as_slice(),
                    &mut *first[0],
                    &mut *second[0],
                    &mut *third[0],
                    &mut *fourth[0],
                );
            }
            return Ok(());
        }
        let offset = offset as usize;
        for (frame_idx, frame) in self.data.iter().enumerate() {
            for (chan_idx, out) in outs.iter_mut().enumerate() {
                out[frame_idx] = frame.0[offset + chan_idx];
            }
        }
        Ok(())
    }

    /// Read `num_channels` channels into an interleaved buffer with stride
    /// `dst_stride`
    pub fn read_to_interleaved(
        &self,
        offset: u32,
        num_channels: u32,
        dst_stride: usize,
        out: &mut [f32],
    ) -> DspResult<()> {
        self.check_channel_range(offset, num_channels)?;
        if dst_stride < num_channels as usize {
            return Err(DspError::InvalidParam(format!(
                "destination stride {dst_stride} below channel count {num_channels}"
            )));
        }
        let needed = (self.frame_length as usize - 1) * dst_stride + num_channels as usize;
        if out.len() < needed {
            return Err(DspError::BufferSizeMismatch {
                expected: needed,
                got: out.len(),
            });
        }
        let offset = offset as usize;
        for (frame_idx, frame) in self.data.iter().enumerate() {
            let dst = &mut out[frame_idx * dst_stride..];
            for chan_idx in 0..num_channels as usize {
                dst[chan_idx] = frame.0[offset + chan_idx];
            }
        }
        Ok(())
    }

    fn check_channel_range(&self, offset: u32, num_channels: u32) -> DspResult<()> {
        if num_channels == 0 || offset + num_channels > CHANNELS_PER_BUNDLE {
            return Err(DspError::InvalidParam(format!(
                "channel range [{offset}, {}) outside bundle",
                offset + num_channels
            )));
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
mod sse {
    //! 4x4 transpose kernels. Shuffles only, so the results are bit-identical
    //! to the scalar path.

    use std::arch::x86_64::*;

    #[inline]
    unsafe fn transpose(r0: &mut __m128, r1: &mut __m128, r2: &mut __m128, r3: &mut __m128) {
        let t0 = _mm_unpacklo_ps(*r0, *r1);
        let t1 = _mm_unpackhi_ps(*r0, *r1);
        let t2 = _mm_unpacklo_ps(*r2, *r3);
        let t3 = _mm_unpackhi_ps(*r2, *r3);
        *r0 = _mm_movelh_ps(t0, t2);
        *r1 = _mm_movehl_ps(t2, t0);
        *r2 = _mm_movelh_ps(t1, t3);
        *r3 = _mm_movehl_ps(t3, t1);
    }

    /// `bundle` is the flat interleaved view (aligned); channel slices may be
    /// unaligned, so unaligned loads are used throughout.
    pub unsafe fn write_four_channels(
        bundle: &mut [f32],
        ch0: &[f32],
        ch1: &[f32],
        ch2: &[f32],
        ch3: &[f32],
    ) {
        let frames = bundle.len() / 4;
        let mut i = 0;
        while i < frames {
            let mut r0 = _mm_loadu_ps(ch0.as_ptr().add(i));
            let mut r1 = _mm_loadu_ps(ch1.as_ptr().add(i));
            let mut r2 = _mm_loadu_ps(ch2.as_ptr().add(i));
            let mut r3 = _mm_loadu_ps(ch3.as_ptr().add(i));
            transpose(&mut r0, &mut r1, &mut r2, &mut r3);
            _mm_store_ps(bundle.as_mut_ptr().add(4 * i), r0);
            _mm_store_ps(bundle.as_mut_ptr().add(4 * (i + 1)), r1);
            _mm_store_ps(bundle.as_mut_ptr().add(4 * (i + 2)), r2);
            _mm_store_ps(bundle.as_mut_ptr().add(4 * (i + 3)), r3);
            i += 4;
        }
    }

    pub unsafe fn read_four_channels(
        bundle: &[f32],
        ch0: &mut [f32],
        ch1: &mut [f32],
        ch2: &mut [f32],
        ch3: &mut [f32],
    ) {
        let frames = bundle.len() / 4;
        let mut i = 0;
        while i < frames {
            let mut r0 = _mm_load_ps(bundle.as_ptr().add(4 * i));
            let mut r1 = _mm_load_ps(bundle.as_ptr().add(4 * (i + 1)));
            let mut r2 = _mm_load_ps(bundle.as_ptr().add(4 * (i + 2)));
            let mut r3 = _mm_load_ps(bundle.as_ptr().add(4 * (i + 3)));
            transpose(&mut r0, &mut r1, &mut r2, &mut r3);
            _mm_storeu_ps(ch0.as_mut_ptr().add(i), r0);
            _mm_storeu_ps(ch1.as_mut_ptr().add(i), r1);
            _mm_storeu_ps(ch2.as_mut_ptr().add(i), r2);
            _mm_storeu_ps(ch3.as_mut_ptr().add(i), r3);
            i += 4;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_frame_length() {
        assert!(AudioBundle::new(0).is_err());
        assert!(AudioBundle::new(63).is_err());
        assert!(AudioBundle::new(64).is_ok());
    }

    #[test]
    fn test_alignment() {
        let bundle = AudioBundle::new(64).unwrap();
        assert_eq!(bundle.as_slice().as_ptr() as usize % 16, 0);
    }

    #[test]
    fn test_reserve_channels() {
        let mut bundle = AudioBundle::new(16).unwrap();
        assert_eq!(bundle.reserve_channels(2).unwrap(), 0);
        assert_eq!(bundle.reserve_channels(1).unwrap(), 2);
        assert_eq!(
            bundle.reserve_channels(2),
            Err(DspError::NoSpaceLeft {
                requested: 2,
                free: 1
            })
        );
        bundle.reset();
        assert_eq!(bundle.reserve_channels(4).unwrap(), 0);
    }

    #[test]
    fn test_non_interleaved_round_trip() {
        let mut bundle = AudioBundle::new(8).unwrap();
        let ch0: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let ch1: Vec<f32> = (0..8).map(|i| i as f32 + 100.0).collect();
        let ch2: Vec<f32> = (0..8).map(|i| i as f32 + 200.0).collect();
        let ch3: Vec<f32> = (0..8).map(|i| i as f32 + 300.0).collect();
        bundle
            .write_from_non_interleaved(0, &[&ch0, &ch1, &ch2, &ch3])
            .unwrap();

        let mut out0 = vec![0.0f32; 8];
        let mut out1 = vec![0.0f32; 8];
        let mut out2 = vec![0.0f32; 8];
        let mut out3 = vec![0.0f32; 8];
        bundle
            .read_to_non_interleaved(0, &mut [&mut out0, &mut out1, &mut out2, &mut out3])
            .unwrap();
        assert_eq!(out0, ch0);
        assert_eq!(out1, ch1);
        assert_eq!(out2, ch2);
        assert_eq!(out3, ch3);
    }

    #[test]
    fn test_partial_write_leaves_other_channels() {
        let mut bundle = AudioBundle::new(4).unwrap();
        let ones = vec![1.0f32; 4];
        let twos = vec![2.0f32; 4];
        bundle.write_from_non_interleaved(0, &[&ones]).unwrap();
        bundle.write_from_non_interleaved(2, &[&twos]).unwrap();

        let mut out = vec![0.0f32; 4];
        bundle.read_channel(0, &mut out).unwrap();
        assert_eq!(out, ones);
        bundle.read_channel(2, &mut out).unwrap();
        assert_eq!(out, twos);
        bundle.read_channel(1, &mut out).unwrap();
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_interleaved_round_trip() {
        let mut bundle = AudioBundle::new(4).unwrap();
        // Stereo source with stride 2: L R L R ...
        let src: Vec<f32> = vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0];
        bundle.write_from_interleaved(0, 2, 2, &src).unwrap();

        let mut out = vec![0.0f32; 8];
        bundle.read_to_interleaved(0, 2, 2, &mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_zero_pad_free_channels() {
        let mut bundle = AudioBundle::new(4).unwrap();
        bundle.as_mut_slice().fill(7.0);
        bundle.reserve_channels(3).unwrap();
        bundle.zero_pad_free_channels();

        let mut out = vec![0.0f32; 4];
        bundle.read_channel(2, &mut out).unwrap();
        assert_eq!(out, vec![7.0; 4]);
        bundle.read_channel(3, &mut out).unwrap();
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_clear() {
        let mut bundle = AudioBundle::new(4).unwrap();
        bundle.as_mut_slice().fill(1.5);
        bundle.clear();
        assert!(bundle.as_slice().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_range_checks() {
        let mut bundle = AudioBundle::new(4).unwrap();
        let data = vec![0.0f32; 4];
        assert!(bundle
            .write_from_non_interleaved(3, &[&data, &data])
            .is_err());
        let mut out = vec![0.0f32; 4];
        assert!(bundle.read_channel(4, &mut out).is_err());
    }

    #[test]
    fn test_short_source_rejected() {
        let mut bundle = AudioBundle::new(8).unwrap();
        let short = vec![0.0f32; 4];
        assert_eq!(
            bundle.write_from_non_interleaved(0, &[&short]),
            Err(DspError::BufferSizeMismatch {
                expected: 8,
                got: 4
            })
        );
    }
}
