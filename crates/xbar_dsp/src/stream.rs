//! Audio Streams
//!
//! A stream is one logical multi-channel signal flowing through a pipeline.
//! Its samples live in one of three canonical layouts:
//!
//! - *bundled*: spread over 4-channel [`AudioBundle`]s (the processing layout)
//! - *interleaved*: one flat `frame * channels` buffer, frame-major
//! - *non-interleaved*: one flat buffer, channel-major
//!
//! Conversions between layouts are performed lazily when a consumer first
//! requests a different one, and are idempotent. An optional SID value rides
//! along with the stream and survives every conversion.

use std::sync::Arc;

use crate::buffer_pool::{AudioBuffer, BufferPool, PoolHandler};
use crate::bundle::{AudioBundle, CHANNELS_PER_BUNDLE};
use crate::error::{DspError, DspResult};

/// Canonical sample layouts of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    Bundled,
    Interleaved,
    NonInterleaved,
}

/// Where a contiguous channel range of a stream lives inside one bundle
#[derive(Debug, Clone, Copy)]
pub struct BundleAssignment {
    /// Arena index of the bundle
    pub bundle: usize,
    /// First channel inside the bundle
    pub index: u32,
    /// Number of channels of this assignment
    pub channels: u32,
}

/// Owner of all bundles used by one pipeline
pub struct BundleArena {
    bundles: Vec<AudioBundle>,
    frame_length: u32,
}

impl BundleArena {
    pub fn new(frame_length: u32) -> Self {
        Self {
            bundles: Vec::new(),
            frame_length,
        }
    }

    pub fn frame_length(&self) -> u32 {
        self.frame_length
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Allocate a fresh bundle and return its index
    pub fn alloc(&mut self) -> DspResult<usize> {
        self.bundles.push(AudioBundle::new(self.frame_length)?);
        Ok(self.bundles.len() - 1)
    }

    pub fn bundle(&self, index: usize) -> &AudioBundle {
        &self.bundles[index]
    }

    pub fn bundle_mut(&mut self, index: usize) -> &mut AudioBundle {
        &mut self.bundles[index]
    }

    /// Borrow one bundle for reading and a different one for writing
    pub fn pair_mut(&mut self, read: usize, write: usize) -> (&AudioBundle, &mut AudioBundle) {
        assert_ne!(read, write, "bundle pair must be disjoint");
        if read < write {
            let (left, right) = self.bundles.split_at_mut(write);
            (&left[read], &mut right[0])
        } else {
            let (left, right) = self.bundles.split_at_mut(read);
            (&right[0], &mut left[write])
        }
    }
}

/// One logical audio signal with lazily converted layouts
pub struct AudioStream {
    name: String,
    id: i32,
    channels: u32,
    frame_length: u32,
    sid_available: bool,
    sid: u32,
    layout: SampleLayout,
    assignments: Vec<BundleAssignment>,
    /// Pool-backed storage for the interleaved / non-interleaved layouts
    simple: AudioBuffer,
    scratch: Vec<f32>,
    pool: Arc<BufferPool>,
}

impl AudioStream {
    /// Create a stream and allocate its bundles (`ceil(channels / 4)`) from
    /// the arena plus its flat storage from the pool handler.
    pub fn new(
        name: impl Into<String>,
        id: i32,
        channels: u32,
        frame_length: u32,
        sid_available: bool,
        pool_handler: &PoolHandler,
        arena: &mut BundleArena,
    ) -> DspResult<Self> {
        if channels == 0 {
            return Err(DspError::InvalidParam("stream with zero channels".to_string()));
        }
        if frame_length != arena.frame_length() {
            return Err(DspError::InvalidParam(format!(
                "stream frame length {frame_length} does not match arena {}",
                arena.frame_length()
            )));
        }
        let mut assignments = Vec::new();
        let mut remaining = channels;
        while remaining > 0 {
            let take = remaining.min(CHANNELS_PER_BUNDLE);
            let bundle = arena.alloc()?;
            let index = arena.bundle_mut(bundle).reserve_channels(take)?;
            assignments.push(BundleAssignment {
                bundle,
                index,
                channels: take,
            });
            remaining -= take;
        }
        let pool = pool_handler.get_pool(frame_length * channels);
        let simple = pool.get_buffer();
        Ok(Self {
            name: name.into(),
            id,
            channels,
            frame_length,
            sid_available,
            sid: 0,
            layout: SampleLayout::NonInterleaved,
            assignments,
            simple,
            scratch: vec![0.0; (frame_length * channels) as usize],
            pool,
        })
    }

    /// Return the flat storage to its pool. After this the stream must not be
    /// used any more; streams are released when their pipeline is destroyed.
    pub fn release(self) {
        let _ = self.pool.clone().return_buffer(self.simple);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn frame_length(&self) -> u32 {
        self.frame_length
    }

    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    pub fn assignments(&self) -> &[BundleAssignment] {
        &self.assignments
    }

    pub fn sid_available(&self) -> bool {
        self.sid_available
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn set_sid(&mut self, sid: u32) {
        self.sid = sid;
    }

    /// Zero the stream's bundles and make bundled the current layout.
    ///
    /// Used by the pipeline on module output streams before the modules run,
    /// so accumulating modules start from silence.
    pub fn clear_bundled(&mut self, arena: &mut BundleArena) -> DspResult<()> {
        for assignment in &self.assignments {
            arena.bundle_mut(assignment.bundle).clear();
        }
        self.layout = SampleLayout::Bundled;
        Ok(())
    }

    /// Zero the samples of the current layout
    pub fn clear(&mut self, arena: &mut BundleArena) {
        match self.layout {
            SampleLayout::Bundled => {
                for assignment in &self.assignments {
                    arena.bundle_mut(assignment.bundle).clear();
                }
            }
            _ => self.simple.data_mut().fill(0.0),
        }
    }

    /// Overwrite the stream with interleaved samples (`frame * channels`)
    pub fn write_from_interleaved(&mut self, samples: &[f32]) -> DspResult<()> {
        let needed = (self.frame_length * self.channels) as usize;
        if samples.len() < needed {
            return Err(DspError::BufferSizeMismatch {
                expected: needed,
                got: samples.len(),
            });
        }
        self.simple.data_mut()[..needed].copy_from_slice(&samples[..needed]);
        self.layout = SampleLayout::Interleaved;
        Ok(())
    }

    /// Overwrite the stream from separate channel slices. With SID available,
    /// one extra channel carrying the SID value may be appended.
    pub fn write_from_non_interleaved(&mut self, channels: &[&[f32]]) -> DspResult<()> {
        let expected_with_sid = self.channels as usize + 1;
        if channels.len() != self.channels as usize
            && !(self.sid_available && channels.len() == expected_with_sid)
        {
            return Err(DspError::InvalidParam(format!(
                "stream '{}' expects {} channels, got {}",
                self.name,
                self.channels,
                channels.len()
            )));
        }
        let frame = self.frame_length as usize;
        for (chan_idx, channel) in channels.iter().take(self.channels as usize).enumerate() {
            if channel.len() < frame {
                return Err(DspError::BufferSizeMismatch {
                    expected: frame,
                    got: channel.len(),
                });
            }
            self.simple.data_mut()[chan_idx * frame..(chan_idx + 1) * frame]
                .copy_from_slice(&channel[..frame]);
        }
        if self.sid_available && channels.len() == expected_with_sid {
            self.sid = channels[self.channels as usize][0].to_bits();
        }
        self.layout = SampleLayout::NonInterleaved;
        Ok(())
    }

    /// Convert to the bundled layout (no-op if already bundled)
    pub fn as_bundled(&mut self, arena: &mut BundleArena) -> DspResult<()> {
        match self.layout {
            SampleLayout::Bundled => Ok(()),
            SampleLayout::Interleaved => {
                let mut chan_offset = 0u32;
                for assignment in &self.assignments {
                    let bundle = arena.bundle_mut(assignment.bundle);
                    bundle.write_from_interleaved(
                        assignment.index,
                        assignment.channels,
                        self.channels as usize,
                        &self.simple.data()[chan_offset as usize..],
                    )?;
                    bundle.zero_pad_free_channels();
                    chan_offset += assignment.channels;
                }
                self.layout = SampleLayout::Bundled;
                Ok(())
            }
            SampleLayout::NonInterleaved => {
                let frame = self.frame_length as usize;
                let data = self.simple.data();
                let mut chan_offset = 0usize;
                for assignment in &self.assignments {
                    let mut slices: Vec<&[f32]> = Vec::with_capacity(assignment.channels as usize);
                    for chan in 0..assignment.channels as usize {
                        let base = (chan_offset + chan) * frame;
                        slices.push(&data[base..base + frame]);
                    }
                    let bundle = arena.bundle_mut(assignment.bundle);
                    bundle.write_from_non_interleaved(assignment.index, &slices)?;
                    bundle.zero_pad_free_channels();
                    chan_offset += assignment.channels as usize;
                }
                self.layout = SampleLayout::Bundled;
                Ok(())
            }
        }
    }

    /// Convert to the interleaved layout (no-op if already interleaved)
    pub fn as_interleaved(&mut self, arena: &mut BundleArena) -> DspResult<()> {
        match self.layout {
            SampleLayout::Interleaved => Ok(()),
            SampleLayout::Bundled => {
                let stride = self.channels as usize;
                let mut chan_offset = 0usize;
                for assignment in &self.assignments {
                    arena.bundle(assignment.bundle).read_to_interleaved(
                        assignment.index,
                        assignment.channels,
                        stride,
                        &mut self.simple.data_mut()[chan_offset..],
                    )?;
                    chan_offset += assignment.channels as usize;
                }
                self.layout = SampleLayout::Interleaved;
                Ok(())
            }
            SampleLayout::NonInterleaved => {
                let frame = self.frame_length as usize;
                let stride = self.channels as usize;
                self.scratch.copy_from_slice(self.simple.data());
                let data = self.simple.data_mut();
                for chan in 0..stride {
                    for frame_idx in 0..frame {
                        data[frame_idx * stride + chan] = self.scratch[chan * frame + frame_idx];
                    }
                }
                self.layout = SampleLayout::Interleaved;
                Ok(())
            }
        }
    }

    /// Convert to the non-interleaved layout (no-op if already there)
    pub fn as_non_interleaved(&mut self, arena: &mut BundleArena) -> DspResult<()> {
        match self.layout {
            SampleLayout::NonInterleaved => Ok(()),
            SampleLayout::Bundled => {
                let frame = self.frame_length as usize;
                let data = self.simple.data_mut();
                let mut chan_offset = 0usize;
                for assignment in &self.assignments {
                    let mut slices: Vec<&mut [f32]> = Vec::with_capacity(assignment.channels as usize);
                    let mut rest = &mut data[chan_offset * frame..];
                    for _ in 0..assignment.channels {
                        let (head, tail) = std::mem::take(&mut rest).split_at_mut(frame);
                        slices.push(head);
                        rest = tail;
                    }
                    arena
                        .bundle(assignment.bundle)
                        .read_to_non_interleaved(assignment.index, &mut slices)?;
                    chan_offset += assignment.channels as usize;
                }
                self.layout = SampleLayout::NonInterleaved;
                Ok(())
            }
            SampleLayout::Interleaved => {
                let frame = self.frame_length as usize;
                let stride = self.channels as usize;
                self.scratch.copy_from_slice(self.simple.data());
                let data = self.simple.data_mut();
                for chan in 0..stride {
                    for frame_idx in 0..frame {
                        data[chan * frame + frame_idx] = self.scratch[frame_idx * stride + chan];
                    }
                }
                self.layout = SampleLayout::NonInterleaved;
                Ok(())
            }
        }
    }

    /// Copy the stream out as interleaved samples without changing the
    /// canonical layout
    pub fn read_to_interleaved(&self, arena: &BundleArena, out: &mut [f32]) -> DspResult<()> {
        let needed = (self.frame_length * self.channels) as usize;
        if out.len() < needed {
            return Err(DspError::BufferSizeMismatch {
                expected: needed,
                got: out.len(),
            });
        }
        match self.layout {
            SampleLayout::Interleaved => {
                out[..needed].copy_from_slice(&self.simple.data()[..needed]);
            }
            SampleLayout::Bundled => {
                let stride = self.channels as usize;
                let mut chan_offset = 0usize;
                for assignment in &self.assignments {
                    arena.bundle(assignment.bundle).read_to_interleaved(
                        assignment.index,
                        assignment.channels,
                        stride,
                        &mut out[chan_offset..],
                    )?;
                    chan_offset += assignment.channels as usize;
                }
            }
            SampleLayout::NonInterleaved => {
                let frame = self.frame_length as usize;
                let stride = self.channels as usize;
                let data = self.simple.data();
                for chan in 0..stride {
                    for frame_idx in 0..frame {
                        out[frame_idx * stride + chan] = data[chan * frame + frame_idx];
                    }
                }
            }
        }
        Ok(())
    }

    /// Borrow one channel of the non-interleaved layout
    pub fn channel(&self, index: u32) -> DspResult<&[f32]> {
        if self.layout != SampleLayout::NonInterleaved {
            return Err(DspError::UnsupportedFormat(
                "channel access requires the non-interleaved layout".to_string(),
            ));
        }
        if index >= self.channels {
            return Err(DspError::InvalidParam(format!(
                "channel {index} outside stream '{}'",
                self.name
            )));
        }
        let frame = self.frame_length as usize;
        let base = index as usize * frame;
        Ok(&self.simple.data()[base..base + frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_stream(channels: u32, frame: u32) -> (AudioStream, BundleArena) {
        let handler = PoolHandler::new();
        let mut arena = BundleArena::new(frame);
        let stream =
            AudioStream::new("test", 1, channels, frame, false, &handler, &mut arena).unwrap();
        (stream, arena)
    }

    #[test]
    fn test_bundle_count() {
        let (stream, arena) = make_stream(6, 8);
        assert_eq!(stream.assignments().len(), 2);
        assert_eq!(stream.assignments()[0].channels, 4);
        assert_eq!(stream.assignments()[1].channels, 2);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_interleaved_non_interleaved_round_trip() {
        let (mut stream, mut arena) = make_stream(2, 4);
        let samples: Vec<f32> = vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0];
        stream.write_from_interleaved(&samples).unwrap();

        stream.as_non_interleaved(&mut arena).unwrap();
        assert_eq!(stream.channel(0).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(stream.channel(1).unwrap(), &[-1.0, -2.0, -3.0, -4.0]);

        stream.as_interleaved(&mut arena).unwrap();
        let mut out = vec![0.0f32; 8];
        stream.read_to_interleaved(&arena, &mut out).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_as_bundled_is_idempotent() {
        let (mut stream, mut arena) = make_stream(2, 4);
        let samples: Vec<f32> = (0..8).map(|i| i as f32).collect();
        stream.write_from_interleaved(&samples).unwrap();

        stream.as_bundled(&mut arena).unwrap();
        let first: Vec<f32> = arena.bundle(0).as_slice().to_vec();
        stream.as_bundled(&mut arena).unwrap();
        assert_eq!(arena.bundle(0).as_slice(), &first[..]);
    }

    #[test]
    fn test_bundled_round_trip() {
        let (mut stream, mut arena) = make_stream(3, 4);
        let samples: Vec<f32> = (0..12).map(|i| i as f32 * 0.5).collect();
        stream.write_from_interleaved(&samples).unwrap();

        stream.as_bundled(&mut arena).unwrap();
        stream.as_interleaved(&mut arena).unwrap();
        let mut out = vec![0.0f32; 12];
        stream.read_to_interleaved(&arena, &mut out).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_partial_bundle_zero_padded() {
        let (mut stream, mut arena) = make_stream(3, 4);
        // Dirty the unreserved lane, then check conversion pads it with zeros.
        arena.bundle_mut(0).as_mut_slice().fill(9.0);
        let samples = vec![1.0f32; 12];
        stream.write_from_interleaved(&samples).unwrap();
        stream.as_bundled(&mut arena).unwrap();

        let mut out = vec![0.0f32; 4];
        arena.bundle(0).read_channel(3, &mut out).unwrap();
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_sid_survives_conversions() {
        let handler = PoolHandler::new();
        let mut arena = BundleArena::new(4);
        let mut stream =
            AudioStream::new("sid", 7, 2, 4, true, &handler, &mut arena).unwrap();
        stream.set_sid(0xDEAD);

        let samples = vec![0.0f32; 8];
        stream.write_from_interleaved(&samples).unwrap();
        stream.as_bundled(&mut arena).unwrap();
        stream.as_non_interleaved(&mut arena).unwrap();
        assert_eq!(stream.sid(), 0xDEAD);
    }

    #[test]
    fn test_write_channel_count_mismatch() {
        let (mut stream, _arena) = make_stream(2, 4);
        let one = vec![0.0f32; 4];
        assert!(stream.write_from_non_interleaved(&[&one]).is_err());
    }

    #[test]
    fn test_pair_mut_disjoint() {
        let mut arena = BundleArena::new(4);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();
        arena.bundle_mut(a).as_mut_slice().fill(1.0);
        let (read, write) = arena.pair_mut(a, b);
        assert_eq!(read.as_slice()[0], 1.0);
        write.as_mut_slice().fill(2.0);
        assert_eq!(arena.bundle(b).as_slice()[0], 2.0);
    }
}
