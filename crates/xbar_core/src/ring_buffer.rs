//! PCM Ring Buffer
//!
//! Single-producer / single-consumer circular frame buffer with independent
//! read and write cursors, used by every device and zone port. Access happens
//! in two steps: `begin_access` grants a contiguous region (possibly shorter
//! than requested because of the wrap), `commit` advances the cursor.
//!
//! Cursors are monotonic frame counters; the buffer index is the cursor
//! modulo the capacity, so `read + available_read == write (mod capacity)`
//! holds at all times.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RingBufferError;

/// Sample format of a PCM buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Int16,
    Int32,
    Float32,
}

impl SampleFormat {
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Int32 => 4,
            SampleFormat::Float32 => 4,
        }
    }
}

/// Side of the buffer an access operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

/// Per-channel layout descriptor of the interleaved store: a channel's
/// samples start at `start_byte` and repeat every `step_bytes`.
#[derive(Debug, Clone, Copy)]
pub struct AudioArea {
    pub start_byte: usize,
    pub step_bytes: usize,
}

/// SPSC PCM ring buffer
pub struct RingBuffer {
    name: String,
    channels: u32,
    format: SampleFormat,
    capacity: u32,
    frame_bytes: usize,
    data: UnsafeCell<Box<[u8]>>,
    /// Monotonic count of frames ever read
    read_pos: AtomicU64,
    /// Monotonic count of frames ever written
    write_pos: AtomicU64,
    read_mutex: Mutex<()>,
    write_mutex: Mutex<()>,
    cond_mutex: Mutex<()>,
    data_cond: Condvar,
    space_cond: Condvar,
    areas: Vec<AudioArea>,
}

// SAFETY: the byte store is only touched through accesses that hold the
// side mutex of their direction, and producer and consumer operate on
// disjoint frame regions by the SPSC cursor invariant.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    pub fn new(
        name: impl Into<String>,
        channels: u32,
        format: SampleFormat,
        capacity_frames: u32,
    ) -> Result<Arc<Self>, RingBufferError> {
        if channels == 0 || capacity_frames == 0 {
            return Err(RingBufferError::InvalidParam(
                "ring buffer needs at least one channel and one frame".to_string(),
            ));
        }
        let frame_bytes = channels as usize * format.sample_size();
        let areas = (0..channels as usize)
            .map(|chan| AudioArea {
                start_byte: chan * format.sample_size(),
                step_bytes: frame_bytes,
            })
            .collect();
        let size = capacity_frames as usize * frame_bytes;
        Ok(Arc::new(Self {
            name: name.into(),
            channels,
            format,
            capacity: capacity_frames,
            frame_bytes,
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            read_mutex: Mutex::new(()),
            write_mutex: Mutex::new(()),
            cond_mutex: Mutex::new(()),
            data_cond: Condvar::new(),
            space_cond: Condvar::new(),
            areas,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Per-channel area descriptors of the interleaved store
    pub fn areas(&self) -> &[AudioArea] {
        &self.areas
    }

    /// Readable or writable frames, without blocking
    pub fn update_available(&self, direction: AccessDirection) -> u32 {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        let filled = (write - read) as u32;
        match direction {
            AccessDirection::Read => filled,
            AccessDirection::Write => self.capacity - filled,
        }
    }

    /// Total frames ever moved past the given cursor
    pub fn total_frames(&self, direction: AccessDirection) -> u64 {
        match direction {
            AccessDirection::Read => self.read_pos.load(Ordering::Acquire),
            AccessDirection::Write => self.write_pos.load(Ordering::Acquire),
        }
    }

    /// Block until at least `min_frames` are available, bounded by `timeout`.
    ///
    /// Returns the available frame count, or [`RingBufferError::Timeout`].
    pub fn wait_available(
        &self,
        direction: AccessDirection,
        min_frames: u32,
        timeout: Duration,
    ) -> Result<u32, RingBufferError> {
        if min_frames > self.capacity {
            return Err(RingBufferError::InvalidParam(format!(
                "cannot wait for {min_frames} frames in a buffer of {}",
                self.capacity
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.cond_mutex.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let available = self.update_available(direction);
            if available >= min_frames {
                return Ok(available);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingBufferError::Timeout);
            }
            let cond = match direction {
                AccessDirection::Read => &self.data_cond,
                AccessDirection::Write => &self.space_cond,
            };
            let (g, _) = cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    /// Begin an access transaction.
    ///
    /// The grant covers at most the requested frames, bounded by availability
    /// and by the contiguous region up to the wrap point. The transaction
    /// holds the side's access lock until it is committed or dropped, which
    /// blocks resets for its duration.
    pub fn begin_access(
        &self,
        direction: AccessDirection,
        frames: u32,
    ) -> Result<RingAccess<'_>, RingBufferError> {
        let guard = match direction {
            AccessDirection::Read => self.read_mutex.lock().unwrap_or_else(|e| e.into_inner()),
            AccessDirection::Write => self.write_mutex.lock().unwrap_or_else(|e| e.into_inner()),
        };
        let cursor = match direction {
            AccessDirection::Read => self.read_pos.load(Ordering::Acquire),
            AccessDirection::Write => self.write_pos.load(Ordering::Acquire),
        };
        let offset = (cursor % self.capacity as u64) as u32;
        let available = self.update_available(direction);
        let contiguous = self.capacity - offset;
        let granted = frames.min(available).min(contiguous);
        Ok(RingAccess {
            ring: self,
            direction,
            _guard: guard,
            offset,
            frames: granted,
            committed: false,
        })
    }

    /// Drain and zero, called from the writer side. Both access locks are
    /// taken so an in-flight access of either side finishes first.
    pub fn reset_from_writer(&self) {
        let _write = self.write_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _read = self.read_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.drain_and_zero();
    }

    /// Drain and zero, called from the reader side.
    pub fn reset_from_reader(&self) {
        // Same lock order as reset_from_writer so concurrent resets cannot
        // deadlock.
        let _write = self.write_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let _read = self.read_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.drain_and_zero();
    }

    fn drain_and_zero(&self) {
        // SAFETY: both access locks are held, no access is in flight.
        unsafe {
            (*self.data.get()).fill(0);
        }
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write, Ordering::Release);
        debug!(ring = %self.name, "ring buffer drained and zeroed");
        let _guard = self.cond_mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.space_cond.notify_all();
    }

    #[inline]
    unsafe fn sample_ptr(&self, frame: u32, channel: u32) -> *mut u8 {
        let base = (*self.data.get()).as_ptr() as *mut u8;
        base.add(frame as usize * self.frame_bytes + channel as usize * self.format.sample_size())
    }

    fn finish_access(&self, direction: AccessDirection, frames: u32) {
        if frames == 0 {
            return;
        }
        match direction {
            AccessDirection::Read => {
                self.read_pos.fetch_add(frames as u64, Ordering::AcqRel);
                let _guard = self.cond_mutex.lock().unwrap_or_else(|e| e.into_inner());
                self.space_cond.notify_all();
            }
            AccessDirection::Write => {
                self.write_pos.fetch_add(frames as u64, Ordering::AcqRel);
                let _guard = self.cond_mutex.lock().unwrap_or_else(|e| e.into_inner());
                self.data_cond.notify_all();
            }
        }
    }
}

/// One open access transaction on a ring buffer
pub struct RingAccess<'a> {
    ring: &'a RingBuffer,
    direction: AccessDirection,
    _guard: MutexGuard<'a, ()>,
    offset: u32,
    frames: u32,
    committed: bool,
}

impl<'a> RingAccess<'a> {
    /// Granted contiguous frames
    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Frame offset of the grant within the ring store
    pub fn offset(&self) -> u32 {
        self.offset
    }

    fn check_range(
        &self,
        first_channel: u32,
        num_channels: u32,
        frames: u32,
    ) -> Result<(), RingBufferError> {
        if num_channels == 0 || first_channel + num_channels > self.ring.channels {
            return Err(RingBufferError::InvalidParam(format!(
                "channel range [{first_channel}, {}) outside ring '{}'",
                first_channel + num_channels,
                self.ring.name
            )));
        }
        if frames > self.frames {
            return Err(RingBufferError::InvalidParam(format!(
                "{frames} frames exceed granted {}",
                self.frames
            )));
        }
        Ok(())
    }

    /// Read `frames` frames of the given channel range, converted to f32 and
    /// interleaved with stride `num_channels`.
    pub fn read_into_f32(
        &self,
        first_channel: u32,
        num_channels: u32,
        frames: u32,
        out: &mut [f32],
    ) -> Result<(), RingBufferError> {
        self.check_range(first_channel, num_channels, frames)?;
        let needed = (frames * num_channels) as usize;
        if out.len() < needed {
            return Err(RingBufferError::InvalidParam(format!(
                "output buffer too short: {} < {needed}",
                out.len()
            )));
        }
        let format = self.ring.format;
        for frame in 0..frames {
            for chan in 0..num_channels {
                // SAFETY: range-checked above; the access guard keeps the
                // region stable.
                let value = unsafe {
                    let ptr = self
                        .ring
                        .sample_ptr(self.offset + frame, first_channel + chan);
                    read_sample(ptr, format)
                };
                out[(frame * num_channels + chan) as usize] = value;
            }
        }
        Ok(())
    }

    /// Write `frames` interleaved f32 frames into the given channel range,
    /// converting to the ring's format. Channels outside the range keep
    /// their content.
    pub fn write_from_f32(
        &mut self,
        first_channel: u32,
        num_channels: u32,
        frames: u32,
        samples: &[f32],
    ) -> Result<(), RingBufferError> {
        if self.direction != AccessDirection::Write {
            return Err(RingBufferError::InvalidParam(
                "write on a read access".to_string(),
            ));
        }
        self.check_range(first_channel, num_channels, frames)?;
        let needed = (frames * num_channels) as usize;
        if samples.len() < needed {
            return Err(RingBufferError::InvalidParam(format!(
                "input buffer too short: {} < {needed}",
                samples.len()
            )));
        }
        let format = self.ring.format;
        for frame in 0..frames {
            for chan in 0..num_channels {
                let value = samples[(frame * num_channels + chan) as usize];
                // SAFETY: range-checked above; write side holds its guard.
                unsafe {
                    let ptr = self
                        .ring
                        .sample_ptr(self.offset + frame, first_channel + chan);
                    write_sample(ptr, format, value);
                }
            }
        }
        Ok(())
    }

    /// Zero the given channel range over `frames` frames
    pub fn write_silence(
        &mut self,
        first_channel: u32,
        num_channels: u32,
        frames: u32,
    ) -> Result<(), RingBufferError> {
        if self.direction != AccessDirection::Write {
            return Err(RingBufferError::InvalidParam(
                "write on a read access".to_string(),
            ));
        }
        self.check_range(first_channel, num_channels, frames)?;
        let format = self.ring.format;
        for frame in 0..frames {
            for chan in 0..num_channels {
                // SAFETY: range-checked above; write side holds its guard.
                unsafe {
                    let ptr = self
                        .ring
                        .sample_ptr(self.offset + frame, first_channel + chan);
                    write_sample(ptr, format, 0.0);
                }
            }
        }
        Ok(())
    }

    /// Commit `frames` frames, advancing the cursor. Consumes the access.
    pub fn commit(mut self, frames: u32) -> Result<(), RingBufferError> {
        if frames > self.frames {
            return Err(RingBufferError::InvalidParam(format!(
                "commit of {frames} exceeds granted {}",
                self.frames
            )));
        }
        self.committed = true;
        self.ring.finish_access(self.direction, frames);
        Ok(())
    }
}

impl Drop for RingAccess<'_> {
    fn drop(&mut self) {
        // A dropped, uncommitted access behaves like a commit of zero frames.
        if !self.committed {
            self.committed = true;
        }
    }
}

#[inline]
unsafe fn read_sample(ptr: *const u8, format: SampleFormat) -> f32 {
    match format {
        SampleFormat::Float32 => (ptr as *const f32).read_unaligned(),
        SampleFormat::Int16 => {
            let raw = (ptr as *const i16).read_unaligned();
            raw as f32 / 32_768.0
        }
        SampleFormat::Int32 => {
            let raw = (ptr as *const i32).read_unaligned();
            raw as f32 / 2_147_483_648.0
        }
    }
}

#[inline]
unsafe fn write_sample(ptr: *mut u8, format: SampleFormat, value: f32) {
    match format {
        SampleFormat::Float32 => (ptr as *mut f32).write_unaligned(value),
        SampleFormat::Int16 => {
            let scaled = (value.clamp(-1.0, 1.0) * 32_767.0) as i16;
            (ptr as *mut i16).write_unaligned(scaled);
        }
        SampleFormat::Int32 => {
            let scaled = (value.clamp(-1.0, 1.0) as f64 * 2_147_483_647.0) as i32;
            (ptr as *mut i32).write_unaligned(scaled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frames(ring: &RingBuffer, frames: u32, value: f32) -> u32 {
        let channels = ring.channels();
        let samples = vec![value; (frames * channels) as usize];
        let mut access = ring.begin_access(AccessDirection::Write, frames).unwrap();
        let granted = access.frames();
        access.write_from_f32(0, channels, granted, &samples).unwrap();
        access.commit(granted).unwrap();
        granted
    }

    fn read_frames(ring: &RingBuffer, frames: u32) -> Vec<f32> {
        let channels = ring.channels();
        let access = ring.begin_access(AccessDirection::Read, frames).unwrap();
        let granted = access.frames();
        let mut out = vec![0.0f32; (granted * channels) as usize];
        access.read_into_f32(0, channels, granted, &mut out).unwrap();
        access.commit(granted).unwrap();
        out
    }

    #[test]
    fn test_invalid_params() {
        assert!(RingBuffer::new("r", 0, SampleFormat::Float32, 16).is_err());
        assert!(RingBuffer::new("r", 2, SampleFormat::Float32, 0).is_err());
    }

    #[test]
    fn test_cursor_invariant() {
        let ring = RingBuffer::new("r", 2, SampleFormat::Float32, 16).unwrap();
        assert_eq!(ring.update_available(AccessDirection::Read), 0);
        assert_eq!(ring.update_available(AccessDirection::Write), 16);

        write_frames(&ring, 10, 0.5);
        assert_eq!(ring.update_available(AccessDirection::Read), 10);
        assert_eq!(ring.update_available(AccessDirection::Write), 6);

        read_frames(&ring, 4);
        assert_eq!(ring.update_available(AccessDirection::Read), 6);
        assert_eq!(ring.update_available(AccessDirection::Write), 10);

        // read + available_read == write (mod capacity)
        let read = ring.total_frames(AccessDirection::Read);
        let write = ring.total_frames(AccessDirection::Write);
        let avail = ring.update_available(AccessDirection::Read) as u64;
        assert_eq!((read + avail) % 16, write % 16);
    }

    #[test]
    fn test_wrap_grants_contiguous_region() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Float32, 8).unwrap();
        write_frames(&ring, 6, 1.0);
        read_frames(&ring, 6);
        // Cursor at 6, free 8: contiguous grant is limited to the wrap point
        let access = ring.begin_access(AccessDirection::Write, 8).unwrap();
        assert_eq!(access.frames(), 2);
        drop(access);
    }

    #[test]
    fn test_data_round_trip() {
        let ring = RingBuffer::new("r", 2, SampleFormat::Float32, 8).unwrap();
        let samples = vec![0.1f32, -0.1, 0.2, -0.2, 0.3, -0.3, 0.4, -0.4];
        let mut access = ring.begin_access(AccessDirection::Write, 4).unwrap();
        access.write_from_f32(0, 2, 4, &samples).unwrap();
        access.commit(4).unwrap();

        let out = read_frames(&ring, 4);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_int16_conversion() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Int16, 8).unwrap();
        let mut access = ring.begin_access(AccessDirection::Write, 4).unwrap();
        access
            .write_from_f32(0, 1, 4, &[0.0, 0.5, -0.5, 1.0])
            .unwrap();
        access.commit(4).unwrap();

        let out = read_frames(&ring, 4);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.5).abs() < 1e-3);
        assert!((out[2] + 0.5).abs() < 1e-3);
        assert!((out[3] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_channel_range_write_leaves_others() {
        let ring = RingBuffer::new("r", 4, SampleFormat::Float32, 4).unwrap();
        let mut access = ring.begin_access(AccessDirection::Write, 2).unwrap();
        access.write_from_f32(1, 2, 2, &[0.5, 0.6, 0.7, 0.8]).unwrap();
        access.commit(2).unwrap();

        let out = read_frames(&ring, 2);
        assert_eq!(out, vec![0.0, 0.5, 0.6, 0.0, 0.0, 0.7, 0.8, 0.0]);
    }

    #[test]
    fn test_wait_timeout_is_distinct_error() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Float32, 4).unwrap();
        let result =
            ring.wait_available(AccessDirection::Read, 1, Duration::from_millis(10));
        assert_eq!(result, Err(RingBufferError::Timeout));

        let result = ring.wait_available(AccessDirection::Read, 99, Duration::from_millis(10));
        assert!(matches!(result, Err(RingBufferError::InvalidParam(_))));
    }

    #[test]
    fn test_wait_wakes_on_write() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Float32, 8).unwrap();
        let writer_ring = Arc::clone(&ring);
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let samples = vec![1.0f32; 4];
            let mut access = writer_ring.begin_access(AccessDirection::Write, 4).unwrap();
            access.write_from_f32(0, 1, 4, &samples).unwrap();
            access.commit(4).unwrap();
        });
        let available = ring
            .wait_available(AccessDirection::Read, 4, Duration::from_secs(2))
            .unwrap();
        assert!(available >= 4);
        writer.join().unwrap();
    }

    #[test]
    fn test_reset_from_writer_drains() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Float32, 8).unwrap();
        write_frames(&ring, 5, 1.0);
        let before = ring.total_frames(AccessDirection::Write);
        ring.reset_from_writer();
        assert_eq!(ring.update_available(AccessDirection::Read), 0);
        assert_eq!(ring.update_available(AccessDirection::Write), 8);
        // Totals stay monotonic across resets
        assert_eq!(ring.total_frames(AccessDirection::Write), before);
    }

    #[test]
    fn test_commit_more_than_granted_rejected() {
        let ring = RingBuffer::new("r", 1, SampleFormat::Float32, 8).unwrap();
        let access = ring.begin_access(AccessDirection::Write, 4).unwrap();
        assert!(access.commit(6).is_err());
    }

    #[test]
    fn test_spsc_threads() {
        let ring = RingBuffer::new("r", 2, SampleFormat::Float32, 64).unwrap();
        let producer_ring = Arc::clone(&ring);
        let producer = std::thread::spawn(move || {
            let mut sent = 0u32;
            while sent < 1000 {
                let chunk = vec![sent as f32; 8];
                let mut access = producer_ring.begin_access(AccessDirection::Write, 4).unwrap();
                let granted = access.frames();
                if granted == 0 {
                    drop(access);
                    std::thread::yield_now();
                    continue;
                }
                access.write_from_f32(0, 2, granted, &chunk).unwrap();
                access.commit(granted).unwrap();
                sent += granted;
            }
        });
        let mut received = 0u32;
        while received < 1000 {
            let access = ring.begin_access(AccessDirection::Read, 4).unwrap();
            let granted = access.frames();
            access.commit(granted).unwrap();
            received += granted;
        }
        producer.join().unwrap();
        assert_eq!(ring.total_frames(AccessDirection::Write), 1000);
    }
}
