//! Audio Buffer Pool
//!
//! Flat float blocks handed out to audio streams. Pools are per-size free
//! lists; the process-wide `PoolHandler` returns the same pool for identical
//! sizes so buffers are shared across DSP reconfigurations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::error::{DspError, DspResult};

/// A flat float block obtained from a [`BufferPool`]
pub struct AudioBuffer {
    data: Vec<f32>,
    home_pool: Weak<BufferPool>,
}

impl AudioBuffer {
    fn new(size: u32) -> Self {
        Self {
            data: vec![0.0; size as usize],
            home_pool: Weak::new(),
        }
    }

    /// Size in samples
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// The home pool is set exactly once, when the pool creates the buffer.
    fn set_home_pool(&mut self, pool: &Arc<BufferPool>) {
        debug_assert!(self.home_pool.upgrade().is_none());
        self.home_pool = Arc::downgrade(pool);
    }
}

/// Per-size free list of audio buffers
pub struct BufferPool {
    buffer_size: u32,
    free_list: Mutex<Vec<AudioBuffer>>,
}

impl BufferPool {
    pub fn new(buffer_size: u32) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            free_list: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Take a buffer from the back of the free list, allocating when empty
    pub fn get_buffer(self: &Arc<Self>) -> AudioBuffer {
        let mut free_list = self.free_list.lock().unwrap_or_else(|e| e.into_inner());
        match free_list.pop() {
            Some(buffer) => buffer,
            None => {
                debug!(size = self.buffer_size, "allocating new pool buffer");
                let mut buffer = AudioBuffer::new(self.buffer_size);
                buffer.set_home_pool(self);
                buffer
            }
        }
    }

    /// Return a buffer to this pool.
    ///
    /// The buffer must have been created by this pool; handing it to a
    /// foreign pool is a programming error and is rejected.
    pub fn return_buffer(self: &Arc<Self>, mut buffer: AudioBuffer) -> DspResult<()> {
        let home = buffer.home_pool.upgrade();
        let is_home = home.map(|h| Arc::ptr_eq(&h, self)).unwrap_or(false);
        if !is_home {
            return Err(DspError::InvalidParam(
                "buffer returned to a pool that is not its home".to_string(),
            ));
        }
        buffer.data.fill(0.0);
        let mut free_list = self.free_list.lock().unwrap_or_else(|e| e.into_inner());
        // Returned buffers go to the front so get_buffer (back) prefers warm ones.
        free_list.insert(0, buffer);
        Ok(())
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }
}

/// Process-wide registry of buffer pools, keyed by buffer size
pub struct PoolHandler {
    pools: Mutex<HashMap<u32, Arc<BufferPool>>>,
}

impl PoolHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Get the pool serving buffers of `size` samples, creating it on first use
    pub fn get_pool(&self, size: u32) -> Arc<BufferPool> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(pools.entry(size).or_insert_with(|| BufferPool::new(size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_return() {
        let pool = BufferPool::new(256);
        let buffer = pool.get_buffer();
        assert_eq!(buffer.size(), 256);
        assert_eq!(pool.free_count(), 0);

        pool.return_buffer(buffer).unwrap();
        assert_eq!(pool.free_count(), 1);

        let again = pool.get_buffer();
        assert_eq!(again.size(), 256);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_returned_buffer_is_zeroed() {
        let pool = BufferPool::new(8);
        let mut buffer = pool.get_buffer();
        buffer.data_mut().fill(1.0);
        pool.return_buffer(buffer).unwrap();

        let again = pool.get_buffer();
        assert!(again.data().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_foreign_pool_rejected() {
        let pool_a = BufferPool::new(64);
        let pool_b = BufferPool::new(64);
        let buffer = pool_a.get_buffer();
        assert!(pool_b.return_buffer(buffer).is_err());
    }

    #[test]
    fn test_handler_shares_pools_by_size() {
        let handler = PoolHandler::new();
        let pool_a = handler.get_pool(512);
        let pool_b = handler.get_pool(512);
        let pool_c = handler.get_pool(1024);
        assert!(Arc::ptr_eq(&pool_a, &pool_b));
        assert!(!Arc::ptr_eq(&pool_a, &pool_c));
    }
}
