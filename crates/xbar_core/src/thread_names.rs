//! Thread Name Registry
//!
//! Service object assigning short OS-level names to worker threads. Names
//! carry a kind prefix and a running index so threads stay distinguishable
//! in system tools; the full descriptive name goes to the log.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info;

/// Kind of thread being named
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Standard,
    RealTime,
}

/// Process-wide thread name service
pub struct ThreadNames {
    standard_index: AtomicU32,
    realtime_index: AtomicU32,
}

impl ThreadNames {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            standard_index: AtomicU32::new(0),
            realtime_index: AtomicU32::new(0),
        })
    }

    /// Name the calling thread. The OS name is truncated to the 15 character
    /// limit; `description` is only logged.
    pub fn set_thread_name(&self, kind: ThreadKind, description: &str) {
        let (prefix, index) = match kind {
            ThreadKind::Standard => ("xbar_std", self.standard_index.fetch_add(1, Ordering::Relaxed)),
            ThreadKind::RealTime => ("xbar_rt", self.realtime_index.fetch_add(1, Ordering::Relaxed)),
        };
        let os_name = format!("{prefix}_{index}");
        apply_os_name(&os_name);
        info!(name = %os_name, description, "thread named");
    }
}

#[cfg(target_os = "linux")]
fn apply_os_name(name: &str) {
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = std::ffi::CString::new(truncated) {
        // SAFETY: names the calling thread with a valid NUL-terminated string.
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_os_name(_name: &str) {}
