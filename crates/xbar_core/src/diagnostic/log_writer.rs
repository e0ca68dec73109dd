//! Diagnostic Log Writer
//!
//! Global worker that streams recorded diagnostic files into the structured
//! log in rate-limited chunks, then removes them. One worker serves all
//! diagnostic streams; files queue up while it is busy.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info};

use super::stream::BYTES_PER_ENTRY;

/// Global dispatcher of recorded diagnostic files
pub struct DiagnosticLogWriter {
    files: Mutex<VecDeque<PathBuf>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_running: Arc<AtomicBool>,
    finished_mutex: Mutex<bool>,
    finished_cond: Condvar,
    log_period_ms: AtomicU32,
    read_buffer_size: AtomicU32,
    file_idx: AtomicU32,
}

impl DiagnosticLogWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(VecDeque::new()),
            worker: Mutex::new(None),
            worker_running: Arc::new(AtomicBool::new(false)),
            finished_mutex: Mutex::new(true),
            finished_cond: Condvar::new(),
            log_period_ms: AtomicU32::new(0),
            read_buffer_size: AtomicU32::new(0),
            file_idx: AtomicU32::new(0),
        })
    }

    /// Configure chunking: `num_entries_per_msg` entries per log message,
    /// with a sleep of `log_period_ms` between messages.
    ///
    /// The entry count clamps to 18 above 19. The read buffer clamps via
    /// `(1024 / entry_size) * 1024` once it would exceed 1024 bytes.
    pub fn set_config_parameters(&self, log_period_ms: u32, num_entries_per_msg: u32) {
        let mut entries = num_entries_per_msg;
        if entries > 19 {
            entries = 18;
        }
        let mut buffer_size = entries * BYTES_PER_ENTRY;
        if buffer_size > 1024 {
            buffer_size = (1024 / BYTES_PER_ENTRY) * 1024;
        }
        self.log_period_ms.store(log_period_ms, Ordering::Relaxed);
        self.read_buffer_size.store(buffer_size, Ordering::Relaxed);
        info!(log_period_ms, entries, buffer_size, "log writer configured");
    }

    pub fn read_buffer_size(&self) -> u32 {
        self.read_buffer_size.load(Ordering::Relaxed)
    }

    /// Queue a file for dispatch and make sure the worker runs
    pub fn add_file(self: &Arc<Self>, path: PathBuf) {
        {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            files.push_back(path);
        }
        if self.read_buffer_size.load(Ordering::Relaxed) == 0 {
            error!("set_config_parameters not called yet, not starting log worker");
            return;
        }
        if !self.worker_running.load(Ordering::Acquire) {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
            {
                let mut finished = self.finished_mutex.lock().unwrap_or_else(|e| e.into_inner());
                *finished = false;
            }
            self.worker_running.store(true, Ordering::Release);
            let this = Arc::clone(self);
            *worker = Some(
                std::thread::Builder::new()
                    .name("xbar-diag-log".to_string())
                    .spawn(move || this.log_files())
                    .expect("failed to spawn diagnostic log worker"),
            );
        }
    }

    /// Wait up to 60 seconds for the worker to drain its queue
    pub fn is_thread_finished(&self) -> bool {
        let guard = self.finished_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, result) = self
            .finished_cond
            .wait_timeout_while(guard, Duration::from_secs(60), |finished| !*finished)
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        !result.timed_out()
    }

    fn log_files(self: Arc<Self>) {
        let buffer_size = self.read_buffer_size.load(Ordering::Relaxed) as usize;
        let period = Duration::from_millis(self.log_period_ms.load(Ordering::Relaxed) as u64);
        let mut buffer = vec![0u8; buffer_size];
        loop {
            let next = {
                let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
                files.pop_front()
            };
            let Some(path) = next else {
                break;
            };
            info!(path = %path.display(), "dispatching diagnostic file to log");
            let file_idx = self.file_idx.fetch_add(1, Ordering::Relaxed);
            let Ok(mut file) = File::open(&path) else {
                error!(path = %path.display(), "cannot open diagnostic file");
                continue;
            };
            let mut line_idx = 0u32;
            loop {
                let Ok(count) = file.read(&mut buffer) else {
                    break;
                };
                if count == 0 {
                    break;
                }
                let num_entries = count / BYTES_PER_ENTRY as usize;
                for entry in 0..num_entries {
                    let base = entry * BYTES_PER_ENTRY as usize;
                    let bytes = &buffer[base..base + BYTES_PER_ENTRY as usize];
                    let device_ts = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
                    let device_frames =
                        u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
                    let asrc_ts = u64::from_le_bytes(bytes[16..24].try_into().unwrap_or_default());
                    let asrc_frames =
                        u64::from_le_bytes(bytes[24..32].try_into().unwrap_or_default());
                    let asrc_fill = u32::from_le_bytes(bytes[32..36].try_into().unwrap_or_default());
                    let total_frames =
                        u32::from_le_bytes(bytes[36..40].try_into().unwrap_or_default());
                    let ratio = f32::from_le_bytes(bytes[40..44].try_into().unwrap_or_default());
                    info!(
                        f = file_idx,
                        l = line_idx,
                        device_ts,
                        device_frames,
                        asrc_ts,
                        asrc_frames,
                        asrc_fill,
                        total_frames,
                        ratio,
                        "asrc diagnostic entry"
                    );
                }
                line_idx += 1;
                std::thread::sleep(period);
                if !self.worker_running.load(Ordering::Acquire) {
                    break;
                }
            }
            let _ = std::fs::remove_file(&path);
            info!(path = %path.display(), "removed dispatched diagnostic file");
            if !self.worker_running.load(Ordering::Acquire) {
                break;
            }
        }
        self.worker_running.store(false, Ordering::Release);
        {
            let mut finished = self.finished_mutex.lock().unwrap_or_else(|e| e.into_inner());
            *finished = true;
        }
        self.finished_cond.notify_all();
        info!("no more files to write to log, exiting worker thread");
    }
}

impl Drop for DiagnosticLogWriter {
    fn drop(&mut self) {
        self.worker_running.store(false, Ordering::Release);
        let current = std::thread::current().id();
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}
