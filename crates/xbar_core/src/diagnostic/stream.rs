//! Diagnostic Stream
//!
//! Per-device recorder of timing tuples into a temp binary file. File open
//! and close are slow operations and run on worker threads; a six-state
//! machine keeps the recorder consistent when start/stop requests overlap
//! with file operations still in flight.
//!
//! Recording stops automatically after one hour. On close the temp file is
//! removed unless the error counter reached the configured threshold, in
//! which case it is copied to the destination directory or handed to the
//! diagnostic log writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, trace, warn};

use super::log_writer::DiagnosticLogWriter;

/// Bytes per recorded entry: 4 x u64 + 2 x u32 + 1 x f32
pub const BYTES_PER_ENTRY: u32 = 44;

const TMP_PATH: &str = "/tmp";

/// Configuration of one diagnostic stream
#[derive(Debug, Clone)]
pub struct DiagnosticStreamParams {
    pub device_name: String,
    /// Source device output port or routing zone input port being observed
    pub port_name: String,
    /// Copy destination directory, or `"log"` to stream through the log
    /// writer
    pub copy_to: String,
    /// Number of `error_occurred` calls that trigger keeping the file
    pub error_threshold: u32,
    /// Period time of the write_entry call in microseconds
    pub period_time_us: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Opening,
    Started,
    Closing,
    PendingClose,
    PendingOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Start,
    Stop,
    OpeningFinished,
    ClosingFinished,
}

struct FileSlot {
    writer: Option<BufWriter<File>>,
    file_name: String,
    full_path: PathBuf,
}

/// Per-device diagnostic recorder
pub struct DiagnosticStream {
    params: DiagnosticStreamParams,
    state: Mutex<StreamState>,
    file: Mutex<FileSlot>,
    period_counter: AtomicU32,
    max_counter: u32,
    error_counter: AtomicU32,
    file_idx: AtomicU32,
    started_mutex: Mutex<bool>,
    started_cond: Condvar,
    open_worker: Mutex<Option<JoinHandle<()>>>,
    close_worker: Mutex<Option<JoinHandle<()>>>,
    log_writer: Arc<DiagnosticLogWriter>,
}

impl DiagnosticStream {
    pub fn new(mut params: DiagnosticStreamParams, log_writer: Arc<DiagnosticLogWriter>) -> Arc<Self> {
        if params.period_time_us == 0 {
            params.period_time_us = 5333;
        }
        let bytes_per_second = BYTES_PER_ENTRY as u64 * 1_000_000 / params.period_time_us as u64;
        let bytes_per_hour = bytes_per_second * 60 * 60;
        let max_counter = (bytes_per_hour / BYTES_PER_ENTRY as u64) as u32;
        info!(
            device = %params.device_name,
            bytes_per_hour, max_counter, "diagnostic stream created"
        );
        Arc::new(Self {
            params,
            state: Mutex::new(StreamState::Idle),
            file: Mutex::new(FileSlot {
                writer: None,
                file_name: String::new(),
                full_path: PathBuf::new(),
            }),
            period_counter: AtomicU32::new(0),
            max_counter,
            error_counter: AtomicU32::new(0),
            file_idx: AtomicU32::new(0),
            started_mutex: Mutex::new(false),
            started_cond: Condvar::new(),
            open_worker: Mutex::new(None),
            close_worker: Mutex::new(None),
            log_writer,
        })
    }

    pub fn params(&self) -> &DiagnosticStreamParams {
        &self.params
    }

    /// Request recording to start
    pub fn start_stream(self: &Arc<Self>) -> Result<(), ()> {
        match self.change_state(Trigger::Start) {
            StreamState::Opening | StreamState::PendingOpen => Ok(()),
            _ => Err(()),
        }
    }

    /// Request recording to stop
    pub fn stop_stream(self: &Arc<Self>) -> Result<(), ()> {
        match self.change_state(Trigger::Stop) {
            StreamState::Closing | StreamState::PendingClose => Ok(()),
            _ => Err(()),
        }
    }

    /// Count one observed error within the capture window
    pub fn error_occurred(&self) {
        self.error_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one timing tuple (44 bytes little-endian). Dropped unless the
    /// stream is in the started state.
    #[allow(clippy::too_many_arguments)]
    pub fn write_entry(
        self: &Arc<Self>,
        device_timestamp_us: u64,
        device_frames: u64,
        asrc_timestamp_us: u64,
        asrc_frames: u64,
        asrc_fill_frames: u32,
        total_frames: u32,
        adaptive_ratio: f32,
    ) {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != StreamState::Started {
                trace!(device = %self.params.device_name, "stream not started yet");
                return;
            }
        }
        let mut buffer = [0u8; BYTES_PER_ENTRY as usize];
        buffer[0..8].copy_from_slice(&device_timestamp_us.to_le_bytes());
        buffer[8..16].copy_from_slice(&device_frames.to_le_bytes());
        buffer[16..24].copy_from_slice(&asrc_timestamp_us.to_le_bytes());
        buffer[24..32].copy_from_slice(&asrc_frames.to_le_bytes());
        buffer[32..36].copy_from_slice(&asrc_fill_frames.to_le_bytes());
        buffer[36..40].copy_from_slice(&total_frames.to_le_bytes());
        buffer[40..44].copy_from_slice(&adaptive_ratio.to_le_bytes());
        {
            let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(writer) = slot.writer.as_mut() {
                let _ = writer.write_all(&buffer);
            }
        }
        let counter = self.period_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if counter > self.max_counter {
            self.period_counter.store(0, Ordering::Relaxed);
            let _ = self.change_state(Trigger::Stop);
        }
    }

    /// Wait up to one second until the stream reaches the started state
    pub fn is_started(&self) -> bool {
        let guard = self.started_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, result) = self
            .started_cond
            .wait_timeout_while(guard, Duration::from_secs(1), |started| !*started)
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        !result.timed_out()
    }

    /// Wait up to one second until the stream reaches the stopped state
    pub fn is_stopped(&self) -> bool {
        let guard = self.started_mutex.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, result) = self
            .started_cond
            .wait_timeout_while(guard, Duration::from_secs(1), |started| *started)
            .unwrap_or_else(|e| e.into_inner());
        drop(guard);
        !result.timed_out()
    }

    fn set_started(&self, started: bool) {
        let mut guard = self.started_mutex.lock().unwrap_or_else(|e| e.into_inner());
        *guard = started;
        self.started_cond.notify_all();
    }

    fn spawn_open(self: &Arc<Self>) {
        let mut worker = self.open_worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        let this = Arc::clone(self);
        *worker = Some(
            std::thread::Builder::new()
                .name("xbar-diag-open".to_string())
                .spawn(move || this.open_file())
                .expect("failed to spawn diagnostic open thread"),
        );
    }

    fn spawn_close(self: &Arc<Self>) {
        let mut worker = self.close_worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        let this = Arc::clone(self);
        *worker = Some(
            std::thread::Builder::new()
                .name("xbar-diag-close".to_string())
                .spawn(move || this.close_file())
                .expect("failed to spawn diagnostic close thread"),
        );
    }

    fn change_state(self: &Arc<Self>, trigger: Trigger) -> StreamState {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let old = *state;
        match (*state, trigger) {
            (StreamState::Idle, Trigger::Start) => {
                *state = StreamState::Opening;
                self.spawn_open();
            }
            (StreamState::Started, Trigger::Stop) => {
                *state = StreamState::Closing;
                self.spawn_close();
            }
            (StreamState::Opening, Trigger::OpeningFinished) => {
                *state = StreamState::Started;
                self.set_started(true);
            }
            (StreamState::Opening, Trigger::Stop) => {
                *state = StreamState::PendingClose;
            }
            (StreamState::PendingClose, Trigger::OpeningFinished) => {
                *state = StreamState::Closing;
                self.set_started(true);
                self.spawn_close();
            }
            (StreamState::Closing, Trigger::ClosingFinished) => {
                *state = StreamState::Idle;
                self.set_started(false);
            }
            (StreamState::Closing, Trigger::Start) => {
                *state = StreamState::PendingOpen;
            }
            (StreamState::PendingOpen, Trigger::ClosingFinished) => {
                *state = StreamState::Opening;
                self.set_started(false);
                self.spawn_open();
            }
            (StreamState::PendingOpen, Trigger::Stop) => {
                *state = StreamState::PendingClose;
            }
            _ => {
                info!(
                    device = %self.params.device_name,
                    ?old, ?trigger, "ignoring trigger"
                );
            }
        }
        if *state != old {
            info!(
                device = %self.params.device_name,
                ?old, ?trigger, new = ?*state, "diagnostic state changed"
            );
        }
        *state
    }

    /// Open worker: create the temp file and report completion
    fn open_file(self: Arc<Self>) {
        {
            let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());
            if slot.writer.is_none() {
                let idx = self.file_idx.fetch_add(1, Ordering::Relaxed);
                let timestamp = chrono::Local::now().format("%H:%M:%S");
                let mut file_name = format!(
                    "{timestamp}_{}_asrc_diag_{idx}.bin",
                    self.params.device_name
                );
                file_name = file_name.replace(',', "_");
                let full_path = PathBuf::from(TMP_PATH).join(&file_name);
                info!(path = %full_path.display(), "opening tmp file for diagnostic log");
                match File::create(&full_path) {
                    Ok(file) => {
                        slot.writer = Some(BufWriter::new(file));
                        slot.file_name = file_name;
                        slot.full_path = full_path;
                        self.error_counter.store(0, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(path = %full_path.display(), %err, "failed to open diagnostic file");
                    }
                }
            }
        }
        let _ = self.change_state(Trigger::OpeningFinished);
    }

    /// Close worker: close the file, then remove, copy or hand it to the log
    /// writer depending on the error counter.
    fn close_file(self: Arc<Self>) {
        let (file_name, full_path) = {
            let mut slot = self.file.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(mut writer) = slot.writer.take() {
                let _ = writer.flush();
            }
            (slot.file_name.clone(), slot.full_path.clone())
        };
        if !full_path.as_os_str().is_empty() {
            let errors = self.error_counter.load(Ordering::Relaxed);
            if errors >= self.params.error_threshold {
                if self.params.copy_to == "log" {
                    self.log_writer.add_file(full_path.clone());
                } else {
                    self.copy_file(&file_name, &full_path);
                }
            } else {
                let _ = std::fs::remove_file(&full_path);
                info!(path = %full_path.display(), "removed diagnostic tmp file");
            }
        }
        self.error_counter.store(0, Ordering::Relaxed);
        let _ = self.change_state(Trigger::ClosingFinished);
    }

    fn copy_file(&self, file_name: &str, full_path: &PathBuf) {
        let destination = PathBuf::from(&self.params.copy_to).join(file_name);
        info!(
            from = %full_path.display(),
            to = %destination.display(),
            "copying diagnostic file"
        );
        if let Err(err) = std::fs::copy(full_path, &destination) {
            warn!(to = %destination.display(), %err, "destination file couldn't be created");
        }
        let _ = std::fs::remove_file(full_path);
        info!(path = %full_path.display(), "removed diagnostic tmp file");
    }
}

impl Drop for DiagnosticStream {
    fn drop(&mut self) {
        // Join any file worker still in flight. The drop may run on a worker
        // thread itself (it holds the last Arc), so never join the current
        // thread.
        let current = std::thread::current().id();
        for worker in [&self.open_worker, &self.close_worker] {
            if let Some(handle) = worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_params(device: &str, copy_to: &str, threshold: u32) -> DiagnosticStreamParams {
        DiagnosticStreamParams {
            device_name: device.to_string(),
            port_name: "port0".to_string(),
            copy_to: copy_to.to_string(),
            error_threshold: threshold,
            period_time_us: 5333,
        }
    }

    fn log_writer() -> Arc<DiagnosticLogWriter> {
        let writer = DiagnosticLogWriter::new();
        writer.set_config_parameters(10, 4);
        writer
    }

    #[test]
    fn test_start_stop_without_errors_leaves_no_file() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devA", dst.path().to_str().unwrap(), 2);
        let stream = DiagnosticStream::new(params, log_writer());

        stream.start_stream().unwrap();
        assert!(stream.is_started());
        stream.write_entry(1, 2, 3, 4, 5, 6, 1.0);
        stream.stop_stream().unwrap();
        assert!(stream.is_stopped());

        // No error occurred: destination directory stays empty
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_error_threshold_triggers_copy() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devB", dst.path().to_str().unwrap(), 2);
        let stream = DiagnosticStream::new(params, log_writer());

        stream.start_stream().unwrap();
        assert!(stream.is_started());
        stream.write_entry(10, 20, 30, 40, 50, 60, 0.998);
        stream.error_occurred();
        stream.error_occurred();
        stream.stop_stream().unwrap();
        assert!(stream.is_stopped());

        let entries: Vec<_> = std::fs::read_dir(dst.path())
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().to_string_lossy().to_string();
        assert!(name.contains("devB_asrc_diag_0"));
        assert!(name.ends_with(".bin"));
        // One 44-byte entry was recorded
        assert_eq!(entries[0].metadata().unwrap().len(), BYTES_PER_ENTRY as u64);
    }

    #[test]
    fn test_entry_encoding() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devC", dst.path().to_str().unwrap(), 1);
        let stream = DiagnosticStream::new(params, log_writer());
        stream.start_stream().unwrap();
        assert!(stream.is_started());
        stream.write_entry(0x1122, 7, 0x3344, 9, 11, 13, 1.5);
        stream.error_occurred();
        stream.stop_stream().unwrap();
        assert!(stream.is_stopped());

        let entry = std::fs::read_dir(dst.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let bytes = std::fs::read(entry.path()).unwrap();
        assert_eq!(bytes.len(), 44);
        assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 0x1122);
        assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(bytes[16..24].try_into().unwrap()), 0x3344);
        assert_eq!(u64::from_le_bytes(bytes[24..32].try_into().unwrap()), 9);
        assert_eq!(u32::from_le_bytes(bytes[32..36].try_into().unwrap()), 11);
        assert_eq!(u32::from_le_bytes(bytes[36..40].try_into().unwrap()), 13);
        assert_eq!(f32::from_le_bytes(bytes[40..44].try_into().unwrap()), 1.5);
    }

    #[test]
    fn test_double_start_is_tolerated() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devD", dst.path().to_str().unwrap(), 2);
        let stream = DiagnosticStream::new(params, log_writer());

        stream.start_stream().unwrap();
        // A second start is ignored by the state machine but the stream
        // still comes up.
        let _ = stream.start_stream();
        assert!(stream.is_started());
        stream.stop_stream().unwrap();
        assert!(stream.is_stopped());
    }

    #[test]
    fn test_stop_while_idle_fails() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devE", dst.path().to_str().unwrap(), 2);
        let stream = DiagnosticStream::new(params, log_writer());
        assert!(stream.stop_stream().is_err());
    }

    #[test]
    fn test_restart_writes_second_file_index() {
        let dst = tempfile::tempdir().unwrap();
        let params = stream_params("devF", dst.path().to_str().unwrap(), 1);
        let stream = DiagnosticStream::new(params, log_writer());

        for _ in 0..2 {
            stream.start_stream().unwrap();
            assert!(stream.is_started());
            stream.write_entry(1, 1, 1, 1, 1, 1, 1.0);
            stream.error_occurred();
            stream.stop_stream().unwrap();
            assert!(stream.is_stopped());
        }
        let mut names: Vec<String> = std::fs::read_dir(dst.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].contains("_asrc_diag_0"));
        assert!(names[1].contains("_asrc_diag_1"));
    }
}
