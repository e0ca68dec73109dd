//! Diagnostics
//!
//! Per-device timing recorders plus the global log-writer worker. The
//! registry consults the config file for per-device parameters; devices
//! without a diagnostic entry record nothing.

mod log_writer;
mod stream;

pub use log_writer::DiagnosticLogWriter;
pub use stream::{DiagnosticStream, DiagnosticStreamParams, BYTES_PER_ENTRY};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ConfigFile;

/// Registry of diagnostic streams keyed by device name
pub struct Diagnostics {
    log_writer: Arc<DiagnosticLogWriter>,
    streams: Mutex<HashMap<String, Arc<DiagnosticStream>>>,
}

impl Diagnostics {
    pub fn new(config: &ConfigFile) -> Arc<Self> {
        let log_writer = DiagnosticLogWriter::new();
        log_writer.set_config_parameters(config.log_period_time_ms(), config.num_entries_per_msg());
        Arc::new(Self {
            log_writer,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_writer(&self) -> Arc<DiagnosticLogWriter> {
        Arc::clone(&self.log_writer)
    }

    /// Create (or return) the stream for a device if the config carries
    /// diagnostic parameters for it.
    pub fn stream_for_device(
        &self,
        config: &ConfigFile,
        device_name: &str,
        period_time_us: u32,
    ) -> Option<Arc<DiagnosticStream>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = streams.get(device_name) {
            return Some(Arc::clone(stream));
        }
        let diag_config = config.diagnostic_config(device_name)?;
        let stream = DiagnosticStream::new(
            DiagnosticStreamParams {
                device_name: device_name.to_string(),
                port_name: diag_config.port_name.clone(),
                copy_to: diag_config.copy_to.clone(),
                error_threshold: diag_config.error_threshold,
                period_time_us,
            },
            Arc::clone(&self.log_writer),
        );
        streams.insert(device_name.to_string(), Arc::clone(&stream));
        Some(stream)
    }

    /// Already created stream of a device, if any
    pub fn stream(&self, device_name: &str) -> Option<Arc<DiagnosticStream>> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(device_name).cloned()
    }
}
