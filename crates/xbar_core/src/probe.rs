//! Data Probe
//!
//! Capture or inject raw PCM at a switch-matrix job, conforming to the sink
//! side of the connection. A probe runs for a bounded number of periods and
//! then deactivates itself; files carry interleaved f32 samples.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// Whether the probe records the stream or replaces it with file data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Record,
    Inject,
}

/// Probe configuration; format and rate must conform to the sink side of
/// the probed connection (validated by the job).
#[derive(Debug, Clone)]
pub struct ProbeParams {
    /// File name prefix; `.pcm` is appended
    pub file_prefix: String,
    pub num_periods: u32,
    pub channels: u32,
    pub sample_rate: u32,
}

enum ProbeBackend {
    Record(BufWriter<File>),
    Inject(BufReader<File>),
}

/// An active probe on one connection
pub struct DataProbe {
    params: ProbeParams,
    backend: ProbeBackend,
    remaining_periods: u32,
    path: PathBuf,
}

impl DataProbe {
    pub fn start(params: ProbeParams, mode: ProbeMode) -> CoreResult<Self> {
        if params.num_periods == 0 || params.channels == 0 {
            return Err(CoreError::InvalidParam(
                "probe needs at least one period and one channel".to_string(),
            ));
        }
        let path = PathBuf::from(format!("{}.pcm", params.file_prefix));
        let backend = match mode {
            ProbeMode::Record => ProbeBackend::Record(BufWriter::new(File::create(&path)?)),
            ProbeMode::Inject => ProbeBackend::Inject(BufReader::new(File::open(&path)?)),
        };
        info!(path = %path.display(), ?mode, periods = params.num_periods, "probe started");
        Ok(Self {
            remaining_periods: params.num_periods,
            params,
            backend,
            path,
        })
    }

    pub fn params(&self) -> &ProbeParams {
        &self.params
    }

    pub fn mode(&self) -> ProbeMode {
        match self.backend {
            ProbeBackend::Record(_) => ProbeMode::Record,
            ProbeBackend::Inject(_) => ProbeMode::Inject,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.remaining_periods == 0
    }

    /// Record one period of interleaved sink-side samples.
    ///
    /// Returns `true` while the probe stays active.
    pub fn record(&mut self, samples: &[f32]) -> CoreResult<bool> {
        if self.remaining_periods == 0 {
            return Ok(false);
        }
        let ProbeBackend::Record(writer) = &mut self.backend else {
            return Err(CoreError::WrongState("probe is injecting".to_string()));
        };
        for &sample in samples {
            writer.write_all(&sample.to_le_bytes())?;
        }
        self.remaining_periods -= 1;
        if self.remaining_periods == 0 {
            writer.flush()?;
            info!(path = %self.path.display(), "probe recording finished");
        }
        Ok(self.remaining_periods > 0)
    }

    /// Replace one period of sink-side samples with file data. Short files
    /// end the probe early; untouched frames keep their content.
    ///
    /// Returns `true` while the probe stays active.
    pub fn inject(&mut self, out: &mut [f32]) -> CoreResult<bool> {
        if self.remaining_periods == 0 {
            return Ok(false);
        }
        let ProbeBackend::Inject(reader) = &mut self.backend else {
            return Err(CoreError::WrongState("probe is recording".to_string()));
        };
        let mut bytes = [0u8; 4];
        for sample in out.iter_mut() {
            match reader.read_exact(&mut bytes) {
                Ok(()) => *sample = f32::from_le_bytes(bytes),
                Err(_) => {
                    warn!(path = %self.path.display(), "probe file exhausted");
                    self.remaining_periods = 0;
                    return Ok(false);
                }
            }
        }
        self.remaining_periods -= 1;
        Ok(self.remaining_periods > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_params(dir: &std::path::Path, periods: u32) -> ProbeParams {
        ProbeParams {
            file_prefix: dir.join("probe0").to_string_lossy().to_string(),
            num_periods: periods,
            channels: 2,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn test_record_then_inject_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let params = probe_params(dir.path(), 2);

        let mut probe = DataProbe::start(params.clone(), ProbeMode::Record).unwrap();
        let period_a = vec![0.25f32; 8];
        let period_b = vec![-0.5f32; 8];
        assert!(probe.record(&period_a).unwrap());
        assert!(!probe.record(&period_b).unwrap());
        assert!(probe.is_finished());
        drop(probe);

        let mut probe = DataProbe::start(params, ProbeMode::Inject).unwrap();
        let mut out = vec![0.0f32; 8];
        assert!(probe.inject(&mut out).unwrap());
        assert_eq!(out, period_a);
        assert!(!probe.inject(&mut out).unwrap());
        assert_eq!(out, period_b);
    }

    #[test]
    fn test_inject_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let params = probe_params(dir.path(), 1);
        assert!(DataProbe::start(params, ProbeMode::Inject).is_err());
    }

    #[test]
    fn test_zero_periods_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let params = probe_params(dir.path(), 0);
        assert!(matches!(
            DataProbe::start(params, ProbeMode::Record),
            Err(CoreError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_short_inject_file_ends_probe() {
        let dir = tempfile::tempdir().unwrap();
        let params = probe_params(dir.path(), 4);
        let mut probe = DataProbe::start(params.clone(), ProbeMode::Record).unwrap();
        probe.record(&vec![1.0f32; 8]).unwrap();
        drop(probe);

        // File has one period but the probe asks for four
        let mut probe = DataProbe::start(params, ProbeMode::Inject).unwrap();
        let mut out = vec![0.0f32; 8];
        assert!(probe.inject(&mut out).unwrap());
        assert!(!probe.inject(&mut out).unwrap());
        assert!(probe.is_finished());
    }
}
