//! Switch Matrix Job
//!
//! One directed edge from a source port to a sink port. The job owns the
//! format conversion descriptors, an ASRC when the two sides run at
//! different sample rates, and an optional data probe on the sink side.
//!
//! Per period the job reads from the shared source view supplied by its
//! buffer task and writes exactly one sink period (or less, carrying the
//! remainder forward) into the sink ring buffer.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::asrc::Asrc;
use crate::error::{CoreError, CoreResult};
use crate::probe::{DataProbe, ProbeMode, ProbeParams};
use crate::ring_buffer::{AccessDirection, RingAccess, RingBuffer};

/// How many sink periods the per-call scratch buffers can hold
const SCRATCH_PERIODS: u32 = 4;

/// Construction parameters of a job
#[derive(Debug, Clone)]
pub struct JobParams {
    pub source_port_id: i32,
    pub sink_port_id: i32,
    /// Channel range of the source port within the source ring
    pub source_index: u32,
    pub source_channels: u32,
    /// Channel range of the sink port within the sink ring
    pub sink_index: u32,
    pub sink_channels: u32,
    pub source_rate: u32,
    pub sink_rate: u32,
    /// Copy size per period (the sink period)
    pub sink_period: u32,
    /// ASRC buffer size in frames when the rates differ
    pub asrc_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Initialized,
    Active,
}

/// One source->sink transfer edge
pub struct SwitchMatrixJob {
    params: JobParams,
    sink_ring: Arc<RingBuffer>,
    asrc: Option<Asrc>,
    probe: Option<DataProbe>,
    state: JobState,
    /// Source-side read scratch, source channel layout
    scratch_src: Vec<f32>,
    /// Sink-side scratch after channel adaptation
    scratch_sink: Vec<f32>,
}

impl SwitchMatrixJob {
    pub fn new(params: JobParams, sink_ring: Arc<RingBuffer>) -> CoreResult<Self> {
        if params.sink_period == 0 {
            return Err(CoreError::InvalidParam(
                "job with zero sink period".to_string(),
            ));
        }
        // Channel adaptation is limited to repeating a mono source and to
        // collapsing to a mono sink; anything else needs matching counts.
        let adaptable = params.source_channels == params.sink_channels
            || params.source_channels == 1
            || params.sink_channels == 1;
        if !adaptable {
            return Err(CoreError::InvalidParam(format!(
                "cannot adapt {} source channels to {} sink channels",
                params.source_channels, params.sink_channels
            )));
        }
        if params.sink_index + params.sink_channels > sink_ring.channels() {
            return Err(CoreError::InvalidParam(format!(
                "sink port channels [{}, {}) exceed ring width {}",
                params.sink_index,
                params.sink_index + params.sink_channels,
                sink_ring.channels()
            )));
        }
        let asrc = if params.source_rate != params.sink_rate {
            Some(Asrc::new(
                params.sink_channels,
                params.source_rate,
                params.sink_rate,
                params.asrc_capacity,
            )?)
        } else {
            None
        };
        let scratch_frames = (params.sink_period * SCRATCH_PERIODS) as usize;
        Ok(Self {
            scratch_src: vec![0.0; scratch_frames * params.source_channels as usize],
            scratch_sink: vec![0.0; scratch_frames * params.sink_channels as usize],
            params,
            sink_ring,
            asrc,
            probe: None,
            state: JobState::Initialized,
        })
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn matches(&self, source_port_id: i32, sink_port_id: i32) -> bool {
        self.params.source_port_id == source_port_id && self.params.sink_port_id == sink_port_id
    }

    pub fn sink_port_id(&self) -> i32 {
        self.params.sink_port_id
    }

    pub fn is_rate_matched(&self) -> bool {
        self.asrc.is_none()
    }

    /// Whether the job has transferred at least once since creation
    pub fn is_active(&self) -> bool {
        self.state == JobState::Active
    }

    pub fn is_probing(&self) -> bool {
        self.probe.is_some()
    }

    /// Start probing this connection. The probe parameters must conform to
    /// the sink side; a second concurrent start fails.
    pub fn start_probe(&mut self, params: ProbeParams, mode: ProbeMode) -> CoreResult<()> {
        if self.probe.is_some() {
            return Err(CoreError::NotAllowed(
                "probing is already active on this connection".to_string(),
            ));
        }
        if params.channels != self.params.sink_channels {
            return Err(CoreError::InvalidParam(format!(
                "probe channels {} do not conform to sink channels {}",
                params.channels, self.params.sink_channels
            )));
        }
        if params.sample_rate != self.params.sink_rate {
            return Err(CoreError::InvalidParam(format!(
                "probe rate {} does not conform to sink rate {}",
                params.sample_rate, self.params.sink_rate
            )));
        }
        self.probe = Some(DataProbe::start(params, mode)?);
        Ok(())
    }

    pub fn stop_probe(&mut self) {
        self.probe = None;
    }

    /// Transfer one period from the shared source view into the sink ring.
    ///
    /// Returns the number of source frames consumed; the buffer task commits
    /// the maximum across all of its jobs.
    pub fn execute(&mut self, source: &RingAccess) -> CoreResult<u32> {
        self.state = JobState::Active;
        match self.asrc.is_some() {
            false => self.execute_matched(source),
            true => self.execute_asrc(source),
        }
    }

    /// Equal rates: format conversion only
    fn execute_matched(&mut self, source: &RingAccess) -> CoreResult<u32> {
        let sink_ring = Arc::clone(&self.sink_ring);
        let mut sink_access =
            sink_ring.begin_access(AccessDirection::Write, self.params.sink_period)?;
        let frames = source
            .frames()
            .min(sink_access.frames())
            .min(self.params.sink_period);
        if frames == 0 {
            drop(sink_access);
            return Ok(0);
        }
        source.read_into_f32(
            self.params.source_index,
            self.params.source_channels,
            frames,
            &mut self.scratch_src,
        )?;
        adapt_channels(
            &self.scratch_src,
            self.params.source_channels,
            &mut self.scratch_sink,
            self.params.sink_channels,
            frames,
        );
        self.apply_probe(frames)?;
        sink_access.write_from_f32(
            self.params.sink_index,
            self.params.sink_channels,
            frames,
            &self.scratch_sink,
        )?;
        sink_access.commit(frames)?;
        Ok(frames)
    }

    /// Different rates: feed the ASRC, pull one sink period out
    fn execute_asrc(&mut self, source: &RingAccess) -> CoreResult<u32> {
        let asrc = self.asrc.as_mut().expect("asrc path without asrc");

        // Feed as much source data as the ASRC accepts this period.
        let max_frames =
            (self.scratch_src.len() / self.params.source_channels as usize) as u32;
        let feed = source.frames().min(max_frames).min(asrc.free_frames());
        if feed > 0 {
            source.read_into_f32(
                self.params.source_index,
                self.params.source_channels,
                feed,
                &mut self.scratch_src,
            )?;
            adapt_channels(
                &self.scratch_src,
                self.params.source_channels,
                &mut self.scratch_sink,
                self.params.sink_channels,
                feed,
            );
            let accepted =
                asrc.push(&self.scratch_sink[..(feed * self.params.sink_channels) as usize]);
            debug_assert_eq!(accepted, feed);
        }

        // Pull exactly one sink period; a short pull is carried forward by
        // the ASRC fill state.
        let sink_ring = Arc::clone(&self.sink_ring);
        let mut sink_access =
            sink_ring.begin_access(AccessDirection::Write, self.params.sink_period)?;
        let wanted = sink_access.frames().min(self.params.sink_period);
        if wanted == 0 {
            drop(sink_access);
            return Ok(feed);
        }
        let produced =
            asrc.pull(&mut self.scratch_sink[..(wanted * self.params.sink_channels) as usize]);
        if produced < wanted {
            debug!(
                source = self.params.source_port_id,
                sink = self.params.sink_port_id,
                produced,
                wanted,
                "asrc short write"
            );
        }
        if produced > 0 {
            self.apply_probe(produced)?;
            sink_access.write_from_f32(
                self.params.sink_index,
                self.params.sink_channels,
                produced,
                &self.scratch_sink,
            )?;
            sink_access.commit(produced)?;
        }
        Ok(feed)
    }

    /// Fan the sink-side frames to the probe (record) or replace them with
    /// probe data (inject). A finished probe detaches itself.
    fn apply_probe(&mut self, frames: u32) -> CoreResult<()> {
        let Some(probe) = self.probe.as_mut() else {
            return Ok(());
        };
        let samples = &mut self.scratch_sink[..(frames * self.params.sink_channels) as usize];
        let keep = match probe.mode() {
            ProbeMode::Record => probe.record(samples),
            ProbeMode::Inject => probe.inject(samples),
        };
        match keep {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    sink = self.params.sink_port_id,
                    "probe finished, detaching"
                );
                self.probe = None;
            }
            Err(err) => {
                warn!(%err, "probe failed, detaching");
                self.probe = None;
            }
        }
        Ok(())
    }
}

/// Adapt interleaved samples between channel counts: copy when equal,
/// repeat a mono source, or keep the first channel for a mono sink.
fn adapt_channels(src: &[f32], src_channels: u32, dst: &mut [f32], dst_channels: u32, frames: u32) {
    if src_channels == dst_channels {
        let count = (frames * src_channels) as usize;
        dst[..count].copy_from_slice(&src[..count]);
        return;
    }
    if src_channels == 1 {
        for frame in 0..frames as usize {
            let value = src[frame];
            for chan in 0..dst_channels as usize {
                dst[frame * dst_channels as usize + chan] = value;
            }
        }
        return;
    }
    // dst_channels == 1: drop everything but the first source channel
    for frame in 0..frames as usize {
        dst[frame] = src[frame * src_channels as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::SampleFormat;

    fn job_params(source_rate: u32, sink_rate: u32) -> JobParams {
        JobParams {
            source_port_id: 1,
            sink_port_id: 2,
            source_index: 0,
            source_channels: 2,
            sink_index: 0,
            sink_channels: 2,
            source_rate,
            sink_rate,
            sink_period: 64,
            asrc_capacity: 64 * 8,
        }
    }

    fn fill_source(ring: &RingBuffer, frames: u32, value: f32) {
        let samples = vec![value; (frames * ring.channels()) as usize];
        let mut access = ring.begin_access(AccessDirection::Write, frames).unwrap();
        let granted = access.frames();
        access
            .write_from_f32(0, ring.channels(), granted, &samples)
            .unwrap();
        access.commit(granted).unwrap();
    }

    #[test]
    fn test_rejects_bad_channel_adaptation() {
        let sink = RingBuffer::new("sink", 6, SampleFormat::Float32, 256).unwrap();
        let mut params = job_params(48_000, 48_000);
        params.source_channels = 2;
        params.sink_channels = 6;
        assert!(SwitchMatrixJob::new(params, sink).is_err());
    }

    #[test]
    fn test_rejects_sink_range_overflow() {
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut params = job_params(48_000, 48_000);
        params.sink_index = 1;
        assert!(SwitchMatrixJob::new(params, sink).is_err());
    }

    #[test]
    fn test_matched_transfer() {
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut job =
            SwitchMatrixJob::new(job_params(48_000, 48_000), Arc::clone(&sink)).unwrap();
        assert!(job.is_rate_matched());

        fill_source(&source, 64, 0.5);
        let access = source.begin_access(AccessDirection::Read, 256).unwrap();
        let consumed = job.execute(&access).unwrap();
        access.commit(consumed).unwrap();
        assert_eq!(consumed, 64);
        assert_eq!(sink.update_available(AccessDirection::Read), 64);

        let read = sink.begin_access(AccessDirection::Read, 64).unwrap();
        let mut out = vec![0.0f32; 128];
        read.read_into_f32(0, 2, 64, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_asrc_transfer_primes_then_produces() {
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 1024).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 1024).unwrap();
        let mut job = SwitchMatrixJob::new(job_params(8_000, 48_000), Arc::clone(&sink)).unwrap();
        assert!(!job.is_rate_matched());

        // Keep feeding source periods; the sink stays silent until the ASRC
        // has primed, then produces full periods.
        let mut produced_any = false;
        for _ in 0..32 {
            fill_source(&source, 64, 0.25);
            let access = source.begin_access(AccessDirection::Read, 1024).unwrap();
            let consumed = job.execute(&access).unwrap();
            access.commit(consumed).unwrap();
            if sink.update_available(AccessDirection::Read) > 0 {
                produced_any = true;
                break;
            }
        }
        assert!(produced_any, "asrc never produced output");
    }

    #[test]
    fn test_mono_upmix() {
        let source = RingBuffer::new("src", 1, SampleFormat::Float32, 256).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut params = job_params(48_000, 48_000);
        params.source_channels = 1;
        let mut job = SwitchMatrixJob::new(params, Arc::clone(&sink)).unwrap();

        fill_source(&source, 64, 0.75);
        let access = source.begin_access(AccessDirection::Read, 256).unwrap();
        let consumed = job.execute(&access).unwrap();
        access.commit(consumed).unwrap();

        let read = sink.begin_access(AccessDirection::Read, 64).unwrap();
        let mut out = vec![0.0f32; 128];
        read.read_into_f32(0, 2, 64, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.75));
    }

    #[test]
    fn test_double_probe_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut job = SwitchMatrixJob::new(job_params(48_000, 48_000), sink).unwrap();
        let probe_params = ProbeParams {
            file_prefix: dir.path().join("cap").to_string_lossy().to_string(),
            num_periods: 4,
            channels: 2,
            sample_rate: 48_000,
        };
        job.start_probe(probe_params.clone(), ProbeMode::Record).unwrap();
        assert!(matches!(
            job.start_probe(probe_params, ProbeMode::Record),
            Err(CoreError::NotAllowed(_))
        ));
    }

    #[test]
    fn test_probe_params_must_conform_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut job = SwitchMatrixJob::new(job_params(48_000, 48_000), sink).unwrap();
        let bad_channels = ProbeParams {
            file_prefix: dir.path().join("cap").to_string_lossy().to_string(),
            num_periods: 4,
            channels: 4,
            sample_rate: 48_000,
        };
        assert!(job.start_probe(bad_channels, ProbeMode::Record).is_err());

        let bad_rate = ProbeParams {
            file_prefix: dir.path().join("cap").to_string_lossy().to_string(),
            num_periods: 4,
            channels: 2,
            sample_rate: 44_100,
        };
        assert!(job.start_probe(bad_rate, ProbeMode::Record).is_err());
    }

    #[test]
    fn test_probe_records_sink_frames() {
        let dir = tempfile::tempdir().unwrap();
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();
        let mut job =
            SwitchMatrixJob::new(job_params(48_000, 48_000), Arc::clone(&sink)).unwrap();
        let prefix = dir.path().join("cap").to_string_lossy().to_string();
        job.start_probe(
            ProbeParams {
                file_prefix: prefix.clone(),
                num_periods: 1,
                channels: 2,
                sample_rate: 48_000,
            },
            ProbeMode::Record,
        )
        .unwrap();

        fill_source(&source, 64, 0.5);
        let access = source.begin_access(AccessDirection::Read, 256).unwrap();
        let consumed = job.execute(&access).unwrap();
        access.commit(consumed).unwrap();
        assert!(!job.is_probing());

        let recorded = std::fs::read(format!("{prefix}.pcm")).unwrap();
        assert_eq!(recorded.len(), 64 * 2 * 4);
    }
}
