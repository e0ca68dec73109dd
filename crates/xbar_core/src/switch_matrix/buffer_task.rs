//! Buffer Task
//!
//! The per-source transfer engine: owns the read cursor of one source ring
//! buffer and holds every job fanning out of that source. Topology changes
//! arrive as add/delete commands on a lock-free queue and are applied at the
//! next tick, so issuing them never blocks the real-time thread.
//!
//! With no live jobs the task runs in dummy mode and simply drains the
//! source, keeping source timing deterministic from the first sample.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::ring_buffer::{AccessDirection, RingBuffer};

use super::job::SwitchMatrixJob;

/// Commands applied at the next tick
pub enum TaskCommand {
    AddJob(Box<SwitchMatrixJob>),
    DeleteJob { source_port_id: i32, sink_port_id: i32 },
}

/// Per-source transfer engine
pub struct BufferTask {
    source_port_id: i32,
    source_ring: Arc<RingBuffer>,
    /// Frames drained per tick while in dummy mode
    source_period: u32,
    jobs: Vec<SwitchMatrixJob>,
    cmd_tx: Sender<TaskCommand>,
    cmd_rx: Receiver<TaskCommand>,
    /// All jobs run the fast pass-through path
    rates_match: bool,
    /// Set when a delete removed the last job; cleared by a new add
    reap_requested: bool,
    /// Sink ids of connections severed since the last drain, for
    /// source-deleted bookkeeping
    severed: Vec<i32>,
}

impl BufferTask {
    pub fn new(source_port_id: i32, source_ring: Arc<RingBuffer>, source_period: u32) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        Self {
            source_port_id,
            source_ring,
            source_period,
            jobs: Vec::new(),
            cmd_tx,
            cmd_rx,
            rates_match: true,
            reap_requested: false,
            severed: Vec::new(),
        }
    }

    pub fn source_port_id(&self) -> i32 {
        self.source_port_id
    }

    pub fn cmd_sender(&self) -> Sender<TaskCommand> {
        self.cmd_tx.clone()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the task only drains the source
    pub fn is_dummy(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether every job runs the rate-matched fast path
    pub fn rates_match(&self) -> bool {
        self.rates_match
    }

    pub fn is_reapable(&self) -> bool {
        self.reap_requested && self.jobs.is_empty() && self.cmd_rx.is_empty()
    }

    /// Take the sink ids severed since the last call
    pub fn take_severed(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.severed)
    }

    /// Apply pending add/delete commands
    pub fn drain_commands(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                TaskCommand::AddJob(job) => {
                    info!(
                        source = self.source_port_id,
                        sink = job.sink_port_id(),
                        "adding switch matrix job"
                    );
                    self.jobs.push(*job);
                    self.reap_requested = false;
                }
                TaskCommand::DeleteJob {
                    source_port_id,
                    sink_port_id,
                } => {
                    let before = self.jobs.len();
                    self.jobs
                        .retain(|job| !job.matches(source_port_id, sink_port_id));
                    if self.jobs.len() == before {
                        warn!(
                            source = source_port_id,
                            sink = sink_port_id,
                            "delete for unknown job ignored"
                        );
                    } else {
                        info!(
                            source = source_port_id,
                            sink = sink_port_id,
                            "removed switch matrix job"
                        );
                        self.severed.push(sink_port_id);
                    }
                    if self.jobs.is_empty() {
                        self.reap_requested = true;
                    }
                }
            }
        }
        self.rates_match = self.jobs.iter().all(|job| job.is_rate_matched());
    }

    /// One tick: drain commands, then run every job against a single shared
    /// read view of the source and release it with the maximum consumption.
    pub fn process(&mut self) -> CoreResult<()> {
        self.drain_commands();

        if self.jobs.is_empty() {
            // Dummy mode: discard one source period to keep the source
            // draining while it awaits a connection.
            let access = self
                .source_ring
                .begin_access(AccessDirection::Read, self.source_period)?;
            let frames = access.frames();
            access.commit(frames)?;
            if frames > 0 {
                debug!(
                    source = self.source_port_id,
                    frames, "dummy task drained source"
                );
            }
            return Ok(());
        }

        let access = self
            .source_ring
            .begin_access(AccessDirection::Read, self.source_ring.capacity())?;
        let mut max_consumed = 0u32;
        for job in &mut self.jobs {
            let consumed = job.execute(&access)?;
            max_consumed = max_consumed.max(consumed);
        }
        access.commit(max_consumed)?;
        Ok(())
    }

    /// Tear the task down, reporting every severed connection
    pub fn clear_jobs(&mut self) -> Vec<i32> {
        self.drain_commands();
        let severed: Vec<i32> = self.jobs.iter().map(|job| job.sink_port_id()).collect();
        self.jobs.clear();
        self.reap_requested = true;
        severed
    }

    /// Access a job for probe control
    pub fn job_mut(&mut self, sink_port_id: i32) -> Option<&mut SwitchMatrixJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.sink_port_id() == sink_port_id)
    }
}
