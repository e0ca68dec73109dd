//! Switch Matrix
//!
//! Global registry of buffer tasks, keyed by source port. Connect and
//! disconnect commands are routed to the right task's queue; the actual job
//! insertion and removal happen inside the owning zone's next real-time
//! tick. Destroying a source tears its task down and broadcasts one
//! source-deleted event per severed connection.

mod buffer_task;
mod job;

pub use buffer_task::{BufferTask, TaskCommand};
pub use job::{JobParams, SwitchMatrixJob};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::event::{ConnectionEvent, Event, EventProvider};
use crate::ring_buffer::RingBuffer;

/// One registered buffer task with the zone that executes it
pub struct TaskHandle {
    /// Base zone whose worker invokes this task
    zone_id: u32,
    task: Mutex<BufferTask>,
}

impl TaskHandle {
    pub fn zone_id(&self) -> u32 {
        self.zone_id
    }

    pub fn task(&self) -> &Mutex<BufferTask> {
        &self.task
    }
}

/// Global connect/disconnect registry
pub struct SwitchMatrix {
    tasks: RwLock<HashMap<i32, Arc<TaskHandle>>>,
    events: Arc<EventProvider>,
}

impl SwitchMatrix {
    pub fn new(events: Arc<EventProvider>) -> Arc<Self> {
        Arc::new(Self {
            tasks: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn has_task(&self, source_port_id: i32) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&source_port_id)
    }

    /// Locate or create the buffer task for a source and enqueue the add-job
    /// command. The job lands inside the next real-time tick of `zone_id`.
    ///
    /// All connections of one source must stay within one base zone; the
    /// source's read cursor has exactly one owning worker.
    pub fn connect_job(
        &self,
        zone_id: u32,
        source_ring: Arc<RingBuffer>,
        source_period: u32,
        job: SwitchMatrixJob,
    ) -> CoreResult<()> {
        let source_port_id = job.params().source_port_id;
        {
            let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = tasks.get(&source_port_id) {
                if handle.zone_id != zone_id {
                    return Err(CoreError::NotAllowed(format!(
                        "source port {source_port_id} is already owned by zone {}",
                        handle.zone_id
                    )));
                }
                let sender = handle
                    .task
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .cmd_sender();
                let _ = sender.send(TaskCommand::AddJob(Box::new(job)));
                return Ok(());
            }
        }
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let handle = tasks.entry(source_port_id).or_insert_with(|| {
            info!(source = source_port_id, zone = zone_id, "creating buffer task");
            Arc::new(TaskHandle {
                zone_id,
                task: Mutex::new(BufferTask::new(
                    source_port_id,
                    source_ring,
                    source_period,
                )),
            })
        });
        if handle.zone_id != zone_id {
            return Err(CoreError::NotAllowed(format!(
                "source port {source_port_id} is already owned by zone {}",
                handle.zone_id
            )));
        }
        let sender = handle
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cmd_sender();
        let _ = sender.send(TaskCommand::AddJob(Box::new(job)));
        Ok(())
    }

    /// Enqueue a delete-job command; the task is reaped after its worker
    /// applied the removal of the last job.
    pub fn disconnect_job(&self, source_port_id: i32, sink_port_id: i32) -> CoreResult<()> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = tasks.get(&source_port_id) else {
            return Err(CoreError::NothingRemoved);
        };
        let sender = handle
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cmd_sender();
        let _ = sender.send(TaskCommand::DeleteJob {
            source_port_id,
            sink_port_id,
        });
        Ok(())
    }

    /// Tear down everything fanning out of a source (device destruction).
    /// Emits one source-deleted event per severed connection.
    pub fn remove_source(&self, source_port_id: i32) -> u32 {
        let handle = {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            tasks.remove(&source_port_id)
        };
        let Some(handle) = handle else {
            return 0;
        };
        let severed = handle
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear_jobs();
        for _sink in &severed {
            self.events
                .send(Event::Connection(ConnectionEvent::SourceDeleted {
                    source_id: source_port_id,
                }));
        }
        info!(
            source = source_port_id,
            connections = severed.len(),
            "source removed from switch matrix"
        );
        severed.len() as u32
    }

    /// Execute all buffer tasks owned by a zone, then reap finished tasks.
    /// Called once per source period tick from the zone worker.
    pub fn run_zone_tasks(&self, zone_id: u32) {
        let handles: Vec<Arc<TaskHandle>> = {
            let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            tasks
                .values()
                .filter(|handle| handle.zone_id == zone_id)
                .cloned()
                .collect()
        };
        let mut reapable: Vec<i32> = Vec::new();
        for handle in handles {
            let mut task = handle.task.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = task.process() {
                warn!(source = task.source_port_id(), %err, "buffer task tick failed");
            }
            for _sink in task.take_severed() {
                self.events
                    .send(Event::Connection(ConnectionEvent::SourceDeleted {
                        source_id: task.source_port_id(),
                    }));
            }
            if task.is_reapable() {
                reapable.push(task.source_port_id());
            }
        }
        if !reapable.is_empty() {
            let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
            for source in reapable {
                let still_reapable = tasks
                    .get(&source)
                    .map(|handle| {
                        handle
                            .task
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .is_reapable()
                    })
                    .unwrap_or(false);
                if still_reapable {
                    info!(source, "reaping buffer task");
                    tasks.remove(&source);
                }
            }
        }
    }

    /// Run a closure against the job of one connection (probe control)
    pub fn with_job<R>(
        &self,
        source_port_id: i32,
        sink_port_id: i32,
        f: impl FnOnce(&mut SwitchMatrixJob) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let Some(handle) = tasks.get(&source_port_id) else {
            return Err(CoreError::InvalidParam(format!(
                "no task for source port {source_port_id}"
            )));
        };
        let mut task = handle.task.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = task.job_mut(sink_port_id) else {
            return Err(CoreError::InvalidParam(format!(
                "no job for connection {source_port_id} -> {sink_port_id}"
            )));
        };
        f(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::{AccessDirection, SampleFormat};

    fn job(source_port: i32, sink_port: i32, sink: Arc<RingBuffer>) -> SwitchMatrixJob {
        SwitchMatrixJob::new(
            JobParams {
                source_port_id: source_port,
                sink_port_id: sink_port,
                source_index: 0,
                source_channels: 2,
                sink_index: 0,
                sink_channels: 2,
                source_rate: 48_000,
                sink_rate: 48_000,
                sink_period: 32,
                asrc_capacity: 0,
            },
            sink,
        )
        .unwrap()
    }

    fn fill(ring: &RingBuffer, frames: u32) {
        let samples = vec![0.5f32; (frames * ring.channels()) as usize];
        let mut access = ring.begin_access(AccessDirection::Write, frames).unwrap();
        let granted = access.frames();
        access
            .write_from_f32(0, ring.channels(), granted, &samples)
            .unwrap();
        access.commit(granted).unwrap();
    }

    #[test]
    fn test_connect_creates_task_and_transfers() {
        let events = EventProvider::new();
        let matrix = SwitchMatrix::new(Arc::clone(&events));
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();

        matrix
            .connect_job(1, Arc::clone(&source), 32, job(10, 20, Arc::clone(&sink)))
            .unwrap();
        assert!(matrix.has_task(10));

        fill(&source, 32);
        matrix.run_zone_tasks(1);
        assert_eq!(sink.update_available(AccessDirection::Read), 32);
    }

    #[test]
    fn test_cross_zone_source_rejected() {
        let events = EventProvider::new();
        let matrix = SwitchMatrix::new(events);
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink_a = RingBuffer::new("a", 2, SampleFormat::Float32, 256).unwrap();
        let sink_b = RingBuffer::new("b", 2, SampleFormat::Float32, 256).unwrap();

        matrix
            .connect_job(1, Arc::clone(&source), 32, job(10, 20, sink_a))
            .unwrap();
        let result = matrix.connect_job(2, Arc::clone(&source), 32, job(10, 21, sink_b));
        assert!(matches!(result, Err(CoreError::NotAllowed(_))));
    }

    #[test]
    fn test_disconnect_then_reap() {
        let events = EventProvider::new();
        let matrix = SwitchMatrix::new(Arc::clone(&events));
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink = RingBuffer::new("sink", 2, SampleFormat::Float32, 256).unwrap();

        matrix
            .connect_job(1, Arc::clone(&source), 32, job(10, 20, sink))
            .unwrap();
        matrix.run_zone_tasks(1);
        matrix.disconnect_job(10, 20).unwrap();
        matrix.run_zone_tasks(1);
        assert!(!matrix.has_task(10));
    }

    #[test]
    fn test_disconnect_unknown_fails() {
        let events = EventProvider::new();
        let matrix = SwitchMatrix::new(events);
        assert!(matches!(
            matrix.disconnect_job(1, 2),
            Err(CoreError::NothingRemoved)
        ));
    }

    #[test]
    fn test_remove_source_broadcasts_per_connection() {
        let events = EventProvider::new();
        let matrix = SwitchMatrix::new(Arc::clone(&events));
        let source = RingBuffer::new("src", 2, SampleFormat::Float32, 256).unwrap();
        let sink_a = RingBuffer::new("a", 2, SampleFormat::Float32, 256).unwrap();
        let sink_b = RingBuffer::new("b", 2, SampleFormat::Float32, 256).unwrap();

        matrix
            .connect_job(1, Arc::clone(&source), 32, job(10, 20, sink_a))
            .unwrap();
        matrix
            .connect_job(1, Arc::clone(&source), 32, job(10, 21, sink_b))
            .unwrap();
        matrix.run_zone_tasks(1);

        let severed = matrix.remove_source(10);
        assert_eq!(severed, 2);
        assert!(!matrix.has_task(10));

        let mut deleted = 0;
        while let Ok(event) = events.next_event() {
            if matches!(
                event,
                Event::Connection(ConnectionEvent::SourceDeleted { source_id: 10 })
            ) {
                deleted += 1;
            }
        }
        assert_eq!(deleted, 2);
    }
}
