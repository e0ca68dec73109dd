//! Event Provider
//!
//! Process-wide fan-in point for everything the crossbar reports to its
//! embedder: connection changes, setup changes and module events. Producers
//! push through lock-free channels; a single consumer polls or waits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use xbar_dsp::ModuleEvent;

use crate::error::{CoreError, CoreResult};

/// Routing-level connection events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected { source_id: i32, sink_id: i32 },
    Disconnected { source_id: i32, sink_id: i32 },
    SourceDeleted { source_id: i32 },
    SinkDeleted { sink_id: i32 },
}

/// Topology-level setup events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetupEvent {
    DeviceCreated { name: String },
    DeviceDestroyed { name: String },
    ZoneStarted { name: String },
    ZoneStopped { name: String },
    ZoneError { name: String, message: String },
}

/// One event of any kind
#[derive(Debug, Clone)]
pub enum Event {
    Connection(ConnectionEvent),
    Setup(SetupEvent),
    Module(ModuleEvent),
}

/// Fan-in queue with one consumer
pub struct EventProvider {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    module_tx: Sender<ModuleEvent>,
    module_rx: Receiver<ModuleEvent>,
    pending: Mutex<VecDeque<Event>>,
}

impl EventProvider {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded();
        let (module_tx, module_rx) = unbounded();
        Arc::new(Self {
            tx,
            rx,
            module_tx,
            module_rx,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    /// Producer handle for core events
    pub fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Producer handle handed to pipelines for module events
    pub fn module_sender(&self) -> Sender<ModuleEvent> {
        self.module_tx.clone()
    }

    fn pump(&self, pending: &mut VecDeque<Event>) {
        while let Ok(event) = self.rx.try_recv() {
            pending.push_back(event);
        }
        while let Ok(event) = self.module_rx.try_recv() {
            pending.push_back(Event::Module(event));
        }
    }

    /// Block until an event is queued, bounded by `timeout`. Does not consume
    /// the event.
    pub fn wait_for_event(&self, timeout: Duration) -> CoreResult<()> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            self.pump(&mut pending);
            if !pending.is_empty() {
                return Ok(());
            }
        }
        crossbeam_channel::select! {
            recv(self.rx) -> event => {
                if let Ok(event) = event {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.push_back(event);
                }
                Ok(())
            }
            recv(self.module_rx) -> event => {
                if let Ok(event) = event {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.push_back(Event::Module(event));
                }
                Ok(())
            }
            default(timeout) => Err(CoreError::Timeout),
        }
    }

    /// Pop the next event, if any
    pub fn next_event(&self) -> CoreResult<Event> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.pump(&mut pending);
        pending.pop_front().ok_or(CoreError::NoEventAvailable)
    }

    /// Count of queued events (for tests and introspection)
    pub fn queued(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.pump(&mut pending);
        pending.len()
    }
}
