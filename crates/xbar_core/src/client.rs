//! Client Device
//!
//! Process-local counterpart of an external audio application. The client
//! owns a PCM ring buffer and a two-way control channel; an IPC worker thread
//! translates control messages (start, stop, drain, pause, resume,
//! get-latency, set-parameters) into session-tagged device events consumed by
//! the routing zone.
//!
//! Every parameter change starts a new session by bumping the session id, so
//! the zone can discard in-flight events that belong to a previous session.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::ring_buffer::{AccessDirection, RingBuffer};

/// Direction of a device as seen from the crossbar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    /// Produces audio into the crossbar
    Source,
    /// Consumes audio from the crossbar
    Sink,
}

/// Control messages arriving from the external application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientControl {
    Start,
    Stop,
    Drain,
    Pause,
    Resume,
    GetLatency,
    /// The application chose new stream parameters; starts a new session
    SetParameters,
    Shutdown,
}

/// Responses sent back to the external application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientResponse {
    Ack(ClientControl),
    Nak(ClientControl),
    Latency(u32),
}

/// Session-tagged events consumed by the routing zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub session_id: i32,
}

/// Handle given to the external side of the connection
#[derive(Clone)]
pub struct ClientControlHandle {
    control_tx: Sender<ClientControl>,
    response_rx: Receiver<ClientResponse>,
}

impl ClientControlHandle {
    pub fn send(&self, control: ClientControl) -> CoreResult<()> {
        self.control_tx
            .send(control)
            .map_err(|_| CoreError::NotRunning)
    }

    pub fn recv_response(&self, timeout: Duration) -> CoreResult<ClientResponse> {
        self.response_rx
            .recv_timeout(timeout)
            .map_err(|_| CoreError::Timeout)
    }
}

/// The crossbar-side client device
pub struct ClientDevice {
    name: String,
    direction: DeviceDirection,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    control_tx: Sender<ClientControl>,
    response_rx: Receiver<ClientResponse>,
    event_rx: Receiver<DeviceEvent>,
    event_queue_enabled: Arc<AtomicBool>,
    session_id: Arc<AtomicI32>,
}

impl ClientDevice {
    pub fn new(name: impl Into<String>, direction: DeviceDirection, ring: Arc<RingBuffer>) -> Self {
        let name = name.into();
        let (control_tx, control_rx) = unbounded::<ClientControl>();
        let (response_tx, response_rx) = unbounded::<ClientResponse>();
        let (event_tx, event_rx) = unbounded::<DeviceEvent>();
        let running = Arc::new(AtomicBool::new(true));
        let event_queue_enabled = Arc::new(AtomicBool::new(false));
        let session_id = Arc::new(AtomicI32::new(0));

        let worker = {
            let name = name.clone();
            let ring = Arc::clone(&ring);
            let running = Arc::clone(&running);
            let enabled = Arc::clone(&event_queue_enabled);
            let session = Arc::clone(&session_id);
            std::thread::Builder::new()
                .name(format!("xbar-client-{name}"))
                .spawn(move || {
                    ipc_worker(
                        &name, direction, ring, running, enabled, session, control_rx,
                        response_tx, event_tx,
                    );
                })
                .expect("failed to spawn client IPC thread")
        };

        Self {
            name,
            direction,
            ring,
            running,
            worker: Some(worker),
            control_tx,
            response_rx,
            event_rx,
            event_queue_enabled,
            session_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> DeviceDirection {
        self.direction
    }

    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    /// External side of the control channel
    pub fn control_handle(&self) -> ClientControlHandle {
        ClientControlHandle {
            control_tx: self.control_tx.clone(),
            response_rx: self.response_rx.clone(),
        }
    }

    pub fn enable_event_queue(&self, enable: bool) {
        self.event_queue_enabled.store(enable, Ordering::Release);
    }

    pub fn session_id(&self) -> i32 {
        self.session_id.load(Ordering::Acquire)
    }

    /// Pop the next device event, silently discarding events from previous
    /// sessions.
    pub fn next_event(&self) -> CoreResult<DeviceEvent> {
        let current = self.session_id();
        while let Ok(event) = self.event_rx.try_recv() {
            if event.session_id == current {
                return Ok(event);
            }
            debug!(
                device = %self.name,
                event_session = event.session_id,
                current_session = current,
                "discarding outdated device event"
            );
        }
        Err(CoreError::NoEventAvailable)
    }
}

impl Drop for ClientDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.control_tx.send(ClientControl::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!(device = %self.name, "client IPC thread ended");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn ipc_worker(
    name: &str,
    direction: DeviceDirection,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    event_queue_enabled: Arc<AtomicBool>,
    session_id: Arc<AtomicI32>,
    control_rx: Receiver<ClientControl>,
    response_tx: Sender<ClientResponse>,
    event_tx: Sender<DeviceEvent>,
) {
    info!(device = name, "client IPC thread started");
    while running.load(Ordering::Acquire) {
        let Ok(control) = control_rx.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };
        let session = session_id.load(Ordering::Acquire);
        match control {
            ClientControl::GetLatency => {
                let fill = ring.update_available(AccessDirection::Read);
                let _ = response_tx.send(ClientResponse::Latency(fill));
            }
            ClientControl::Start => {
                info!(device = name, session, "received start control");
                let _ = response_tx.send(ClientResponse::Ack(ClientControl::Start));
                put_event(&event_queue_enabled, &event_tx, DeviceEventKind::Start, session);
            }
            ClientControl::Stop => {
                info!(device = name, session, "received stop control");
                let _ = response_tx.send(ClientResponse::Ack(ClientControl::Stop));
                if direction == DeviceDirection::Source {
                    // The only other access can come from the reading buffer
                    // task, so the reset has to enter from the writer side.
                    ring.reset_from_writer();
                }
                put_event(&event_queue_enabled, &event_tx, DeviceEventKind::Stop, session);
            }
            ClientControl::Drain | ClientControl::Pause | ClientControl::Resume => {
                let _ = response_tx.send(ClientResponse::Ack(control));
            }
            ClientControl::SetParameters => {
                // A new parameter choice starts a new session; later event
                // consumers drop anything tagged with the old session.
                let new_session = session_id
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                        Some(if s == i32::MAX { 0 } else { s + 1 })
                    })
                    .unwrap_or(0);
                info!(device = name, session = new_session + 1, "new session started");
                let _ = response_tx.send(ClientResponse::Ack(ClientControl::SetParameters));
            }
            ClientControl::Shutdown => break,
        }
    }
    info!(device = name, "client IPC thread exiting");
}

fn put_event(
    enabled: &AtomicBool,
    event_tx: &Sender<DeviceEvent>,
    kind: DeviceEventKind,
    session_id: i32,
) {
    if !enabled.load(Ordering::Acquire) {
        warn!(?kind, "event queue disabled, dropping device event");
        return;
    }
    let _ = event_tx.send(DeviceEvent { kind, session_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::SampleFormat;

    fn client_fixture(direction: DeviceDirection) -> ClientDevice {
        let ring = RingBuffer::new("client", 2, SampleFormat::Float32, 256).unwrap();
        ClientDevice::new("app0", direction, ring)
    }

    #[test]
    fn test_start_stop_events() {
        let client = client_fixture(DeviceDirection::Sink);
        client.enable_event_queue(true);
        let handle = client.control_handle();

        handle.send(ClientControl::Start).unwrap();
        let response = handle.recv_response(Duration::from_secs(2)).unwrap();
        assert_eq!(response, ClientResponse::Ack(ClientControl::Start));

        // Poll until the worker delivered the event
        let mut event = None;
        for _ in 0..100 {
            if let Ok(e) = client.next_event() {
                event = Some(e);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let event = event.expect("start event");
        assert_eq!(event.kind, DeviceEventKind::Start);
        assert_eq!(event.session_id, 0);
    }

    #[test]
    fn test_events_dropped_when_queue_disabled() {
        let client = client_fixture(DeviceDirection::Sink);
        let handle = client.control_handle();
        handle.send(ClientControl::Start).unwrap();
        handle.recv_response(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            client.next_event(),
            Err(CoreError::NoEventAvailable)
        ));
    }

    #[test]
    fn test_set_parameters_bumps_session_and_discards_stale_events() {
        let client = client_fixture(DeviceDirection::Sink);
        client.enable_event_queue(true);
        let handle = client.control_handle();

        handle.send(ClientControl::Start).unwrap();
        handle.recv_response(Duration::from_secs(2)).unwrap();
        handle.send(ClientControl::SetParameters).unwrap();
        handle.recv_response(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(client.session_id(), 1);

        // The start event carries session 0 and must be discarded now
        assert!(matches!(
            client.next_event(),
            Err(CoreError::NoEventAvailable)
        ));
    }

    #[test]
    fn test_get_latency_reports_fill_level() {
        let client = client_fixture(DeviceDirection::Source);
        let ring = client.ring_buffer();
        let samples = vec![0.0f32; 32];
        let mut access = ring.begin_access(AccessDirection::Write, 16).unwrap();
        access.write_from_f32(0, 2, 16, &samples).unwrap();
        access.commit(16).unwrap();

        let handle = client.control_handle();
        handle.send(ClientControl::GetLatency).unwrap();
        let response = handle.recv_response(Duration::from_secs(2)).unwrap();
        assert_eq!(response, ClientResponse::Latency(16));
    }

    #[test]
    fn test_stop_resets_source_ring() {
        let client = client_fixture(DeviceDirection::Source);
        let ring = client.ring_buffer();
        let samples = vec![1.0f32; 32];
        let mut access = ring.begin_access(AccessDirection::Write, 16).unwrap();
        access.write_from_f32(0, 2, 16, &samples).unwrap();
        access.commit(16).unwrap();
        assert_eq!(ring.update_available(AccessDirection::Read), 16);

        let handle = client.control_handle();
        handle.send(ClientControl::Stop).unwrap();
        handle.recv_response(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ring.update_available(AccessDirection::Read), 0);
    }

    #[test]
    fn test_clean_shutdown() {
        let client = client_fixture(DeviceDirection::Sink);
        drop(client);
    }
}
