//! Hardware Device Handler
//!
//! Bridges a device ring buffer to a kernel-level PCM endpoint. The endpoint
//! lives on a dedicated device thread (platform streams are not `Send`);
//! start/stop commands travel over a channel.
//!
//! In `received-async` clock mode the handler owns an ASRC and a mover loop
//! on its device thread, so external clock drift is absorbed here and never
//! reaches the zone timing. Per-period timing tuples are handed to an
//! attached diagnostic stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{error, info, warn};

use xbar_platform::{CpalEndpoint, EndpointConfig, PcmEndpoint};

use crate::asrc::Asrc;
use crate::client::DeviceDirection;
use crate::diagnostic::DiagnosticStream;
use crate::error::{CoreError, CoreResult};
use crate::model::{ClockType, DeviceParams};
use crate::ring_buffer::{AccessDirection, RingBuffer};

enum HwCmd {
    Start,
    Stop,
    Shutdown,
}

/// Handle to one opened hardware device
pub struct HwDeviceHandler {
    name: String,
    cmd_tx: Sender<HwCmd>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    diagnostic: Arc<Mutex<Option<Arc<DiagnosticStream>>>>,
}

impl HwDeviceHandler {
    pub fn new(
        params: &DeviceParams,
        direction: DeviceDirection,
        ring: Arc<RingBuffer>,
    ) -> CoreResult<Self> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (init_tx, init_rx) = bounded::<Result<(), String>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let underruns = Arc::new(AtomicU64::new(0));
        let diagnostic: Arc<Mutex<Option<Arc<DiagnosticStream>>>> = Arc::new(Mutex::new(None));

        let worker = {
            let params = params.clone();
            let running = Arc::clone(&running);
            let underruns = Arc::clone(&underruns);
            let diagnostic = Arc::clone(&diagnostic);
            std::thread::Builder::new()
                .name(format!("xbar-hw-{}", params.name))
                .spawn(move || {
                    device_thread(
                        params, direction, ring, running, underruns, diagnostic, cmd_rx, init_tx,
                    );
                })
                .map_err(|e| CoreError::InitFailed(e.to_string()))?
        };

        match init_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => Ok(Self {
                name: params.name.clone(),
                cmd_tx,
                worker: Some(worker),
                running,
                underruns,
                diagnostic,
            }),
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(CoreError::InitFailed(message))
            }
            Err(_) => Err(CoreError::InitFailed(
                "hardware device thread did not come up".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) -> CoreResult<()> {
        self.cmd_tx
            .send(HwCmd::Start)
            .map_err(|_| CoreError::NotRunning)
    }

    pub fn stop(&mut self) -> CoreResult<()> {
        self.cmd_tx
            .send(HwCmd::Stop)
            .map_err(|_| CoreError::NotRunning)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Attach the diagnostic stream fed by the async mover loop
    pub fn attach_diagnostic(&self, stream: Arc<DiagnosticStream>) {
        *self
            .diagnostic
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(stream);
    }
}

impl Drop for HwDeviceHandler {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        let _ = self.cmd_tx.send(HwCmd::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn device_thread(
    params: DeviceParams,
    direction: DeviceDirection,
    ring: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    diagnostic: Arc<Mutex<Option<Arc<DiagnosticStream>>>>,
    cmd_rx: Receiver<HwCmd>,
    init_tx: Sender<Result<(), String>>,
) {
    // Device names carry the "hw:" routing prefix; "hw:default" selects the
    // platform default device.
    let target = params.name.strip_prefix("hw:").unwrap_or(&params.name);
    let endpoint_config = EndpointConfig {
        device_name: if target == "default" {
            None
        } else {
            Some(target.to_string())
        },
        channels: params.num_channels as u16,
        sample_rate: params.sample_rate,
        period_size: params.period_size,
    };

    let asrc = if params.clock_type == ClockType::ReceivedAsync {
        let capacity = params.num_periods_asrc_buffer.unwrap_or(0) * params.period_size;
        match Asrc::new(
            params.num_channels,
            params.sample_rate,
            params.sample_rate,
            capacity,
        ) {
            Ok(asrc) => Some(Arc::new(Mutex::new(asrc))),
            Err(err) => {
                let _ = init_tx.send(Err(err.to_string()));
                return;
            }
        }
    } else {
        None
    };

    let endpoint = match direction {
        DeviceDirection::Sink => {
            // The crossbar writes the ring; the device plays it back.
            let ring = Arc::clone(&ring);
            let underruns = Arc::clone(&underruns);
            let asrc = asrc.clone();
            CpalEndpoint::open_playback(
                &endpoint_config,
                Box::new(move |data: &mut [f32]| {
                    playback_callback(&ring, &underruns, asrc.as_deref(), data);
                }),
            )
        }
        DeviceDirection::Source => {
            let ring = Arc::clone(&ring);
            let asrc = asrc.clone();
            CpalEndpoint::open_capture(
                &endpoint_config,
                Box::new(move |data: &[f32]| {
                    capture_callback(&ring, asrc.as_deref(), data);
                }),
            )
        }
    };

    let mut endpoint = match endpoint {
        Ok(endpoint) => {
            let _ = init_tx.send(Ok(()));
            endpoint
        }
        Err(err) => {
            error!(device = %params.name, %err, "failed to open hardware endpoint");
            let _ = init_tx.send(Err(err.to_string()));
            return;
        }
    };

    info!(device = %params.name, "hardware device thread started");
    let period_duration = Duration::from_micros(
        params.period_size as u64 * 1_000_000 / params.sample_rate as u64,
    );
    let mut started = false;
    let epoch = Instant::now();

    while running.load(Ordering::Acquire) {
        match cmd_rx.recv_timeout(period_duration) {
            Ok(HwCmd::Start) => {
                if let Err(err) = endpoint.start() {
                    error!(device = %params.name, %err, "failed to start endpoint");
                } else {
                    started = true;
                }
            }
            Ok(HwCmd::Stop) => {
                if let Err(err) = endpoint.stop() {
                    warn!(device = %params.name, %err, "failed to stop endpoint");
                }
                started = false;
            }
            Ok(HwCmd::Shutdown) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Async clock mode: the mover loop runs at period cadence.
                if started {
                    if let Some(asrc) = &asrc {
                        run_mover(&params, direction, &ring, asrc, &diagnostic, &epoch);
                    }
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = endpoint.stop();
    info!(device = %params.name, "hardware device thread exiting");
}

/// Move one period between the ring buffer and the ASRC and feed the
/// diagnostic stream.
fn run_mover(
    params: &DeviceParams,
    direction: DeviceDirection,
    ring: &RingBuffer,
    asrc: &Mutex<Asrc>,
    diagnostic: &Mutex<Option<Arc<DiagnosticStream>>>,
    epoch: &Instant,
) {
    let channels = ring.channels();
    let mut asrc = asrc.lock().unwrap_or_else(|e| e.into_inner());
    match direction {
        DeviceDirection::Sink => {
            // ring -> asrc; the playback callback drains the asrc
            let free = asrc.free_frames().min(params.period_size);
            if free > 0 {
                if let Ok(access) = ring.begin_access(AccessDirection::Read, free) {
                    let frames = access.frames();
                    if frames > 0 {
                        let mut buffer = vec![0.0f32; (frames * channels) as usize];
                        if access.read_into_f32(0, channels, frames, &mut buffer).is_ok() {
                            let accepted = asrc.push(&buffer);
                            let _ = access.commit(accepted);
                        }
                    }
                }
            }
        }
        DeviceDirection::Source => {
            // asrc -> ring; the capture callback fills the asrc
            if let Ok(mut access) = ring.begin_access(AccessDirection::Write, params.period_size) {
                let frames = access.frames();
                if frames > 0 {
                    let mut buffer = vec![0.0f32; (frames * channels) as usize];
                    let produced = asrc.pull(&mut buffer);
                    if produced > 0
                        && access.write_from_f32(0, channels, produced, &buffer).is_ok()
                    {
                        let _ = access.commit(produced);
                    }
                }
            }
        }
    }
    if let Some(stream) = diagnostic.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
        let now_us = epoch.elapsed().as_micros() as u64;
        stream.write_entry(
            now_us,
            ring.total_frames(AccessDirection::Write),
            now_us,
            asrc.total_frames_out(),
            asrc.fill_level(),
            ring.update_available(AccessDirection::Read) + asrc.fill_level(),
            asrc.adaptive_ratio(),
        );
    }
}

fn playback_callback(
    ring: &RingBuffer,
    underruns: &AtomicU64,
    asrc: Option<&Mutex<Asrc>>,
    data: &mut [f32],
) {
    let channels = ring.channels();
    let requested = data.len() as u32 / channels;
    match asrc {
        Some(asrc) => {
            let mut asrc = asrc.lock().unwrap_or_else(|e| e.into_inner());
            let produced = asrc.pull(data);
            if produced < requested {
                data[(produced * channels) as usize..].fill(0.0);
                underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
        None => {
            let mut filled = 0u32;
            while filled < requested {
                let Ok(access) = ring.begin_access(AccessDirection::Read, requested - filled)
                else {
                    break;
                };
                let frames = access.frames();
                if frames == 0 {
                    break;
                }
                let offset = (filled * channels) as usize;
                if access
                    .read_into_f32(
                        0,
                        channels,
                        frames,
                        &mut data[offset..offset + (frames * channels) as usize],
                    )
                    .is_err()
                {
                    break;
                }
                if access.commit(frames).is_err() {
                    break;
                }
                filled += frames;
            }
            if filled < requested {
                data[(filled * channels) as usize..].fill(0.0);
                underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn capture_callback(ring: &RingBuffer, asrc: Option<&Mutex<Asrc>>, data: &[f32]) {
    let channels = ring.channels();
    match asrc {
        Some(asrc) => {
            let mut asrc = asrc.lock().unwrap_or_else(|e| e.into_inner());
            asrc.push(data);
        }
        None => {
            let frames = data.len() as u32 / channels;
            let mut written = 0u32;
            while written < frames {
                let Ok(mut access) = ring.begin_access(AccessDirection::Write, frames - written)
                else {
                    break;
                };
                let granted = access.frames();
                if granted == 0 {
                    break;
                }
                let offset = (written * channels) as usize;
                if access
                    .write_from_f32(
                        0,
                        channels,
                        granted,
                        &data[offset..offset + (granted * channels) as usize],
                    )
                    .is_err()
                {
                    break;
                }
                if access.commit(granted).is_err() {
                    break;
                }
                written += granted;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::SampleFormat;

    #[test]
    fn test_missing_hardware_fails_init() {
        let params = DeviceParams {
            name: "hw:does-not-exist".to_string(),
            num_channels: 2,
            sample_rate: 48_000,
            data_format: SampleFormat::Float32,
            period_size: 64,
            num_periods: 4,
            clock_type: ClockType::Provided,
            num_periods_asrc_buffer: None,
        };
        let ring = RingBuffer::new("hw", 2, SampleFormat::Float32, 256).unwrap();
        let result = HwDeviceHandler::new(&params, DeviceDirection::Sink, ring);
        assert!(matches!(result, Err(CoreError::InitFailed(_))));
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_default_playback_device() {
        let params = DeviceParams {
            name: "hw:default".to_string(),
            num_channels: 2,
            sample_rate: 48_000,
            data_format: SampleFormat::Float32,
            period_size: 512,
            num_periods: 4,
            clock_type: ClockType::Provided,
            num_periods_asrc_buffer: None,
        };
        let ring = RingBuffer::new("hw", 2, SampleFormat::Float32, 2048).unwrap();
        let mut handler =
            HwDeviceHandler::new(&params, DeviceDirection::Sink, ring).unwrap();
        handler.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        handler.stop().unwrap();
    }
}
