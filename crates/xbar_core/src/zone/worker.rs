//! Zone Worker Thread
//!
//! The real-time loop of one base zone. Per base period: wait for sink
//! space (bounded), tick every derived zone whose ratio boundary falls on
//! this period, then process the base zone itself. Suspension happens only
//! on the sink availability wait and on the period-pacing sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{ConfigFile, SchedPriorityAdjust};
use crate::error::{CoreError, CoreResult};
use crate::event::{Event, EventProvider, SetupEvent};
use crate::ring_buffer::AccessDirection;
use crate::switch_matrix::SwitchMatrix;
use crate::thread_names::{ThreadKind, ThreadNames};

use super::RoutingZone;

/// Consecutive sink-wait timeouts tolerated before the zone gives up
const TIMEOUT_BUDGET: u32 = 8;

/// One derived zone driven from a base loop
pub struct DerivedSchedule {
    pub zone: Arc<Mutex<RoutingZone>>,
    /// `derived.period == ratio * base.period`
    pub ratio: u32,
}

/// Handle of a running base-zone worker
pub struct ZoneWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ZoneWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        base: Arc<Mutex<RoutingZone>>,
        derived: Vec<DerivedSchedule>,
        matrix: Arc<SwitchMatrix>,
        config: Arc<ConfigFile>,
        thread_names: Arc<ThreadNames>,
        events: Arc<EventProvider>,
    ) -> CoreResult<Self> {
        let (zone_name, period_size, sample_rate) = {
            let zone = base.lock().unwrap_or_else(|e| e.into_inner());
            (
                zone.name().to_string(),
                zone.period_size(),
                zone.sample_rate(),
            )
        };
        if period_size == 0 || sample_rate == 0 {
            return Err(CoreError::NotInitialized);
        }
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name(format!("xbar-zone-{zone_name}"))
            .spawn(move || {
                worker_loop(
                    base,
                    derived,
                    matrix,
                    config,
                    thread_names,
                    events,
                    worker_running,
                    zone_name,
                    period_size,
                    sample_rate,
                );
            })
            .map_err(|e| CoreError::InitFailed(e.to_string()))?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Signal the loop to exit at the next period boundary and join it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ZoneWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    base: Arc<Mutex<RoutingZone>>,
    derived: Vec<DerivedSchedule>,
    matrix: Arc<SwitchMatrix>,
    config: Arc<ConfigFile>,
    thread_names: Arc<ThreadNames>,
    events: Arc<EventProvider>,
    running: Arc<AtomicBool>,
    zone_name: String,
    period_size: u32,
    sample_rate: u32,
) {
    thread_names.set_thread_name(ThreadKind::RealTime, &format!("zone worker {zone_name}"));
    if let Err(err) = config.configure_thread_scheduling(SchedPriorityAdjust::Same) {
        warn!(zone = %zone_name, %err, "running without real-time scheduling");
    }

    let period_duration =
        Duration::from_micros(period_size as u64 * 1_000_000 / sample_rate as u64);
    let wait_timeout = period_duration * 2;
    info!(zone = %zone_name, ?period_duration, "zone worker running");

    let sink_ring = {
        let zone = base.lock().unwrap_or_else(|e| e.into_inner());
        zone.sink_ring()
    };
    let Some(sink_ring) = sink_ring else {
        error!(zone = %zone_name, "zone worker without sink ring");
        return;
    };

    let start = Instant::now();
    let mut base_periods = 0u64;

    while running.load(Ordering::Acquire) {
        // Pace to the period grid; the sink wait below bounds any drift.
        let deadline = start + period_duration * base_periods as u32;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }

        match sink_ring.wait_available(AccessDirection::Write, period_size, wait_timeout) {
            Ok(_) => {
                let mut zone = base.lock().unwrap_or_else(|e| e.into_inner());
                zone.clear_timeout_strikes();
            }
            Err(_) => {
                let exhausted = {
                    let mut zone = base.lock().unwrap_or_else(|e| e.into_inner());
                    zone.timeout_strike(TIMEOUT_BUDGET)
                };
                if exhausted {
                    events.send(Event::Setup(SetupEvent::ZoneError {
                        name: zone_name.clone(),
                        message: "sink wait budget exhausted, zone stops contributing"
                            .to_string(),
                    }));
                    break;
                }
                base_periods += 1;
                continue;
            }
        }

        // Derived zones tick every ratio-th base period, before the base
        // zone writes its sink.
        for schedule in &derived {
            if schedule.ratio != 0 && base_periods % schedule.ratio as u64 == 0 {
                let mut zone = schedule.zone.lock().unwrap_or_else(|e| e.into_inner());
                if zone.is_started() {
                    if let Err(err) = zone.process_period(&matrix) {
                        warn!(zone = %zone.name(), %err, "derived zone period failed");
                    }
                }
            }
        }

        {
            let mut zone = base.lock().unwrap_or_else(|e| e.into_inner());
            match zone.process_period(&matrix) {
                Ok(_) => {}
                Err(CoreError::NotRunning) => break,
                Err(err) => {
                    error!(zone = %zone_name, %err, "zone period failed");
                }
            }
        }
        base_periods += 1;
    }
    info!(zone = %zone_name, periods = base_periods, "zone worker exiting");
}
