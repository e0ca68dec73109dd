//! Routing API
//!
//! Connect and disconnect source ports to sink-side zone input ports.
//! Requests enqueue commands towards the owning zone's buffer task and
//! return once enqueued; the topology change becomes audible at the next
//! period boundary.

use tracing::info;

use crate::asrc::MIN_ASRC_PERIODS;
use crate::client::DeviceDirection;
use crate::error::{CoreError, CoreResult};
use crate::event::{ConnectionEvent, Event};
use crate::model::PortDirection;
use crate::probe::{ProbeMode, ProbeParams};
use crate::setup::{ConnectionEntry, Setup};
use crate::switch_matrix::{JobParams, SwitchMatrixJob};

/// Borrowing view over the setup registry exposing the routing surface
pub struct Routing<'a> {
    setup: &'a mut Setup,
}

impl<'a> Routing<'a> {
    pub(crate) fn new(setup: &'a mut Setup) -> Self {
        Self { setup }
    }

    /// Connect a source output port to a sink input port (either the zone
    /// input port itself or the sink device port linked to one).
    pub fn connect(&mut self, source_id: i32, sink_id: i32) -> CoreResult<()> {
        let (source_device_name, source_index, source_channels) = {
            let port = self.setup.port(source_id)?;
            if port.direction() != PortDirection::Output {
                return Err(CoreError::InvalidParam(format!(
                    "port {source_id} is not a source output port"
                )));
            }
            let owner = port.owner().ok_or_else(|| {
                CoreError::InvalidParam(format!("port {source_id} is not attached to a device"))
            })?;
            let (index, channels) = port.channel_range();
            (owner.to_string(), index, channels)
        };
        let source_device = self.setup.device(&source_device_name)?;
        let (source_ring, source_rate, source_period, asrc_periods) = {
            let device = source_device.lock().unwrap_or_else(|e| e.into_inner());
            if device.direction() != DeviceDirection::Source {
                return Err(CoreError::InvalidParam(format!(
                    "device '{source_device_name}' is not a source"
                )));
            }
            (
                device.ring_buffer(),
                device.params().sample_rate,
                device.params().period_size,
                device
                    .params()
                    .num_periods_asrc_buffer
                    .unwrap_or(MIN_ASRC_PERIODS),
            )
        };

        // Resolve the sink id to a zone input port
        let mut resolved = None;
        for (zone_id, zone) in self.setup.zones_iter() {
            let zone = zone.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(link) = zone.find_port_link(sink_id) {
                resolved = Some((
                    zone_id,
                    link.zone_port_id,
                    link.ring.clone(),
                    link.channels,
                    zone.period_size(),
                    zone.sample_rate(),
                ));
                break;
            }
        }
        let Some((zone_id, zone_port_id, sink_ring, sink_channels, sink_period, sink_rate)) =
            resolved
        else {
            return Err(CoreError::InvalidParam(format!(
                "sink port {sink_id} is not linked into any routing zone"
            )));
        };

        for connection in &self.setup.connections {
            if connection.zone_port_id == zone_port_id {
                if connection.source_id == source_id {
                    return Err(CoreError::SourceAlreadyConnected);
                }
                return Err(CoreError::SinkAlreadyConnected);
            }
        }

        let job = SwitchMatrixJob::new(
            JobParams {
                source_port_id: source_id,
                sink_port_id: zone_port_id,
                source_index,
                source_channels,
                sink_index: 0,
                sink_channels,
                source_rate,
                sink_rate,
                sink_period,
                asrc_capacity: asrc_periods.max(MIN_ASRC_PERIODS) * sink_period,
            },
            sink_ring,
        )?;
        self.setup
            .matrix()
            .connect_job(zone_id, source_ring, source_period, job)?;
        self.setup.connections.push(ConnectionEntry {
            source_id,
            sink_id,
            zone_port_id,
            zone_id,
        });
        self.setup
            .events()
            .send(Event::Connection(ConnectionEvent::Connected {
                source_id,
                sink_id,
            }));
        info!(source = source_id, sink = sink_id, "connected");
        Ok(())
    }

    /// Disconnect a source from a sink; observed at the next period boundary
    pub fn disconnect(&mut self, source_id: i32, sink_id: i32) -> CoreResult<()> {
        let position = self.setup.connections.iter().position(|c| {
            c.source_id == source_id && (c.sink_id == sink_id || c.zone_port_id == sink_id)
        });
        let Some(position) = position else {
            return Err(CoreError::NothingRemoved);
        };
        let connection = self.setup.connections.remove(position);
        self.setup
            .matrix()
            .disconnect_job(source_id, connection.zone_port_id)?;
        self.setup
            .events()
            .send(Event::Connection(ConnectionEvent::Disconnected {
                source_id,
                sink_id,
            }));
        info!(source = source_id, sink = sink_id, "disconnected");
        Ok(())
    }

    /// All live connections as (source, sink) pairs
    pub fn active_connections(&self) -> Vec<(i32, i32)> {
        self.setup
            .connections
            .iter()
            .map(|c| (c.source_id, c.sink_id))
            .collect()
    }

    /// Start a probe (record or inject) on one connection
    pub fn start_probe(
        &mut self,
        source_id: i32,
        sink_id: i32,
        params: ProbeParams,
        mode: ProbeMode,
    ) -> CoreResult<()> {
        let zone_port_id = self.resolve_zone_port(source_id, sink_id)?;
        self.setup
            .matrix()
            .with_job(source_id, zone_port_id, |job| job.start_probe(params, mode))
    }

    pub fn stop_probe(&mut self, source_id: i32, sink_id: i32) -> CoreResult<()> {
        let zone_port_id = self.resolve_zone_port(source_id, sink_id)?;
        self.setup.matrix().with_job(source_id, zone_port_id, |job| {
            job.stop_probe();
            Ok(())
        })
    }

    fn resolve_zone_port(&self, source_id: i32, sink_id: i32) -> CoreResult<i32> {
        self.setup
            .connections
            .iter()
            .find(|c| {
                c.source_id == source_id && (c.sink_id == sink_id || c.zone_port_id == sink_id)
            })
            .map(|c| c.zone_port_id)
            .ok_or_else(|| {
                CoreError::InvalidParam(format!(
                    "no connection from {source_id} to {sink_id}"
                ))
            })
    }
}
