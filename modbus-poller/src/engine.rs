//! Polling engine: the single-cycle entry point
//!
//! Binds a fleet, a connector and a reading sink together. `run_cycle`
//! polls every device then forwards what was collected; the CLI calls it
//! once, the scheduler calls it on every tick.

use crate::config::DeviceSpec;
use crate::context::PollContext;
use crate::cycle::{poll_fleet, DeviceReport};
use crate::error::ConfigError;
use crate::forwarder::{ForwardReport, Forwarder, ReadingSink};
use crate::scheduler::CycleRunner;
use crate::transport::Connector;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// What one cycle did, end to end.
#[derive(Debug)]
pub struct CycleSummary {
    pub devices_polled: usize,
    pub devices_contributing: usize,
    pub total_readings: usize,
    pub devices: Vec<DeviceReport>,
    /// `None` when there was nothing to forward.
    pub forward: Option<ForwardReport>,
    pub diagnostics: usize,
    pub duration: Duration,
}

impl CycleSummary {
    /// At least one device produced at least one reading.
    pub fn is_success(&self) -> bool {
        self.devices_contributing > 0
    }
}

pub struct PollingEngine {
    fleet: Vec<DeviceSpec>,
    connector: Arc<dyn Connector>,
    forwarder: Forwarder<Arc<dyn ReadingSink>>,
    ctx: PollContext,
}

impl PollingEngine {
    /// Fails with `ConfigError::NoDevices` on an empty fleet.
    pub fn new(
        fleet: Vec<DeviceSpec>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn ReadingSink>,
        ctx: PollContext,
    ) -> Result<Self, ConfigError> {
        if fleet.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        Ok(Self {
            fleet,
            connector,
            forwarder: Forwarder::new(sink),
            ctx,
        })
    }

    pub fn fleet(&self) -> &[DeviceSpec] {
        &self.fleet
    }

    /// Polls the whole fleet, then forwards every reading collected.
    pub async fn run_cycle(&self) -> CycleSummary {
        let start = Instant::now();
        self.ctx.diagnostics.drain();

        let result = poll_fleet(self.connector.as_ref(), &self.fleet, &self.ctx).await;

        let forward = if result.readings.is_empty() {
            None
        } else {
            let report = self.forwarder.forward(&result.readings).await;
            if report.is_success() {
                info!("Polling cycle completed: {} readings sent to API", report.delivered);
            } else {
                error!("Failed to send readings to API ({})", report);
            }
            Some(report)
        };

        let summary = CycleSummary {
            devices_polled: self.fleet.len(),
            devices_contributing: result.devices_contributing,
            total_readings: result.total_readings,
            devices: result.devices,
            forward,
            diagnostics: self.ctx.diagnostics.len(),
            duration: start.elapsed(),
        };

        if summary.diagnostics > 0 {
            warn!("{} recovered failures during this cycle", summary.diagnostics);
        }
        info!(
            "Cycle finished: {}/{} devices contributed {} readings in {:.2?}",
            summary.devices_contributing, summary.devices_polled, summary.total_readings, summary.duration
        );
        summary
    }
}

#[async_trait]
impl CycleRunner for PollingEngine {
    async fn run_cycle(&self) -> bool {
        PollingEngine::run_cycle(self).await.is_success()
    }
}
