//! Polling cycle coordinator: one pass over the whole fleet

use crate::config::DeviceSpec;
use crate::context::PollContext;
use crate::poller::{poll_device, DeviceOutcome, DevicePoll};
use crate::reading::Reading;
use crate::transport::Connector;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

/// Per-device line of a cycle report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device_id: i64,
    pub reachable: bool,
    pub attempted: usize,
    pub succeeded: usize,
}

/// Aggregate outcome of one fleet poll.
#[derive(Debug, Default)]
pub struct CycleResult {
    pub devices_contributing: usize,
    pub total_readings: usize,
    pub readings: Vec<Reading>,
    pub devices: Vec<DeviceReport>,
}

impl CycleResult {
    /// At least one device produced at least one reading.
    pub fn is_success(&self) -> bool {
        self.devices_contributing > 0
    }

    fn absorb(&mut self, poll: DevicePoll) {
        let (reachable, attempted, succeeded) = match poll.outcome {
            DeviceOutcome::Polled { attempted, succeeded } => (true, attempted, succeeded),
            DeviceOutcome::Unreachable(_) => (false, 0, 0),
        };

        if poll.readings.is_empty() {
            warn!("No readings obtained from device {}", poll.device_id);
        } else {
            info!("Successfully read {} registers from device {}", poll.readings.len(), poll.device_id);
            self.devices_contributing += 1;
        }

        self.total_readings += poll.readings.len();
        self.readings.extend(poll.readings);
        self.devices.push(DeviceReport {
            device_id: poll.device_id,
            reachable,
            attempted,
            succeeded,
        });
    }
}

/// Polls every device and collects the readings in fleet order.
///
/// Up to `ctx.concurrency` devices are polled at once; each device still
/// reads its registers one at a time on its own session.
pub async fn poll_fleet(connector: &dyn Connector, fleet: &[DeviceSpec], ctx: &PollContext) -> CycleResult {
    info!("Starting Modbus polling cycle over {} devices", fleet.len());

    // collected first so the stream stays `Send` inside `CycleRunner`
    let pending: Vec<_> = fleet
        .iter()
        .map(|device| {
            Box::pin(async move {
                info!("Polling device {} ({})", device.device_id, device.host);
                poll_device(connector, device, ctx).await
            })
        })
        .collect();

    let polls: Vec<DevicePoll> = stream::iter(pending)
        .buffered(ctx.concurrency.max(1))
        .collect()
        .await;

    let mut result = CycleResult::default();
    for poll in polls {
        result.absorb(poll);
    }

    if result.readings.is_empty() {
        warn!("No readings obtained from any device");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterSpec;
    use crate::error::{ConnectionError, ProtocolError};
    use crate::transport::RegisterSession;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct ConstSession;

    #[async_trait]
    impl RegisterSession for ConstSession {
        async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(vec![address; count as usize])
        }

        async fn close(&mut self) {}
    }

    /// Refuses the listed device ids, tracks peak parallel connects.
    struct FleetConnector {
        down: Vec<i64>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for FleetConnector {
        async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn RegisterSession>, ConnectionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.down.contains(&device.device_id) {
                return Err(ConnectionError::Io {
                    addr: device.endpoint(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(Box::new(ConstSession))
        }
    }

    fn connector(down: Vec<i64>) -> FleetConnector {
        FleetConnector { down, active: Arc::default(), peak: Arc::default() }
    }

    fn device(device_id: i64, registers: u16) -> DeviceSpec {
        DeviceSpec {
            device_id,
            host: format!("10.0.0.{device_id}"),
            port: 502,
            unit_id: 1,
            timeout: 10,
            registers: (0..registers)
                .map(|i| RegisterSpec {
                    address: i,
                    parameter: format!("P{i}"),
                    data_type: "uint16".into(),
                    scale: 1.0,
                    unit: String::new(),
                    description: String::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_device_does_not_stop_cycle() {
        let fleet = vec![device(1, 2), device(2, 2), device(3, 3)];
        let result = poll_fleet(&connector(vec![2]), &fleet, &PollContext::default()).await;

        assert!(result.is_success());
        assert_eq!(result.devices_contributing, 2);
        assert_eq!(result.total_readings, 5);
        let ids: Vec<_> = result.readings.iter().map(|r| r.device_id).collect();
        assert_eq!(ids, [1, 1, 3, 3, 3]);
        assert!(!result.devices[1].reachable);
    }

    #[tokio::test]
    async fn test_device_without_registers_does_not_contribute() {
        let fleet = vec![device(1, 0), device(2, 1)];
        let result = poll_fleet(&connector(vec![]), &fleet, &PollContext::default()).await;
        assert_eq!(result.devices_contributing, 1);
        assert!(result.devices[0].reachable);
    }

    #[tokio::test]
    async fn test_whole_fleet_down() {
        let fleet = vec![device(1, 1), device(2, 1)];
        let result = poll_fleet(&connector(vec![1, 2]), &fleet, &PollContext::default()).await;
        assert!(!result.is_success());
        assert!(result.readings.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_by_default() {
        let fleet: Vec<_> = (1..=4).map(|id| device(id, 1)).collect();
        let connector = connector(vec![]);
        poll_fleet(&connector, &fleet, &PollContext::default()).await;
        assert_eq!(connector.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_devices_keep_fleet_order() {
        let fleet: Vec<_> = (1..=4).map(|id| device(id, 2)).collect();
        let connector = connector(vec![]);
        let ctx = PollContext::default().with_concurrency(4);

        let result = poll_fleet(&connector, &fleet, &ctx).await;

        assert!(connector.peak.load(Ordering::SeqCst) > 1);
        let ids: Vec<_> = result.readings.iter().map(|r| r.device_id).collect();
        assert_eq!(ids, [1, 1, 2, 2, 3, 3, 4, 4]);
    }
}
