/*!
Fleet fixtures for tests

Builders for devices and registers with the same defaults a JSON fleet
file gets, plus a harness that wires a scripted fleet to a mock collector.
*/

use crate::collector::MockCollector;
use crate::scripted::ScriptedConnector;
use anyhow::Result;
use modbus_poller::{DeviceSpec, HttpSink, PollContext, PollingEngine, RegisterSpec};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Turns on `log` output for a test run. Safe to call repeatedly.
pub fn init_logging() {
    env_logger::try_init().ok();
}

pub fn register(address: u16, parameter: &str, data_type: &str) -> RegisterSpec {
    RegisterSpec {
        address,
        parameter: parameter.to_string(),
        data_type: data_type.to_string(),
        scale: 1.0,
        unit: String::new(),
        description: String::new(),
    }
}

pub fn scaled_register(address: u16, parameter: &str, data_type: &str, scale: f64, unit: &str) -> RegisterSpec {
    RegisterSpec {
        scale,
        unit: unit.to_string(),
        ..register(address, parameter, data_type)
    }
}

pub fn device(device_id: i64, registers: Vec<RegisterSpec>) -> DeviceSpec {
    DeviceSpec {
        device_id,
        host: format!("192.168.1.{}", 100 + device_id),
        port: 502,
        unit_id: 1,
        timeout: 1,
        registers,
    }
}

/// Writes the fleet as a JSON document to a temporary file.
pub fn fleet_file(fleet: &[DeviceSpec]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    serde_json::to_writer_pretty(&mut file, fleet)?;
    file.flush()?;
    Ok(file)
}

/// A scripted fleet feeding a live mock collector.
pub struct TestHarness {
    pub connector: ScriptedConnector,
    pub collector: MockCollector,
}

impl TestHarness {
    pub async fn new(connector: ScriptedConnector) -> Result<Self> {
        init_logging();
        Ok(Self {
            connector,
            collector: MockCollector::start().await?,
        })
    }

    pub async fn rejecting(connector: ScriptedConnector, parameters: &[&str]) -> Result<Self> {
        init_logging();
        Ok(Self {
            connector,
            collector: MockCollector::rejecting(parameters.iter().copied()).await?,
        })
    }

    /// Engine polling `fleet` through the scripted connector and posting over HTTP.
    pub fn engine(&self, fleet: Vec<DeviceSpec>, ctx: PollContext) -> Result<PollingEngine> {
        let sink = HttpSink::new(self.collector.url(), Duration::from_secs(5))?;
        let engine = PollingEngine::new(fleet, Arc::new(self.connector.clone()), Arc::new(sink), ctx)?;
        log::info!("🧪 Engine ready against {}", self.collector.url());
        Ok(engine)
    }

    pub async fn shutdown(self) {
        self.collector.shutdown().await;
    }
}
