//! Device poller: one session, every register, in declared order

use crate::config::{DeviceSpec, RegisterSpec};
use crate::context::{DiagnosticKind, PollContext};
use crate::decoder::{decode_register, DataType};
use crate::error::{ConnectionError, ProtocolError};
use crate::reading::Reading;
use crate::transport::{Connector, RegisterSession};
use chrono::Utc;
use tracing::{debug, info};

/// How a single device poll ended.
#[derive(Debug)]
pub enum DeviceOutcome {
    /// No session could be opened. Nothing was read.
    Unreachable(ConnectionError),
    /// The session was opened and every register attempted.
    Polled { attempted: usize, succeeded: usize },
}

/// Readings plus outcome for one device.
#[derive(Debug)]
pub struct DevicePoll {
    pub device_id: i64,
    pub readings: Vec<Reading>,
    pub outcome: DeviceOutcome,
}

impl DevicePoll {
    pub fn is_reachable(&self) -> bool {
        matches!(self.outcome, DeviceOutcome::Polled { .. })
    }
}

/// Polls a device through the given connector.
///
/// Never fails: connection problems become `DeviceOutcome::Unreachable`,
/// register problems are skipped with a diagnostic. No retries here; the
/// next cycle is the retry.
pub async fn poll_device(connector: &dyn Connector, device: &DeviceSpec, ctx: &PollContext) -> DevicePoll {
    let mut session = match connector.connect(device).await {
        Ok(session) => session,
        Err(e) => {
            ctx.diagnostics.record(
                device.device_id,
                None,
                DiagnosticKind::Connection,
                format!("Failed to connect to device {} at {}: {}", device.device_id, device.endpoint(), e),
            );
            return DevicePoll {
                device_id: device.device_id,
                readings: Vec::new(),
                outcome: DeviceOutcome::Unreachable(e),
            };
        }
    };

    info!("Connected to device {} at {}", device.device_id, device.endpoint());

    let readings = read_registers(session.as_mut(), device, ctx).await;
    session.close().await;

    let attempted = device.registers.len();
    let succeeded = readings.len();
    DevicePoll {
        device_id: device.device_id,
        readings,
        outcome: DeviceOutcome::Polled { attempted, succeeded },
    }
}

async fn read_registers(session: &mut dyn RegisterSession, device: &DeviceSpec, ctx: &PollContext) -> Vec<Reading> {
    let mut readings = Vec::with_capacity(device.registers.len());

    for register in &device.registers {
        match read_register(session, register).await {
            Ok(words) => {
                let captured_at = Utc::now();
                let value = decode_register(&words, device.device_id, register, &ctx.diagnostics);
                let reading = Reading::new(device, register, value, captured_at);
                debug!("Read {}: {} {}", reading.parameter, reading.value, reading.unit);
                readings.push(reading);
            }
            Err(e) => {
                ctx.diagnostics.record(
                    device.device_id,
                    Some(register.address),
                    DiagnosticKind::Protocol,
                    format!("Error reading register {} ({}): {}", register.address, register.parameter, e),
                );
            }
        }
    }

    readings
}

async fn read_register(session: &mut dyn RegisterSession, register: &RegisterSpec) -> Result<Vec<u16>, ProtocolError> {
    let (data_type, _) = DataType::resolve(&register.data_type);
    let count = data_type.word_count();
    let words = session.read_holding_registers(register.address, count).await?;
    if words.len() < count as usize {
        return Err(ProtocolError::ShortResponse { expected: count as usize, got: words.len() });
    }
    Ok(words)
}
