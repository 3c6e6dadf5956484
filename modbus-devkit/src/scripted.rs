/*!
Scripted Modbus devices for tests without hardware

A `ScriptedConnector` serves holding registers from in-memory word maps.
Devices can refuse connections, fail chosen addresses, or answer slowly.
Every session opened and closed is counted so tests can check cleanup.
*/

use async_trait::async_trait;
use modbus_poller::decoder::encode_float32;
use modbus_poller::{Connector, ConnectionError, DeviceSpec, ProtocolError, RegisterSession};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Register image of one simulated device.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    words: HashMap<u16, u16>,
    failing: HashSet<u16>,
    latency: Option<Duration>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `words` at consecutive addresses starting at `address`.
    pub fn with_words(mut self, address: u16, words: &[u16]) -> Self {
        for (offset, word) in words.iter().enumerate() {
            self.words.insert(address.wrapping_add(offset as u16), *word);
        }
        self
    }

    /// Stores a float32 as two words, high word first.
    pub fn with_float(self, address: u16, value: f32) -> Self {
        self.with_words(address, &encode_float32(value))
    }

    /// Reads touching `address` answer with an exception.
    pub fn failing(mut self, address: u16) -> Self {
        self.failing.insert(address);
        self
    }

    /// Every read sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        (0..count)
            .map(|offset| {
                let addr = address.wrapping_add(offset);
                if self.failing.contains(&addr) {
                    return Err(ProtocolError::Exception("SlaveDeviceFailure".to_string()));
                }
                self.words
                    .get(&addr)
                    .copied()
                    .ok_or_else(|| ProtocolError::Exception("IllegalDataAddress".to_string()))
            })
            .collect()
    }
}

/// One read request as seen by a scripted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub device_id: i64,
    pub address: u16,
    pub count: u16,
}

#[derive(Default)]
struct Activity {
    opened: usize,
    closed: usize,
    refused: usize,
    reads: Vec<ReadRequest>,
}

/// In-memory `Connector` keyed by device id.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    devices: Arc<Mutex<HashMap<i64, ScriptedDevice>>>,
    activity: Arc<Mutex<Activity>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices not registered here refuse connections.
    pub fn with_device(self, device_id: i64, device: ScriptedDevice) -> Self {
        self.devices.lock().insert(device_id, device);
        self
    }

    /// Takes a device offline; later connects are refused.
    pub fn disconnect(&self, device_id: i64) {
        self.devices.lock().remove(&device_id);
    }

    pub fn sessions_opened(&self) -> usize {
        self.activity.lock().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.activity.lock().closed
    }

    pub fn connections_refused(&self) -> usize {
        self.activity.lock().refused
    }

    pub fn reads_for(&self, device_id: i64) -> Vec<ReadRequest> {
        self.activity
            .lock()
            .reads
            .iter()
            .filter(|r| r.device_id == device_id)
            .copied()
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn RegisterSession>, ConnectionError> {
        let scripted = self.devices.lock().get(&device.device_id).cloned();

        match scripted {
            Some(image) => {
                self.activity.lock().opened += 1;
                log::info!("🔌 [SCRIPTED] Session opened to device {}", device.device_id);
                Ok(Box::new(ScriptedSession {
                    device_id: device.device_id,
                    image,
                    activity: self.activity.clone(),
                    closed: false,
                }))
            }
            None => {
                self.activity.lock().refused += 1;
                log::info!("🚫 [SCRIPTED] Device {} refused connection", device.device_id);
                Err(ConnectionError::Io {
                    addr: device.endpoint(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted device offline"),
                })
            }
        }
    }
}

struct ScriptedSession {
    device_id: i64,
    image: ScriptedDevice,
    activity: Arc<Mutex<Activity>>,
    closed: bool,
}

#[async_trait]
impl RegisterSession for ScriptedSession {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Transport("session already closed".to_string()));
        }
        if let Some(latency) = self.image.latency {
            tokio::time::sleep(latency).await;
        }
        self.activity.lock().reads.push(ReadRequest {
            device_id: self.device_id,
            address,
            count,
        });
        self.image.read(address, count)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.activity.lock().closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{device, register};

    #[tokio::test]
    async fn test_serves_words_and_counts_sessions() {
        let connector = ScriptedConnector::new()
            .with_device(1, ScriptedDevice::new().with_words(40001, &[7, 8]).failing(40010));
        let spec = device(1, vec![register(40001, "A", "uint16")]);

        let mut session = connector.connect(&spec).await.unwrap();
        assert_eq!(session.read_holding_registers(40001, 2).await.unwrap(), vec![7, 8]);
        assert!(matches!(
            session.read_holding_registers(40010, 1).await,
            Err(ProtocolError::Exception(_))
        ));
        assert!(session.read_holding_registers(50000, 1).await.is_err());
        session.close().await;
        session.close().await;

        assert_eq!(connector.sessions_opened(), 1);
        assert_eq!(connector.sessions_closed(), 1);
        assert_eq!(connector.reads_for(1).len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_device_refuses() {
        let connector = ScriptedConnector::new();
        let result = connector.connect(&device(9, Vec::new())).await;
        assert!(matches!(result, Err(ConnectionError::Io { .. })));
        assert_eq!(connector.connections_refused(), 1);
    }

    #[tokio::test]
    async fn test_float_image_is_high_word_first() {
        let connector = ScriptedConnector::new().with_device(1, ScriptedDevice::new().with_float(0, 1.0));
        let mut session = connector.connect(&device(1, Vec::new())).await.unwrap();
        assert_eq!(session.read_holding_registers(0, 2).await.unwrap(), vec![0x3F80, 0x0000]);
    }
}
