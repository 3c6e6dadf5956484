//! Modbus transport seam
//!
//! The poller only sees `Connector` and `RegisterSession`. Production code
//! uses `TcpConnector` (tokio-modbus over TCP); tests plug in scripted
//! devices.

use crate::config::DeviceSpec;
use crate::error::{ConnectionError, ProtocolError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::debug;

/// An open protocol session with one device.
///
/// Requests on a session are strictly sequential.
#[async_trait]
pub trait RegisterSession: Send {
    /// Reads `count` holding registers (function code 0x03).
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError>;

    /// Releases the session. Errors while closing are only logged.
    async fn close(&mut self);
}

/// Opens sessions to configured devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn RegisterSession>, ConnectionError>;
}

/// Modbus TCP connector.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn RegisterSession>, ConnectionError> {
        let limit = device.timeout();
        let addr = resolve(device, limit).await?;
        let slave = Slave(device.unit_id);
        let ctx = open(addr, slave, limit).await?;

        debug!("Connected to device {} at {}", device.device_id, addr);
        Ok(Box::new(TcpSession {
            addr,
            slave,
            ctx: Some(ctx),
            read_timeout: limit,
        }))
    }
}

async fn resolve(device: &DeviceSpec, limit: Duration) -> Result<SocketAddr, ConnectionError> {
    let resolve_err = |reason: String| ConnectionError::Resolve {
        host: device.host.clone(),
        port: device.port,
        reason,
    };

    let mut addrs = timeout(limit, tokio::net::lookup_host((device.host.as_str(), device.port)))
        .await
        .map_err(|_| resolve_err("lookup timed out".to_string()))?
        .map_err(|e| resolve_err(e.to_string()))?;

    addrs.next().ok_or_else(|| resolve_err("no address found".to_string()))
}

async fn open(addr: SocketAddr, slave: Slave, limit: Duration) -> Result<Context, ConnectionError> {
    match timeout(limit, tcp::connect_slave(addr, slave)).await {
        Ok(Ok(ctx)) => Ok(ctx),
        Ok(Err(source)) => Err(ConnectionError::Io { addr: addr.to_string(), source }),
        Err(_) => Err(ConnectionError::Timeout { addr: addr.to_string(), timeout: limit }),
    }
}

/// A Modbus TCP session that survives a lost response.
///
/// After a timeout or a transport error the connection may still deliver
/// the late frame, which would answer the next request. The connection is
/// dropped instead and reopened before the next read.
struct TcpSession {
    addr: SocketAddr,
    slave: Slave,
    ctx: Option<Context>,
    read_timeout: Duration,
}

impl TcpSession {
    fn discard(&mut self, reason: &str) {
        if self.ctx.take().is_some() {
            debug!("Dropping connection to {} after {}", self.addr, reason);
        }
    }
}

#[async_trait]
impl RegisterSession for TcpSession {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ProtocolError> {
        if self.ctx.is_none() {
            let ctx = open(self.addr, self.slave, self.read_timeout)
                .await
                .map_err(|e| ProtocolError::Transport(format!("reconnect failed: {}", e)))?;
            debug!("Reconnected to {}", self.addr);
            self.ctx = Some(ctx);
        }
        let Some(ctx) = self.ctx.as_mut() else {
            return Err(ProtocolError::Transport("no connection".to_string()));
        };

        let outcome = timeout(self.read_timeout, ctx.read_holding_registers(address, count)).await;
        match outcome {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(ProtocolError::Exception(format!("{:?}", exception))),
            Ok(Err(e)) => {
                self.discard("a transport error");
                Err(ProtocolError::Transport(e.to_string()))
            }
            Err(_) => {
                self.discard("a read timeout");
                Err(ProtocolError::Timeout(self.read_timeout))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!("Error while closing Modbus session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal Modbus TCP slave where holding register n holds n.
    /// The first request it ever sees is answered after `first_delay`.
    async fn serve_registers(first_delay: Duration) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let delayed = Arc::new(AtomicBool::new(false));

        let accepted = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(answer(stream, delayed.clone(), first_delay));
            }
        });
        (port, connections)
    }

    async fn answer(mut stream: TcpStream, delayed: Arc<AtomicBool>, first_delay: Duration) {
        let mut header = [0u8; 7];
        while stream.read_exact(&mut header).await.is_ok() {
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; len.saturating_sub(1)];
            if pdu.len() < 5 || stream.read_exact(&mut pdu).await.is_err() {
                return;
            }
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let count = u16::from_be_bytes([pdu[3], pdu[4]]);

            if !delayed.swap(true, Ordering::SeqCst) {
                tokio::time::sleep(first_delay).await;
            }

            let mut frame = Vec::with_capacity(9 + 2 * count as usize);
            frame.extend_from_slice(&header[..4]);
            frame.extend_from_slice(&(3 + 2 * count).to_be_bytes());
            frame.push(header[6]);
            frame.push(0x03);
            frame.push((2 * count) as u8);
            for offset in 0..count {
                frame.extend_from_slice(&address.wrapping_add(offset).to_be_bytes());
            }
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_late_answer_does_not_shift_later_reads() {
        let (port, connections) = serve_registers(Duration::from_millis(1500)).await;
        let mut spec = device("127.0.0.1", port);
        spec.timeout = 1;

        let mut session = TcpConnector::new().connect(&spec).await.unwrap();

        assert!(matches!(
            session.read_holding_registers(10, 1).await,
            Err(ProtocolError::Timeout(_))
        ));
        assert_eq!(session.read_holding_registers(11, 1).await.unwrap(), vec![11]);
        assert_eq!(session.read_holding_registers(12, 2).await.unwrap(), vec![12, 13]);
        assert_eq!(session.read_holding_registers(14, 1).await.unwrap(), vec![14]);
        session.close().await;

        // one reconnect after the timeout, none after healthy reads
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_healthy_session_keeps_one_connection() {
        let (port, connections) = serve_registers(Duration::ZERO).await;
        let mut session = TcpConnector::new().connect(&device("127.0.0.1", port)).await.unwrap();

        for address in [100, 101, 102] {
            assert_eq!(session.read_holding_registers(address, 1).await.unwrap(), vec![address]);
        }
        session.close().await;
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    fn device(host: &str, port: u16) -> DeviceSpec {
        DeviceSpec {
            device_id: 9,
            host: host.into(),
            port,
            unit_id: 1,
            timeout: 2,
            registers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_reported() {
        // bind then drop to get a local port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::new().connect(&device("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ConnectionError::Io { .. })));
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let result = TcpConnector::new().connect(&device("poller-test.invalid", 502)).await;
        assert!(matches!(result, Err(ConnectionError::Resolve { .. })));
    }
}
