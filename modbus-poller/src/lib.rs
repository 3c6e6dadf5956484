//! Modbus Poller - field device polling with HTTP forwarding
//!
//! Periodically polls a fleet of Modbus TCP devices, decodes holding
//! registers into scaled physical values and posts each reading to a
//! collection endpoint:
//! - Fleet configuration from JSON (`config`)
//! - Register decoding for float32 / int16 / uint16 / uint32 (`decoder`)
//! - Per-device polling with per-register failure isolation (`poller`)
//! - Fleet cycles with partial-success bookkeeping (`cycle`)
//! - Best-effort per-reading delivery (`forwarder`)
//! - Immediate + recurring, non-overlapping cycles (`scheduler`)

pub mod config;
pub mod context;
pub mod cycle;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod poller;
pub mod reading;
pub mod scheduler;
pub mod transport;

pub use config::{load_fleet, load_fleet_or_empty, parse_fleet, DeviceSpec, RegisterSpec, ServiceSettings};
pub use context::{Diagnostic, DiagnosticKind, Diagnostics, PollContext};
pub use cycle::{poll_fleet, CycleResult};
pub use decoder::DataType;
pub use engine::{CycleSummary, PollingEngine};
pub use error::{ConfigError, ConnectionError, DecodeError, ForwardingError, ProtocolError};
pub use forwarder::{ForwardReport, Forwarder, HttpSink, ReadingSink};
pub use poller::{poll_device, DeviceOutcome, DevicePoll};
pub use reading::Reading;
pub use scheduler::{CycleRunner, CycleScheduler, SchedulerState, Trigger};
pub use transport::{Connector, RegisterSession, TcpConnector};
