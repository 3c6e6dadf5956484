//! Error taxonomy for the polling engine
//!
//! Every kind below is recovered locally:
//! - `ConfigError`: the fleet is treated as empty, the caller decides to exit
//! - `ConnectionError`: the device is skipped for this cycle
//! - `ProtocolError`: the single register is skipped
//! - `DecodeError`: the value falls back to 0.0
//! - `ForwardingError`: the single reading is skipped
//!
//! Only the binary turns an aggregate outcome into a process exit code.

use std::time::Duration;

/// Configuration source missing, malformed, or semantically invalid.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no devices configured")]
    NoDevices,
}

/// Session establishment to a device failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("cannot resolve {host}:{port}: {reason}")]
    Resolve { host: String, port: u16, reason: String },
    #[error("connection to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
}

/// A single register read failed at the protocol level.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("device answered with exception: {0}")]
    Exception(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("expected {expected} words, device returned {got}")]
    ShortResponse { expected: usize, got: usize },
}

/// Raw words could not be interpreted under the declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("{data_type} needs {expected} words, got {got}")]
    WordCount {
        data_type: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("decoded value is not finite")]
    NonFinite,
    #[error("unknown data type '{0}'")]
    UnknownDataType(String),
}

/// Delivery of one reading to the collection endpoint failed.
#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ForwardingError {
    fn from(e: reqwest::Error) -> Self {
        ForwardingError::Transport(e.to_string())
    }
}
