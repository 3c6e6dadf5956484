//! Fleet configuration and process settings
//!
//! Handles:
//! - Loading the device fleet from a JSON document
//! - Field defaults (port 502, unit id 1, 10 s timeout, scale 1.0)
//! - All-or-nothing validation: a fleet is never half-parsed
//! - Process settings from the environment (`.env` aware)

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/readings";

/// One measurement point on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub address: u16,
    pub parameter: String,
    /// Declared type label, kept verbatim for the reading payload.
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

/// One polled Modbus TCP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: i64,
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(rename = "slave_id", default = "default_unit_id")]
    pub unit_id: u8,
    /// Seconds, applied to connect and to each read.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub registers: Vec<RegisterSpec>,
}

fn default_data_type() -> String {
    "float32".to_string()
}

fn default_scale() -> f64 {
    1.0
}

fn default_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout() -> u64 {
    10
}

impl DeviceSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses and validates a fleet document.
pub fn parse_fleet(document: &str) -> Result<Vec<DeviceSpec>, ConfigError> {
    let fleet: Vec<DeviceSpec> = serde_json::from_str(document)?;
    validate_fleet(&fleet)?;
    Ok(fleet)
}

/// Loads the fleet from a JSON file.
pub fn load_fleet<P: AsRef<Path>>(path: P) -> Result<Vec<DeviceSpec>, ConfigError> {
    let path = path.as_ref();
    let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let fleet = parse_fleet(&document)?;
    info!("Loaded configuration for {} devices", fleet.len());
    Ok(fleet)
}

/// Loads the fleet, logging any `ConfigError` and falling back to no devices.
pub fn load_fleet_or_empty<P: AsRef<Path>>(path: P) -> Vec<DeviceSpec> {
    match load_fleet(path) {
        Ok(fleet) => fleet,
        Err(e) => {
            error!("Configuration rejected: {}", e);
            Vec::new()
        }
    }
}

fn validate_fleet(fleet: &[DeviceSpec]) -> Result<(), ConfigError> {
    let mut device_ids = HashSet::new();
    for device in fleet {
        if !device_ids.insert(device.device_id) {
            return Err(ConfigError::Invalid(format!(
                "duplicate device_id {}",
                device.device_id
            )));
        }
        if device.host.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "device {} has an empty ip",
                device.device_id
            )));
        }

        let mut parameters = HashSet::new();
        for register in &device.registers {
            if register.parameter.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "device {} register {} has an empty parameter",
                    device.device_id, register.address
                )));
            }
            if !parameters.insert(register.parameter.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "device {} declares parameter '{}' twice",
                    device.device_id, register.parameter
                )));
            }
        }
    }
    Ok(())
}

/// Process-level settings, read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub config_path: String,
    pub api_url: String,
    pub forward_timeout: Duration,
    pub interval_minutes: u32,
    pub concurrency: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            forward_timeout: Duration::from_secs(30),
            interval_minutes: 30,
            concurrency: 1,
        }
    }
}

impl ServiceSettings {
    /// Reads `MODBUS_CONFIG`, `READINGS_API_URL` (or the older
    /// `LARAVEL_API_URL`), `FORWARD_TIMEOUT_SECS`, `POLL_INTERVAL_MINUTES`
    /// and `POLL_CONCURRENCY`, after loading `.env`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok(); // fine when .env is absent
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            config_path: lookup("MODBUS_CONFIG").unwrap_or(defaults.config_path),
            api_url: lookup("READINGS_API_URL")
                .or_else(|| lookup("LARAVEL_API_URL"))
                .unwrap_or(defaults.api_url),
            forward_timeout: parsed("FORWARD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.forward_timeout),
            interval_minutes: parsed("POLL_INTERVAL_MINUTES")
                .filter(|m| (1..=60).contains(m))
                .map(|m| m as u32)
                .unwrap_or(defaults.interval_minutes),
            concurrency: parsed("POLL_CONCURRENCY")
                .filter(|c| *c > 0)
                .map(|c| c as usize)
                .unwrap_or(defaults.concurrency),
        }
    }
}
