//! Reading: one decoded measurement, as delivered to the collection endpoint

use crate::config::{DeviceSpec, RegisterSpec};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Serialize, Serializer};

/// Fractional digits kept in `value`.
pub const VALUE_PRECISION: i32 = 3;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Matches the collection endpoint's reading schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: i64,
    pub parameter: String,
    pub value: f64,
    pub unit: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub register_address: u16,
    pub data_type: String,
    pub description: String,
}

impl Reading {
    /// Builds the reading for a successful register read.
    ///
    /// `value` is rounded here, after decoding; `captured_at` is truncated
    /// to whole seconds.
    pub fn new(device: &DeviceSpec, register: &RegisterSpec, value: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device.device_id,
            parameter: register.parameter.clone(),
            value: round_value(value),
            unit: register.unit.clone(),
            timestamp: captured_at.trunc_subsecs(0),
            register_address: register.address,
            data_type: register.data_type.clone(),
            description: register.description.clone(),
        }
    }
}

pub fn round_value(value: f64) -> f64 {
    let factor = 10f64.powi(VALUE_PRECISION);
    let rounded = (value * factor).round() / factor;
    if rounded == 0.0 {
        0.0 // no "-0.0" in payloads
    } else {
        rounded
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
}
