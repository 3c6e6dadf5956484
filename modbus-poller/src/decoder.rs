//! Register decoding: raw holding-register words to physical values
//!
//! Decoding is pure. The only side effect of `decode_register` is a
//! diagnostic pushed into the caller's sink when the declared type is
//! unknown or the words cannot be interpreted.

use crate::config::RegisterSpec;
use crate::context::{DiagnosticKind, Diagnostics};
use crate::error::DecodeError;
use std::fmt;
use std::str::FromStr;

/// Wire representation of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float32,
    Int16,
    Uint16,
    Uint32,
}

impl DataType {
    /// Number of 16-bit words requested from the device.
    pub fn word_count(self) -> u16 {
        match self {
            DataType::Float32 => 2,
            DataType::Int16 | DataType::Uint16 | DataType::Uint32 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Uint32 => "uint32",
        }
    }

    /// Resolves a declared label, degrading unknown labels to `Uint16`.
    ///
    /// The second element is false when the fallback was taken.
    pub fn resolve(label: &str) -> (DataType, bool) {
        match label.parse::<DataType>() {
            Ok(data_type) => (data_type, true),
            Err(_) => (DataType::Uint16, false),
        }
    }
}

impl FromStr for DataType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "float" => Ok(DataType::Float32),
            "int16" | "int" => Ok(DataType::Int16),
            "uint16" => Ok(DataType::Uint16),
            "uint32" => Ok(DataType::Uint32),
            _ => Err(DecodeError::UnknownDataType(s.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Interprets raw words under `data_type`, without scaling.
///
/// `float32` assembles `(words[0] << 16) | words[1]` and bit-casts the
/// big-endian bytes. This word order belongs to the device family polled
/// here and must not be swapped.
pub fn decode(words: &[u16], data_type: DataType) -> Result<f64, DecodeError> {
    let needed = data_type.word_count() as usize;
    if words.len() < needed {
        return Err(DecodeError::WordCount {
            data_type: data_type.as_str(),
            expected: needed,
            got: words.len(),
        });
    }

    let value = match data_type {
        DataType::Float32 => {
            let raw = (u32::from(words[0]) << 16) | u32::from(words[1]);
            let value = f32::from_be_bytes(raw.to_be_bytes());
            if !value.is_finite() {
                return Err(DecodeError::NonFinite);
            }
            f64::from(value)
        }
        DataType::Int16 => f64::from(words[0] as i16),
        DataType::Uint16 => f64::from(words[0] & 0xFFFF),
        DataType::Uint32 => f64::from(u32::from(words[0])),
    };
    Ok(value)
}

/// Decodes and applies the multiplicative scale.
pub fn decode_scaled(words: &[u16], data_type: DataType, scale: f64) -> Result<f64, DecodeError> {
    let value = decode(words, data_type)? * scale;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DecodeError::NonFinite)
    }
}

/// Never-failing decode used by the device poller.
///
/// Unknown types are decoded as `uint16`; malformed input yields `0.0`.
/// Both cases leave a diagnostic behind.
pub fn decode_register(
    words: &[u16],
    device_id: i64,
    register: &RegisterSpec,
    diagnostics: &Diagnostics,
) -> f64 {
    let (data_type, recognized) = DataType::resolve(&register.data_type);
    if !recognized {
        diagnostics.record(
            device_id,
            Some(register.address),
            DiagnosticKind::UnknownDataType,
            format!("unknown data type '{}', treating as uint16", register.data_type),
        );
    }

    match decode_scaled(words, data_type, register.scale) {
        Ok(value) => value,
        Err(e) => {
            diagnostics.record(
                device_id,
                Some(register.address),
                DiagnosticKind::Decode,
                format!("cannot decode {}: {}", register.parameter, e),
            );
            0.0
        }
    }
}

/// Inverse of the `float32` decode: the two words a device would send.
pub fn encode_float32(value: f32) -> [u16; 2] {
    let raw = u32::from_be_bytes(value.to_be_bytes());
    [(raw >> 16) as u16, (raw & 0xFFFF) as u16]
}
