//! # Byte Order Handling
//!
//! Rules for reassembling two 16-bit holding registers into one 32-bit
//! IEEE-754 float. The rule is a process-wide setting chosen at startup.
//!
//! ## Naming Convention
//!
//! Uses ABCD notation where:
//! - A = Most significant byte (MSB)
//! - B = Second byte
//! - C = Third byte
//! - D = Least significant byte (LSB)
//!
//! For a register pair carrying the wire bytes `[b0, b1, b2, b3]`:
//! - `BigEndian (ABCD)`: value bytes are `[b0, b1, b2, b3]`
//! - `LittleEndian (DCBA)`: value bytes are `[b3, b2, b1, b0]`
//! - `WordSwap (CDAB)`: value bytes are `[b2, b3, b0, b1]` (common on meters)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::MeterError;

/// Byte order used to interpret 4-byte float payloads.
///
/// # Example
///
/// ```rust
/// use voltage_meter::ByteOrderMode;
///
/// let mode: ByteOrderMode = "SWAP".parse().unwrap();
/// assert_eq!(mode, ByteOrderMode::WordSwap);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrderMode {
    /// Big-endian: ABCD (most significant byte first)
    ///
    /// Network byte order, the default for most power meters.
    #[default]
    BigEndian,

    /// Little-endian: DCBA (least significant byte first)
    LittleEndian,

    /// Big-endian with swapped words: CDAB
    ///
    /// Low word transmitted first, each word big-endian.
    WordSwap,
}

impl ByteOrderMode {
    /// Short configuration name (`BE`, `LE`, `SWAP`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "BE",
            Self::LittleEndian => "LE",
            Self::WordSwap => "SWAP",
        }
    }

    /// ABCD pattern of this mode.
    pub fn pattern(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::WordSwap => "CDAB",
        }
    }

    /// Rearrange wire bytes into big-endian value order.
    #[inline]
    pub fn to_big_endian(&self, wire: [u8; 4]) -> [u8; 4] {
        let [b0, b1, b2, b3] = wire;
        match self {
            Self::BigEndian => [b0, b1, b2, b3],    // ABCD
            Self::LittleEndian => [b3, b2, b1, b0], // DCBA
            Self::WordSwap => [b2, b3, b0, b1],     // CDAB
        }
    }

    /// Rearrange big-endian value bytes into wire order.
    ///
    /// Inverse of [`ByteOrderMode::to_big_endian`]; every mode is its own inverse.
    #[inline]
    pub fn to_wire(&self, value_be: [u8; 4]) -> [u8; 4] {
        self.to_big_endian(value_be)
    }
}

impl FromStr for ByteOrderMode {
    type Err = MeterError;

    /// Accepts `BE`/`LE`/`SWAP` and the ABCD notation, case-insensitive,
    /// ignoring hyphens and underscores.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Normalize in single pass: uppercase + remove hyphens/underscores
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "BE" | "ABCD" | "BIGENDIAN" => Ok(Self::BigEndian),
            "LE" | "DCBA" | "LITTLEENDIAN" => Ok(Self::LittleEndian),
            "SWAP" | "CDAB" | "WORDSWAP" | "BIGENDIANSWAP" => Ok(Self::WordSwap),
            _ => Err(MeterError::configuration(format!(
                "Unknown byte order '{}' (expected BE, LE or SWAP)",
                s
            ))),
        }
    }
}

impl fmt::Display for ByteOrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.pattern())
    }
}

impl Serialize for ByteOrderMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ByteOrderMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
