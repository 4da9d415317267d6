//! # Frame Codec
//!
//! Turns register descriptors into FC03 requests and register payloads back
//! into numbers.
//!
//! ## Supported Encodings
//!
//! | Encoding | Registers | Byte order applies |
//! |----------|-----------|--------------------|
//! | float32 | 2 | yes (BE / LE / SWAP) |
//! | int16 | 1 | no (always big-endian) |
//!
//! Decoded values are rounded to [`VALUE_PRECISION`] decimal places before
//! they are surfaced.

use crate::bytes::ByteOrderMode;
use crate::constants::{FC_READ_HOLDING_REGISTERS, HOLDING_REGISTER_BASE, VALUE_PRECISION};
use crate::error::{MeterError, MeterResult};
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::registers::{Encoding, RegisterDescriptor};

// ============================================================================
// Addressing
// ============================================================================

/// Convert a 6-digit holding register address into the protocol register number.
///
/// ```rust
/// use voltage_meter::codec::register_number;
///
/// assert_eq!(register_number(400001).unwrap(), 0);
/// assert_eq!(register_number(404609).unwrap(), 4608);
/// assert!(register_number(400000).is_err());
/// ```
pub fn register_number(address: u32) -> MeterResult<u16> {
    address
        .checked_sub(HOLDING_REGISTER_BASE)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or(MeterError::InvalidAddress { address })
}

// ============================================================================
// Decoding Functions
// ============================================================================

/// Decode a 4-byte wire buffer as an IEEE-754 float.
///
/// Fails with [`MeterError::Decode`] on a short buffer or a non-finite result.
/// The value is returned unrounded.
pub fn decode_float32(buf: &[u8], mode: ByteOrderMode) -> MeterResult<f64> {
    let wire: [u8; 4] = buf.try_into().map_err(|_| {
        MeterError::decode(format!("float32 needs 4 bytes, got {}", buf.len()))
    })?;

    let value = f32::from_be_bytes(mode.to_big_endian(wire));
    if !value.is_finite() {
        return Err(MeterError::decode(format!(
            "non-finite float32 {:02X?} ({})",
            wire, mode
        )));
    }
    Ok(f64::from(value))
}

/// Decode a 2-byte wire buffer as a signed 16-bit integer.
pub fn decode_int16(buf: &[u8]) -> MeterResult<i16> {
    match buf {
        [hi, lo] => Ok(i16::from_be_bytes([*hi, *lo])),
        _ => Err(MeterError::decode(format!(
            "int16 needs 2 bytes, got {}",
            buf.len()
        ))),
    }
}

/// Decode a register payload according to its encoding and round it.
///
/// The buffer must hold exactly the bytes the encoding occupies.
pub fn decode_value(buf: &[u8], encoding: Encoding, mode: ByteOrderMode) -> MeterResult<f64> {
    if buf.len() != encoding.byte_len() {
        return Err(MeterError::decode(format!(
            "{:?} payload needs {} bytes, got {}",
            encoding,
            encoding.byte_len(),
            buf.len()
        )));
    }
    let raw = match encoding {
        Encoding::Float32 => decode_float32(buf, mode)?,
        Encoding::Int16 => f64::from(decode_int16(buf)?),
    };
    Ok(round_to(raw, VALUE_PRECISION))
}

/// Round to a fixed number of decimal places.
#[inline]
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

// ============================================================================
// Request / Response
// ============================================================================

/// Build the FC03 request reading one descriptor.
pub fn build_read_request(descriptor: &RegisterDescriptor) -> MeterResult<ModbusPdu> {
    let start = register_number(descriptor.address)?;
    PduBuilder::build_read_holding(start, descriptor.register_count)
}

/// Extract the register payload bytes from an FC03 response.
///
/// Exception responses become [`MeterError::Exception`]. A byte count that
/// disagrees with the requested register count, or with the bytes actually
/// present, is a [`MeterError::Decode`] since the frame itself was valid.
pub fn parse_read_response(pdu: &ModbusPdu, expected_registers: u16) -> MeterResult<Vec<u8>> {
    let data = pdu.as_slice();

    let function = pdu
        .function_code()
        .ok_or_else(|| MeterError::protocol("Empty response PDU"))?;

    if pdu.is_exception() {
        return Err(MeterError::Exception {
            function: function & 0x7F,
            code: pdu.exception_code().unwrap_or(0),
        });
    }

    if function != FC_READ_HOLDING_REGISTERS {
        return Err(MeterError::protocol(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            FC_READ_HOLDING_REGISTERS, function
        )));
    }

    let byte_count = *data
        .get(1)
        .ok_or_else(|| MeterError::decode("Response missing byte count"))?
        as usize;
    let expected_bytes = expected_registers as usize * 2;
    if byte_count != expected_bytes {
        return Err(MeterError::decode(format!(
            "Byte count mismatch: expected {}, got {}",
            expected_bytes, byte_count
        )));
    }

    let payload = &data[2..];
    if payload.len() < byte_count {
        return Err(MeterError::decode(format!(
            "Truncated payload: {} of {} bytes",
            payload.len(),
            byte_count
        )));
    }

    Ok(payload[..byte_count].to_vec())
}

// ============================================================================
// Encoding Functions
// ============================================================================

/// Encode a float into wire bytes for the given byte order.
///
/// Used by test fixtures and simulated devices to produce register payloads.
pub fn encode_float32(value: f32, mode: ByteOrderMode) -> [u8; 4] {
    mode.to_wire(value.to_be_bytes())
}
