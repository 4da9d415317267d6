//! Modbus PDU on a fixed stack buffer
//!
//! One PDU per register read, so no heap allocation on the hot path. Only
//! the read side of the protocol is modelled; the engine never builds write
//! requests.

use tracing::debug;

use crate::constants::{EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, MAX_PDU_SIZE, MAX_READ_REGISTERS};
use crate::error::{MeterError, MeterResult};

/// Function code byte followed by its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU, rejecting anything over 253 bytes.
    pub fn from_slice(data: &[u8]) -> MeterResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(MeterError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();

        if let Some(code) = pdu.exception_code() {
            debug!("PDU received: exception {:02X}", code);
        } else {
            debug!("PDU received: {} bytes", pdu.len);
        }
        Ok(pdu)
    }

    /// Append a byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> MeterResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(MeterError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Append a big-endian word.
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> MeterResult<()> {
        let [hi, lo] = value.to_be_bytes();
        self.push(hi)?;
        self.push(lo)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte, if any.
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Whether the function code carries the exception flag.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }

    /// Exception code of an exception response.
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Request PDU construction.
pub struct PduBuilder;

impl PduBuilder {
    /// Read Holding Registers (FC03) request.
    ///
    /// `start_register` is the 0-based protocol register number; `quantity`
    /// must be 1-125.
    pub fn build_read_holding(start_register: u16, quantity: u16) -> MeterResult<ModbusPdu> {
        if quantity == 0 || quantity as usize > MAX_READ_REGISTERS {
            return Err(MeterError::protocol(format!(
                "Invalid register quantity: {} (must be 1-{})",
                quantity, MAX_READ_REGISTERS
            )));
        }

        let mut pdu = ModbusPdu::new();
        pdu.push(FC_READ_HOLDING_REGISTERS)?;
        pdu.push_u16(start_register)?;
        pdu.push_u16(quantity)?;
        debug!(
            "FC03 request built: register={}, quantity={}",
            start_register, quantity
        );
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_accessors() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());
        assert_eq!(pdu.function_code(), None);

        pdu.push(0x03).unwrap();
        pdu.push_u16(0x1200).unwrap();
        assert_eq!(pdu.len(), 3);
        assert_eq!(pdu.as_slice(), &[0x03, 0x12, 0x00]);
        assert!(!pdu.is_exception());
        assert_eq!(pdu.exception_code(), None);
    }

    #[test]
    fn test_exception_response() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));

        // Flag set but code missing
        let short = ModbusPdu::from_slice(&[0x83]).unwrap();
        assert!(short.is_exception());
        assert_eq!(short.exception_code(), None);
    }

    #[test]
    fn test_build_read_holding() {
        // Register 4608 = 404609 - 400001 (voltage L1-N)
        let pdu = PduBuilder::build_read_holding(4608, 2).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x12, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_build_read_holding_rejects_bad_quantity() {
        assert!(PduBuilder::build_read_holding(0, 0).is_err());
        assert!(PduBuilder::build_read_holding(0, 126).is_err());
        assert!(PduBuilder::build_read_holding(0, 125).is_ok());
    }

    #[test]
    fn test_from_slice_too_large() {
        let data = vec![0u8; MAX_PDU_SIZE + 1];
        assert!(matches!(
            ModbusPdu::from_slice(&data),
            Err(MeterError::Protocol { .. })
        ));
        let full = ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE]).unwrap();
        assert_eq!(full.len(), MAX_PDU_SIZE);
    }
}
