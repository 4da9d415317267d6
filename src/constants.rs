//! Modbus protocol and acquisition constants
//!
//! Frame limits follow the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register limits are calculated to fit within the PDU size constraint
//!
//! Engine timing defaults mirror the behaviour the meter firmware was
//! commissioned with (10 s reconnect, 50 ms between register reads).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
/// Note: Length field itself is not counted in MBAP_HEADER_LEN for frame parsing
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum RTU ADU size: Slave Address(1) + PDU(253) + CRC(2)
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Maximum number of registers for FC03 (Read Holding Registers)
///
/// Response PDU: Function Code(1) + Byte Count(1) + N × 2 ≤ 253
/// Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03), the only function the engine issues
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Addressing
// ============================================================================

/// First 6-digit holding register address (`4xxxxx` convention).
/// Protocol register number = address - HOLDING_REGISTER_BASE.
pub const HOLDING_REGISTER_BASE: u32 = 400_001;

// ============================================================================
// Acquisition Defaults
// ============================================================================

/// Delay before a dropped connection is re-established
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 10;

/// Pause between consecutive register reads within one sweep
pub const DEFAULT_INTER_READ_DELAY_MS: u64 = 50;

/// Poll interval between sweeps
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Deadline for one request/response exchange
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Deadline for opening the transport
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Decimal places kept on decoded register values
pub const VALUE_PRECISION: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 6);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
        assert_eq!(MAX_RTU_FRAME_SIZE, 256);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
        assert_eq!(MAX_READ_REGISTERS, 125);
    }

    #[test]
    fn test_exception_flag_marks_fc03() {
        assert_eq!(FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x83);
    }
}
