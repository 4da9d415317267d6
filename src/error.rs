//! Error types for the acquisition engine
//!
//! A single error enum covers every failure the engine can surface. The
//! variants fall into four groups:
//!
//! - **Link failures** (`Transport`, `Timeout`, `Protocol`): the channel to the
//!   meter is no longer trustworthy. The connection manager drops to
//!   `Disconnected` and schedules a reconnect.
//! - **Value failures** (`Decode`, `Exception`): one register could not be
//!   turned into a number. The sweep records a null measurement and moves on.
//! - **State failures** (`NotConnected`): the operation was attempted while the
//!   link is down. Callers skip the read or the whole sweep.
//! - **Caller errors** (`UnknownRegisterKey`, `InvalidAddress`, `Configuration`):
//!   surfaced immediately, never swallowed.
//!
//! `Sink` errors come from the downstream store and are logged per measurement.

use thiserror::Error;

/// Result type used throughout the crate.
pub type MeterResult<T> = Result<T, MeterError>;

/// Acquisition engine error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeterError {
    /// Connect/open failure or mid-operation disconnect
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// An exchange or connect exceeded its deadline
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed frame: bad CRC, wrong transaction id, truncated header
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Device answered with a Modbus exception response
    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X} ({})", exception_label(.code))]
    Exception { function: u8, code: u8 },

    /// Register payload could not be decoded into a finite number
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Operation attempted while the connection is not established
    #[error("Not connected")]
    NotConnected,

    /// Register key not present in the catalog
    #[error("Unknown register key: {key}")]
    UnknownRegisterKey { key: String },

    /// Address does not map onto a holding register number
    #[error("Invalid register address: {address}")]
    InvalidAddress { address: u32 },

    /// Downstream store rejected a measurement
    #[error("Sink error: {message}")]
    Sink { message: String },

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl MeterError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create an unknown register key error
    pub fn unknown_key<S: Into<String>>(key: S) -> Self {
        Self::UnknownRegisterKey { key: key.into() }
    }

    /// Create a sink error
    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::Sink {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error means the link itself is broken.
    ///
    /// The connection manager moves to `Disconnected` and schedules a
    /// reconnect when an exchange fails with one of these.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Protocol { .. }
        )
    }

    /// Whether the failure only affects the value of a single register.
    pub fn is_value_failure(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::Exception { .. })
    }
}

impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout("io", 0),
            _ => Self::transport(err.to_string()),
        }
    }
}

impl From<figment::Error> for MeterError {
    fn from(err: figment::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

fn exception_label(code: &u8) -> &'static str {
    exception_name(*code)
}

/// Human-readable name of a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    use crate::constants::*;
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server Device Failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server Device Busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory Parity Error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway Target Failed to Respond",
        _ => "Unknown Exception",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_failure_classification() {
        assert!(MeterError::transport("reset").is_link_failure());
        assert!(MeterError::timeout("read", 1000).is_link_failure());
        assert!(MeterError::protocol("crc").is_link_failure());

        assert!(!MeterError::decode("short").is_link_failure());
        assert!(!MeterError::NotConnected.is_link_failure());
        assert!(!MeterError::unknown_key("X").is_link_failure());
    }

    #[test]
    fn test_value_failure_classification() {
        assert!(MeterError::decode("nan").is_value_failure());
        assert!(MeterError::Exception {
            function: 0x03,
            code: 0x02
        }
        .is_value_failure());
        assert!(!MeterError::transport("x").is_value_failure());
    }

    #[test]
    fn test_display_messages() {
        let err = MeterError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "Modbus exception: function 0x03, code 0x02 (Illegal Data Address)"
        );
        assert_eq!(
            MeterError::unknown_key("VOLTAGE_L9N").to_string(),
            "Unknown register key: VOLTAGE_L9N"
        );
        assert_eq!(
            MeterError::timeout("read response", 1000).to_string(),
            "Timeout during read response after 1000ms"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: MeterError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset").into();
        assert!(matches!(err, MeterError::Transport { .. }));

        let err: MeterError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, MeterError::Timeout { .. }));
    }
}
