//! # Configuration
//!
//! Layered configuration, highest priority last:
//!
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables prefixed `METER_`, nested keys split on `__`
//!    (`METER_TCP__HOST=10.0.0.5`, `METER_BYTE_ORDER=SWAP`)
//!
//! Configuration is read once at startup and never changes afterwards.
//!
//! ```toml
//! mode = "tcp"
//! unit_id = 1
//! poll_interval_secs = 5
//! byte_order = "SWAP"
//! location = "sala-sport"
//!
//! [tcp]
//! host = "192.168.1.100"
//! port = 502
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bytes::ByteOrderMode;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_INTER_READ_DELAY_MS, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_SECS, DEFAULT_TCP_PORT,
};
use crate::error::{MeterError, MeterResult};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "METER_";

/// How the engine reaches the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Rtu,
    /// No device; measurements come from the mock generator
    Mock,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Rtu => "rtu",
            Self::Mock => "mock",
        }
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    #[serde(alias = "n", alias = "N")]
    None,
    #[serde(alias = "e", alias = "E")]
    Even,
    #[serde(alias = "o", alias = "O")]
    Odd,
}

/// Modbus TCP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: DEFAULT_TCP_PORT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

/// Serial line settings for Modbus RTU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub mode: TransportMode,
    pub tcp: TcpConfig,
    pub serial: SerialConfig,
    /// Modbus unit (slave) id
    pub unit_id: u8,
    pub poll_interval_secs: u64,
    pub byte_order: ByteOrderMode,
    /// Location label attached to every stored measurement
    pub location: String,
    pub read_timeout_ms: u64,
    pub reconnect_delay_secs: u64,
    pub inter_read_delay_ms: u64,
    /// Hex-dump every frame at trace level
    pub packet_logging: bool,
    pub logging: LoggingConfig,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tcp,
            tcp: TcpConfig::default(),
            serial: SerialConfig::default(),
            unit_id: 1,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            byte_order: ByteOrderMode::BigEndian,
            location: "sala-sport".to_string(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            inter_read_delay_ms: DEFAULT_INTER_READ_DELAY_MS,
            packet_logging: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl MeterConfig {
    /// Provider stack: defaults, then the file (if given), then environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(MeterConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate configuration.
    ///
    /// An explicitly given file must exist.
    pub fn load(path: Option<&Path>) -> MeterResult<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(MeterError::configuration(format!(
                    "Config file {} not found",
                    path.display()
                )));
            }
        }

        let config: MeterConfig = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> MeterResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(MeterError::configuration("poll_interval_secs must be > 0"));
        }
        if !(1..=247).contains(&self.unit_id) {
            return Err(MeterError::configuration(format!(
                "unit_id {} out of range 1-247",
                self.unit_id
            )));
        }
        if self.location.trim().is_empty() {
            return Err(MeterError::configuration("location must not be empty"));
        }
        if self.read_timeout_ms == 0 {
            return Err(MeterError::configuration("read_timeout_ms must be > 0"));
        }

        match self.mode {
            TransportMode::Tcp => {
                if self.tcp.host.trim().is_empty() {
                    return Err(MeterError::configuration("tcp.host must not be empty"));
                }
                if self.tcp.port == 0 {
                    return Err(MeterError::configuration("tcp.port must not be 0"));
                }
            }
            TransportMode::Rtu => {
                if self.serial.path.trim().is_empty() {
                    return Err(MeterError::configuration("serial.path must not be empty"));
                }
                if self.serial.baud_rate == 0 {
                    return Err(MeterError::configuration("serial.baud_rate must be > 0"));
                }
                if !(5..=8).contains(&self.serial.data_bits) {
                    return Err(MeterError::configuration(format!(
                        "serial.data_bits {} not supported (5-8)",
                        self.serial.data_bits
                    )));
                }
                if !matches!(self.serial.stop_bits, 1 | 2) {
                    return Err(MeterError::configuration(format!(
                        "serial.stop_bits {} not supported (1 or 2)",
                        self.serial.stop_bits
                    )));
                }
            }
            TransportMode::Mock => {}
        }
        Ok(())
    }

    pub fn is_mock(&self) -> bool {
        self.mode == TransportMode::Mock
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn inter_read_delay(&self) -> Duration {
        Duration::from_millis(self.inter_read_delay_ms)
    }
}
