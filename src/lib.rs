//! # Voltage Meter - Three-Phase Power Meter Acquisition
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Periodically reads a fixed catalog of holding registers from a
//! three-phase power meter over Modbus TCP or RTU, decodes them into
//! engineering values and forwards each one to a measurement sink. When no
//! meter is available a mock mode produces physically plausible readings
//! instead.
//!
//! ## Features
//!
//! - **Register Catalog**: 32 PXR registers (voltage, current, power, energy, frequency)
//! - **Byte Order Modes**: BE, LE and word-swapped float decoding
//! - **Self-Healing Link**: automatic reconnect after link failures
//! - **Non-Overlapping Sweeps**: periodic ticks never stack up
//! - **Mock Mode**: coherent simulated readings with no hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_meter::{AcquisitionScheduler, MeterConfig, MeterResult, TracingSink};
//!
//! #[tokio::main]
//! async fn main() -> MeterResult<()> {
//!     let config = MeterConfig::load(None)?;
//!     let scheduler = AcquisitionScheduler::from_config(&config, Arc::new(TracingSink::new()))?;
//!
//!     scheduler.connection().connect().await?;
//!     let report = scheduler.trigger_once().await;
//!     println!("{} measurements", report.measurements.len());
//!
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Protocol
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants and acquisition defaults
pub mod constants;

/// Stack-allocated PDU
pub mod pdu;

/// Byte order handling for 32-bit register values
pub mod bytes;

/// Register decoding and FC03 request/response handling
pub mod codec;

/// Network transport layer for TCP and RTU communication
pub mod transport;

// ============================================================================
// Acquisition
// ============================================================================

/// Register catalog of the PXR meter
pub mod registers;

/// Measurement and sweep report types
pub mod measurement;

/// Simulated meter readings
pub mod mock;

/// Connection lifecycle and reconnect policy
pub mod connection;

/// Periodic and on-demand sweeps
pub mod scheduler;

/// Measurement storage abstraction
pub mod sink;

// ============================================================================
// Runtime
// ============================================================================

/// Layered configuration (defaults, TOML file, environment)
pub mod config;

/// Tracing subscriber setup and packet dumps
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{MeterError, MeterResult};

// === Core types ===
pub use bytes::ByteOrderMode;
pub use measurement::{Measurement, RegisterReading, SweepOutcome, SweepReport};
pub use registers::{Encoding, RegisterCatalog, RegisterDescriptor};

// === Acquisition ===
pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState};
pub use mock::MockGenerator;
pub use scheduler::{AcquisitionScheduler, AcquisitionSettings, ConnectionStatus};
pub use sink::{MeasurementRecord, MeasurementSink, MemorySink, TracingSink};

// === Configuration ===
pub use config::{MeterConfig, TransportMode};

// === Transport ===
pub use transport::{TcpTransport, Transport, TransportStats};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Meter v{} - Three-phase power meter acquisition", VERSION)
}
