//! Logging setup and packet dumps.

use tracing::trace;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{MeterError, MeterResult};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> MeterResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let json = config.json.then(|| fmt::layer().json().with_target(true));
    let text = (!config.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json)
        .with(text)
        .try_init()
        .map_err(|e| MeterError::configuration(format!("Failed to initialize logging: {}", e)))
}

/// Format raw bytes as a hex string, e.g. `01 03 12 00`.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trace-level dump of a raw frame.
pub fn log_packet(direction: &str, protocol: &str, unit_id: u8, frame: &[u8]) {
    trace!(
        "[MODBUS-{}] {} unit:{} {}",
        protocol,
        direction,
        unit_id,
        format_hex(frame)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x01, 0x03, 0x12, 0x00]), "01 03 12 00");
        assert_eq!(format_hex(&[]), "");
    }
}
