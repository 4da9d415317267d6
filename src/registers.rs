//! # Register Catalog
//!
//! Static table mapping logical measurements to holding registers.
//!
//! The built-in table is the Eaton PXR measurement block. Every value is a
//! 32-bit float spread over two registers. Addresses use the 6-digit `4xxxxx`
//! convention; see [`crate::codec::register_number`] for the protocol number.
//!
//! | Group | Addresses | Unit |
//! |-------|-----------|------|
//! | Voltage L-N | 404609-404613 | V |
//! | Voltage L-L | 404615-404619 | V |
//! | Current L1-L3, N | 404621-404627 | A |
//! | Frequency | 404631 | Hz |
//! | Active power L1-L3, total | 404641-404651 | kW |
//! | Reactive power L1-L3, total | 404653-404659 | kVAR |
//! | Apparent power L1-L3, total | 404661-404667 | kVA |
//! | Power factor L1-L3, total | 404671-404677 | - |
//! | Active energy import/export | 404801-404803 | kWh |
//! | Reactive energy import/export | 404811-404813 | kVARh |
//! | Apparent energy | 404821 | kVAh |
//!
//! Supporting another meter model means building a different descriptor
//! list and passing it to [`RegisterCatalog::new`].

use std::collections::HashSet;

use serde::Serialize;

use crate::codec::register_number;
use crate::error::{MeterError, MeterResult};

/// Wire encoding of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// IEEE-754 single precision over two registers
    Float32,
    /// Signed 16-bit integer in one register
    Int16,
}

impl Encoding {
    /// Number of 16-bit registers this encoding occupies.
    #[inline]
    pub const fn register_count(&self) -> u16 {
        match self {
            Encoding::Float32 => 2,
            Encoding::Int16 => 1,
        }
    }

    /// Number of payload bytes this encoding occupies.
    #[inline]
    pub const fn byte_len(&self) -> usize {
        self.register_count() as usize * 2
    }
}

/// One logical measurement exposed by the meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterDescriptor {
    /// Catalog key, e.g. `VOLTAGE_L1N`
    pub key: &'static str,
    /// 6-digit holding register address (`4xxxxx`)
    pub address: u32,
    /// Number of 16-bit registers to read
    pub register_count: u16,
    /// Wire encoding
    pub encoding: Encoding,
    /// Engineering unit (empty for dimensionless values)
    pub unit: &'static str,
    /// Metric name shared by all phases of a quantity
    pub metric: &'static str,
    /// Phase tag (`L1`, `L1-N`, `total`, `import`, ...), `None` for frequency
    pub phase: Option<&'static str>,
}

impl RegisterDescriptor {
    /// Float32 descriptor (two registers).
    pub const fn float32(
        key: &'static str,
        address: u32,
        unit: &'static str,
        metric: &'static str,
        phase: Option<&'static str>,
    ) -> Self {
        Self {
            key,
            address,
            register_count: Encoding::Float32.register_count(),
            encoding: Encoding::Float32,
            unit,
            metric,
            phase,
        }
    }

    /// Int16 descriptor (one register).
    pub const fn int16(
        key: &'static str,
        address: u32,
        unit: &'static str,
        metric: &'static str,
        phase: Option<&'static str>,
    ) -> Self {
        Self {
            key,
            address,
            register_count: Encoding::Int16.register_count(),
            encoding: Encoding::Int16,
            unit,
            metric,
            phase,
        }
    }
}

/// PXR measurement block.
const PXR_REGISTERS: &[RegisterDescriptor] = &[
    // Voltage (phase-to-neutral)
    RegisterDescriptor::float32("VOLTAGE_L1N", 404609, "V", "voltage", Some("L1-N")),
    RegisterDescriptor::float32("VOLTAGE_L2N", 404611, "V", "voltage", Some("L2-N")),
    RegisterDescriptor::float32("VOLTAGE_L3N", 404613, "V", "voltage", Some("L3-N")),
    // Voltage (phase-to-phase)
    RegisterDescriptor::float32("VOLTAGE_L1L2", 404615, "V", "voltage", Some("L1-L2")),
    RegisterDescriptor::float32("VOLTAGE_L2L3", 404617, "V", "voltage", Some("L2-L3")),
    RegisterDescriptor::float32("VOLTAGE_L3L1", 404619, "V", "voltage", Some("L3-L1")),
    // Current
    RegisterDescriptor::float32("CURRENT_L1", 404621, "A", "current", Some("L1")),
    RegisterDescriptor::float32("CURRENT_L2", 404623, "A", "current", Some("L2")),
    RegisterDescriptor::float32("CURRENT_L3", 404625, "A", "current", Some("L3")),
    RegisterDescriptor::float32("CURRENT_N", 404627, "A", "current", Some("N")),
    // Active power
    RegisterDescriptor::float32("ACTIVE_POWER_L1", 404641, "kW", "active_power", Some("L1")),
    RegisterDescriptor::float32("ACTIVE_POWER_L2", 404643, "kW", "active_power", Some("L2")),
    RegisterDescriptor::float32("ACTIVE_POWER_L3", 404645, "kW", "active_power", Some("L3")),
    RegisterDescriptor::float32("ACTIVE_POWER_TOTAL", 404651, "kW", "active_power", Some("total")),
    // Reactive power
    RegisterDescriptor::float32("REACTIVE_POWER_L1", 404653, "kVAR", "reactive_power", Some("L1")),
    RegisterDescriptor::float32("REACTIVE_POWER_L2", 404655, "kVAR", "reactive_power", Some("L2")),
    RegisterDescriptor::float32("REACTIVE_POWER_L3", 404657, "kVAR", "reactive_power", Some("L3")),
    RegisterDescriptor::float32("REACTIVE_POWER_TOTAL", 404659, "kVAR", "reactive_power", Some("total")),
    // Apparent power
    RegisterDescriptor::float32("APPARENT_POWER_L1", 404661, "kVA", "apparent_power", Some("L1")),
    RegisterDescriptor::float32("APPARENT_POWER_L2", 404663, "kVA", "apparent_power", Some("L2")),
    RegisterDescriptor::float32("APPARENT_POWER_L3", 404665, "kVA", "apparent_power", Some("L3")),
    RegisterDescriptor::float32("APPARENT_POWER_TOTAL", 404667, "kVA", "apparent_power", Some("total")),
    // Power factor (cos φ)
    RegisterDescriptor::float32("POWER_FACTOR_L1", 404671, "", "power_factor", Some("L1")),
    RegisterDescriptor::float32("POWER_FACTOR_L2", 404673, "", "power_factor", Some("L2")),
    RegisterDescriptor::float32("POWER_FACTOR_L3", 404675, "", "power_factor", Some("L3")),
    RegisterDescriptor::float32("POWER_FACTOR_TOTAL", 404677, "", "power_factor", Some("total")),
    // Energy
    RegisterDescriptor::float32("ENERGY_ACTIVE_IMPORT", 404801, "kWh", "energy_active", Some("import")),
    RegisterDescriptor::float32("ENERGY_ACTIVE_EXPORT", 404803, "kWh", "energy_active", Some("export")),
    RegisterDescriptor::float32("ENERGY_REACTIVE_IMPORT", 404811, "kVARh", "energy_reactive", Some("import")),
    RegisterDescriptor::float32("ENERGY_REACTIVE_EXPORT", 404813, "kVARh", "energy_reactive", Some("export")),
    RegisterDescriptor::float32("ENERGY_APPARENT", 404821, "kVAh", "energy_apparent", Some("total")),
    // Frequency
    RegisterDescriptor::float32("FREQUENCY", 404631, "Hz", "frequency", None),
];

/// Ordered, immutable register table.
///
/// Iteration order is the sweep order.
#[derive(Debug, Clone)]
pub struct RegisterCatalog {
    entries: Vec<RegisterDescriptor>,
}

impl RegisterCatalog {
    /// Build a catalog from descriptors.
    ///
    /// Rejects duplicate keys, register counts that do not match the
    /// encoding width, and addresses outside the holding register range.
    pub fn new(entries: Vec<RegisterDescriptor>) -> MeterResult<Self> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.key) {
                return Err(MeterError::configuration(format!(
                    "Duplicate register key: {}",
                    entry.key
                )));
            }
            if entry.register_count != entry.encoding.register_count() {
                return Err(MeterError::configuration(format!(
                    "Register {} declares {} registers but {:?} needs {}",
                    entry.key,
                    entry.register_count,
                    entry.encoding,
                    entry.encoding.register_count()
                )));
            }
            register_number(entry.address)?;
        }
        Ok(Self { entries })
    }

    /// Catalog of the PXR meter family.
    pub fn pxr() -> Self {
        Self {
            entries: PXR_REGISTERS.to_vec(),
        }
    }

    /// All descriptors in sweep order.
    #[inline]
    pub fn entries(&self) -> &[RegisterDescriptor] {
        &self.entries
    }

    /// Iterate descriptors in sweep order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.entries.iter()
    }

    /// Find a descriptor by key.
    pub fn lookup(&self, key: &str) -> MeterResult<&RegisterDescriptor> {
        self.entries
            .iter()
            .find(|d| d.key == key)
            .ok_or_else(|| MeterError::unknown_key(key))
    }

    /// Distinct metric names in catalog order.
    pub fn metrics(&self) -> Vec<&'static str> {
        let mut metrics: Vec<&'static str> = Vec::new();
        for entry in &self.entries {
            if !metrics.contains(&entry.metric) {
                metrics.push(entry.metric);
            }
        }
        metrics
    }

    /// Number of descriptors.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RegisterCatalog {
    fn default() -> Self {
        Self::pxr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pxr_catalog_is_valid() {
        let catalog = RegisterCatalog::pxr();
        assert_eq!(catalog.len(), 32);
        // Re-validate through the checked constructor
        assert!(RegisterCatalog::new(catalog.entries().to_vec()).is_ok());
    }

    #[test]
    fn test_register_count_matches_encoding() {
        for entry in RegisterCatalog::pxr().iter() {
            assert_eq!(
                entry.register_count,
                entry.encoding.register_count(),
                "{}",
                entry.key
            );
        }
    }

    #[test]
    fn test_lookup() {
        let catalog = RegisterCatalog::pxr();
        let entry = catalog.lookup("VOLTAGE_L1N").unwrap();
        assert_eq!(entry.address, 404609);
        assert_eq!(entry.unit, "V");
        assert_eq!(entry.phase, Some("L1-N"));

        let freq = catalog.lookup("FREQUENCY").unwrap();
        assert_eq!(freq.phase, None);
    }

    #[test]
    fn test_lookup_unknown_key() {
        let catalog = RegisterCatalog::pxr();
        assert_eq!(
            catalog.lookup("VOLTAGE_L9N").unwrap_err(),
            MeterError::UnknownRegisterKey {
                key: "VOLTAGE_L9N".to_string()
            }
        );
    }

    #[test]
    fn test_stable_order() {
        let catalog = RegisterCatalog::pxr();
        let keys: Vec<_> = catalog.iter().map(|d| d.key).collect();
        assert_eq!(keys.first(), Some(&"VOLTAGE_L1N"));
        assert_eq!(keys.last(), Some(&"FREQUENCY"));
        assert_eq!(keys, RegisterCatalog::pxr().iter().map(|d| d.key).collect::<Vec<_>>());
    }

    #[test]
    fn test_metric_groups() {
        let metrics = RegisterCatalog::pxr().metrics();
        assert_eq!(
            metrics,
            vec![
                "voltage",
                "current",
                "active_power",
                "reactive_power",
                "apparent_power",
                "power_factor",
                "energy_active",
                "energy_reactive",
                "energy_apparent",
                "frequency",
            ]
        );
    }

    #[test]
    fn test_new_rejects_duplicates() {
        let entries = vec![
            RegisterDescriptor::float32("A", 400001, "V", "voltage", None),
            RegisterDescriptor::float32("A", 400003, "V", "voltage", None),
        ];
        assert!(matches!(
            RegisterCatalog::new(entries),
            Err(MeterError::Configuration { .. })
        ));
    }

    #[test]
    fn test_new_rejects_width_mismatch() {
        let mut bad = RegisterDescriptor::float32("A", 400001, "V", "voltage", None);
        bad.register_count = 1;
        assert!(RegisterCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn test_new_rejects_invalid_address() {
        let entries = vec![RegisterDescriptor::int16("A", 300001, "", "status", None)];
        assert!(matches!(
            RegisterCatalog::new(entries),
            Err(MeterError::InvalidAddress { address: 300001 })
        ));
    }
}
