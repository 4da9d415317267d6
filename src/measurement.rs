//! Measurement value objects and sweep results.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registers::RegisterDescriptor;

/// One acquired value.
///
/// `value` is `None` when the read or decode failed. A measurement is never
/// partially populated and never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub metric: String,
    pub value: Option<f64>,
    pub unit: String,
    pub phase: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Measurement {
    /// Create a measurement stamped with the current time.
    pub fn new(
        metric: impl Into<String>,
        value: Option<f64>,
        unit: impl Into<String>,
        phase: Option<&str>,
    ) -> Self {
        Self {
            metric: metric.into(),
            value,
            unit: unit.into(),
            phase: phase.map(str::to_string),
            captured_at: Utc::now(),
        }
    }

    /// Measurement carrying a descriptor's metric, unit and phase.
    pub fn from_descriptor(descriptor: &RegisterDescriptor, value: Option<f64>) -> Self {
        Self::new(descriptor.metric, value, descriptor.unit, descriptor.phase)
    }

    /// Whether this measurement and the descriptor name the same quantity.
    pub fn matches(&self, descriptor: &RegisterDescriptor) -> bool {
        self.metric == descriptor.metric && self.phase.as_deref() == descriptor.phase
    }

    /// Whether the value is missing.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepOutcome {
    /// Every catalog entry was attempted
    Completed,
    /// The link was down when the sweep started; nothing was read
    SkippedNotConnected,
    /// Another sweep held the link; this periodic tick was dropped
    SkippedBusy,
}

/// Result of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub outcome: SweepOutcome,
    pub measurements: Vec<Measurement>,
    /// Measurements accepted by the sink
    pub forwarded: usize,
    /// Measurements the sink rejected
    pub sink_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SweepReport {
    pub(crate) fn skipped(outcome: SweepOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            measurements: Vec::new(),
            forwarded: 0,
            sink_failures: 0,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Whether the sweep ran.
    pub fn is_completed(&self) -> bool {
        self.outcome == SweepOutcome::Completed
    }

    /// Measurements with a value.
    pub fn valid_count(&self) -> usize {
        self.measurements.iter().filter(|m| !m.is_null()).count()
    }
}

/// One entry of an on-demand snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterReading {
    pub key: String,
    pub address: u32,
    pub measurement: Option<Measurement>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_descriptor() {
        let descriptor = RegisterDescriptor::float32("CURRENT_N", 404627, "A", "current", Some("N"));
        let m = Measurement::from_descriptor(&descriptor, Some(1.25));
        assert_eq!(m.metric, "current");
        assert_eq!(m.unit, "A");
        assert_eq!(m.phase.as_deref(), Some("N"));
        assert!(m.matches(&descriptor));
        assert!(!m.is_null());
    }

    #[test]
    fn test_null_measurement_serializes_as_null() {
        let m = Measurement::new("frequency", None, "Hz", None);
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["value"].is_null());
        assert!(json["phase"].is_null());
        assert_eq!(json["metric"], "frequency");
        assert!(json.get("captured_at").is_some());
    }

    #[test]
    fn test_skipped_report() {
        let report = SweepReport::skipped(SweepOutcome::SkippedBusy, Utc::now());
        assert!(!report.is_completed());
        assert_eq!(report.valid_count(), 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "skipped_busy");
    }
}
