//! Downstream measurement store interface.
//!
//! The engine only pushes; persistence lives elsewhere. Two sinks ship with
//! the crate: [`TracingSink`] logs each record and [`MemorySink`] keeps them
//! in memory for tests and one-shot runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::{MeterError, MeterResult};
use crate::measurement::Measurement;

/// A measurement as stored by a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    pub id: u64,
    pub location: String,
    pub metric: String,
    pub value: Option<f64>,
    pub unit: String,
    pub phase: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl MeasurementRecord {
    fn new(id: u64, location: &str, measurement: &Measurement) -> Self {
        Self {
            id,
            location: location.to_string(),
            metric: measurement.metric.clone(),
            value: measurement.value,
            unit: measurement.unit.clone(),
            phase: measurement.phase.clone(),
            captured_at: measurement.captured_at,
        }
    }
}

/// Consumer of acquired measurements.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Persist one measurement for a location.
    async fn insert(&self, location: &str, measurement: &Measurement)
        -> MeterResult<MeasurementRecord>;
}

/// Sink that emits every record as a structured log event.
#[derive(Debug, Default)]
pub struct TracingSink {
    next_id: AtomicU64,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeasurementSink for TracingSink {
    async fn insert(
        &self,
        location: &str,
        measurement: &Measurement,
    ) -> MeterResult<MeasurementRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = MeasurementRecord::new(id, location, measurement);
        info!(
            id,
            location,
            metric = %record.metric,
            phase = record.phase.as_deref().unwrap_or("-"),
            value = ?record.value,
            unit = %record.unit,
            "measurement"
        );
        Ok(record)
    }
}

/// In-memory sink.
///
/// Metrics registered with [`MemorySink::reject_metric`] fail with
/// [`MeterError::Sink`], which lets tests exercise partial sink outages.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MeasurementRecord>>,
    rejected: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert of `metric` fail.
    pub fn reject_metric(&self, metric: &str) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(metric.to_string());
        }
    }

    /// Snapshot of stored records.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MeasurementSink for MemorySink {
    async fn insert(
        &self,
        location: &str,
        measurement: &Measurement,
    ) -> MeterResult<MeasurementRecord> {
        let rejected = self
            .rejected
            .lock()
            .map(|r| r.contains(&measurement.metric))
            .unwrap_or(false);
        if rejected {
            return Err(MeterError::sink(format!(
                "store rejected {} for {}",
                measurement.metric, location
            )));
        }

        let mut records = self
            .records
            .lock()
            .map_err(|_| MeterError::sink("record store poisoned"))?;
        let record = MeasurementRecord::new(records.len() as u64 + 1, location, measurement);
        records.push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_stores_records() {
        let sink = MemorySink::new();
        let m = Measurement::new("voltage", Some(230.1), "V", Some("L1-N"));
        let record = sink.insert("sala-sport", &m).await.unwrap();

        assert_eq!(record.id, 1);
        assert_eq!(record.location, "sala-sport");
        assert_eq!(record.value, Some(230.1));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.records()[0], record);
    }

    #[tokio::test]
    async fn test_memory_sink_rejects_metric() {
        let sink = MemorySink::new();
        sink.reject_metric("frequency");

        let bad = Measurement::new("frequency", Some(50.0), "Hz", None);
        let good = Measurement::new("current", Some(12.0), "A", Some("L1"));
        assert!(matches!(
            sink.insert("sala-sport", &bad).await,
            Err(MeterError::Sink { .. })
        ));
        assert!(sink.insert("sala-sport", &good).await.is_ok());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_tracing_sink_assigns_ids() {
        let sink = TracingSink::new();
        let m = Measurement::new("frequency", None, "Hz", None);
        assert_eq!(sink.insert("a", &m).await.unwrap().id, 1);
        assert_eq!(sink.insert("a", &m).await.unwrap().id, 2);
    }
}
