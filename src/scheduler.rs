//! # Acquisition Scheduler
//!
//! Drives catalog sweeps over the connection manager and forwards the
//! results to a [`MeasurementSink`].
//!
//! ## Sweep
//!
//! 1. Skip entirely when the link is down (reported, never an error).
//! 2. Read every catalog entry in order, one at a time, with a short pause
//!    between reads. A failed read yields a null measurement.
//! 3. Forward each measurement to the sink; a rejected one does not stop
//!    the rest.
//!
//! In mock mode step 2 is replaced by one [`MockGenerator`] set.
//!
//! ## Exclusion
//!
//! One sweep at a time. Periodic ticks that find a sweep running are
//! dropped; manual sweeps, single reads and snapshots wait their turn.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bytes::ByteOrderMode;
use crate::codec::{build_read_request, decode_value, parse_read_response};
use crate::config::{MeterConfig, TransportMode};
use crate::connection::{ConnectionManager, ConnectionOptions, ConnectionState};
use crate::constants::{DEFAULT_INTER_READ_DELAY_MS, DEFAULT_POLL_INTERVAL_SECS};
use crate::error::{MeterError, MeterResult};
use crate::measurement::{Measurement, RegisterReading, SweepOutcome, SweepReport};
use crate::mock::MockGenerator;
use crate::registers::{RegisterCatalog, RegisterDescriptor};
use crate::sink::MeasurementSink;
use crate::transport::{TcpTransport, TransportStats};

/// Per-device acquisition settings
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Modbus unit (slave) id
    pub unit_id: u8,
    pub byte_order: ByteOrderMode,
    /// Location label passed to the sink
    pub location: String,
    /// Pause between consecutive reads of one sweep
    pub inter_read_delay: Duration,
    /// Period reported in status; `start()` takes the period to run with
    pub poll_interval: Duration,
    /// Place periodic ticks on multiples of the interval since the Unix epoch
    pub align_to_wall_clock: bool,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            unit_id: 1,
            byte_order: ByteOrderMode::BigEndian,
            location: "sala-sport".to_string(),
            inter_read_delay: Duration::from_millis(DEFAULT_INTER_READ_DELAY_MS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            align_to_wall_clock: true,
        }
    }
}

impl AcquisitionSettings {
    pub fn from_config(config: &MeterConfig) -> Self {
        Self {
            unit_id: config.unit_id,
            byte_order: config.byte_order,
            location: config.location.clone(),
            inter_read_delay: config.inter_read_delay(),
            poll_interval: config.poll_interval(),
            align_to_wall_clock: true,
        }
    }
}

/// Snapshot of link and scheduler state
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub mock_mode: bool,
    pub endpoint: String,
    pub unit_id: u8,
    pub poll_interval_secs: u64,
    pub reconnect_pending: bool,
    pub polling: bool,
    pub stats: TransportStats,
}

/// Delay from `since_epoch` until the next multiple of `interval`.
///
/// A time exactly on a boundary waits a full interval.
pub fn aligned_delay(since_epoch: Duration, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1);
    let remainder = since_epoch.as_millis() % interval_ms;
    Duration::from_millis((interval_ms - remainder) as u64)
}

struct Trigger {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic and on-demand acquisition over one device.
pub struct AcquisitionScheduler {
    connection: Arc<ConnectionManager>,
    catalog: Arc<RegisterCatalog>,
    sink: Arc<dyn MeasurementSink>,
    mock: MockGenerator,
    settings: AcquisitionSettings,
    /// Held for the duration of a sweep, single read or snapshot
    sweep_lock: Mutex<()>,
    trigger: StdMutex<Option<Trigger>>,
}

impl AcquisitionScheduler {
    pub fn new(
        connection: Arc<ConnectionManager>,
        catalog: Arc<RegisterCatalog>,
        sink: Arc<dyn MeasurementSink>,
        settings: AcquisitionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            catalog,
            sink,
            mock: MockGenerator::default(),
            settings,
            sweep_lock: Mutex::new(()),
            trigger: StdMutex::new(None),
        })
    }

    /// Build transport, connection manager and catalog from configuration.
    ///
    /// The connection is not opened; call `connection().connect()`.
    pub fn from_config(config: &MeterConfig, sink: Arc<dyn MeasurementSink>) -> MeterResult<Arc<Self>> {
        config.validate()?;

        let options = ConnectionOptions {
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        };
        let connection = match config.mode {
            TransportMode::Mock => ConnectionManager::mock(),
            TransportMode::Tcp => {
                let transport = TcpTransport::new(
                    config.tcp.host.clone(),
                    config.tcp.port,
                    config.connect_timeout(),
                    config.read_timeout(),
                )
                .with_packet_logging(config.packet_logging);
                ConnectionManager::new(Box::new(transport), options)
            }
            #[cfg(feature = "rtu")]
            TransportMode::Rtu => {
                let transport = crate::transport::RtuTransport::new(&config.serial, config.read_timeout())?
                    .with_packet_logging(config.packet_logging);
                ConnectionManager::new(Box::new(transport), options)
            }
            #[cfg(not(feature = "rtu"))]
            TransportMode::Rtu => {
                return Err(MeterError::configuration(
                    "RTU mode requires the `rtu` feature",
                ))
            }
        };

        info!(
            "Acquisition configured: mode={}, endpoint={}, unit={}, byte_order={}, location={}",
            config.mode.as_str(),
            connection.endpoint(),
            config.unit_id,
            config.byte_order,
            config.location
        );

        Ok(Self::new(
            connection,
            Arc::new(RegisterCatalog::pxr()),
            sink,
            AcquisitionSettings::from_config(config),
        ))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    fn lock_trigger(&self) -> MutexGuard<'_, Option<Trigger>> {
        self.trigger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the periodic trigger is running.
    pub fn is_running(&self) -> bool {
        self.lock_trigger()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Run one sweep now, then one per `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) -> MeterResult<()> {
        if interval.is_zero() {
            return Err(MeterError::configuration("poll interval must be > 0"));
        }

        let mut trigger = self.lock_trigger();
        if trigger.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(MeterError::configuration("scheduler already running"));
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run(interval, task_token).await;
        });
        *trigger = Some(Trigger { token, handle });

        info!(
            "Polling {} every {}s",
            self.connection.endpoint(),
            interval.as_secs_f64()
        );
        Ok(())
    }

    async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        self.periodic_sweep().await;

        let first = if self.settings.align_to_wall_clock {
            let since_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            Instant::now() + aligned_delay(since_epoch, interval)
        } else {
            Instant::now() + interval
        };
        let mut ticker = tokio::time::interval_at(first, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.periodic_sweep().await;
        }

        debug!("Polling trigger for {} stopped", self.connection.endpoint());
    }

    async fn periodic_sweep(&self) -> SweepReport {
        let started_at = Utc::now();
        match self.sweep_lock.try_lock() {
            Ok(_guard) => self.sweep_locked().await,
            Err(_) => {
                warn!("Previous sweep still running, skipping tick");
                SweepReport::skipped(SweepOutcome::SkippedBusy, started_at)
            }
        }
    }

    /// Stop polling and release the transport.
    ///
    /// No sweep starts after this is called. A sweep already running is not
    /// aborted: its remaining reads fail with `NotConnected` once the link is
    /// closed, and it still forwards what it has before this returns.
    pub async fn stop(&self) -> MeterResult<()> {
        let trigger = self.lock_trigger().take();
        if let Some(trigger) = &trigger {
            trigger.token.cancel();
        }

        let result = self.connection.disconnect().await;

        if let Some(trigger) = trigger {
            if let Err(e) = trigger.handle.await {
                warn!("Polling task ended abnormally: {}", e);
            }
            info!("Polling of {} stopped", self.connection.endpoint());
        }
        result
    }

    /// Run exactly one sweep, waiting for a running one to finish first.
    pub async fn trigger_once(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        self.sweep_locked().await
    }

    async fn sweep_locked(&self) -> SweepReport {
        let started_at = Utc::now();

        if !self.connection.is_connected() {
            warn!(
                "Not connected to {} ({}), skipping sweep",
                self.connection.endpoint(),
                self.connection.state()
            );
            return SweepReport::skipped(SweepOutcome::SkippedNotConnected, started_at);
        }

        let measurements = if self.connection.is_mock() {
            self.mock.generate(&self.settings.location)
        } else {
            self.read_catalog().await
        };

        let (forwarded, sink_failures) = self.forward(&measurements).await;
        let report = SweepReport {
            outcome: SweepOutcome::Completed,
            measurements,
            forwarded,
            sink_failures,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            "Sweep completed: {} measurements ({} valid), {} stored, {} rejected",
            report.measurements.len(),
            report.valid_count(),
            report.forwarded,
            report.sink_failures
        );
        report
    }

    async fn read_catalog(&self) -> Vec<Measurement> {
        let total = self.catalog.len();
        let mut measurements = Vec::with_capacity(total);

        for (index, descriptor) in self.catalog.iter().enumerate() {
            let result = self.read_value(descriptor).await;
            let link_down = matches!(result, Err(MeterError::NotConnected));

            let value = match result {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = descriptor.key, address = descriptor.address, "Read failed: {}", e);
                    None
                }
            };
            measurements.push(Measurement::from_descriptor(descriptor, value));

            // Nothing was sent when the link is down, so there is no traffic to pace
            if index + 1 < total && !link_down && !self.settings.inter_read_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_read_delay).await;
            }
        }
        measurements
    }

    async fn read_value(&self, descriptor: &RegisterDescriptor) -> MeterResult<f64> {
        let request = build_read_request(descriptor)?;
        let response = self
            .connection
            .exchange(self.settings.unit_id, &request)
            .await?;
        let payload = parse_read_response(&response, descriptor.register_count)?;
        let value = decode_value(&payload, descriptor.encoding, self.settings.byte_order)?;
        debug!(key = descriptor.key, value, "Register read");
        Ok(value)
    }

    async fn forward(&self, measurements: &[Measurement]) -> (usize, usize) {
        let mut forwarded = 0;
        let mut failures = 0;
        for measurement in measurements {
            match self.sink.insert(&self.settings.location, measurement).await {
                Ok(_) => forwarded += 1,
                Err(e) => {
                    failures += 1;
                    error!(
                        metric = %measurement.metric,
                        phase = measurement.phase.as_deref().unwrap_or("-"),
                        "Failed to store measurement: {}",
                        e
                    );
                }
            }
        }
        (forwarded, failures)
    }

    /// Read one register by catalog key.
    ///
    /// Unknown keys and link failures are returned as errors; a value that
    /// cannot be decoded gives a measurement without a value. In mock mode
    /// the value comes from a generated set.
    pub async fn read_register(&self, key: &str) -> MeterResult<Measurement> {
        let descriptor = self.catalog.lookup(key)?;
        if self.connection.is_mock() {
            return Ok(self.mock.mock_read(descriptor));
        }

        let _guard = self.sweep_lock.lock().await;
        match self.read_value(descriptor).await {
            Ok(value) => Ok(Measurement::from_descriptor(descriptor, Some(value))),
            Err(e) if e.is_value_failure() => {
                warn!(key, "Read returned no usable value: {}", e);
                Ok(Measurement::from_descriptor(descriptor, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Read the whole catalog without forwarding to the sink.
    pub async fn snapshot(&self) -> Vec<RegisterReading> {
        let _guard = self.sweep_lock.lock().await;

        if self.connection.is_mock() {
            let set = self.mock.generate(&self.settings.location);
            return self
                .catalog
                .iter()
                .map(|descriptor| RegisterReading {
                    key: descriptor.key.to_string(),
                    address: descriptor.address,
                    measurement: set.iter().find(|m| m.matches(descriptor)).cloned(),
                    error: None,
                })
                .collect();
        }

        let total = self.catalog.len();
        let mut readings = Vec::with_capacity(total);
        for (index, descriptor) in self.catalog.iter().enumerate() {
            let result = self.read_value(descriptor).await;
            let link_down = matches!(result, Err(MeterError::NotConnected));
            let (measurement, error) = match result {
                Ok(value) => (Some(Measurement::from_descriptor(descriptor, Some(value))), None),
                Err(e) => (None, Some(e.to_string())),
            };
            readings.push(RegisterReading {
                key: descriptor.key.to_string(),
                address: descriptor.address,
                measurement,
                error,
            });

            if index + 1 < total && !link_down && !self.settings.inter_read_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_read_delay).await;
            }
        }
        readings
    }

    /// Current link and polling status.
    ///
    /// Does not wait for the transport, so it answers while a reconnect or a
    /// slow read holds the link.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.connection.state(),
            connected: self.connection.is_connected(),
            mock_mode: self.connection.is_mock(),
            endpoint: self.connection.endpoint().to_string(),
            unit_id: self.settings.unit_id,
            poll_interval_secs: self.settings.poll_interval.as_secs(),
            reconnect_pending: self.connection.reconnect_pending(),
            polling: self.is_running(),
            stats: self.connection.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn mock_scheduler(sink: Arc<MemorySink>) -> Arc<AcquisitionScheduler> {
        AcquisitionScheduler::new(
            ConnectionManager::mock(),
            Arc::new(RegisterCatalog::pxr()),
            sink,
            AcquisitionSettings {
                align_to_wall_clock: false,
                ..AcquisitionSettings::default()
            },
        )
    }

    #[test]
    fn test_aligned_delay() {
        let interval = Duration::from_secs(5);
        assert_eq!(aligned_delay(Duration::from_millis(12_000), interval), Duration::from_secs(3));
        assert_eq!(aligned_delay(Duration::from_millis(10_000), interval), Duration::from_secs(5));
        assert_eq!(aligned_delay(Duration::from_millis(14_999), interval), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_trigger_once_mock() {
        let sink = Arc::new(MemorySink::new());
        let scheduler = mock_scheduler(sink.clone());

        let report = scheduler.trigger_once().await;
        assert!(report.is_completed());
        assert_eq!(report.measurements.len(), 32);
        assert_eq!(report.forwarded, 32);
        assert_eq!(report.sink_failures, 0);
        assert_eq!(sink.len(), 32);
        assert!(sink.records().iter().all(|r| r.location == "sala-sport"));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_forwarding() {
        let sink = Arc::new(MemorySink::new());
        sink.reject_metric("voltage");
        let scheduler = mock_scheduler(sink.clone());

        let report = scheduler.trigger_once().await;
        assert_eq!(report.sink_failures, 6);
        assert_eq!(report.forwarded, 26);
        assert_eq!(sink.len(), 26);
    }

    #[tokio::test]
    async fn test_read_register_mock() {
        let scheduler = mock_scheduler(Arc::new(MemorySink::new()));
        let m = scheduler.read_register("FREQUENCY").await.unwrap();
        assert_eq!(m.metric, "frequency");
        assert_eq!(m.phase, None);

        assert_eq!(
            scheduler.read_register("NOPE").await.unwrap_err(),
            MeterError::unknown_key("NOPE")
        );
    }

    #[tokio::test]
    async fn test_snapshot_mock() {
        let sink = Arc::new(MemorySink::new());
        let scheduler = mock_scheduler(sink.clone());
        let readings = scheduler.snapshot().await;
        assert_eq!(readings.len(), 32);
        assert!(readings.iter().all(|r| r.measurement.is_some() && r.error.is_none()));
        // Snapshots are not stored
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_status_mock() {
        let scheduler = mock_scheduler(Arc::new(MemorySink::new()));
        let status = scheduler.status();
        assert!(status.connected);
        assert!(status.mock_mode);
        assert_eq!(status.endpoint, "mock");
        assert_eq!(status.poll_interval_secs, 5);
        assert!(!status.polling);
        assert!(!status.reconnect_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejects_double_start_and_zero_interval() {
        let scheduler = mock_scheduler(Arc::new(MemorySink::new()));
        assert!(scheduler.start(Duration::ZERO).is_err());
        scheduler.start(Duration::from_secs(5)).unwrap();
        assert!(scheduler.is_running());
        assert!(scheduler.start(Duration::from_secs(5)).is_err());
        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    async fn wait_for_records(sink: &MemorySink, count: usize, since: Instant) -> Duration {
        while sink.len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        since.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_aligned_ticks_land_on_wall_clock_boundaries() {
        let sink = Arc::new(MemorySink::new());
        let scheduler = AcquisitionScheduler::new(
            ConnectionManager::mock(),
            Arc::new(RegisterCatalog::pxr()),
            sink.clone(),
            AcquisitionSettings::default(),
        );
        assert!(scheduler.settings.align_to_wall_clock);

        let wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let started = Instant::now();
        scheduler.start(Duration::from_secs(5)).unwrap();

        // Immediate sweep, then the first tick on the next 5s wall-clock boundary
        let first = wait_for_records(&sink, 32, started).await;
        assert!(first <= Duration::from_millis(1));
        let aligned = wait_for_records(&sink, 64, started).await;
        assert!(aligned <= Duration::from_millis(5_001), "{:?}", aligned);
        let phase = (wall_ms + aligned.as_millis()) % 5_000;
        assert!(phase <= 50 || phase >= 4_950, "tick {}ms off boundary", phase);

        // Later ticks follow at the plain interval
        let next = wait_for_records(&sink, 96, started).await;
        let gap = next - aligned;
        assert!(
            gap >= Duration::from_millis(4_999) && gap <= Duration::from_millis(5_001),
            "{:?}",
            gap
        );
        assert_eq!(sink.len(), 96);

        scheduler.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.len(), 96);
    }

    #[test]
    fn test_from_config_mock() {
        let config = MeterConfig {
            mode: TransportMode::Mock,
            ..MeterConfig::default()
        };
        let scheduler =
            AcquisitionScheduler::from_config(&config, Arc::new(MemorySink::new())).unwrap();
        assert!(scheduler.connection().is_mock());
        assert_eq!(scheduler.catalog().len(), 32);
        assert_eq!(scheduler.settings().location, "sala-sport");
    }

    #[test]
    fn test_from_config_tcp() {
        let scheduler = AcquisitionScheduler::from_config(
            &MeterConfig::default(),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        assert!(!scheduler.connection().is_mock());
        assert_eq!(scheduler.connection().endpoint(), "tcp://192.168.1.100:502");
        assert_eq!(scheduler.connection().state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = MeterConfig {
            unit_id: 0,
            ..MeterConfig::default()
        };
        assert!(AcquisitionScheduler::from_config(&config, Arc::new(MemorySink::new())).is_err());
    }
}
