//! # Connection Manager
//!
//! State machine over a [`Transport`]:
//!
//! ```text
//!                connect()                 open ok
//! Disconnected ------------> Connecting -------------> Connected
//!      ^                         |                         |
//!      |        open failed      |                         |
//!      +-------------------------+                         |
//!      |                                                   |
//!      +---- link failure (reconnect scheduled) -----------+
//!      +---- disconnect() (pending reconnect cancelled) ---+
//! ```
//!
//! The manager owns the transport exclusively. Reads go through
//! [`ConnectionManager::with_channel`], which never reconnects inline: a link
//! failure moves the state to `Disconnected` and hands reconnection to a
//! background task that retries after a fixed delay until it succeeds or is
//! cancelled. At most one such task exists at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RECONNECT_DELAY_SECS};
use crate::error::{MeterError, MeterResult};
use crate::pdu::ModbusPdu;
use crate::transport::{Transport, TransportStats};

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Timing of the connection lifecycle
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Delay before each background reconnection attempt
    pub reconnect_delay: Duration,
    /// Upper bound on one open attempt
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

/// Owner of the device link.
pub struct ConnectionManager {
    /// `None` in mock mode
    transport: Option<Mutex<Box<dyn Transport>>>,
    state: StdMutex<ConnectionState>,
    reconnect: StdMutex<Option<JoinHandle<()>>>,
    /// Counters copied out of the transport whenever its lock is released
    stats: StdMutex<TransportStats>,
    /// Bumped by `disconnect()`; a reconnect task from an older epoch gives up
    epoch: AtomicU64,
    reconnect_attempts: AtomicU64,
    options: ConnectionOptions,
    endpoint: String,
    weak_self: Weak<ConnectionManager>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("mock", &self.is_mock())
            .finish()
    }
}

impl ConnectionManager {
    /// Manager over a real transport, initially `Disconnected`.
    pub fn new(transport: Box<dyn Transport>, options: ConnectionOptions) -> Arc<Self> {
        let endpoint = transport.describe();
        Arc::new_cyclic(|weak| Self {
            transport: Some(Mutex::new(transport)),
            state: StdMutex::new(ConnectionState::Disconnected),
            reconnect: StdMutex::new(None),
            stats: StdMutex::new(TransportStats::default()),
            epoch: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            options,
            endpoint,
            weak_self: weak.clone(),
        })
    }

    /// Manager without a device. Reports connected and never carries traffic.
    pub fn mock() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport: None,
            state: StdMutex::new(ConnectionState::Disconnected),
            reconnect: StdMutex::new(None),
            stats: StdMutex::new(TransportStats::default()),
            epoch: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            options: ConnectionOptions::default(),
            endpoint: "mock".to_string(),
            weak_self: weak.clone(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reconnect(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reconnect.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_stats(&self, channel: &dyn Transport) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = channel.stats();
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.lock_state();
        if *state != next {
            debug!("Connection {}: {} -> {}", self.endpoint, *state, next);
            *state = next;
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// Whether reads may proceed. Always `true` in mock mode.
    pub fn is_connected(&self) -> bool {
        self.is_mock() || self.state() == ConnectionState::Connected
    }

    pub fn is_mock(&self) -> bool {
        self.transport.is_none()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    /// Whether a background reconnection is waiting or running.
    pub fn reconnect_pending(&self) -> bool {
        self.lock_reconnect()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Background reconnection attempts made so far.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Transport counters as of the last open, exchange or close; empty in
    /// mock mode. Never waits for the transport.
    pub fn stats(&self) -> TransportStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Open the transport.
    ///
    /// `Disconnected -> Connecting -> Connected` on success, back to
    /// `Disconnected` on failure. A failed call schedules nothing.
    pub async fn connect(&self) -> MeterResult<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.connect_in_epoch(epoch).await
    }

    async fn connect_in_epoch(&self, epoch: u64) -> MeterResult<()> {
        let Some(transport) = &self.transport else {
            self.set_state(ConnectionState::Connected);
            return Ok(());
        };

        let mut channel = transport.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Connect to {} cancelled by disconnect", self.endpoint);
            return Err(MeterError::NotConnected);
        }
        if self.state() == ConnectionState::Connected && channel.is_open() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let result = match timeout(self.options.connect_timeout, channel.open()).await {
            Ok(result) => result,
            Err(_) => Err(MeterError::timeout(
                format!("connect to {}", self.endpoint),
                self.options.connect_timeout.as_millis() as u64,
            )),
        };
        self.record_stats(&**channel);

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Connected to {}", self.endpoint);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                warn!("Connection to {} failed: {}", self.endpoint, e);
                Err(e)
            }
        }
    }

    /// Close the transport and cancel any pending reconnection.
    pub async fn disconnect(&self) -> MeterResult<()> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let pending = self.lock_reconnect().take();
        if let Some(handle) = pending {
            handle.abort();
            debug!("Pending reconnect to {} cancelled", self.endpoint);
        }
        self.set_state(ConnectionState::Disconnected);

        if let Some(transport) = &self.transport {
            let mut channel = transport.lock().await;
            let closed = channel.close().await;
            self.record_stats(&**channel);
            closed?;
            // A reconnect that held the lock before the epoch bump may have
            // finished opening in the meantime
            self.set_state(ConnectionState::Disconnected);
            info!("Disconnected from {}", self.endpoint);
        }
        Ok(())
    }

    /// Run `f` with exclusive access to the open transport.
    ///
    /// Fails with [`MeterError::NotConnected`] unless the state is
    /// `Connected`. A link failure returned by `f` moves the state to
    /// `Disconnected` and schedules one background reconnection.
    pub async fn with_channel<T, F>(&self, f: F) -> MeterResult<T>
    where
        F: for<'a> FnOnce(&'a mut (dyn Transport + 'static)) -> BoxFuture<'a, MeterResult<T>>,
    {
        let transport = self.transport.as_ref().ok_or(MeterError::NotConnected)?;
        // A failure is only acted on if no disconnect() happened since here
        let epoch = self.epoch.load(Ordering::SeqCst);
        if self.state() != ConnectionState::Connected {
            return Err(MeterError::NotConnected);
        }

        let mut channel = transport.lock().await;
        // Re-check: the link may have dropped while we waited for the lock
        if self.state() != ConnectionState::Connected {
            return Err(MeterError::NotConnected);
        }
        if !channel.is_open() {
            drop(channel);
            self.handle_link_failure(&MeterError::transport("channel closed"), epoch);
            return Err(MeterError::NotConnected);
        }

        let result = f(&mut **channel).await;
        self.record_stats(&**channel);
        drop(channel);

        if let Err(e) = &result {
            if e.is_link_failure() {
                self.handle_link_failure(e, epoch);
            }
        }
        result
    }

    /// One request/response exchange with `unit_id`.
    pub async fn exchange(&self, unit_id: u8, request: &ModbusPdu) -> MeterResult<ModbusPdu> {
        let request = request.clone();
        self.with_channel(move |transport| {
            Box::pin(async move { transport.exchange(unit_id, &request).await })
        })
        .await
    }

    fn handle_link_failure(&self, err: &MeterError, epoch: u64) {
        let was_connected = {
            let mut state = self.lock_state();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                // disconnect() already owns the state
                return;
            }
            let was = *state == ConnectionState::Connected;
            *state = ConnectionState::Disconnected;
            was
        };
        if was_connected {
            warn!("Link to {} lost: {}", self.endpoint, err);
            self.spawn_reconnect(epoch);
        }
    }

    /// Start the background reconnection task unless one is already pending.
    ///
    /// Link failures call this automatically. Callers use it after a failed
    /// explicit `connect()` when they want the manager to keep retrying.
    pub fn schedule_reconnect(&self) {
        self.spawn_reconnect(self.epoch.load(Ordering::SeqCst));
    }

    fn spawn_reconnect(&self, epoch: u64) {
        if self.is_mock() {
            return;
        }

        let mut slot = self.lock_reconnect();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Reconnect to {} already pending", self.endpoint);
            return;
        }
        // disconnect() bumps the epoch before it empties this slot, so a
        // task spawned under the lock with a current epoch is always seen
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Reconnect to {} cancelled by disconnect", self.endpoint);
            return;
        }

        info!(
            "Reconnecting to {} in {}s",
            self.endpoint,
            self.options.reconnect_delay.as_secs_f64()
        );
        *slot = Some(tokio::spawn(Self::reconnect_loop(
            self.weak_self.clone(),
            self.options.reconnect_delay,
            epoch,
        )));
    }

    /// Holds only a weak reference between attempts so dropping the manager
    /// ends the loop.
    async fn reconnect_loop(manager: Weak<Self>, delay: Duration, epoch: u64) {
        loop {
            tokio::time::sleep(delay).await;
            let Some(this) = manager.upgrade() else {
                return;
            };
            if this.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            let attempt = this.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Reconnect attempt {} to {}", attempt, this.endpoint);
            match this.connect_in_epoch(epoch).await {
                Ok(()) => return,
                Err(MeterError::NotConnected) => return,
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_reconnect().take() {
            handle.abort();
        }
    }
}
