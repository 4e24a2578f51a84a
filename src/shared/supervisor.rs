//! Connection supervisor.
//!
//! Keeps exactly one connection to the platform alive. Each attempt dials, opens every
//! stream pump, then blocks on the health watch. Whatever ends the watch tears the
//! attempt down, and the supervisor dials again after `wait_time`. Only [`Supervisor::stop`]
//! ends the cycle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::shared::config::GrpcConfig;
use crate::shared::health::{self, HealthProbe};
use crate::shared::tracker::StreamTracker;

/// Everything the pumps of one connection attempt share.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Fresh for every attempt; lets the platform tell stale streams apart.
    pub session_id: String,
    pub tracker: StreamTracker,
    /// Cancelled when the attempt is torn down.
    pub token: CancellationToken,
}

/// A live connection of one plugin kind.
pub trait Connection: HealthProbe + Clone + Send + Sync + 'static {}

/// Dials connections of one plugin kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Plugin kind, used in logs.
    fn kind(&self) -> &'static str;

    /// Number of streams a healthy connection keeps open.
    fn expected_streams(&self) -> usize;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Starts one pump per stream kind on `connection`. Each returned task must finish
    /// once `attempt.token` is cancelled.
    fn spawn_pumps(&self, connection: &Self::Connection, attempt: &Attempt) -> Vec<JoinHandle<()>>;
}

/// Holder of the current connection. Shared with the App so unary calls can use it.
#[derive(Debug)]
pub struct ConnectionSlot<C> {
    inner: Arc<Mutex<Option<C>>>,
}

impl<C> Clone for ConnectionSlot<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<C: Clone> ConnectionSlot<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live connection, if there is one.
    pub async fn current(&self) -> Option<C> {
        self.inner.lock().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}

/// Supervises the connection of one plugin.
pub struct Supervisor<C: Connector> {
    connector: C,
    config: GrpcConfig,
    slot: ConnectionSlot<C::Connection>,
    tracker: StreamTracker,
    token: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(connector: C, config: GrpcConfig, slot: ConnectionSlot<C::Connection>) -> Self {
        let tracker = StreamTracker::new(connector.expected_streams());
        Self {
            connector,
            config,
            slot,
            tracker,
            token: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Creates the supervisor and starts the reconnect loop in the background.
    pub fn start(connector: C, config: GrpcConfig, slot: ConnectionSlot<C::Connection>) -> Arc<Self> {
        let supervisor = Arc::new(Self::new(connector, config, slot));
        let handle = tokio::spawn(Arc::clone(&supervisor).reconnect_loop());
        if let Ok(mut task) = supervisor.task.lock() {
            *task = Some(handle);
        }
        supervisor
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let kind = self.connector.kind();
        info!(kind, address = %self.config.address(), "connecting to platform");
        loop {
            if self.token.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(()) => info!(kind, "connection attempt finished"),
                Err(e) => error!(kind, error = %e, "connection lost"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.wait_time()) => {}
                _ = self.token.cancelled() => break,
            }
            info!(kind, "reconnecting to platform");
        }
        info!(kind, "supervisor stopped");
    }

    /// One connection attempt. Returns when the connection is considered dead or the
    /// supervisor is stopped.
    pub async fn run_once(&self) -> Result<()> {
        let connection = self.dial().await?;

        let attempt = Attempt {
            session_id: Uuid::new_v4().simple().to_string(),
            tracker: self.tracker.clone(),
            token: self.token.child_token(),
        };
        info!(kind = self.connector.kind(), session = %attempt.session_id, "connected");

        let pumps = self.connector.spawn_pumps(&connection, &attempt);
        let result = health::watch(&connection, &self.config, &self.tracker, &attempt.token).await;

        attempt.token.cancel();
        for pump in pumps {
            if let Err(e) = pump.await {
                warn!(kind = self.connector.kind(), ?e, "stream pump ended abnormally");
            }
        }
        self.close().await;
        result
    }

    async fn dial(&self) -> Result<C::Connection> {
        let mut slot = self.slot.inner.lock().await;
        let dial = tokio::time::timeout(self.config.timeout(), self.connector.connect());
        let connection = tokio::select! {
            outcome = dial => outcome.map_err(|_| {
                Error::ConnectionError(ErrorKind::TimeoutError(format!(
                    "dialing {} took longer than {:?}",
                    self.config.address(),
                    self.config.timeout()
                )))
            })??,
            _ = self.token.cancelled() => {
                return Err(Error::ConnectionError(ErrorKind::NetworkError(
                    "stopped while dialing".to_string(),
                )));
            }
        };
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the current connection. Safe to call any number of times.
    pub async fn close(&self) {
        if self.slot.inner.lock().await.take().is_some() {
            info!(kind = self.connector.kind(), "connection closed");
        }
    }

    /// Stops reconnecting and closes the connection. Safe to call any number of times.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(kind = self.connector.kind(), ?e, "supervisor task ended abnormally");
            }
        }
        self.close().await;
    }

    pub fn stream_tracker(&self) -> &StreamTracker {
        &self.tracker
    }

    pub fn slot(&self) -> &ConnectionSlot<C::Connection> {
        &self.slot
    }
}
