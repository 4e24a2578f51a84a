use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{error, info};

use crate::error::Result;
use crate::shared::mq::MessageQueue;
use crate::shared::signal::shutdown_signal;
use crate::shared::supervisor::{ConnectionSlot, Supervisor};

use super::client::{DataRelayConnection, DataRelayConnector};
use super::config::DataRelayConfig;
use super::DataRelay;

/// Handle a data relay uses to talk back to the platform. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    config: DataRelayConfig,
    mq: Arc<dyn MessageQueue>,
    connection: ConnectionSlot<DataRelayConnection>,
}

impl App {
    pub fn new(config: DataRelayConfig, mq: Arc<dyn MessageQueue>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(AppInner {
                config,
                mq,
                connection: ConnectionSlot::new(),
            }),
        })
    }

    /// Connects to the platform and serves the relay until SIGINT or SIGTERM.
    pub async fn start<T: DataRelay>(&self, relay: T) -> Result<()> {
        self.serve(relay, None).await
    }

    /// Same as [`App::start`], but also stops when `shutdown_rx` fires.
    pub async fn start_with_shutdown<T: DataRelay>(
        &self,
        relay: T,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        self.serve(relay, Some(shutdown_rx)).await
    }

    async fn serve<T: DataRelay>(
        &self,
        relay: T,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        let relay = Arc::new(relay);
        let config = &self.inner.config;
        info!(
            project = %config.project,
            instance = %config.service_id,
            service = %config.service.id,
            "starting data relay"
        );

        let supervisor = Supervisor::start(
            DataRelayConnector::new(self.clone(), Arc::clone(&relay)),
            config.data_relay_grpc.clone(),
            self.inner.connection.clone(),
        );

        shutdown_signal(shutdown_rx).await;
        info!(instance = %config.service_id, "stopping data relay");

        if let Err(e) = relay.stop(self).await {
            error!(instance = %config.service_id, error = %e, "data relay stop failed");
        }
        supervisor.stop().await;
        Ok(())
    }

    pub fn config(&self) -> &DataRelayConfig {
        &self.inner.config
    }

    pub fn project_id(&self) -> &str {
        &self.inner.config.project
    }

    pub fn mq(&self) -> Arc<dyn MessageQueue> {
        Arc::clone(&self.inner.mq)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.is_connected().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::shared::config::{GrpcConfig, Identity};
    use crate::shared::mq::testing::RecordingQueue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tonic::async_trait;

    #[derive(Default)]
    struct Relay {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DataRelay for Relay {
        async fn start(&self, _app: &App, _config: &[u8]) -> std::result::Result<(), BoxError> {
            Ok(())
        }

        async fn stop(&self, _app: &App) -> std::result::Result<(), BoxError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_new_validates_config() {
        let mq = Arc::new(RecordingQueue::default());
        assert!(App::new(DataRelayConfig::new("", Identity::default()), mq.clone()).is_err());

        let app = App::new(
            DataRelayConfig::new("relay-1", Identity::new("http", "HTTP")).with_project("p1"),
            mq,
        )
        .unwrap();
        assert_eq!(app.project_id(), "p1");
    }

    #[tokio::test]
    async fn test_start_with_shutdown_stops_relay() {
        // nothing listens here, so the supervisor keeps redialing until shutdown
        let grpc = GrpcConfig::new("127.0.0.1", 1)
            .with_wait_time(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(200));
        let config =
            DataRelayConfig::new("relay-1", Identity::new("http", "HTTP")).with_data_relay_grpc(grpc);
        let app = App::new(config, Arc::new(RecordingQueue::default())).unwrap();

        let relay = Relay::default();
        let stopped = Arc::clone(&relay.stopped);
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn({
            let app = app.clone();
            async move { app.start_with_shutdown(relay, rx).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(stopped.load(Ordering::SeqCst));
        assert!(!app.is_connected().await);
    }
}
