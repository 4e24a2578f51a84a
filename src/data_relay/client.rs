//! Data-relay side of the platform connection.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::{async_trait, Status};

use crate::error::Result;
use crate::proto::data_relay as proto;
use crate::proto::data_relay::data_relay_service_client::DataRelayServiceClient;
use crate::proto::data_relay::health_check_response::ServingStatus as ProtoServingStatus;
use crate::shared::channel;
use crate::shared::health::{HealthIssue, HealthProbe, HealthReport, ServingStatus};
use crate::shared::metadata::StreamMetadata;
use crate::shared::pump::{spawn_pump, PumpOptions};
use crate::shared::supervisor::{Attempt, Connection, Connector};

use super::pumps::{HttpProxyPump, PumpContext, StartPump};
use super::{App, DataRelay, STREAM_COUNT};

#[derive(Debug, Clone)]
pub(crate) struct DataRelayConnection {
    client: DataRelayServiceClient<Channel>,
    health_request: proto::HealthCheckRequest,
}

#[async_trait]
impl HealthProbe for DataRelayConnection {
    async fn check(&self) -> std::result::Result<HealthReport, Status> {
        let response = self
            .client
            .clone()
            .health_check(self.health_request.clone())
            .await?
            .into_inner();
        Ok(health_report(&response))
    }
}

impl Connection for DataRelayConnection {}

/// Reported errors are informational only; no code forces a reconnect.
fn health_report(response: &proto::HealthCheckResponse) -> HealthReport {
    let status = match response.status() {
        ProtoServingStatus::Unknown => ServingStatus::Unknown,
        ProtoServingStatus::Serving => ServingStatus::Serving,
        ProtoServingStatus::NotServing => ServingStatus::NotServing,
        ProtoServingStatus::ServiceUnknown => ServingStatus::ServiceUnknown,
    };
    let issues = response
        .errors
        .iter()
        .map(|error| HealthIssue {
            code: error.code.clone(),
            message: error.message.clone(),
            fatal: false,
        })
        .collect();
    HealthReport { status, issues }
}

pub(crate) struct DataRelayConnector<T> {
    app: App,
    relay: Arc<T>,
}

impl<T: DataRelay> DataRelayConnector<T> {
    pub(crate) fn new(app: App, relay: Arc<T>) -> Self {
        Self { app, relay }
    }

    fn metadata(&self) -> StreamMetadata {
        let config = self.app.config();
        StreamMetadata::new()
            .with("instanceid", &config.service_id)
            .with("projectid", &config.project)
            .with("id", &config.service.id)
            .with("name", &config.service.name)
    }
}

#[async_trait]
impl<T: DataRelay> Connector for DataRelayConnector<T> {
    type Connection = DataRelayConnection;

    fn kind(&self) -> &'static str {
        "data_relay"
    }

    fn expected_streams(&self) -> usize {
        STREAM_COUNT
    }

    async fn connect(&self) -> Result<DataRelayConnection> {
        let config = self.app.config();
        let grpc = &config.data_relay_grpc;
        let channel = channel::connect(grpc).await?;
        let limit = grpc.max_message_size();

        Ok(DataRelayConnection {
            client: DataRelayServiceClient::new(channel)
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit),
            health_request: proto::HealthCheckRequest {
                service: config.service_id.clone(),
                project_id: config.project.clone(),
                r#type: config.service.id.clone(),
            },
        })
    }

    fn spawn_pumps(
        &self,
        connection: &DataRelayConnection,
        attempt: &Attempt,
    ) -> Vec<JoinHandle<()>> {
        let grpc = &self.app.config().data_relay_grpc;
        let options = PumpOptions {
            wait_time: grpc.wait_time(),
            timeout: grpc.timeout(),
            heartbeat: grpc.stream().heartbeat(),
        };
        let ctx = Arc::new(PumpContext {
            app: self.app.clone(),
            relay: Arc::clone(&self.relay),
            client: connection.client.clone(),
            metadata: self.metadata(),
        });

        vec![
            spawn_pump(
                Arc::new(StartPump(Arc::clone(&ctx))),
                options,
                attempt.tracker.clone(),
                attempt.token.clone(),
            ),
            spawn_pump(
                Arc::new(HttpProxyPump(ctx)),
                options,
                attempt.tracker.clone(),
                attempt.token.clone(),
            ),
        ]
    }
}
