//! Driver side of the platform connection: dialing, health probing and pump wiring.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::{async_trait, Status};

use crate::error::Result;
use crate::proto::driver as proto;
use crate::proto::driver::driver_instruct_service_client::DriverInstructServiceClient;
use crate::proto::driver::driver_service_client::DriverServiceClient;
use crate::proto::driver::error::ErrorCode;
use crate::proto::driver::health_check_response::ServingStatus as ProtoServingStatus;
use crate::shared::channel;
use crate::shared::health::{HealthIssue, HealthProbe, HealthReport, ServingStatus};
use crate::shared::metadata::StreamMetadata;
use crate::shared::pump::{spawn_pump, Pump, PumpOptions};
use crate::shared::supervisor::{Attempt, Connection, Connector};

use super::pumps::{
    BatchRunPump, DebugPump, HttpProxyPump, PumpContext, RunPump, SchemaPump, StartPump,
    WriteTagPump,
};
use super::{App, Driver, STREAM_COUNT};

/// Clients of one live driver connection.
#[derive(Debug, Clone)]
pub(crate) struct DriverConnection {
    client: DriverServiceClient<Channel>,
    instruct: DriverInstructServiceClient<Channel>,
    health_request: proto::HealthCheckRequest,
}

impl DriverConnection {
    pub(crate) fn client(&self) -> DriverServiceClient<Channel> {
        self.client.clone()
    }

    pub(crate) fn instruct(&self) -> DriverInstructServiceClient<Channel> {
        self.instruct.clone()
    }
}

#[async_trait]
impl HealthProbe for DriverConnection {
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

impl Connection for DriverConnection {}

/// A failed start means the driver cannot serve anything, so it forces a reconnect
/// which replays the start configuration.
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
            code: error.code().as_str_name().to_string(),
            message: error.message.clone(),
            fatal: error.code() == ErrorCode::Start,
        })
        .collect();
    HealthReport { status, issues }
}

/// Dials the driver service and starts the seven driver streams.
pub(crate) struct DriverConnector<T> {
    app: App,
    driver: Arc<T>,
}

impl<T: Driver> DriverConnector<T> {
    pub(crate) fn new(app: App, driver: Arc<T>) -> Self {
        Self { app, driver }
    }

    fn metadata(&self, session_id: &str) -> StreamMetadata {
        let config = self.app.config();
        StreamMetadata::new()
            .with("serviceid", &config.service_id)
            .with("projectid", &config.project)
            .with("driverid", &config.driver.id)
            .with("drivername", &config.driver.name)
            .with("sessionid", session_id)
    }
}

#[async_trait]
impl<T: Driver> Connector for DriverConnector<T> {
    type Connection = DriverConnection;

    fn kind(&self) -> &'static str {
        "driver"
    }

    fn expected_streams(&self) -> usize {
        STREAM_COUNT
    }

    async fn connect(&self) -> Result<DriverConnection> {
        let config = self.app.config();
        let grpc = &config.driver_grpc;
        let channel = channel::connect(grpc).await?;
        let limit = grpc.max_message_size();

        Ok(DriverConnection {
            client: DriverServiceClient::new(channel.clone())
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit),
            instruct: DriverInstructServiceClient::new(channel)
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit),
            health_request: proto::HealthCheckRequest {
                service: config.service_id.clone(),
                project_id: config.project.clone(),
                driver_id: config.driver.id.clone(),
            },
        })
    }

    fn spawn_pumps(&self, connection: &DriverConnection, attempt: &Attempt) -> Vec<JoinHandle<()>> {
        let grpc = &self.app.config().driver_grpc;
        let options = PumpOptions {
            wait_time: grpc.wait_time(),
            timeout: grpc.timeout(),
            heartbeat: grpc.stream().heartbeat(),
        };
        let ctx = Arc::new(PumpContext {
            app: self.app.clone(),
            driver: Arc::clone(&self.driver),
            client: connection.client(),
            metadata: self.metadata(&attempt.session_id),
        });

        vec![
            start(SchemaPump(Arc::clone(&ctx)), options, attempt),
            start(StartPump(Arc::clone(&ctx)), options, attempt),
            start(RunPump(Arc::clone(&ctx)), options, attempt),
            start(WriteTagPump(Arc::clone(&ctx)), options, attempt),
            start(BatchRunPump(Arc::clone(&ctx)), options, attempt),
            start(DebugPump(Arc::clone(&ctx)), options, attempt),
            start(HttpProxyPump(ctx), options, attempt),
        ]
    }
}

fn start<P: Pump>(pump: P, options: PumpOptions, attempt: &Attempt) -> JoinHandle<()> {
    spawn_pump(
        Arc::new(pump),
        options,
        attempt.tracker.clone(),
        attempt.token.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::proto::driver::driver_service_server::{self, DriverServiceServer};
    use crate::shared::config::{GrpcConfig, Identity};
    use crate::shared::envelope::{Envelope, CODE_OK};
    use crate::shared::mq::testing::RecordingQueue;
    use crate::shared::pump::HEARTBEAT;
    use crate::shared::tracker::StreamTracker;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;
    use tonic::metadata::MetadataMap;
    use tonic::transport::Server;
    use tonic::{Request, Response, Streaming};

    struct Idle;

    #[async_trait]
    impl Driver for Idle {
        async fn schema(&self, _app: &App, _locale: &str) -> std::result::Result<String, crate::BoxError> {
            Ok(String::new())
        }

        async fn start(&self, _app: &App, _config: &[u8]) -> std::result::Result<(), crate::BoxError> {
            Ok(())
        }

        async fn run(
            &self,
            _app: &App,
            _command: crate::driver::Command,
        ) -> std::result::Result<serde_json::Value, crate::BoxError> {
            Ok(serde_json::Value::Null)
        }
    }

    fn connector() -> DriverConnector<Idle> {
        let config = DriverConfig::new("svc-1", Identity::new("modbus", "Modbus TCP")).with_project("p1");
        let app = App::new(config, Arc::new(RecordingQueue::default())).unwrap();
        DriverConnector::new(app, Arc::new(Idle))
    }

    fn response(status: ProtoServingStatus, errors: Vec<(ErrorCode, &str)>) -> proto::HealthCheckResponse {
        proto::HealthCheckResponse {
            status: status as i32,
            errors: errors
                .into_iter()
                .map(|(code, message)| proto::Error {
                    code: code as i32,
                    message: message.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_health_report_mapping() {
        let report = health_report(&response(ProtoServingStatus::Serving, vec![]));
        assert_eq!(report, HealthReport::serving());

        let report = health_report(&response(ProtoServingStatus::ServiceUnknown, vec![]));
        assert_eq!(report.status, ServingStatus::ServiceUnknown);
        assert!(report.unhealthy_reason().is_some());
    }

    #[test]
    fn test_only_start_errors_are_fatal() {
        let report = health_report(&response(
            ProtoServingStatus::Serving,
            vec![(ErrorCode::Run, "device timeout")],
        ));
        assert_eq!(report.issues[0].code, "RUN");
        assert!(!report.issues[0].fatal);
        assert!(report.unhealthy_reason().is_none());

        let report = health_report(&response(
            ProtoServingStatus::Serving,
            vec![(ErrorCode::Run, "device timeout"), (ErrorCode::Start, "bad config")],
        ));
        assert!(report.issues[1].fatal);
        assert!(report.unhealthy_reason().unwrap().contains("bad config"));
    }

    #[test]
    fn test_stream_metadata() {
        let metadata = connector().metadata("abc123");

        let decode = |key: &str| String::from_utf8(hex::decode(metadata.get(key).unwrap()).unwrap()).unwrap();
        assert_eq!(decode("serviceid"), "svc-1");
        assert_eq!(decode("projectid"), "p1");
        assert_eq!(decode("driverid"), "modbus");
        assert_eq!(decode("drivername"), "Modbus TCP");
        assert_eq!(decode("sessionid"), "abc123");
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let connector = connector();
        assert_eq!(connector.kind(), "driver");
        assert_eq!(connector.expected_streams(), 7);
        assert!(DriverConnector::new(
            App::new(
                DriverConfig::new("svc", Identity::new("d", "D")).with_driver_grpc(
                    crate::shared::config::GrpcConfig::new("127.0.0.1", 1)
                        .with_timeout(std::time::Duration::from_secs(1))
                ),
                Arc::new(RecordingQueue::default()),
            )
            .unwrap(),
            Arc::new(Idle),
        )
        .connect()
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_spawn_pumps_one_per_stream() {
        let connector = connector();
        let channel = tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let connection = DriverConnection {
            client: DriverServiceClient::new(channel.clone()),
            instruct: DriverInstructServiceClient::new(channel),
            health_request: proto::HealthCheckRequest::default(),
        };
        let attempt = Attempt {
            session_id: "s".into(),
            tracker: StreamTracker::new(STREAM_COUNT),
            token: CancellationToken::new(),
        };

        let pumps = connector.spawn_pumps(&connection, &attempt);
        assert_eq!(pumps.len(), STREAM_COUNT);

        attempt.token.cancel();
        for pump in pumps {
            pump.await.unwrap();
        }
        // nothing listens on the port, so no stream ever opened
        assert_eq!(attempt.tracker.open_streams(), 0);
    }

    type StreamResult<T> = std::result::Result<Response<T>, Status>;
    type Silent<T> = tokio_stream::Pending<std::result::Result<T, Status>>;
    type Outbound<T> = ReceiverStream<std::result::Result<T, Status>>;

    /// In-process platform. Every stream stays open; the run stream is driven by the test.
    #[derive(Clone)]
    struct Platform {
        metadata: Arc<Mutex<Vec<MetadataMap>>>,
        run: Arc<Mutex<Option<mpsc::Sender<std::result::Result<proto::RunRequest, Status>>>>>,
        results: mpsc::UnboundedSender<proto::RunResult>,
    }

    impl Platform {
        fn silent<Req, Res: Send + 'static>(&self, request: Request<Streaming<Res>>) -> StreamResult<Silent<Req>> {
            self.metadata.lock().unwrap().push(request.metadata().clone());
            let mut inbound = request.into_inner();
            tokio::spawn(async move { while let Some(Ok(_)) = inbound.next().await {} });
            Ok(Response::new(tokio_stream::pending()))
        }
    }

    #[async_trait]
    impl driver_service_server::DriverService for Platform {
        async fn health_check(
            &self,
            _request: Request<proto::HealthCheckRequest>,
        ) -> std::result::Result<Response<proto::HealthCheckResponse>, Status> {
            Ok(Response::new(response(ProtoServingStatus::Serving, vec![])))
        }

        async fn event(&self, _request: Request<proto::Request>) -> StreamResult<proto::Response> {
            Err(Status::unimplemented("event"))
        }

        async fn command_log(&self, _request: Request<proto::Request>) -> StreamResult<proto::Response> {
            Err(Status::unimplemented("command log"))
        }

        async fn update_table_data(&self, _request: Request<proto::Request>) -> StreamResult<proto::Response> {
            Err(Status::unimplemented("update table data"))
        }

        async fn find_table_data(
            &self,
            _request: Request<proto::TableDataRequest>,
        ) -> StreamResult<proto::Response> {
            Err(Status::unimplemented("find table data"))
        }

        type SchemaStreamStream = Silent<proto::SchemaRequest>;

        async fn schema_stream(
            &self,
            request: Request<Streaming<proto::SchemaResult>>,
        ) -> StreamResult<Self::SchemaStreamStream> {
            self.silent(request)
        }

        type StartStreamStream = Silent<proto::StartRequest>;

        async fn start_stream(
            &self,
            request: Request<Streaming<proto::StartResult>>,
        ) -> StreamResult<Self::StartStreamStream> {
            self.silent(request)
        }

        type RunStreamStream = Outbound<proto::RunRequest>;

        async fn run_stream(
            &self,
            request: Request<Streaming<proto::RunResult>>,
        ) -> StreamResult<Self::RunStreamStream> {
            self.metadata.lock().unwrap().push(request.metadata().clone());
            let mut inbound = request.into_inner();
            let results = self.results.clone();
            tokio::spawn(async move {
                while let Some(Ok(result)) = inbound.next().await {
                    let _ = results.send(result);
                }
            });
            let (tx, rx) = mpsc::channel(8);
            *self.run.lock().unwrap() = Some(tx);
            Ok(Response::new(ReceiverStream::new(rx)))
        }

        type WriteTagStreamStream = Silent<proto::RunRequest>;

        async fn write_tag_stream(
            &self,
            request: Request<Streaming<proto::RunResult>>,
        ) -> StreamResult<Self::WriteTagStreamStream> {
            self.silent(request)
        }

        type BatchRunStreamStream = Silent<proto::BatchRunRequest>;

        async fn batch_run_stream(
            &self,
            request: Request<Streaming<proto::BatchRunResult>>,
        ) -> StreamResult<Self::BatchRunStreamStream> {
            self.silent(request)
        }

        type DebugStreamStream = Silent<proto::Debug>;

        async fn debug_stream(
            &self,
            request: Request<Streaming<proto::Debug>>,
        ) -> StreamResult<Self::DebugStreamStream> {
            self.silent(request)
        }

        type HttpProxyStreamStream = Silent<proto::HttpProxyRequest>;

        async fn http_proxy_stream(
            &self,
            request: Request<Streaming<proto::HttpProxyResult>>,
        ) -> StreamResult<Self::HttpProxyStreamStream> {
            self.silent(request)
        }
    }

    async fn wait_for_streams(tracker: &StreamTracker, open: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.open_streams() != open {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("open streams stuck at {}, wanted {open}", tracker.open_streams()));
    }

    #[tokio::test]
    async fn test_pumps_against_platform() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let platform = Platform {
            metadata: Arc::default(),
            run: Arc::default(),
            results: results_tx,
        };
        let server = tokio::spawn(
            Server::builder()
                .add_service(DriverServiceServer::new(platform.clone()))
                .serve_with_incoming(TcpListenerStream::new(listener)),
        );

        let grpc = GrpcConfig::new("127.0.0.1", port).with_wait_time(Duration::from_millis(100));
        let config = DriverConfig::new("svc-1", Identity::new("modbus", "Modbus TCP"))
            .with_project("p1")
            .with_driver_grpc(grpc);
        let app = App::new(config, Arc::new(RecordingQueue::default())).unwrap();
        let connector = DriverConnector::new(app, Arc::new(Idle));
        let connection = connector.connect().await.unwrap();
        assert_eq!(connection.check().await.unwrap(), HealthReport::serving());

        let attempt = Attempt {
            session_id: "s1".into(),
            tracker: StreamTracker::new(STREAM_COUNT),
            token: CancellationToken::new(),
        };
        let pumps = connector.spawn_pumps(&connection, &attempt);
        wait_for_streams(&attempt.tracker, STREAM_COUNT).await;
        assert!(attempt.tracker.is_complete());

        let metadata = platform.metadata.lock().unwrap()[0].clone();
        let decode = |key: &str| hex::decode(metadata.get(key).unwrap().to_str().unwrap()).unwrap();
        assert_eq!(decode("serviceid"), b"svc-1");
        assert_eq!(decode("sessionid"), b"s1");

        let run = platform.run.lock().unwrap().clone().unwrap();
        let request = |id: &str| proto::RunRequest {
            request: id.to_string(),
            table_id: "t1".into(),
            id: "d1".into(),
            ..Default::default()
        };
        run.send(Ok(request(HEARTBEAT))).await.unwrap();
        run.send(Ok(request("r1"))).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.request, "r1");
        let envelope: Envelope = serde_json::from_slice(&result.message).unwrap();
        assert_eq!(envelope.code, CODE_OK);

        // the platform ends the run stream; the pump releases it and opens it again
        drop(run);
        platform.run.lock().unwrap().take();
        wait_for_streams(&attempt.tracker, STREAM_COUNT - 1).await;
        wait_for_streams(&attempt.tracker, STREAM_COUNT).await;
        assert!(platform.run.lock().unwrap().is_some());

        attempt.token.cancel();
        for pump in pumps {
            pump.await.unwrap();
        }
        assert_eq!(attempt.tracker.open_streams(), 0);
        server.abort();
    }
}
