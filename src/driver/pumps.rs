//! The seven request streams of a driver.
//!
//! Every stream carries its answers as a JSON [`Envelope`] correlated by request id.
//! Start requests are handled one at a time so configurations apply in arrival order;
//! every other stream dispatches concurrently.

use std::sync::Arc;

use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{async_trait, Status, Streaming};

use crate::proto::driver as proto;
use crate::proto::driver::driver_service_client::DriverServiceClient;
use crate::shared::envelope::Envelope;
use crate::shared::metadata::StreamMetadata;
use crate::shared::pump::{Pump, HEARTBEAT};

use super::entity::{BatchCommand, Command, Headers};
use super::{App, Driver};

/// State shared by all pumps of one connection attempt.
pub(crate) struct PumpContext<T> {
    pub(crate) app: App,
    pub(crate) driver: Arc<T>,
    pub(crate) client: DriverServiceClient<Channel>,
    pub(crate) metadata: StreamMetadata,
}

/// Implements [`Pump`] for one driver stream. `$dispatch` turns a request into the
/// envelope that is sent back.
macro_rules! driver_pump {
    (
        $pump:ident, $name:literal, $open:ident,
        $request:ident => $response:ident { $payload:ident },
        sequential: $sequential:literal,
        |$ctx:ident, $req:ident| $dispatch:expr
    ) => {
        pub(crate) struct $pump<T>(pub(crate) Arc<PumpContext<T>>);

        #[async_trait]
        impl<T: Driver> Pump for $pump<T> {
            type Request = proto::$request;
            type Response = proto::$response;

            fn name(&self) -> &'static str {
                $name
            }

            fn request_id(request: &Self::Request) -> &str {
                &request.request
            }

            fn sequential(&self) -> bool {
                $sequential
            }

            async fn open(
                &self,
                outbound: ReceiverStream<Self::Response>,
            ) -> Result<Streaming<Self::Request>, Status> {
                let request = self.0.metadata.request(outbound)?;
                Ok(self.0.client.clone().$open(request).await?.into_inner())
            }

            async fn dispatch(&self, $req: Self::Request) -> Self::Response {
                let request = $req.request.clone();
                let $ctx = &*self.0;
                let envelope: Envelope = $dispatch;
                proto::$response {
                    request,
                    $payload: envelope.encode(),
                }
            }

            fn failure(&self, request_id: String, reason: String) -> Self::Response {
                proto::$response {
                    request: request_id,
                    $payload: Envelope::failure(reason).encode(),
                }
            }

            fn heartbeat(&self) -> Self::Response {
                proto::$response {
                    request: HEARTBEAT.to_string(),
                    $payload: Vec::new(),
                }
            }
        }
    };
}

driver_pump!(
    SchemaPump, "schema", schema_stream,
    SchemaRequest => SchemaResult { message },
    sequential: false,
    |ctx, req| Envelope::from_result(
        ctx.driver.schema(&ctx.app, &req.locale).await.map(Value::String)
    )
);

driver_pump!(
    StartPump, "start", start_stream,
    StartRequest => StartResult { message },
    sequential: true,
    |ctx, req| match ctx.app.apply_instance(&req.config) {
        Err(e) => Envelope::failure(e.to_string()),
        Ok(_) => match ctx.driver.start(&ctx.app, &req.config).await {
            Ok(()) => Envelope::ok(None),
            Err(e) => Envelope::failure(e.to_string()),
        },
    }
);

driver_pump!(
    RunPump, "run", run_stream,
    RunRequest => RunResult { message },
    sequential: false,
    |ctx, req| Envelope::from_result(ctx.driver.run(&ctx.app, command(req)).await)
);

driver_pump!(
    WriteTagPump, "write_tag", write_tag_stream,
    RunRequest => RunResult { message },
    sequential: false,
    |ctx, req| Envelope::from_result(ctx.driver.write_tag(&ctx.app, command(req)).await)
);

driver_pump!(
    BatchRunPump, "batch_run", batch_run_stream,
    BatchRunRequest => BatchRunResult { message },
    sequential: false,
    |ctx, req| {
        let command = BatchCommand {
            table: req.table_id,
            ids: req.id,
            serial_no: req.serial_no,
            command: req.command,
        };
        Envelope::from_result(ctx.driver.batch_run(&ctx.app, command).await)
    }
);

driver_pump!(
    DebugPump, "debug", debug_stream,
    Debug => Debug { data },
    sequential: false,
    |ctx, req| Envelope::from_result(ctx.driver.debug(&ctx.app, req.data).await)
);

driver_pump!(
    HttpProxyPump, "http_proxy", http_proxy_stream,
    HttpProxyRequest => HttpProxyResult { data },
    sequential: false,
    |ctx, req| match parse_headers(&req.headers) {
        Err(e) => Envelope::failure(format!("invalid proxy headers: {e}")),
        Ok(headers) => Envelope::from_result(
            ctx.driver.http_proxy(&ctx.app, &req.r#type, headers, req.data).await
        ),
    }
);

fn command(request: proto::RunRequest) -> Command {
    Command {
        table: request.table_id,
        id: request.id,
        serial_no: request.serial_no,
        command: request.command,
    }
}

fn parse_headers(raw: &[u8]) -> serde_json::Result<Headers> {
    if raw.is_empty() {
        return Ok(Headers::default());
    }
    serde_json::from_slice(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverConfig;
    use crate::error::BoxError;
    use crate::shared::config::Identity;
    use crate::shared::envelope::{CODE_FAILED, CODE_OK};
    use crate::shared::mq::testing::RecordingQueue;
    use crate::shared::pump::{pump_messages, PumpOptions};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tonic::transport::Endpoint;

    #[derive(Default)]
    struct TestDriver {
        started: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Driver for TestDriver {
        async fn schema(&self, _app: &App, locale: &str) -> Result<String, BoxError> {
            Ok(format!(r#"{{"locale": "{locale}"}}"#))
        }

        async fn start(&self, _app: &App, config: &[u8]) -> Result<(), BoxError> {
            self.started.lock().unwrap().push(config.to_vec());
            Ok(())
        }

        async fn run(&self, _app: &App, command: Command) -> Result<Value, BoxError> {
            match command.command.as_slice() {
                b"panic" => panic!("device on fire"),
                b"fail" => Err("device offline".into()),
                _ => Ok(json!({"table": command.table, "id": command.id})),
            }
        }

        async fn http_proxy(
            &self,
            _app: &App,
            kind: &str,
            headers: Headers,
            data: Vec<u8>,
        ) -> Result<Value, BoxError> {
            Ok(json!({"type": kind, "headers": headers, "body": String::from_utf8(data)?}))
        }
    }

    fn context(driver: Arc<TestDriver>) -> Arc<PumpContext<TestDriver>> {
        let config = DriverConfig::new("svc", Identity::new("d", "Driver"));
        let app = App::new(config, Arc::new(RecordingQueue::default())).unwrap();
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        Arc::new(PumpContext {
            app,
            driver,
            client: DriverServiceClient::new(channel),
            metadata: StreamMetadata::new(),
        })
    }

    fn envelope(payload: &[u8]) -> Envelope {
        serde_json::from_slice(payload).unwrap()
    }

    fn run_request(id: &str, command: &str) -> proto::RunRequest {
        proto::RunRequest {
            request: id.to_string(),
            table_id: "t1".into(),
            id: "d1".into(),
            serial_no: "s1".into(),
            command: command.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_run_envelopes() {
        let pump = RunPump(context(Arc::default()));

        let ok = pump.dispatch(run_request("r1", "{}")).await;
        assert_eq!(ok.request, "r1");
        let ok = envelope(&ok.message);
        assert_eq!(ok.code, CODE_OK);
        assert_eq!(ok.result, Some(json!({"table": "t1", "id": "d1"})));

        let failed = envelope(&pump.dispatch(run_request("r2", "fail")).await.message);
        assert_eq!(failed.code, CODE_FAILED);
        assert_eq!(failed.error.as_deref(), Some("device offline"));
    }

    #[tokio::test]
    async fn test_panicking_callback_answers_failure() {
        let pump = Arc::new(RunPump(context(Arc::default())));
        let inbound = tokio_stream::iter(vec![
            Ok(run_request("r1", "panic")),
            Ok(run_request(HEARTBEAT, "")),
            Ok(run_request("r2", "{}")),
        ]);
        let (tx, mut rx) = mpsc::channel(10);
        let options = PumpOptions {
            wait_time: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            heartbeat: None,
        };

        pump_messages(pump, inbound, tx, &options, &CancellationToken::new())
            .await
            .unwrap();

        let mut responses = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        responses.sort_by(|a, b| a.request.cmp(&b.request));
        assert!(rx.try_recv().is_err());

        let panicked = envelope(&responses[0].message);
        assert_eq!(responses[0].request, "r1");
        assert_eq!(panicked.code, CODE_FAILED);
        assert!(panicked.error.unwrap().contains("device on fire"));
        assert_eq!(envelope(&responses[1].message).code, CODE_OK);
    }

    #[tokio::test]
    async fn test_start_applies_instance_before_driver() {
        let driver = Arc::new(TestDriver::default());
        let ctx = context(Arc::clone(&driver));
        let pump = StartPump(Arc::clone(&ctx));
        assert!(pump.sequential());

        let config = br#"{"groupId": "g1", "tables": [{"id": "t1", "devices": [{"id": "d1"}]}]}"#;
        let result = pump
            .dispatch(proto::StartRequest {
                request: "s1".into(),
                config: config.to_vec(),
            })
            .await;
        assert_eq!(envelope(&result.message), Envelope::ok(None));
        assert_eq!(ctx.app.devices().resolve("d1").unwrap(), "t1");
        assert_eq!(ctx.app.group_id(), "g1");

        let result = pump
            .dispatch(proto::StartRequest {
                request: "s2".into(),
                config: b"{broken".to_vec(),
            })
            .await;
        assert_eq!(envelope(&result.message).code, CODE_FAILED);
        // the driver only saw the valid configuration
        assert_eq!(driver.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schema_and_defaults() {
        let ctx = context(Arc::default());

        let schema = SchemaPump(Arc::clone(&ctx))
            .dispatch(proto::SchemaRequest {
                request: "q1".into(),
                locale: "zh-CN".into(),
            })
            .await;
        // the schema travels as a string even when it is JSON itself
        assert_eq!(
            envelope(&schema.message).result,
            Some(Value::String(r#"{"locale": "zh-CN"}"#.into()))
        );

        let debug = DebugPump(Arc::clone(&ctx))
            .dispatch(proto::Debug {
                request: "q2".into(),
                data: vec![],
            })
            .await;
        assert_eq!(debug.request, "q2");
        let debug = envelope(&debug.data);
        assert_eq!(debug.code, CODE_FAILED);
        assert!(debug.error.unwrap().contains("not supported"));

        let batch = BatchRunPump(ctx)
            .dispatch(proto::BatchRunRequest {
                request: "q3".into(),
                id: vec!["d1".into(), "d2".into()],
                ..Default::default()
            })
            .await;
        assert_eq!(envelope(&batch.message).code, CODE_FAILED);
    }

    #[tokio::test]
    async fn test_http_proxy_headers() {
        let pump = HttpProxyPump(context(Arc::default()));

        let result = pump
            .dispatch(proto::HttpProxyRequest {
                request: "h1".into(),
                r#type: "GET".into(),
                headers: br#"{"Accept": ["application/json"]}"#.to_vec(),
                data: b"ping".to_vec(),
            })
            .await;
        assert_eq!(
            envelope(&result.data).result,
            Some(json!({"type": "GET", "headers": {"Accept": ["application/json"]}, "body": "ping"}))
        );

        let result = pump
            .dispatch(proto::HttpProxyRequest {
                request: "h2".into(),
                headers: b"not json".to_vec(),
                ..Default::default()
            })
            .await;
        let failed = envelope(&result.data);
        assert_eq!(failed.code, CODE_FAILED);
        assert!(failed.error.unwrap().contains("invalid proxy headers"));
    }

    #[tokio::test]
    async fn test_failure_and_heartbeat_responses() {
        let pump = WriteTagPump(context(Arc::default()));

        let failure = pump.failure("w1".into(), "request timed out".into());
        assert_eq!(failure.request, "w1");
        assert_eq!(envelope(&failure.message), Envelope::failure("request timed out"));

        let heartbeat = pump.heartbeat();
        assert_eq!(heartbeat.request, HEARTBEAT);
        assert!(heartbeat.message.is_empty());
    }
}
