//! The two request streams of a data relay.
//!
//! Answers travel as `Result { status, info, detail, result }`; `status` tells success
//! from failure and `detail` carries the error text.

use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{async_trait, Status, Streaming};

use crate::proto::data_relay as proto;
use crate::proto::data_relay::data_relay_service_client::DataRelayServiceClient;
use crate::shared::metadata::StreamMetadata;
use crate::shared::pump::{Pump, HEARTBEAT};

use super::{App, DataRelay, Headers};

const INFO_OK: &str = "ok";
const INFO_FAILED: &str = "execution failed";
const INFO_BAD_HEADERS: &str = "invalid request headers";

/// State shared by both pumps of one connection attempt.
pub(crate) struct PumpContext<T> {
    pub(crate) app: App,
    pub(crate) relay: Arc<T>,
    pub(crate) client: DataRelayServiceClient<Channel>,
    pub(crate) metadata: StreamMetadata,
}

fn success(request: String, result: Vec<u8>) -> proto::Result {
    proto::Result {
        request,
        status: true,
        info: INFO_OK.to_string(),
        detail: String::new(),
        result,
    }
}

fn failure(request: String, info: &str, detail: String) -> proto::Result {
    proto::Result {
        request,
        status: false,
        info: info.to_string(),
        detail,
        result: Vec::new(),
    }
}

fn heartbeat() -> proto::Result {
    proto::Result {
        request: HEARTBEAT.to_string(),
        status: true,
        ..Default::default()
    }
}

pub(crate) struct StartPump<T>(pub(crate) Arc<PumpContext<T>>);

#[async_trait]
impl<T: DataRelay> Pump for StartPump<T> {
    type Request = proto::StartRequest;
    type Response = proto::Result;

    fn name(&self) -> &'static str {
        "start"
    }

    fn request_id(request: &Self::Request) -> &str {
        &request.request
    }

    async fn open(
        &self,
        outbound: ReceiverStream<Self::Response>,
    ) -> Result<Streaming<Self::Request>, Status> {
        let request = self.0.metadata.request(outbound)?;
        Ok(self.0.client.clone().start_stream(request).await?.into_inner())
    }

    async fn dispatch(&self, request: Self::Request) -> Self::Response {
        match self.0.relay.start(&self.0.app, &request.data).await {
            Ok(()) => success(request.request, Vec::new()),
            Err(e) => failure(request.request, INFO_FAILED, e.to_string()),
        }
    }

    fn failure(&self, request_id: String, reason: String) -> Self::Response {
        failure(request_id, INFO_FAILED, reason)
    }

    fn heartbeat(&self) -> Self::Response {
        heartbeat()
    }
}

pub(crate) struct HttpProxyPump<T>(pub(crate) Arc<PumpContext<T>>);

#[async_trait]
impl<T: DataRelay> Pump for HttpProxyPump<T> {
    type Request = proto::HttpProxyRequest;
    type Response = proto::Result;

    fn name(&self) -> &'static str {
        "http_proxy"
    }

    fn request_id(request: &Self::Request) -> &str {
        &request.request
    }

    async fn open(
        &self,
        outbound: ReceiverStream<Self::Response>,
    ) -> Result<Streaming<Self::Request>, Status> {
        let request = self.0.metadata.request(outbound)?;
        Ok(self.0.client.clone().http_proxy_stream(request).await?.into_inner())
    }

    async fn dispatch(&self, request: Self::Request) -> Self::Response {
        let headers: Headers = if request.headers.is_empty() {
            Headers::default()
        } else {
            match serde_json::from_slice(&request.headers) {
                Ok(headers) => headers,
                Err(e) => return failure(request.request, INFO_BAD_HEADERS, e.to_string()),
            }
        };

        let ctx = &self.0;
        match ctx.relay.http_proxy(&ctx.app, &request.r#type, headers, request.data).await {
            Ok(result) => success(request.request, result),
            Err(e) => failure(request.request, INFO_FAILED, e.to_string()),
        }
    }

    fn failure(&self, request_id: String, reason: String) -> Self::Response {
        failure(request_id, INFO_FAILED, reason)
    }

    fn heartbeat(&self) -> Self::Response {
        heartbeat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_relay::DataRelayConfig;
    use crate::error::BoxError;
    use crate::shared::config::Identity;
    use crate::shared::mq::testing::RecordingQueue;
    use crate::shared::pump::{pump_messages, PumpOptions};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tonic::transport::Endpoint;

    struct Relay;

    #[async_trait]
    impl DataRelay for Relay {
        async fn start(&self, _app: &App, config: &[u8]) -> std::result::Result<(), BoxError> {
            match config {
                b"panic" => panic!("relay crashed"),
                b"" => Err("empty configuration".into()),
                _ => Ok(()),
            }
        }

        async fn http_proxy(
            &self,
            _app: &App,
            kind: &str,
            headers: Headers,
            data: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, BoxError> {
            let mut body = format!("{kind}:{}:", headers.len()).into_bytes();
            body.extend(data);
            Ok(body)
        }
    }

    fn context() -> Arc<PumpContext<Relay>> {
        let config = DataRelayConfig::new("relay-1", Identity::new("http", "HTTP"));
        let app = App::new(config, Arc::new(RecordingQueue::default())).unwrap();
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        Arc::new(PumpContext {
            app,
            relay: Arc::new(Relay),
            client: DataRelayServiceClient::new(channel),
            metadata: StreamMetadata::new(),
        })
    }

    fn start_request(id: &str, data: &[u8]) -> proto::StartRequest {
        proto::StartRequest {
            request: id.to_string(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_start_results() {
        let pump = StartPump(context());
        assert!(!pump.sequential());

        let ok = pump.dispatch(start_request("s1", b"{}")).await;
        assert_eq!((ok.request.as_str(), ok.status, ok.info.as_str()), ("s1", true, "ok"));

        let failed = pump.dispatch(start_request("s2", b"")).await;
        assert!(!failed.status);
        assert_eq!(failed.info, INFO_FAILED);
        assert_eq!(failed.detail, "empty configuration");
    }

    #[tokio::test]
    async fn test_panicking_start_answers_failure() {
        let pump = Arc::new(StartPump(context()));
        let inbound = tokio_stream::iter(vec![
            Ok(start_request("s1", b"panic")),
            Ok(start_request(HEARTBEAT, b"")),
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

        let response = rx.recv().await.unwrap();
        assert_eq!(response.request, "s1");
        assert!(!response.status);
        assert!(response.detail.contains("relay crashed"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_http_proxy() {
        let pump = HttpProxyPump(context());

        let ok = pump
            .dispatch(proto::HttpProxyRequest {
                request: "h1".into(),
                r#type: "POST".into(),
                headers: br#"{"Content-Type": ["text/plain"]}"#.to_vec(),
                data: b"hello".to_vec(),
            })
            .await;
        assert!(ok.status);
        assert_eq!(ok.result, b"POST:1:hello");

        let no_headers = pump
            .dispatch(proto::HttpProxyRequest {
                request: "h2".into(),
                r#type: "GET".into(),
                ..Default::default()
            })
            .await;
        assert_eq!(no_headers.result, b"GET:0:");

        let bad = pump
            .dispatch(proto::HttpProxyRequest {
                request: "h3".into(),
                headers: b"[".to_vec(),
                ..Default::default()
            })
            .await;
        assert!(!bad.status);
        assert_eq!(bad.info, INFO_BAD_HEADERS);
        assert_eq!(bad.request, "h3");
    }

    #[tokio::test]
    async fn test_heartbeat_response() {
        let pump = HttpProxyPump(context());
        let heartbeat = pump.heartbeat();
        assert_eq!(heartbeat.request, HEARTBEAT);
        assert!(heartbeat.result.is_empty());
    }
}
