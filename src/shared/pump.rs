//! Generic long-lived stream pump.
//!
//! A pump owns one bidirectional stream to the platform. The platform writes requests,
//! the pump hands each one to the plugin on its own task and writes back exactly one
//! correlated response. When the stream ends the pump waits and opens it again, until
//! the connection attempt it belongs to is cancelled.
//!
//! ```text
//!   (supervisor) --token--> (pump loop) ---+---> (respond) ---> (dispatch)
//!                                          |
//!                                          +---> (respond) ---> (dispatch)
//! ```
//!
//! Cancelling the attempt token stops the receive loop, including one waiting on a
//! sequential dispatch or a stream that is still opening. `respond` tasks already
//! running finish and try to deliver their answer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::{async_trait, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::shared::panic;
use crate::shared::tracker::StreamTracker;

/// Request id the platform uses for keep-alive messages. Those are never dispatched.
pub const HEARTBEAT: &str = "heartbeat";

/// Buffer of responses waiting to be written to a stream.
const CHANNEL_SIZE: usize = 1000;

/// One kind of request stream.
#[async_trait]
pub(crate) trait Pump: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Correlation id of an inbound request.
    fn request_id(request: &Self::Request) -> &str;

    /// When true a request is fully handled before the next one is read.
    fn sequential(&self) -> bool {
        false
    }

    /// Opens the stream. Responses written to `outbound` are sent to the platform.
    async fn open(
        &self,
        outbound: ReceiverStream<Self::Response>,
    ) -> Result<Streaming<Self::Request>, Status>;

    /// Runs the plugin callback for one request and renders its outcome.
    async fn dispatch(&self, request: Self::Request) -> Self::Response;

    /// Failure response for a request whose dispatch never completed.
    fn failure(&self, request_id: String, reason: String) -> Self::Response;

    /// Keep-alive message sent when heartbeats are enabled.
    fn heartbeat(&self) -> Self::Response;
}

/// Timing shared by all pumps of a connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpOptions {
    /// Pause before a closed stream is opened again.
    pub(crate) wait_time: Duration,
    /// Upper bound of a single dispatch.
    pub(crate) timeout: Duration,
    pub(crate) heartbeat: Option<Duration>,
}

/// Keeps the stream of `pump` open until `token` is cancelled.
pub(crate) fn spawn_pump<P: Pump>(
    pump: Arc<P>,
    options: PumpOptions,
    tracker: StreamTracker,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if token.is_cancelled() {
                break;
            }
            match run_stream(Arc::clone(&pump), &options, &tracker, &token).await {
                Ok(()) => info!(stream = pump.name(), "stream closed"),
                Err(status) => error!(stream = pump.name(), ?status, "stream failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(options.wait_time) => {}
                _ = token.cancelled() => break,
            }
        }
        info!(stream = pump.name(), "stream pump stopped");
    })
}

/// Opens the stream once and pumps it until it ends.
async fn run_stream<P: Pump>(
    pump: Arc<P>,
    options: &PumpOptions,
    tracker: &StreamTracker,
    token: &CancellationToken,
) -> Result<(), Status> {
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
    let inbound = tokio::select! {
        inbound = pump.open(ReceiverStream::new(rx)) => inbound?,
        _ = token.cancelled() => return Ok(()),
    };

    // released on every exit path below
    let _guard = tracker.register();
    info!(stream = pump.name(), "stream opened");

    pump_messages(pump, inbound, tx, options, token).await
}

/// Receive loop of an open stream.
///
/// Returns `Ok` when the platform closes the stream or `token` is cancelled, and the
/// receive error otherwise.
pub(crate) async fn pump_messages<P, S>(
    pump: Arc<P>,
    mut inbound: S,
    outbound: mpsc::Sender<P::Response>,
    options: &PumpOptions,
    token: &CancellationToken,
) -> Result<(), Status>
where
    P: Pump,
    S: Stream<Item = Result<P::Request, Status>> + Unpin,
{
    let heartbeat_token = token.child_token();
    let _heartbeat_guard = heartbeat_token.clone().drop_guard();
    if let Some(interval) = options.heartbeat {
        tokio::spawn(send_heartbeats(
            Arc::clone(&pump),
            outbound.clone(),
            interval,
            heartbeat_token,
        ));
    }

    loop {
        let next = tokio::select! {
            next = inbound.next() => next,
            _ = token.cancelled() => return Ok(()),
        };

        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(status),
            None => return Ok(()),
        };

        if P::request_id(&request) == HEARTBEAT {
            debug!(stream = pump.name(), "heartbeat received");
            continue;
        }

        let task = tokio::spawn(respond(
            Arc::clone(&pump),
            request,
            outbound.clone(),
            options.timeout,
        ));
        if pump.sequential() {
            // on cancel the task is left detached and still answers
            tokio::select! {
                joined = task => {
                    if let Err(e) = joined {
                        error!(stream = pump.name(), ?e, "respond task failed");
                    }
                }
                _ = token.cancelled() => return Ok(()),
            }
        }
    }
}

/// Dispatches one request and sends its response.
async fn respond<P: Pump>(
    pump: Arc<P>,
    request: P::Request,
    outbound: mpsc::Sender<P::Response>,
    timeout: Duration,
) {
    let request_id = P::request_id(&request).to_string();

    // A new task is spawned to catch the panic
    let mut dispatch_task = tokio::spawn({
        let pump = Arc::clone(&pump);
        async move { pump.dispatch(request).await }
    });

    let response = match tokio::time::timeout(timeout, &mut dispatch_task).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let reason = panic::describe(e);
            error!(stream = pump.name(), request = %request_id, %reason, "dispatch aborted");
            pump.failure(request_id.clone(), reason)
        }
        Err(_) => {
            dispatch_task.abort();
            let reason = format!("request timed out after {timeout:?}");
            warn!(stream = pump.name(), request = %request_id, "dispatch timed out");
            pump.failure(request_id.clone(), reason)
        }
    };

    if let Err(e) = outbound.send(response).await {
        error!(stream = pump.name(), request = %request_id, ?e, "failed to send response");
    }
}

async fn send_heartbeats<P: Pump>(
    pump: Arc<P>,
    outbound: mpsc::Sender<P::Response>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = token.cancelled() => return,
        }
        if outbound.send(pump.heartbeat()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Request `(id, payload)`; a payload of "panic" panics, "slow" sleeps.
    type TestRequest = (String, String);

    /// Response `(id, ok, body)`.
    type TestResponse = (String, bool, String);

    #[derive(Default)]
    struct EchoPump {
        dispatched: AtomicUsize,
        sequential: bool,
        hang_open: bool,
    }

    #[async_trait]
    impl Pump for EchoPump {
        type Request = TestRequest;
        type Response = TestResponse;

        fn name(&self) -> &'static str {
            "echo"
        }

        fn request_id(request: &Self::Request) -> &str {
            &request.0
        }

        fn sequential(&self) -> bool {
            self.sequential
        }

        async fn open(
            &self,
            _outbound: ReceiverStream<Self::Response>,
        ) -> Result<Streaming<Self::Request>, Status> {
            if self.hang_open {
                std::future::pending::<()>().await;
            }
            Err(Status::unimplemented("in-memory pump"))
        }

        async fn dispatch(&self, request: Self::Request) -> Self::Response {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            match request.1.as_str() {
                "panic" => panic!("callback exploded"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    (request.0, true, "late".into())
                }
                body => (request.0, true, body.to_uppercase()),
            }
        }

        fn failure(&self, request_id: String, reason: String) -> Self::Response {
            (request_id, false, reason)
        }

        fn heartbeat(&self) -> Self::Response {
            (HEARTBEAT.to_string(), true, String::new())
        }
    }

    fn options() -> PumpOptions {
        PumpOptions {
            wait_time: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            heartbeat: None,
        }
    }

    fn request(id: &str, body: &str) -> Result<TestRequest, Status> {
        Ok((id.to_string(), body.to_string()))
    }

    async fn collect(
        rx: &mut mpsc::Receiver<TestResponse>,
        n: usize,
    ) -> Vec<TestResponse> {
        let mut responses = Vec::new();
        for _ in 0..n {
            responses.push(rx.recv().await.expect("response"));
        }
        responses.sort();
        responses
    }

    #[tokio::test]
    async fn test_one_response_per_request() {
        let pump = Arc::new(EchoPump::default());
        let inbound = tokio_stream::iter(vec![request("r1", "a"), request("r2", "b")]);
        let (tx, mut rx) = mpsc::channel(10);

        pump_messages(Arc::clone(&pump), inbound, tx, &options(), &CancellationToken::new())
            .await
            .unwrap();

        let responses = collect(&mut rx, 2).await;
        assert_eq!(
            responses,
            vec![
                ("r1".to_string(), true, "A".to_string()),
                ("r2".to_string(), true, "B".to_string())
            ]
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_is_skipped() {
        let pump = Arc::new(EchoPump::default());
        let inbound = tokio_stream::iter(vec![
            request(HEARTBEAT, ""),
            request("r1", "x"),
            request(HEARTBEAT, ""),
        ]);
        let (tx, mut rx) = mpsc::channel(10);

        pump_messages(Arc::clone(&pump), inbound, tx, &options(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(collect(&mut rx, 1).await[0].0, "r1");
        assert!(rx.recv().await.is_none());
        assert_eq!(pump.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_yields_failure_and_loop_continues() {
        let pump = Arc::new(EchoPump::default());
        let inbound = tokio_stream::iter(vec![request("r1", "panic"), request("r2", "ok")]);
        let (tx, mut rx) = mpsc::channel(10);

        pump_messages(Arc::clone(&pump), inbound, tx, &options(), &CancellationToken::new())
            .await
            .unwrap();

        let responses = collect(&mut rx, 2).await;
        assert_eq!(responses[0].0, "r1");
        assert!(!responses[0].1);
        assert!(responses[0].2.contains("callback exploded"));
        assert_eq!(responses[1], ("r2".to_string(), true, "OK".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_failure() {
        let pump = Arc::new(EchoPump::default());
        let inbound = tokio_stream::iter(vec![request("r1", "slow")]);
        let (tx, mut rx) = mpsc::channel(10);

        pump_messages(Arc::clone(&pump), inbound, tx, &options(), &CancellationToken::new())
            .await
            .unwrap();

        let (id, ok, reason) = rx.recv().await.unwrap();
        assert_eq!(id, "r1");
        assert!(!ok);
        assert!(reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_receive_error_ends_loop() {
        let pump = Arc::new(EchoPump::default());
        let inbound = tokio_stream::iter(vec![
            request("r1", "a"),
            Err(Status::unavailable("platform went away")),
            request("r2", "b"),
        ]);
        let (tx, mut rx) = mpsc::channel(10);

        let result =
            pump_messages(Arc::clone(&pump), inbound, tx, &options(), &CancellationToken::new())
                .await;

        assert_eq!(result.unwrap_err().code(), tonic::Code::Unavailable);
        assert_eq!(collect(&mut rx, 1).await[0].0, "r1");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_receive_loop() {
        let pump = Arc::new(EchoPump::default());
        let (in_tx, in_rx) = mpsc::channel(10);
        let inbound = ReceiverStream::new(in_rx);
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();

        let pump_task = tokio::spawn({
            let pump = Arc::clone(&pump);
            let token = token.clone();
            async move { pump_messages(pump, inbound, tx, &options(), &token).await }
        });

        in_tx.send(request("r1", "a")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().0, "r1");

        token.cancel();
        pump_task.await.unwrap().unwrap();
        assert!(in_tx.send(request("r2", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_sequential_pump_keeps_order() {
        let pump = Arc::new(EchoPump {
            sequential: true,
            ..Default::default()
        });
        let requests = (0..20).map(|i| request(&format!("r{i:02}"), "x")).collect::<Vec<_>>();
        let (tx, mut rx) = mpsc::channel(32);

        pump_messages(
            Arc::clone(&pump),
            tokio_stream::iter(requests),
            tx,
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap().0, format!("r{i:02}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_sent_when_enabled() {
        let pump = Arc::new(EchoPump::default());
        let (in_tx, in_rx) = mpsc::channel::<Result<TestRequest, Status>>(1);
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let options = PumpOptions {
            heartbeat: Some(Duration::from_secs(30)),
            ..options()
        };

        let pump_task = tokio::spawn({
            let token = token.clone();
            async move {
                pump_messages(pump, ReceiverStream::new(in_rx), tx, &options, &token).await
            }
        });

        let (id, _, _) = rx.recv().await.unwrap();
        assert_eq!(id, HEARTBEAT);

        drop(in_tx);
        pump_task.await.unwrap().unwrap();
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_does_not_wait_for_sequential_dispatch() {
        let pump = Arc::new(EchoPump {
            sequential: true,
            ..Default::default()
        });
        let (in_tx, in_rx) = mpsc::channel(10);
        let (tx, mut rx) = mpsc::channel(10);
        let token = CancellationToken::new();
        let options = PumpOptions {
            timeout: Duration::from_secs(600),
            ..options()
        };

        let pump_task = tokio::spawn({
            let pump = Arc::clone(&pump);
            let token = token.clone();
            async move {
                pump_messages(pump, ReceiverStream::new(in_rx), tx, &options, &token).await
            }
        });

        in_tx.send(request("r1", "slow")).await.unwrap();
        while pump.dispatched.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let cancelled_at = tokio::time::Instant::now();
        token.cancel();
        pump_task.await.unwrap().unwrap();
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));

        // the in-flight request is still answered once its timeout expires
        let (id, ok, reason) = rx.recv().await.unwrap();
        assert_eq!(id, "r1");
        assert!(!ok);
        assert!(reason.contains("timed out"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stream_open() {
        let pump = Arc::new(EchoPump {
            hang_open: true,
            ..Default::default()
        });
        let tracker = StreamTracker::new(1);
        let token = CancellationToken::new();

        let handle = spawn_pump(pump, options(), tracker.clone(), token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump stops while opening")
            .unwrap();
        assert_eq!(tracker.open_streams(), 0);
    }
}
