//! Liveness watch of a connection.
//!
//! A connection is considered dead, and torn down by the supervisor, when the health
//! RPC keeps failing, when the platform reports the service unknown or a fatal
//! plugin error, or when fewer streams than expected are open.

use std::fmt;

use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tonic::{async_trait, Status};
use tracing::{debug, error, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::shared::config::GrpcConfig;
use crate::shared::tracker::StreamTracker;

/// Serving state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

/// Problem the platform reports about this plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthIssue {
    pub code: String,
    pub message: String,
    /// Fatal issues force a reconnect.
    pub fatal: bool,
}

/// Decoded answer of one health request.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: ServingStatus,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn serving() -> Self {
        Self {
            status: ServingStatus::Serving,
            issues: Vec::new(),
        }
    }

    /// Why the connection should be dropped, if it should.
    pub fn unhealthy_reason(&self) -> Option<String> {
        if self.status == ServingStatus::ServiceUnknown {
            return Some("platform reports the service as unknown".to_string());
        }
        self.issues
            .iter()
            .find(|issue| issue.fatal)
            .map(|issue| format!("platform reports {}: {}", issue.code, issue.message))
    }
}

impl fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Anything that can answer a health request.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> std::result::Result<HealthReport, Status>;
}

/// Probes `probe` until the connection has to be dropped or `token` is cancelled.
///
/// Returns `Ok` only on cancellation.
pub(crate) async fn watch<P: HealthProbe + ?Sized>(
    probe: &P,
    config: &GrpcConfig,
    tracker: &StreamTracker,
    token: &CancellationToken,
) -> Result<()> {
    let wait_time = config.wait_time();
    let retry = config.health().retry();
    let stream_check_period = wait_time * retry.max(1);
    let mut next_stream_check = Instant::now() + stream_check_period;

    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        let Some(report) = probe_with_retry(probe, config, token).await? else {
            return Ok(());
        };

        for issue in &report.issues {
            warn!(%issue, "plugin issue reported by platform");
        }
        if let Some(reason) = report.unhealthy_reason() {
            return Err(Error::HealthError(ErrorKind::ProtocolError(reason)));
        }

        let now = Instant::now();
        if now >= next_stream_check {
            next_stream_check = now + stream_check_period;
            let open = tracker.open_streams();
            debug!(open, expected = tracker.expected(), "stream count check");
            if open < tracker.expected() {
                return Err(Error::HealthError(ErrorKind::InternalError(format!(
                    "only {open} of {} streams are open",
                    tracker.expected()
                ))));
            }
        }

        tokio::select! {
            _ = sleep(wait_time) => {}
            _ = token.cancelled() => return Ok(()),
        }
    }
}

/// One health probe with transport retries. `Ok(None)` means cancelled.
async fn probe_with_retry<P: HealthProbe + ?Sized>(
    probe: &P,
    config: &GrpcConfig,
    token: &CancellationToken,
) -> Result<Option<HealthReport>> {
    let attempts = config.health().retry() + 1;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let outcome = timeout(config.health().request_time(), probe.check()).await;
        match outcome {
            Ok(Ok(report)) => return Ok(Some(report)),
            Ok(Err(status)) => last_error = status.to_string(),
            Err(_) => last_error = "health request timed out".to_string(),
        }
        error!(attempt, attempts, error = %last_error, "health check failed");

        tokio::select! {
            _ = sleep(config.wait_time()) => {}
            _ = token.cancelled() => return Ok(None),
        }
    }

    Err(Error::HealthError(ErrorKind::NetworkError(format!(
        "health check failed {attempts} times: {last_error}"
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted answers, repeating the last one forever.
    struct ScriptedProbe {
        script: Mutex<Vec<std::result::Result<HealthReport, Status>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(script: Vec<std::result::Result<HealthReport, Status>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self) -> std::result::Result<HealthReport, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn config() -> GrpcConfig {
        GrpcConfig::new("localhost", 9224)
            .with_wait_time(Duration::from_secs(1))
            .with_health_retry(2)
    }

    fn report(status: ServingStatus, issues: Vec<HealthIssue>) -> HealthReport {
        HealthReport { status, issues }
    }

    #[test]
    fn test_unhealthy_reason() {
        assert!(HealthReport::serving().unhealthy_reason().is_none());
        assert!(report(ServingStatus::NotServing, vec![])
            .unhealthy_reason()
            .is_none());
        assert!(report(ServingStatus::ServiceUnknown, vec![])
            .unhealthy_reason()
            .is_some());

        let warning = HealthIssue {
            code: "RUN".into(),
            message: "slow".into(),
            fatal: false,
        };
        assert!(report(ServingStatus::Serving, vec![warning.clone()])
            .unhealthy_reason()
            .is_none());

        let fatal = HealthIssue {
            code: "START".into(),
            message: "driver not started".into(),
            fatal: true,
        };
        let reason = report(ServingStatus::Serving, vec![warning, fatal])
            .unhealthy_reason()
            .unwrap();
        assert!(reason.contains("START"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_unknown_ends_watch() {
        let probe = ScriptedProbe::new(vec![
            Ok(HealthReport::serving()),
            Ok(report(ServingStatus::ServiceUnknown, vec![])),
        ]);
        let tracker = StreamTracker::new(0);

        let err = watch(&probe, &config(), &tracker, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HealthError(ErrorKind::ProtocolError(_))));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let probe = ScriptedProbe::new(vec![Err(Status::unavailable("connection refused"))]);
        let tracker = StreamTracker::new(0);
        let started = Instant::now();

        let err = watch(&probe, &config(), &tracker, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HealthError(ErrorKind::NetworkError(_))));
        // retry = 2 gives three attempts, each followed by a wait
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_recovers() {
        let probe = ScriptedProbe::new(vec![
            Err(Status::unavailable("blip")),
            Ok(HealthReport::serving()),
            Ok(report(ServingStatus::ServiceUnknown, vec![])),
        ]);
        let tracker = StreamTracker::new(0);

        let err = watch(&probe, &config(), &tracker, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HealthError(ErrorKind::ProtocolError(_))));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_streams_end_watch() {
        let probe = ScriptedProbe::new(vec![Ok(HealthReport::serving())]);
        let tracker = StreamTracker::new(2);
        let _only_one = tracker.register();
        let started = Instant::now();

        let err = watch(&probe, &config(), &tracker, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::HealthError(ErrorKind::InternalError(_))));
        // the count is compared every wait_time * retry
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_watch() {
        let probe = ScriptedProbe::new(vec![Ok(HealthReport::serving())]);
        let tracker = StreamTracker::new(1);
        let _guard = tracker.register();
        let token = CancellationToken::new();

        let canceller = tokio::spawn({
            let token = token.clone();
            async move {
                sleep(Duration::from_secs(30)).await;
                token.cancel();
            }
        });

        watch(&probe, &config(), &tracker, &token).await.unwrap();
        canceller.await.unwrap();
        assert!(probe.calls.load(Ordering::SeqCst) >= 30);
    }
}
