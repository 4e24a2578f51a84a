//! Connection configuration shared by every plugin kind.
//!
//! The structs here deserialize from camelCase keys with humantime durations
//! (`"5s"`, `"10m"`), and can also be put together in code with the `with_*` builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between reconnects, pump re-opens and health probes.
pub(crate) const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);

/// Default dial timeout, also used as the per-request callback timeout.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default maximum gRPC message size in MiB.
pub(crate) const DEFAULT_LIMIT_MIB: usize = 100;

const DEFAULT_HEALTH_REQUEST_TIME: Duration = Duration::from_secs(10);
const DEFAULT_HEALTH_RETRY: u32 = 3;
const DEFAULT_MQ_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings of the platform connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GrpcConfig {
    host: String,
    port: u16,
    health: HealthConfig,
    stream: StreamConfig,
    #[serde(with = "humantime_serde")]
    wait_time: Duration,
    #[serde(with = "humantime_serde")]
    timeout: Duration,
    limit: usize,
}

/// Settings of the periodic health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    request_time: Duration,
    retry: u32,
}

/// Settings shared by every stream pump.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// When set, every pump sends a heartbeat sentinel at this interval.
    #[serde(with = "humantime_serde")]
    heartbeat: Option<Duration>,
}

/// Id and display name of a plugin instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Settings of the message bus the App publishes to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqConfig {
    /// Upper bound of a single publish.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_MQ_TIMEOUT,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            request_time: DEFAULT_HEALTH_REQUEST_TIME,
            retry: DEFAULT_HEALTH_RETRY,
        }
    }
}

impl HealthConfig {
    /// Timeout of a single health request.
    pub fn request_time(&self) -> Duration {
        self.request_time
    }

    /// How many more times a failed health request is attempted before giving up.
    pub fn retry(&self) -> u32 {
        self.retry
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 9224)
    }
}

impl GrpcConfig {
    /// Create new configuration for the given endpoint, everything else at defaults.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health: HealthConfig::default(),
            stream: StreamConfig::default(),
            wait_time: DEFAULT_WAIT_TIME,
            timeout: DEFAULT_TIMEOUT,
            limit: DEFAULT_LIMIT_MIB,
        }
    }

    /// Set the host of the platform endpoint.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Set the port of the platform endpoint.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Set the interval between reconnects, pump re-opens and health probes. Default value is 5s.
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Get the interval between reconnects, pump re-opens and health probes.
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Set the dial timeout, which also bounds every user callback. Default value is 600s.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Set the maximum size of an encoded and decoded gRPC message, in MiB. Default value is 100.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Get the maximum size of an encoded and decoded gRPC message in bytes.
    pub fn max_message_size(&self) -> usize {
        self.limit.saturating_mul(1024 * 1024)
    }

    /// Set the timeout of a single health request. Default value is 10s.
    pub fn with_health_request_time(mut self, request_time: Duration) -> Self {
        self.health.request_time = request_time;
        self
    }

    /// Set how many extra attempts a failed health request gets. Default value is 3.
    pub fn with_health_retry(mut self, retry: u32) -> Self {
        self.health.retry = retry;
        self
    }

    pub fn health(&self) -> &HealthConfig {
        &self.health
    }

    /// Send a heartbeat sentinel on every stream at the given interval. Disabled by default.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.stream.heartbeat = Some(interval);
        self
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// URI the channel is dialed at.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_config_defaults() {
        let config = GrpcConfig::new("driver", 9224);

        assert_eq!(config.address(), "http://driver:9224");
        assert_eq!(config.wait_time(), Duration::from_secs(5));
        assert_eq!(config.timeout(), Duration::from_secs(600));
        assert_eq!(config.max_message_size(), 100 * 1024 * 1024);
        assert_eq!(config.health().request_time(), Duration::from_secs(10));
        assert_eq!(config.health().retry(), 3);
        assert_eq!(config.stream().heartbeat(), None);
    }

    #[test]
    fn test_grpc_config_builders() {
        let config = GrpcConfig::new("driver", 9224)
            .with_host("localhost")
            .with_port(1234)
            .with_wait_time(Duration::from_millis(100))
            .with_timeout(Duration::from_secs(1))
            .with_limit(4)
            .with_health_request_time(Duration::from_secs(2))
            .with_health_retry(1)
            .with_heartbeat(Duration::from_secs(30));

        assert_eq!(config.address(), "http://localhost:1234");
        assert_eq!(config.wait_time(), Duration::from_millis(100));
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.max_message_size(), 4 * 1024 * 1024);
        assert_eq!(config.health().request_time(), Duration::from_secs(2));
        assert_eq!(config.health().retry(), 1);
        assert_eq!(config.stream().heartbeat(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_grpc_config_deserialize() -> Result<(), Box<dyn std::error::Error>> {
        let config: GrpcConfig = serde_json::from_str(
            r#"{
                "host": "platform",
                "port": 9000,
                "waitTime": "2s",
                "health": {"retry": 5},
                "stream": {"heartbeat": "30s"}
            }"#,
        )?;

        assert_eq!(config.address(), "http://platform:9000");
        assert_eq!(config.wait_time(), Duration::from_secs(2));
        assert_eq!(config.health().retry(), 5);
        assert_eq!(config.health().request_time(), Duration::from_secs(10));
        assert_eq!(config.stream().heartbeat(), Some(Duration::from_secs(30)));
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        Ok(())
    }

    #[test]
    fn test_mq_config_deserialize() -> Result<(), Box<dyn std::error::Error>> {
        let config: MqConfig = serde_json::from_str(r#"{"timeout": "1m 30s"}"#)?;
        assert_eq!(config.timeout, Duration::from_secs(90));

        let config: MqConfig = serde_json::from_str("{}")?;
        assert_eq!(config.timeout, Duration::from_secs(60));
        Ok(())
    }
}
