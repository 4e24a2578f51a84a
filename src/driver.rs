//! Driver plugins.
//!
//! A driver bridges devices and the platform. The platform pushes commands, schema
//! queries, debug and proxy requests over seven long-lived streams; the driver answers
//! them through the [`Driver`] trait and reports readings, warnings and logs through
//! the [`App`].

use serde_json::Value;
use tonic::async_trait;

use crate::error::BoxError;
use crate::shared::ServiceError;

mod app;
mod cache;
mod client;
/// Connection and identity settings of a driver.
pub mod config;
/// Scaling and range checks of numeric readings.
pub mod convert;
/// Types exchanged with the platform.
pub mod entity;
mod pumps;

pub use app::App;
pub use cache::DeviceTableCache;
pub use config::DriverConfig;
pub use entity::{
    BatchCommand, Command, CommandLog, DriverInstruct, Event, Field, FieldValue, Headers,
    Instance, Point, TableData, Tag, TagRange, Warn, WarnRecovery, WritePoint,
};

/// Number of streams a driver keeps open.
pub const STREAM_COUNT: usize = 7;

pub(crate) struct DriverService;

impl ServiceError for DriverService {
    fn service_name() -> &'static str {
        "driver"
    }
}

/// Driver trait for implementing the device side of the platform.
///
/// Every call runs on its own task and is bounded by the configured timeout. An `Err`
/// is reported back to the platform as a failed request; so is a panic.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use iot_plugin_sdk::driver::{App, Command, Driver, DriverConfig};
/// use iot_plugin_sdk::shared::config::Identity;
/// use iot_plugin_sdk::shared::mq::MessageQueue;
/// use iot_plugin_sdk::BoxError;
/// use serde_json::{json, Value};
///
/// struct Stdout;
///
/// #[tonic::async_trait]
/// impl MessageQueue for Stdout {
///     async fn publish(&self, topic: &[String], payload: Vec<u8>) -> Result<(), BoxError> {
///         println!("{} {}", topic.join("/"), String::from_utf8_lossy(&payload));
///         Ok(())
///     }
/// }
///
/// struct Echo;
///
/// #[tonic::async_trait]
/// impl Driver for Echo {
///     async fn schema(&self, _app: &App, _locale: &str) -> Result<String, BoxError> {
///         Ok(r#"{"type": "object"}"#.to_string())
///     }
///
///     async fn start(&self, _app: &App, _config: &[u8]) -> Result<(), BoxError> {
///         Ok(())
///     }
///
///     async fn run(&self, _app: &App, command: Command) -> Result<Value, BoxError> {
///         Ok(json!({"device": command.id}))
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let config = DriverConfig::new("service-1", Identity::new("echo", "Echo driver"));
///     let app = App::new(config, Arc::new(Stdout))?;
///     app.start(Echo).await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Configuration schema of the driver, rendered for `locale`.
    async fn schema(&self, app: &App, locale: &str) -> Result<String, BoxError>;

    /// Applies a start configuration. Called again whenever the configuration changes;
    /// the device table lookup of `app` is already rebuilt when this runs.
    async fn start(&self, app: &App, config: &[u8]) -> Result<(), BoxError>;

    /// Executes a command on one device.
    async fn run(&self, app: &App, command: Command) -> Result<Value, BoxError>;

    /// Writes a tag value to one device.
    async fn write_tag(&self, _app: &App, _command: Command) -> Result<Value, BoxError> {
        Err("write tag is not supported by this driver".into())
    }

    /// Executes a command on several devices of one table.
    async fn batch_run(&self, _app: &App, _command: BatchCommand) -> Result<Value, BoxError> {
        Err("batch run is not supported by this driver".into())
    }

    /// Answers a debug request from the platform console.
    async fn debug(&self, _app: &App, _data: Vec<u8>) -> Result<Value, BoxError> {
        Err("debug is not supported by this driver".into())
    }

    /// Handles an HTTP request the platform proxies to the driver.
    async fn http_proxy(
        &self,
        _app: &App,
        _kind: &str,
        _headers: Headers,
        _data: Vec<u8>,
    ) -> Result<Value, BoxError> {
        Err("http proxy is not supported by this driver".into())
    }

    /// Called once when the process is shutting down.
    async fn stop(&self, _app: &App) -> Result<(), BoxError> {
        Ok(())
    }
}
