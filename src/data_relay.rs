//! Data-relay plugins.
//!
//! A data relay receives start configurations and proxied HTTP requests from the
//! platform over two long-lived streams and answers them through the [`DataRelay`]
//! trait.

use tonic::async_trait;

use crate::error::BoxError;
use crate::shared::ServiceError;

mod app;
mod client;
/// Connection and identity settings of a data relay.
pub mod config;
mod pumps;

pub use crate::driver::entity::Headers;
pub use app::App;
pub use config::DataRelayConfig;

/// Number of streams a data relay keeps open.
pub const STREAM_COUNT: usize = 2;

pub(crate) struct DataRelayService;

impl ServiceError for DataRelayService {
    fn service_name() -> &'static str {
        "datarelay"
    }
}

/// DataRelay trait for implementing a data-relay plugin.
///
/// Like driver callbacks, every call runs on its own task bounded by the configured
/// timeout, and an `Err` or a panic is reported as a failed request.
#[async_trait]
pub trait DataRelay: Send + Sync + 'static {
    /// Applies a start configuration.
    async fn start(&self, app: &App, config: &[u8]) -> Result<(), BoxError>;

    /// Handles an HTTP request the platform proxies to the relay. The returned bytes
    /// are passed back verbatim.
    async fn http_proxy(
        &self,
        _app: &App,
        _kind: &str,
        _headers: Headers,
        _data: Vec<u8>,
    ) -> Result<Vec<u8>, BoxError> {
        Err("http proxy is not supported by this data relay".into())
    }

    /// Called once when the process is shutting down.
    async fn stop(&self, _app: &App) -> Result<(), BoxError> {
        Ok(())
    }
}
