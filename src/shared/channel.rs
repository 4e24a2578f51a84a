//! Dialing the platform.

use tonic::transport::{Channel, Endpoint};

use crate::error::{Error, ErrorKind, Result};
use crate::shared::config::GrpcConfig;

/// Connects a channel to the endpoint described by `config`.
pub(crate) async fn connect(config: &GrpcConfig) -> Result<Channel> {
    endpoint(config)?.connect().await.map_err(|e| {
        Error::ConnectionError(ErrorKind::NetworkError(format!(
            "connecting to {}: {e}",
            config.address()
        )))
    })
}

fn endpoint(config: &GrpcConfig) -> Result<Endpoint> {
    let endpoint = Endpoint::from_shared(config.address()).map_err(|e| {
        Error::ConnectionError(ErrorKind::ConfigError(format!(
            "invalid platform address {}: {e}",
            config.address()
        )))
    })?;
    Ok(endpoint.connect_timeout(config.timeout()).tcp_nodelay(true))
}
