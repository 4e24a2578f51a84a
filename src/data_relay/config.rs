use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shared::config::{GrpcConfig, Identity, MqConfig};
use crate::shared::ServiceError;

use super::DataRelayService;

/// Default host of the platform data-relay endpoint.
pub const DEFAULT_HOST: &str = "data-relay";

/// Default port of the platform data-relay endpoint.
pub const DEFAULT_PORT: u16 = 9232;

/// Everything a data relay needs to reach the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRelayConfig {
    #[serde(default = "default_project")]
    pub project: String,
    /// Instance id of this relay, sent as `instanceid` on every stream.
    #[serde(default)]
    pub service_id: String,
    /// Relay type; its id doubles as the type of health requests.
    #[serde(default)]
    pub service: Identity,
    #[serde(default = "default_data_relay_grpc")]
    pub data_relay_grpc: GrpcConfig,
    #[serde(default)]
    pub mq: MqConfig,
}

fn default_project() -> String {
    "default".to_string()
}

fn default_data_relay_grpc() -> GrpcConfig {
    GrpcConfig::new(DEFAULT_HOST, DEFAULT_PORT)
}

impl DataRelayConfig {
    pub fn new(service_id: impl Into<String>, service: Identity) -> Self {
        Self {
            project: default_project(),
            service_id: service_id.into(),
            service,
            data_relay_grpc: default_data_relay_grpc(),
            mq: MqConfig::default(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_data_relay_grpc(mut self, data_relay_grpc: GrpcConfig) -> Self {
        self.data_relay_grpc = data_relay_grpc;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(DataRelayService::config_error("project is empty"));
        }
        if self.service_id.is_empty() {
            return Err(DataRelayService::config_error("instance id is empty"));
        }
        if self.service.id.is_empty() || self.service.name.is_empty() {
            return Err(DataRelayService::config_error("service id and name are required"));
        }
        Ok(())
    }
}
