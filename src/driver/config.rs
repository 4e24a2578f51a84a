use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shared::config::{GrpcConfig, Identity, MqConfig};
use crate::shared::ServiceError;

use super::DriverService;

/// Default host of the platform driver endpoint.
pub const DEFAULT_HOST: &str = "driver";

/// Default port of the platform driver endpoint.
pub const DEFAULT_PORT: u16 = 9224;

/// Everything a driver needs to reach the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default)]
    pub service_id: String,
    /// Replaced by the group id of the start configuration when that one is set.
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub driver: Identity,
    #[serde(default = "default_driver_grpc")]
    pub driver_grpc: GrpcConfig,
    #[serde(default)]
    pub mq: MqConfig,
}

fn default_project() -> String {
    "default".to_string()
}

fn default_driver_grpc() -> GrpcConfig {
    GrpcConfig::new(DEFAULT_HOST, DEFAULT_PORT)
}

impl DriverConfig {
    pub fn new(service_id: impl Into<String>, driver: Identity) -> Self {
        Self {
            project: default_project(),
            service_id: service_id.into(),
            group_id: String::new(),
            driver,
            driver_grpc: default_driver_grpc(),
            mq: MqConfig::default(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_driver_grpc(mut self, driver_grpc: GrpcConfig) -> Self {
        self.driver_grpc = driver_grpc;
        self
    }

    /// Rejects configurations the platform cannot route.
    pub fn validate(&self) -> Result<()> {
        if self.project.is_empty() {
            return Err(DriverService::config_error("project is empty"));
        }
        if self.service_id.is_empty() {
            return Err(DriverService::config_error("service id is empty"));
        }
        if self.driver.id.is_empty() || self.driver.name.is_empty() {
            return Err(DriverService::config_error("driver id and name are required"));
        }
        Ok(())
    }
}
