//! Device to table lookup built from the driver start configuration.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::error::Result;
use crate::shared::ServiceError;

use super::entity::Instance;
use super::DriverService;

/// Maps every configured device to the tables it is listed under. The whole map is
/// replaced on every start configuration; readers never see a half-built map.
#[derive(Debug, Default)]
pub struct DeviceTableCache {
    devices: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl DeviceTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cache with the devices listed in `instance`.
    pub fn rebuild(&self, instance: &Instance) {
        let mut devices: HashMap<String, BTreeSet<String>> = HashMap::new();
        for table in &instance.tables {
            for device in &table.devices {
                devices
                    .entry(device.id.clone())
                    .or_default()
                    .insert(table.id.clone());
            }
        }

        let mut guard = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        *guard = devices;
    }

    /// Table of `device`. Fails when the device is not configured or is configured
    /// under more than one table.
    pub fn resolve(&self, device: &str) -> Result<String> {
        let guard = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        let tables = guard.get(device).map(|tables| tables.iter().collect::<Vec<_>>());
        match tables.as_deref() {
            None | Some([]) => Err(DriverService::validation_error(format!(
                "device {device} is not configured under any table"
            ))),
            Some([table]) => Ok(table.to_string()),
            Some(tables) => Err(DriverService::validation_error(format!(
                "device {device} is configured under {} tables {tables:?}, the table id must be given",
                tables.len()
            ))),
        }
    }

    /// Number of tables `device` is configured under.
    pub fn table_count(&self, device: &str) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .map_or(0, BTreeSet::len)
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
