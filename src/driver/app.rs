use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{Local, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Number, Value};
use tokio::sync::oneshot;
use tonic::metadata::AsciiMetadataValue;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::proto::driver as proto;
use crate::shared::logging;
use crate::shared::mq::MessageQueue;
use crate::shared::signal::shutdown_signal;
use crate::shared::supervisor::{ConnectionSlot, Supervisor};
use crate::shared::ServiceError;

use super::cache::DeviceTableCache;
use super::client::{DriverConnection, DriverConnector};
use super::config::DriverConfig;
use super::convert::{Converter, DefaultConverter};
use super::entity::{
    CommandLog, DriverInstruct, Event, Field, FieldValue, IdRef, Instance, Point, TableData,
    Warn, WarnRecovery, WarnRecoveryData, WarnRecoverySend, WarnSend, WritePoint,
};
use super::{Driver, DriverService};

/// Smallest accepted point time, in milliseconds.
const MIN_UNIX_MILLIS: i64 = 1_000_000_000_000;

/// Point times must stay below this, in milliseconds.
const MAX_UNIX_MILLIS: i64 = 10_000_000_000_000;

const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Metadata key naming the project of instruct requests.
const X_REQUEST_PROJECT: &str = "x-request-project";

/// Default source of published points.
const SOURCE_DEVICE: &str = "device";

/// Handle a driver uses to talk back to the platform. Cheap to clone.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

struct AppInner {
    config: DriverConfig,
    mq: Arc<dyn MessageQueue>,
    converter: Arc<dyn Converter>,
    devices: DeviceTableCache,
    group_id: RwLock<String>,
    /// Last kept value per `table__device__tag`, consulted by range checks.
    values: Mutex<HashMap<String, f64>>,
    connection: ConnectionSlot<DriverConnection>,
}

impl App {
    /// Creates the App with the default converter.
    pub fn new(config: DriverConfig, mq: Arc<dyn MessageQueue>) -> Result<Self> {
        Self::with_converter(config, mq, Arc::new(DefaultConverter))
    }

    pub fn with_converter(
        config: DriverConfig,
        mq: Arc<dyn MessageQueue>,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        config.validate()?;
        let group_id = RwLock::new(config.group_id.clone());
        Ok(Self {
            inner: Arc::new(AppInner {
                config,
                mq,
                converter,
                devices: DeviceTableCache::new(),
                group_id,
                values: Mutex::new(HashMap::new()),
                connection: ConnectionSlot::new(),
            }),
        })
    }

    /// Connects to the platform and serves the driver until SIGINT or SIGTERM.
    pub async fn start<T: Driver>(&self, driver: T) -> Result<()> {
        self.serve(driver, None).await
    }

    /// Same as [`App::start`], but also stops when `shutdown_rx` fires.
    pub async fn start_with_shutdown<T: Driver>(
        &self,
        driver: T,
        shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        self.serve(driver, Some(shutdown_rx)).await
    }

    async fn serve<T: Driver>(
        &self,
        driver: T,
        shutdown_rx: Option<oneshot::Receiver<()>>,
    ) -> Result<()> {
        let driver = Arc::new(driver);
        let config = &self.inner.config;
        info!(
            project = %config.project,
            driver = %config.driver.id,
            name = %config.driver.name,
            "starting driver"
        );

        let supervisor = Supervisor::start(
            DriverConnector::new(self.clone(), Arc::clone(&driver)),
            config.driver_grpc.clone(),
            self.inner.connection.clone(),
        );

        shutdown_signal(shutdown_rx).await;
        info!(driver = %config.driver.id, "stopping driver");

        if let Err(e) = driver.stop(self).await {
            error!(driver = %config.driver.id, error = %e, "driver stop failed");
        }
        supervisor.stop().await;
        Ok(())
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn project_id(&self) -> &str {
        &self.inner.config.project
    }

    pub fn service_id(&self) -> &str {
        &self.inner.config.service_id
    }

    /// Group of the running instance, as set by the latest start configuration.
    pub fn group_id(&self) -> String {
        self.inner
            .group_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mq(&self) -> Arc<dyn MessageQueue> {
        Arc::clone(&self.inner.mq)
    }

    /// Device to table lookup of the latest start configuration.
    pub fn devices(&self) -> &DeviceTableCache {
        &self.inner.devices
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.connection.is_connected().await
    }

    /// Applies the SDK part of a start configuration: device tables, group and log
    /// verbosity.
    pub(crate) fn apply_instance(&self, config: &[u8]) -> Result<Instance> {
        let instance: Instance = serde_json::from_slice(config)
            .map_err(|e| DriverService::protocol_error(format!("invalid start configuration: {e}")))?;

        self.inner.devices.rebuild(&instance);
        if !instance.group_id.is_empty() {
            *self
                .inner
                .group_id
                .write()
                .unwrap_or_else(PoisonError::into_inner) = instance.group_id.clone();
        }
        if let Some(debug) = instance.debug {
            logging::set_debug(debug);
        }

        info!(
            group = %self.group_id(),
            tables = instance.tables.len(),
            devices = self.inner.devices.len(),
            "start configuration applied"
        );
        Ok(instance)
    }

    /// Publishes the readings of one device.
    ///
    /// The table is looked up when the point does not name one. Null readings, tags
    /// without id and non-finite numbers are skipped; at least one field has to
    /// survive. A time of 0 means now, any other time has to be a 13 digit millisecond
    /// timestamp.
    pub async fn write_points(&self, point: Point) -> Result<()> {
        if point.id.is_empty() {
            return Err(DriverService::validation_error("device id is empty"));
        }
        let table = match point.table.as_deref().filter(|t| !t.is_empty()) {
            Some(table) => table.to_string(),
            None => self.inner.devices.resolve(&point.id)?,
        };
        if point.fields.is_empty() {
            return Err(DriverService::validation_error(format!(
                "point of device {} has no fields",
                point.id
            )));
        }

        let fields = self.convert_fields(&table, &point.id, point.fields);
        if fields.is_empty() {
            return Err(DriverService::validation_error(format!(
                "point of device {} has no valid fields",
                point.id
            )));
        }

        self.save_points(
            &table,
            WritePoint {
                id: point.id,
                cid: point.cid.unwrap_or_default(),
                source: SOURCE_DEVICE.to_string(),
                unix_time: point.unix_time,
                fields,
                field_types: point.field_types,
            },
        )
        .await
    }

    /// Publishes an already converted point to `data/{project}/{table}/{device}`.
    ///
    /// Times follow the same rules as [`App::write_points`].
    pub async fn save_points(&self, table: &str, mut point: WritePoint) -> Result<()> {
        if table.is_empty() {
            return Err(DriverService::validation_error("table id is empty"));
        }
        if point.id.is_empty() {
            return Err(DriverService::validation_error("device id is empty"));
        }
        if point.fields.is_empty() {
            return Err(DriverService::validation_error(format!(
                "point of device {} has no fields",
                point.id
            )));
        }
        if point.source.is_empty() {
            point.source = SOURCE_DEVICE.to_string();
        }
        point.unix_time = normalize_unix_time(point.unix_time)?;

        debug!(table, device = %point.id, fields = point.fields.len(), "publishing point");
        let topic = self.topic(&["data", table, point.id.as_str()]);
        self.publish(topic, encode(&point)?).await
    }

    /// Publishes a warning to `warningStorage/{project}/{table}/{device}`.
    pub async fn write_warning(&self, warning: &Warn) -> Result<()> {
        if warning.table_data_id.is_empty() {
            return Err(DriverService::validation_error("warning device id is empty"));
        }
        let table = match warning.table_id.as_deref().filter(|t| !t.is_empty()) {
            Some(table) => table.to_string(),
            None => self.inner.devices.resolve(&warning.table_data_id)?,
        };
        let send = WarnSend {
            id: &warning.id,
            table: IdRef { id: &table },
            table_data: IdRef {
                id: &warning.table_data_id,
            },
            level: &warning.level,
            rule_id: &warning.rule_id,
            fields: &warning.fields,
            warning_type: &warning.warning_type,
            processed: &warning.processed,
            time: warning.time.unwrap_or_else(Local::now).to_rfc3339(),
            alert: warning.alert,
            status: &warning.status,
            handle: warning.handle,
            desc: &warning.desc,
        };

        let topic = self.topic(&["warningStorage", table.as_str(), warning.table_data_id.as_str()]);
        self.publish(topic, encode(&send)?).await
    }

    /// Publishes a warning recovery to `warningUpdate/{project}/{table}/{device}`.
    pub async fn write_warning_recovery(
        &self,
        table: &str,
        device: &str,
        recovery: &WarnRecovery,
    ) -> Result<()> {
        if table.is_empty() || device.is_empty() {
            return Err(DriverService::validation_error(format!(
                "warning recovery needs a table and a device, got {table:?} and {device:?}"
            )));
        }
        if recovery.ids.is_empty() {
            return Err(DriverService::validation_error("warning recovery has no warning ids"));
        }
        let send = WarnRecoverySend {
            id: &recovery.ids,
            data: WarnRecoveryData {
                time: recovery.time.unwrap_or_else(Local::now).to_rfc3339(),
                fields: &recovery.fields,
            },
        };

        let topic = self.topic(&["warningUpdate", table, device]);
        self.publish(topic, encode(&send)?).await
    }

    pub async fn log_debug(&self, table: &str, device: &str, message: impl Serialize) -> Result<()> {
        self.log("debug", table, device, message).await
    }

    pub async fn log_info(&self, table: &str, device: &str, message: impl Serialize) -> Result<()> {
        self.log("info", table, device, message).await
    }

    pub async fn log_warn(&self, table: &str, device: &str, message: impl Serialize) -> Result<()> {
        self.log("warn", table, device, message).await
    }

    pub async fn log_error(&self, table: &str, device: &str, message: impl Serialize) -> Result<()> {
        self.log("error", table, device, message).await
    }

    /// Publishes a device log line to `logs/{project}/{level}/{table}/{device}`.
    async fn log(&self, level: &str, table: &str, device: &str, message: impl Serialize) -> Result<()> {
        let line = json!({
            "time": Local::now().format(LOG_TIME_FORMAT).to_string(),
            "message": serde_json::to_value(message)
                .map_err(|e| Error::PublishError(ErrorKind::ValidationError(e.to_string())))?,
        });
        let topic = vec![
            "logs".to_string(),
            self.project_id().to_string(),
            level.to_string(),
            table.to_string(),
            device.to_string(),
        ];
        self.publish(topic, encode(&line)?).await
    }

    /// Reports an event raised by a device.
    pub async fn write_event(&self, event: &Event) -> Result<()> {
        let request = self.request(encode(event)?);
        let response = self.connection().await?.client().event(request).await?;
        check_response(response.into_inner()).map(|_| ())
    }

    /// Records the execution of a command.
    pub async fn run_log(&self, log: &CommandLog) -> Result<()> {
        let request = self.request(encode(log)?);
        let response = self.connection().await?.client().command_log(request).await?;
        check_response(response.into_inner()).map(|_| ())
    }

    /// Partially updates the record of a device.
    pub async fn update_table_data(
        &self,
        table: &str,
        device: &str,
        data: Map<String, Value>,
    ) -> Result<()> {
        let update = TableData {
            table_id: table.to_string(),
            id: device.to_string(),
            data,
        };
        let request = self.request(encode(&update)?);
        let response = self
            .connection()
            .await?
            .client()
            .update_table_data(request)
            .await?;
        check_response(response.into_inner()).map(|_| ())
    }

    /// Fetches the record of a device.
    pub async fn find_device<T: DeserializeOwned>(&self, table: &str, device: &str) -> Result<T> {
        let request = proto::TableDataRequest {
            project: self.project_id().to_string(),
            table_id: table.to_string(),
            id: device.to_string(),
        };
        let response = self
            .connection()
            .await?
            .client()
            .find_table_data(request)
            .await?;
        decode(check_response(response.into_inner())?)
    }

    /// Fetches the commands queued for a device.
    pub async fn get_commands<T: DeserializeOwned>(&self, table: &str, device: &str) -> Result<T> {
        let request = self.project_request(proto::RequestCommand {
            table_id: table.to_string(),
            table_data_id: device.to_string(),
        })?;
        let response = self
            .connection()
            .await?
            .instruct()
            .get_commands(request)
            .await?;
        decode(check_response(response.into_inner())?)
    }

    /// Updates the state of a queued command.
    pub async fn update_command(&self, id: &str, instruct: &DriverInstruct) -> Result<()> {
        let request = self.project_request(proto::UpdateRequest {
            id: id.to_string(),
            data: encode(instruct)?,
        })?;
        let response = self.connection().await?.instruct().update(request).await?;
        check_response(response.into_inner()).map(|_| ())
    }

    fn convert_fields(&self, table: &str, device: &str, fields: Vec<Field>) -> Map<String, Value> {
        let mut converted = Map::new();
        for Field { tag, value } in fields {
            if tag.id.trim().is_empty() {
                error!(table, device, tag = %tag.name, "tag id is empty, field skipped");
                continue;
            }
            let number = match value {
                FieldValue::Null => {
                    warn!(table, device, tag = %tag.id, "null value skipped");
                    continue;
                }
                FieldValue::Text(s) => {
                    converted.insert(tag.id, Value::String(s));
                    continue;
                }
                FieldValue::Bytes(b) => {
                    converted.insert(tag.id, Value::String(format!("hex__{}", hex::encode(b))));
                    continue;
                }
                FieldValue::Bool(b) => f64::from(u8::from(b)),
                FieldValue::Int(i) => i as f64,
                FieldValue::Float(f) => f,
            };
            if !number.is_finite() {
                error!(table, device, tag = %tag.id, value = number, "non-finite value skipped");
                continue;
            }

            let value = self.inner.converter.value(&tag, number);
            let Some(range) = tag.range.as_ref().filter(|r| r.is_enabled()) else {
                insert_number(&mut converted, tag.id.clone(), value);
                continue;
            };

            let key = format!("{table}__{device}__{}", tag.id);
            let outcome = {
                let mut values = self.inner.values.lock().unwrap_or_else(PoisonError::into_inner);
                let outcome = self.inner.converter.range(range, values.get(&key).copied(), value);
                if let (Some(kept), true) = (outcome.value, outcome.save) {
                    values.insert(key, kept);
                }
                outcome
            };
            if let Some(kept) = outcome.value {
                insert_number(&mut converted, tag.id.clone(), kept);
            }
            if let Some(raw) = outcome.raw {
                insert_number(&mut converted, format!("{}__invalid", tag.id), raw);
            }
            if let Some(kind) = outcome.invalid_type {
                converted.insert(format!("{}__invalid__type", tag.id), Value::String(kind));
            }
        }
        converted
    }

    fn topic(&self, segments: &[&str]) -> Vec<String> {
        let mut topic = Vec::with_capacity(segments.len() + 1);
        topic.push(segments[0].to_string());
        topic.push(self.project_id().to_string());
        topic.extend(segments[1..].iter().map(|s| s.to_string()));
        topic
    }

    async fn publish(&self, topic: Vec<String>, payload: Vec<u8>) -> Result<()> {
        let timeout = self.inner.config.mq.timeout;
        match tokio::time::timeout(timeout, self.inner.mq.publish(&topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::PublishError(ErrorKind::NetworkError(format!(
                "publishing to {}: {e}",
                topic.join("/")
            )))),
            Err(_) => Err(Error::PublishError(ErrorKind::TimeoutError(format!(
                "publishing to {} took longer than {timeout:?}",
                topic.join("/")
            )))),
        }
    }

    async fn connection(&self) -> Result<DriverConnection> {
        self.inner.connection.current().await.ok_or_else(|| {
            Error::ConnectionError(ErrorKind::NetworkError(
                "not connected to the platform".to_string(),
            ))
        })
    }

    fn request(&self, data: Vec<u8>) -> proto::Request {
        proto::Request {
            project: self.project_id().to_string(),
            data,
        }
    }

    fn project_request<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let project = AsciiMetadataValue::try_from(self.project_id())
            .map_err(|e| DriverService::config_error(format!("project is not valid metadata: {e}")))?;
        let mut request = tonic::Request::new(message);
        request.metadata_mut().insert(X_REQUEST_PROJECT, project);
        Ok(request)
    }
}

/// Resolves 0 to now and rejects times that are not 13 digit millisecond timestamps.
fn normalize_unix_time(unix_time: i64) -> Result<i64> {
    if unix_time == 0 {
        return Ok(Utc::now().timestamp_millis());
    }
    if (MIN_UNIX_MILLIS..MAX_UNIX_MILLIS).contains(&unix_time) {
        return Ok(unix_time);
    }
    Err(DriverService::validation_error(format!(
        "time {unix_time} is not a millisecond timestamp"
    )))
}

fn insert_number(fields: &mut Map<String, Value>, key: String, value: f64) {
    match Number::from_f64(value) {
        Some(number) => {
            fields.insert(key, Value::Number(number));
        }
        None => error!(field = %key, value, "converted value is not finite, field skipped"),
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| DriverService::validation_error(format!("encoding payload: {e}")))
}

fn decode<T: DeserializeOwned>(response: proto::Response) -> Result<T> {
    serde_json::from_slice(&response.result)
        .map_err(|e| DriverService::protocol_error(format!("decoding platform response: {e}")))
}

fn check_response(response: proto::Response) -> Result<proto::Response> {
    if response.status {
        return Ok(response);
    }
    Err(DriverService::protocol_error(format!(
        "platform rejected request: {} {}",
        response.info, response.detail
    )))
}
