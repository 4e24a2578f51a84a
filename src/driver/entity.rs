//! Types exchanged between the platform, the SDK and a driver.

use std::collections::HashMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Headers of a proxied HTTP request, every name mapped to all of its values.
pub type Headers = HashMap<String, Vec<String>>;

/// A command addressed to one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub table: String,
    pub id: String,
    pub serial_no: String,
    /// Driver specific command body, usually JSON.
    pub command: Vec<u8>,
}

/// A command addressed to several devices of one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchCommand {
    pub table: String,
    pub ids: Vec<String>,
    pub serial_no: String,
    pub command: Vec<u8>,
}

/// The part of a driver start configuration the SDK itself reads. Drivers parse the
/// full configuration for their own settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub group_id: String,
    /// Switches debug log output on or off when present.
    pub debug: Option<bool>,
    pub tables: Vec<InstanceTable>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTable {
    pub id: String,
    pub devices: Vec<InstanceDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceDevice {
    pub id: String,
}

/// Definition of a data point of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tag {
    pub id: String,
    pub name: String,
    /// Decimal places numeric readings are rounded to.
    pub fixed: Option<u32>,
    pub range: Option<TagRange>,
}

/// Window numeric readings of a tag are expected in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagRange {
    /// Absent means enabled.
    pub enable: Option<bool>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl TagRange {
    pub fn is_enabled(&self) -> bool {
        self.enable.unwrap_or(true)
    }
}

/// A raw reading.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// One reading of one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub tag: Tag,
    pub value: FieldValue,
}

impl Field {
    pub fn new(tag: Tag, value: impl Into<FieldValue>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }
}

/// Readings of one device at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    /// Table of the device. Looked up from the start configuration when `None`.
    pub table: Option<String>,
    pub id: String,
    pub cid: Option<String>,
    /// Milliseconds since the epoch; 0 stands for now.
    pub unix_time: i64,
    pub fields: Vec<Field>,
    pub field_types: HashMap<String, String>,
}

impl Point {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_unix_time(mut self, unix_time: i64) -> Self {
        self.unix_time = unix_time;
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }
}

/// Telemetry message published to the data topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePoint {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cid: String,
    pub source: String,
    #[serde(rename = "time")]
    pub unix_time: i64,
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_types: HashMap<String, String>,
}

/// Event raised by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub table: String,
    pub id: String,
    pub event_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Execution record of a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLog {
    pub serial_no: String,
    pub status: String,
    pub unix_time: i64,
    #[serde(default)]
    pub desc: String,
}

/// Partial update of a device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableData {
    pub table_id: String,
    pub id: String,
    pub data: Map<String, Value>,
}

/// A command queued for a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverInstruct {
    pub id: String,
    pub table: String,
    pub table_data: String,
    pub serial_no: String,
    pub command: Value,
    pub status: String,
    pub result: Option<Value>,
    pub desc: String,
}

/// Warning raised by a driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Warn {
    pub id: String,
    /// Table of the device. Looked up from the start configuration when `None`.
    pub table_id: Option<String>,
    pub table_data_id: String,
    pub level: String,
    pub rule_id: String,
    pub fields: Vec<Value>,
    pub warning_type: Vec<String>,
    pub processed: String,
    /// Defaults to now.
    pub time: Option<DateTime<Local>>,
    pub alert: bool,
    pub status: String,
    pub handle: bool,
    pub desc: String,
}

/// Recovery of previously raised warnings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarnRecovery {
    pub ids: Vec<String>,
    /// Defaults to now.
    pub time: Option<DateTime<Local>>,
    pub fields: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct IdRef<'a> {
    pub(crate) id: &'a str,
}

/// Wire form of a [`Warn`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WarnSend<'a> {
    pub(crate) id: &'a str,
    pub(crate) table: IdRef<'a>,
    pub(crate) table_data: IdRef<'a>,
    pub(crate) level: &'a str,
    #[serde(rename = "ruleid")]
    pub(crate) rule_id: &'a str,
    pub(crate) fields: &'a [Value],
    #[serde(rename = "type")]
    pub(crate) warning_type: &'a [String],
    pub(crate) processed: &'a str,
    pub(crate) time: String,
    pub(crate) alert: bool,
    pub(crate) status: &'a str,
    pub(crate) handle: bool,
    pub(crate) desc: &'a str,
}

/// Wire form of a [`WarnRecovery`].
#[derive(Debug, Serialize)]
pub(crate) struct WarnRecoverySend<'a> {
    pub(crate) id: &'a [String],
    pub(crate) data: WarnRecoveryData<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WarnRecoveryData<'a> {
    pub(crate) time: String,
    pub(crate) fields: &'a [Value],
}
