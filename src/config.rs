//! Load test configuration.
//!
//! The configuration is a flat JSON object. Every key is described in
//! [`FIELDS`]; the raw object is checked against that table before it is
//! deserialized, so a missing or mistyped key is reported by name.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::client::{ClientOptions, Transport};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    /// Non-negative integer.
    Integer,
    /// Non-negative number, integer or not.
    Number,
    Bool,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_u64(),
            FieldKind::Number => value.as_f64().map_or(false, |n| n >= 0.0),
            FieldKind::Bool => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub mandatory: bool,
}

const fn field(name: &'static str, kind: FieldKind, mandatory: bool) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        mandatory,
    }
}

pub const FIELDS: &[FieldSpec] = &[
    field("protocol", FieldKind::String, true),
    field("host", FieldKind::String, true),
    field("port", FieldKind::Integer, true),
    field("adapterSetName", FieldKind::String, true),
    field("dataAdapterName", FieldKind::String, false),
    field("user", FieldKind::String, false),
    field("password", FieldKind::String, false),
    field("numberOfSessions", FieldKind::Integer, true),
    field("itemsPerSession", FieldKind::Integer, true),
    field("itemRandomExtraction", FieldKind::Bool, false),
    field("firstItemAvailable", FieldKind::Integer, false),
    field("lastItemAvailable", FieldKind::Integer, false),
    field("sessionDurationSeconds", FieldKind::Integer, false),
    field("delaySessionStartMillis", FieldKind::Integer, false),
    field("minCreatePool", FieldKind::Integer, true),
    field("serverPorts", FieldKind::Integer, true),
    field("lastRecentUsed", FieldKind::Bool, false),
    field("ignoreData", FieldKind::Bool, false),
    field("speedUpReading", FieldKind::Bool, false),
    field("useRawSocket", FieldKind::Bool, false),
    field("numberOfItems", FieldKind::Integer, true),
    field("numberOfFields", FieldKind::Integer, true),
    field("subscriptionMode", FieldKind::String, true),
    field("unfilteredSubscription", FieldKind::Bool, false),
    field("resamplingFrequency", FieldKind::Number, false),
    field("resamplingBufferSize", FieldKind::Integer, false),
];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// One of `http://`, `https://`, `ws://`, `wss://`.
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub adapter_set_name: String,
    #[serde(default)]
    pub data_adapter_name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    pub number_of_sessions: u32,
    pub items_per_session: u32,
    #[serde(default)]
    pub item_random_extraction: bool,
    #[serde(default)]
    pub first_item_available: Option<u32>,
    #[serde(default)]
    pub last_item_available: Option<u32>,
    #[serde(default)]
    pub session_duration_seconds: u64,
    #[serde(default)]
    pub delay_session_start_millis: u64,

    pub min_create_pool: usize,
    pub server_ports: usize,
    #[serde(default = "default_true")]
    pub last_recent_used: bool,
    #[serde(default)]
    pub ignore_data: bool,
    #[serde(default)]
    pub speed_up_reading: bool,
    #[serde(default)]
    pub use_raw_socket: bool,

    pub number_of_items: u32,
    pub number_of_fields: u32,
    pub subscription_mode: String,
    #[serde(default)]
    pub unfiltered_subscription: bool,
    #[serde(default)]
    pub resampling_frequency: Option<f64>,
    #[serde(default)]
    pub resampling_buffer_size: Option<u32>,
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading configuration from {}", path.display());

        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid JSON: {}", e)))?;
        validate_raw(&raw)?;

        let config: Self = serde_json::from_value(raw)
            .map_err(|e| Error::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        self.transport()?;

        if self.number_of_fields == 0 {
            return Err(Error::Config("numberOfFields must be at least 1".into()));
        }
        if self.items_per_session == 0 {
            return Err(Error::Config("itemsPerSession must be at least 1".into()));
        }
        let extra_ports = self.server_ports.max(1) - 1;
        let last_port = usize::from(self.port).checked_add(extra_ports);
        if last_port.map_or(true, |port| port > usize::from(u16::MAX)) {
            return Err(Error::Config(format!(
                "serverPorts ({}) starting at port {} runs past port {}",
                self.server_ports,
                self.port,
                u16::MAX
            )));
        }

        if let (Some(first), Some(last)) = (self.first_item_available, self.last_item_available) {
            if last < first {
                return Err(Error::Config(
                    "lastItemAvailable must not be smaller than firstItemAvailable".into(),
                ));
            }
        }
        if let Some(first) = self.first_item_available {
            if first > self.number_of_items {
                return Err(Error::Config(format!(
                    "firstItemAvailable ({}) can't be greater than numberOfItems ({})",
                    first, self.number_of_items
                )));
            }
        }
        if let Some(last) = self.last_item_available {
            if last > self.number_of_items {
                return Err(Error::Config(format!(
                    "lastItemAvailable ({}) can't be greater than numberOfItems ({})",
                    last, self.number_of_items
                )));
            }
        }

        let (first, last) = self.item_range();
        if last < first {
            return Err(Error::Config("no items available".into()));
        }
        if !self.item_random_extraction && last - first + 1 < self.items_per_session {
            return Err(Error::Config(
                "not enough items for itemsPerSession without itemRandomExtraction".into(),
            ));
        }

        Ok(())
    }

    pub fn transport(&self) -> Result<Transport> {
        match self.protocol.to_ascii_lowercase().as_str() {
            "http://" | "https://" => Ok(Transport::HttpStreaming),
            "ws://" | "wss://" => Ok(Transport::WsStreaming),
            other => Err(Error::Config(format!("unsupported protocol {:?}", other))),
        }
    }

    pub fn server_url(&self) -> String {
        format!("{}{}:{}", self.protocol, self.host, self.port)
    }

    /// First and last item number that sessions may subscribe to, inclusive.
    /// Item numbers start at 1.
    pub fn item_range(&self) -> (u32, u32) {
        let first = self.first_item_available.filter(|&n| n > 0).unwrap_or(1);
        let last = self
            .last_item_available
            .filter(|&n| n > 0)
            .unwrap_or(self.number_of_items);
        (first, last)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            ignore_data: self.ignore_data,
            lifo: self.last_recent_used,
            n_ports: self.server_ports.max(1),
            n_instances: self.min_create_pool.max(1),
            raw_socket: self.use_raw_socket,
        }
    }
}

/// Checks presence and JSON type of every key in [`FIELDS`]. Unknown keys are ignored.
pub fn validate_raw(raw: &Value) -> Result<()> {
    let object = raw
        .as_object()
        .ok_or_else(|| Error::Config("configuration must be a JSON object".into()))?;

    for spec in FIELDS {
        match object.get(spec.name) {
            None | Some(Value::Null) if spec.mandatory => {
                return Err(Error::Config(format!("missing mandatory parameter {}", spec.name)));
            }
            None | Some(Value::Null) => {}
            Some(value) if !spec.kind.accepts(value) => {
                return Err(Error::Config(format!(
                    "parameter {} must be {:?}, got {}",
                    spec.name, spec.kind, value
                )));
            }
            Some(value) => debug!("{} read: {}", spec.name, value),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "protocol": "ws://",
            "host": "localhost",
            "port": 8080,
            "adapterSetName": "LOAD_TEST",
            "dataAdapterName": "FEED",
            "numberOfSessions": 100,
            "itemsPerSession": 5,
            "minCreatePool": 2,
            "serverPorts": 3,
            "numberOfItems": 500,
            "numberOfFields": 10,
            "subscriptionMode": "MERGE",
            "resamplingFrequency": 0.5
        })
    }

    #[test]
    fn test_load_sample() {
        let config = ClientConfig::from_json(&sample().to_string()).unwrap();

        assert_eq!(config.server_url(), "ws://localhost:8080");
        assert_eq!(config.transport().unwrap(), Transport::WsStreaming);
        assert_eq!(config.item_range(), (1, 500));
        assert_eq!(config.resampling_frequency, Some(0.5));
        assert!(config.last_recent_used);

        let options = config.client_options();
        assert_eq!(options.n_ports, 3);
        assert_eq!(options.n_instances, 2);
        assert!(!options.ignore_data);
    }

    #[test]
    fn test_missing_mandatory() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("numberOfItems");

        let err = ClientConfig::from_json(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("numberOfItems"));
    }

    #[test]
    fn test_wrong_type() {
        let mut raw = sample();
        raw["ignoreData"] = json!("yes");
        let err = validate_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("ignoreData"));

        let mut raw = sample();
        raw["port"] = json!(-1);
        assert!(validate_raw(&raw).is_err());
    }

    #[test]
    fn test_item_range_checks() {
        let mut raw = sample();
        raw["firstItemAvailable"] = json!(10);
        raw["lastItemAvailable"] = json!(5);
        assert!(ClientConfig::from_json(&raw.to_string()).is_err());

        let mut raw = sample();
        raw["lastItemAvailable"] = json!(501);
        assert!(ClientConfig::from_json(&raw.to_string()).is_err());

        // Range of 3 items cannot hold 5 items per session...
        let mut raw = sample();
        raw["firstItemAvailable"] = json!(10);
        raw["lastItemAvailable"] = json!(12);
        assert!(ClientConfig::from_json(&raw.to_string()).is_err());

        // ...unless items are drawn at random.
        raw["itemRandomExtraction"] = json!(true);
        let config = ClientConfig::from_json(&raw.to_string()).unwrap();
        assert_eq!(config.item_range(), (10, 12));
    }

    #[test]
    fn test_server_ports_stay_in_range() {
        let mut raw = sample();
        raw["port"] = json!(65534);
        raw["serverPorts"] = json!(2);
        assert!(ClientConfig::from_json(&raw.to_string()).is_ok());

        raw["serverPorts"] = json!(3);
        let err = ClientConfig::from_json(&raw.to_string()).unwrap_err();
        assert!(err.to_string().contains("serverPorts"));

        raw["serverPorts"] = json!(u64::MAX);
        assert!(ClientConfig::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn test_unknown_protocol() {
        let mut raw = sample();
        raw["protocol"] = json!("ftp://");
        assert!(ClientConfig::from_json(&raw.to_string()).is_err());
    }
}
