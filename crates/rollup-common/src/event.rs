//! Canonical event model and producer-side validation
//!
//! Events are immutable once they enter the ingestion buffer. Producers
//! either build them directly or submit JSON payloads through
//! [`Event::from_json`], which maps the schema-less payload onto the typed
//! property map and rejects anything that does not fit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{now_millis, Timestamp};

pub const MAX_EVENT_ID_LEN: usize = 128;
pub const MAX_PARTITION_KEY_LEN: usize = 256;
pub const MAX_EVENT_TYPE_LEN: usize = 128;
pub const MAX_PROPERTIES: usize = 256;

/// Top-level JSON fields that are part of the envelope, not properties
const RESERVED_FIELDS: &[&str] = &[
    "event_id",
    "partition_key",
    "user_id",
    "event_type",
    "timestamp",
    "properties",
];

/// A single property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Numeric view used by sum/min/max
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::String(s) => s.parse().ok(),
            PropertyValue::Null => None,
        }
    }

    /// Stable textual form used for distinct counting
    pub fn canonical(&self) -> String {
        match self {
            PropertyValue::Null => "null".to_string(),
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::String(s) => s.clone(),
        }
    }

    fn from_json(key: &str, value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(PropertyValue::Null),
            serde_json::Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(PropertyValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(PropertyValue::Float(f))
                } else {
                    Err(Error::validation(format!("property {key}: number out of range")))
                }
            }
            serde_json::Value::String(s) => Ok(PropertyValue::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(Error::validation(
                format!("property {key}: nested values are not supported"),
            )),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

/// An ingested analytics event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub partition_key: String,
    pub event_type: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        partition_key: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            partition_key: partition_key.into(),
            event_type: event_type.into(),
            timestamp,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Check the event against the ingestion contract
    pub fn validate(&self) -> Result<()> {
        validate_identifier("event_id", &self.event_id, MAX_EVENT_ID_LEN)?;
        validate_identifier("partition_key", &self.partition_key, MAX_PARTITION_KEY_LEN)?;
        if self.partition_key.contains('/') {
            return Err(Error::validation("partition_key must not contain '/'"));
        }
        validate_identifier("event_type", &self.event_type, MAX_EVENT_TYPE_LEN)?;

        if self.timestamp < 0 {
            return Err(Error::validation(format!(
                "timestamp must not be negative, got {}",
                self.timestamp
            )));
        }

        if self.properties.len() > MAX_PROPERTIES {
            return Err(Error::validation(format!(
                "too many properties: {} (max {MAX_PROPERTIES})",
                self.properties.len()
            )));
        }

        for (key, value) in &self.properties {
            if key.is_empty() {
                return Err(Error::validation("property names must not be empty"));
            }
            if let PropertyValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(Error::validation(format!("property {key}: non-finite number")));
                }
            }
        }

        Ok(())
    }

    /// Build an event from a producer's JSON payload.
    ///
    /// `partition_key` falls back to `user_id`; a missing `event_id` is
    /// generated and a missing `timestamp` defaults to now. Unreserved
    /// top-level scalars are folded into the properties; a key given both
    /// there and inside `properties` is rejected.
    pub fn from_json(payload: &serde_json::Value) -> Result<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::validation("event payload must be a JSON object"))?;

        let partition_key = obj
            .get("partition_key")
            .or_else(|| obj.get("user_id"))
            .ok_or_else(|| Error::validation("missing required field: partition_key"))?;
        let partition_key = json_string("partition_key", partition_key)?;

        let event_type = obj
            .get("event_type")
            .ok_or_else(|| Error::validation("missing required field: event_type"))?;
        let event_type = json_string("event_type", event_type)?;

        let event_id = match obj.get("event_id") {
            Some(v) => json_string("event_id", v)?,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let timestamp = match obj.get("timestamp") {
            Some(v) => parse_timestamp(v)?,
            None => now_millis(),
        };

        let mut properties = BTreeMap::new();
        if let Some(props) = obj.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| Error::validation("properties must be a JSON object"))?;
            for (key, value) in props {
                properties.insert(key.clone(), PropertyValue::from_json(key, value)?);
            }
        }
        for (key, value) in obj {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if properties.contains_key(key) {
                return Err(Error::validation(format!(
                    "property {key} is set both at top level and in properties"
                )));
            }
            properties.insert(key.clone(), PropertyValue::from_json(key, value)?);
        }

        let event = Event {
            event_id,
            partition_key,
            event_type,
            timestamp,
            properties,
        };
        event.validate()?;
        Ok(event)
    }
}

fn validate_identifier(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    if value.len() > max_len {
        return Err(Error::validation(format!(
            "{field} exceeds {max_len} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::validation(format!("{field} contains control characters")));
    }
    Ok(())
}

fn json_string(field: &str, value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(Error::validation(format!("{field} must be a string"))),
    }
}

/// Accepts epoch milliseconds or an RFC 3339 / naive ISO-8601 string
fn parse_timestamp(value: &serde_json::Value) -> Result<Timestamp> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::validation("timestamp must be integer milliseconds")),
        serde_json::Value::String(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Ok(dt.timestamp_millis());
            }
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|dt| dt.and_utc().timestamp_millis())
                .map_err(|_| Error::validation(format!("unparseable timestamp: {s}")))
        }
        _ => Err(Error::validation("timestamp must be a number or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_full_payload() {
        let event = Event::from_json(&json!({
            "event_id": "1",
            "partition_key": "a",
            "event_type": "view",
            "timestamp": 30_000,
            "properties": {"page": "/home", "duration": 12.5}
        }))
        .unwrap();

        assert_eq!(event.event_id, "1");
        assert_eq!(event.timestamp, 30_000);
        assert_eq!(event.property("page"), Some(&PropertyValue::String("/home".into())));
        assert_eq!(event.property("duration").and_then(PropertyValue::as_f64), Some(12.5));
    }

    #[test]
    fn test_from_json_defaults_and_aliases() {
        let event = Event::from_json(&json!({
            "user_id": "u-42",
            "event_type": "click",
            "button": "buy"
        }))
        .unwrap();

        assert_eq!(event.partition_key, "u-42");
        assert!(!event.event_id.is_empty());
        assert!(event.timestamp > 0);
        assert_eq!(event.property("button"), Some(&PropertyValue::String("buy".into())));
    }

    #[test]
    fn test_from_json_rejects_property_given_twice() {
        let err = Event::from_json(&json!({
            "partition_key": "a",
            "event_type": "purchase",
            "amount": 5,
            "properties": {"amount": 7, "currency": "EUR"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("property amount"));

        let event = Event::from_json(&json!({
            "partition_key": "a",
            "event_type": "purchase",
            "amount": 5,
            "properties": {"currency": "EUR"}
        }))
        .unwrap();
        assert_eq!(event.property("amount").and_then(PropertyValue::as_f64), Some(5.0));
        assert_eq!(event.properties.len(), 2);
    }

    #[test]
    fn test_from_json_iso_timestamp() {
        let event = Event::from_json(&json!({
            "partition_key": "a",
            "event_type": "view",
            "timestamp": "1970-01-01T00:01:00"
        }))
        .unwrap();
        assert_eq!(event.timestamp, 60_000);
    }

    #[test]
    fn test_from_json_rejects_malformed() {
        assert!(Event::from_json(&json!([1, 2])).is_err());
        assert!(Event::from_json(&json!({"event_type": "view"})).is_err());
        assert!(Event::from_json(&json!({"partition_key": "a"})).is_err());
        assert!(Event::from_json(&json!({
            "partition_key": "a",
            "event_type": "view",
            "nested": {"x": 1}
        }))
        .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_identifiers() {
        assert!(Event::new("", "a", "view", 0).validate().is_err());
        assert!(Event::new("1", "a/b", "view", 0).validate().is_err());
        assert!(Event::new("1", "a", "", 0).validate().is_err());
        assert!(Event::new("1", "a", "view", -5).validate().is_err());
        assert!(Event::new("1", "a", "view", 0)
            .with_property("x", f64::NAN)
            .validate()
            .is_err());
        assert!(Event::new("1", "a", "view", 0).validate().is_ok());
    }

    #[test]
    fn test_property_numeric_view() {
        assert_eq!(PropertyValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(PropertyValue::String("2.5".into()).as_f64(), Some(2.5));
        assert_eq!(PropertyValue::Null.as_f64(), None);
    }
}
