//! Core metric types exchanged between plugins, the shim and the line codec
//!
//! A [`Metric`] is validated once at construction and immutable afterwards.
//! Timestamps are stored as signed nanoseconds since the Unix epoch, which is
//! the resolution the wire format carries.

use crate::error::PluginError;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Timestamp type used at the plugin-facing API
pub type Timestamp = DateTime<Utc>;

/// Tag set, unique keys kept in sorted order
pub type Tags = BTreeMap<String, String>;

/// Field set, unique keys kept in sorted order
pub type Fields = BTreeMap<String, FieldValue>;

/// Value of a single metric field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit float, must be finite
    Float(f64),
    /// Signed integer, encoded with an `i` suffix
    Integer(i64),
    /// Unsigned integer, encoded with a `u` suffix
    Unsigned(u64),
    /// Boolean
    Boolean(bool),
    /// UTF-8 string, encoded double-quoted
    String(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Unsigned(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

/// A single measurement: name, tags, fields and a nanosecond timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    name: String,
    tags: Tags,
    fields: Fields,
    timestamp: i64,
}

impl Metric {
    /// Build a metric stamped with a chrono timestamp
    ///
    /// # Errors
    ///
    /// Returns `PluginError::InvalidMetric` if the name is empty, there are no
    /// fields, a key is empty, a float is not finite, or the timestamp does not
    /// fit in signed 64-bit nanoseconds.
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<Self, PluginError> {
        let nanos = timestamp.timestamp_nanos_opt().ok_or_else(|| {
            PluginError::InvalidMetric(format!("timestamp out of range: {}", timestamp))
        })?;
        Self::from_nanos(name, tags, fields, nanos)
    }

    /// Build a metric from a raw nanosecond timestamp
    pub fn from_nanos(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: i64,
    ) -> Result<Self, PluginError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PluginError::InvalidMetric("empty measurement name".to_string()));
        }
        if fields.is_empty() {
            return Err(PluginError::InvalidMetric(format!(
                "measurement '{}' has no fields",
                name
            )));
        }
        if tags.keys().any(|k| k.is_empty()) || tags.values().any(|v| v.is_empty()) {
            return Err(PluginError::InvalidMetric(format!(
                "measurement '{}' has an empty tag key or value",
                name
            )));
        }
        for (key, value) in &fields {
            if key.is_empty() {
                return Err(PluginError::InvalidMetric(format!(
                    "measurement '{}' has an empty field key",
                    name
                )));
            }
            if let FieldValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(PluginError::InvalidMetric(format!(
                        "field '{}' is not a finite number",
                        key
                    )));
                }
            }
        }

        Ok(Self {
            name,
            tags,
            fields,
            timestamp,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Nanoseconds since the Unix epoch
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
    }

    /// Timestamp as a chrono value
    pub fn time(&self) -> Timestamp {
        DateTime::from_timestamp_nanos(self.timestamp)
    }
}
