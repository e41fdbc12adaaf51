//! Core wire and storage records
//!
//! Thing descriptions travel as flat JSON documents. The fixed fields
//! (`thing_id`, `thing_type`, `publicity`) live beside whatever open-ended
//! properties the description carries, so `properties` is flattened in and
//! out of the same object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{DirectoryError, Result};

/// How an adjacent directory relates to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    Parent,
    Child,
}

/// One adjacent directory: a parent or a direct child
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryLink {
    pub directory_name: String,
    pub url: String,
    pub relationship: Relationship,
}

/// A stored thing description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThingRecord {
    pub thing_id: String,
    pub thing_type: String,
    /// How many ancestor levels this record should still be replicated to
    #[serde(default)]
    pub publicity: u32,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ThingRecord {
    /// Build a record from a raw description document.
    ///
    /// Normalizes `@type` to `thing_type` and `id` to `thing_id`, and strips
    /// any `publicity` field embedded in the description (publicity arrives
    /// as a sibling of the description on the wire; a relocated record
    /// carries it inline and it must not be duplicated).
    pub fn from_description(description: Value, publicity: u32) -> Result<Self> {
        let mut fields = match description {
            Value::Object(map) => map,
            other => {
                return Err(DirectoryError::BadRequest(format!(
                    "thing description must be a JSON object, got {}",
                    kind_of(&other)
                )))
            }
        };

        if let Some(v) = fields.remove("@type") {
            fields.insert("thing_type".to_string(), v);
        }
        if let Some(v) = fields.remove("id") {
            fields.insert("thing_id".to_string(), v);
        }
        fields.remove("publicity");

        let thing_id = take_string(&mut fields, "thing_id")?;
        let thing_type = take_string(&mut fields, "thing_type")?;

        Ok(Self {
            thing_id,
            thing_type,
            publicity,
            properties: fields,
        })
    }

    /// The record as a flat JSON document (fixed fields + properties)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<String> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(other) => Err(DirectoryError::BadRequest(format!(
            "field '{}' must be a non-empty string, got {}",
            key,
            kind_of(&other)
        ))),
        None => Err(DirectoryError::BadRequest(format!("missing field '{}'", key))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
