//! Shared state records owned by the context manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Structural type expected by a [`DataSchema`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Any,
}

impl SchemaType {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => SchemaType::Null,
            Value::Bool(_) => SchemaType::Bool,
            Value::Number(_) => SchemaType::Number,
            Value::String(_) => SchemaType::String,
            Value::Array(_) => SchemaType::Array,
            Value::Object(_) => SchemaType::Object,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SchemaType::Null => "null",
            SchemaType::Bool => "bool",
            SchemaType::Number => "number",
            SchemaType::String => "string",
            SchemaType::Array => "array",
            SchemaType::Object => "object",
            SchemaType::Any => "any",
        }
    }
}

/// Minimal structural schema attached to a context entry
///
/// Primitives and arrays are checked by type only; objects additionally
/// require every key listed in `required`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    #[serde(rename = "type")]
    pub kind: SchemaType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl DataSchema {
    pub fn new(kind: SchemaType) -> Self {
        Self {
            kind,
            required: Vec::new(),
        }
    }

    /// Object schema requiring the given keys
    pub fn object<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: SchemaType::Object,
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// Check `value` against the schema, returning every violation
    pub fn check(&self, value: &Value) -> Result<(), Vec<String>> {
        if self.kind == SchemaType::Any {
            return Ok(());
        }

        let actual = SchemaType::of(value);
        if actual != self.kind {
            return Err(vec![format!(
                "expected {}, found {}",
                self.kind.name(),
                actual.name()
            )]);
        }

        if let Value::Object(map) = value {
            let missing: Vec<String> = self
                .required
                .iter()
                .filter(|key| !map.contains_key(key.as_str()))
                .map(|key| format!("missing required key '{key}'"))
                .collect();
            if !missing.is_empty() {
                return Err(missing);
            }
        }

        Ok(())
    }
}

/// A single value stored in a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    pub schema: Option<DataSchema>,
}

/// Storage hint carried in context metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageHint {
    #[default]
    Memory,
    Persistent,
}

/// Descriptive metadata for a context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Absolute expiration; filled with the manager's default when absent
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub storage: StorageHint,
    /// Context this one was cloned, shared, snapshotted, or persisted from
    pub parent_id: Option<String>,
    /// Root context of a clone/share lineage
    pub lineage: Option<String>,
}

impl ContextMetadata {
    pub fn owned_by<S: Into<String>>(owner: S) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Versioned key/value state scoped to one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub pipeline_id: String,
    pub data: HashMap<String, ContextEntry>,
    pub metadata: ContextMetadata,
    pub version: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Context {
    /// Whether the expiration has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.metadata
            .expiration
            .map(|expiration| expiration <= now)
            .unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Value stored under `key`, if any
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.data.get(key).map(|entry| &entry.value)
    }

    /// Approximate in-memory footprint used for storage reports
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
            + self.id.len()
            + self.pipeline_id.len()
    }
}
