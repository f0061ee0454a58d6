//! Entity values: schemaless field maps tagged with their model type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Key holding the type tag on every entity.
pub const MODEL_KEY: &str = "model";

/// A persisted or in-progress record: a JSON object keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(Map<String, Value>);

impl Entity {
    pub fn new(type_tag: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert(MODEL_KEY.to_string(), Value::String(type_tag.into()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(EngineError::InvalidEntity(format!(
                "expected an object, got {}",
                value_kind(&other)
            ))),
        }
    }

    /// Builder-style field assignment.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.0.get(MODEL_KEY).and_then(Value::as_str)
    }

    pub fn set_type_tag(&mut self, type_tag: impl Into<String>) {
        self.0
            .insert(MODEL_KEY.to_string(), Value::String(type_tag.into()));
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        entity.into_value()
    }
}

/// Navigation / membership handle: a type tag plus the record's reference key value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub id: Value,
}

impl EntityRef {
    pub fn new(type_tag: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
        }
    }

    /// Path-safe rendering of the id.
    pub fn id_segment(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.type_tag, self.id_segment())
    }
}

/// Absent, null, empty string and empty list count as blank.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(_) => false,
    }
}

/// An identity value is set when it is non-blank and not a numeric zero.
pub fn is_identity_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
        other => !is_blank(other),
    }
}

/// Absent and null compare equal.
pub fn same_value(current: Option<&Value>, next: &Value) -> bool {
    match current {
        None => next.is_null(),
        Some(v) => v == next,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
