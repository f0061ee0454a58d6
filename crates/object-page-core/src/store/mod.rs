//! Object store port
//!
//! Abstract interface to the remote object service. The engine only ever
//! talks to this trait; `MemoryObjectStore` backs tests and the CLI, the
//! client crate provides the HTTP implementation.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, EntityRef};
use crate::error::StoreError;

/// Store operation, used for journals, logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Search,
    Create,
    Patch,
    Member,
    Delete,
    MakePath,
    ClearCache,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Search => "search",
            Self::Create => "create",
            Self::Patch => "patch",
            Self::Member => "member",
            Self::Delete => "delete",
            Self::MakePath => "make_path",
            Self::ClearCache => "clear_cache",
        };
        f.write_str(s)
    }
}

// ── Queries ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    #[default]
    Equals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryField {
    #[serde(default)]
    pub comparator: Comparator,
    pub name: String,
    pub value: Value,
}

/// Equality search over one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default = "query_model")]
    pub model: String,

    #[serde(rename = "type")]
    pub type_tag: String,

    #[serde(default)]
    pub fields: Vec<QueryField>,

    #[serde(default = "default_group_comparator")]
    pub comparator: String,

    #[serde(default)]
    pub start_record: usize,

    #[serde(default = "default_record_count")]
    pub record_count: usize,
}

fn query_model() -> String {
    "io.query".to_string()
}

fn default_group_comparator() -> String {
    "group_and".to_string()
}

fn default_record_count() -> usize {
    10
}

impl Query {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            model: query_model(),
            type_tag: type_tag.into(),
            fields: Vec::new(),
            comparator: default_group_comparator(),
            start_record: 0,
            record_count: default_record_count(),
        }
    }

    pub fn equals(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(QueryField {
            comparator: Comparator::Equals,
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn limit(mut self, record_count: usize) -> Self {
        self.record_count = record_count;
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        entity.type_tag() == Some(self.type_tag.as_str())
            && self
                .fields
                .iter()
                .all(|f| entity.get(&f.name) == Some(&f.value))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub results: Vec<Entity>,
}

/// Association edge between an owner record and a foreign member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEdge {
    pub owner: EntityRef,
    /// Owner field the membership is listed under
    pub relation: String,
    pub target: EntityRef,
    pub add: bool,
}

// ── Port ────────────────────────────────────────────────────────

/// Remote object service.
///
/// `create` and `patch` return the store's view of the entity; the engine
/// merges it back into the in-memory graph.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn search(&self, query: &Query) -> Result<SearchResults, StoreError>;

    async fn create(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError>;

    async fn patch(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError>;

    async fn member(&self, edge: &MemberEdge) -> Result<(), StoreError>;

    async fn delete(&self, target: &EntityRef) -> Result<(), StoreError>;

    /// Find the container of `container_type` at `path`, creating it if missing.
    async fn find_or_make_path(
        &self,
        container_type: &str,
        path: &str,
    ) -> Result<Entity, StoreError>;

    async fn clear_cache(&self, _type_tag: &str) -> Result<(), StoreError> {
        Ok(()) // Default: nothing cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_serializes_service_shape() {
        let q = Query::new("account").equals("id", 42).limit(1);
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(
            v,
            json!({
                "model": "io.query",
                "type": "account",
                "fields": [{ "comparator": "equals", "name": "id", "value": 42 }],
                "comparator": "group_and",
                "startRecord": 0,
                "recordCount": 1
            })
        );
    }

    #[test]
    fn query_matches_on_equality() {
        let q = Query::new("account").equals("name", "acme");
        assert!(q.matches(&Entity::new("account").with("name", "acme")));
        assert!(!q.matches(&Entity::new("account").with("name", "other")));
        assert!(!q.matches(&Entity::new("person").with("name", "acme")));
    }

    #[test]
    fn store_op_display() {
        assert_eq!(StoreOp::MakePath.to_string(), "make_path");
        assert_eq!(StoreOp::Create.to_string(), "create");
    }
}
