//! In-memory object store
//!
//! Keeps records per type, assigns identity on create (`id` sequence,
//! `objectId` uuid, `urn`), records membership edges and journals every
//! operation. Failures can be injected per operation for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{MemberEdge, ObjectStore, Query, SearchResults, StoreOp};
use crate::entity::{is_identity_set, Entity, EntityRef};
use crate::error::StoreError;

const IDENTITY_KEYS: [&str; 3] = ["id", "objectId", "urn"];

/// One observed store call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub op: StoreOp,
    pub type_tag: String,
    pub payload: Option<Value>,
    pub ok: bool,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: StoreOp,
    type_tag: Option<String>,
    message: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: HashMap<String, Vec<Entity>>,
    edges: Vec<(EntityRef, String, EntityRef)>,
    journal: Vec<JournalEntry>,
    failures: Vec<InjectedFailure>,
}

impl MemoryState {
    /// Consume a matching injected failure, journaling the attempt.
    fn check(&mut self, op: StoreOp, type_tag: &str, payload: Option<Value>) -> Result<(), StoreError> {
        let hit = self.failures.iter().position(|f| {
            f.op == op && f.type_tag.as_deref().map_or(true, |t| t == type_tag)
        });
        let ok = hit.is_none();
        self.journal.push(JournalEntry {
            op,
            type_tag: type_tag.to_string(),
            payload,
            ok,
        });
        match hit {
            Some(index) => {
                let failure = self.failures.remove(index);
                Err(StoreError::Rejected {
                    op,
                    type_tag: type_tag.to_string(),
                    message: failure.message,
                })
            }
            None => Ok(()),
        }
    }

    fn assign_identity(&mut self, type_tag: &str, entity: &mut Entity) {
        self.next_id += 1;
        let object_id = Uuid::new_v4().to_string();
        entity.insert("id", Value::from(self.next_id));
        entity.insert("urn", Value::String(format!("am:{type_tag}:{object_id}")));
        entity.insert("objectId", Value::String(object_id));
    }

    fn position(&self, type_tag: &str, id: &Value) -> Option<usize> {
        self.records.get(type_tag)?.iter().position(|record| {
            IDENTITY_KEYS
                .iter()
                .any(|key| record.get(key) == Some(id))
        })
    }
}

fn payload_reference(entity: &Entity) -> Option<&Value> {
    IDENTITY_KEYS
        .iter()
        .filter_map(|key| entity.get(key))
        .find(|v| is_identity_set(Some(v)))
}

/// In-memory [`ObjectStore`] for tests and offline replay.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` (optionally only for `type_tag`) fail with a rejection.
    pub async fn fail_next(&self, op: StoreOp, type_tag: Option<&str>) {
        let mut state = self.state.write().await;
        state.failures.push(InjectedFailure {
            op,
            type_tag: type_tag.map(str::to_string),
            message: "injected failure".to_string(),
        });
    }

    /// Seed a record without journaling; identity is assigned when missing.
    pub async fn insert(&self, mut entity: Entity) -> Entity {
        let mut state = self.state.write().await;
        let type_tag = entity.type_tag().unwrap_or_default().to_string();
        if payload_reference(&entity).is_none() {
            state.assign_identity(&type_tag, &mut entity);
        }
        state
            .records
            .entry(type_tag)
            .or_default()
            .push(entity.clone());
        entity
    }

    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.state.read().await.journal.clone()
    }

    /// `(op, type)` pairs of every successful call, in order.
    pub async fn ops(&self) -> Vec<(StoreOp, String)> {
        self.state
            .read()
            .await
            .journal
            .iter()
            .filter(|e| e.ok)
            .map(|e| (e.op, e.type_tag.clone()))
            .collect()
    }

    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    pub async fn records(&self, type_tag: &str) -> Vec<Entity> {
        self.state
            .read()
            .await
            .records
            .get(type_tag)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, type_tag: &str, id: &Value) -> Option<Entity> {
        let state = self.state.read().await;
        let index = state.position(type_tag, id)?;
        state.records.get(type_tag)?.get(index).cloned()
    }

    /// Members listed under `relation` for `owner`.
    pub async fn members(&self, owner: &EntityRef, relation: &str) -> Vec<EntityRef> {
        self.state
            .read()
            .await
            .edges
            .iter()
            .filter(|(o, r, _)| o == owner && r == relation)
            .map(|(_, _, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn search(&self, query: &Query) -> Result<SearchResults, StoreError> {
        let mut state = self.state.write().await;
        state.check(StoreOp::Search, &query.type_tag, serde_json::to_value(query).ok())?;
        let matching: Vec<Entity> = state
            .records
            .get(&query.type_tag)
            .map(|records| records.iter().filter(|e| query.matches(e)).cloned().collect())
            .unwrap_or_default();
        debug!(type_tag = %query.type_tag, count = matching.len(), "memory store search");
        Ok(SearchResults {
            count: matching.len(),
            results: matching
                .into_iter()
                .skip(query.start_record)
                .take(query.record_count)
                .collect(),
        })
    }

    async fn create(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError> {
        let mut state = self.state.write().await;
        state.check(StoreOp::Create, type_tag, Some(entity.clone().into_value()))?;
        if payload_reference(entity).is_some() {
            return Err(StoreError::Rejected {
                op: StoreOp::Create,
                type_tag: type_tag.to_string(),
                message: "entity already has identity".to_string(),
            });
        }
        let mut stored = entity.clone();
        stored.set_type_tag(type_tag);
        state.assign_identity(type_tag, &mut stored);
        state
            .records
            .entry(type_tag.to_string())
            .or_default()
            .push(stored.clone());
        debug!(type_tag, id = ?stored.get("id"), "memory store create");
        Ok(stored)
    }

    async fn patch(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError> {
        let mut state = self.state.write().await;
        state.check(StoreOp::Patch, type_tag, Some(entity.clone().into_value()))?;
        let id = payload_reference(entity)
            .cloned()
            .ok_or_else(|| StoreError::Rejected {
                op: StoreOp::Patch,
                type_tag: type_tag.to_string(),
                message: "patch without identity".to_string(),
            })?;
        let index = state
            .position(type_tag, &id)
            .ok_or_else(|| StoreError::NotFound(format!("{type_tag}/{id}")))?;
        let records = state
            .records
            .get_mut(type_tag)
            .ok_or_else(|| StoreError::NotFound(type_tag.to_string()))?;
        let record = &mut records[index];
        for (key, value) in entity.fields() {
            record.insert(key.clone(), value.clone());
        }
        debug!(type_tag, %id, "memory store patch");
        Ok(record.clone())
    }

    async fn member(&self, edge: &MemberEdge) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check(
            StoreOp::Member,
            &edge.owner.type_tag,
            serde_json::to_value(edge).ok(),
        )?;
        let key = (edge.owner.clone(), edge.relation.clone(), edge.target.clone());
        if edge.add {
            if !state.edges.contains(&key) {
                state.edges.push(key);
            }
        } else {
            state.edges.retain(|e| e != &key);
        }
        debug!(owner = %edge.owner, target = %edge.target, add = edge.add, "memory store member");
        Ok(())
    }

    async fn delete(&self, target: &EntityRef) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check(StoreOp::Delete, &target.type_tag, Some(target.id.clone()))?;
        let index = state
            .position(&target.type_tag, &target.id)
            .ok_or_else(|| StoreError::NotFound(target.to_string()))?;
        if let Some(records) = state.records.get_mut(&target.type_tag) {
            records.remove(index);
        }
        state
            .edges
            .retain(|(owner, _, member)| owner != target && member != target);
        debug!(%target, "memory store delete");
        Ok(())
    }

    async fn find_or_make_path(
        &self,
        container_type: &str,
        path: &str,
    ) -> Result<Entity, StoreError> {
        let mut state = self.state.write().await;
        state.check(
            StoreOp::MakePath,
            container_type,
            Some(Value::String(path.to_string())),
        )?;
        let existing = state.records.get(container_type).and_then(|records| {
            records
                .iter()
                .find(|r| r.get("path").and_then(Value::as_str) == Some(path))
                .cloned()
        });
        if let Some(found) = existing {
            return Ok(found);
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let mut container = Entity::new(container_type)
            .with("name", name)
            .with("path", path);
        state.assign_identity(container_type, &mut container);
        state
            .records
            .entry(container_type.to_string())
            .or_default()
            .push(container.clone());
        debug!(container_type, path, "memory store made path");
        Ok(container)
    }

    async fn clear_cache(&self, type_tag: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check(StoreOp::ClearCache, type_tag, None)
    }
}
