//! Picker sessions
//!
//! A picker is a modal sub-interaction that selects existing records and
//! feeds them back into the instance being edited. Sessions form a stack:
//! only the top session is interactive, and cancelling a session cancels
//! every session opened above it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::entity::{Entity, EntityRef};
use crate::error::{EngineError, Result};
use crate::instance::{split_target, ChildKey, Instance};
use crate::schema::{ContainerKind, ModelRegistry, SemanticType, Selected};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "picker-{}", self.0)
    }
}

/// What a resolved selection does to the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// Write the first selection (or one of its properties) into a field,
    /// optionally on a nested owned node.
    BindField {
        #[serde(default)]
        path: Vec<ChildKey>,
        field: String,
        #[serde(default)]
        selected: Selected,
    },
    /// Append selections to a list. Owned lists are dirtied; foreign lists
    /// are updated optimistically and queue membership edges.
    Append { field: String },
    /// Selections were reparented under the owner; only the displayed list
    /// is updated.
    Reparent { field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickerRequest {
    pub target_type: String,
    #[serde(default)]
    pub container_path: Option<String>,
    pub continuation: Continuation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickerSession {
    pub id: SessionId,
    pub target_type: String,
    pub container_path: Option<String>,
    /// Found-or-made container for group-contained targets
    pub container: Option<Entity>,
    pub continuation: Continuation,
    pub opened_from: Option<SessionId>,
}

/// Stack of open picker sessions; the last one is active.
#[derive(Debug, Clone, Default)]
pub struct PickerStack {
    sessions: Vec<PickerSession>,
    next_id: u64,
}

impl PickerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.sessions.len()
    }

    pub fn top(&self) -> Option<&PickerSession> {
        self.sessions.last()
    }

    pub fn sessions(&self) -> &[PickerSession] {
        &self.sessions
    }

    /// Open a session for `request`. Group-contained targets get their
    /// container found or made first; that is the only write a picker makes.
    /// On failure nothing is pushed.
    pub async fn open(
        &mut self,
        registry: &dyn ModelRegistry,
        store: &dyn ObjectStore,
        request: PickerRequest,
    ) -> Result<SessionId> {
        if registry.model(&request.target_type).is_none() {
            return Err(EngineError::PickerResolution(format!(
                "unknown target type {}",
                request.target_type
            )));
        }
        let container = match registry.container(&request.target_type) {
            Some(spec) if spec.kind == ContainerKind::Group => {
                match request
                    .container_path
                    .as_deref()
                    .or(spec.default_path.as_deref())
                {
                    Some(path) => Some(store.find_or_make_path(&spec.container_type, path).await?),
                    None => None,
                }
            }
            _ => None,
        };
        Ok(self.push(request, container))
    }

    fn push(&mut self, request: PickerRequest, container: Option<Entity>) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let opened_from = self.top().map(|s| s.id);
        debug!(%id, target_type = %request.target_type, ?opened_from, "picker opened");
        self.sessions.push(PickerSession {
            id,
            target_type: request.target_type,
            container_path: request.container_path,
            container,
            continuation: request.continuation,
            opened_from,
        });
        id
    }

    /// Cancel `id` and every session opened above it. Returns what was removed.
    pub fn cancel(&mut self, id: SessionId) -> Vec<PickerSession> {
        match self.sessions.iter().position(|s| s.id == id) {
            Some(index) => {
                let removed = self.sessions.split_off(index);
                debug!(%id, cancelled = removed.len(), "picker cancelled");
                removed
            }
            None => Vec::new(),
        }
    }

    pub fn cancel_top(&mut self) -> Option<SessionId> {
        let id = self.top()?.id;
        self.cancel(id);
        Some(id)
    }

    pub fn clear(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Pop the active session and normalise the selection's type tags.
    ///
    /// The session is removed even when the selection is rejected, so an
    /// unresolvable selection only aborts the picker.
    pub fn resolve(
        &mut self,
        registry: &dyn ModelRegistry,
        selected: Vec<Entity>,
    ) -> Result<(PickerSession, Vec<Entity>)> {
        let session = self.sessions.pop().ok_or(EngineError::NoActivePicker)?;
        let mut resolved = Vec::with_capacity(selected.len());
        for mut entity in selected {
            match entity.type_tag() {
                None => entity.set_type_tag(session.target_type.clone()),
                Some(tag) if registry.model(tag).is_none() => {
                    return Err(EngineError::PickerResolution(format!(
                        "selection has unknown type {tag}"
                    )));
                }
                Some(_) => {}
            }
            resolved.push(entity);
        }
        debug!(id = %session.id, count = resolved.len(), "picker resolved");
        Ok((session, resolved))
    }
}

// ── Field bindings ──────────────────────────────────────────────

/// Resolve the target type of a picker-bound field.
///
/// `picker_type` may be `self` (the instance's type), `.field` (a type tag
/// read from that field), or a fixed type tag. Without one the bound field's
/// base model is used.
pub fn resolve_target_type(instance: &Instance, field: &str) -> Result<String> {
    let registry = instance.registry();
    let descriptor = registry
        .field(instance.type_tag(), field)
        .ok_or_else(|| EngineError::unknown_field(instance.type_tag(), field))?;
    let binding = descriptor.picker.as_ref().ok_or_else(|| {
        EngineError::PickerResolution(format!("{field} has no picker binding"))
    })?;
    let target_type = match binding.picker_type.as_deref() {
        Some("self") => instance.type_tag().to_string(),
        Some(indirect) if indirect.starts_with('.') => {
            let source = &indirect[1..];
            instance
                .get(source)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    EngineError::PickerResolution(format!("{source} does not name a type"))
                })?
        }
        Some(fixed) => fixed.to_string(),
        None => descriptor
            .base_model
            .clone()
            .unwrap_or_else(|| instance.type_tag().to_string()),
    };
    if target_type.eq_ignore_ascii_case("unknown") || registry.model(&target_type).is_none() {
        return Err(EngineError::PickerResolution(format!(
            "unknown target type {target_type}"
        )));
    }
    Ok(target_type)
}

/// Picker request for a field's binding.
pub fn field_request(instance: &Instance, field: &str) -> Result<PickerRequest> {
    let target_type = resolve_target_type(instance, field)?;
    let registry = instance.registry();
    let binding = registry
        .field(instance.type_tag(), field)
        .and_then(|d| d.picker.clone())
        .ok_or_else(|| EngineError::PickerResolution(format!("{field} has no picker binding")))?;
    let (owner, target) = split_target(&binding.target);
    Ok(PickerRequest {
        target_type,
        container_path: binding.path.clone(),
        continuation: Continuation::BindField {
            path: owner
                .map(|o| vec![ChildKey::Field(o.to_string())])
                .unwrap_or_default(),
            field: target.to_string(),
            selected: binding.selected.clone(),
        },
    })
}

/// Apply a resolved selection to the instance.
pub fn apply_resolution(
    instance: &mut Instance,
    continuation: &Continuation,
    selected: Vec<Entity>,
) -> Result<()> {
    match continuation {
        Continuation::BindField {
            path,
            field,
            selected: binding,
        } => {
            let Some(first) = selected.into_iter().next() else {
                return Ok(());
            };
            let node_type = instance.type_at(path)?;
            if instance.registry().field(&node_type, field).is_none() {
                return Err(EngineError::PickerResolution(format!(
                    "unknown field {field} on {node_type}"
                )));
            }
            let value = match binding {
                Selected::Object => first.into_value(),
                Selected::Property(property) => first.get(property).cloned().ok_or_else(|| {
                    EngineError::PickerResolution(format!("selection has no {property}"))
                })?,
            };
            let entity = instance.entity.clone();
            let tracker = instance.tracker.clone();
            if let Err(e) = instance.node_at(path).and_then(|mut node| node.set(field, value)) {
                instance.entity = entity;
                instance.tracker = tracker;
                return Err(e);
            }
            Ok(())
        }
        Continuation::Append { field } => append_selection(instance, field, selected),
        Continuation::Reparent { field } => {
            let registry = instance.registry().clone();
            let (mut list, mut seen) = current_list(instance, field);
            for entity in selected {
                push_unseen(&*registry, &mut list, &mut seen, entity);
            }
            instance.set_untracked(field, Value::Array(list));
            Ok(())
        }
    }
}

/// Current list value and the identities already in it.
fn current_list(instance: &Instance, field: &str) -> (Vec<Value>, Vec<EntityRef>) {
    let list: Vec<Value> = instance
        .get(field)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let seen = list
        .iter()
        .filter_map(|v| Entity::from_value(v.clone()).ok())
        .filter_map(|e| instance.registry().reference(&e))
        .collect();
    (list, seen)
}

/// Append unless an element with the same identity is present.
fn push_unseen(
    registry: &dyn ModelRegistry,
    list: &mut Vec<Value>,
    seen: &mut Vec<EntityRef>,
    entity: Entity,
) {
    if let Some(target) = registry.reference(&entity) {
        if seen.contains(&target) {
            return;
        }
        seen.push(target);
    }
    list.push(entity.into_value());
}

fn append_selection(instance: &mut Instance, field: &str, selected: Vec<Entity>) -> Result<()> {
    let registry = instance.registry().clone();
    let descriptor = registry
        .field(instance.type_tag(), field)
        .ok_or_else(|| EngineError::unknown_field(instance.type_tag(), field))?;
    if descriptor.semantic_type != SemanticType::List {
        return Err(EngineError::NotOwned {
            type_tag: instance.type_tag().to_string(),
            field: field.to_string(),
            expected: "list",
        });
    }

    let (mut list, mut seen) = current_list(instance, field);

    if descriptor.is_membership_list() {
        let mut targets = Vec::with_capacity(selected.len());
        for entity in selected {
            let target = registry.reference(&entity).ok_or_else(|| {
                EngineError::PickerResolution("selected member has no identity".to_string())
            })?;
            targets.push((target, entity));
        }
        for (target, entity) in targets {
            if !seen.contains(&target) {
                seen.push(target.clone());
                list.push(entity.into_value());
            }
            instance.memberships.queue(field, target, true);
        }
        instance.set_untracked(field, Value::Array(list));
        return Ok(());
    }

    for entity in selected {
        push_unseen(&*registry, &mut list, &mut seen, entity);
    }
    instance.set(field, Value::Array(list))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::store::memory::MemoryObjectStore;
    use crate::store::StoreOp;
    use serde_json::json;
    use std::sync::Arc;

    const SCHEMA: &str = r#"
models:
  account:
    fields:
      - { name: id, type: number, identity: true }
      - { name: kind, type: string }
      - { name: owned, type: model, base_model: detail }
      - { name: owner, type: model, ownership: foreign, base_model: person,
          picker: { target: owner } }
      - { name: ownerName, type: string,
          picker: { target: ownerName, selected: name, picker_type: person } }
      - { name: related, type: model, ownership: foreign,
          picker: { target: related, picker_type: .kind } }
      - { name: lead, type: model, ownership: foreign,
          picker: { target: owned.lead, picker_type: person } }
      - { name: lines, type: list, base_model: person }
      - { name: members, type: list, ownership: foreign, base_model: person }
  detail:
    fields:
      - { name: id, type: number, identity: true }
      - { name: lead, type: model, ownership: foreign, base_model: person }
      - { name: notes, type: list, base_model: person }
  person:
    container: { kind: group, container_type: group, default_path: "~/People" }
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string }
  group:
    fields:
      - { name: id, type: number, identity: true }
      - { name: path, type: string }
"#;

    fn instance() -> Instance {
        let registry: Arc<dyn ModelRegistry> =
            Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap());
        Instance::new(registry, Entity::new("account").with("id", 1)).unwrap()
    }

    fn person(id: i64, name: &str) -> Entity {
        Entity::new("person").with("id", id).with("name", name)
    }

    #[tokio::test]
    async fn test_open_finds_or_makes_group_container() {
        let inst = instance();
        let store = MemoryObjectStore::new();
        let mut stack = PickerStack::new();
        let request = field_request(&inst, "owner").unwrap();
        let id = stack
            .open(&**inst.registry(), &store, request)
            .await
            .unwrap();
        let session = stack.top().unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.target_type, "person");
        assert_eq!(
            session.container.as_ref().unwrap().get("path"),
            Some(&json!("~/People"))
        );
        assert_eq!(store.ops().await, vec![(StoreOp::MakePath, "group".to_string())]);
    }

    #[tokio::test]
    async fn test_open_failure_pushes_nothing() {
        let inst = instance();
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::MakePath, None).await;
        let mut stack = PickerStack::new();
        let request = field_request(&inst, "owner").unwrap();
        let err = stack.open(&**inst.registry(), &store, request).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!stack.is_active());
    }

    #[tokio::test]
    async fn test_cancel_removes_nested_sessions() {
        let inst = instance();
        let store = MemoryObjectStore::new();
        let mut stack = PickerStack::new();
        let registry = inst.registry().clone();
        let outer = stack
            .open(&*registry, &store, field_request(&inst, "owner").unwrap())
            .await
            .unwrap();
        let inner = stack
            .open(&*registry, &store, field_request(&inst, "ownerName").unwrap())
            .await
            .unwrap();
        assert_eq!(stack.top().unwrap().opened_from, Some(outer));
        assert_eq!(stack.depth(), 2);

        let removed = stack.cancel(outer);
        assert_eq!(
            removed.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![outer, inner]
        );
        assert!(!stack.is_active());
    }

    #[test]
    fn test_resolve_rejects_unknown_type_and_pops() {
        let inst = instance();
        let mut stack = PickerStack::new();
        stack.push(field_request(&inst, "owner").unwrap(), None);
        let err = stack
            .resolve(&**inst.registry(), vec![Entity::new("martian")])
            .unwrap_err();
        assert!(matches!(err, EngineError::PickerResolution(_)));
        assert!(!stack.is_active());
        assert!(matches!(
            stack.resolve(&**inst.registry(), vec![]),
            Err(EngineError::NoActivePicker)
        ));
    }

    #[test]
    fn test_target_type_resolution() {
        let mut inst = instance();
        assert_eq!(resolve_target_type(&inst, "owner").unwrap(), "person");
        assert_eq!(resolve_target_type(&inst, "ownerName").unwrap(), "person");

        // indirection through an unset field fails
        assert!(resolve_target_type(&inst, "related").is_err());
        inst.set("kind", json!("person")).unwrap();
        assert_eq!(resolve_target_type(&inst, "related").unwrap(), "person");
        inst.set("kind", json!("UNKNOWN")).unwrap();
        assert!(matches!(
            resolve_target_type(&inst, "related"),
            Err(EngineError::PickerResolution(_))
        ));
    }

    #[test]
    fn test_bind_object_and_property() {
        let mut inst = instance();
        let owner = field_request(&inst, "owner").unwrap().continuation;
        apply_resolution(&mut inst, &owner, vec![person(5, "Ada")]).unwrap();
        assert_eq!(inst.get("owner").unwrap()["id"], json!(5));

        let name = field_request(&inst, "ownerName").unwrap().continuation;
        apply_resolution(&mut inst, &name, vec![person(5, "Ada")]).unwrap();
        assert_eq!(inst.get("ownerName"), Some(&json!("Ada")));
        assert!(inst.changes().contains("owner"));
        assert!(inst.changes().contains("ownerName"));
    }

    #[test]
    fn test_bind_dotted_target_writes_nested_child() {
        let mut inst = instance();
        let lead = field_request(&inst, "lead").unwrap().continuation;
        apply_resolution(&mut inst, &lead, vec![person(9, "Bo")]).unwrap();
        assert_eq!(inst.get("owned").unwrap()["lead"]["id"], json!(9));
        assert!(!inst.changes().contains("lead"));
        let child = inst
            .tracker()
            .child(&ChildKey::Field("owned".into()))
            .unwrap();
        assert!(child.changes().contains("lead"));
    }

    #[test]
    fn test_failed_bind_leaves_instance_untouched() {
        let mut inst = instance();
        let before = inst.entity().clone();
        let unknown = Continuation::BindField {
            path: vec![ChildKey::Field("owned".into())],
            field: "nosuch".into(),
            selected: Selected::Object,
        };
        let err = apply_resolution(&mut inst, &unknown, vec![person(9, "Bo")]).unwrap_err();
        assert!(matches!(err, EngineError::PickerResolution(_)));
        assert_eq!(inst.entity(), &before);
        assert!(inst.get("owned").is_none());

        let missing_row = Continuation::BindField {
            path: vec![
                ChildKey::Field("owned".into()),
                ChildKey::Element("notes".into(), 0),
            ],
            field: "name".into(),
            selected: Selected::Object,
        };
        assert!(apply_resolution(&mut inst, &missing_row, vec![person(9, "Bo")]).is_err());
        assert_eq!(inst.entity(), &before);
        assert!(!inst.is_dirty());
    }

    #[test]
    fn test_append_owned_dedupes_by_identity() {
        let mut inst = instance();
        let append = Continuation::Append {
            field: "lines".into(),
        };
        apply_resolution(&mut inst, &append, vec![person(1, "a"), person(1, "a")]).unwrap();
        apply_resolution(&mut inst, &append, vec![person(1, "a"), person(2, "b")]).unwrap();
        assert_eq!(inst.get("lines").unwrap().as_array().unwrap().len(), 2);
        assert!(inst.changes().contains("lines"));
    }

    #[test]
    fn test_append_foreign_queues_memberships() {
        let mut inst = instance();
        let append = Continuation::Append {
            field: "members".into(),
        };
        apply_resolution(&mut inst, &append, vec![person(3, "c")]).unwrap();
        assert!(inst.changes().is_empty());
        assert_eq!(inst.memberships().len(), 1);
        assert_eq!(inst.get("members").unwrap().as_array().unwrap().len(), 1);

        let err = apply_resolution(&mut inst, &append, vec![Entity::new("person")]).unwrap_err();
        assert!(matches!(err, EngineError::PickerResolution(_)));
    }
}
