//! Commit protocol
//!
//! Persists an instance tree bottom-up:
//!
//! 1. Owned children are committed recursively before their parent. New
//!    children are created and the store's entity replaces the in-memory
//!    value; persisted children with changes are patched; clean ones are
//!    skipped. Siblings are issued concurrently and joined.
//! 2. Children work on snapshots. Results are folded back only when every
//!    child step succeeded, so a failure here leaves the tree untouched.
//! 3. The root issues exactly one create or patch, then server-assigned
//!    fields are merged into the root entity.
//! 4. Queued membership edges are flushed against the root's identity. A
//!    failure here is reported as `MembershipsPending`, carrying the report
//!    of the record that was saved; failed edges stay queued.
//!
//! A root failure after step 1 leaves children persisted and clean; a retry
//! does not re-create them.

use futures::future::{join_all, try_join_all, BoxFuture};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::entity::{Entity, EntityRef, MODEL_KEY};
use crate::error::{EngineError, Result, StoreError};
use crate::instance::{
    create_payload, owned_slots, patch_payload, slot_map, write_slot, ChildKey, Instance, Tracker,
};
use crate::schema::{ContainerKind, ModelRegistry};
use crate::store::{MemberEdge, ObjectStore};

/// Field holding a parent-contained record's parent identity.
pub const PARENT_KEY: &str = "parentId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Patch,
    Member,
}

/// One store call issued by a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitOp {
    pub kind: OpKind,
    pub type_tag: String,
    /// Position in the tree; empty for the root
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    pub operations: Vec<CommitOp>,
    /// Set when the root was new and the store assigned its identity
    pub created: Option<EntityRef>,
}

impl CommitReport {
    pub fn is_noop(&self) -> bool {
        self.operations.is_empty()
    }
}

struct CommitContext<'a> {
    registry: &'a dyn ModelRegistry,
    store: &'a dyn ObjectStore,
    reissue_owned: bool,
}

/// Committed snapshot of one child subtree.
struct NodeOutcome {
    fields: Map<String, Value>,
    tracker: Tracker,
    created: bool,
    ops: Vec<CommitOp>,
}

/// Run the full protocol against `instance`.
pub async fn commit(instance: &mut Instance, store: &dyn ObjectStore) -> Result<CommitReport> {
    let registry = instance.registry.clone();
    let type_tag = instance.type_tag.clone();
    let cx = CommitContext {
        registry: &*registry,
        store,
        reissue_owned: instance.reissue_owned,
    };
    let mut report = CommitReport::default();

    let children = commit_children(
        &cx,
        &type_tag,
        instance.entity.fields(),
        &instance.tracker,
        "",
    )
    .await?;
    fold_children(
        instance.entity.fields_mut(),
        &mut instance.tracker,
        children,
        &mut report.operations,
    );
    instance.reissue_owned = false;

    if !instance.is_persisted() {
        let payload = instance.create_payload();
        debug!(type_tag = %type_tag, "creating root");
        let returned = store
            .create(&type_tag, &payload)
            .await
            .map_err(|e| store_failure(&type_tag, "", e))?;
        let reference = registry.reference(&returned).ok_or_else(|| {
            EngineError::IdentityConflict(format!("store returned {type_tag} without identity"))
        })?;
        for (name, value) in returned.into_map() {
            instance.entity.insert(name, value);
        }
        report.operations.push(CommitOp {
            kind: OpKind::Create,
            type_tag: type_tag.clone(),
            path: String::new(),
        });
        report.created = Some(reference);
    } else if let Some(payload) = instance.patch_payload() {
        if !registry.is_persisted(&type_tag, payload.fields()) {
            return Err(EngineError::IdentityConflict(format!(
                "patch payload for {type_tag} lacks identity"
            )));
        }
        debug!(type_tag = %type_tag, fields = payload.fields().len(), "patching root");
        store
            .patch(&type_tag, &payload)
            .await
            .map_err(|e| store_failure(&type_tag, "", e))?;
        report.operations.push(CommitOp {
            kind: OpKind::Patch,
            type_tag: type_tag.clone(),
            path: String::new(),
        });
    }
    instance.tracker.clear();

    match flush_memberships(instance, store, &mut report.operations).await {
        Ok(()) => {}
        Err(EngineError::Store(source)) => {
            let pending = instance.memberships.len();
            warn!(type_tag = %type_tag, pending, "record saved with membership edges pending");
            return Err(EngineError::MembershipsPending {
                report: Box::new(report),
                pending,
                source,
            });
        }
        Err(e) => return Err(e),
    }

    info!(
        type_tag = %type_tag,
        operations = report.operations.len(),
        created = report.created.is_some(),
        "commit complete"
    );
    Ok(report)
}

/// Commit one element of an owned list on its own (row-level save).
/// The parent's change set is left alone.
pub async fn commit_element(
    instance: &mut Instance,
    store: &dyn ObjectStore,
    key: &ChildKey,
) -> Result<Vec<CommitOp>> {
    let registry = instance.registry.clone();
    let cx = CommitContext {
        registry: &*registry,
        store,
        reissue_owned: false,
    };
    let slots = owned_slots(&*registry, &instance.type_tag, instance.entity.fields());
    let Some((_, child_type)) = slots.into_iter().find(|(k, _)| k == key) else {
        return Err(EngineError::InvalidEntity(format!(
            "{} has no owned row {key}",
            instance.type_tag
        )));
    };
    let fields = slot_map(instance.entity.fields(), key)
        .cloned()
        .unwrap_or_default();
    let tracker = instance
        .tracker
        .child(key)
        .cloned()
        .unwrap_or_default();
    let outcome = commit_node(&cx, child_type, fields, tracker, key.to_string()).await?;
    write_slot(instance.entity.fields_mut(), key, outcome.fields);
    instance.tracker.children.insert(key.clone(), outcome.tracker);
    Ok(outcome.ops)
}

async fn commit_children(
    cx: &CommitContext<'_>,
    type_tag: &str,
    fields: &Map<String, Value>,
    tracker: &Tracker,
    path: &str,
) -> Result<Vec<(ChildKey, NodeOutcome)>> {
    let steps = owned_slots(cx.registry, type_tag, fields)
        .into_iter()
        .filter_map(|(key, child_type)| {
            let child_fields = slot_map(fields, &key)?.clone();
            let child_tracker = tracker.child(&key).cloned().unwrap_or_default();
            let child_path = join_path(path, &key);
            Some(async move {
                let outcome = commit_node(cx, child_type, child_fields, child_tracker, child_path)
                    .await?;
                Ok::<_, EngineError>((key, outcome))
            })
        });
    try_join_all(steps).await
}

fn commit_node<'a>(
    cx: &'a CommitContext<'a>,
    type_tag: String,
    mut fields: Map<String, Value>,
    mut tracker: Tracker,
    path: String,
) -> BoxFuture<'a, Result<NodeOutcome>> {
    Box::pin(async move {
        let mut ops = Vec::new();
        let children = commit_children(cx, &type_tag, &fields, &tracker, &path).await?;
        fold_children(&mut fields, &mut tracker, children, &mut ops);

        let persisted = cx.registry.is_persisted(&type_tag, &fields);
        let created = if !persisted || cx.reissue_owned {
            let payload = create_payload(cx.registry, &type_tag, &fields, persisted);
            debug!(type_tag = %type_tag, path = %path, reissue = persisted, "creating owned child");
            let returned = cx
                .store
                .create(&type_tag, &payload)
                .await
                .map_err(|e| store_failure(&type_tag, &path, e))?;
            if !cx.registry.is_persisted(&type_tag, returned.fields()) {
                return Err(EngineError::IdentityConflict(format!(
                    "store returned {type_tag} at {path} without identity"
                )));
            }
            fields = returned.into_map();
            if !fields.contains_key(MODEL_KEY) {
                fields.insert(MODEL_KEY.to_string(), Value::String(type_tag.clone()));
            }
            tracker.clear();
            ops.push(CommitOp {
                kind: OpKind::Create,
                type_tag: type_tag.clone(),
                path: path.clone(),
            });
            true
        } else if let Some(payload) = patch_payload(cx.registry, &type_tag, &fields, &tracker) {
            debug!(type_tag = %type_tag, path = %path, "patching owned child");
            cx.store
                .patch(&type_tag, &payload)
                .await
                .map_err(|e| store_failure(&type_tag, &path, e))?;
            tracker.changes.clear();
            tracker.errors.clear();
            ops.push(CommitOp {
                kind: OpKind::Patch,
                type_tag: type_tag.clone(),
                path: path.clone(),
            });
            false
        } else {
            false
        };

        Ok(NodeOutcome {
            fields,
            tracker,
            created,
            ops,
        })
    })
}

/// Write committed child snapshots back into their parent.
fn fold_children(
    fields: &mut Map<String, Value>,
    tracker: &mut Tracker,
    children: Vec<(ChildKey, NodeOutcome)>,
    ops: &mut Vec<CommitOp>,
) {
    for (key, outcome) in children {
        write_slot(fields, &key, outcome.fields);
        if outcome.created {
            // The parent now references the child by its new identity
            tracker.changes.insert(key.field().to_string());
        }
        tracker.children.insert(key, outcome.tracker);
        ops.extend(outcome.ops);
    }
}

async fn flush_memberships(
    instance: &mut Instance,
    store: &dyn ObjectStore,
    ops: &mut Vec<CommitOp>,
) -> Result<()> {
    if instance.memberships.is_empty() {
        return Ok(());
    }
    let owner = instance.reference().ok_or_else(|| {
        EngineError::IdentityConflict(format!(
            "{} has no identity for membership edges",
            instance.type_tag
        ))
    })?;
    let pending = instance.memberships.take();
    let owner = &owner;
    let results = join_all(pending.into_iter().map(|edge| async move {
        let call = MemberEdge {
            owner: owner.clone(),
            relation: edge.relation.clone(),
            target: edge.target.clone(),
            add: edge.add,
        };
        debug!(owner = %owner, relation = %edge.relation, target = %edge.target, add = edge.add, "member edge");
        store.member(&call).await.map_err(|e| (edge, e))
    }))
    .await;

    let mut failed = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(()) => ops.push(CommitOp {
                kind: OpKind::Member,
                type_tag: owner.type_tag.clone(),
                path: String::new(),
            }),
            Err((edge, error)) => {
                warn!(owner = %owner, target = %edge.target, error = %error, "member edge failed");
                failed.push(edge);
                first_error.get_or_insert(error);
            }
        }
    }
    instance.memberships.restore(failed);
    match first_error {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// Point each child's `parentId` at `parent`, or detach it (`0`) when there
/// is none. Every child is checked before any patch is sent.
pub async fn reparent(
    registry: &dyn ModelRegistry,
    store: &dyn ObjectStore,
    children: &[Entity],
    parent: Option<&EntityRef>,
) -> Result<Vec<CommitOp>> {
    let parent_id = parent.map_or_else(|| Value::from(0), |p| p.id.clone());
    let mut payloads = Vec::with_capacity(children.len());
    for child in children {
        let type_tag = child
            .type_tag()
            .ok_or_else(|| EngineError::InvalidEntity("child without a type tag".to_string()))?;
        if registry.container(type_tag).map(|c| c.kind) != Some(ContainerKind::Parent) {
            return Err(EngineError::InvalidEntity(format!(
                "{type_tag} records do not hang off a parent"
            )));
        }
        let (key, id) = registry
            .reference_key(type_tag, child.fields())
            .ok_or_else(|| {
                EngineError::IdentityConflict(format!("cannot reparent unsaved {type_tag}"))
            })?;
        let payload = Entity::new(type_tag)
            .with(key, id)
            .with(PARENT_KEY, parent_id.clone());
        payloads.push((type_tag.to_string(), payload));
    }

    let patches = payloads.iter().map(|(type_tag, payload)| async move {
        debug!(type_tag = %type_tag, parent = ?payload.get(PARENT_KEY), "reparenting");
        store
            .patch(type_tag, payload)
            .await
            .map_err(|e| store_failure(type_tag, PARENT_KEY, e))?;
        Ok::<_, EngineError>(CommitOp {
            kind: OpKind::Patch,
            type_tag: type_tag.clone(),
            path: PARENT_KEY.to_string(),
        })
    });
    let ops = try_join_all(patches).await?;
    info!(children = ops.len(), attached = parent.is_some(), "children reparented");
    Ok(ops)
}

fn store_failure(type_tag: &str, path: &str, error: StoreError) -> EngineError {
    warn!(type_tag, path, error = %error, "store call failed during commit");
    EngineError::Store(error)
}

fn join_path(prefix: &str, key: &ChildKey) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
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
  T:
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string, required: true }
      - { name: status, type: string }
      - { name: owned, type: model, base_model: C }
      - { name: lines, type: list, base_model: C }
      - { name: members, type: list, ownership: foreign, base_model: P }
  C:
    fields:
      - { name: id, type: number, identity: true }
      - { name: val, type: number }
      - { name: inner, type: model, base_model: C }
  P:
    fields:
      - { name: id, type: number, identity: true }
  D:
    container: { kind: parent, container_type: T }
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string }
      - { name: parentId, type: number }
"#;

    fn registry() -> Arc<dyn ModelRegistry> {
        Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap())
    }

    #[tokio::test]
    async fn test_children_created_before_root() {
        let store = MemoryObjectStore::new();
        let entity = Entity::new("T")
            .with("name", "x")
            .with("owned", json!({ "model": "C", "val": 1 }));
        let mut inst = Instance::new(registry(), entity).unwrap();

        let report = commit(&mut inst, &store).await.unwrap();
        assert_eq!(
            store.ops().await,
            vec![
                (StoreOp::Create, "C".to_string()),
                (StoreOp::Create, "T".to_string())
            ]
        );
        let journal = store.journal().await;
        let root_payload = journal[1].payload.as_ref().unwrap();
        assert_eq!(root_payload["owned"]["id"], json!(1));
        assert!(report.created.is_some());
        assert!(inst.is_persisted());
        assert!(!inst.is_dirty());
    }

    #[tokio::test]
    async fn test_nested_children_commit_depth_first() {
        let store = MemoryObjectStore::new();
        let entity = Entity::new("T").with("name", "x").with(
            "owned",
            json!({ "model": "C", "val": 1, "inner": { "model": "C", "val": 2 } }),
        );
        let mut inst = Instance::new(registry(), entity).unwrap();
        let report = commit(&mut inst, &store).await.unwrap();

        let paths: Vec<&str> = report.operations.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["owned.inner", "owned", ""]);
        let journal = store.journal().await;
        // parent payload references the created inner child by identity
        assert_eq!(journal[1].payload.as_ref().unwrap()["inner"]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_clean_persisted_tree_is_noop() {
        let store = MemoryObjectStore::new();
        let entity = Entity::new("T")
            .with("id", 42)
            .with("name", "x")
            .with("owned", json!({ "model": "C", "id": 3, "val": 1 }));
        let mut inst = Instance::new(registry(), entity).unwrap();
        let report = commit(&mut inst, &store).await.unwrap();
        assert!(report.is_noop());
        assert!(store.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_patched_child_leaves_parent_clean() {
        let store = MemoryObjectStore::new();
        store
            .insert(Entity::new("C").with("id", 3).with("val", 1))
            .await;
        let entity = Entity::new("T")
            .with("id", 42)
            .with("owned", json!({ "model": "C", "id": 3, "val": 1 }));
        let mut inst = Instance::new(registry(), entity).unwrap();
        inst.child_for("owned").unwrap().set("val", json!(5)).unwrap();

        commit(&mut inst, &store).await.unwrap();
        assert_eq!(store.ops().await, vec![(StoreOp::Patch, "C".to_string())]);
        assert!(!inst.is_dirty());
    }

    #[tokio::test]
    async fn test_child_failure_leaves_tree_untouched() {
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::Create, Some("C")).await;
        let entity = Entity::new("T")
            .with("name", "x")
            .with("lines", json!([{ "model": "C", "val": 1 }]));
        let mut inst = Instance::new(registry(), entity).unwrap();
        inst.set("status", json!("open")).unwrap();
        let before = inst.entity().clone();

        let err = commit(&mut inst, &store).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(inst.entity(), &before);
        assert!(inst.changes().contains("status"));
        assert!(store.ops().await.is_empty());

        // retry succeeds
        commit(&mut inst, &store).await.unwrap();
        assert!(inst.is_persisted());
    }

    #[tokio::test]
    async fn test_root_failure_keeps_created_children() {
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::Create, Some("T")).await;
        let entity = Entity::new("T")
            .with("name", "x")
            .with("owned", json!({ "model": "C", "val": 1 }));
        let mut inst = Instance::new(registry(), entity).unwrap();

        assert!(commit(&mut inst, &store).await.is_err());
        assert_eq!(inst.get("owned").unwrap()["id"], json!(1));

        store.clear_journal().await;
        commit(&mut inst, &store).await.unwrap();
        // child is not created a second time
        assert_eq!(store.ops().await, vec![(StoreOp::Create, "T".to_string())]);
    }

    #[tokio::test]
    async fn test_memberships_flush_after_root_create() {
        let store = MemoryObjectStore::new();
        let mut inst = Instance::new(registry(), Entity::new("T").with("name", "x")).unwrap();
        inst.queue_membership("members", EntityRef::new("P", 9), true)
            .unwrap();

        let report = commit(&mut inst, &store).await.unwrap();
        let kinds: Vec<OpKind> = report.operations.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OpKind::Create, OpKind::Member]);
        let owner = report.created.unwrap();
        assert_eq!(
            store.members(&owner, "members").await,
            vec![EntityRef::new("P", 9)]
        );
        assert!(inst.memberships().is_empty());
    }

    #[tokio::test]
    async fn test_failed_membership_stays_queued() {
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::Member, None).await;
        let mut inst =
            Instance::new(registry(), Entity::new("T").with("id", 1).with("name", "x")).unwrap();
        inst.queue_membership("members", EntityRef::new("P", 9), true)
            .unwrap();

        let err = commit(&mut inst, &store).await.unwrap_err();
        assert!(matches!(err, EngineError::MembershipsPending { pending: 1, .. }));
        assert!(err.is_retryable());
        assert_eq!(inst.memberships().len(), 1);
        commit(&mut inst, &store).await.unwrap();
        assert!(inst.memberships().is_empty());
    }

    #[tokio::test]
    async fn test_membership_failure_keeps_created_root() {
        let store = MemoryObjectStore::new();
        store.fail_next(StoreOp::Member, None).await;
        let mut inst = Instance::new(registry(), Entity::new("T").with("name", "x")).unwrap();
        inst.queue_membership("members", EntityRef::new("P", 9), true)
            .unwrap();

        let err = commit(&mut inst, &store).await.unwrap_err();
        let report = err.saved_report().unwrap();
        assert_eq!(report.operations[0].kind, OpKind::Create);
        assert_eq!(report.created, inst.reference());
        assert!(inst.is_persisted());
        assert!(inst.changes().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_reissues_owned_children() {
        let store = MemoryObjectStore::new();
        let original = store
            .insert(
                Entity::new("T")
                    .with("name", "x")
                    .with("owned", json!({ "model": "C", "id": 77, "val": 1 })),
            )
            .await;
        let inst = Instance::new(registry(), original).unwrap();
        let mut copy = inst.duplicate();

        let report = commit(&mut copy, &store).await.unwrap();
        assert_eq!(
            store.ops().await,
            vec![
                (StoreOp::Create, "C".to_string()),
                (StoreOp::Create, "T".to_string())
            ]
        );
        let journal = store.journal().await;
        assert!(journal[0].payload.as_ref().unwrap().get("id").is_none());
        assert_ne!(copy.get("owned").unwrap()["id"], json!(77));
        assert!(report.created.is_some());
    }

    #[tokio::test]
    async fn test_commit_element_patches_row_only() {
        let store = MemoryObjectStore::new();
        let mut inst = Instance::new(
            registry(),
            Entity::new("T")
                .with("id", 1)
                .with("lines", json!([{ "model": "C", "val": 1 }])),
        )
        .unwrap();
        let key = ChildKey::Element("lines".into(), 0);
        let ops = commit_element(&mut inst, &store, &key).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert!(inst.get("lines").unwrap()[0]["id"].is_number());
        assert!(inst.changes().is_empty());
    }

    #[tokio::test]
    async fn test_reparent_sends_parent_id_only() {
        let store = MemoryObjectStore::new();
        let child = store.insert(Entity::new("D").with("name", "a").with("parentId", 0)).await;
        let id = child.get("id").cloned().unwrap();
        store.clear_journal().await;

        let owner = EntityRef::new("T", 7);
        let ops = reparent(&*registry(), &store, &[child.clone()], Some(&owner))
            .await
            .unwrap();
        assert_eq!(ops[0].kind, OpKind::Patch);
        let journal = store.journal().await;
        assert_eq!(
            journal[0].payload,
            Some(json!({ "model": "D", "id": id, "parentId": 7 }))
        );
        assert_eq!(store.records("D").await[0].get("name"), Some(&json!("a")));

        reparent(&*registry(), &store, &[child], None).await.unwrap();
        assert_eq!(store.records("D").await[0].get("parentId"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_reparent_checks_every_child_first() {
        let store = MemoryObjectStore::new();
        let child = store.insert(Entity::new("D").with("name", "a")).await;
        store.clear_journal().await;
        let owner = EntityRef::new("T", 7);

        let unsaved = Entity::new("D").with("name", "b");
        let err = reparent(&*registry(), &store, &[child.clone(), unsaved], Some(&owner))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentityConflict(_)));

        let loose = Entity::new("P").with("id", 3);
        let err = reparent(&*registry(), &store, &[child, loose], Some(&owner))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEntity(_)));
        assert!(store.journal().await.is_empty());
    }
}
