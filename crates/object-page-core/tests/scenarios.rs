//! End-to-end save scenarios against the in-memory store.

use std::sync::Arc;

use object_page_core::{
    ChildKey, Continuation, EngineError, Entity, Instance, ModelRegistry, ObjectController,
    MemoryObjectStore, PickerRequest, SchemaRegistry, StoreOp,
};
use serde_json::json;

const SCHEMA: &str = r#"
models:
  T:
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string, required: true }
      - { name: status, type: string }
      - { name: secret, type: string, vault: true }
      - { name: owned, type: model, base_model: C }
      - { name: members, type: list, ownership: foreign, base_model: P }
  C:
    fields:
      - { name: id, type: number, identity: true }
      - { name: val, type: number }
  P:
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string }
  U:
    fields:
      - { name: id, type: number, identity: true }
      - { name: first, type: string, required: true }
      - { name: second, type: string, required: true }
      - { name: code, type: string, max_length: 3 }
"#;

fn registry() -> Arc<dyn ModelRegistry> {
    Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap())
}

fn controller(store: &MemoryObjectStore, entity: Entity) -> ObjectController {
    ObjectController::builder(registry(), Arc::new(store.clone()))
        .bind_entity(entity)
        .unwrap()
}

#[tokio::test]
async fn test_new_root_with_owned_child() {
    let store = MemoryObjectStore::new();
    let entity = Entity::new("T")
        .with("name", "")
        .with("owned", json!({ "model": "C", "val": 1 }));
    let mut page = controller(&store, entity);

    let err = page.save().await.unwrap_err();
    match err {
        EngineError::Validation(report) => {
            assert_eq!(report.len(), 1);
            assert_eq!(report.get("name"), Some("required"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert!(store.journal().await.is_empty());

    page.set_field("name", json!("x")).unwrap();
    page.save().await.unwrap();

    let journal = store.journal().await;
    assert_eq!(journal.len(), 2);
    assert_eq!((journal[0].op, journal[0].type_tag.as_str()), (StoreOp::Create, "C"));
    assert_eq!(journal[0].payload, Some(json!({ "model": "C", "val": 1 })));

    assert_eq!((journal[1].op, journal[1].type_tag.as_str()), (StoreOp::Create, "T"));
    let root = journal[1].payload.clone().unwrap();
    assert_eq!(root["name"], "x");
    assert_eq!(root["owned"]["val"], 1);
    assert!(root["owned"]["id"].is_number(), "root must embed the created child");

    assert!(page.instance().is_persisted());
    assert!(!page.instance().is_dirty());
}

#[tokio::test]
async fn test_persisted_root_patch_sends_identity_and_change() {
    let store = MemoryObjectStore::new();
    let seeded = store
        .insert(
            Entity::new("T")
                .with("id", 42)
                .with("name", "a")
                .with("status", "open"),
        )
        .await;
    let mut page = controller(&store, seeded);

    page.set_field("status", json!("closed")).unwrap();
    page.save().await.unwrap();

    let journal = store.journal().await;
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].op, StoreOp::Patch);
    assert_eq!(
        journal[0].payload,
        Some(json!({ "model": "T", "id": 42, "status": "closed" }))
    );
}

#[tokio::test]
async fn test_clean_persisted_root_commits_nothing() {
    let store = MemoryObjectStore::new();
    let seeded = store
        .insert(
            Entity::new("T")
                .with("name", "a")
                .with("owned", json!({ "model": "C", "id": 5, "val": 2 })),
        )
        .await;
    let mut page = controller(&store, seeded);

    assert!(!page.set_field("name", json!("a")).unwrap());
    assert!(page.instance().changes().is_empty());

    let outcome = page.save().await.unwrap();
    assert!(outcome.report.is_noop());
    assert!(store.journal().await.is_empty());
}

#[tokio::test]
async fn test_nested_change_patches_child_only() {
    let store = MemoryObjectStore::new();
    let seeded = store
        .insert(
            Entity::new("T")
                .with("name", "a")
                .with("owned", json!({ "model": "C", "id": 5, "val": 2 })),
        )
        .await;
    store
        .insert(Entity::new("C").with("id", 5).with("val", 2))
        .await;
    let mut page = controller(&store, seeded);

    page.set_child_field(&[ChildKey::Field("owned".into())], "val", json!(3))
        .unwrap();
    assert!(page.instance().changes().is_empty());
    assert!(page.instance().is_dirty());

    page.save().await.unwrap();
    assert_eq!(store.ops().await, vec![(StoreOp::Patch, "C".to_string())]);
}

#[tokio::test]
async fn test_duplicate_then_save_creates() {
    let store = MemoryObjectStore::new();
    let seeded = store
        .insert(
            Entity::new("T")
                .with("name", "a")
                .with("status", "open")
                .with("secret", "vault-7")
                .with("owned", json!({ "model": "C", "id": 5, "val": 2 })),
        )
        .await;
    let mut page = controller(&store, seeded.clone());

    assert!(page.duplicate());
    let copy = page.instance().entity();
    assert_eq!(copy.get("id"), None);
    assert_eq!(copy.get("objectId"), None);
    assert_eq!(copy.get("secret"), None);
    assert_eq!(copy.get("name"), seeded.get("name"));
    assert_eq!(copy.get("status"), seeded.get("status"));

    page.save().await.unwrap();
    let ops: Vec<StoreOp> = store.ops().await.into_iter().map(|(op, _)| op).collect();
    assert_eq!(ops, vec![StoreOp::Create, StoreOp::Create]);
    assert_ne!(page.instance().get("id"), seeded.get("id"));
    assert_ne!(page.instance().get("owned").unwrap()["id"], json!(5));
}

#[tokio::test]
async fn test_validation_reports_every_violation() {
    let store = MemoryObjectStore::new();
    let mut page = controller(&store, Entity::new("U").with("code", "ABCD"));

    let err = page.save().await.unwrap_err();
    let EngineError::Validation(report) = err else {
        panic!("expected validation error");
    };
    assert_eq!(report.len(), 3);
    assert_eq!(report.get("first"), Some("required"));
    assert_eq!(report.get("second"), Some("required"));
    assert!(report.get("code").is_some());
    assert!(store.journal().await.is_empty());
}

#[tokio::test]
async fn test_foreign_selection_only_adds_edges() {
    let store = MemoryObjectStore::new();
    let person = store.insert(Entity::new("P").with("name", "Ada")).await;
    let seeded = store.insert(Entity::new("T").with("name", "a")).await;
    let mut page = controller(&store, seeded);

    page.open_picker(PickerRequest {
        target_type: "P".into(),
        container_path: None,
        continuation: Continuation::Append {
            field: "members".into(),
        },
    })
    .await
    .unwrap();
    page.resolve_picker(vec![person.clone()]).await.unwrap();
    page.save().await.unwrap();

    assert_eq!(store.ops().await, vec![(StoreOp::Member, "T".to_string())]);
    let owner = page.instance().reference().unwrap();
    let reference = registry().reference(&person).unwrap();
    assert_eq!(store.members(&owner, "members").await, vec![reference]);
    assert!(page.instance().memberships().is_empty());
}

#[test]
fn test_repeated_set_never_dirties() {
    let mut instance = Instance::new(
        registry(),
        Entity::new("T").with("id", 1).with("name", "a"),
    )
    .unwrap();
    for _ in 0..3 {
        assert!(!instance.set("name", json!("a")).unwrap());
        assert!(!instance.set("status", json!(null)).unwrap());
    }
    assert!(instance.changes().is_empty());
    assert!(!instance.is_dirty());
}
