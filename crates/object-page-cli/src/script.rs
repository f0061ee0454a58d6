//! Replay scripts
//!
//! ```yaml
//! bind:
//!   new_record: { type: ticket }
//! seed:
//!   - { model: person, name: Ada }
//! steps:
//!   - set_field: { name: title, value: Broken build }
//!   - save
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use object_page_core::{
    Entity, Intent, MemoryObjectStore, ObjectController, ObjectControllerBuilder,
};

/// How the controller gets its record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bind {
    NewRecord {
        #[serde(rename = "type")]
        type_tag: String,
        #[serde(default)]
        container: Option<Entity>,
    },
    Load {
        #[serde(rename = "type")]
        type_tag: String,
        id: Value,
    },
    Entity(Entity),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReplayScript {
    pub bind: Bind,

    /// Records inserted into the memory store before binding
    #[serde(default)]
    pub seed: Vec<Entity>,

    #[serde(default)]
    pub steps: Vec<Intent>,
}

impl ReplayScript {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse replay script")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&content)
    }
}

pub async fn seed(store: &MemoryObjectStore, records: &[Entity]) {
    for record in records {
        store.insert(record.clone()).await;
    }
}

pub async fn bind(builder: ObjectControllerBuilder, bind: Bind) -> Result<ObjectController> {
    let controller = match bind {
        Bind::NewRecord {
            type_tag,
            container,
        } => builder.new_record(&type_tag, container.as_ref()),
        Bind::Load { type_tag, id } => builder.load(&type_tag, id).await,
        Bind::Entity(entity) => builder.bind_entity(entity),
    };
    controller.context("Failed to bind record")
}

/// Dispatch each step and produce one JSON line per step. A failing step is
/// reported and the replay continues.
pub async fn replay(controller: &mut ObjectController, steps: Vec<Intent>) -> Vec<Value> {
    let mut lines = Vec::with_capacity(steps.len());
    for (index, intent) in steps.into_iter().enumerate() {
        let line = match controller.dispatch(intent).await {
            Ok(outcome) => json!({
                "step": index,
                "outcome": outcome,
                "view": controller.view(),
            }),
            Err(e) => {
                warn!(step = index, error = %e, "step failed");
                json!({
                    "step": index,
                    "error": { "kind": e.kind(), "message": e.to_string() },
                    "view": controller.view(),
                })
            }
        };
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_page_core::{ModelRegistry, SchemaRegistry, StoreOp};
    use std::sync::Arc;

    const SCHEMA: &str = r#"
models:
  ticket:
    fields:
      - { name: id, type: number, identity: true }
      - { name: title, type: string, required: true }
"#;

    const SCRIPT: &str = r#"
bind:
  new_record: { type: ticket }
steps:
  - save
  - set_field: { name: title, value: Broken build }
  - save
  - select_tab: { index: 3 }
"#;

    #[test]
    fn test_parse_script() {
        let script = ReplayScript::from_yaml_str(SCRIPT).unwrap();
        assert_eq!(
            script.bind,
            Bind::NewRecord {
                type_tag: "ticket".into(),
                container: None
            }
        );
        assert_eq!(script.steps.len(), 4);
        assert_eq!(script.steps[0], Intent::Save);
    }

    #[test]
    fn test_script_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, SCRIPT.as_bytes()).unwrap();
        let script = ReplayScript::from_file(file.path()).unwrap();
        assert_eq!(script.steps.len(), 4);

        let missing = ReplayScript::from_file(Path::new("/nonexistent/script.yaml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read"));
    }

    #[tokio::test]
    async fn test_replay_reports_errors_and_continues() {
        let registry: Arc<dyn ModelRegistry> = Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap());
        let store = MemoryObjectStore::new();
        let script = ReplayScript::from_yaml_str(SCRIPT).unwrap();
        let builder = ObjectController::builder(registry, Arc::new(store.clone()));
        let mut controller = bind(builder, script.bind).await.unwrap();

        let lines = replay(&mut controller, script.steps).await;
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["error"]["kind"], "validation");
        assert_eq!(lines[1]["outcome"]["changed"], true);
        assert_eq!(lines[2]["outcome"]["outcome"], "saved");
        assert_eq!(lines[2]["view"]["persisted"], true);
        assert_eq!(lines[3]["error"]["kind"], "usage");
        assert_eq!(store.ops().await, vec![(StoreOp::Create, "ticket".to_string())]);
    }

    #[tokio::test]
    async fn test_load_bind_uses_seed() {
        let registry: Arc<dyn ModelRegistry> = Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap());
        let store = MemoryObjectStore::new();
        let script = ReplayScript::from_yaml_str(
            "bind:\n  load: { type: ticket, id: 1 }\nseed:\n  - { model: ticket, title: Seeded }\n",
        )
        .unwrap();
        seed(&store, &script.seed).await;
        let builder = ObjectController::builder(registry, Arc::new(store.clone()));
        let controller = bind(builder, script.bind).await.unwrap();
        assert_eq!(controller.instance().get("title"), Some(&json!("Seeded")));
    }
}
