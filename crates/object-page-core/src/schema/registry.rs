//! Model registry
//!
//! The [`ModelRegistry`] port resolves type tags to descriptors. Inheritance
//! is flattened on lookup: base fields come first, an earlier base wins over
//! a later one, and a subtype's field of the same name replaces the inherited
//! one.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{
    ContainerSpec, DesignSpec, FieldDescriptor, FormDescriptor, ModelDescriptor, SemanticType,
};
use crate::entity::{is_identity_set, Entity, EntityRef};
use crate::error::{EngineError, Result};
use crate::instance::split_target;

/// Store-assigned identity keys, treated as identity whether declared or not.
const CONVENTIONAL_IDENTITY: [&str; 3] = ["id", "objectId", "urn"];

/// Read-only lookup of model and form descriptors.
pub trait ModelRegistry: Send + Sync {
    fn model(&self, type_tag: &str) -> Option<&ModelDescriptor>;

    fn form(&self, name: &str) -> Option<&FormDescriptor>;

    fn require_model(&self, type_tag: &str) -> Result<&ModelDescriptor> {
        self.model(type_tag)
            .ok_or_else(|| EngineError::UnknownModel(type_tag.to_string()))
    }

    /// All fields of a type, inherited ones included.
    fn fields(&self, type_tag: &str) -> Vec<&FieldDescriptor> {
        let mut visited = HashSet::new();
        collect_fields(self, type_tag, &mut visited)
    }

    fn field(&self, type_tag: &str, name: &str) -> Option<&FieldDescriptor> {
        self.fields(type_tag).into_iter().find(|f| f.name == name)
    }

    fn form_for(&self, type_tag: &str) -> Option<&FormDescriptor> {
        let mut visited = HashSet::new();
        find_in_lineage(self, type_tag, &mut visited, &|m| {
            self.form(m.form_name())
        })
    }

    fn container(&self, type_tag: &str) -> Option<&ContainerSpec> {
        let mut visited = HashSet::new();
        find_in_lineage(self, type_tag, &mut visited, &|m| {
            m.container.as_ref()
        })
    }

    fn design(&self, type_tag: &str) -> Option<&DesignSpec> {
        let mut visited = HashSet::new();
        find_in_lineage(self, type_tag, &mut visited, &|m| {
            m.design.as_ref()
        })
    }

    /// Declared identity fields in declaration order, then the conventional
    /// store keys not already declared.
    fn identity_fields(&self, type_tag: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields(type_tag)
            .into_iter()
            .filter(|f| f.identity)
            .map(|f| f.name.clone())
            .collect();
        for conventional in CONVENTIONAL_IDENTITY {
            if !names.iter().any(|n| n == conventional) {
                names.push(conventional.to_string());
            }
        }
        names
    }

    /// First set identity field; used for patch, delete, membership and dedupe.
    fn reference_key(&self, type_tag: &str, fields: &Map<String, Value>) -> Option<(String, Value)> {
        self.identity_fields(type_tag).into_iter().find_map(|name| {
            let value = fields.get(&name)?;
            is_identity_set(Some(value)).then(|| (name, value.clone()))
        })
    }

    fn reference(&self, entity: &Entity) -> Option<EntityRef> {
        let type_tag = entity.type_tag()?;
        let (_, id) = self.reference_key(type_tag, entity.fields())?;
        Some(EntityRef::new(type_tag, id))
    }

    fn is_persisted(&self, type_tag: &str, fields: &Map<String, Value>) -> bool {
        self.reference_key(type_tag, fields).is_some()
    }

    /// Zero-valued entity of the given type. Abstract models have none.
    fn new_primitive(&self, type_tag: &str) -> Result<Entity> {
        if self.require_model(type_tag)?.is_abstract {
            return Err(EngineError::InvalidEntity(format!(
                "{type_tag} is abstract"
            )));
        }
        let mut entity = Entity::new(type_tag);
        for field in self.fields(type_tag) {
            if field.identity || field.is_virtual() {
                continue;
            }
            entity.insert(field.name.clone(), field.zero_value());
        }
        Ok(entity)
    }
}

/// Bases in declaration order, first declaration of a name wins among them;
/// the type's own declaration then replaces the inherited one in place.
fn collect_fields<'r, R: ModelRegistry + ?Sized>(
    registry: &'r R,
    type_tag: &str,
    visited: &mut HashSet<String>,
) -> Vec<&'r FieldDescriptor> {
    let mut out: Vec<&'r FieldDescriptor> = Vec::new();
    if !visited.insert(type_tag.to_string()) {
        return out;
    }
    let Some(model) = registry.model(type_tag) else {
        return out;
    };
    for base in &model.inherits {
        for field in collect_fields(registry, base, visited) {
            if !out.iter().any(|f| f.name == field.name) {
                out.push(field);
            }
        }
    }
    for field in &model.fields {
        match out.iter_mut().find(|f| f.name == field.name) {
            Some(slot) => *slot = field,
            None => out.push(field),
        }
    }
    out
}

fn find_in_lineage<'r, R, T, F>(
    registry: &'r R,
    type_tag: &str,
    visited: &mut HashSet<String>,
    pick: &F,
) -> Option<&'r T>
where
    R: ModelRegistry + ?Sized,
    T: ?Sized,
    F: Fn(&'r ModelDescriptor) -> Option<&'r T>,
{
    if !visited.insert(type_tag.to_string()) {
        return None;
    }
    let model = registry.model(type_tag)?;
    if let Some(found) = pick(model) {
        return Some(found);
    }
    model
        .inherits
        .iter()
        .find_map(|base| find_in_lineage(registry, base, visited, pick))
}

// ── YAML-backed registry ────────────────────────────────────────

/// Root structure of a schema file.
#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    models: HashMap<String, ModelDescriptor>,
    #[serde(default)]
    forms: HashMap<String, FormDescriptor>,
}

/// Registry of model and form descriptors, immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    models: HashMap<String, ModelDescriptor>,
    forms: HashMap<String, FormDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    pub fn with_form(mut self, name: impl Into<String>, form: FormDescriptor) -> Self {
        self.forms.insert(name.into(), form);
        self
    }

    /// Load from a YAML string and run load-time checks.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: SchemaFile =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Schema(e.to_string()))?;
        let models = file
            .models
            .into_iter()
            .map(|(name, mut model)| {
                model.name = name.clone();
                (name, model)
            })
            .collect();
        let registry = Self {
            models,
            forms: file.forms,
        };
        registry.check()?;
        Ok(registry)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Schema(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }

    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Verify cross references: inherits, base models, form fields, picker targets.
    pub fn check(&self) -> Result<()> {
        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();
        for name in names {
            let model = &self.models[name];
            for base in &model.inherits {
                if !self.models.contains_key(base) {
                    return Err(EngineError::Schema(format!(
                        "model {name} inherits unknown model {base}"
                    )));
                }
            }
            self.check_acyclic(name)?;

            let fields = self.fields(name);
            for field in &fields {
                if let Some(base) = &field.base_model {
                    if !self.models.contains_key(base) {
                        return Err(EngineError::Schema(format!(
                            "field {name}.{} references unknown model {base}",
                            field.name
                        )));
                    }
                }
                if let Some(picker) = &field.picker {
                    if !self.picker_target_exists(&fields, &picker.target) {
                        return Err(EngineError::Schema(format!(
                            "picker on {name}.{} targets unknown field {}",
                            field.name, picker.target
                        )));
                    }
                }
            }

            if let Some(form) = self.form(model.form_name()) {
                for form_field in form.tabs.iter().flat_map(|t| t.fields.iter()) {
                    if !fields.iter().any(|f| f.name == form_field.name) {
                        return Err(EngineError::Schema(format!(
                            "form {} lists unknown field {} of {name}",
                            model.form_name(),
                            form_field.name
                        )));
                    }
                    if let Some(sub) = &form_field.form {
                        if !self.forms.contains_key(sub) {
                            return Err(EngineError::Schema(format!(
                                "form field {name}.{} names unknown form {sub}",
                                form_field.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// `field` on the model itself, or `owner.field` where `owner` is an
    /// owned model field and `field` is declared on its base model.
    fn picker_target_exists(&self, fields: &[&FieldDescriptor], target: &str) -> bool {
        let (owner, field) = split_target(target);
        let Some(owner) = owner else {
            return fields.iter().any(|f| f.name == field);
        };
        let base = fields.iter().find(|f| {
            f.name == owner && f.is_owned_nested() && f.semantic_type == SemanticType::Model
        });
        match base.and_then(|f| f.base_model.as_deref()) {
            Some(base) => self.field(base, field).is_some(),
            None => false,
        }
    }

    fn check_acyclic(&self, start: &str) -> Result<()> {
        fn walk(
            models: &HashMap<String, ModelDescriptor>,
            name: &str,
            path: &mut Vec<String>,
        ) -> Result<()> {
            if path.iter().any(|p| p == name) {
                path.push(name.to_string());
                return Err(EngineError::Schema(format!(
                    "inheritance cycle: {}",
                    path.join(" -> ")
                )));
            }
            path.push(name.to_string());
            if let Some(model) = models.get(name) {
                for base in &model.inherits {
                    walk(models, base, path)?;
                }
            }
            path.pop();
            Ok(())
        }
        walk(&self.models, start, &mut Vec::new())
    }
}

impl ModelRegistry for SchemaRegistry {
    fn model(&self, type_tag: &str) -> Option<&ModelDescriptor> {
        self.models.get(type_tag)
    }

    fn form(&self, name: &str) -> Option<&FormDescriptor> {
        self.forms.get(name)
    }
}
