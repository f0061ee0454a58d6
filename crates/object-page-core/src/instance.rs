//! Instance tree
//!
//! An [`Instance`] owns the root entity value plus a [`Tracker`] tree that
//! mirrors its owned children. Child nodes are mutable views ([`Node`]) over
//! the parent's value: there is exactly one copy of the data, so reading the
//! root entity always yields the current graph.
//!
//! A node's `changes` only lists its own fields. A parent counts as dirty
//! when its own set is non-empty or an owned child still needs a create.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{is_blank, is_identity_set, same_value, Entity, EntityRef, MODEL_KEY};
use crate::error::{EngineError, Result, ValidationReport};
use crate::membership::MembershipQueue;
use crate::schema::{FieldDescriptor, FormField, ModelRegistry, SemanticType, Selected};

// ── Tracker ─────────────────────────────────────────────────────

/// Position of an owned child under its parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildKey {
    Field(String),
    Element(String, usize),
}

impl ChildKey {
    pub fn field(&self) -> &str {
        match self {
            Self::Field(f) | Self::Element(f, _) => f,
        }
    }
}

impl std::fmt::Display for ChildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Element(name, index) => write!(f, "{name}[{index}]"),
        }
    }
}

/// Dirty and validation state for one node and its owned children.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tracker {
    pub(crate) changes: BTreeSet<String>,
    pub(crate) children: BTreeMap<ChildKey, Tracker>,
    pub(crate) errors: BTreeMap<String, String>,
}

impl Tracker {
    pub fn changes(&self) -> &BTreeSet<String> {
        &self.changes
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn child(&self, key: &ChildKey) -> Option<&Tracker> {
        self.children.get(key)
    }

    /// True when this node or any tracked descendant has changes.
    pub fn has_changes_deep(&self) -> bool {
        !self.changes.is_empty() || self.children.values().any(Tracker::has_changes_deep)
    }

    pub(crate) fn clear(&mut self) {
        self.changes.clear();
        self.errors.clear();
        self.children.clear();
    }

    fn collect_errors(&self, prefix: &str, report: &mut ValidationReport) {
        for (field, message) in &self.errors {
            report.insert(join_path(prefix, field), message.clone());
        }
        for (key, child) in &self.children {
            child.collect_errors(&join_path(prefix, &key.to_string()), report);
        }
    }

    fn drop_children_of(&mut self, field: &str) {
        self.children.retain(|key, _| key.field() != field);
    }

    fn reindex_after_removal(&mut self, field: &str, removed: &[usize]) {
        let old = std::mem::take(&mut self.children);
        self.children = old
            .into_iter()
            .filter_map(|(key, tracker)| match key {
                ChildKey::Element(f, i) if f == field => {
                    if removed.contains(&i) {
                        None
                    } else {
                        let shift = removed.iter().filter(|&&r| r < i).count();
                        Some((ChildKey::Element(f, i - shift), tracker))
                    }
                }
                other => Some((other, tracker)),
            })
            .collect();
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

// ── Node ────────────────────────────────────────────────────────

/// Mutable view over one entity in the tree.
pub struct Node<'a> {
    registry: &'a dyn ModelRegistry,
    type_tag: String,
    fields: &'a mut Map<String, Value>,
    tracker: &'a mut Tracker,
}

impl<'a> Node<'a> {
    pub(crate) fn new(
        registry: &'a dyn ModelRegistry,
        type_tag: impl Into<String>,
        fields: &'a mut Map<String, Value>,
        tracker: &'a mut Tracker,
    ) -> Self {
        Self {
            registry,
            type_tag: type_tag.into(),
            fields,
            tracker,
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &*self.fields
    }

    pub fn changes(&self) -> &BTreeSet<String> {
        &self.tracker.changes
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.tracker.errors
    }

    pub fn is_persisted(&self) -> bool {
        self.registry.is_persisted(&self.type_tag, &*self.fields)
    }

    /// Assign a field and record it as changed. Returns `false` when the value
    /// is unchanged (absent and null compare equal).
    pub fn set(&mut self, field: &str, value: Value) -> Result<bool> {
        let registry = self.registry;
        let descriptor = registry
            .field(&self.type_tag, field)
            .ok_or_else(|| EngineError::unknown_field(&self.type_tag, field))?;
        if same_value(self.fields.get(field), &value) {
            return Ok(false);
        }
        let nested = descriptor.is_owned_nested();
        self.fields.insert(field.to_string(), value);
        self.tracker.changes.insert(field.to_string());
        if nested {
            self.tracker.drop_children_of(field);
        }
        Ok(true)
    }

    /// Drop a field from the change set without touching its value.
    pub fn unset(&mut self, field: &str) -> bool {
        self.tracker.changes.remove(field)
    }

    pub(crate) fn reborrow(&mut self) -> Node<'_> {
        Node {
            registry: self.registry,
            type_tag: self.type_tag.clone(),
            fields: &mut *self.fields,
            tracker: &mut *self.tracker,
        }
    }

    /// Owned single-model child. A null value is replaced with a new primitive
    /// of the field's base model on first access.
    pub fn child_for(&mut self, field: &str) -> Result<Node<'_>> {
        self.reborrow().into_child(&ChildKey::Field(field.to_string()))
    }

    /// Element `index` of an owned list field.
    pub fn element_for(&mut self, field: &str, index: usize) -> Result<Node<'_>> {
        self.reborrow()
            .into_child(&ChildKey::Element(field.to_string(), index))
    }

    pub fn child_at(&mut self, key: &ChildKey) -> Result<Node<'_>> {
        self.reborrow().into_child(key)
    }

    pub(crate) fn into_child(self, key: &ChildKey) -> Result<Node<'a>> {
        let Node {
            registry,
            type_tag,
            fields,
            tracker,
        } = self;
        let slot = match key {
            ChildKey::Field(field) => {
                let base = owned_base(registry, &type_tag, field, SemanticType::Model)?;
                let slot = fields.entry(field.clone()).or_insert(Value::Null);
                if slot.is_null() {
                    *slot = registry.new_primitive(&base)?.into_value();
                }
                (slot, base)
            }
            ChildKey::Element(field, index) => {
                let base = owned_base(registry, &type_tag, field, SemanticType::List)?;
                let list = match fields.get_mut(field) {
                    Some(Value::Array(list)) => list,
                    _ => {
                        return Err(EngineError::IndexOutOfRange {
                            field: field.clone(),
                            index: *index,
                            len: 0,
                        })
                    }
                };
                let len = list.len();
                let slot = list.get_mut(*index).ok_or(EngineError::IndexOutOfRange {
                    field: field.clone(),
                    index: *index,
                    len,
                })?;
                if slot.is_null() {
                    *slot = registry.new_primitive(&base)?.into_value();
                }
                (slot, base)
            }
        };
        let (value, base) = slot;
        let map = value.as_object_mut().ok_or_else(|| {
            EngineError::InvalidEntity(format!("{type_tag}.{key} is not an object"))
        })?;
        let child_type = stamp_type(map, &base);
        let tracker = tracker.children.entry(key.clone()).or_default();
        Ok(Node {
            registry,
            type_tag: child_type,
            fields: map,
            tracker,
        })
    }

    /// Append to a list field, recording the change. Returns the new index.
    pub fn push_element(&mut self, field: &str, value: Value) -> Result<usize> {
        self.list_descriptor(field)?;
        let slot = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if slot.is_null() {
            *slot = Value::Array(Vec::new());
        }
        let list = slot.as_array_mut().ok_or_else(|| {
            EngineError::InvalidEntity(format!("{}.{field} is not a list", self.type_tag))
        })?;
        list.push(value);
        self.tracker.changes.insert(field.to_string());
        Ok(list.len() - 1)
    }

    /// Remove list elements by index, recording the change. Out-of-range
    /// indices are ignored. Returns the removed values in index order.
    pub fn remove_elements(&mut self, field: &str, indices: &[usize]) -> Result<Vec<Value>> {
        self.list_descriptor(field)?;
        let mut sorted: Vec<usize> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let Some(Value::Array(list)) = self.fields.get_mut(field) else {
            return Ok(Vec::new());
        };
        sorted.retain(|&i| i < list.len());
        if sorted.is_empty() {
            return Ok(Vec::new());
        }
        let mut removed = Vec::with_capacity(sorted.len());
        for &index in sorted.iter().rev() {
            removed.push(list.remove(index));
        }
        removed.reverse();
        self.tracker.changes.insert(field.to_string());
        self.tracker.reindex_after_removal(field, &sorted);
        Ok(removed)
    }

    fn list_descriptor(&self, field: &str) -> Result<&'a FieldDescriptor> {
        let registry = self.registry;
        let descriptor = registry
            .field(&self.type_tag, field)
            .ok_or_else(|| EngineError::unknown_field(&self.type_tag, field))?;
        if descriptor.semantic_type != SemanticType::List {
            return Err(EngineError::NotOwned {
                type_tag: self.type_tag.clone(),
                field: field.to_string(),
                expected: "list",
            });
        }
        Ok(descriptor)
    }

    /// Check every field against its descriptor and form overrides, then
    /// recurse into present owned children. Errors are stored on each node.
    pub fn validate(&mut self) -> bool {
        let registry = self.registry;
        let form = registry.form_for(&self.type_tag);
        let mut errors = BTreeMap::new();
        for descriptor in registry.fields(&self.type_tag) {
            if descriptor.is_virtual() {
                continue;
            }
            let form_field = form.and_then(|f| f.field(&descriptor.name));
            if form_field.is_some_and(|f| f.skip_validation) {
                continue;
            }
            let changed = self.tracker.changes.contains(&descriptor.name);
            if let Some(message) =
                check_field(descriptor, form_field, self.fields.get(&descriptor.name), changed)
            {
                errors.insert(descriptor.name.clone(), message);
            }
        }
        self.tracker.errors = errors;

        let mut valid = self.tracker.errors.is_empty();
        let slots = owned_slots(registry, &self.type_tag, &*self.fields);
        for (key, _) in slots {
            if let Ok(mut child) = self.child_at(&key) {
                valid &= child.validate();
            }
        }
        valid
    }

    pub fn patch_payload(&self) -> Option<Entity> {
        patch_payload(self.registry, &self.type_tag, &*self.fields, &*self.tracker)
    }

    pub fn create_payload(&self, strip_identity: bool) -> Entity {
        create_payload(self.registry, &self.type_tag, &*self.fields, strip_identity)
    }

    /// Reset a picker-bound field: null for object/string bindings, 0 for numbers.
    pub fn clear_field(&mut self, field: &str) -> Result<bool> {
        let registry = self.registry;
        let descriptor = registry
            .field(&self.type_tag, field)
            .ok_or_else(|| EngineError::unknown_field(&self.type_tag, field))?;
        let binding = descriptor.picker.as_ref().ok_or_else(|| {
            EngineError::PickerResolution(format!("{field} has no picker binding"))
        })?;
        let (owner, target) = split_target(&binding.target);
        let mut node = match owner {
            Some(owner) => self.child_for(owner)?,
            None => self.reborrow(),
        };
        let cleared = match &binding.selected {
            Selected::Object => Value::Null,
            Selected::Property(_) => {
                let numeric = registry
                    .field(&node.type_tag, target)
                    .is_some_and(|d| d.semantic_type == SemanticType::Number);
                if numeric {
                    Value::from(0)
                } else {
                    Value::Null
                }
            }
        };
        node.set(target, cleared)
    }
}

/// Split a picker target `owner.field` into its owned child and field.
pub(crate) fn split_target(target: &str) -> (Option<&str>, &str) {
    match target.split_once('.') {
        Some((owner, field)) => (Some(owner), field),
        None => (None, target),
    }
}

fn owned_base(
    registry: &dyn ModelRegistry,
    type_tag: &str,
    field: &str,
    expected: SemanticType,
) -> Result<String> {
    let descriptor = registry
        .field(type_tag, field)
        .ok_or_else(|| EngineError::unknown_field(type_tag, field))?;
    match (&descriptor.base_model, descriptor.is_owned_nested()) {
        (Some(base), true) if descriptor.semantic_type == expected => Ok(base.clone()),
        _ => Err(EngineError::NotOwned {
            type_tag: type_tag.to_string(),
            field: field.to_string(),
            expected: if expected == SemanticType::List {
                "list"
            } else {
                "model"
            },
        }),
    }
}

/// Ensure a nested object carries a type tag, defaulting to `base`.
fn stamp_type(map: &mut Map<String, Value>, base: &str) -> String {
    match map.get(MODEL_KEY).and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => {
            map.insert(MODEL_KEY.to_string(), Value::String(base.to_string()));
            base.to_string()
        }
    }
}

fn check_field(
    descriptor: &FieldDescriptor,
    form_field: Option<&FormField>,
    value: Option<&Value>,
    changed: bool,
) -> Option<String> {
    let read_only = form_field
        .and_then(|f| f.read_only)
        .unwrap_or(descriptor.read_only);
    if read_only && changed {
        return Some("read-only".to_string());
    }

    let required = form_field
        .and_then(|f| f.required)
        .unwrap_or(descriptor.required);
    if required {
        let missing = match (descriptor.semantic_type, value) {
            (SemanticType::Number, Some(Value::Number(n))) => n.as_f64() == Some(0.0),
            _ => is_blank(value),
        };
        if missing {
            return Some("required".to_string());
        }
        if !descriptor.limit.is_empty() {
            let allowed = value
                .and_then(Value::as_str)
                .is_some_and(|v| descriptor.limit.iter().any(|l| l == v));
            if !allowed {
                return Some(format!("must be one of {}", descriptor.limit.join(", ")));
            }
        }
    }

    match value {
        Some(Value::String(s)) => {
            let len = s.chars().count();
            if let Some(max) = descriptor.max_length {
                if len > max {
                    return Some(format!("longer than {max} characters"));
                }
            }
            if let Some(min) = descriptor.min_length {
                if len < min {
                    return Some(format!("shorter than {min} characters"));
                }
            }
        }
        Some(Value::Number(n)) => {
            let v = n.as_f64().unwrap_or_default();
            if let Some(min) = descriptor.min_value {
                if v < min {
                    return Some(format!("less than {min}"));
                }
            }
            if let Some(max) = descriptor.max_value {
                if v > max {
                    return Some(format!("greater than {max}"));
                }
            }
        }
        _ => {}
    }
    None
}

// ── Payloads and owned slots ────────────────────────────────────

/// Present owned children of a node with their resolved type tags.
pub(crate) fn owned_slots(
    registry: &dyn ModelRegistry,
    type_tag: &str,
    fields: &Map<String, Value>,
) -> Vec<(ChildKey, String)> {
    let mut slots = Vec::new();
    for descriptor in registry.fields(type_tag) {
        if !descriptor.is_owned_nested() {
            continue;
        }
        let Some(base) = descriptor.base_model.as_deref() else {
            continue;
        };
        match (descriptor.semantic_type, fields.get(&descriptor.name)) {
            (SemanticType::Model, Some(Value::Object(map))) => {
                slots.push((
                    ChildKey::Field(descriptor.name.clone()),
                    child_type(map, base),
                ));
            }
            (SemanticType::List, Some(Value::Array(items))) => {
                for (index, item) in items.iter().enumerate() {
                    if let Value::Object(map) = item {
                        slots.push((
                            ChildKey::Element(descriptor.name.clone(), index),
                            child_type(map, base),
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    slots
}

fn child_type(map: &Map<String, Value>, base: &str) -> String {
    map.get(MODEL_KEY)
        .and_then(Value::as_str)
        .unwrap_or(base)
        .to_string()
}

pub(crate) fn slot_map<'m>(
    fields: &'m Map<String, Value>,
    key: &ChildKey,
) -> Option<&'m Map<String, Value>> {
    match key {
        ChildKey::Field(f) => fields.get(f)?.as_object(),
        ChildKey::Element(f, i) => fields.get(f)?.as_array()?.get(*i)?.as_object(),
    }
}

pub(crate) fn write_slot(fields: &mut Map<String, Value>, key: &ChildKey, value: Map<String, Value>) {
    match key {
        ChildKey::Field(f) => {
            fields.insert(f.clone(), Value::Object(value));
        }
        ChildKey::Element(f, i) => {
            if let Some(slot) = fields
                .get_mut(f)
                .and_then(Value::as_array_mut)
                .and_then(|list| list.get_mut(*i))
            {
                *slot = Value::Object(value);
            }
        }
    }
}

/// Identity fields that are set, plus changed fields. `None` when a persisted
/// node has nothing to send.
pub(crate) fn patch_payload(
    registry: &dyn ModelRegistry,
    type_tag: &str,
    fields: &Map<String, Value>,
    tracker: &Tracker,
) -> Option<Entity> {
    let sent: Vec<&String> = tracker
        .changes
        .iter()
        .filter(|name| {
            !registry
                .field(type_tag, name)
                .is_some_and(|d| d.is_virtual() || d.is_membership_list())
        })
        .collect();
    if sent.is_empty() && registry.is_persisted(type_tag, fields) {
        return None;
    }
    let mut payload = Entity::new(type_tag);
    for name in registry.identity_fields(type_tag) {
        if let Some(value) = fields.get(&name) {
            if is_identity_set(Some(value)) {
                payload.insert(name, value.clone());
            }
        }
    }
    for name in sent {
        payload.insert(name.clone(), fields.get(name).cloned().unwrap_or(Value::Null));
    }
    Some(payload)
}

/// Full entity minus virtual fields and membership lists.
pub(crate) fn create_payload(
    registry: &dyn ModelRegistry,
    type_tag: &str,
    fields: &Map<String, Value>,
    strip_identity: bool,
) -> Entity {
    let identity = if strip_identity {
        registry.identity_fields(type_tag)
    } else {
        Vec::new()
    };
    let mut payload = Entity::new(type_tag);
    for (name, value) in fields {
        if name == MODEL_KEY || identity.contains(name) {
            continue;
        }
        if registry
            .field(type_tag, name)
            .is_some_and(|d| d.is_virtual() || d.is_membership_list())
        {
            continue;
        }
        payload.insert(name.clone(), value.clone());
    }
    payload
}

fn subtree_dirty(
    registry: &dyn ModelRegistry,
    type_tag: &str,
    fields: &Map<String, Value>,
    tracker: &Tracker,
    reissue_owned: bool,
) -> bool {
    if !tracker.changes.is_empty() {
        return true;
    }
    let empty = Tracker::default();
    owned_slots(registry, type_tag, fields)
        .into_iter()
        .any(|(key, child_type)| {
            let Some(child) = slot_map(fields, &key) else {
                return false;
            };
            reissue_owned
                || !registry.is_persisted(&child_type, child)
                || subtree_dirty(
                    registry,
                    &child_type,
                    child,
                    tracker.child(&key).unwrap_or(&empty),
                    false,
                )
        })
}

// ── Instance ────────────────────────────────────────────────────

/// Root of an editable entity graph.
#[derive(Clone)]
pub struct Instance {
    pub(crate) registry: Arc<dyn ModelRegistry>,
    pub(crate) type_tag: String,
    pub(crate) entity: Entity,
    pub(crate) tracker: Tracker,
    pub(crate) memberships: MembershipQueue,
    /// Set by `duplicate`: persisted owned children are re-created on the next commit
    pub(crate) reissue_owned: bool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("type_tag", &self.type_tag)
            .field("entity", &self.entity)
            .field("tracker", &self.tracker)
            .field("memberships", &self.memberships)
            .field("reissue_owned", &self.reissue_owned)
            .finish()
    }
}

impl Instance {
    pub fn new(registry: Arc<dyn ModelRegistry>, entity: Entity) -> Result<Self> {
        let type_tag = entity
            .type_tag()
            .ok_or_else(|| EngineError::InvalidEntity("entity has no type tag".to_string()))?
            .to_string();
        registry.require_model(&type_tag)?;
        Ok(Self {
            registry,
            type_tag,
            entity,
            tracker: Tracker::default(),
            memberships: MembershipQueue::default(),
            reissue_owned: false,
        })
    }

    /// New zero-valued record of `type_tag`.
    pub fn new_primitive(registry: Arc<dyn ModelRegistry>, type_tag: &str) -> Result<Self> {
        let entity = registry.new_primitive(type_tag)?;
        Self::new(registry, entity)
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn into_entity(self) -> Entity {
        self.entity
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn node(&mut self) -> Node<'_> {
        Node::new(
            &*self.registry,
            self.type_tag.clone(),
            self.entity.fields_mut(),
            &mut self.tracker,
        )
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.entity.get(field)
    }

    pub fn set(&mut self, field: &str, value: Value) -> Result<bool> {
        self.node().set(field, value)
    }

    pub fn unset(&mut self, field: &str) -> bool {
        self.tracker.changes.remove(field)
    }

    pub fn changes(&self) -> &BTreeSet<String> {
        &self.tracker.changes
    }

    pub fn child_for(&mut self, field: &str) -> Result<Node<'_>> {
        self.node()
            .into_child(&ChildKey::Field(field.to_string()))
    }

    pub fn element_for(&mut self, field: &str, index: usize) -> Result<Node<'_>> {
        self.node()
            .into_child(&ChildKey::Element(field.to_string(), index))
    }

    /// Walk owned children from the root.
    pub fn node_at(&mut self, path: &[ChildKey]) -> Result<Node<'_>> {
        let mut node = self.node();
        for key in path {
            node = node.into_child(key)?;
        }
        Ok(node)
    }

    /// Type of the owned node at `path`, resolved from descriptors only.
    pub fn type_at(&self, path: &[ChildKey]) -> Result<String> {
        let mut type_tag = self.type_tag.clone();
        for key in path {
            let expected = match key {
                ChildKey::Field(_) => SemanticType::Model,
                ChildKey::Element(..) => SemanticType::List,
            };
            type_tag = owned_base(&*self.registry, &type_tag, key.field(), expected)?;
        }
        Ok(type_tag)
    }

    pub fn validate(&mut self) -> bool {
        self.node().validate()
    }

    /// Errors recorded by the last `validate`, keyed by field path.
    pub fn validation_report(&self) -> ValidationReport {
        let mut report = ValidationReport::new();
        self.tracker.collect_errors("", &mut report);
        report
    }

    pub fn is_persisted(&self) -> bool {
        self.registry
            .is_persisted(&self.type_tag, self.entity.fields())
    }

    pub fn reference(&self) -> Option<EntityRef> {
        self.registry.reference(&self.entity)
    }

    /// Own changes, owned children needing create or patch, pending
    /// memberships, or a duplicate awaiting its first commit.
    pub fn is_dirty(&self) -> bool {
        self.reissue_owned
            || !self.memberships.is_empty()
            || subtree_dirty(
                &*self.registry,
                &self.type_tag,
                self.entity.fields(),
                &self.tracker,
                false,
            )
    }

    pub fn patch_payload(&self) -> Option<Entity> {
        patch_payload(
            &*self.registry,
            &self.type_tag,
            self.entity.fields(),
            &self.tracker,
        )
    }

    pub fn create_payload(&self) -> Entity {
        create_payload(&*self.registry, &self.type_tag, self.entity.fields(), false)
    }

    pub fn memberships(&self) -> &MembershipQueue {
        &self.memberships
    }

    /// Queue an association edge for a foreign list field.
    pub fn queue_membership(&mut self, relation: &str, target: EntityRef, add: bool) -> Result<()> {
        let is_membership = self
            .registry
            .field(&self.type_tag, relation)
            .map(FieldDescriptor::is_membership_list)
            .ok_or_else(|| EngineError::unknown_field(&self.type_tag, relation))?;
        if !is_membership {
            return Err(EngineError::NotOwned {
                type_tag: self.type_tag.clone(),
                field: relation.to_string(),
                expected: "foreign list",
            });
        }
        self.memberships.queue(relation, target, add);
        Ok(())
    }

    pub fn clear_field(&mut self, field: &str) -> Result<bool> {
        self.node().clear_field(field)
    }

    pub(crate) fn set_untracked(&mut self, field: &str, value: Value) {
        self.entity.insert(field.to_string(), value);
    }

    /// Structural copy without root identity or vault fields.
    ///
    /// Owned children keep their identities; the copy is flagged so they are
    /// re-created under the new root on its first commit. Foreign list members
    /// are queued as memberships of the copy.
    pub fn duplicate(&self) -> Instance {
        let registry = &*self.registry;
        let mut stripped = registry.identity_fields(&self.type_tag);
        stripped.extend(
            registry
                .fields(&self.type_tag)
                .into_iter()
                .filter(|f| f.vault)
                .map(|f| f.name.clone()),
        );

        let mut fields = Map::new();
        for (name, value) in self.entity.fields() {
            if stripped.contains(name) {
                continue;
            }
            fields.insert(name.clone(), clone_owned(registry, &self.type_tag, name, value));
        }

        let mut memberships = MembershipQueue::default();
        for descriptor in registry.fields(&self.type_tag) {
            if !descriptor.is_membership_list() {
                continue;
            }
            let members = self
                .entity
                .get(&descriptor.name)
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for member in members {
                if let Some(target) = Entity::from_value(member.clone())
                    .ok()
                    .and_then(|e| registry.reference(&e))
                {
                    memberships.queue(&descriptor.name, target, true);
                }
            }
        }

        Self {
            registry: self.registry.clone(),
            type_tag: self.type_tag.clone(),
            entity: Entity::from_map(fields),
            tracker: Tracker::default(),
            memberships,
            reissue_owned: true,
        }
    }
}

fn clone_owned(registry: &dyn ModelRegistry, type_tag: &str, field: &str, value: &Value) -> Value {
    let base = match registry.field(type_tag, field) {
        Some(d) if d.is_owned_nested() => d.base_model.as_deref().unwrap_or_default(),
        _ => return value.clone(),
    };
    match value {
        Value::Object(map) => Value::Object(clone_node(registry, base, map)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::Object(map) => Value::Object(clone_node(registry, base, map)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn clone_node(registry: &dyn ModelRegistry, base: &str, map: &Map<String, Value>) -> Map<String, Value> {
    let type_tag = child_type(map, base);
    let mut out = Map::new();
    out.insert(MODEL_KEY.to_string(), Value::String(type_tag.clone()));
    for (name, value) in map {
        if name == MODEL_KEY {
            continue;
        }
        out.insert(name.clone(), clone_owned(registry, &type_tag, name, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use proptest::prelude::*;
    use serde_json::json;

    const SCHEMA: &str = r#"
models:
  account:
    fields:
      - { name: id, type: number, identity: true }
      - { name: objectId, type: string, identity: true }
      - { name: name, type: string, required: true, max_length: 10 }
      - { name: code, type: string, read_only: true }
      - { name: balance, type: number, min_value: 0 }
      - { name: status, type: enum, required: true, limit: [OPEN, CLOSED] }
      - { name: vaultId, type: string, vault: true }
      - { name: owned, type: model, base_model: detail }
      - { name: items, type: list, base_model: line }
      - { name: members, type: list, ownership: foreign, base_model: person }
      - { name: owner, type: model, ownership: foreign, base_model: person,
          picker: { target: owner } }
      - { name: ownerId, type: number,
          picker: { target: ownerId, selected: id } }
      - { name: label, type: string, ownership: virtual }
  detail:
    fields:
      - { name: id, type: number, identity: true }
      - { name: val, type: string, required: true }
  line:
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string, required: true }
  person:
    fields:
      - { name: id, type: number, identity: true }
      - { name: name, type: string }
"#;

    fn registry() -> Arc<dyn ModelRegistry> {
        Arc::new(SchemaRegistry::from_yaml_str(SCHEMA).unwrap())
    }

    fn persisted_account() -> Instance {
        let entity = Entity::new("account")
            .with("id", 42)
            .with("name", "acme")
            .with("status", "OPEN")
            .with("vaultId", "v-1")
            .with("owned", json!({ "model": "detail", "id": 7, "val": "x" }))
            .with("items", json!([{ "model": "line", "id": 8, "name": "a" }]))
            .with("members", json!([{ "model": "person", "id": 3 }]));
        Instance::new(registry(), entity).unwrap()
    }

    #[test]
    fn set_records_change_once() {
        let mut inst = persisted_account();
        assert!(inst.set("name", json!("other")).unwrap());
        assert!(!inst.set("name", json!("other")).unwrap());
        assert_eq!(inst.changes().iter().collect::<Vec<_>>(), vec!["name"]);
        assert!(inst.is_dirty());
    }

    #[test]
    fn set_same_value_is_noop() {
        let mut inst = persisted_account();
        assert!(!inst.set("name", json!("acme")).unwrap());
        // absent equals null
        assert!(!inst.set("balance", Value::Null).unwrap());
        assert!(inst.changes().is_empty());
        assert!(!inst.is_dirty());
    }

    #[test]
    fn set_unknown_field_fails() {
        let mut inst = persisted_account();
        let err = inst.set("nope", json!(1)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownField { .. }));
    }

    #[test]
    fn child_changes_do_not_touch_parent() {
        let mut inst = persisted_account();
        inst.child_for("owned").unwrap().set("val", json!("y")).unwrap();
        assert!(inst.changes().is_empty());
        assert_eq!(inst.get("owned").unwrap()["val"], json!("y"));
        assert!(inst.is_dirty());
        let child = inst.tracker().child(&ChildKey::Field("owned".into())).unwrap();
        assert!(child.changes().contains("val"));
    }

    #[test]
    fn child_for_seeds_null_owned_value() {
        let registry = registry();
        let mut inst = Instance::new(registry, Entity::new("account")).unwrap();
        let child = inst.child_for("owned").unwrap();
        assert_eq!(child.type_tag(), "detail");
        assert!(!child.is_persisted());
        assert_eq!(inst.get("owned").unwrap()["model"], json!("detail"));
    }

    #[test]
    fn child_for_rejects_foreign_field() {
        let mut inst = persisted_account();
        let err = inst.child_for("owner").err().unwrap();
        assert!(matches!(err, EngineError::NotOwned { expected: "model", .. }));
        let err = inst.element_for("items", 5).err().unwrap();
        assert!(matches!(err, EngineError::IndexOutOfRange { len: 1, .. }));
    }

    #[test]
    fn validate_reports_required_and_read_only() {
        let registry = registry();
        let mut inst = Instance::new(registry, Entity::new("account")).unwrap();
        inst.set("code", json!("X")).unwrap();
        inst.set("balance", json!(-1)).unwrap();
        assert!(!inst.validate());
        let report = inst.validation_report();
        assert_eq!(report.get("name"), Some("required"));
        assert_eq!(report.get("status"), Some("required"));
        assert_eq!(report.get("code"), Some("read-only"));
        assert_eq!(report.get("balance"), Some("less than 0"));
    }

    #[test]
    fn validate_limit_and_length() {
        let mut inst = persisted_account();
        inst.set("status", json!("PENDING")).unwrap();
        inst.set("name", json!("far too long a name")).unwrap();
        assert!(!inst.validate());
        let report = inst.validation_report();
        assert_eq!(report.get("status"), Some("must be one of OPEN, CLOSED"));
        assert_eq!(report.get("name"), Some("longer than 10 characters"));
    }

    #[test]
    fn validate_recurses_into_owned_children() {
        let mut inst = persisted_account();
        inst.child_for("owned").unwrap().set("val", Value::Null).unwrap();
        inst.element_for("items", 0)
            .unwrap()
            .set("name", json!(""))
            .unwrap();
        assert!(!inst.validate());
        let report = inst.validation_report();
        assert_eq!(report.get("owned.val"), Some("required"));
        assert_eq!(report.get("items[0].name"), Some("required"));
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn patch_payload_has_identity_and_changes_only() {
        let mut inst = persisted_account();
        assert!(inst.patch_payload().is_none());
        inst.set("label", json!("display only")).unwrap();
        assert!(inst.patch_payload().is_none());
        inst.set("name", json!("renamed")).unwrap();
        inst.set("label", json!("display only")).unwrap();
        let payload = inst.patch_payload().unwrap();
        assert_eq!(
            payload.into_value(),
            json!({ "model": "account", "id": 42, "name": "renamed" })
        );
    }

    #[test]
    fn create_payload_excludes_virtual_and_membership_lists() {
        let mut inst = persisted_account();
        inst.set("label", json!("x")).unwrap();
        let payload = inst.create_payload();
        assert!(payload.get("label").is_none());
        assert!(payload.get("members").is_none());
        assert!(payload.get("owned").is_some());
    }

    #[test]
    fn remove_elements_reindexes_trackers() {
        let registry = registry();
        let entity = Entity::new("account").with(
            "items",
            json!([
                { "model": "line", "name": "a" },
                { "model": "line", "name": "b" },
                { "model": "line", "name": "c" }
            ]),
        );
        let mut inst = Instance::new(registry, entity).unwrap();
        inst.element_for("items", 2)
            .unwrap()
            .set("name", json!("c2"))
            .unwrap();
        let removed = inst.node().remove_elements("items", &[0]).unwrap();
        assert_eq!(removed[0]["name"], json!("a"));
        assert!(inst.changes().contains("items"));
        let moved = inst
            .tracker()
            .child(&ChildKey::Element("items".into(), 1))
            .unwrap();
        assert!(moved.changes().contains("name"));
        assert!(inst
            .tracker()
            .child(&ChildKey::Element("items".into(), 2))
            .is_none());
    }

    #[test]
    fn clear_field_resets_by_binding() {
        let mut inst = persisted_account();
        inst.set("owner", json!({ "model": "person", "id": 3 })).unwrap();
        inst.set("ownerId", json!(3)).unwrap();
        inst.tracker.clear();

        assert!(inst.clear_field("owner").unwrap());
        assert_eq!(inst.get("owner"), Some(&Value::Null));
        assert!(inst.clear_field("ownerId").unwrap());
        assert_eq!(inst.get("ownerId"), Some(&json!(0)));
        assert!(inst.changes().contains("owner"));

        let err = inst.clear_field("name").unwrap_err();
        assert!(matches!(err, EngineError::PickerResolution(_)));
    }

    #[test]
    fn duplicate_strips_root_identity_only() {
        let inst = persisted_account();
        let copy = inst.duplicate();
        assert!(!copy.is_persisted());
        assert!(copy.get("id").is_none());
        assert!(copy.get("vaultId").is_none());
        assert_eq!(copy.get("name"), inst.get("name"));
        // owned children keep identity until the copy is committed
        assert_eq!(copy.get("owned").unwrap()["id"], json!(7));
        assert!(copy.reissue_owned);
        assert!(copy.is_dirty());
        assert_eq!(copy.memberships().len(), 1);
    }

    #[test]
    fn queue_membership_requires_foreign_list() {
        let mut inst = persisted_account();
        inst.queue_membership("members", EntityRef::new("person", 4), true)
            .unwrap();
        assert!(inst.is_dirty());
        let err = inst
            .queue_membership("items", EntityRef::new("line", 1), true)
            .unwrap_err();
        assert!(matches!(err, EngineError::NotOwned { .. }));
    }

    proptest! {
        #[test]
        fn repeated_set_is_idempotent(name in "[a-z]{1,10}", repeats in 1usize..5) {
            let mut inst = persisted_account();
            for _ in 0..repeats {
                inst.set("name", json!(name.clone())).unwrap();
            }
            let expect_dirty = name != "acme";
            prop_assert_eq!(inst.changes().contains("name"), expect_dirty);
            prop_assert_eq!(inst.changes().len(), usize::from(expect_dirty));
            prop_assert_eq!(inst.get("name"), Some(&json!(name)));
        }
    }
}
