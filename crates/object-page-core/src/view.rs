//! Presentation view model
//!
//! Everything a renderer needs after each intent, derived from controller
//! state. Serializes to one JSON object.

use serde::Serialize;
use serde_json::Value;

use crate::commands::{CommandTable, RowStates};
use crate::controller::Mode;
use crate::instance::{ChildKey, Instance, Tracker};
use crate::schema::FormField;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldView {
    pub name: String,
    pub label: Option<String>,
    pub value: Value,
    pub dirty: bool,
    pub error: Option<String>,
    pub required: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowView {
    pub field: String,
    pub index: usize,
    pub selected: bool,
    pub editing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandView {
    pub field: String,
    pub key: String,
    pub label: Option<String>,
    pub kind: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewModel {
    pub type_tag: String,
    pub mode: Mode,
    pub active_tab: usize,
    pub tabs: Vec<String>,
    pub fields: Vec<FieldView>,
    pub rows: Vec<RowView>,
    pub commands: Vec<CommandView>,
    pub picker_active: bool,
    pub picker_depth: usize,
    pub persisted: bool,
    pub dirty: bool,
    pub full_screen: bool,
    pub design_buffer: Option<String>,
    pub error: Option<String>,
}

/// Fields on the active tab, or every declared field when the type has no form.
pub(crate) fn field_views(instance: &Instance, active_tab: usize) -> Vec<FieldView> {
    let registry = instance.registry();
    let type_tag = instance.type_tag();
    let form = registry.form_for(type_tag);
    let listed: Vec<(String, Option<&FormField>)> = match form.and_then(|f| f.tabs.get(active_tab)) {
        Some(tab) => tab
            .fields
            .iter()
            .map(|f| (f.name.clone(), Some(f)))
            .collect(),
        None => registry
            .fields(type_tag)
            .into_iter()
            .map(|d| (d.name.clone(), None))
            .collect(),
    };

    let tracker = instance.tracker();
    listed
        .into_iter()
        .filter_map(|(name, form_field)| {
            let descriptor = registry.field(type_tag, &name)?;
            Some(FieldView {
                label: form_field.and_then(|f| f.label.clone()),
                value: instance.get(&name).cloned().unwrap_or(Value::Null),
                dirty: tracker.changes().contains(&name) || nested_dirty(tracker, &name),
                error: field_error(tracker, &name),
                required: form_field
                    .and_then(|f| f.required)
                    .unwrap_or(descriptor.required),
                read_only: form_field
                    .and_then(|f| f.read_only)
                    .unwrap_or(descriptor.read_only),
                name,
            })
        })
        .collect()
}

pub(crate) fn row_views(rows: &RowStates) -> Vec<RowView> {
    rows.iter()
        .map(|(field, index, state)| RowView {
            field: field.to_string(),
            index,
            selected: state.selected,
            editing: state.editing,
        })
        .collect()
}

pub(crate) fn command_views(table: &CommandTable, instance: &Instance, rows: &RowStates) -> Vec<CommandView> {
    table
        .fields()
        .flat_map(|field| {
            table.commands(field).iter().map(move |command| CommandView {
                field: field.to_string(),
                key: command.key.clone(),
                label: command.label.clone(),
                kind: command.effective_kind(rows, field).name().to_string(),
                active: command.is_active(instance, rows, field),
            })
        })
        .collect()
}

fn child_trackers<'t>(tracker: &'t Tracker, field: &'t str) -> impl Iterator<Item = &'t Tracker> {
    tracker
        .children
        .iter()
        .filter(move |(key, _)| key.field() == field)
        .map(|(_, t)| t)
}

fn nested_dirty(tracker: &Tracker, field: &str) -> bool {
    child_trackers(tracker, field).any(Tracker::has_changes_deep)
}

/// The field's own error, else the first error found under its owned children.
fn field_error(tracker: &Tracker, field: &str) -> Option<String> {
    if let Some(message) = tracker.errors().get(field) {
        return Some(message.clone());
    }
    tracker
        .children
        .iter()
        .filter(|(key, _)| key.field() == field)
        .find_map(|(key, child)| first_error(child).map(|(path, m)| format!("{}: {m}", join(key, &path))))
}

fn first_error(tracker: &Tracker) -> Option<(String, String)> {
    if let Some((field, message)) = tracker.errors().iter().next() {
        return Some((field.clone(), message.clone()));
    }
    tracker
        .children
        .iter()
        .find_map(|(key, child)| first_error(child).map(|(path, m)| (join(key, &path), m)))
}

fn join(key: &ChildKey, rest: &str) -> String {
    format!("{key}.{rest}")
}
