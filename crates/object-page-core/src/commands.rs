//! Row commands for list fields
//!
//! Each list field rendered with a sub-form gets the commands declared on that
//! sub-form. Their `function` names are resolved to [`CommandKind`] when the
//! schema is loaded; custom kinds must have a registered handler by the time a
//! controller is built.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::entity::{is_blank, EntityRef};
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::picker::SessionId;
use crate::schema::{CommandDescriptor, CommandKind, ModelRegistry, RowCondition, SemanticType};

/// Application-specific command bound by name from a form descriptor.
pub trait CustomCommand: Send + Sync {
    fn run(&self, instance: &mut Instance, field: &str, rows: &[usize]) -> Result<CommandOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Updated,
    RowAdded { index: usize },
    RowsCommitted { count: usize },
    RowsRemoved { count: usize },
    PickerOpened { session: SessionId },
    Navigate { target: EntityRef },
    Nothing,
}

// ── Row states ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RowState {
    pub selected: bool,
    pub editing: bool,
}

/// Selection and edit flags per `(list field, row index)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowStates {
    rows: BTreeMap<(String, usize), RowState>,
}

impl RowStates {
    pub fn get(&self, field: &str, index: usize) -> RowState {
        self.rows
            .get(&(field.to_string(), index))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&mut self, field: &str, index: usize, state: RowState) {
        let key = (field.to_string(), index);
        if state == RowState::default() {
            self.rows.remove(&key);
        } else {
            self.rows.insert(key, state);
        }
    }

    pub fn set_selected(&mut self, field: &str, index: usize, selected: bool) {
        let mut state = self.get(field, index);
        state.selected = selected;
        self.set(field, index, state);
    }

    pub fn set_editing(&mut self, field: &str, index: usize, editing: bool) {
        let mut state = self.get(field, index);
        state.editing = editing;
        self.set(field, index, state);
    }

    pub fn selected_rows(&self, field: &str) -> Vec<usize> {
        self.rows_where(field, |s| s.selected)
    }

    pub fn editing_rows(&self, field: &str) -> Vec<usize> {
        self.rows_where(field, |s| s.editing)
    }

    pub fn any_selected(&self, field: &str) -> bool {
        !self.selected_rows(field).is_empty()
    }

    pub fn any_editing(&self, field: &str) -> bool {
        !self.editing_rows(field).is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, RowState)> {
        self.rows
            .iter()
            .map(|((field, index), state)| (field.as_str(), *index, *state))
    }

    pub fn clear_field(&mut self, field: &str) {
        self.rows.retain(|(f, _), _| f != field);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Drop states of removed rows and shift the ones after them down.
    pub(crate) fn remove_rows(&mut self, field: &str, removed: &[usize]) {
        let kept: Vec<(usize, RowState)> = self
            .rows
            .iter()
            .filter(|((f, i), _)| f == field && !removed.contains(i))
            .map(|((_, i), s)| {
                let shift = removed.iter().filter(|r| **r < *i).count();
                (i - shift, *s)
            })
            .collect();
        self.clear_field(field);
        for (index, state) in kept {
            self.rows.insert((field.to_string(), index), state);
        }
    }

    fn rows_where(&self, field: &str, pred: impl Fn(&RowState) -> bool) -> Vec<usize> {
        self.rows
            .iter()
            .filter(|((f, _), s)| f == field && pred(s))
            .map(|((_, i), _)| *i)
            .collect()
    }
}

// ── Command table ───────────────────────────────────────────────

/// A command as offered on one list field.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCommand {
    pub key: String,
    pub label: Option<String>,
    pub kind: CommandKind,
    pub condition: Vec<RowCondition>,
    pub alt_kind: Option<CommandKind>,
    pub alt_condition: Vec<RowCondition>,
    pub required_attribute: Option<String>,
}

impl From<&CommandDescriptor> for RowCommand {
    fn from(d: &CommandDescriptor) -> Self {
        Self {
            key: d.key.clone(),
            label: d.label.clone(),
            kind: d.function.clone(),
            condition: d.condition.clone(),
            alt_kind: d.alt_function.clone(),
            alt_condition: d.alt_condition.clone(),
            required_attribute: d.required_attribute.clone(),
        }
    }
}

impl RowCommand {
    /// A command with a required attribute and no row condition is active
    /// exactly when the parent carries that attribute. Otherwise it is active
    /// without a condition, or when a row in the named state exists.
    pub fn is_active(&self, instance: &Instance, rows: &RowStates, field: &str) -> bool {
        if let Some(attribute) = &self.required_attribute {
            let present = !is_blank(instance.get(attribute));
            if self.condition.is_empty() || !present {
                return present;
            }
        }
        if self.condition.is_empty() {
            return true;
        }
        self.condition.iter().any(|c| match c {
            RowCondition::Select => rows.any_selected(field),
            RowCondition::Edit => rows.any_editing(field),
        })
    }

    /// Kind to run given the current row states.
    pub fn effective_kind(&self, rows: &RowStates, field: &str) -> &CommandKind {
        let Some(alt) = &self.alt_kind else {
            return &self.kind;
        };
        let alternate = self.alt_condition.iter().any(|c| match c {
            RowCondition::Select => rows.any_selected(field),
            RowCondition::Edit => rows.any_editing(field),
        });
        if alternate {
            alt
        } else {
            &self.kind
        }
    }

    fn custom_names(&self) -> impl Iterator<Item = &str> {
        [Some(&self.kind), self.alt_kind.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|k| match k {
                CommandKind::Custom(name) => Some(name.as_str()),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FieldCommands {
    commands: Vec<RowCommand>,
    standard_update: bool,
}

/// Commands per list field of one root type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandTable {
    fields: BTreeMap<String, FieldCommands>,
}

impl CommandTable {
    /// Collect the sub-form commands of every list field of `type_tag`.
    ///
    /// The sub-form is the one named on the root form's field, falling back
    /// to the form of the list's base model.
    pub fn build(
        registry: &dyn ModelRegistry,
        type_tag: &str,
        handlers: &HashMap<String, Arc<dyn CustomCommand>>,
    ) -> Result<Self> {
        let root_form = registry.form_for(type_tag);
        let mut fields = BTreeMap::new();
        for descriptor in registry.fields(type_tag) {
            if descriptor.semantic_type != SemanticType::List {
                continue;
            }
            let named = root_form
                .and_then(|f| f.field(&descriptor.name))
                .and_then(|f| f.form.as_deref());
            let sub_form = match named {
                Some(name) => Some(registry.form(name).ok_or_else(|| {
                    EngineError::Schema(format!("{type_tag}.{} names unknown form {name}", descriptor.name))
                })?),
                None => descriptor
                    .base_model
                    .as_deref()
                    .and_then(|base| registry.form_for(base)),
            };
            let Some(sub_form) = sub_form.filter(|f| !f.commands.is_empty()) else {
                continue;
            };
            let commands: Vec<RowCommand> = sub_form.commands.iter().map(RowCommand::from).collect();
            for command in &commands {
                if let Some(missing) = command.custom_names().find(|n| !handlers.contains_key(*n)) {
                    return Err(EngineError::Schema(format!(
                        "no handler registered for custom command {missing}"
                    )));
                }
            }
            fields.insert(
                descriptor.name.clone(),
                FieldCommands {
                    commands,
                    standard_update: sub_form.standard_update,
                },
            );
        }
        Ok(Self { fields })
    }

    pub fn commands(&self, field: &str) -> &[RowCommand] {
        self.fields
            .get(field)
            .map(|f| f.commands.as_slice())
            .unwrap_or_default()
    }

    pub fn find(&self, field: &str, key: &str) -> Option<&RowCommand> {
        self.commands(field).iter().find(|c| c.key == key)
    }

    pub fn standard_update(&self, field: &str) -> bool {
        self.fields.get(field).is_some_and(|f| f.standard_update)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}
