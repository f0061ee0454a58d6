//! Object controller
//!
//! Presentation-facing state machine around one root [`Instance`]. Every user
//! action arrives as an [`Intent`]; the controller validates, mutates the
//! instance, drives pickers and row commands, runs the commit protocol on
//! save, and exposes a [`ViewModel`] for rendering.
//!
//! ```text
//! Viewing --edit--> Editing --save--> Committing --ok--> Viewing
//!                      ^                  |
//!                      +------error-------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::commands::{CommandOutcome, CommandTable, CustomCommand, RowState, RowStates};
use crate::commit::{commit, commit_element, reparent, CommitReport, PARENT_KEY};
use crate::config::ControllerConfig;
use crate::entity::{is_identity_set, Entity, EntityRef};
use crate::error::{EngineError, Result, StoreError};
use crate::instance::{split_target, ChildKey, Instance};
use crate::picker::{
    apply_resolution, field_request, resolve_target_type, Continuation, PickerRequest,
    PickerStack, SessionId,
};
use crate::schema::{CommandKind, ContainerKind, ModelRegistry, SemanticType, Selected};
use crate::store::{ObjectStore, Query};
use crate::view::{command_views, field_views, row_views, ViewModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Viewing,
    Editing,
    Committing,
}

/// One user action. Doubles as a step of a replay script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SetField {
        name: String,
        value: Value,
    },
    SetChildField {
        #[serde(default)]
        path: Vec<ChildKey>,
        name: String,
        value: Value,
    },
    UnsetField {
        name: String,
    },
    ClearField {
        name: String,
    },
    SelectTab {
        index: usize,
    },
    Save,
    Cancel,
    Duplicate,
    Delete,
    ToggleFullScreen,
    EnterDesignMode,
    EditDesignBuffer {
        text: String,
    },
    ExitDesignMode,
    OpenFieldPicker {
        field: String,
    },
    OpenPicker(PickerRequest),
    ResolvePicker {
        #[serde(default)]
        selected: Vec<Entity>,
    },
    CancelPicker,
    SelectRow {
        field: String,
        index: usize,
        #[serde(default = "default_true")]
        selected: bool,
    },
    RowCommand {
        field: String,
        command: String,
    },
    OpenFieldTarget {
        field: String,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IntentOutcome {
    Changed { changed: bool },
    TabSelected { index: usize },
    Saved(SaveOutcome),
    PickerClosed { session: SessionId },
    Discarded,
    Duplicated { duplicated: bool },
    Deleted { target: EntityRef },
    FullScreen { full_screen: bool },
    DesignMode { active: bool },
    PickerOpened { session: SessionId },
    PickerResolved,
    RowSelected,
    Command { result: CommandOutcome },
    Target { target: Option<EntityRef> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub report: CommitReport,
    /// Where to navigate after a new record was created
    pub navigate: Option<EntityRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    PickerClosed(SessionId),
    Discarded,
}

// ── Builder ─────────────────────────────────────────────────────

pub struct ObjectControllerBuilder {
    registry: Arc<dyn ModelRegistry>,
    store: Arc<dyn ObjectStore>,
    config: ControllerConfig,
    handlers: HashMap<String, Arc<dyn CustomCommand>>,
}

impl ObjectControllerBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn custom_command(mut self, name: impl Into<String>, handler: Arc<dyn CustomCommand>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Bind an existing instance.
    pub fn bind(self, instance: Instance) -> Result<ObjectController> {
        let commands = CommandTable::build(&*self.registry, instance.type_tag(), &self.handlers)?;
        let mode = if instance.is_dirty() {
            Mode::Editing
        } else {
            Mode::Viewing
        };
        debug!(type_tag = %instance.type_tag(), persisted = instance.is_persisted(), "controller bound");
        Ok(ObjectController {
            baseline: instance.clone(),
            registry: self.registry,
            store: self.store,
            config: self.config,
            instance,
            mode,
            active_tab: 0,
            rows: RowStates::default(),
            pickers: PickerStack::new(),
            commands,
            handlers: self.handlers,
            full_screen: false,
            design_buffer: None,
            last_error: None,
            discarded: false,
        })
    }

    pub fn bind_entity(self, entity: Entity) -> Result<ObjectController> {
        let instance = Instance::new(self.registry.clone(), entity)?;
        self.bind(instance)
    }

    /// Fetch a persisted record by its reference key and bind it.
    pub async fn load(self, type_tag: &str, id: Value) -> Result<ObjectController> {
        let key = self
            .registry
            .identity_fields(type_tag)
            .into_iter()
            .next()
            .unwrap_or_else(|| "id".to_string());
        self.registry.require_model(type_tag)?;
        let query = Query::new(type_tag)
            .equals(key, id.clone())
            .limit(self.config.load_page_size.max(1));
        let results = self.store.search(&query).await?;
        let mut entity = results.results.into_iter().next().ok_or_else(|| {
            StoreError::NotFound(EntityRef::new(type_tag, id).to_string())
        })?;
        if entity.type_tag().is_none() {
            entity.set_type_tag(type_tag);
        }
        info!(type_tag, "record loaded");
        self.bind_entity(entity)
    }

    /// Bind a fresh zero-valued record, seeded from its container if given.
    pub fn new_record(self, type_tag: &str, container: Option<&Entity>) -> Result<ObjectController> {
        let mut entity = self.registry.new_primitive(type_tag)?;
        if let (Some(spec), Some(container)) = (self.registry.container(type_tag), container) {
            let container_id = self
                .registry
                .reference(container)
                .map(|r| r.id)
                .unwrap_or(Value::Null);
            let path = container.get("path").cloned().unwrap_or(Value::Null);
            match spec.kind {
                ContainerKind::Group => {
                    entity.insert("groupId", container_id);
                    entity.insert("groupPath", path);
                }
                ContainerKind::Parent => {
                    entity.insert(PARENT_KEY, container_id);
                    entity.insert("path", path);
                }
            }
        }
        self.bind_entity(entity)
    }
}

// ── Controller ──────────────────────────────────────────────────

pub struct ObjectController {
    registry: Arc<dyn ModelRegistry>,
    store: Arc<dyn ObjectStore>,
    config: ControllerConfig,
    instance: Instance,
    /// Last committed (or bound) state, restored by cancel
    baseline: Instance,
    mode: Mode,
    active_tab: usize,
    rows: RowStates,
    pickers: PickerStack,
    commands: CommandTable,
    handlers: HashMap<String, Arc<dyn CustomCommand>>,
    full_screen: bool,
    design_buffer: Option<String>,
    last_error: Option<String>,
    discarded: bool,
}

impl std::fmt::Debug for ObjectController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectController")
            .field("instance", &self.instance)
            .field("mode", &self.mode)
            .field("active_tab", &self.active_tab)
            .field("pickers", &self.pickers.depth())
            .finish_non_exhaustive()
    }
}

impl ObjectController {
    pub fn builder(
        registry: Arc<dyn ModelRegistry>,
        store: Arc<dyn ObjectStore>,
    ) -> ObjectControllerBuilder {
        ObjectControllerBuilder {
            registry,
            store,
            config: ControllerConfig::default(),
            handlers: HashMap::new(),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn active_tab(&self) -> usize {
        self.active_tab
    }

    pub fn rows(&self) -> &RowStates {
        &self.rows
    }

    pub fn pickers(&self) -> &PickerStack {
        &self.pickers
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// True once the record was deleted or a new record was abandoned.
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn is_full_screen(&self) -> bool {
        self.full_screen
    }

    pub fn design_buffer(&self) -> Option<&str> {
        self.design_buffer.as_deref()
    }

    fn touch(&mut self) {
        if self.mode == Mode::Viewing && self.instance.is_dirty() {
            self.mode = Mode::Editing;
        }
    }

    // ── Field edits ─────────────────────────────────────────────

    pub fn set_field(&mut self, name: &str, value: Value) -> Result<bool> {
        let changed = self.instance.set(name, value)?;
        self.touch();
        Ok(changed)
    }

    pub fn set_child_field(&mut self, path: &[ChildKey], name: &str, value: Value) -> Result<bool> {
        let changed = self.instance.node_at(path)?.set(name, value)?;
        self.touch();
        Ok(changed)
    }

    pub fn unset_field(&mut self, name: &str) -> bool {
        self.instance.unset(name)
    }

    pub fn clear_field(&mut self, name: &str) -> Result<bool> {
        let changed = self.instance.clear_field(name)?;
        self.touch();
        Ok(changed)
    }

    /// Switch tabs. Open pickers are cancelled and row states reset.
    pub fn select_tab(&mut self, index: usize) -> Result<()> {
        let count = self
            .registry
            .form_for(self.instance.type_tag())
            .map(|f| f.tabs.len())
            .unwrap_or(0);
        if index >= count.max(1) {
            return Err(EngineError::InvalidTab { index, count });
        }
        self.pickers.clear();
        self.rows.clear();
        self.active_tab = index;
        Ok(())
    }

    pub fn toggle_full_screen(&mut self) -> bool {
        self.full_screen = !self.full_screen;
        self.full_screen
    }

    // ── Save, cancel, duplicate, delete ─────────────────────────

    /// Flush the design buffer, validate, then commit.
    ///
    /// Validation failures issue no store calls. Store failures return the
    /// controller to editing with dirty state intact.
    pub async fn save(&mut self) -> Result<SaveOutcome> {
        self.exit_design_mode()?;
        self.last_error = None;

        if !self.instance.validate() {
            let report = self.instance.validation_report();
            warn!(type_tag = %self.instance.type_tag(), %report, "save blocked by validation");
            self.last_error = Some(report.to_string());
            self.mode = Mode::Editing;
            return Err(EngineError::Validation(report));
        }

        self.mode = Mode::Committing;
        match commit(&mut self.instance, &*self.store).await {
            Ok(report) => {
                self.record_saved(&report).await;
                self.rows.clear();
                self.mode = Mode::Viewing;
                Ok(SaveOutcome {
                    navigate: report.created.clone(),
                    report,
                })
            }
            Err(e) => {
                // The record exists on the server even when edges failed
                if let Some(report) = e.saved_report() {
                    self.record_saved(report).await;
                }
                warn!(type_tag = %self.instance.type_tag(), error = %e, "save failed");
                self.last_error = Some(e.to_string());
                self.mode = Mode::Editing;
                Err(e)
            }
        }
    }

    /// Make the committed record the new baseline. Pending membership edges
    /// are not part of it.
    async fn record_saved(&mut self, report: &CommitReport) {
        if self.config.clear_cache_after_commit && !report.is_noop() {
            if let Err(e) = self.store.clear_cache(self.instance.type_tag()).await {
                warn!(type_tag = %self.instance.type_tag(), error = %e, "cache clear failed");
            }
        }
        let mut baseline = self.instance.clone();
        baseline.memberships.clear();
        self.baseline = baseline;
    }

    /// Close the top picker if one is open, otherwise discard edits.
    pub fn cancel(&mut self) -> CancelOutcome {
        if let Some(session) = self.pickers.cancel_top() {
            return CancelOutcome::PickerClosed(session);
        }
        self.discarded = !self.baseline.is_persisted();
        self.instance = self.baseline.clone();
        self.rows.clear();
        self.design_buffer = None;
        self.last_error = None;
        self.mode = Mode::Viewing;
        debug!(type_tag = %self.instance.type_tag(), "edits discarded");
        CancelOutcome::Discarded
    }

    /// Replace the bound record with an unsaved copy. Only persisted records
    /// can be duplicated.
    pub fn duplicate(&mut self) -> bool {
        if !self.instance.is_persisted() {
            return false;
        }
        self.instance = self.instance.duplicate();
        self.pickers.clear();
        self.rows.clear();
        self.design_buffer = None;
        self.mode = Mode::Editing;
        info!(type_tag = %self.instance.type_tag(), "record duplicated");
        true
    }

    /// Delete the bound record. The caller confirms beforehand.
    pub async fn delete(&mut self) -> Result<EntityRef> {
        let target = self.instance.reference().ok_or_else(|| {
            EngineError::IdentityConflict(format!(
                "cannot delete unsaved {}",
                self.instance.type_tag()
            ))
        })?;
        self.store.delete(&target).await?;
        info!(%target, "record deleted");
        self.pickers.clear();
        self.rows.clear();
        self.discarded = true;
        self.mode = Mode::Viewing;
        Ok(target)
    }

    // ── Pickers ─────────────────────────────────────────────────

    pub async fn open_picker(&mut self, request: PickerRequest) -> Result<SessionId> {
        self.pickers
            .open(&*self.registry, &*self.store, request)
            .await
    }

    /// Open the picker bound to a field.
    pub async fn open_field_picker(&mut self, field: &str) -> Result<SessionId> {
        let request = field_request(&self.instance, field)?;
        self.open_picker(request).await
    }

    /// Resolve the active picker with `selected` and apply it to the instance.
    /// A reparenting picker patches the picked records before the list is
    /// updated.
    pub async fn resolve_picker(&mut self, selected: Vec<Entity>) -> Result<()> {
        let (session, selected) = self.pickers.resolve(&*self.registry, selected)?;
        if let Continuation::Reparent { .. } = &session.continuation {
            let owner = self.reparent_owner()?;
            reparent(&*self.registry, &*self.store, &selected, Some(&owner)).await?;
            self.clear_owner_cache().await;
        }
        apply_resolution(&mut self.instance, &session.continuation, selected)?;
        self.touch();
        Ok(())
    }

    pub fn cancel_picker(&mut self) -> Result<SessionId> {
        self.pickers.cancel_top().ok_or(EngineError::NoActivePicker)
    }

    /// Navigation target of a picker-bound field, if it is set.
    pub fn open_field_target(&self, field: &str) -> Result<Option<EntityRef>> {
        let type_tag = self.instance.type_tag();
        let descriptor = self
            .registry
            .field(type_tag, field)
            .ok_or_else(|| EngineError::unknown_field(type_tag, field))?;
        let binding = descriptor.picker.as_ref().ok_or_else(|| {
            EngineError::PickerResolution(format!("{field} has no picker binding"))
        })?;
        let (owner, target) = split_target(&binding.target);
        let value = match owner {
            Some(owner) => self
                .instance
                .get(owner)
                .and_then(|v| v.get(target))
                .cloned(),
            None => self.instance.get(target).cloned(),
        };
        let Some(value) = value else {
            return Ok(None);
        };
        match (&binding.selected, value) {
            (_, Value::Object(map)) => Ok(self.registry.reference(&Entity::from_map(map))),
            (Selected::Property(_), id) if is_identity_set(Some(&id)) => {
                let target_type = resolve_target_type(&self.instance, field)?;
                Ok(Some(EntityRef::new(target_type, id)))
            }
            _ => Ok(None),
        }
    }

    // ── Rows ────────────────────────────────────────────────────

    pub fn select_row(&mut self, field: &str, index: usize, selected: bool) -> Result<()> {
        let len = self.list_len(field)?;
        if index >= len {
            return Err(EngineError::IndexOutOfRange {
                field: field.to_string(),
                index,
                len,
            });
        }
        self.rows.set_selected(field, index, selected);
        Ok(())
    }

    fn list_len(&self, field: &str) -> Result<usize> {
        let type_tag = self.instance.type_tag();
        let descriptor = self
            .registry
            .field(type_tag, field)
            .ok_or_else(|| EngineError::unknown_field(type_tag, field))?;
        if descriptor.semantic_type != SemanticType::List {
            return Err(EngineError::NotOwned {
                type_tag: type_tag.to_string(),
                field: field.to_string(),
                expected: "list",
            });
        }
        Ok(self
            .instance
            .get(field)
            .and_then(Value::as_array)
            .map_or(0, Vec::len))
    }

    /// Run the row command `key` on list `field`.
    pub async fn row_command(&mut self, field: &str, key: &str) -> Result<CommandOutcome> {
        let unavailable = || EngineError::CommandUnavailable {
            field: field.to_string(),
            command: key.to_string(),
        };
        let command = self.commands.find(field, key).ok_or_else(unavailable)?;
        if !command.is_active(&self.instance, &self.rows, field) {
            return Err(unavailable());
        }
        let kind = command.effective_kind(&self.rows, field).clone();
        debug!(field, command = key, kind = kind.name(), "row command");

        let outcome = match kind {
            CommandKind::NewEntry => self.new_entry(field)?,
            CommandKind::EditEntry => {
                for index in self.rows.selected_rows(field) {
                    self.rows.set_editing(field, index, true);
                }
                CommandOutcome::Updated
            }
            CommandKind::CancelEntry => {
                self.rows.clear_field(field);
                CommandOutcome::Updated
            }
            CommandKind::CheckEntry => self.check_entry(field).await?,
            CommandKind::DeleteEntry | CommandKind::DeleteEntity | CommandKind::DeleteMember => {
                self.delete_rows(field)?
            }
            CommandKind::AddEntity | CommandKind::AddMember => {
                let target_type = self.list_base(field)?;
                let session = self
                    .open_picker(PickerRequest {
                        target_type,
                        container_path: None,
                        continuation: Continuation::Append {
                            field: field.to_string(),
                        },
                    })
                    .await?;
                CommandOutcome::PickerOpened { session }
            }
            CommandKind::AddChild => {
                self.reparent_owner()?;
                let target_type = self.child_list_base(field, key)?;
                let session = self
                    .open_picker(PickerRequest {
                        target_type,
                        container_path: None,
                        continuation: Continuation::Reparent {
                            field: field.to_string(),
                        },
                    })
                    .await?;
                CommandOutcome::PickerOpened { session }
            }
            CommandKind::DeleteChild => self.detach_children(field, key).await?,
            CommandKind::OpenEntity => {
                let target = self
                    .rows
                    .selected_rows(field)
                    .first()
                    .and_then(|&i| self.instance.get(field)?.as_array()?.get(i).cloned())
                    .and_then(|v| Entity::from_value(v).ok())
                    .and_then(|e| self.registry.reference(&e));
                match target {
                    Some(target) => CommandOutcome::Navigate { target },
                    None => CommandOutcome::Nothing,
                }
            }
            CommandKind::Custom(name) => {
                let handler = self.handlers.get(&name).cloned().ok_or_else(unavailable)?;
                let selected = self.rows.selected_rows(field);
                handler.run(&mut self.instance, field, &selected)?
            }
        };
        self.touch();
        Ok(outcome)
    }

    fn list_base(&self, field: &str) -> Result<String> {
        let type_tag = self.instance.type_tag();
        self.registry
            .field(type_tag, field)
            .and_then(|d| d.base_model.clone())
            .ok_or_else(|| EngineError::NotOwned {
                type_tag: type_tag.to_string(),
                field: field.to_string(),
                expected: "list with a base model",
            })
    }

    fn new_entry(&mut self, field: &str) -> Result<CommandOutcome> {
        let base = self.list_base(field)?;
        let row = self.registry.new_primitive(&base)?;
        let index = self.instance.node().push_element(field, row.into_value())?;
        self.rows.set(
            field,
            index,
            RowState {
                selected: true,
                editing: true,
            },
        );
        Ok(CommandOutcome::RowAdded { index })
    }

    /// Finish row editing. Rows of a persisted parent are committed one by one
    /// unless the sub-form defers them to the next save.
    async fn check_entry(&mut self, field: &str) -> Result<CommandOutcome> {
        let editing = self.rows.editing_rows(field);
        let owned = self
            .registry
            .field(self.instance.type_tag(), field)
            .is_some_and(|d| d.is_owned_nested());
        let direct =
            owned && !self.commands.standard_update(field) && self.instance.is_persisted();

        let mut count = 0;
        if direct {
            for &index in &editing {
                let mut row = self.instance.element_for(field, index)?;
                if !row.validate() {
                    let report = self.instance.validation_report();
                    return Err(EngineError::Validation(report));
                }
                let key = ChildKey::Element(field.to_string(), index);
                let ops = commit_element(&mut self.instance, &*self.store, &key).await?;
                count += usize::from(!ops.is_empty());
            }
            info!(field, rows = count, "rows committed");
        }
        self.rows.clear_field(field);
        Ok(CommandOutcome::RowsCommitted { count })
    }

    /// Remove the selected rows. Foreign lists queue membership removals.
    fn delete_rows(&mut self, field: &str) -> Result<CommandOutcome> {
        let selected = self.rows.selected_rows(field);
        if selected.is_empty() {
            return Ok(CommandOutcome::Nothing);
        }
        let membership = self
            .registry
            .field(self.instance.type_tag(), field)
            .is_some_and(|d| d.is_membership_list());

        let count = if membership {
            let Some(list) = self.instance.get(field).and_then(Value::as_array) else {
                return Ok(CommandOutcome::Nothing);
            };
            let mut kept = Vec::with_capacity(list.len());
            let mut removed = Vec::new();
            for (index, member) in list.iter().enumerate() {
                if selected.contains(&index) {
                    removed.push(member.clone());
                } else {
                    kept.push(member.clone());
                }
            }
            for member in &removed {
                let target = Entity::from_value(member.clone())
                    .ok()
                    .and_then(|e| self.registry.reference(&e));
                if let Some(target) = target {
                    self.instance.queue_membership(field, target, false)?;
                }
            }
            self.instance.set_untracked(field, Value::Array(kept));
            removed.len()
        } else {
            self.instance.node().remove_elements(field, &selected)?.len()
        };
        self.rows.remove_rows(field, &selected);
        Ok(CommandOutcome::RowsRemoved { count })
    }

    /// Base type of a list whose rows are independent parent-contained records.
    fn child_list_base(&self, field: &str, key: &str) -> Result<String> {
        let owned = self
            .registry
            .field(self.instance.type_tag(), field)
            .is_some_and(|d| d.is_owned_nested());
        if owned {
            return Err(EngineError::CommandUnavailable {
                field: field.to_string(),
                command: key.to_string(),
            });
        }
        self.list_base(field)
    }

    fn reparent_owner(&self) -> Result<EntityRef> {
        self.instance.reference().ok_or_else(|| {
            EngineError::IdentityConflict(format!(
                "cannot reparent onto unsaved {}",
                self.instance.type_tag()
            ))
        })
    }

    /// Reparenting is persisted outside the commit; the owner's cache is
    /// cleared regardless of configuration.
    async fn clear_owner_cache(&self) {
        if let Err(e) = self.store.clear_cache(self.instance.type_tag()).await {
            warn!(type_tag = %self.instance.type_tag(), error = %e, "cache clear failed");
        }
    }

    /// Detach the selected rows from the owner and drop them from the list.
    async fn detach_children(&mut self, field: &str, key: &str) -> Result<CommandOutcome> {
        let base = self.child_list_base(field, key)?;
        let selected = self.rows.selected_rows(field);
        let Some(list) = self.instance.get(field).and_then(Value::as_array) else {
            return Ok(CommandOutcome::Nothing);
        };
        let mut kept = Vec::with_capacity(list.len());
        let mut children = Vec::new();
        for (index, row) in list.iter().enumerate() {
            if !selected.contains(&index) {
                kept.push(row.clone());
                continue;
            }
            let mut child = Entity::from_value(row.clone())?;
            if child.type_tag().is_none() {
                child.set_type_tag(base.clone());
            }
            children.push(child);
        }
        if children.is_empty() {
            return Ok(CommandOutcome::Nothing);
        }

        reparent(&*self.registry, &*self.store, &children, None).await?;
        self.clear_owner_cache().await;
        self.instance.set_untracked(field, Value::Array(kept));
        self.rows.remove_rows(field, &selected);
        Ok(CommandOutcome::RowsRemoved {
            count: children.len(),
        })
    }

    // ── Design mode ─────────────────────────────────────────────

    /// Copy the model's design field into an editable text buffer.
    pub fn enter_design_mode(&mut self) -> Result<()> {
        let type_tag = self.instance.type_tag();
        let unavailable = || EngineError::CommandUnavailable {
            field: type_tag.to_string(),
            command: "design_mode".to_string(),
        };
        let spec = self.registry.design(type_tag).ok_or_else(unavailable)?;
        let content_type = self
            .instance
            .get(&spec.content_type_field)
            .and_then(Value::as_str);
        if !spec.applies_to(content_type) {
            return Err(unavailable());
        }
        let buffer = match self.instance.get(&spec.field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        };
        self.design_buffer = Some(buffer);
        Ok(())
    }

    pub fn edit_design_buffer(&mut self, text: impl Into<String>) -> Result<()> {
        match &mut self.design_buffer {
            Some(buffer) => {
                *buffer = text.into();
                Ok(())
            }
            None => Err(EngineError::CommandUnavailable {
                field: self.instance.type_tag().to_string(),
                command: "edit_design_buffer".to_string(),
            }),
        }
    }

    /// Write the buffer back to the design field. Returns whether it changed.
    pub fn exit_design_mode(&mut self) -> Result<bool> {
        let Some(buffer) = self.design_buffer.take() else {
            return Ok(false);
        };
        let field = match self.registry.design(self.instance.type_tag()) {
            Some(spec) => spec.field.clone(),
            None => return Ok(false),
        };
        self.set_field(&field, Value::String(buffer))
    }

    // ── Dispatch and view ───────────────────────────────────────

    pub async fn dispatch(&mut self, intent: Intent) -> Result<IntentOutcome> {
        let outcome = match intent {
            Intent::SetField { name, value } => IntentOutcome::Changed {
                changed: self.set_field(&name, value)?,
            },
            Intent::SetChildField { path, name, value } => IntentOutcome::Changed {
                changed: self.set_child_field(&path, &name, value)?,
            },
            Intent::UnsetField { name } => IntentOutcome::Changed {
                changed: self.unset_field(&name),
            },
            Intent::ClearField { name } => IntentOutcome::Changed {
                changed: self.clear_field(&name)?,
            },
            Intent::SelectTab { index } => {
                self.select_tab(index)?;
                IntentOutcome::TabSelected { index }
            }
            Intent::Save => IntentOutcome::Saved(self.save().await?),
            Intent::Cancel => match self.cancel() {
                CancelOutcome::PickerClosed(session) => IntentOutcome::PickerClosed { session },
                CancelOutcome::Discarded => IntentOutcome::Discarded,
            },
            Intent::Duplicate => IntentOutcome::Duplicated {
                duplicated: self.duplicate(),
            },
            Intent::Delete => IntentOutcome::Deleted {
                target: self.delete().await?,
            },
            Intent::ToggleFullScreen => IntentOutcome::FullScreen {
                full_screen: self.toggle_full_screen(),
            },
            Intent::EnterDesignMode => {
                self.enter_design_mode()?;
                IntentOutcome::DesignMode { active: true }
            }
            Intent::EditDesignBuffer { text } => {
                self.edit_design_buffer(text)?;
                IntentOutcome::DesignMode { active: true }
            }
            Intent::ExitDesignMode => {
                self.exit_design_mode()?;
                IntentOutcome::DesignMode { active: false }
            }
            Intent::OpenFieldPicker { field } => IntentOutcome::PickerOpened {
                session: self.open_field_picker(&field).await?,
            },
            Intent::OpenPicker(request) => IntentOutcome::PickerOpened {
                session: self.open_picker(request).await?,
            },
            Intent::ResolvePicker { selected } => {
                self.resolve_picker(selected).await?;
                IntentOutcome::PickerResolved
            }
            Intent::CancelPicker => IntentOutcome::PickerClosed {
                session: self.cancel_picker()?,
            },
            Intent::SelectRow {
                field,
                index,
                selected,
            } => {
                self.select_row(&field, index, selected)?;
                IntentOutcome::RowSelected
            }
            Intent::RowCommand { field, command } => IntentOutcome::Command {
                result: self.row_command(&field, &command).await?,
            },
            Intent::OpenFieldTarget { field } => IntentOutcome::Target {
                target: self.open_field_target(&field)?,
            },
        };
        Ok(outcome)
    }

    pub fn view(&self) -> ViewModel {
        let tabs = self
            .registry
            .form_for(self.instance.type_tag())
            .map(|f| f.tabs.iter().map(|t| t.label.clone()).collect())
            .unwrap_or_default();
        ViewModel {
            type_tag: self.instance.type_tag().to_string(),
            mode: self.mode,
            active_tab: self.active_tab,
            tabs,
            fields: field_views(&self.instance, self.active_tab),
            rows: row_views(&self.rows),
            commands: command_views(&self.commands, &self.instance, &self.rows),
            picker_active: self.pickers.is_active(),
            picker_depth: self.pickers.depth(),
            persisted: self.instance.is_persisted(),
            dirty: self.instance.is_dirty(),
            full_screen: self.full_screen,
            design_buffer: self.design_buffer.clone(),
            error: self.last_error.clone(),
        }
    }
}
