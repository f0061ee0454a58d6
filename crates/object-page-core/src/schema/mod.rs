//! Model and form descriptors
//!
//! Defines the serde schema for object-page schema files: `models:` holds
//! per-type field descriptors, `forms:` holds tab layouts and row commands.
//! Descriptors are immutable once a [`SchemaRegistry`] has been built.

mod registry;

pub use registry::{ModelRegistry, SchemaRegistry};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Field descriptors ───────────────────────────────────────────

/// Semantic type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    String,
    Number,
    Boolean,
    Enum,
    List,
    Model,
    Flex,
}

/// Who persists a nested value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Created/patched as part of the parent's commit.
    #[default]
    Owned,
    /// A reference to an independently managed record.
    Foreign,
    /// Display-only; never sent to the store.
    Virtual,
}

/// What a picker writes back into the bound field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Selected {
    /// The whole selected entity.
    #[default]
    Object,
    /// A single property of the selected entity.
    Property(String),
}

impl From<String> for Selected {
    fn from(s: String) -> Self {
        match s.as_str() {
            "object" | "{object}" => Self::Object,
            _ => Self::Property(s),
        }
    }
}

impl From<Selected> for String {
    fn from(s: Selected) -> Self {
        match s {
            Selected::Object => "object".to_string(),
            Selected::Property(p) => p,
        }
    }
}

/// Binds a field to a picker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickerBinding {
    /// Entity field written on resolution; `owner.field` targets a nested owned child
    pub target: String,

    #[serde(default)]
    pub selected: Selected,

    /// `self`, a fixed type tag, or `.field` to read the type from the entity
    #[serde(default)]
    pub picker_type: Option<String>,

    /// Container path for group-contained targets
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,

    #[serde(rename = "type")]
    pub semantic_type: SemanticType,

    #[serde(default)]
    pub ownership: Ownership,

    /// Element/child type for `model` and `list` fields
    #[serde(default)]
    pub base_model: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub read_only: bool,

    /// Participates in the record's identity (id, objectId, urn)
    #[serde(default)]
    pub identity: bool,

    /// Secret reference cleared on duplicate
    #[serde(default)]
    pub vault: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub max_length: Option<usize>,

    #[serde(default)]
    pub min_length: Option<usize>,

    /// Allowed values
    #[serde(default)]
    pub limit: Vec<String>,

    #[serde(default)]
    pub min_value: Option<f64>,

    #[serde(default)]
    pub max_value: Option<f64>,

    #[serde(default)]
    pub picker: Option<PickerBinding>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            ownership: Ownership::Owned,
            base_model: None,
            required: false,
            read_only: false,
            identity: false,
            vault: false,
            default: None,
            max_length: None,
            min_length: None,
            limit: Vec::new(),
            min_value: None,
            max_value: None,
            picker: None,
        }
    }

    pub fn with_base_model(mut self, base_model: impl Into<String>) -> Self {
        self.base_model = Some(base_model.into());
        self
    }

    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    pub fn is_virtual(&self) -> bool {
        self.ownership == Ownership::Virtual
    }

    /// Owned `model` or `list` field with a declared base model.
    pub fn is_owned_nested(&self) -> bool {
        self.ownership == Ownership::Owned
            && self.base_model.is_some()
            && matches!(self.semantic_type, SemanticType::Model | SemanticType::List)
    }

    /// Foreign list: persisted through membership edges, not the owner's payload.
    pub fn is_membership_list(&self) -> bool {
        self.ownership == Ownership::Foreign && self.semantic_type == SemanticType::List
    }

    /// Zero value used when seeding a new primitive.
    pub fn zero_value(&self) -> Value {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match self.semantic_type {
            SemanticType::Number => Value::from(0),
            SemanticType::Boolean => Value::Bool(false),
            SemanticType::Enum => Value::String("UNKNOWN".to_string()),
            SemanticType::List => Value::Array(Vec::new()),
            SemanticType::String | SemanticType::Model | SemanticType::Flex => Value::Null,
        }
    }
}

// ── Model descriptors ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Records live in a group path (`groupId`/`groupPath`)
    Group,
    /// Records hang off a parent record (`parentId`/`path`)
    Parent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub kind: ContainerKind,
    pub container_type: String,
    #[serde(default)]
    pub default_path: Option<String>,
}

/// Raw-content field edited in design mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpec {
    pub field: String,

    /// Content-type prefixes that enable design mode; empty means always
    #[serde(default)]
    pub content_types: Vec<String>,

    #[serde(default = "default_content_type_field")]
    pub content_type_field: String,
}

fn default_content_type_field() -> String {
    "contentType".to_string()
}

impl DesignSpec {
    pub fn applies_to(&self, content_type: Option<&str>) -> bool {
        if self.content_types.is_empty() {
            return true;
        }
        match content_type {
            Some(ct) => self.content_types.iter().any(|p| ct.starts_with(p.as_str())),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Filled from the map key when loaded from YAML
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub inherits: Vec<String>,

    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,

    #[serde(default)]
    pub container: Option<ContainerSpec>,

    #[serde(default)]
    pub design: Option<DesignSpec>,

    /// Form name; defaults to the last `.` segment of the model name
    #[serde(default)]
    pub form: Option<String>,

    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn form_name(&self) -> &str {
        match &self.form {
            Some(f) => f,
            None => self.name.rsplit('.').next().unwrap_or(&self.name),
        }
    }
}

// ── Form descriptors ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowCondition {
    Select,
    Edit,
}

/// Closed set of row command behaviours, resolved from `function` names at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    NewEntry,
    CheckEntry,
    EditEntry,
    CancelEntry,
    DeleteEntry,
    AddEntity,
    DeleteEntity,
    AddMember,
    DeleteMember,
    /// Reparent picked records under the owner (`parentId`)
    AddChild,
    /// Detach selected rows from the owner (`parentId` = 0)
    DeleteChild,
    OpenEntity,
    Custom(String),
}

impl CommandKind {
    pub fn name(&self) -> &str {
        match self {
            Self::NewEntry => "new_entry",
            Self::CheckEntry => "check_entry",
            Self::EditEntry => "edit_entry",
            Self::CancelEntry => "cancel_entry",
            Self::DeleteEntry => "delete_entry",
            Self::AddEntity => "add_entity",
            Self::DeleteEntity => "delete_entity",
            Self::AddMember => "add_member",
            Self::DeleteMember => "delete_member",
            Self::AddChild => "add_child",
            Self::DeleteChild => "delete_child",
            Self::OpenEntity => "open_entity",
            Self::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub key: String,

    #[serde(default)]
    pub label: Option<String>,

    pub function: CommandKind,

    /// Row states that activate the command; empty means always
    #[serde(default)]
    pub condition: Vec<RowCondition>,

    /// Replaces `function` while the alternate condition holds
    #[serde(default)]
    pub alt_function: Option<CommandKind>,

    #[serde(default)]
    pub alt_condition: Vec<RowCondition>,

    /// Active only when the parent entity carries this attribute
    #[serde(default)]
    pub required_attribute: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,

    #[serde(default)]
    pub label: Option<String>,

    /// Overrides the model descriptor
    #[serde(default)]
    pub required: Option<bool>,

    /// Overrides the model descriptor
    #[serde(default)]
    pub read_only: Option<bool>,

    #[serde(default)]
    pub skip_validation: bool,

    /// Sub-form for list fields
    #[serde(default)]
    pub form: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormTab {
    pub label: String,
    #[serde(default)]
    pub fields: Vec<FormField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormDescriptor {
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub tabs: Vec<FormTab>,

    /// Row commands offered when this form renders a list
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,

    /// When false, `check_entry` commits edited rows directly for persisted parents
    #[serde(default)]
    pub standard_update: bool,
}

impl FormDescriptor {
    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.tabs
            .iter()
            .flat_map(|t| t.fields.iter())
            .find(|f| f.name == name)
    }
}
