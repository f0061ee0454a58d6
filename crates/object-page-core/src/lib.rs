//! Object page core: a metadata-driven editing engine for typed entities.
//!
//! An entity graph is edited through an [`Instance`] tree that records which
//! fields changed, a stack of picker sessions collects related records, and
//! the commit protocol persists the graph bottom-up against an
//! [`ObjectStore`]. The [`ObjectController`] ties these together behind an
//! intent-driven presentation boundary.
//!
//! Zero transport code lives here. HTTP access is provided by the
//! `object-page-client` crate; tests use [`MemoryObjectStore`].

pub mod commands;
pub mod commit;
pub mod config;
pub mod controller;
pub mod entity;
pub mod error;
pub mod instance;
pub mod membership;
pub mod picker;
pub mod schema;
pub mod store;
pub mod view;

pub use commands::{CommandOutcome, CommandTable, CustomCommand, RowCommand, RowState, RowStates};
pub use commit::{CommitOp, CommitReport, OpKind};
pub use config::ControllerConfig;
pub use controller::{
    CancelOutcome, Intent, IntentOutcome, Mode, ObjectController, ObjectControllerBuilder,
    SaveOutcome,
};
pub use entity::{Entity, EntityRef, MODEL_KEY};
pub use error::{EngineError, ErrorKind, StoreError, ValidationReport};
pub use instance::{ChildKey, Instance, Node, Tracker};
pub use membership::{MembershipQueue, PendingEdge};
pub use picker::{Continuation, PickerRequest, PickerSession, PickerStack, SessionId};
pub use schema::{
    CommandDescriptor, CommandKind, ContainerKind, ContainerSpec, DesignSpec, FieldDescriptor,
    FormDescriptor, FormField, FormTab, ModelDescriptor, ModelRegistry, Ownership, PickerBinding,
    RowCondition, SchemaRegistry, SemanticType, Selected,
};
pub use store::memory::MemoryObjectStore;
pub use store::{MemberEdge, ObjectStore, Query, QueryField, SearchResults, StoreOp};
pub use view::{CommandView, FieldView, RowView, ViewModel};
