//! Kurator core library: entity kinds, typed entity schemas, run metadata,
//! configuration and errors shared by every other crate.
//!
//! - [`types`]: newtypes, run metadata, audit entries, result shapes
//! - [`entities`]: strict per-kind schemas decoded at the source boundary
//! - [`config`]: `~/.kurator/config.yaml` loading
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod entities;
pub mod error;
pub mod types;

pub use config::Config;
pub use entities::{Competency, Entity, Lesson, School, Theme};
pub use error::CoreError;
pub use types::{
    Actor, AuditLogEntry, DocumentId, EntityKind, EntityResult, RecordCounts, Role, RunMetadata,
    RunResult, RunScope, SourceId, SyncStatus, TriggerType,
};
