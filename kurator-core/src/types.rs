//! Domain types shared across the reconciliation engine.
//!
//! All timestamps are `DateTime<Utc>`. Everything persisted is serde
//! serializable; stored documents use camelCase field names.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier of a record in the authoritative source system.
///
/// Unique per entity kind; used as the diff key during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier assigned by the replica store on first write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// The four mirrored record types.
///
/// Declaration order is the reconciliation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    School,
    Theme,
    Competency,
    Lesson,
}

impl EntityKind {
    /// Schools first (no dependents), then Themes, then the kinds that
    /// reference Themes.
    pub const SYNC_ORDER: [EntityKind; 4] = [
        EntityKind::School,
        EntityKind::Theme,
        EntityKind::Competency,
        EntityKind::Lesson,
    ];

    /// Replica collection name.
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::School => "schools",
            EntityKind::Theme => "themes",
            EntityKind::Competency => "competencies",
            EntityKind::Lesson => "lessons",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::School => "school",
            EntityKind::Theme => "theme",
            EntityKind::Competency => "competency",
            EntityKind::Lesson => "lesson",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "school" | "schools" => Ok(EntityKind::School),
            "theme" | "themes" => Ok(EntityKind::Theme),
            "competency" | "competencies" => Ok(EntityKind::Competency),
            "lesson" | "lessons" => Ok(EntityKind::Lesson),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Callers
// ---------------------------------------------------------------------------

/// Privilege level of a caller. Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Teacher,
    Reviewer,
    Admin,
}

impl Role {
    pub const HIGHEST: Role = Role::Admin;
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => write!(f, "teacher"),
            Role::Reviewer => write!(f, "reviewer"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "reviewer" => Ok(Role::Reviewer),
            "admin" => Ok(Role::Admin),
            other => Err(format!(
                "unknown role '{other}'; expected: teacher, reviewer, admin"
            )),
        }
    }
}

/// The caller of a privileged operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerType::Manual => write!(f, "manual"),
            TriggerType::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Whether a run covered every kind or a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunScope {
    Full,
    Kind(EntityKind),
}

impl fmt::Display for RunScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunScope::Full => write!(f, "full"),
            RunScope::Kind(kind) => kind.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Run metadata
// ---------------------------------------------------------------------------

/// Reconciliation state machine: `idle → syncing → {success, error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncStatus::Success | SyncStatus::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "idle"),
            SyncStatus::Syncing => write!(f, "syncing"),
            SyncStatus::Success => write!(f, "success"),
            SyncStatus::Error => write!(f, "error"),
        }
    }
}

/// Per-kind added+updated totals of the most recent run that touched the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecordCounts {
    pub schools: u64,
    pub themes: u64,
    pub competencies: u64,
    pub lessons: u64,
}

impl RecordCounts {
    pub fn get(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::School => self.schools,
            EntityKind::Theme => self.themes,
            EntityKind::Competency => self.competencies,
            EntityKind::Lesson => self.lessons,
        }
    }

    pub fn set(&mut self, kind: EntityKind, count: u64) {
        match kind {
            EntityKind::School => self.schools = count,
            EntityKind::Theme => self.themes = count,
            EntityKind::Competency => self.competencies = count,
            EntityKind::Lesson => self.lessons = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.schools + self.themes + self.competencies + self.lessons
    }
}

/// The run-metadata singleton.
///
/// Written to `syncing` at run start and to a terminal state at run end, by
/// the sync engine only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_sync: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub record_counts: RecordCounts,
    /// Start of the run currently holding `syncing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_started_at: Option<DateTime<Utc>>,
    /// Owner of the current `syncing` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of reconciling one entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityResult {
    pub added: u64,
    pub updated: u64,
    pub deactivated: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl EntityResult {
    /// Zero-effect result carrying one error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// The value recorded in [`RecordCounts`].
    pub fn synced(&self) -> u64 {
        self.added + self.updated
    }
}

/// Summary of one completed run (full or single-kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub trigger: TriggerType,
    pub scope: RunScope,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: BTreeMap<EntityKind, EntityResult>,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }
}

/// One immutable record in the run audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: TriggerType,
    pub scope: RunScope,
    pub status: SyncStatus,
    pub duration_ms: u64,
    pub results: BTreeMap<EntityKind, EntityResult>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
}

impl From<&RunResult> for AuditLogEntry {
    fn from(run: &RunResult) -> Self {
        Self {
            id: run.run_id.clone(),
            timestamp: run.started_at,
            trigger: run.trigger,
            scope: run.scope,
            status: run.status,
            duration_ms: run.duration_ms,
            results: run.results.clone(),
            errors: run.errors.clone(),
            triggered_by: run.triggered_by.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
