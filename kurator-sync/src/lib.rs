//! # kurator-sync
//!
//! Reconciliation of the replica against the source system.
//!
//! [`SyncEngine`] is the coordinator: it owns the source client, the replica
//! store and the run ledger, and is the only thing that moves the run
//! metadata between `idle`, `syncing`, `success` and `error`. The per-kind
//! diff-and-apply logic lives in [`reconciler`]; [`references`] reads
//! cross-kind relations back out of the replica.

pub mod engine;
pub mod error;
pub mod reconciler;
pub mod references;

pub use engine::{EntityOutcome, InvalidationReport, RunOutcome, SyncEngine};
pub use error::SyncError;
pub use reconciler::reconcile;
pub use references::{lessons_for_theme, resolve_theme_competencies, ThemeCompetencies};
