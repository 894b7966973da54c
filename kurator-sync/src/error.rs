//! Error types for kurator-sync.

use thiserror::Error;

use kurator_core::{EntityKind, Role};
use kurator_replica::ReplicaError;
use kurator_source::SourceError;

/// All errors that can arise from reconciliation and its admin operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The source system could not be read.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The replica could not be read or written.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// A chunked write stopped part way. Chunks before `chunk` are applied,
    /// `chunk` and everything after it are not.
    #[error(
        "{kind} {op} chunk {chunk}/{chunks} failed ({applied} chunk(s) already applied): {source}"
    )]
    ChunkFailed {
        kind: EntityKind,
        op: &'static str,
        chunk: usize,
        chunks: usize,
        applied: usize,
        #[source]
        source: ReplicaError,
    },

    /// The caller lacks the privilege for the operation.
    #[error("{actor} ({role}) is not allowed to invalidate the replica; requires admin")]
    Forbidden { actor: String, role: Role },

    /// A reconciliation run currently holds `syncing`.
    #[error("a sync run is already in progress{}", .run_id.as_deref().map(|id| format!(" ({id})")).unwrap_or_default())]
    AlreadyRunning { run_id: Option<String> },
}
