//! Error types for kurator-replica.

use std::path::PathBuf;

use thiserror::Error;

use kurator_core::{CoreError, EntityKind};

/// All errors that can arise from replica reads and writes.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored document could not be (de)serialized.
    #[error("replica JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Callers must split writes into chunks of at most `limit` operations.
    #[error("{kind} batch of {size} operations exceeds the limit of {limit}")]
    BatchTooLarge {
        kind: EntityKind,
        size: usize,
        limit: usize,
    },

    /// A stored document does not match its entity schema.
    #[error(transparent)]
    Decode(#[from] CoreError),

    /// Another process held the metadata lock for too long.
    #[error("run metadata is locked by another process ({path})")]
    Locked { path: PathBuf },

    /// Failure injected by [`crate::MemoryReplicaStore`].
    #[error("replica unavailable: {0}")]
    Unavailable(String),
}

/// Convenience constructor for [`ReplicaError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ReplicaError {
    ReplicaError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`ReplicaError::Json`].
pub(crate) fn json_err(path: impl Into<PathBuf>, source: serde_json::Error) -> ReplicaError {
    ReplicaError::Json {
        path: path.into(),
        source,
    }
}
