//! Error types for kurator-source.

use thiserror::Error;

use kurator_core::{CoreError, EntityKind};

/// All errors that can arise while reading from the source system.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The API answered with a non-success status.
    #[error("{kind} request failed with HTTP {status}: {body}")]
    Status {
        kind: EntityKind,
        status: u16,
        body: String,
    },

    /// Connection, TLS or timeout failure.
    #[error("{kind} request failed: {message}")]
    Transport { kind: EntityKind, message: String },

    /// Response body was not the expected JSON shape.
    #[error("{kind} response could not be read: {source}")]
    Body {
        kind: EntityKind,
        #[source]
        source: std::io::Error,
    },

    /// A record did not match its entity schema.
    #[error(transparent)]
    Decode(#[from] CoreError),

    /// The env var that should hold the API key is unset or empty.
    #[error("source API key missing; set ${env}")]
    MissingApiKey { env: String },

    /// Failure injected by [`crate::MemorySourceClient`].
    #[error("{kind} source unavailable: {message}")]
    Unavailable { kind: EntityKind, message: String },
}
