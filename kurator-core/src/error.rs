//! Error types for kurator-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::EntityKind;

/// All errors that can arise from configuration and schema handling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A record did not match the strict schema of its entity kind.
    #[error("invalid {kind} record '{source_id}': {source}")]
    Decode {
        kind: EntityKind,
        source_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// `dirs::home_dir()` returned `None`, so `~/.kurator/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// An entity kind name that is not one of school, theme, competency, lesson.
    #[error("unknown entity kind '{0}'; expected: school, theme, competency, lesson")]
    UnknownKind(String),
}
