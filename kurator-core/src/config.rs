//! `~/.kurator/config.yaml` loading.
//!
//! # Storage layout
//!
//! ```text
//! ~/.kurator/
//!   config.yaml             (optional; every field has a default)
//!   replica/                (file-backed replica store)
//!   daemon.sock
//!   logs/
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::EntityKind;

/// Default env var holding the source API key. The key itself never lives in
/// the config file.
pub const DEFAULT_API_KEY_ENV: &str = "KURATOR_SOURCE_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub sync: SyncConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub base_id: String,
    pub api_key_env: String,
    /// Table name per entity kind.
    pub tables: BTreeMap<EntityKind, String>,
    pub page_size: u32,
    /// Upstream allows ~5 requests per second per base.
    pub min_request_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        let tables = [
            (EntityKind::School, "Schulen"),
            (EntityKind::Theme, "Themen"),
            (EntityKind::Competency, "Kompetenzen"),
            (EntityKind::Lesson, "Lektionen"),
        ]
        .into_iter()
        .map(|(kind, name)| (kind, name.to_string()))
        .collect();

        Self {
            base_url: "https://api.airtable.com/v0".to_string(),
            base_id: String::new(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            tables,
            page_size: 100,
            min_request_interval_ms: 220,
            timeout_secs: 30,
        }
    }
}

impl SourceConfig {
    pub fn table(&self, kind: EntityKind) -> String {
        self.tables
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.collection().to_string())
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A `syncing` status older than this is considered stuck and may be
    /// taken over by the next run.
    pub stale_run_after_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_run_after_secs: 2 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn stale_run_after(&self) -> Duration {
        Duration::from_secs(self.stale_run_after_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Hour of day (UTC, 0–23) at which the daily full sync runs.
    pub daily_hour_utc: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_hour_utc: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.kurator/`
pub fn kurator_root(home: &Path) -> PathBuf {
    home.join(".kurator")
}

/// `<home>/.kurator/config.yaml`, pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    kurator_root(home).join("config.yaml")
}

/// `<home>/.kurator/replica/`
pub fn replica_dir_at(home: &Path) -> PathBuf {
    kurator_root(home).join("replica")
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load `<home>/.kurator/config.yaml`.
///
/// Returns defaults if the file does not exist, `CoreError::Parse` (with path
/// + line context) if it is malformed.
pub fn load_at(home: &Path) -> Result<Config, CoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| CoreError::Parse { path, source })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, CoreError> {
    load_at(&home()?)
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let config = load_at(home.path()).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.source.table(EntityKind::Lesson), "Lektionen");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(kurator_root(home.path())).expect("mkdir");
        std::fs::write(
            config_path_at(home.path()),
            "source:\n  base_id: appXYZ\n  tables:\n    school: Schools\nschedule:\n  daily_hour_utc: 5\n",
        )
        .expect("write");

        let config = load_at(home.path()).expect("load");
        assert_eq!(config.source.base_id, "appXYZ");
        assert_eq!(config.source.table(EntityKind::School), "Schools");
        // A table map in the file replaces the default map wholesale.
        assert_eq!(config.source.table(EntityKind::Theme), "themes");
        assert_eq!(config.schedule.daily_hour_utc, 5);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path()).ends_with(".kurator/config.yaml"));
    }
}
