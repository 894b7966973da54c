//! File-backed replica store.
//!
//! # Storage layout
//!
//! ```text
//! <root>/                        (~/.kurator/replica by default)
//!   schools.json                 (one JSON object per collection, keyed by sourceId)
//!   themes.json
//!   competencies.json
//!   lessons.json
//!   sync_metadata.json           (run metadata singleton)
//!   sync_logs.jsonl              (audit log, append only, one entry per line)
//!   sync_metadata.lock           (held only inside a metadata transaction)
//! ```
//!
//! Each batch is applied to an in-memory copy of its collection and then
//! persisted with `.tmp` + rename, so a failed batch leaves the collection
//! file exactly as it was. Metadata transactions are serialised within the
//! process by a mutex and across processes by an exclusive lock file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, SystemTime};

use kurator_core::{config, AuditLogEntry, EntityKind, RunMetadata, SourceId};

use crate::error::{io_err, json_err, ReplicaError};
use crate::store::{self, check_batch, Collection};
use crate::{Filter, ReplicaDocument, ReplicaStore, RunLedger, UpsertRecord};

const METADATA_FILE: &str = "sync_metadata.json";
const AUDIT_FILE: &str = "sync_logs.jsonl";
const LOCK_FILE: &str = "sync_metadata.lock";

/// How long to wait for another process's metadata lock.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(25);
/// A lock file older than this was left behind by a crashed process.
const LOCK_ABANDONED_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct FileReplicaStore {
    root: PathBuf,
    writes: Mutex<()>,
    ledger: Mutex<()>,
}

impl FileReplicaStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ReplicaError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            writes: Mutex::new(()),
            ledger: Mutex::new(()),
        })
    }

    /// Open the store under `<home>/.kurator/replica/`.
    pub fn open_at(home: &Path) -> Result<Self, ReplicaError> {
        Self::open(config::replica_dir_at(home))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<collection>.json`. Pure, no I/O.
    pub fn collection_path(&self, kind: EntityKind) -> PathBuf {
        self.root.join(format!("{}.json", kind.collection()))
    }

    fn load_collection(&self, kind: EntityKind) -> Result<Collection, ReplicaError> {
        let path = self.collection_path(kind);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| json_err(&path, e)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Collection::new()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    fn save_collection(&self, kind: EntityKind, collection: &Collection) -> Result<(), ReplicaError> {
        let path = self.collection_path(kind);
        let json = serde_json::to_string_pretty(collection).map_err(|e| json_err(&path, e))?;
        atomic_write(&path, json.as_bytes())
    }

    /// Load, mutate, persist. One atomic batch.
    fn with_collection<R>(
        &self,
        kind: EntityKind,
        apply: impl FnOnce(&mut Collection) -> R,
    ) -> Result<R, ReplicaError> {
        let _guard = lock(&self.writes);
        let mut collection = self.load_collection(kind)?;
        let result = apply(&mut collection);
        self.save_collection(kind, &collection)?;
        Ok(result)
    }

    fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    fn load_metadata(&self) -> Result<RunMetadata, ReplicaError> {
        let path = self.metadata_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| json_err(&path, e)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RunMetadata::default()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    fn save_metadata(&self, metadata: &RunMetadata) -> Result<(), ReplicaError> {
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(metadata).map_err(|e| json_err(&path, e))?;
        atomic_write(&path, json.as_bytes())
    }

    fn acquire_lock_file(&self) -> Result<LockFile, ReplicaError> {
        let path = self.lock_path();
        let deadline = SystemTime::now() + LOCK_WAIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockFile { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_abandoned(&path) {
                        tracing::warn!("removing abandoned metadata lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if SystemTime::now() >= deadline {
                        return Err(ReplicaError::Locked { path });
                    }
                    sleep(LOCK_POLL);
                }
                Err(err) => return Err(io_err(&path, err)),
            }
        }
    }
}

/// Removes the lock file when dropped.
struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!("failed to release {}: {}", self.path.display(), err);
        }
    }
}

impl ReplicaStore for FileReplicaStore {
    fn get_all(
        &self,
        kind: EntityKind,
        filter: Option<&Filter>,
    ) -> Result<Vec<ReplicaDocument>, ReplicaError> {
        Ok(store::query(&self.load_collection(kind)?, filter))
    }

    fn get_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<Vec<ReplicaDocument>, ReplicaError> {
        let collection = self.load_collection(kind)?;
        Ok(ids
            .iter()
            .filter_map(|id| collection.get(id).cloned())
            .collect())
    }

    fn upsert_batch(
        &self,
        kind: EntityKind,
        records: &[UpsertRecord],
    ) -> Result<(), ReplicaError> {
        check_batch(kind, records.len())?;
        if records.is_empty() {
            return Ok(());
        }
        self.with_collection(kind, |collection| store::apply_upsert(collection, records))?;
        tracing::debug!("upserted {} {} document(s)", records.len(), kind);
        Ok(())
    }

    fn deactivate_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<(), ReplicaError> {
        check_batch(kind, ids.len())?;
        if ids.is_empty() {
            return Ok(());
        }
        let changed =
            self.with_collection(kind, |collection| store::apply_deactivate(collection, ids))?;
        tracing::debug!("deactivated {} {} document(s)", changed, kind);
        Ok(())
    }

    fn deactivate_all(&self, kind: EntityKind) -> Result<u64, ReplicaError> {
        self.with_collection(kind, |collection| {
            let ids: Vec<SourceId> = collection.keys().cloned().collect();
            store::apply_deactivate(collection, &ids)
        })
    }
}

impl RunLedger for FileReplicaStore {
    fn read_metadata(&self) -> Result<RunMetadata, ReplicaError> {
        self.load_metadata()
    }

    fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), ReplicaError> {
        let _guard = lock(&self.ledger);
        let _file = self.acquire_lock_file()?;
        self.save_metadata(metadata)
    }

    fn transact_metadata(
        &self,
        apply: &mut dyn FnMut(&mut RunMetadata) -> bool,
    ) -> Result<bool, ReplicaError> {
        let _guard = lock(&self.ledger);
        let _file = self.acquire_lock_file()?;
        let mut metadata = self.load_metadata()?;
        if !apply(&mut metadata) {
            return Ok(false);
        }
        self.save_metadata(&metadata)?;
        Ok(true)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ReplicaError> {
        let path = self.audit_path();
        let mut line = serde_json::to_string(entry).map_err(|e| json_err(&path, e))?;
        line.push('\n');

        let _guard = lock(&self.ledger);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| io_err(&path, e))?;
        file.flush().map_err(|e| io_err(&path, e))
    }

    fn recent_audits(&self, limit: usize) -> Result<Vec<AuditLogEntry>, ReplicaError> {
        let path = self.audit_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(io_err(&path, err)),
        };

        let mut entries = Vec::new();
        for line in contents.lines().rev() {
            if entries.len() == limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append.
                Err(err) => tracing::warn!("skipping unreadable audit line: {}", err),
            }
        }
        Ok(entries)
    }
}

fn lock(mutex: &Mutex<()>) -> MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > LOCK_ABANDONED_AFTER)
        .unwrap_or(false)
}

/// Write to `<path>.tmp`, then rename over `<path>`.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), ReplicaError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}
