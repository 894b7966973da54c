//! Replica store and run ledger seams, plus the write semantics both
//! implementations share.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use kurator_core::{
    AuditLogEntry, DocumentId, Entity, EntityKind, RunMetadata, SourceId, SyncStatus,
};

use crate::{Filter, ReplicaDocument, ReplicaError, ReplicaRecord, UpsertRecord};

/// Maximum operations in one atomic batch.
pub const MAX_BATCH_SIZE: usize = 500;

/// One entity collection, keyed by source id.
pub type Collection = BTreeMap<SourceId, ReplicaDocument>;

/// Read/write access to the mirrored entity collections.
///
/// `upsert_batch` and `deactivate_by_source_ids` are all-or-nothing per call
/// and reject calls with more than [`MAX_BATCH_SIZE`] operations; splitting
/// is the caller's job. Nothing here removes documents.
pub trait ReplicaStore: Send + Sync {
    fn get_all(
        &self,
        kind: EntityKind,
        filter: Option<&Filter>,
    ) -> Result<Vec<ReplicaDocument>, ReplicaError>;

    fn get_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<Vec<ReplicaDocument>, ReplicaError>;

    fn upsert_batch(&self, kind: EntityKind, records: &[UpsertRecord])
        -> Result<(), ReplicaError>;

    fn deactivate_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<(), ReplicaError>;

    /// Mark every document of `kind` inactive. Returns how many changed.
    fn deactivate_all(&self, kind: EntityKind) -> Result<u64, ReplicaError>;

    /// Typed variant of [`ReplicaStore::get_all`].
    fn get_all_records<T: Entity>(
        &self,
        filter: Option<&Filter>,
    ) -> Result<Vec<ReplicaRecord<T>>, ReplicaError> {
        self.get_all(T::KIND, filter)?
            .iter()
            .map(ReplicaDocument::decode)
            .collect()
    }
}

/// Result of trying to move the run metadata into `syncing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    Started,
    /// A run older than the stale ceiling was still `syncing`; it has been
    /// replaced by the caller's run.
    TookOver {
        previous_run_id: Option<String>,
        started_at: DateTime<Utc>,
    },
    /// Another run holds `syncing`. Nothing was written.
    AlreadyRunning {
        run_id: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
}

impl BeginOutcome {
    pub fn is_started(&self) -> bool {
        !matches!(self, BeginOutcome::AlreadyRunning { .. })
    }
}

/// The run metadata singleton and the run audit log.
pub trait RunLedger: Send + Sync {
    fn read_metadata(&self) -> Result<RunMetadata, ReplicaError>;

    /// Unconditional overwrite.
    fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), ReplicaError>;

    /// Atomic read-modify-write: `apply` sees the current metadata and
    /// returns whether its changes should be committed. No other
    /// `transact_metadata` call interleaves. Returns whether it committed.
    fn transact_metadata(
        &self,
        apply: &mut dyn FnMut(&mut RunMetadata) -> bool,
    ) -> Result<bool, ReplicaError>;

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ReplicaError>;

    /// Newest first.
    fn recent_audits(&self, limit: usize) -> Result<Vec<AuditLogEntry>, ReplicaError>;

    /// Compare-and-set `syncing` for `run_id`.
    fn compare_and_begin(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<BeginOutcome, ReplicaError> {
        let mut outcome = BeginOutcome::Started;
        self.transact_metadata(&mut |metadata| {
            outcome = begin_transition(metadata, run_id, now, stale_after);
            outcome.is_started()
        })?;
        Ok(outcome)
    }

    /// Apply the terminal state of `run_id`, but only while that run still
    /// owns `syncing`. Returns `false` if it no longer does.
    fn compare_and_finish(
        &self,
        run_id: &str,
        finish: &mut dyn FnMut(&mut RunMetadata),
    ) -> Result<bool, ReplicaError> {
        self.transact_metadata(&mut |metadata| {
            if metadata.sync_status != SyncStatus::Syncing
                || metadata.run_id.as_deref() != Some(run_id)
            {
                return false;
            }
            finish(metadata);
            metadata.run_id = None;
            metadata.run_started_at = None;
            true
        })
    }
}

/// The guard: refuse while another run is `syncing`, unless that run started
/// longer than `stale_after` ago. A `syncing` status without a start time is
/// never considered stale.
pub fn begin_transition(
    metadata: &mut RunMetadata,
    run_id: &str,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> BeginOutcome {
    let outcome = if metadata.sync_status == SyncStatus::Syncing {
        match metadata.run_started_at {
            Some(started_at) if is_stale(started_at, now, stale_after) => BeginOutcome::TookOver {
                previous_run_id: metadata.run_id.clone(),
                started_at,
            },
            started_at => {
                return BeginOutcome::AlreadyRunning {
                    run_id: metadata.run_id.clone(),
                    started_at,
                }
            }
        }
    } else {
        BeginOutcome::Started
    };

    metadata.sync_status = SyncStatus::Syncing;
    metadata.error_message = None;
    metadata.run_started_at = Some(now);
    metadata.run_id = Some(run_id.to_string());
    outcome
}

fn is_stale(started_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let age = now.signed_duration_since(started_at);
    age.to_std().map(|age| age > stale_after).unwrap_or(false)
}

pub(crate) fn check_batch(kind: EntityKind, size: usize) -> Result<(), ReplicaError> {
    if size > MAX_BATCH_SIZE {
        return Err(ReplicaError::BatchTooLarge {
            kind,
            size,
            limit: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Apply an upsert batch to a collection in place.
///
/// Existing documents keep their id and get their fields overwritten;
/// unknown source ids get a fresh id. Every written document is active.
pub(crate) fn apply_upsert(collection: &mut Collection, records: &[UpsertRecord]) {
    for record in records {
        match collection.get_mut(&record.source_id) {
            Some(existing) => {
                existing.fields = record.fields.clone();
                existing.is_active = true;
                existing.last_synced_at = record.last_synced_at;
            }
            None => {
                collection.insert(
                    record.source_id.clone(),
                    ReplicaDocument {
                        id: DocumentId(uuid::Uuid::new_v4().to_string()),
                        source_id: record.source_id.clone(),
                        is_active: true,
                        last_synced_at: record.last_synced_at,
                        fields: record.fields.clone(),
                    },
                );
            }
        }
    }
}

/// Returns how many documents flipped to inactive. Unknown ids are ignored.
pub(crate) fn apply_deactivate(collection: &mut Collection, ids: &[SourceId]) -> u64 {
    let mut changed = 0;
    for id in ids {
        if let Some(doc) = collection.get_mut(id) {
            if doc.is_active {
                doc.is_active = false;
                changed += 1;
            }
        }
    }
    changed
}

pub(crate) fn query(collection: &Collection, filter: Option<&Filter>) -> Vec<ReplicaDocument> {
    collection
        .values()
        .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
        .cloned()
        .collect()
}
