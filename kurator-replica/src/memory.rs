//! In-memory replica with a call log and failure injection, for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use kurator_core::{AuditLogEntry, EntityKind, RunMetadata, SourceId};

use crate::store::{self, check_batch, Collection};
use crate::{Filter, ReplicaDocument, ReplicaError, ReplicaStore, RunLedger, UpsertRecord};

/// A call observed by [`MemoryReplicaStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    GetAll { kind: EntityKind },
    GetBySourceIds { kind: EntityKind, count: usize },
    Upsert { kind: EntityKind, size: usize },
    Deactivate { kind: EntityKind, size: usize },
    DeactivateAll { kind: EntityKind },
    ReadMetadata,
    WriteMetadata,
    TransactMetadata { committed: bool },
    AppendAudit,
    RecentAudits,
}

impl StoreCall {
    /// Whether the call changed persisted state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StoreCall::Upsert { .. }
                | StoreCall::Deactivate { .. }
                | StoreCall::DeactivateAll { .. }
                | StoreCall::WriteMetadata
                | StoreCall::TransactMetadata { committed: true }
                | StoreCall::AppendAudit
        )
    }

    pub fn kind(&self) -> Option<EntityKind> {
        match self {
            StoreCall::GetAll { kind }
            | StoreCall::GetBySourceIds { kind, .. }
            | StoreCall::Upsert { kind, .. }
            | StoreCall::Deactivate { kind, .. }
            | StoreCall::DeactivateAll { kind } => Some(*kind),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<EntityKind, Collection>,
    metadata: RunMetadata,
    audits: Vec<AuditLogEntry>,
    calls: Vec<StoreCall>,
    /// Kind → index (0-based, counted per kind) of the upsert call that fails.
    fail_upsert_at: HashMap<EntityKind, usize>,
    upserts_seen: HashMap<EntityKind, usize>,
    fail_ledger: bool,
    /// Index (0-based) of the metadata transaction that fails.
    fail_transaction_at: Option<usize>,
    transactions_seen: usize,
    fail_deactivate_all: HashSet<EntityKind>,
}

#[derive(Debug, Default)]
pub struct MemoryReplicaStore {
    state: Mutex<State>,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// The `index`-th upsert call for `kind` (0-based) fails without applying.
    pub fn fail_upsert_at(&self, kind: EntityKind, index: usize) {
        let mut state = self.lock();
        state.fail_upsert_at.insert(kind, index);
        state.upserts_seen.remove(&kind);
    }

    /// Every metadata and audit operation fails.
    pub fn fail_ledger(&self, fail: bool) {
        self.lock().fail_ledger = fail;
    }

    /// The `index`-th metadata transaction (0-based) fails; the others pass.
    pub fn fail_transaction_at(&self, index: usize) {
        let mut state = self.lock();
        state.fail_transaction_at = Some(index);
        state.transactions_seen = 0;
    }

    /// `deactivate_all(kind)` fails without changing anything.
    pub fn fail_deactivate_all(&self, kind: EntityKind) {
        self.lock().fail_deactivate_all.insert(kind);
    }

    /// Number of documents of `kind`, active or not.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.lock().collections.get(&kind).map_or(0, |c| c.len())
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    pub fn document(&self, kind: EntityKind, id: &SourceId) -> Option<ReplicaDocument> {
        self.lock()
            .collections
            .get(&kind)
            .and_then(|c| c.get(id))
            .cloned()
    }

    fn ledger_guard(state: &State) -> Result<(), ReplicaError> {
        if state.fail_ledger {
            return Err(ReplicaError::Unavailable("injected ledger failure".into()));
        }
        Ok(())
    }
}

impl ReplicaStore for MemoryReplicaStore {
    fn get_all(
        &self,
        kind: EntityKind,
        filter: Option<&Filter>,
    ) -> Result<Vec<ReplicaDocument>, ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::GetAll { kind });
        Ok(state
            .collections
            .get(&kind)
            .map(|c| store::query(c, filter))
            .unwrap_or_default())
    }

    fn get_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<Vec<ReplicaDocument>, ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::GetBySourceIds {
            kind,
            count: ids.len(),
        });
        let Some(collection) = state.collections.get(&kind) else {
            return Ok(vec![]);
        };
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
        let mut state = self.lock();
        state.calls.push(StoreCall::Upsert {
            kind,
            size: records.len(),
        });
        check_batch(kind, records.len())?;

        let seen = state.upserts_seen.entry(kind).or_insert(0);
        let index = *seen;
        *seen += 1;
        if state.fail_upsert_at.get(&kind) == Some(&index) {
            return Err(ReplicaError::Unavailable(format!(
                "injected failure on {kind} upsert #{index}"
            )));
        }

        store::apply_upsert(state.collections.entry(kind).or_default(), records);
        Ok(())
    }

    fn deactivate_by_source_ids(
        &self,
        kind: EntityKind,
        ids: &[SourceId],
    ) -> Result<(), ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Deactivate {
            kind,
            size: ids.len(),
        });
        check_batch(kind, ids.len())?;
        store::apply_deactivate(state.collections.entry(kind).or_default(), ids);
        Ok(())
    }

    fn deactivate_all(&self, kind: EntityKind) -> Result<u64, ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::DeactivateAll { kind });
        if state.fail_deactivate_all.contains(&kind) {
            return Err(ReplicaError::Unavailable(format!(
                "injected failure on {kind} deactivate_all"
            )));
        }
        let collection = state.collections.entry(kind).or_default();
        let ids: Vec<SourceId> = collection.keys().cloned().collect();
        Ok(store::apply_deactivate(collection, &ids))
    }
}

impl RunLedger for MemoryReplicaStore {
    fn read_metadata(&self) -> Result<RunMetadata, ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::ReadMetadata);
        Self::ledger_guard(&state)?;
        Ok(state.metadata.clone())
    }

    fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::WriteMetadata);
        Self::ledger_guard(&state)?;
        state.metadata = metadata.clone();
        Ok(())
    }

    fn transact_metadata(
        &self,
        apply: &mut dyn FnMut(&mut RunMetadata) -> bool,
    ) -> Result<bool, ReplicaError> {
        let mut state = self.lock();
        if let Err(err) = Self::ledger_guard(&state) {
            state.calls.push(StoreCall::TransactMetadata { committed: false });
            return Err(err);
        }
        let index = state.transactions_seen;
        state.transactions_seen += 1;
        if state.fail_transaction_at == Some(index) {
            state.calls.push(StoreCall::TransactMetadata { committed: false });
            return Err(ReplicaError::Unavailable(format!(
                "injected failure on metadata transaction #{index}"
            )));
        }
        let mut draft = state.metadata.clone();
        let committed = apply(&mut draft);
        if committed {
            state.metadata = draft;
        }
        state.calls.push(StoreCall::TransactMetadata { committed });
        Ok(committed)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<(), ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::AppendAudit);
        Self::ledger_guard(&state)?;
        state.audits.push(entry.clone());
        Ok(())
    }

    fn recent_audits(&self, limit: usize) -> Result<Vec<AuditLogEntry>, ReplicaError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::RecentAudits);
        Self::ledger_guard(&state)?;
        Ok(state.audits.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    fn record(id: &str) -> UpsertRecord {
        UpsertRecord {
            source_id: SourceId::from(id),
            fields: Map::new(),
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn failed_upsert_applies_nothing() {
        let store = MemoryReplicaStore::new();
        store.fail_upsert_at(EntityKind::School, 1);
        store
            .upsert_batch(EntityKind::School, &[record("a")])
            .expect("first upsert");
        assert!(store
            .upsert_batch(EntityKind::School, &[record("b"), record("c")])
            .is_err());
        assert_eq!(store.len(EntityKind::School), 1);
    }

    #[test]
    fn oversized_batch_is_rejected_and_logged() {
        let store = MemoryReplicaStore::new();
        let records: Vec<UpsertRecord> = (0..501).map(|i| record(&format!("r{i}"))).collect();
        assert!(matches!(
            store.upsert_batch(EntityKind::Lesson, &records),
            Err(ReplicaError::BatchTooLarge { size: 501, .. })
        ));
        assert!(store.is_empty(EntityKind::Lesson));
        assert_eq!(
            store.calls(),
            vec![StoreCall::Upsert {
                kind: EntityKind::Lesson,
                size: 501
            }]
        );
    }

    #[test]
    fn only_the_chosen_transaction_fails() {
        let store = MemoryReplicaStore::new();
        store.fail_transaction_at(1);
        assert!(store.transact_metadata(&mut |_| true).expect("first"));
        assert!(store.transact_metadata(&mut |_| true).is_err());
        assert!(store.transact_metadata(&mut |_| true).expect("third"));
    }

    #[test]
    fn declined_transaction_is_not_a_write() {
        let store = MemoryReplicaStore::new();
        let committed = store.transact_metadata(&mut |_| false).expect("transact");
        assert!(!committed);
        assert!(store.calls().iter().all(|c| !c.is_write()));
    }
}
