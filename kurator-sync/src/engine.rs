//! The reconciliation coordinator.
//!
//! Every run goes through the same path:
//!
//! 1. `compare_and_begin` on the run ledger. If another run holds `syncing`
//!    the call returns [`RunOutcome::AlreadyRunning`] having written nothing.
//! 2. Reconcile each kind in scope, in [`EntityKind::SYNC_ORDER`]. A kind that
//!    fails is recorded as a zero-effect result with its error, and the next
//!    kind still runs.
//! 3. `compare_and_finish` with the terminal state, then append one audit
//!    entry.
//!
//! No error leaves [`SyncEngine::run_full_sync`]: ledger failures are logged
//! and folded into the returned [`RunResult`].

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use kurator_core::config::SyncConfig;
use kurator_core::{
    Actor, AuditLogEntry, EntityKind, EntityResult, RecordCounts, Role, RunMetadata, RunResult,
    RunScope, SyncStatus, TriggerType,
};
use kurator_replica::{BeginOutcome, ReplicaStore, RunLedger};
use kurator_source::SourceClient;

use crate::{reconciler, SyncError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of asking for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Declined: another run holds `syncing`. Nothing was written.
    AlreadyRunning {
        run_id: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
    Completed(RunResult),
}

impl RunOutcome {
    pub fn completed(&self) -> Option<&RunResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            RunOutcome::AlreadyRunning { .. } => None,
        }
    }
}

/// Result of asking for a single-kind run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOutcome {
    AlreadyRunning {
        run_id: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
    Completed {
        result: EntityResult,
        /// The run as recorded in the audit log.
        run: RunResult,
    },
}

/// What an invalidation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub actor: String,
    /// Documents that flipped from active to inactive, per kind.
    pub deactivated: BTreeMap<EntityKind, u64>,
}

impl InvalidationReport {
    pub fn total(&self) -> u64 {
        self.deactivated.values().sum()
    }
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

pub struct SyncEngine<S, R> {
    source: S,
    replica: R,
    config: SyncConfig,
}

impl<S, R> SyncEngine<S, R>
where
    S: SourceClient,
    R: ReplicaStore + RunLedger,
{
    pub fn new(source: S, replica: R, config: SyncConfig) -> Self {
        Self {
            source,
            replica,
            config,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn replica(&self) -> &R {
        &self.replica
    }

    /// Reconcile every kind.
    pub fn run_full_sync(
        &self,
        trigger: TriggerType,
        triggered_by: Option<String>,
    ) -> RunOutcome {
        self.run(RunScope::Full, trigger, triggered_by)
    }

    /// Reconcile one kind under the same guard as a full run.
    ///
    /// `record_counts` of other kinds and `last_full_sync` are left as they
    /// were.
    pub fn run_entity_sync(
        &self,
        kind: EntityKind,
        trigger: TriggerType,
        triggered_by: Option<String>,
    ) -> EntityOutcome {
        match self.run(RunScope::Kind(kind), trigger, triggered_by) {
            RunOutcome::AlreadyRunning { run_id, started_at } => {
                EntityOutcome::AlreadyRunning { run_id, started_at }
            }
            RunOutcome::Completed(run) => {
                let result = run.results.get(&kind).cloned().unwrap_or_else(|| {
                    EntityResult::failed(run.errors.join("; "))
                });
                EntityOutcome::Completed { result, run }
            }
        }
    }

    pub fn get_status(&self) -> Result<RunMetadata, SyncError> {
        Ok(self.replica.read_metadata()?)
    }

    /// Most recent runs, newest first.
    pub fn get_recent_runs(&self, limit: usize) -> Result<Vec<AuditLogEntry>, SyncError> {
        Ok(self.replica.recent_audits(limit)?)
    }

    /// Mark every replica document inactive and zero the record counts.
    ///
    /// Admin only. Refused while a run holds `syncing`; while invalidation
    /// runs it holds `syncing` itself, so no reconciliation can interleave.
    /// Running it twice leaves the same state as running it once.
    pub fn invalidate_all(&self, actor: &Actor) -> Result<InvalidationReport, SyncError> {
        if actor.role < Role::HIGHEST {
            tracing::warn!(
                "invalidation refused for {} ({})",
                actor.id,
                actor.role
            );
            return Err(SyncError::Forbidden {
                actor: actor.id.clone(),
                role: actor.role,
            });
        }

        let run_id = format!("invalidate-{}", uuid::Uuid::new_v4());
        match self.replica.compare_and_begin(
            &run_id,
            Utc::now(),
            self.config.stale_run_after(),
        )? {
            BeginOutcome::AlreadyRunning { run_id, .. } => {
                return Err(SyncError::AlreadyRunning { run_id });
            }
            BeginOutcome::TookOver {
                previous_run_id, ..
            } => tracing::warn!(
                "invalidation took over stale run {}",
                previous_run_id.as_deref().unwrap_or("<unknown>")
            ),
            BeginOutcome::Started => {}
        }

        let mut report = InvalidationReport {
            actor: actor.id.clone(),
            deactivated: BTreeMap::new(),
        };
        let mut failure = None;
        for kind in EntityKind::SYNC_ORDER {
            match self.replica.deactivate_all(kind) {
                Ok(changed) => {
                    report.deactivated.insert(kind, changed);
                }
                Err(err) => {
                    failure = Some(SyncError::Replica(err));
                    break;
                }
            }
        }

        let message = failure.as_ref().map(|err| format!("invalidation: {err}"));
        let finished = self.replica.compare_and_finish(&run_id, &mut |metadata| {
            match &message {
                None => {
                    metadata.sync_status = SyncStatus::Idle;
                    metadata.error_message = None;
                    metadata.record_counts = RecordCounts::default();
                }
                Some(message) => {
                    metadata.sync_status = SyncStatus::Error;
                    metadata.error_message = Some(message.clone());
                }
            }
        });
        match finished {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("invalidation {} lost ownership of the run metadata", run_id)
            }
            // The guard stays with this run until the stale ceiling releases it.
            Err(err) => tracing::error!(
                "invalidation {}: failed to write terminal state: {}",
                run_id,
                err
            ),
        }

        if let Some(err) = failure {
            tracing::error!("invalidation by {} failed: {}", actor.id, err);
            return Err(err);
        }
        tracing::info!(
            "invalidation by {} deactivated {} document(s)",
            actor.id,
            report.total()
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    fn run(
        &self,
        scope: RunScope,
        trigger: TriggerType,
        triggered_by: Option<String>,
    ) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        match self.replica.compare_and_begin(
            &run_id,
            started_at,
            self.config.stale_run_after(),
        ) {
            Ok(BeginOutcome::Started) => {
                tracing::info!("{} sync {} started ({})", scope, run_id, trigger);
            }
            Ok(BeginOutcome::TookOver {
                previous_run_id,
                started_at: previous_started_at,
            }) => {
                tracing::warn!(
                    "{} sync {} took over run {} stuck in syncing since {}",
                    scope,
                    run_id,
                    previous_run_id.as_deref().unwrap_or("<unknown>"),
                    previous_started_at
                );
            }
            Ok(BeginOutcome::AlreadyRunning { run_id, started_at }) => {
                tracing::info!(
                    "{} sync declined: run {} already in progress",
                    scope,
                    run_id.as_deref().unwrap_or("<unknown>")
                );
                return RunOutcome::AlreadyRunning { run_id, started_at };
            }
            Err(err) => {
                tracing::error!("{} sync could not start: {}", scope, err);
                let result = RunResult {
                    run_id,
                    trigger,
                    scope,
                    status: SyncStatus::Error,
                    started_at,
                    duration_ms: elapsed_ms(clock),
                    results: BTreeMap::new(),
                    errors: vec![format!("run metadata: {err}")],
                    triggered_by,
                };
                self.record_audit(&result);
                return RunOutcome::Completed(result);
            }
        }

        let kinds: Vec<EntityKind> = match scope {
            RunScope::Full => EntityKind::SYNC_ORDER.to_vec(),
            RunScope::Kind(kind) => vec![kind],
        };

        let mut results = BTreeMap::new();
        for kind in kinds {
            let result = match reconciler::reconcile(&self.source, &self.replica, kind) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!("{} reconciliation failed: {}", kind, err);
                    EntityResult::failed(err.to_string())
                }
            };
            results.insert(kind, result);
        }

        let errors: Vec<String> = EntityKind::SYNC_ORDER
            .iter()
            .filter_map(|kind| results.get(kind).map(|r| (kind, r)))
            .flat_map(|(kind, r)| r.errors.iter().map(move |e| format!("{kind}: {e}")))
            .collect();
        let status = if errors.is_empty() {
            SyncStatus::Success
        } else {
            SyncStatus::Error
        };

        let result = RunResult {
            run_id,
            trigger,
            scope,
            status,
            started_at,
            duration_ms: elapsed_ms(clock),
            results,
            errors,
            triggered_by,
        };
        self.record_finish(&result);
        self.record_audit(&result);

        tracing::info!(
            "{} sync {} finished: {} in {}ms",
            scope,
            result.run_id,
            result.status,
            result.duration_ms
        );
        RunOutcome::Completed(result)
    }

    fn record_finish(&self, result: &RunResult) {
        let now = Utc::now();
        let finished = self
            .replica
            .compare_and_finish(&result.run_id, &mut |metadata| {
                metadata.last_sync_duration_ms = Some(result.duration_ms);
                metadata.sync_status = result.status;
                if result.is_success() {
                    metadata.error_message = None;
                    if result.scope == RunScope::Full {
                        metadata.last_full_sync = Some(now);
                    }
                    for (kind, entity) in &result.results {
                        metadata.record_counts.set(*kind, entity.synced());
                    }
                } else {
                    metadata.error_message = Some(result.errors.join("; "));
                }
            });
        match finished {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                "run {} no longer owns the run metadata; terminal state not written",
                result.run_id
            ),
            Err(err) => tracing::error!(
                "run {}: failed to write terminal state: {}",
                result.run_id,
                err
            ),
        }
    }

    fn record_audit(&self, result: &RunResult) {
        if let Err(err) = self.replica.append_audit(&AuditLogEntry::from(result)) {
            tracing::error!("run {}: failed to append audit entry: {}", result.run_id, err);
        }
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
