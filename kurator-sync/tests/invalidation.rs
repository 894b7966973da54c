use chrono::Utc;
use serde_json::json;

use kurator_core::config::SyncConfig;
use kurator_core::{
    Actor, EntityKind, Role, RunMetadata, School, SourceId, SyncStatus, Theme, TriggerType,
};
use kurator_replica::{FileReplicaStore, MemoryReplicaStore, ReplicaStore, RunLedger, Filter};
use kurator_source::MemorySourceClient;
use kurator_sync::{SyncEngine, SyncError};
use tempfile::TempDir;

fn seeded_source() -> MemorySourceClient {
    let source = MemorySourceClient::new();
    source.insert(
        &SourceId::from("recS1"),
        &School {
            name: "Nord".into(),
            city: None,
            school_type: None,
            address: None,
        },
    );
    source.insert(
        &SourceId::from("recT1"),
        &Theme {
            name: "Wasser".into(),
            description: None,
            competency_ids: vec![],
            grade_levels: vec![],
            image_url: None,
            sort_order: None,
        },
    );
    source
}

fn admin() -> Actor {
    Actor::new("root@example.org", Role::Admin)
}

#[test]
fn only_admin_may_invalidate() {
    let engine = SyncEngine::new(seeded_source(), MemoryReplicaStore::new(), SyncConfig::default());
    engine.run_full_sync(TriggerType::Manual, None);
    engine.replica().reset_calls();

    for role in [Role::Teacher, Role::Reviewer] {
        let err = engine
            .invalidate_all(&Actor::new("someone", role))
            .unwrap_err();
        assert!(matches!(err, SyncError::Forbidden { .. }), "got: {err}");
    }
    assert!(engine.replica().calls().iter().all(|c| !c.is_write()));
}

#[test]
fn invalidation_report_serialises_per_kind_counts() {
    let engine = SyncEngine::new(seeded_source(), MemoryReplicaStore::new(), SyncConfig::default());
    engine.run_full_sync(TriggerType::Manual, None);

    let report = engine.invalidate_all(&admin()).expect("invalidate");
    assert_eq!(
        serde_json::to_value(&report).expect("encode"),
        json!({
            "actor": "root@example.org",
            "deactivated": { "school": 1, "theme": 1, "competency": 0, "lesson": 0 }
        })
    );
}

#[test]
fn invalidation_deactivates_everything_and_zeroes_counts() {
    let engine = SyncEngine::new(seeded_source(), MemoryReplicaStore::new(), SyncConfig::default());
    engine.run_full_sync(TriggerType::Manual, None);
    let before = engine.get_status().expect("status");
    assert_eq!(before.record_counts.total(), 2);

    let report = engine.invalidate_all(&admin()).expect("invalidate");
    assert_eq!(report.total(), 2);
    assert_eq!(report.deactivated[&EntityKind::School], 1);

    let status = engine.get_status().expect("status");
    assert_eq!(status.sync_status, SyncStatus::Idle);
    assert_eq!(status.record_counts.total(), 0);
    assert_eq!(status.last_full_sync, before.last_full_sync);
    for kind in EntityKind::SYNC_ORDER {
        let active = engine
            .replica()
            .get_all(kind, Some(&Filter::active()))
            .expect("read");
        assert!(active.is_empty(), "{kind}");
    }
    assert_eq!(engine.replica().len(EntityKind::School), 1);
}

#[test]
fn invalidation_is_idempotent() {
    let engine = SyncEngine::new(seeded_source(), MemoryReplicaStore::new(), SyncConfig::default());
    engine.run_full_sync(TriggerType::Manual, None);

    engine.invalidate_all(&admin()).expect("first");
    let after_first = engine.get_status().expect("status");
    let second = engine.invalidate_all(&admin()).expect("second");
    assert_eq!(second.total(), 0);
    assert_eq!(engine.get_status().expect("status"), after_first);
}

#[test]
fn invalidation_refused_while_syncing() {
    let engine = SyncEngine::new(seeded_source(), MemoryReplicaStore::new(), SyncConfig::default());
    engine
        .replica()
        .write_metadata(&RunMetadata {
            sync_status: SyncStatus::Syncing,
            run_started_at: Some(Utc::now()),
            run_id: Some("run-busy".into()),
            ..RunMetadata::default()
        })
        .expect("seed");

    let err = engine.invalidate_all(&admin()).unwrap_err();
    assert!(
        matches!(err, SyncError::AlreadyRunning { run_id: Some(ref id) } if id == "run-busy"),
        "got: {err}"
    );
}

#[test]
fn next_sync_reactivates_after_invalidation_on_disk() {
    let home = TempDir::new().expect("home");
    let store = FileReplicaStore::open_at(home.path()).expect("open");
    let engine = SyncEngine::new(seeded_source(), store, SyncConfig::default());
    engine.run_full_sync(TriggerType::Manual, None);
    engine.invalidate_all(&admin()).expect("invalidate");

    // A fresh handle sees the persisted state.
    let reopened = FileReplicaStore::open_at(home.path()).expect("reopen");
    assert!(reopened
        .get_all(EntityKind::School, Some(&Filter::active()))
        .expect("read")
        .is_empty());

    let result = engine
        .run_full_sync(TriggerType::Manual, None)
        .completed()
        .cloned()
        .expect("completed");
    assert!(result.is_success());
    assert_eq!(result.results[&EntityKind::School].updated, 1);
    assert_eq!(
        reopened
            .get_all(EntityKind::School, Some(&Filter::active()))
            .expect("read")
            .len(),
        1
    );
    assert_eq!(reopened.recent_audits(10).expect("history").len(), 2);
}
