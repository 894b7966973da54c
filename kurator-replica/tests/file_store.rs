use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use kurator_core::{
    AuditLogEntry, EntityKind, RunScope, SourceId, SyncStatus, Theme, TriggerType,
};
use kurator_replica::{
    BeginOutcome, FileReplicaStore, Filter, ReplicaStore, RunLedger, UpsertRecord,
};

fn record(id: &str, fields: Value) -> UpsertRecord {
    let Value::Object(fields) = fields else {
        panic!("object expected");
    };
    UpsertRecord {
        source_id: SourceId::from(id),
        fields,
        last_synced_at: Utc::now(),
    }
}

fn audit(id: &str) -> AuditLogEntry {
    AuditLogEntry {
        id: id.to_string(),
        timestamp: Utc::now(),
        trigger: TriggerType::Manual,
        scope: RunScope::Full,
        status: SyncStatus::Success,
        duration_ms: 12,
        results: BTreeMap::new(),
        errors: vec![],
        triggered_by: None,
    }
}

#[test]
fn documents_survive_reopen_with_stable_ids() {
    let home = TempDir::new().expect("home");
    let store = FileReplicaStore::open_at(home.path()).expect("open");
    store
        .upsert_batch(
            EntityKind::Theme,
            &[record(
                "recT1",
                json!({ "name": "Wasser", "kompetenzenIds": ["recK1"], "gradeLevels": [] }),
            )],
        )
        .expect("upsert");
    let first = store.get_all(EntityKind::Theme, None).expect("read");

    let reopened = FileReplicaStore::open_at(home.path()).expect("reopen");
    reopened
        .upsert_batch(
            EntityKind::Theme,
            &[record(
                "recT1",
                json!({ "name": "Wasser & Eis", "kompetenzenIds": [], "gradeLevels": [] }),
            )],
        )
        .expect("upsert again");

    let themes = reopened
        .get_all_records::<Theme>(None)
        .expect("typed read");
    assert_eq!(themes.len(), 1);
    assert_eq!(themes[0].id, first[0].id);
    assert_eq!(themes[0].fields.name, "Wasser & Eis");
    assert!(themes[0].is_active);
}

#[test]
fn collection_files_live_under_the_kurator_home() {
    let home = TempDir::new().expect("home");
    let store = FileReplicaStore::open_at(home.path()).expect("open");
    store
        .upsert_batch(EntityKind::Lesson, &[record("recL1", json!({ "title": "Regen" }))])
        .expect("upsert");
    assert!(home
        .path()
        .join(".kurator")
        .join("replica")
        .join("lessons.json")
        .exists());
}

#[test]
fn deactivation_and_filters_round_trip_through_disk() {
    let home = TempDir::new().expect("home");
    let store = FileReplicaStore::open_at(home.path()).expect("open");
    store
        .upsert_batch(
            EntityKind::Lesson,
            &[
                record("recL1", json!({ "title": "Regen", "themeName": "Wasser" })),
                record("recL2", json!({ "title": "Wind", "themeName": "Luft" })),
            ],
        )
        .expect("upsert");
    store
        .deactivate_by_source_ids(EntityKind::Lesson, &[SourceId::from("recL1"), SourceId::from("unknown")])
        .expect("deactivate");

    let reopened = FileReplicaStore::open_at(home.path()).expect("reopen");
    let active = reopened
        .get_all(EntityKind::Lesson, Some(&Filter::active()))
        .expect("active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].source_id, SourceId::from("recL2"));

    let by_theme = reopened
        .get_all(EntityKind::Lesson, Some(&Filter::eq("themeName", "Wasser")))
        .expect("by theme");
    assert_eq!(by_theme.len(), 1);
    assert!(!by_theme[0].is_active);

    let found = reopened
        .get_by_source_ids(EntityKind::Lesson, &[SourceId::from("recL1"), SourceId::from("nope")])
        .expect("lookup");
    assert_eq!(found.len(), 1);

    assert_eq!(reopened.deactivate_all(EntityKind::Lesson).expect("all"), 1);
    assert_eq!(reopened.deactivate_all(EntityKind::Lesson).expect("again"), 0);
}

#[test]
fn audit_log_appends_and_reads_newest_first() {
    let home = TempDir::new().expect("home");
    let store = FileReplicaStore::open_at(home.path()).expect("open");
    for id in ["run-1", "run-2", "run-3"] {
        store.append_audit(&audit(id)).expect("append");
    }
    let ids: Vec<String> = store
        .recent_audits(2)
        .expect("recent")
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["run-3".to_string(), "run-2".to_string()]);
}

#[test]
fn compare_and_begin_admits_one_of_two_handles() {
    let home = TempDir::new().expect("home");
    let a = FileReplicaStore::open_at(home.path()).expect("open a");
    let b = FileReplicaStore::open_at(home.path()).expect("open b");
    let stale_after = Duration::from_secs(3600);

    let first = a
        .compare_and_begin("run-a", Utc::now(), stale_after)
        .expect("begin a");
    let second = b
        .compare_and_begin("run-b", Utc::now(), stale_after)
        .expect("begin b");
    assert_eq!(first, BeginOutcome::Started);
    assert!(matches!(
        second,
        BeginOutcome::AlreadyRunning { run_id: Some(ref id), .. } if id == "run-a"
    ));

    // Only the owner can finish.
    assert!(!b
        .compare_and_finish("run-b", &mut |m| m.sync_status = SyncStatus::Success)
        .expect("finish b"));
    assert!(a
        .compare_and_finish("run-a", &mut |m| m.sync_status = SyncStatus::Success)
        .expect("finish a"));
    let metadata = b.read_metadata().expect("read");
    assert_eq!(metadata.sync_status, SyncStatus::Success);
    assert!(metadata.run_id.is_none());
}

#[test]
fn racing_threads_start_exactly_one_run() {
    let home = TempDir::new().expect("home");
    let root = home.path().to_path_buf();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let root = root.clone();
            thread::spawn(move || {
                let store = FileReplicaStore::open_at(&root).expect("open");
                store
                    .compare_and_begin(&format!("run-{i}"), Utc::now(), Duration::from_secs(3600))
                    .expect("begin")
            })
        })
        .collect();

    let started = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(BeginOutcome::is_started)
        .count();
    assert_eq!(started, 1);
}

#[test]
fn shared_handle_serialises_batches() {
    let home = TempDir::new().expect("home");
    let store = Arc::new(FileReplicaStore::open_at(home.path()).expect("open"));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let batch: Vec<UpsertRecord> = (0..50)
                    .map(|i| {
                        let mut fields = Map::new();
                        fields.insert("name".into(), format!("S{t}-{i}").into());
                        UpsertRecord {
                            source_id: SourceId::from(format!("rec{t}-{i}")),
                            fields,
                            last_synced_at: Utc::now(),
                        }
                    })
                    .collect();
                store.upsert_batch(EntityKind::School, &batch).expect("upsert");
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread");
    }
    assert_eq!(store.get_all(EntityKind::School, None).expect("read").len(), 200);
}
