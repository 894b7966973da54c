use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use chrono::Utc;
use predicates::str::contains;
use serde_json::{json, Value};
use tempfile::TempDir;

use kurator_core::{EntityKind, SourceId};
use kurator_replica::{FileReplicaStore, Filter, ReplicaStore, UpsertRecord};

fn kurator_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("kurator"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("KURATOR_SOURCE_API_KEY");
    cmd
}

fn seed_school(home: &Path, id: &str, name: &str) {
    let store = FileReplicaStore::open_at(home).expect("open replica");
    let Value::Object(fields) = json!({ "name": name }) else {
        unreachable!()
    };
    store
        .upsert_batch(
            EntityKind::School,
            &[UpsertRecord {
                source_id: SourceId::from(id),
                fields,
                last_synced_at: Utc::now(),
            }],
        )
        .expect("seed");
}

#[test]
fn status_on_fresh_home_is_idle() {
    let home = TempDir::new().expect("home");
    kurator_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("IDLE"))
        .stdout(contains("last full sync: never"));
}

#[test]
fn status_json_reports_metadata_and_active_documents() {
    let home = TempDir::new().expect("home");
    seed_school(home.path(), "recS1", "Nord");

    let assert = kurator_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let payload: Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("status json");
    assert_eq!(payload["syncStatus"], "idle");
    assert_eq!(payload["recordCounts"]["schools"], 0);
    assert_eq!(payload["activeDocuments"]["school"], 1);
    assert_eq!(payload["activeDocuments"]["lesson"], 0);
}

#[test]
fn history_is_empty_before_any_run() {
    let home = TempDir::new().expect("home");
    kurator_cmd(home.path())
        .arg("history")
        .assert()
        .success()
        .stdout(contains("No runs recorded yet"));

    let assert = kurator_cmd(home.path())
        .args(["history", "--json"])
        .assert()
        .success();
    let payload: Value = serde_json::from_slice(&assert.get_output().stdout).expect("json");
    assert_eq!(payload, json!([]));
}

#[test]
fn invalidate_requires_admin() {
    let home = TempDir::new().expect("home");
    seed_school(home.path(), "recS1", "Nord");

    kurator_cmd(home.path())
        .args(["invalidate", "--actor", "lea", "--role", "reviewer"])
        .assert()
        .failure()
        .stderr(contains("requires admin"));

    let store = FileReplicaStore::open_at(home.path()).expect("open");
    let active = store
        .get_all(EntityKind::School, Some(&Filter::active()))
        .expect("read");
    assert_eq!(active.len(), 1);
}

#[test]
fn admin_invalidation_deactivates_and_repeats_cleanly() {
    let home = TempDir::new().expect("home");
    seed_school(home.path(), "recS1", "Nord");
    seed_school(home.path(), "recS2", "Süd");

    kurator_cmd(home.path())
        .args(["invalidate", "--actor", "ops", "--role", "admin"])
        .assert()
        .success()
        .stdout(contains("2 document(s) deactivated"));

    kurator_cmd(home.path())
        .args(["invalidate", "--actor", "ops", "--role", "admin"])
        .assert()
        .success()
        .stdout(contains("0 document(s) deactivated"));

    let store = FileReplicaStore::open_at(home.path()).expect("open");
    let all = store.get_all(EntityKind::School, None).expect("read");
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|doc| !doc.is_active));
}

#[test]
fn unknown_role_is_rejected_by_the_parser() {
    let home = TempDir::new().expect("home");
    kurator_cmd(home.path())
        .args(["invalidate", "--actor", "ops", "--role", "root"])
        .assert()
        .failure()
        .stderr(contains("unknown role 'root'"));
}

#[test]
fn sync_without_api_key_fails_before_touching_the_replica() {
    let home = TempDir::new().expect("home");
    kurator_cmd(home.path())
        .arg("sync")
        .assert()
        .failure()
        .stderr(contains("KURATOR_SOURCE_API_KEY"));

    kurator_cmd(home.path())
        .arg("history")
        .assert()
        .success()
        .stdout(contains("No runs recorded yet"));
}

#[test]
fn sync_rejects_unknown_kind() {
    let home = TempDir::new().expect("home");
    kurator_cmd(home.path())
        .args(["sync", "--kind", "pupils"])
        .assert()
        .failure()
        .stderr(contains("unknown entity kind 'pupils'"));
}

#[test]
fn daemon_status_and_stop_without_daemon() {
    let home = TempDir::new().expect("home");
    let assert = kurator_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success();
    let payload: Value = serde_json::from_slice(&assert.get_output().stdout).expect("json");
    assert_eq!(payload["running"], false);

    kurator_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    kurator_cmd(home.path())
        .args(["daemon", "logs"])
        .assert()
        .success()
        .stdout(contains("log file not found"));
}
