//! Per-kind reconciliation: fetch the source set, diff it against the
//! replica, apply the difference in bounded chunks.
//!
//! ## Algorithm
//!
//! 1. Fetch the source set S for the kind.
//! 2. If S is empty, stop. Nothing is read from or written to the kind's
//!    collection: an empty fetch is never taken as "everything was deleted".
//! 3. Read the full replica set R for the kind.
//! 4. Every record of S is upserted. It counts as *added* when its source id
//!    is not in R, *updated* otherwise.
//! 5. Every active record of R whose source id is not in S is deactivated.
//! 6. Upserts are applied first, then deactivations, each in chunks of at
//!    most [`MAX_BATCH_SIZE`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use kurator_core::entities::{LESSON_THEME_FIELD, LESSON_THEME_SOURCE_FIELD};
use kurator_core::{
    Competency, Entity, EntityKind, EntityResult, Lesson, School, SourceId, Theme,
};
use kurator_replica::{Filter, ReplicaDocument, ReplicaError, ReplicaStore, UpsertRecord, MAX_BATCH_SIZE};
use kurator_source::{SourceClient, SourceRecord};

use crate::SyncError;

// ---------------------------------------------------------------------------
// Source sets
// ---------------------------------------------------------------------------

/// What was fetched for one kind.
struct SourceSet<T> {
    records: BTreeMap<SourceId, SourceRecord<T>>,
    /// Non-fatal fetch errors (lessons only).
    errors: Vec<String>,
    /// Theme names whose lessons could not be fetched. Replica lessons of
    /// these themes are left alone.
    unreadable_themes: BTreeSet<String>,
}

impl<T> SourceSet<T> {
    fn complete(records: impl IntoIterator<Item = SourceRecord<T>>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            errors: Vec::new(),
            unreadable_themes: BTreeSet::new(),
        }
    }

    /// Whether a replica document must survive even though S lacks it.
    fn protects(&self, doc: &ReplicaDocument) -> bool {
        if self.unreadable_themes.is_empty() {
            return false;
        }
        doc.fields
            .get(LESSON_THEME_FIELD)
            .and_then(|v| v.as_str())
            .is_some_and(|name| self.unreadable_themes.contains(name))
    }
}

/// Active themes as currently stored in the replica.
fn active_themes<R: ReplicaStore>(replica: &R) -> Result<Vec<Theme>, SyncError> {
    Ok(replica
        .get_all_records::<Theme>(Some(&Filter::active()))?
        .into_iter()
        .map(|record| record.fields)
        .collect())
}

/// Competencies referenced by any active theme.
///
/// Reads the theme collection to build the id set. When no theme references
/// a competency that read is the only replica call of the competency step.
fn competency_set<S: SourceClient, R: ReplicaStore>(
    source: &S,
    replica: &R,
) -> Result<SourceSet<Competency>, SyncError> {
    let ids: BTreeSet<SourceId> = active_themes(replica)?
        .into_iter()
        .flat_map(|theme| theme.competency_ids)
        .collect();
    if ids.is_empty() {
        tracing::debug!("no active theme references a competency");
        return Ok(SourceSet::complete(Vec::new()));
    }
    let ids: Vec<SourceId> = ids.into_iter().collect();
    Ok(SourceSet::complete(
        source.fetch_by_ids::<Competency>(&ids)?.into_values(),
    ))
}

/// Lessons of every active theme, fetched one theme at a time.
///
/// Lessons point at their theme by name. Themes sharing a name share their
/// lessons.
fn lesson_set<S: SourceClient, R: ReplicaStore>(
    source: &S,
    replica: &R,
) -> Result<SourceSet<Lesson>, SyncError> {
    let names: BTreeSet<String> = active_themes(replica)?
        .into_iter()
        .map(|theme| theme.name)
        .collect();

    let mut set = SourceSet::complete(Vec::new());
    for name in names {
        match source.fetch_by_field::<Lesson>(LESSON_THEME_SOURCE_FIELD, &name) {
            Ok(lessons) => {
                tracing::debug!("theme '{}': {} lesson(s)", name, lessons.len());
                for lesson in lessons {
                    set.records.insert(lesson.id.clone(), lesson);
                }
            }
            Err(err) => {
                tracing::warn!("lessons for theme '{}' failed: {}", name, err);
                set.errors.push(format!("lessons for theme '{name}': {err}"));
                set.unreadable_themes.insert(name);
            }
        }
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// The writes one reconciliation will issue.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub upserts: Vec<UpsertRecord>,
    pub added: u64,
    pub updated: u64,
    pub deactivate: Vec<SourceId>,
}

fn plan<T: Entity>(
    set: &SourceSet<T>,
    replica: &[ReplicaDocument],
    now: DateTime<Utc>,
) -> Plan {
    let known: BTreeMap<&SourceId, &ReplicaDocument> =
        replica.iter().map(|doc| (&doc.source_id, doc)).collect();

    let mut plan = Plan::default();
    for (id, record) in &set.records {
        if known.contains_key(id) {
            plan.updated += 1;
        } else {
            plan.added += 1;
        }
        plan.upserts
            .push(UpsertRecord::from_entity(id.clone(), &record.fields, now));
    }

    plan.deactivate = replica
        .iter()
        .filter(|doc| doc.is_active)
        .filter(|doc| !set.records.contains_key(&doc.source_id))
        .filter(|doc| !set.protects(doc))
        .map(|doc| doc.source_id.clone())
        .collect();
    plan
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Issue `write` once per chunk of at most [`MAX_BATCH_SIZE`] items, in
/// order. The first failure stops the sequence.
pub(crate) fn write_chunks<I>(
    kind: EntityKind,
    op: &'static str,
    items: &[I],
    mut write: impl FnMut(&[I]) -> Result<(), ReplicaError>,
) -> Result<usize, SyncError> {
    let chunks = items.len().div_ceil(MAX_BATCH_SIZE);
    for (index, chunk) in items.chunks(MAX_BATCH_SIZE).enumerate() {
        write(chunk).map_err(|source| SyncError::ChunkFailed {
            kind,
            op,
            chunk: index + 1,
            chunks,
            applied: index,
            source,
        })?;
    }
    Ok(chunks)
}

fn apply<T: Entity, R: ReplicaStore>(
    replica: &R,
    set: SourceSet<T>,
    now: DateTime<Utc>,
) -> Result<EntityResult, SyncError> {
    let kind = T::KIND;
    if set.records.is_empty() {
        tracing::info!("{}: source returned no records, replica left untouched", kind);
        return Ok(EntityResult {
            errors: set.errors,
            ..EntityResult::default()
        });
    }

    let existing = replica.get_all(kind, None)?;
    let plan = plan(&set, &existing, now);

    let upsert_chunks = write_chunks(kind, "upsert", &plan.upserts, |chunk| {
        replica.upsert_batch(kind, chunk)
    })?;
    let deactivate_chunks = write_chunks(kind, "deactivate", &plan.deactivate, |chunk| {
        replica.deactivate_by_source_ids(kind, chunk)
    })?;

    tracing::info!(
        "{}: {} added, {} updated, {} deactivated ({} upsert + {} deactivate chunk(s))",
        kind,
        plan.added,
        plan.updated,
        plan.deactivate.len(),
        upsert_chunks,
        deactivate_chunks
    );

    Ok(EntityResult {
        added: plan.added,
        updated: plan.updated,
        deactivated: plan.deactivate.len() as u64,
        errors: set.errors,
    })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Reconcile one entity kind.
///
/// An `Err` means nothing can be said about the kind's outcome: the source
/// set could not be fetched, the replica could not be read, or a chunk write
/// failed. Per-theme lesson fetch failures are not fatal; they come back in
/// [`EntityResult::errors`] alongside the counts.
pub fn reconcile<S: SourceClient, R: ReplicaStore>(
    source: &S,
    replica: &R,
    kind: EntityKind,
) -> Result<EntityResult, SyncError> {
    let now = Utc::now();
    tracing::debug!("reconciling {}", kind);
    match kind {
        EntityKind::School => apply(
            replica,
            SourceSet::complete(source.fetch_all::<School>()?),
            now,
        ),
        EntityKind::Theme => apply(
            replica,
            SourceSet::complete(source.fetch_all::<Theme>()?),
            now,
        ),
        EntityKind::Competency => apply(replica, competency_set(source, replica)?, now),
        EntityKind::Lesson => apply(replica, lesson_set(source, replica)?, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurator_replica::{MemoryReplicaStore, StoreCall};
    use kurator_source::MemorySourceClient;

    fn school(name: &str) -> School {
        School {
            name: name.to_string(),
            city: None,
            school_type: None,
            address: None,
        }
    }

    fn theme(name: &str, competencies: &[&str]) -> Theme {
        Theme {
            name: name.to_string(),
            description: None,
            competency_ids: competencies.iter().map(|c| SourceId::from(*c)).collect(),
            grade_levels: vec![],
            image_url: None,
            sort_order: None,
        }
    }

    fn lesson(title: &str, theme: &str) -> Lesson {
        Lesson {
            title: title.to_string(),
            theme_name: theme.to_string(),
            description: None,
            duration_minutes: Some(45),
            grade_level: None,
            materials: vec![],
        }
    }

    #[test]
    fn plan_classifies_added_updated_and_deactivated() {
        let source = MemorySourceClient::new();
        let replica = MemoryReplicaStore::new();
        source.insert(&SourceId::from("recA"), &school("A"));
        source.insert(&SourceId::from("recB"), &school("B"));
        reconcile(&source, &replica, EntityKind::School).expect("first");

        source.remove(EntityKind::School, &SourceId::from("recB"));
        source.insert(&SourceId::from("recC"), &school("C"));
        let result = reconcile(&source, &replica, EntityKind::School).expect("second");
        assert_eq!((result.added, result.updated, result.deactivated), (1, 1, 1));
        assert_eq!(replica.len(EntityKind::School), 3);
    }

    #[test]
    fn already_inactive_records_are_not_deactivated_again() {
        let source = MemorySourceClient::new();
        let replica = MemoryReplicaStore::new();
        source.insert(&SourceId::from("recA"), &school("A"));
        source.insert(&SourceId::from("recB"), &school("B"));
        reconcile(&source, &replica, EntityKind::School).expect("first");
        source.remove(EntityKind::School, &SourceId::from("recB"));
        reconcile(&source, &replica, EntityKind::School).expect("second");

        let third = reconcile(&source, &replica, EntityKind::School).expect("third");
        assert_eq!(third.deactivated, 0);
        assert!(!replica.calls().iter().any(|c| matches!(
            c,
            StoreCall::Deactivate { size: 0, .. }
        )));
    }

    #[test]
    fn upserts_are_applied_before_deactivations() {
        let source = MemorySourceClient::new();
        let replica = MemoryReplicaStore::new();
        source.insert(&SourceId::from("recA"), &school("A"));
        reconcile(&source, &replica, EntityKind::School).expect("first");
        source.remove(EntityKind::School, &SourceId::from("recA"));
        source.insert(&SourceId::from("recB"), &school("B"));
        replica.reset_calls();

        reconcile(&source, &replica, EntityKind::School).expect("second");
        let writes: Vec<StoreCall> = replica.calls().into_iter().filter(|c| c.is_write()).collect();
        assert_eq!(
            writes,
            vec![
                StoreCall::Upsert { kind: EntityKind::School, size: 1 },
                StoreCall::Deactivate { kind: EntityKind::School, size: 1 },
            ]
        );
    }

    #[test]
    fn chunk_failure_reports_applied_chunks() {
        let replica = MemoryReplicaStore::new();
        replica.fail_upsert_at(EntityKind::Lesson, 2);
        let items: Vec<UpsertRecord> = (0..1234)
            .map(|i| UpsertRecord::from_entity(SourceId::from(format!("rec{i:04}")), &lesson("L", "T"), Utc::now()))
            .collect();

        let err = write_chunks(EntityKind::Lesson, "upsert", &items, |chunk| {
            replica.upsert_batch(EntityKind::Lesson, chunk)
        })
        .unwrap_err();
        assert!(matches!(
            err,
            SyncError::ChunkFailed { chunk: 3, chunks: 3, applied: 2, .. }
        ));
        assert_eq!(replica.len(EntityKind::Lesson), 1000);
        assert!(err.to_string().contains("2 chunk(s) already applied"));
    }

    #[test]
    fn competencies_follow_active_theme_references() {
        let source = MemorySourceClient::new();
        let replica = MemoryReplicaStore::new();
        source.insert(&SourceId::from("recT1"), &theme("Wasser", &["recK1", "recK2"]));
        source.insert(
            &SourceId::from("recK1"),
            &Competency { name: "Lesen".into(), description: None, area: None, code: None },
        );
        source.insert(
            &SourceId::from("recK2"),
            &Competency { name: "Rechnen".into(), description: None, area: None, code: None },
        );
        source.insert(
            &SourceId::from("recK9"),
            &Competency { name: "Unreferenced".into(), description: None, area: None, code: None },
        );
        reconcile(&source, &replica, EntityKind::Theme).expect("themes");

        let result = reconcile(&source, &replica, EntityKind::Competency).expect("competencies");
        assert_eq!(result.added, 2);
        assert!(replica.document(EntityKind::Competency, &SourceId::from("recK9")).is_none());
    }

    #[test]
    fn lessons_of_unreadable_theme_are_kept_active() {
        let source = MemorySourceClient::new();
        let replica = MemoryReplicaStore::new();
        source.insert(&SourceId::from("recT1"), &theme("Wasser", &[]));
        source.insert(&SourceId::from("recT2"), &theme("Luft", &[]));
        source.insert(&SourceId::from("recL1"), &lesson("Regen", "Wasser"));
        source.insert(&SourceId::from("recL2"), &lesson("Wind", "Luft"));
        reconcile(&source, &replica, EntityKind::Theme).expect("themes");
        reconcile(&source, &replica, EntityKind::Lesson).expect("lessons");

        source.fail_value("Luft");
        let result = reconcile(&source, &replica, EntityKind::Lesson).expect("lessons");
        assert_eq!(result.updated, 1);
        assert_eq!(result.deactivated, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("lessons for theme 'Luft':"));

        let kept = replica
            .document(EntityKind::Lesson, &SourceId::from("recL2"))
            .expect("stored");
        assert!(kept.is_active);
    }
}
