//! Reading cross-kind relations back out of the replica.
//!
//! Deactivated documents stay resolvable: a theme that still lists a
//! competency the source no longer has gets that competency back, flagged
//! inactive. Only ids with no document at all are reported missing.

use kurator_core::entities::LESSON_THEME_FIELD;
use kurator_core::{Competency, EntityKind, Lesson, SourceId, Theme};
use kurator_replica::{Filter, ReplicaDocument, ReplicaRecord, ReplicaStore};

use crate::SyncError;

/// A theme with its competencies resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeCompetencies {
    pub theme: ReplicaRecord<Theme>,
    /// In the order the theme lists them, active or not.
    pub competencies: Vec<ReplicaRecord<Competency>>,
    /// Referenced ids with no replica document.
    pub missing: Vec<SourceId>,
}

/// Resolve the competencies a theme references. `Ok(None)` if the theme
/// itself is not in the replica.
pub fn resolve_theme_competencies<R: ReplicaStore>(
    store: &R,
    theme_id: &SourceId,
) -> Result<Option<ThemeCompetencies>, SyncError> {
    let Some(theme) = store
        .get_by_source_ids(EntityKind::Theme, std::slice::from_ref(theme_id))?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    let theme = theme.decode::<Theme>()?;

    let found = if theme.fields.competency_ids.is_empty() {
        Vec::new()
    } else {
        store.get_by_source_ids(EntityKind::Competency, &theme.fields.competency_ids)?
    };

    let mut competencies = Vec::new();
    let mut missing = Vec::new();
    for id in &theme.fields.competency_ids {
        match found.iter().find(|doc| &doc.source_id == id) {
            Some(doc) => competencies.push(doc.decode::<Competency>()?),
            None => missing.push(id.clone()),
        }
    }

    Ok(Some(ThemeCompetencies {
        theme,
        competencies,
        missing,
    }))
}

/// Lessons whose theme name matches, optionally only active ones.
pub fn lessons_for_theme<R: ReplicaStore>(
    store: &R,
    theme_name: &str,
    active_only: bool,
) -> Result<Vec<ReplicaRecord<Lesson>>, SyncError> {
    let docs = store.get_all(
        EntityKind::Lesson,
        Some(&Filter::eq(LESSON_THEME_FIELD, theme_name)),
    )?;
    docs.iter()
        .filter(|doc| !active_only || doc.is_active)
        .map(|doc: &ReplicaDocument| doc.decode::<Lesson>().map_err(SyncError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kurator_replica::{MemoryReplicaStore, UpsertRecord};

    fn competency(name: &str) -> Competency {
        Competency {
            name: name.to_string(),
            description: None,
            area: None,
            code: None,
        }
    }

    fn seed_theme(store: &MemoryReplicaStore, id: &str, competencies: &[&str]) {
        let theme = Theme {
            name: "Wasser".into(),
            description: None,
            competency_ids: competencies.iter().map(|c| SourceId::from(*c)).collect(),
            grade_levels: vec![],
            image_url: None,
            sort_order: None,
        };
        store
            .upsert_batch(
                EntityKind::Theme,
                &[UpsertRecord::from_entity(SourceId::from(id), &theme, Utc::now())],
            )
            .expect("seed theme");
    }

    #[test]
    fn unknown_theme_resolves_to_none() {
        let store = MemoryReplicaStore::new();
        assert!(resolve_theme_competencies(&store, &SourceId::from("recT9"))
            .expect("resolve")
            .is_none());
    }

    #[test]
    fn missing_competency_is_reported_not_dropped_silently() {
        let store = MemoryReplicaStore::new();
        seed_theme(&store, "recT1", &["recK1", "recK2"]);
        store
            .upsert_batch(
                EntityKind::Competency,
                &[UpsertRecord::from_entity(SourceId::from("recK2"), &competency("Lesen"), Utc::now())],
            )
            .expect("seed competency");

        let resolved = resolve_theme_competencies(&store, &SourceId::from("recT1"))
            .expect("resolve")
            .expect("theme");
        assert_eq!(resolved.competencies.len(), 1);
        assert_eq!(resolved.competencies[0].fields.name, "Lesen");
        assert_eq!(resolved.missing, vec![SourceId::from("recK1")]);
    }

    #[test]
    fn theme_without_references_makes_no_competency_lookup() {
        let store = MemoryReplicaStore::new();
        seed_theme(&store, "recT1", &[]);
        store.reset_calls();

        let resolved = resolve_theme_competencies(&store, &SourceId::from("recT1"))
            .expect("resolve")
            .expect("theme");
        assert!(resolved.competencies.is_empty());
        assert!(store
            .calls()
            .iter()
            .all(|c| c.kind() != Some(EntityKind::Competency)));
    }
}
