//! In-memory source tables with failure injection, for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use kurator_core::entities::{LESSON_THEME_FIELD, LESSON_THEME_SOURCE_FIELD};
use kurator_core::{Entity, EntityKind, SourceId};

use crate::{RawRecord, RecordFilter, SourceClient, SourceError, MAX_IDS_PER_FILTER};

/// A request observed by [`MemorySourceClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub kind: EntityKind,
    /// Number of ids in an id filter; `None` for other filters.
    pub id_count: Option<usize>,
    /// Value of a field filter.
    pub field_value: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<EntityKind, BTreeMap<SourceId, RawRecord>>,
    failing: HashSet<EntityKind>,
    /// Kind → number of further requests that succeed before failing.
    fail_after: HashMap<EntityKind, usize>,
    failing_values: HashSet<String>,
    requests: Vec<RecordedRequest>,
}

/// Source tables held in memory.
///
/// Records inserted through [`MemorySourceClient::insert`] are stored in the
/// replica field shape; field filters given as upstream column labels are
/// resolved to those field names.
#[derive(Debug, Default)]
pub struct MemorySourceClient {
    state: Mutex<State>,
}

impl MemorySourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not cascade into every other assertion.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a typed record.
    pub fn insert<T: Entity>(&self, id: &SourceId, record: &T) {
        self.insert_raw(
            T::KIND,
            RawRecord {
                id: id.clone(),
                created_time: None,
                fields: record.to_fields(),
            },
        );
    }

    pub fn insert_raw(&self, kind: EntityKind, record: RawRecord) {
        self.lock()
            .tables
            .entry(kind)
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn remove(&self, kind: EntityKind, id: &SourceId) {
        if let Some(table) = self.lock().tables.get_mut(&kind) {
            table.remove(id);
        }
    }

    pub fn clear(&self, kind: EntityKind) {
        self.lock().tables.remove(&kind);
    }

    /// Every request for `kind` fails until [`MemorySourceClient::recover`].
    pub fn fail(&self, kind: EntityKind) {
        self.lock().failing.insert(kind);
    }

    /// The next `successes` requests for `kind` succeed, later ones fail.
    pub fn fail_after(&self, kind: EntityKind, successes: usize) {
        self.lock().fail_after.insert(kind, successes);
    }

    /// Field-filtered requests for this value fail.
    pub fn fail_value(&self, value: impl Into<String>) {
        self.lock().failing_values.insert(value.into());
    }

    pub fn recover(&self, kind: EntityKind) {
        let mut state = self.lock();
        state.failing.remove(&kind);
        state.fail_after.remove(&kind);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn reset_requests(&self) {
        self.lock().requests.clear();
    }
}

impl SourceClient for MemorySourceClient {
    fn query(
        &self,
        kind: EntityKind,
        filter: &RecordFilter<'_>,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            kind,
            id_count: match filter {
                RecordFilter::Ids(ids) => Some(ids.len()),
                _ => None,
            },
            field_value: match filter {
                RecordFilter::FieldEquals { value, .. } => Some((*value).to_string()),
                _ => None,
            },
        });

        if state.failing.contains(&kind) {
            return Err(unavailable(kind, "injected failure"));
        }
        if let Some(remaining) = state.fail_after.get_mut(&kind) {
            if *remaining == 0 {
                return Err(unavailable(kind, "injected failure"));
            }
            *remaining -= 1;
        }

        let table = state.tables.get(&kind);
        let records = match filter {
            RecordFilter::All => table
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default(),
            RecordFilter::Ids(ids) => {
                if ids.len() > MAX_IDS_PER_FILTER {
                    return Err(unavailable(
                        kind,
                        format!("filter names {} ids, limit is {MAX_IDS_PER_FILTER}", ids.len()),
                    ));
                }
                ids.iter()
                    .filter_map(|id| table.and_then(|t| t.get(id)).cloned())
                    .collect()
            }
            RecordFilter::FieldEquals { field, value } => {
                if state.failing_values.contains(*value) {
                    return Err(unavailable(kind, format!("injected failure for '{value}'")));
                }
                let field = resolve_field(field);
                table
                    .map(|t| {
                        t.values()
                            .filter(|r| field_matches(r.fields.get(field), value))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            }
        };
        Ok(records)
    }
}

fn resolve_field(field: &str) -> &str {
    if field == LESSON_THEME_SOURCE_FIELD {
        LESSON_THEME_FIELD
    } else {
        field
    }
}

fn field_matches(field: Option<&Value>, expected: &str) -> bool {
    match field {
        Some(Value::String(s)) => s == expected,
        Some(Value::Array(values)) => values.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

fn unavailable(kind: EntityKind, message: impl Into<String>) -> SourceError {
    SourceError::Unavailable {
        kind,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurator_core::{Lesson, School};

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
    fn field_filter_resolves_upstream_label() {
        let client = MemorySourceClient::new();
        client.insert(&SourceId::from("recL1"), &lesson("Regen", "Wasser"));
        client.insert(&SourceId::from("recL2"), &lesson("Wind", "Luft"));

        let found = client
            .fetch_by_field::<Lesson>(LESSON_THEME_SOURCE_FIELD, "Wasser")
            .expect("fetch");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fields.title, "Regen");
    }

    #[test]
    fn fail_and_recover() {
        let client = MemorySourceClient::new();
        client.insert(
            &SourceId::from("recS1"),
            &School {
                name: "Nord".into(),
                city: None,
                school_type: None,
                address: None,
            },
        );
        client.fail(EntityKind::School);
        assert!(client.fetch_all::<School>().is_err());

        client.recover(EntityKind::School);
        assert_eq!(client.fetch_all::<School>().expect("fetch").len(), 1);
        assert_eq!(client.requests().len(), 2);
    }

    #[test]
    fn failing_value_only_affects_that_filter() {
        let client = MemorySourceClient::new();
        client.insert(&SourceId::from("recL1"), &lesson("Regen", "Wasser"));
        client.fail_value("Luft");

        assert!(client
            .fetch_by_field::<Lesson>(LESSON_THEME_SOURCE_FIELD, "Luft")
            .is_err());
        assert!(client
            .fetch_by_field::<Lesson>(LESSON_THEME_SOURCE_FIELD, "Wasser")
            .is_ok());
    }
}
