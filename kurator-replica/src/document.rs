//! Stored document shapes and field predicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kurator_core::{DocumentId, Entity, SourceId};

use crate::ReplicaError;

/// A replica document: bookkeeping fields plus the entity fields, stored flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaDocument {
    pub id: DocumentId,
    pub source_id: SourceId,
    pub is_active: bool,
    pub last_synced_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ReplicaDocument {
    /// Value of a field by its stored name, bookkeeping fields included.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.0.clone())),
            "sourceId" => Some(Value::String(self.source_id.0.clone())),
            "isActive" => Some(Value::Bool(self.is_active)),
            "lastSyncedAt" => Some(Value::String(self.last_synced_at.to_rfc3339())),
            other => self.fields.get(other).cloned(),
        }
    }

    /// Typed view of this document.
    pub fn decode<T: Entity>(&self) -> Result<ReplicaRecord<T>, ReplicaError> {
        Ok(ReplicaRecord {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            is_active: self.is_active,
            last_synced_at: self.last_synced_at,
            fields: T::from_fields(&self.source_id, self.fields.clone())?,
        })
    }
}

/// A typed replica record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord<T> {
    pub id: DocumentId,
    pub source_id: SourceId,
    pub is_active: bool,
    pub last_synced_at: DateTime<Utc>,
    pub fields: T,
}

/// A write keyed by `source_id`. Carries no replica id: the store assigns one
/// on first write and keeps it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRecord {
    pub source_id: SourceId,
    pub fields: Map<String, Value>,
    pub last_synced_at: DateTime<Utc>,
}

impl UpsertRecord {
    pub fn from_entity<T: Entity>(
        source_id: SourceId,
        entity: &T,
        last_synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id,
            fields: entity.to_fields(),
            last_synced_at,
        }
    }
}

/// A predicate on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::ArrayContains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `isActive == true`
    pub fn active() -> Self {
        Self::eq("isActive", true)
    }

    pub fn matches(&self, doc: &ReplicaDocument) -> bool {
        match self {
            Filter::Eq { field, value } => doc.field(field).as_ref() == Some(value),
            Filter::ArrayContains { field, value } => matches!(
                doc.field(field),
                Some(Value::Array(items)) if items.contains(value)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(active: bool, fields: Value) -> ReplicaDocument {
        let Value::Object(fields) = fields else {
            panic!("object expected");
        };
        ReplicaDocument {
            id: DocumentId::from("doc-1"),
            source_id: SourceId::from("recT1"),
            is_active: active,
            last_synced_at: Utc::now(),
            fields,
        }
    }

    #[test]
    fn stored_shape_is_flat() {
        let d = doc(true, json!({ "name": "Wasser" }));
        let json = serde_json::to_value(&d).expect("serialize");
        assert_eq!(json["sourceId"], "recT1");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["name"], "Wasser");

        let back: ReplicaDocument = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.fields.len(), 1);
        assert_eq!(back, d);
    }

    #[test]
    fn active_filter() {
        assert!(Filter::active().matches(&doc(true, json!({}))));
        assert!(!Filter::active().matches(&doc(false, json!({}))));
    }

    #[test]
    fn eq_and_array_contains_on_entity_fields() {
        let d = doc(
            true,
            json!({ "gradeLevels": ["3", "4"], "name": "Wasser" }),
        );
        assert!(Filter::eq("name", "Wasser").matches(&d));
        assert!(!Filter::eq("name", "Luft").matches(&d));
        assert!(Filter::array_contains("gradeLevels", "4").matches(&d));
        assert!(!Filter::array_contains("gradeLevels", "5").matches(&d));
        assert!(!Filter::array_contains("name", "Wasser").matches(&d));
        assert!(!Filter::eq("missing", "x").matches(&d));
    }
}
