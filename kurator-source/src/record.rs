//! Wire and typed record shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kurator_core::{Entity, SourceId};

use crate::SourceError;

/// A record as returned by the table API: opaque fields keyed by column label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn decode<T: Entity>(self) -> Result<SourceRecord<T>, SourceError> {
        let fields = T::from_fields(&self.id, self.fields)?;
        Ok(SourceRecord {
            id: self.id,
            created_time: self.created_time,
            fields,
        })
    }
}

/// A source record after schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord<T> {
    pub id: SourceId,
    pub created_time: Option<DateTime<Utc>>,
    pub fields: T,
}

/// One page of a list request.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ListPage {
    #[serde(default)]
    pub records: Vec<RawRecord>,
    /// Continuation token; absent on the last page.
    #[serde(default)]
    pub offset: Option<String>,
}
