//! Strict per-kind schemas.
//!
//! The same struct decodes both shapes a record can take: upstream column
//! labels (`Name`, `Beschreibung`, `Kompetenzen`, …, accepted as aliases) and
//! the camelCase replica fields it serializes to. Decoding happens once, at
//! the source client boundary; reconcilers only ever see these types.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{EntityKind, SourceId};

/// A record type mirrored from the source system.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Decode a field map (source or replica shape) into the typed record.
    fn from_fields(source_id: &SourceId, fields: Map<String, Value>) -> Result<Self, CoreError> {
        serde_json::from_value(Value::Object(fields)).map_err(|source| CoreError::Decode {
            kind: Self::KIND,
            source_id: source_id.0.clone(),
            source,
        })
    }

    /// Encode into the replica field shape.
    fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct School {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Ort", skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, alias = "Schulart", skip_serializing_if = "Option::is_none")]
    pub school_type: Option<String>,
    #[serde(default, alias = "Adresse", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Entity for School {
    const KIND: EntityKind = EntityKind::School;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Beschreibung", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Source ids of the competencies this theme covers.
    #[serde(rename = "kompetenzenIds", alias = "Kompetenzen", default)]
    pub competency_ids: Vec<SourceId>,
    #[serde(default, alias = "Klassenstufen")]
    pub grade_levels: Vec<String>,
    #[serde(default, alias = "Bild", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, alias = "Reihenfolge", skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i64>,
}

impl Entity for Theme {
    const KIND: EntityKind = EntityKind::Theme;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competency {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Beschreibung", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "Bereich", skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, alias = "Kuerzel", skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Entity for Competency {
    const KIND: EntityKind = EntityKind::Competency;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    #[serde(alias = "Titel")]
    pub title: String,
    /// Denormalized parent theme name. Lookup columns arrive as a one-element
    /// array upstream.
    #[serde(alias = "Thema", deserialize_with = "string_or_first")]
    pub theme_name: String,
    #[serde(default, alias = "Beschreibung", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "Dauer", skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(default, alias = "Klassenstufe", skip_serializing_if = "Option::is_none")]
    pub grade_level: Option<String>,
    #[serde(default, alias = "Materialien")]
    pub materials: Vec<String>,
}

impl Entity for Lesson {
    const KIND: EntityKind = EntityKind::Lesson;
}

/// Replica field holding a lesson's theme name.
pub const LESSON_THEME_FIELD: &str = "themeName";

/// Upstream column holding a lesson's theme name.
pub const LESSON_THEME_SOURCE_FIELD: &str = "Thema";

fn string_or_first<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(s),
        OneOrMany::Many(values) => values
            .into_iter()
            .next()
            .ok_or_else(|| serde::de::Error::custom("empty theme lookup")),
    }
}
