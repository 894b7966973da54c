//! The source client seam.

use std::collections::BTreeMap;

use kurator_core::{Entity, EntityKind, SourceId};

use crate::{RawRecord, SourceError, SourceRecord};

/// The table API accepts at most this many ids in one filter formula.
pub const MAX_IDS_PER_FILTER: usize = 10;

/// Which records of a table to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter<'a> {
    /// Full table scan.
    All,
    /// Records with these ids. Never longer than [`MAX_IDS_PER_FILTER`].
    Ids(&'a [SourceId]),
    /// Records whose upstream column `field` equals `value` (or, for
    /// multi-value columns, contains it).
    FieldEquals { field: &'a str, value: &'a str },
}

/// Read access to the authoritative content system.
///
/// Implementors provide [`SourceClient::query`] (one logical request,
/// including pagination). The typed helpers decode at this boundary and own
/// the id chunking. No method retries; retry policy belongs to the caller.
pub trait SourceClient: Send + Sync {
    fn query(
        &self,
        kind: EntityKind,
        filter: &RecordFilter<'_>,
    ) -> Result<Vec<RawRecord>, SourceError>;

    /// Every record of `T`'s table.
    fn fetch_all<T: Entity>(&self) -> Result<Vec<SourceRecord<T>>, SourceError> {
        decode_all(self.query(T::KIND, &RecordFilter::All)?)
    }

    /// Records with the given ids, keyed by id.
    ///
    /// Issues one request per chunk of at most [`MAX_IDS_PER_FILTER`] ids and
    /// merges the results. Any failed chunk fails the whole call.
    fn fetch_by_ids<T: Entity>(
        &self,
        ids: &[SourceId],
    ) -> Result<BTreeMap<SourceId, SourceRecord<T>>, SourceError> {
        let mut unique: Vec<SourceId> = ids.to_vec();
        unique.sort();
        unique.dedup();

        let mut merged = BTreeMap::new();
        for (index, chunk) in unique.chunks(MAX_IDS_PER_FILTER).enumerate() {
            tracing::debug!(
                "fetching {} chunk {} ({} ids)",
                T::KIND,
                index + 1,
                chunk.len()
            );
            for record in decode_all::<T>(self.query(T::KIND, &RecordFilter::Ids(chunk))?)? {
                merged.insert(record.id.clone(), record);
            }
        }
        Ok(merged)
    }

    /// Records whose upstream column `field` matches `value`.
    fn fetch_by_field<T: Entity>(
        &self,
        field: &str,
        value: &str,
    ) -> Result<Vec<SourceRecord<T>>, SourceError> {
        decode_all(self.query(T::KIND, &RecordFilter::FieldEquals { field, value })?)
    }
}

fn decode_all<T: Entity>(raw: Vec<RawRecord>) -> Result<Vec<SourceRecord<T>>, SourceError> {
    raw.into_iter().map(RawRecord::decode).collect()
}
