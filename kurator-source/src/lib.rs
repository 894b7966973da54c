//! # kurator-source
//!
//! Read access to the authoritative content system.
//!
//! [`SourceClient`] is the seam: [`HttpSourceClient`] talks to the hosted
//! table API, [`MemorySourceClient`] backs tests. Id lookups are split into
//! chunks of at most [`MAX_IDS_PER_FILTER`] by the trait itself, so every
//! implementation sees bounded filters.

pub mod client;
pub mod error;
pub mod http;
pub mod memory;
pub mod record;

pub use client::{RecordFilter, SourceClient, MAX_IDS_PER_FILTER};
pub use error::SourceError;
pub use http::HttpSourceClient;
pub use memory::MemorySourceClient;
pub use record::{RawRecord, SourceRecord};
