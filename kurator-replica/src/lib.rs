//! # kurator-replica
//!
//! The local replica of the mirrored entity collections, plus the run
//! metadata singleton and the append-only run audit log.
//!
//! [`ReplicaStore`] and [`RunLedger`] are the only mutation path into the
//! replica. [`FileReplicaStore`] persists under `~/.kurator/replica/`;
//! [`MemoryReplicaStore`] backs tests.

pub mod document;
pub mod error;
pub mod file;
pub mod memory;
pub mod store;

pub use document::{Filter, ReplicaDocument, ReplicaRecord, UpsertRecord};
pub use error::ReplicaError;
pub use file::FileReplicaStore;
pub use memory::{MemoryReplicaStore, StoreCall};
pub use store::{BeginOutcome, ReplicaStore, RunLedger, MAX_BATCH_SIZE};
