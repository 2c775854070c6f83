//! Append-only storage for signed log entries.
//!
//! The [`LogStore`] trait abstracts the three operations the audit pipeline
//! needs: append a signed entry, read a function's chain in sequence order,
//! and look up the latest sequence number. Two backends implement it:
//!
//! - [`MemoryLogStore`]: in-process, for tests and development
//! - [`SqliteLogStore`]: durable, WAL-mode SQLite with a per-function
//!   latest-sequence cache
//!
//! # Async Pattern
//!
//! Trait methods return [`BoxFuture`] to stay object-safe while supporting
//! async callers; a store is shared across the proxy and the audit layer as
//! `Arc<dyn LogStore>`.
//!
//! # Invariants
//!
//! - Entries are immutable once appended; the store is append-only.
//! - Within one `functionId`, sequences are unique; a duplicate append is
//!   rejected rather than silently replacing history.
//! - `get_all` returns entries ordered by sequence ascending.
//!
//! Contiguity of sequences (no gaps) is enforced jointly with the
//! sequencer, which serializes `latest_sequence` → `append` per function.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::entry::SignedLogEntry;

mod memory;
mod sqlite;

#[cfg(test)]
mod tests;

pub use memory::MemoryLogStore;
pub use sqlite::SqliteLogStore;

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors surfaced by log store backends.
///
/// An append failure is recoverable from the store's perspective, but the
/// proxy treats it as fatal to the in-flight request it was logging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted entry could not be decoded.
    #[error("corrupt entry at {function_id}/{sequence}: {source}")]
    CorruptEntry {
        /// The log stream holding the corrupt row.
        function_id: String,
        /// The sequence of the corrupt row.
        sequence: u64,
        /// The decode failure.
        source: serde_json::Error,
    },

    /// An entry with this sequence already exists for the function.
    #[error("duplicate sequence {sequence} for function {function_id}")]
    DuplicateSequence {
        /// The log stream the duplicate was appended to.
        function_id: String,
        /// The sequence that already exists.
        sequence: u64,
    },
}

/// Trait defining the append-only log store contract.
///
/// Object-safe; used as `Arc<dyn LogStore>` by the sequencer.
pub trait LogStore: Send + Sync {
    /// Appends a signed entry.
    ///
    /// The caller is responsible for sequence assignment; appends with a
    /// sequence that already exists for the function fail with
    /// [`StoreError::DuplicateSequence`].
    fn append<'a>(&'a self, entry: &'a SignedLogEntry) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Returns all entries for a function, ordered by sequence ascending.
    fn get_all<'a>(
        &'a self,
        function_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SignedLogEntry>, StoreError>>;

    /// Returns the highest sequence for a function, or 0 when the chain is
    /// empty.
    fn latest_sequence<'a>(&'a self, function_id: &'a str)
    -> BoxFuture<'a, Result<u64, StoreError>>;
}
