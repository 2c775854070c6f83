//! Per-function sequencing, signing, and appending of log entries.
//!
//! The sequencer owns the single most important concurrency invariant in
//! the pipeline: *append-with-sequence* is serialized per `functionId`. A
//! per-function async mutex is held across the whole of
//! `latest_sequence → build entry → sign → append`, so two concurrent
//! callers can never read the same `last` and a burst of N appends always
//! lands as the contiguous range `{last+1 … last+N}`.
//!
//! Timestamps are taken inside the critical section, which makes them
//! non-decreasing by sequence within a chain. Signing is CPU-bound and does
//! not suspend, so the hold time is the two store calls plus one RSA
//! operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::entry::{LogEntry, SignedLogEntry, canonical_bytes};
use crate::signer::Signer;
use crate::store::{LogStore, StoreError};

/// Errors from the sequence-sign-append pipeline.
#[derive(Debug, Error)]
pub enum SequencerError {
    /// The store rejected the append. The caller must treat the operation
    /// being logged as failed.
    #[error("log append failed: {0}")]
    Store(#[from] StoreError),
}

/// Serializes entry construction per function and signs every entry.
///
/// Shared between the logging proxy (egress entries) and the audit layer
/// (request/response entries); different `functionId`s proceed in parallel.
pub struct EntrySequencer {
    store: Arc<dyn LogStore>,
    signer: Arc<Signer>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntrySequencer {
    /// Creates a sequencer over a store and signer.
    #[must_use]
    pub fn new(store: Arc<dyn LogStore>, signer: Arc<Signer>) -> Self {
        Self {
            store,
            signer,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns the signer used for entries.
    #[must_use]
    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Builds, signs, and appends the next entry for `function_id`.
    ///
    /// `build` receives the assigned sequence and the timestamp taken
    /// inside the critical section, and must return an entry carrying that
    /// sequence and `function_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SequencerError::Store`] when the backend rejects the
    /// append; the entry is then not part of the chain.
    pub async fn append_with<F>(
        &self,
        function_id: &str,
        build: F,
    ) -> Result<SignedLogEntry, SequencerError>
    where
        F: FnOnce(u64, DateTime<Utc>) -> LogEntry,
    {
        let lock = self.lock_for(function_id);
        let _guard = lock.lock().await;

        let last = self.store.latest_sequence(function_id).await?;
        let sequence = last + 1;
        let timestamp = Utc::now();

        let entry = build(sequence, timestamp);
        debug_assert_eq!(entry.sequence(), sequence);
        debug_assert_eq!(entry.function_id(), function_id);

        let signature = self.signer.sign(&canonical_bytes(&entry));
        let signed = SignedLogEntry { entry, signature };

        self.store.append(&signed).await?;
        debug!(function_id, sequence, kind = signed.entry.kind(), "appended log entry");

        Ok(signed)
    }

    /// Mutex poisoning indicates a panic in another thread, which is
    /// unrecoverable.
    #[allow(clippy::missing_panics_doc)]
    fn lock_for(&self, function_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
