//! In-memory log store for tests and development.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{BoxFuture, LogStore, StoreError};
use crate::entry::SignedLogEntry;

/// Volatile store: `functionId → entries ordered by sequence`.
///
/// Entries are kept sorted on insert so `get_all` is a plain clone even
/// when appends arrive out of order across functions.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    chains: RwLock<HashMap<String, Vec<SignedLogEntry>>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn append_entry(&self, entry: &SignedLogEntry) -> Result<(), StoreError> {
        let mut chains = self.chains.write().await;
        let chain = chains
            .entry(entry.entry.function_id().to_string())
            .or_default();

        let sequence = entry.entry.sequence();
        if chain.iter().any(|e| e.entry.sequence() == sequence) {
            return Err(StoreError::DuplicateSequence {
                function_id: entry.entry.function_id().to_string(),
                sequence,
            });
        }

        chain.push(entry.clone());
        chain.sort_by_key(|e| e.entry.sequence());
        Ok(())
    }
}

impl LogStore for MemoryLogStore {
    fn append<'a>(&'a self, entry: &'a SignedLogEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.append_entry(entry))
    }

    fn get_all<'a>(
        &'a self,
        function_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SignedLogEntry>, StoreError>> {
        Box::pin(async move {
            let chains = self.chains.read().await;
            Ok(chains.get(function_id).cloned().unwrap_or_default())
        })
    }

    fn latest_sequence<'a>(
        &'a self,
        function_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let chains = self.chains.read().await;
            Ok(chains
                .get(function_id)
                .and_then(|chain| chain.last())
                .map_or(0, |e| e.entry.sequence()))
        })
    }
}
