//! Contract tests run against both store backends.

use chrono::{TimeZone, Utc};

use super::*;
use crate::entry::{LogEntry, Protocol};

fn egress(function_id: &str, sequence: u64) -> SignedLogEntry {
    SignedLogEntry {
        entry: LogEntry::Egress {
            sequence,
            function_id: function_id.to_string(),
            invocation_id: format!("inv-{sequence}"),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(sequence as i64),
            method: "GET".to_string(),
            host: "example.com".to_string(),
            port: 80,
            path: format!("/call/{sequence}"),
            protocol: Protocol::Http,
        },
        signature: format!("sig-{sequence}"),
    }
}

async fn assert_store_contract(store: &dyn LogStore) {
    assert_eq!(store.latest_sequence("fn-a").await.unwrap(), 0);
    assert!(store.get_all("fn-a").await.unwrap().is_empty());

    store.append(&egress("fn-a", 1)).await.unwrap();
    store.append(&egress("fn-a", 2)).await.unwrap();
    store.append(&egress("fn-b", 1)).await.unwrap();

    assert_eq!(store.latest_sequence("fn-a").await.unwrap(), 2);
    assert_eq!(store.latest_sequence("fn-b").await.unwrap(), 1);

    let chain = store.get_all("fn-a").await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(
        chain.iter().map(|e| e.entry.sequence()).collect::<Vec<_>>(),
        vec![1, 2]
    );
    // The stored entry is exactly what was appended, signature included.
    assert_eq!(chain[0], egress("fn-a", 1));

    // Duplicate sequences are rejected; history is immutable.
    let err = store.append(&egress("fn-a", 2)).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::DuplicateSequence { sequence: 2, .. }
    ));
    assert_eq!(store.get_all("fn-a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn memory_store_contract() {
    let store = MemoryLogStore::new();
    assert_store_contract(&store).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
    let store = SqliteLogStore::in_memory().unwrap();
    assert_store_contract(&store).await;
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("audit.db");

    {
        let store = SqliteLogStore::open(&path).unwrap();
        store.append(&egress("fn-a", 1)).await.unwrap();
        store.append(&egress("fn-a", 2)).await.unwrap();
    }

    // A fresh handle must rebuild the latest-sequence view from disk.
    let store = SqliteLogStore::open(&path).unwrap();
    assert_eq!(store.latest_sequence("fn-a").await.unwrap(), 2);

    let chain = store.get_all("fn-a").await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].signature, "sig-2");
}

#[tokio::test]
async fn chains_are_independent_per_function() {
    let store = MemoryLogStore::new();

    store.append(&egress("fn-a", 1)).await.unwrap();
    // fn-b may reuse sequence 1; chains do not interleave.
    store.append(&egress("fn-b", 1)).await.unwrap();
    store.append(&egress("fn-b", 2)).await.unwrap();

    assert_eq!(store.get_all("fn-a").await.unwrap().len(), 1);
    assert_eq!(store.get_all("fn-b").await.unwrap().len(), 2);
}
