//! `SQLite`-backed durable log store.
//!
//! Uses WAL mode for concurrent reads while appends are in progress. The
//! full signed entry is persisted as its wire JSON alongside the columns
//! needed for lookups, so reads reproduce exactly what was signed.
//!
//! The latest sequence per function is cached in memory to avoid a
//! `MAX(sequence)` query on every append; the cache is populated lazily on
//! first access per function and maintained on append.

// SQLite returns i64 for integer columns, but sequences are always
// non-negative and far below i64::MAX.
// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, ErrorCode, OpenFlags, params};

use super::{BoxFuture, LogStore, StoreError};
use crate::entry::SignedLogEntry;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Durable append-only store backed by `SQLite`.
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
    latest: Mutex<HashMap<String, u64>>,
}

impl SqliteLogStore {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn)
    }

    /// Creates a transient in-memory database, useful in tests that need
    /// the real SQL path without a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            latest: Mutex::new(HashMap::new()),
        })
    }

    fn append_sync(&self, entry: &SignedLogEntry) -> Result<(), StoreError> {
        let function_id = entry.entry.function_id();
        let sequence = entry.entry.sequence();
        let entry_json =
            serde_json::to_string(entry).map_err(|source| StoreError::CorruptEntry {
                function_id: function_id.to_string(),
                sequence,
                source,
            })?;

        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO log_entries (function_id, sequence, kind, entry_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![function_id, sequence as i64, entry.entry.kind(), entry_json],
        );
        drop(conn);

        match inserted {
            Ok(_) => {
                let mut latest = self.latest.lock().unwrap();
                let cached = latest.entry(function_id.to_string()).or_insert(0);
                if sequence > *cached {
                    *cached = sequence;
                }
                Ok(())
            },
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateSequence {
                    function_id: function_id.to_string(),
                    sequence,
                })
            },
            Err(e) => Err(e.into()),
        }
    }

    fn get_all_sync(&self, function_id: &str) -> Result<Vec<SignedLogEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sequence, entry_json FROM log_entries
             WHERE function_id = ?1 ORDER BY sequence ASC",
        )?;

        let rows = stmt.query_map(params![function_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, json) = row?;
            let entry = serde_json::from_str(&json).map_err(|source| StoreError::CorruptEntry {
                function_id: function_id.to_string(),
                sequence: sequence as u64,
                source,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn latest_sequence_sync(&self, function_id: &str) -> Result<u64, StoreError> {
        if let Some(cached) = self.latest.lock().unwrap().get(function_id) {
            return Ok(*cached);
        }

        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM log_entries WHERE function_id = ?1",
            params![function_id],
            |row| row.get(0),
        )?;
        drop(conn);

        let latest = max.map_or(0, |m| m as u64);
        self.latest
            .lock()
            .unwrap()
            .insert(function_id.to_string(), latest);
        Ok(latest)
    }
}

impl LogStore for SqliteLogStore {
    fn append<'a>(&'a self, entry: &'a SignedLogEntry) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move { self.append_sync(entry) })
    }

    fn get_all<'a>(
        &'a self,
        function_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SignedLogEntry>, StoreError>> {
        Box::pin(async move { self.get_all_sync(function_id) })
    }

    fn latest_sequence<'a>(
        &'a self,
        function_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move { self.latest_sequence_sync(function_id) })
    }
}
