//! # egresswatch-core
//!
//! Core library for egresswatch - an egress-attested function runtime.
//!
//! This crate provides the cryptographic audit primitives that make a
//! function's outbound network behaviour verifiable by third parties:
//!
//! - **Log entries**: per-function, strictly sequenced records of egress
//!   attempts and of inbound request/response pairs, with a fixed canonical
//!   serialization for signing
//! - **Signer**: deterministic RSA-2048 PKCS#1 v1.5 / SHA-256 signatures
//! - **Log store**: append-only storage behind an object-safe trait, with
//!   in-memory and SQLite backends
//! - **Sequencer**: the per-function critical section that assigns
//!   contiguous sequence numbers under concurrency
//! - **Integrity verifier**: offline chain verification for consumers
//! - **Bundle manifests**: content-addressed file manifests with signing,
//!   verification, and a version-chaining registry
//! - **Capability probe**: detection of optional OS isolation layers
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use egresswatch_core::sequencer::EntrySequencer;
//! use egresswatch_core::signer::Signer;
//! use egresswatch_core::store::MemoryLogStore;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signer = Arc::new(Signer::generate()?);
//! let store = Arc::new(MemoryLogStore::new());
//! let sequencer = EntrySequencer::new(store, signer);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod entry;
pub mod manifest;
pub mod probe;
pub mod sequencer;
pub mod signer;
pub mod store;
pub mod verify;

pub use entry::{LogEntry, Protocol, SignedLogEntry, canonical_bytes};
pub use sequencer::EntrySequencer;
pub use signer::{Signer, verify_signature};
pub use store::{LogStore, MemoryLogStore, SqliteLogStore};
pub use verify::{IntegrityReport, verify_log_integrity};
