//! Inbound request/response auditing for the runtime's own traffic.
//!
//! The control plane wraps each handled invocation in two entries: a
//! `request` entry logged before user code runs and a `response` entry
//! logged just before bytes are flushed to the caller. Both land on a
//! reserved log chain - by convention the runtime's own function id -
//! that sequences independently from every egress chain, under the same
//! critical-section discipline.

use std::sync::Arc;
use std::time::Duration;

use egresswatch_core::entry::LogEntry;
use egresswatch_core::sequencer::{EntrySequencer, SequencerError};
use sha2::{Digest, Sha256};

/// Reserved chain id for the runtime's inbound traffic.
pub const RUNTIME_FUNCTION_ID: &str = "runtime-server";

/// Records inbound request/response pairs on the runtime chain.
pub struct AuditLayer {
    sequencer: Arc<EntrySequencer>,
    function_id: String,
}

impl AuditLayer {
    /// Creates an audit layer on the default runtime chain.
    #[must_use]
    pub fn new(sequencer: Arc<EntrySequencer>) -> Self {
        Self::with_function_id(sequencer, RUNTIME_FUNCTION_ID)
    }

    /// Creates an audit layer on a custom chain id.
    #[must_use]
    pub fn with_function_id(sequencer: Arc<EntrySequencer>, function_id: impl Into<String>) -> Self {
        Self {
            sequencer,
            function_id: function_id.into(),
        }
    }

    /// Returns the chain id this layer writes to.
    #[must_use]
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Logs an inbound request before user code runs.
    ///
    /// Returns the assigned sequence, which the matching
    /// [`record_response`](Self::record_response) call passes back as the
    /// `requestSeq` back-reference.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be appended; the caller
    /// should fail the invocation rather than run unattested.
    pub async fn record_request(
        &self,
        invocation_id: &str,
        method: &str,
        path: &str,
        source_ip: &str,
        client_id: Option<&str>,
        body: &[u8],
    ) -> Result<u64, SequencerError> {
        let function_id = self.function_id.clone();
        let signed = self
            .sequencer
            .append_with(&self.function_id, |sequence, timestamp| LogEntry::Request {
                sequence,
                function_id,
                invocation_id: invocation_id.to_string(),
                timestamp,
                method: method.to_string(),
                path: path.to_string(),
                source_ip: source_ip.to_string(),
                client_id: client_id.map(str::to_string),
                request_size: body.len() as u64,
                request_hash: hex::encode(Sha256::digest(body)),
            })
            .await?;
        Ok(signed.entry.sequence())
    }

    /// Logs the outbound response just before it is flushed.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be appended.
    pub async fn record_response(
        &self,
        invocation_id: &str,
        request_seq: u64,
        status: u16,
        body: &[u8],
        duration: Duration,
    ) -> Result<u64, SequencerError> {
        let function_id = self.function_id.clone();
        let signed = self
            .sequencer
            .append_with(&self.function_id, |sequence, timestamp| {
                LogEntry::Response {
                    sequence,
                    function_id,
                    invocation_id: invocation_id.to_string(),
                    timestamp,
                    request_seq,
                    status,
                    response_size: body.len() as u64,
                    response_hash: hex::encode(Sha256::digest(body)),
                    duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                }
            })
            .await?;
        Ok(signed.entry.sequence())
    }
}
