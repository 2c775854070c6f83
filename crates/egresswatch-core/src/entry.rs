//! Log entry model and canonical serialization.
//!
//! A [`LogEntry`] is one record in a per-function audit chain. Three kinds
//! exist: `egress` (the sandboxed code initiated an outbound contact),
//! `request` (an invocation arrived at the runtime), and `response` (the
//! runtime answered an invocation). Every kind carries the same base fields
//! in the same position: `kind`, `sequence`, `functionId`, `invocationId`,
//! `timestamp`, followed by the kind-specific fields.
//!
//! # Canonical form
//!
//! Signatures are computed over [`canonical_bytes`]: the compact JSON
//! serialization of the *unsigned* entry, with fields in declared order and
//! the `kind` tag first. The field order is a wire contract - the verifier
//! reproduces these exact bytes from a deserialized entry, so any two
//! implementations must serialize identically. Do not reorder fields.
//!
//! A [`SignedLogEntry`] is the persisted and served form: the same object
//! with a trailing base64 `signature`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The application protocol of an egress attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP, forwarded and observable.
    Http,
    /// HTTPS via `CONNECT` tunnel; the proxy is blind to the stream.
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Https => f.write_str("https"),
        }
    }
}

/// A single audit record, tagged by `kind` on the wire.
///
/// Field order within each variant is load-bearing: it defines the
/// canonical signable serialization (see module docs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    /// Outbound network contact initiated by sandboxed code.
    #[serde(rename_all = "camelCase")]
    Egress {
        /// Position in the per-function chain, starting at 1.
        sequence: u64,
        /// The logical log stream this entry belongs to.
        function_id: String,
        /// Correlates all entries of one logical execution.
        invocation_id: String,
        /// Taken inside the sequencing critical section, so timestamps are
        /// non-decreasing by sequence.
        timestamp: DateTime<Utc>,
        /// HTTP method, or `CONNECT` for tunneled HTTPS.
        method: String,
        /// Target host as requested by the client.
        host: String,
        /// Target port (80 and 443 defaults applied by the proxy).
        port: u16,
        /// Path and query for plain HTTP; `/` for tunnels.
        path: String,
        /// Whether the contact was forwarded or tunneled.
        protocol: Protocol,
    },

    /// Inbound invocation request, recorded before user code runs.
    #[serde(rename_all = "camelCase")]
    Request {
        /// Position in the per-function chain, starting at 1.
        sequence: u64,
        /// The logical log stream this entry belongs to.
        function_id: String,
        /// Correlates all entries of one logical execution.
        invocation_id: String,
        /// Taken inside the sequencing critical section.
        timestamp: DateTime<Utc>,
        /// HTTP method of the inbound request.
        method: String,
        /// Request path.
        path: String,
        /// Source address of the caller.
        source_ip: String,
        /// Caller identity, when the control plane authenticated one.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Size of the raw request body in bytes.
        request_size: u64,
        /// Hex SHA-256 of the raw request body.
        request_hash: String,
    },

    /// Outbound invocation response, recorded just before flush.
    #[serde(rename_all = "camelCase")]
    Response {
        /// Position in the per-function chain, starting at 1.
        sequence: u64,
        /// The logical log stream this entry belongs to.
        function_id: String,
        /// Correlates all entries of one logical execution.
        invocation_id: String,
        /// Taken inside the sequencing critical section.
        timestamp: DateTime<Utc>,
        /// Sequence of the `request` entry this response answers.
        request_seq: u64,
        /// Final HTTP status sent to the caller.
        status: u16,
        /// Size of the response body in bytes.
        response_size: u64,
        /// Hex SHA-256 of the response body.
        response_hash: String,
        /// Wall-clock handling time in milliseconds.
        duration_ms: u64,
    },
}

impl LogEntry {
    /// Returns the entry's position in its chain.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Egress { sequence, .. }
            | Self::Request { sequence, .. }
            | Self::Response { sequence, .. } => *sequence,
        }
    }

    /// Returns the log stream this entry belongs to.
    #[must_use]
    pub fn function_id(&self) -> &str {
        match self {
            Self::Egress { function_id, .. }
            | Self::Request { function_id, .. }
            | Self::Response { function_id, .. } => function_id,
        }
    }

    /// Returns the invocation this entry is correlated with.
    #[must_use]
    pub fn invocation_id(&self) -> &str {
        match self {
            Self::Egress { invocation_id, .. }
            | Self::Request { invocation_id, .. }
            | Self::Response { invocation_id, .. } => invocation_id,
        }
    }

    /// Returns the entry timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Egress { timestamp, .. }
            | Self::Request { timestamp, .. }
            | Self::Response { timestamp, .. } => *timestamp,
        }
    }

    /// Returns the wire name of the entry kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Egress { .. } => "egress",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
        }
    }
}

/// An entry plus the signature over its canonical bytes.
///
/// On the wire this flattens to one object: base fields, variant fields,
/// then `signature`. Immutable once appended to a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedLogEntry {
    /// The signed entry.
    #[serde(flatten)]
    pub entry: LogEntry,

    /// Base64 RSASSA-PKCS1-v1_5/SHA-256 signature over
    /// [`canonical_bytes`] of `entry`.
    pub signature: String,
}

/// Computes the canonical signable bytes of an entry.
///
/// This is the compact JSON serialization of the unsigned entry with the
/// `kind` tag first and all fields in declared order. Both signing and
/// verification go through this function; the two must never diverge.
///
/// # Panics
///
/// Panics if serialization fails, which cannot happen for the well-formed
/// [`LogEntry`] type.
#[must_use]
pub fn canonical_bytes(entry: &LogEntry) -> Vec<u8> {
    serde_json::to_vec(entry).expect("log entries always serialize to JSON")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn egress_fixture() -> LogEntry {
        LogEntry::Egress {
            sequence: 1,
            function_id: "fn-1".to_string(),
            invocation_id: "inv-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            method: "GET".to_string(),
            host: "api.example.com".to_string(),
            port: 80,
            path: "/v1/data".to_string(),
            protocol: Protocol::Http,
        }
    }

    #[test]
    fn canonical_bytes_field_order_is_stable() {
        let entry = egress_fixture();
        let json = String::from_utf8(canonical_bytes(&entry)).unwrap();

        assert_eq!(
            json,
            concat!(
                r#"{"kind":"egress","sequence":1,"functionId":"fn-1","#,
                r#""invocationId":"inv-1","timestamp":"2025-06-01T12:00:00Z","#,
                r#""method":"GET","host":"api.example.com","port":80,"#,
                r#""path":"/v1/data","protocol":"http"}"#
            )
        );
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let entry = egress_fixture();
        assert_eq!(canonical_bytes(&entry), canonical_bytes(&entry));
    }

    #[test]
    fn signed_entry_round_trips_through_wire_form() {
        let signed = SignedLogEntry {
            entry: egress_fixture(),
            signature: "c2lnbmF0dXJl".to_string(),
        };

        let wire = serde_json::to_string(&signed).unwrap();
        let back: SignedLogEntry = serde_json::from_str(&wire).unwrap();

        assert_eq!(back, signed);
        // Signature trails the entry fields in the wire form.
        assert!(wire.ends_with(r#""signature":"c2lnbmF0dXJl"}"#));
    }

    #[test]
    fn request_entry_omits_absent_client_id() {
        let entry = LogEntry::Request {
            sequence: 3,
            function_id: "runtime-server".to_string(),
            invocation_id: "inv-2".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap(),
            method: "POST".to_string(),
            path: "/invoke".to_string(),
            source_ip: "203.0.113.9".to_string(),
            client_id: None,
            request_size: 42,
            request_hash: "ab".repeat(32),
        };

        let json = String::from_utf8(canonical_bytes(&entry)).unwrap();
        assert!(!json.contains("clientId"));

        let back: LogEntry = serde_json::from_slice(&canonical_bytes(&entry)).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn response_entry_serializes_back_reference() {
        let entry = LogEntry::Response {
            sequence: 4,
            function_id: "runtime-server".to_string(),
            invocation_id: "inv-2".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 2).unwrap(),
            request_seq: 3,
            status: 200,
            response_size: 11,
            response_hash: "cd".repeat(32),
            duration_ms: 57,
        };

        let json = String::from_utf8(canonical_bytes(&entry)).unwrap();
        assert!(json.contains(r#""requestSeq":3"#));
        assert!(json.contains(r#""durationMs":57"#));
    }
}
