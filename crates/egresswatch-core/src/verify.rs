//! Offline integrity verification of signed log chains.
//!
//! Consumers retrieve a function's entries and the runtime's public key,
//! then check three things: every signature is valid over the recomputed
//! canonical bytes, the chain starts at sequence 1, and sequences are
//! contiguous. All findings accumulate - the verifier never stops at the
//! first problem, so a report can name a sequence gap *and* a forged entry
//! in the same pass.

use crate::entry::{SignedLogEntry, canonical_bytes};

/// Signature verification callback: `(public_key_pem, data, signature_b64)`.
///
/// Passed in rather than hard-wired so the verifier stays pure over its
/// inputs; production callers pass [`crate::signer::verify_signature`].
pub type VerifyFn<'a> = &'a (dyn Fn(&str, &[u8], &str) -> bool + Sync);

/// Outcome of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// True when no errors were found.
    pub valid: bool,
    /// Every problem found, in chain order.
    pub errors: Vec<String>,
}

/// Verifies an unordered collection of signed entries against a public key.
///
/// An empty collection is valid. Entries are sorted by sequence before
/// checking; the caller does not need to pre-sort.
#[must_use]
pub fn verify_log_integrity(
    entries: &[SignedLogEntry],
    public_key_pem: &str,
    verify: VerifyFn<'_>,
) -> IntegrityReport {
    if entries.is_empty() {
        return IntegrityReport {
            valid: true,
            errors: Vec::new(),
        };
    }

    let mut sorted: Vec<&SignedLogEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.entry.sequence());

    let mut errors = Vec::new();

    let first = sorted[0].entry.sequence();
    if first != 1 {
        errors.push(format!("Chain starts at sequence {first}, expected 1"));
    }

    let mut prev = None;
    for (i, entry) in sorted.iter().enumerate() {
        let expected = i as u64 + 1;
        let found = entry.entry.sequence();
        if found != expected {
            if prev == Some(found) {
                errors.push(format!("Duplicate sequence {found}"));
            } else {
                errors.push(format!("Sequence gap: expected {expected}, found {found}"));
            }
        }
        prev = Some(found);
    }

    for entry in &sorted {
        let bytes = canonical_bytes(&entry.entry);
        if !verify(public_key_pem, &bytes, &entry.signature) {
            errors.push(format!(
                "Invalid signature for sequence {}",
                entry.entry.sequence()
            ));
        }
    }

    IntegrityReport {
        valid: errors.is_empty(),
        errors,
    }
}
