//! Manifest signing and three-level verification.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ClientManifest, ManifestError, SignedManifest, canonical_json, compute_bundle_hash};
use crate::signer::{Signer, verify_signature};

/// Signs a manifest, producing the full signature envelope.
///
/// # Errors
///
/// Returns an error if the manifest cannot be canonicalized.
pub fn sign_manifest(
    manifest: ClientManifest,
    signer: &Signer,
) -> Result<SignedManifest, ManifestError> {
    let canonical = canonical_json(&manifest)?;
    let signature = signer.sign(canonical.as_bytes());

    Ok(SignedManifest {
        manifest,
        signature,
        public_key: signer.public_key_pem().to_string(),
        key_fingerprint: signer.key_fingerprint(),
        signed_at: Utc::now(),
    })
}

/// Outcome of verifying a signed manifest.
///
/// All checks run; nothing short-circuits, so a report can name a bad
/// signature and a mismatched file in the same pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestVerification {
    /// True when every executed check passed.
    pub valid: bool,
    /// Signature over the canonical manifest is valid.
    pub signature_valid: bool,
    /// `bundleHash` recomputed from `files` matches the stored value.
    pub bundle_hash_valid: bool,
    /// `keyFingerprint` matches the embedded public key.
    pub fingerprint_valid: bool,
    /// Every problem found.
    pub errors: Vec<String>,
}

/// Verifies a signed manifest.
///
/// Three levels: the signature (against `trusted_public_key_pem` when the
/// caller supplies one, otherwise the embedded key), the recomputed bundle
/// hash, and - when `file_contents` provides bytes for a path - each
/// file's stored hash. The key fingerprint is always recomputed from the
/// embedded public key.
#[must_use]
pub fn verify_manifest(
    signed: &SignedManifest,
    trusted_public_key_pem: Option<&str>,
    file_contents: Option<&HashMap<String, Vec<u8>>>,
) -> ManifestVerification {
    let mut errors = Vec::new();

    let verify_key = trusted_public_key_pem.unwrap_or(&signed.public_key);
    let signature_valid = match canonical_json(&signed.manifest) {
        Ok(canonical) => verify_signature(verify_key, canonical.as_bytes(), &signed.signature),
        Err(_) => false,
    };
    if !signature_valid {
        errors.push("Manifest signature is invalid".to_string());
    }

    let recomputed = compute_bundle_hash(&signed.manifest.files);
    let bundle_hash_valid = recomputed == signed.manifest.bundle_hash;
    if !bundle_hash_valid {
        errors.push(format!(
            "Bundle hash mismatch: stored {}, recomputed {}",
            signed.manifest.bundle_hash, recomputed
        ));
    }

    let expected_fingerprint = hex::encode(Sha256::digest(signed.public_key.as_bytes()));
    let fingerprint_valid = expected_fingerprint == signed.key_fingerprint;
    if !fingerprint_valid {
        errors.push("Key fingerprint does not match embedded public key".to_string());
    }

    if let Some(contents) = file_contents {
        for file in &signed.manifest.files {
            if let Some(bytes) = contents.get(&file.path) {
                let actual = hex::encode(Sha256::digest(bytes));
                if actual != file.hash {
                    errors.push(format!("File hash mismatch: {}", file.path));
                }
            }
        }
    }

    ManifestVerification {
        valid: errors.is_empty(),
        signature_valid,
        bundle_hash_valid,
        fingerprint_valid,
        errors,
    }
}
