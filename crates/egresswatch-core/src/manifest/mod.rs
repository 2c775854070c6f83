//! Client bundle manifests: content-addressed attestation of built files.
//!
//! A manifest is a Merkle-style summary of a build directory - one
//! `{path, hash, size, mimeType?}` record per file, sorted by path, plus a
//! `bundleHash` committing to the whole set. Signing wraps the manifest
//! with the signature, public key, and key fingerprint so a third party
//! can verify a served bundle byte-for-byte against what was attested.
//!
//! # Canonical form
//!
//! Manifests are signed over their canonical JSON: keys sorted
//! lexicographically at every nesting level, two-space indentation. Any
//! implementation producing the same manifest values produces the same
//! signable bytes.
//!
//! # Submodules
//!
//! - [`generate`]: walk a build directory into a manifest
//! - [`signing`]: sign and verify manifests
//! - [`registry`]: in-process registry with version chaining

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod generate;
pub mod registry;
pub mod signing;


pub use generate::{GenerateOptions, generate_manifest};
pub use registry::{BundleTrust, ManifestRegistry, RegistryError};
pub use signing::{ManifestVerification, sign_manifest, verify_manifest};

/// Errors from manifest generation and canonicalization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// Filesystem error while walking or hashing the bundle.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being processed when the error occurred.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The walk encountered a symlink, which manifests refuse to attest.
    #[error("refusing to include symlink in bundle: {0}")]
    Symlink(String),

    /// A path inside the bundle could not be made relative.
    #[error("path {0} escapes the bundle root")]
    PathEscape(String),

    /// Serialization failure while canonicalizing.
    #[error("canonicalization failed: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// One attested file inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Path relative to the bundle root, `/`-separated.
    pub path: String,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
    /// File size in bytes.
    pub size: u64,
    /// Mime type inferred from the extension, when recognized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Build provenance captured at generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    /// When the manifest was generated.
    pub timestamp: DateTime<Utc>,
    /// VCS commit, from `GIT_COMMIT` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// VCS branch, from `GIT_BRANCH` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Whether generation ran under a CI environment (`CI` set).
    pub ci: bool,
}

/// Record of a recognized transparent-SDK file inside the bundle.
///
/// An outer verifier uses this to assert that the client's network calls
/// all go through the controlled path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkVerification {
    /// Identifier of the recognized SDK.
    pub sdk_id: String,
    /// Version parsed from the SDK marker.
    pub sdk_version: String,
    /// Hex SHA-256 of the SDK file.
    pub sdk_hash: String,
    /// Bundle-relative path of the SDK file.
    pub sdk_path: String,
}

/// A content-addressed summary of one client bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientManifest {
    /// Unique manifest identifier (UUID).
    pub manifest_id: String,
    /// Logical client name; the registry chains versions by name.
    pub name: String,
    /// Client type, e.g. `web`, `cli`.
    pub client_type: String,
    /// Client version string.
    pub version: String,
    /// Attested files, sorted by path.
    pub files: Vec<ManifestFile>,
    /// SHA-256 over sorted `path:hash` lines (see [`compute_bundle_hash`]).
    pub bundle_hash: String,
    /// Build provenance.
    pub build: BuildInfo,
    /// Optional source reference (repository URL, tag).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Domains this client is declared to contact.
    pub allowed_egress: Vec<String>,
    /// Present when the bundle contains the recognized transparent SDK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_verification: Option<SdkVerification>,
    /// Optional declared API surface of the bundle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_surface: Option<Vec<String>>,
}

/// A manifest plus its signature envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    /// The signed manifest.
    pub manifest: ClientManifest,
    /// Base64 signature over [`canonical_json`] of the manifest.
    pub signature: String,
    /// SPKI PEM public key of the signer.
    pub public_key: String,
    /// Hex SHA-256 of `public_key`.
    pub key_fingerprint: String,
    /// When the signature was produced.
    pub signed_at: DateTime<Utc>,
}

/// Computes the bundle hash over files already sorted by path.
///
/// The hash commits to the lines `path:hash`, joined by `\n`, in path
/// order. This is the Merkle-style root a consumer recomputes from the
/// `files` list.
#[must_use]
pub fn compute_bundle_hash(files: &[ManifestFile]) -> String {
    let joined = files
        .iter()
        .map(|f| format!("{}:{}", f.path, f.hash))
        .collect::<Vec<_>>()
        .join("\n");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Serializes a manifest to its canonical signable form.
///
/// Keys are sorted lexicographically at every level and the output uses
/// two-space indentation. Byte-identical across implementations for equal
/// manifest values.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn canonical_json(manifest: &ClientManifest) -> Result<String, ManifestError> {
    let value = sort_keys(serde_json::to_value(manifest)?);
    Ok(serde_json::to_string_pretty(&value)?)
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, serde_json::Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        },
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        },
        other => other,
    }
}
