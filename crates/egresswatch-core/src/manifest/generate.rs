//! Manifest generation from a build directory.
//!
//! Walks the tree without following symlinks (and refusing any it meets),
//! hashes every regular file with streaming SHA-256, applies the
//! include/exclude patterns, and assembles a [`ClientManifest`] with a
//! fresh UUID, sorted file list, bundle hash, and build metadata.

use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use walkdir::WalkDir;

use super::{
    BuildInfo, ClientManifest, ManifestError, ManifestFile, SdkVerification, compute_bundle_hash,
};

/// Content marker identifying the transparent client SDK.
const SDK_MARKER: &str = "egresswatch-transparent-sdk";

/// Streaming read buffer size.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Options controlling manifest generation.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Logical client name.
    pub name: String,
    /// Client type, e.g. `web`.
    pub client_type: String,
    /// Client version string.
    pub version: String,
    /// Include patterns on relative paths; empty means include all.
    pub include: Vec<String>,
    /// Exclude patterns on relative paths; applied after includes.
    pub exclude: Vec<String>,
    /// Domains the client is declared to contact.
    pub allowed_egress: Vec<String>,
    /// Optional source reference recorded in the manifest.
    pub source: Option<String>,
}

/// Generates a manifest for the files under `dir`.
///
/// # Errors
///
/// Returns an error when the walk meets a symlink, a file cannot be read,
/// or a path cannot be made bundle-relative.
pub fn generate_manifest(
    dir: &Path,
    options: &GenerateOptions,
) -> Result<ClientManifest, ManifestError> {
    let mut files = Vec::new();
    let mut sdk_verification = None;

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| ManifestError::Io {
            path: e
                .path()
                .map_or_else(|| dir.display().to_string(), |p| p.display().to_string()),
            source: e.into(),
        })?;

        if entry.path_is_symlink() {
            return Err(ManifestError::Symlink(entry.path().display().to_string()));
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|_| ManifestError::PathEscape(entry.path().display().to_string()))?;
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !matches_patterns(&path, &options.include, &options.exclude) {
            continue;
        }

        let (hash, size) = hash_file(entry.path())?;

        if sdk_verification.is_none() {
            sdk_verification = detect_sdk(entry.path(), &path, &hash, size);
        }

        files.push(ManifestFile {
            mime_type: mime_type_for(&path).map(str::to_string),
            path,
            hash,
            size,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    let bundle_hash = compute_bundle_hash(&files);

    Ok(ClientManifest {
        manifest_id: Uuid::new_v4().to_string(),
        name: options.name.clone(),
        client_type: options.client_type.clone(),
        version: options.version.clone(),
        files,
        bundle_hash,
        build: build_info(),
        source: options.source.clone(),
        allowed_egress: options.allowed_egress.clone(),
        sdk_verification,
        api_surface: None,
    })
}

/// Hashes a regular file with streaming SHA-256, returning `(hex, size)`.
fn hash_file(path: &Path) -> Result<(String, u64), ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

fn build_info() -> BuildInfo {
    BuildInfo {
        timestamp: Utc::now(),
        commit: std::env::var("GIT_COMMIT").ok().filter(|v| !v.is_empty()),
        branch: std::env::var("GIT_BRANCH").ok().filter(|v| !v.is_empty()),
        ci: std::env::var("CI").is_ok_and(|v| !v.is_empty()),
    }
}

/// Checks a text file for the transparent-SDK content marker.
///
/// The marker line has the form `egresswatch-transparent-sdk v<version>`;
/// binary or unreadable files are simply not the SDK.
fn detect_sdk(path: &Path, relative: &str, hash: &str, size: u64) -> Option<SdkVerification> {
    // The SDK is a small script; skip anything implausibly large.
    if size > 1024 * 1024 {
        return None;
    }
    let content = fs::read_to_string(path).ok()?;
    let marker_at = content.find(SDK_MARKER)?;

    let after_marker = &content[marker_at + SDK_MARKER.len()..];
    let version = after_marker
        .split_whitespace()
        .next()
        .and_then(|tok| tok.strip_prefix('v'))
        .unwrap_or("unknown")
        .to_string();

    Some(SdkVerification {
        sdk_id: SDK_MARKER.to_string(),
        sdk_version: version,
        sdk_hash: hash.to_string(),
        sdk_path: relative.to_string(),
    })
}

/// Pattern filter: empty include list admits everything; any matching
/// exclude wins over an include.
fn matches_patterns(path: &str, include: &[String], exclude: &[String]) -> bool {
    if exclude.iter().any(|p| wildcard_match(p, path)) {
        return false;
    }
    include.is_empty() || include.iter().any(|p| wildcard_match(p, path))
}

/// Minimal `*`-wildcard matcher over relative paths.
///
/// `*` matches any run of characters, including `/`. Enough for patterns
/// like `*.map` or `vendor/*`; anchored at both ends.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(c) => t.first() == Some(c) && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Maps well-known web bundle extensions to mime types.
fn mime_type_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?;
    let mime = match ext {
        "js" | "mjs" => "text/javascript",
        "css" => "text/css",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "map" => "application/json",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(mime)
}
