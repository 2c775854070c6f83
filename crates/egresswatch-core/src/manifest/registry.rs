//! In-process manifest registry with version chaining.
//!
//! The registry keeps signed manifests by id plus three secondary views:
//! bundle hash → id, name → latest id, and the upgrade relation
//! `manifestId → previousManifestId`. The relation is stored as its own
//! map - not as a pointer inside the manifest - and is resolved at
//! chain-walk time, so a broken or cyclic relation can never corrupt a
//! stored manifest.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::SignedManifest;
use super::signing::verify_manifest;

/// Errors from registry mutations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The submitted manifest failed verification.
    #[error("invalid manifest: {}", reasons.join("; "))]
    Invalid {
        /// The verification errors.
        reasons: Vec<String>,
    },

    /// A manifest with this id is already registered.
    #[error("manifest already registered: {0}")]
    Duplicate(String),

    /// No manifest with this id exists.
    #[error("manifest not found: {0}")]
    NotFound(String),
}

/// Result of a quick bundle-hash trust check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleTrust {
    /// True when a registered, correctly signed manifest covers the hash
    /// (and its signer is listed, when a trust list was supplied).
    pub trusted: bool,
    /// The covering manifest, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_id: Option<String>,
    /// Why trust was denied, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Registry state: by-id manifests plus lookup and chain views.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    by_id: HashMap<String, SignedManifest>,
    by_bundle_hash: HashMap<String, String>,
    latest_by_name: HashMap<String, String>,
    previous: HashMap<String, String>,
}

impl ManifestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a signed manifest after verifying it.
    ///
    /// The upgrade chain is inferred here: whatever manifest is currently
    /// `latest` for the name becomes the new manifest's predecessor. When
    /// `set_latest` is true the name's latest pointer moves to the new
    /// manifest.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Invalid`] when verification fails,
    /// [`RegistryError::Duplicate`] when the id is already present.
    pub fn register(
        &mut self,
        signed: SignedManifest,
        set_latest: bool,
    ) -> Result<(), RegistryError> {
        let verification = verify_manifest(&signed, None, None);
        if !verification.valid {
            return Err(RegistryError::Invalid {
                reasons: verification.errors,
            });
        }

        let id = signed.manifest.manifest_id.clone();
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        let name = signed.manifest.name.clone();
        if let Some(previous_latest) = self.latest_by_name.get(&name) {
            self.previous.insert(id.clone(), previous_latest.clone());
        }
        if set_latest {
            self.latest_by_name.insert(name.clone(), id.clone());
        }

        self.by_bundle_hash
            .insert(signed.manifest.bundle_hash.clone(), id.clone());
        info!(manifest_id = %id, name = %name, set_latest, "registered manifest");
        self.by_id.insert(id, signed);
        Ok(())
    }

    /// Fetches a manifest by id.
    #[must_use]
    pub fn get(&self, manifest_id: &str) -> Option<&SignedManifest> {
        self.by_id.get(manifest_id)
    }

    /// Lists all registered manifests, ordered by id for stable output.
    #[must_use]
    pub fn list(&self) -> Vec<&SignedManifest> {
        let mut all: Vec<&SignedManifest> = self.by_id.values().collect();
        all.sort_by(|a, b| a.manifest.manifest_id.cmp(&b.manifest.manifest_id));
        all
    }

    /// Removes a manifest, cleaning up the secondary views.
    ///
    /// A latest pointer at the removed manifest falls back to its
    /// predecessor when one exists. The predecessor relation of *other*
    /// manifests is left intact; chain walks skip missing links.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the id is unknown.
    pub fn remove(&mut self, manifest_id: &str) -> Result<SignedManifest, RegistryError> {
        let signed = self
            .by_id
            .remove(manifest_id)
            .ok_or_else(|| RegistryError::NotFound(manifest_id.to_string()))?;

        if self
            .by_bundle_hash
            .get(&signed.manifest.bundle_hash)
            .is_some_and(|id| id == manifest_id)
        {
            self.by_bundle_hash.remove(&signed.manifest.bundle_hash);
        }

        let name = &signed.manifest.name;
        if self
            .latest_by_name
            .get(name)
            .is_some_and(|id| id == manifest_id)
        {
            match self.previous.get(manifest_id) {
                Some(prev) if self.by_id.contains_key(prev) => {
                    self.latest_by_name.insert(name.clone(), prev.clone());
                },
                _ => {
                    self.latest_by_name.remove(name);
                },
            }
        }
        self.previous.remove(manifest_id);

        Ok(signed)
    }

    /// Looks up a manifest by its bundle hash.
    #[must_use]
    pub fn by_bundle_hash(&self, bundle_hash: &str) -> Option<&SignedManifest> {
        self.by_bundle_hash
            .get(bundle_hash)
            .and_then(|id| self.by_id.get(id))
    }

    /// Returns the latest manifest for a client name.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<&SignedManifest> {
        self.latest_by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
    }

    /// Walks the upgrade chain starting at `manifest_id`.
    ///
    /// Returns the ids from the starting manifest back through its
    /// predecessors. Cycle-safe: a repeated id terminates the walk.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] when the starting id is unknown.
    pub fn chain(&self, manifest_id: &str) -> Result<Vec<String>, RegistryError> {
        if !self.by_id.contains_key(manifest_id) {
            return Err(RegistryError::NotFound(manifest_id.to_string()));
        }

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(manifest_id.to_string());

        while let Some(id) = current {
            if !seen.insert(id.clone()) {
                break;
            }
            current = self.previous.get(&id).cloned();
            chain.push(id);
        }

        Ok(chain)
    }

    /// Quick trust check for a bundle hash.
    ///
    /// The hash is trusted when a registered manifest covers it, that
    /// manifest still verifies, and - when `trusted_fingerprints` is
    /// supplied - its signer's fingerprint is on the list.
    #[must_use]
    pub fn verify_bundle_hash(
        &self,
        bundle_hash: &str,
        trusted_fingerprints: Option<&[String]>,
    ) -> BundleTrust {
        let Some(signed) = self.by_bundle_hash(bundle_hash) else {
            return BundleTrust {
                trusted: false,
                manifest_id: None,
                reason: Some("no manifest registered for bundle hash".to_string()),
            };
        };

        let manifest_id = signed.manifest.manifest_id.clone();

        let verification = verify_manifest(signed, None, None);
        if !verification.valid {
            return BundleTrust {
                trusted: false,
                manifest_id: Some(manifest_id),
                reason: Some("registered manifest no longer verifies".to_string()),
            };
        }

        if let Some(fingerprints) = trusted_fingerprints {
            if !fingerprints.contains(&signed.key_fingerprint) {
                return BundleTrust {
                    trusted: false,
                    manifest_id: Some(manifest_id),
                    reason: Some("signer fingerprint is not trusted".to_string()),
                };
            }
        }

        BundleTrust {
            trusted: true,
            manifest_id: Some(manifest_id),
            reason: None,
        }
    }
}
