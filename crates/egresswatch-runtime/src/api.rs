//! HTTP surface for the manifest registry.
//!
//! JSON over axum. The router owns no policy beyond status mapping: the
//! registry and the manifest verifier do the real work, and invalid
//! submissions come back as `400` with the verifier's reasons.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use egresswatch_core::manifest::registry::{BundleTrust, ManifestRegistry, RegistryError};
use egresswatch_core::manifest::signing::{ManifestVerification, verify_manifest};
use egresswatch_core::manifest::SignedManifest;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Maximum request body size (manifests list every bundled file).
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared handle to the registry behind the API.
pub type SharedRegistry = Arc<RwLock<ManifestRegistry>>;

/// Builds the manifest registry router.
#[must_use]
pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/api/manifests", post(register).get(list))
        .route("/api/manifests/verify", post(verify))
        .route("/api/manifests/check-hash", post(check_hash))
        .route("/api/manifests/by-hash/{bundle_hash}", get(by_hash))
        .route("/api/manifests/latest/{name}", get(latest))
        .route("/api/manifests/chain/{id}", get(chain))
        .route("/api/manifests/{id}", get(fetch).delete(remove))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(registry)
}

/// Error payload for failed requests.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
}

/// Body of `POST /api/manifests`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    signed_manifest: SignedManifest,
    #[serde(default)]
    set_latest: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    manifest_id: String,
}

async fn register(
    State(registry): State<SharedRegistry>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), (StatusCode, Json<ErrorBody>)> {
    let manifest_id = request.signed_manifest.manifest.manifest_id.clone();
    let set_latest = request.set_latest.unwrap_or(true);

    let mut registry = registry.write().await;
    match registry.register(request.signed_manifest, set_latest) {
        Ok(()) => Ok((StatusCode::CREATED, Json(RegisterResponse { manifest_id }))),
        Err(e @ RegistryError::Invalid { .. }) => {
            Err(error_response(StatusCode::BAD_REQUEST, e.to_string()))
        },
        Err(e @ RegistryError::Duplicate(_)) => {
            Err(error_response(StatusCode::CONFLICT, e.to_string()))
        },
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

/// One row of `GET /api/manifests`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSummary {
    manifest_id: String,
    name: String,
    client_type: String,
    version: String,
    bundle_hash: String,
    key_fingerprint: String,
    signed_at: DateTime<Utc>,
}

impl From<&SignedManifest> for ManifestSummary {
    fn from(signed: &SignedManifest) -> Self {
        Self {
            manifest_id: signed.manifest.manifest_id.clone(),
            name: signed.manifest.name.clone(),
            client_type: signed.manifest.client_type.clone(),
            version: signed.manifest.version.clone(),
            bundle_hash: signed.manifest.bundle_hash.clone(),
            key_fingerprint: signed.key_fingerprint.clone(),
            signed_at: signed.signed_at,
        }
    }
}

async fn list(State(registry): State<SharedRegistry>) -> Json<Vec<ManifestSummary>> {
    let registry = registry.read().await;
    Json(registry.list().into_iter().map(ManifestSummary::from).collect())
}

async fn fetch(
    State(registry): State<SharedRegistry>,
    Path(id): Path<String>,
) -> Result<Json<SignedManifest>, (StatusCode, Json<ErrorBody>)> {
    let registry = registry.read().await;
    registry
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, format!("manifest not found: {id}")))
}

async fn remove(
    State(registry): State<SharedRegistry>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut registry = registry.write().await;
    match registry.remove(&id) {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(error_response(StatusCode::NOT_FOUND, e.to_string())),
    }
}

/// Body of `POST /api/manifests/verify`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    signed_manifest: SignedManifest,
    /// Verify against this key instead of the embedded one.
    #[serde(default)]
    trusted_public_key: Option<String>,
}

async fn verify(Json(request): Json<VerifyRequest>) -> Json<ManifestVerification> {
    Json(verify_manifest(
        &request.signed_manifest,
        request.trusted_public_key.as_deref(),
        None,
    ))
}

async fn by_hash(
    State(registry): State<SharedRegistry>,
    Path(bundle_hash): Path<String>,
) -> Result<Json<SignedManifest>, (StatusCode, Json<ErrorBody>)> {
    let registry = registry.read().await;
    registry
        .by_bundle_hash(&bundle_hash)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                format!("no manifest for bundle hash: {bundle_hash}"),
            )
        })
}

async fn latest(
    State(registry): State<SharedRegistry>,
    Path(name): Path<String>,
) -> Result<Json<SignedManifest>, (StatusCode, Json<ErrorBody>)> {
    let registry = registry.read().await;
    registry.latest(&name).cloned().map(Json).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("no latest manifest for client: {name}"),
        )
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainResponse {
    manifest_ids: Vec<String>,
}

async fn chain(
    State(registry): State<SharedRegistry>,
    Path(id): Path<String>,
) -> Result<Json<ChainResponse>, (StatusCode, Json<ErrorBody>)> {
    let registry = registry.read().await;
    match registry.chain(&id) {
        Ok(manifest_ids) => Ok(Json(ChainResponse { manifest_ids })),
        Err(e) => Err(error_response(StatusCode::NOT_FOUND, e.to_string())),
    }
}

/// Body of `POST /api/manifests/check-hash`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckHashRequest {
    bundle_hash: String,
    #[serde(default)]
    trusted_fingerprints: Option<Vec<String>>,
}

async fn check_hash(
    State(registry): State<SharedRegistry>,
    Json(request): Json<CheckHashRequest>,
) -> Json<BundleTrust> {
    let registry = registry.read().await;
    Json(registry.verify_bundle_hash(
        &request.bundle_hash,
        request.trusted_fingerprints.as_deref(),
    ))
}
