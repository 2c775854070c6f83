//! Deterministic RSA signing for audit entries and manifests.
//!
//! The signer holds an RSA-2048 keypair for the process lifetime and
//! produces RSASSA-PKCS1-v1_5 signatures over SHA-256 digests. PKCS#1 v1.5
//! padding is deterministic: the same (key, message) pair always yields the
//! same signature bytes, a property the verification tooling and the test
//! suite both depend on.
//!
//! Verification is a free function over a PEM public key so that offline
//! consumers can verify chains without constructing a `Signer`. It returns
//! a plain `bool` and deliberately reports nothing about *why* a signature
//! failed - parse errors, length mismatches, and key mismatches are all
//! just `false`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::{Digest, Sha256};
use rsa::signature::{SignatureEncoding, Signer as _, Verifier as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use zeroize::Zeroizing;

/// RSA modulus size for generated keys, in bits.
const KEY_BITS: usize = 2048;

/// Errors that can occur while creating or exporting a signer.
///
/// Signing itself never fails once a key exists.
#[derive(Debug, Error)]
pub enum SignerError {
    /// Key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(rsa::Error),

    /// A PEM document could not be parsed or encoded.
    #[error("invalid key material: {0}")]
    KeyMaterial(#[from] rsa::pkcs8::Error),

    /// The public half of the keypair could not be encoded.
    #[error("public key encoding failed: {0}")]
    PublicKeyEncoding(#[from] rsa::pkcs8::spki::Error),
}

/// Process-lifetime RSA-2048 signer.
///
/// Concurrent-safe: signing is pure over (key, message) and holds no
/// mutable state.
pub struct Signer {
    private_key: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
    public_key_pem: String,
}

impl Signer {
    /// Generates a fresh ephemeral RSA-2048 keypair from the OS RNG.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or public-key encoding fails.
    pub fn generate() -> Result<Self, SignerError> {
        let mut rng = rand::thread_rng();
        let private_key =
            RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(SignerError::KeyGeneration)?;
        Self::from_private_key(private_key)
    }

    /// Constructs a signer from an injected PKCS#8 PEM private key, for
    /// deployments where the key comes from enclave-sealed storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM document is not a valid RSA private key.
    pub fn from_private_key_pem(pem: &str) -> Result<Self, SignerError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, SignerError> {
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)?;
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());

        Ok(Self {
            private_key,
            signing_key,
            public_key_pem,
        })
    }

    /// Signs `data`, returning the base64 signature.
    ///
    /// Deterministic: identical input yields bitwise-identical output.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> String {
        let signature = self.signing_key.sign(data);
        BASE64.encode(signature.to_bytes())
    }

    /// Returns the SPKI PEM encoding of the public key.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Returns the hex SHA-256 fingerprint of the PEM-encoded public key.
    #[must_use]
    pub fn key_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.public_key_pem.as_bytes()))
    }

    /// Exports the private key as PKCS#8 PEM.
    ///
    /// Restricted operation: intended only for controlled key backup. The
    /// returned buffer zeroizes on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if PEM encoding fails.
    pub fn export_private_key_pem(&self) -> Result<Zeroizing<String>, SignerError> {
        Ok(self.private_key.to_pkcs8_pem(LineEnding::LF)?)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Signer")
            .field("fingerprint", &self.key_fingerprint())
            .finish_non_exhaustive()
    }
}

/// Verifies a base64 signature over `data` against a PEM public key.
///
/// Returns `false` for any failure - unparseable key, malformed base64,
/// wrong signature length, or plain mismatch - without distinguishing the
/// cause.
#[must_use]
pub fn verify_signature(public_key_pem: &str, data: &[u8], signature_b64: &str) -> bool {
    let Ok(public_key) = RsaPublicKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public_key)
        .verify(data, &signature)
        .is_ok()
}
