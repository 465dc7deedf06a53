//! Pluggable cryptographic primitives.
//!
//! Everything above the drivers talks to an abstract [`CryptoProvider`]:
//! SHA-256 hashing (one-shot and incremental), ed25519 keypair generation,
//! deterministic signing and verification. The active provider is a
//! process-wide setting, but callers snapshot an [`Arc`] reference per
//! operation so a hot swap can never split a single ingest between two
//! implementations.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// A raw ed25519 keypair as produced by a [`CryptoProvider`].
#[derive(Clone)]
pub struct KeypairBytes {
    /// The 32-byte public key.
    pub public: [u8; 32],
    /// The 32-byte secret key.
    pub secret: [u8; 32],
}

impl fmt::Debug for KeypairBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never log secrets
        f.debug_struct("KeypairBytes")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// An incremental SHA-256 hasher, used to verify attachments while streaming.
pub trait UpdatableHash: Send {
    /// Feed a chunk of bytes into the hash.
    fn update(&mut self, chunk: &[u8]);
    /// Consume the hasher and return the digest.
    fn finish(self: Box<Self>) -> [u8; 32];
}

/// The cryptographic operations the rest of the system depends on.
///
/// Implementations must be deterministic in `sign` and must never panic in
/// `verify`; malformed input verifies as `false`.
pub trait CryptoProvider: fmt::Debug + Send + Sync {
    /// Hash `bytes` with SHA-256.
    fn sha256(&self, bytes: &[u8]) -> [u8; 32];

    /// Create an incremental SHA-256 hasher.
    fn updatable_sha256(&self) -> Box<dyn UpdatableHash>;

    /// Generate a fresh ed25519 keypair.
    fn generate_keypair(&self) -> KeypairBytes;

    /// Sign `msg` with an ed25519 secret key. Signing is deterministic:
    /// the same key and message always produce the same signature.
    fn sign(&self, secret: &[u8; 32], msg: &[u8]) -> [u8; 64];

    /// Verify an ed25519 signature. Malformed keys or signatures return
    /// `false`, never an error.
    fn verify(&self, public: &[u8; 32], sig: &[u8], msg: &[u8]) -> bool;
}

/// [`CryptoProvider`] backed by [`ed25519_dalek`] and [`sha2`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCrypto;

struct Sha256Hasher(Sha256);

impl UpdatableHash for Sha256Hasher {
    fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    fn finish(self: Box<Self>) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl CryptoProvider for RustCrypto {
    fn sha256(&self, bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    fn updatable_sha256(&self) -> Box<dyn UpdatableHash> {
        Box::new(Sha256Hasher(Sha256::new()))
    }

    fn generate_keypair(&self) -> KeypairBytes {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        KeypairBytes {
            public: signing_key.verifying_key().to_bytes(),
            secret: signing_key.to_bytes(),
        }
    }

    fn sign(&self, secret: &[u8; 32], msg: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(secret);
        signing_key.sign(msg).to_bytes()
    }

    fn verify(&self, public: &[u8; 32], sig: &[u8], msg: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public) else {
            return false;
        };
        let Ok(sig) = <&[u8; 64]>::try_from(sig) else {
            return false;
        };
        verifying_key
            .verify_strict(msg, &Signature::from_bytes(sig))
            .is_ok()
    }
}

static DEFAULT_CRYPTO: RwLock<Option<Arc<dyn CryptoProvider>>> = RwLock::new(None);

/// Snapshot the process-wide default [`CryptoProvider`].
///
/// The returned reference stays valid for the whole operation even if the
/// default is swapped concurrently.
pub fn default_crypto() -> Arc<dyn CryptoProvider> {
    if let Some(crypto) = DEFAULT_CRYPTO.read().as_ref() {
        return Arc::clone(crypto);
    }
    let mut guard = DEFAULT_CRYPTO.write();
    Arc::clone(guard.get_or_insert_with(|| Arc::new(RustCrypto)))
}

/// Replace the process-wide default [`CryptoProvider`].
///
/// Operations already running keep the provider they snapshotted.
pub fn set_default_crypto(crypto: Arc<dyn CryptoProvider>) {
    *DEFAULT_CRYPTO.write() = Some(crypto);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_verifies() {
        let crypto = RustCrypto;
        let kp = crypto.generate_keypair();
        let sig_a = crypto.sign(&kp.secret, b"aaa");
        let sig_b = crypto.sign(&kp.secret, b"aaa");
        assert_eq!(sig_a, sig_b);
        assert!(crypto.verify(&kp.public, &sig_a, b"aaa"));
        assert!(!crypto.verify(&kp.public, &sig_a, b"aab"));
    }

    #[test]
    fn verify_never_panics_on_garbage() {
        let crypto = RustCrypto;
        let kp = crypto.generate_keypair();
        assert!(!crypto.verify(&kp.public, b"garbage", b"abc"));
        assert!(!crypto.verify(&[0xff; 32], &[0u8; 64], b"abc"));
    }

    #[test]
    fn updatable_hash_matches_one_shot() {
        let crypto = RustCrypto;
        let mut hasher = crypto.updatable_sha256();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), crypto.sha256(b"hello world"));
    }
}
