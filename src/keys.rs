//! Author and share keypairs.
//!
//! An author is an ed25519 keypair whose public key is embedded in a
//! human-readable address like `@suzy.b7f3…`. A share keypair names a
//! replication group the same way, with a `+name.b…` address. Secrets are
//! carried as `b`-prefixed base32 strings so they can live in config files
//! next to the addresses they belong to.

use serde::{Deserialize, Serialize};

use crate::address::{parse_author_address, parse_share_address};
use crate::crypto::CryptoProvider;
use crate::error::ValidationError;

/// Utilities for `b`-prefixed base32 strings (RFC 4648 lowercase, no padding).
pub(crate) mod base32 {
    use crate::error::ValidationError;

    /// Encode bytes, with the leading `b` marker.
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        format!("b{text}")
    }

    /// Decode a `b`-prefixed base32 string.
    pub fn decode(input: &str) -> Result<Vec<u8>, ValidationError> {
        let b32 = input
            .strip_prefix('b')
            .ok_or_else(|| ValidationError::new("base32 string must start with 'b'"))?;
        data_encoding::BASE32_NOPAD
            .decode(b32.to_ascii_uppercase().as_bytes())
            .map_err(|err| ValidationError::new(format!("invalid base32 string: {err}")))
    }

    /// Decode a `b`-prefixed base32 string into a fixed-size array.
    pub fn decode_array<const N: usize>(input: &str) -> Result<[u8; N], ValidationError> {
        decode(input)?
            .try_into()
            .map_err(|_| ValidationError::new("invalid base32 string: wrong byte length"))
    }
}

/// An author identity: address plus secret key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorKeypair {
    /// The author address, `@shortname.b<pubkey>`.
    pub address: String,
    /// The secret key, `b`-prefixed base32.
    pub secret: String,
}

impl std::fmt::Debug for AuthorKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log secrets
        write!(f, "AuthorKeypair({})", self.address)
    }
}

impl AuthorKeypair {
    /// Generate a fresh author keypair with the given 4-letter shortname.
    pub fn generate(
        crypto: &dyn CryptoProvider,
        shortname: &str,
    ) -> Result<Self, ValidationError> {
        let kp = crypto.generate_keypair();
        let address = format!("@{shortname}.{}", base32::encode(kp.public));
        // reject bad shortnames via the address validator
        parse_author_address(&address)?;
        Ok(AuthorKeypair {
            address,
            secret: base32::encode(kp.secret),
        })
    }

    /// The shortname part of the address.
    pub fn shortname(&self) -> &str {
        self.address.get(1..5).unwrap_or_default()
    }

    /// The 32 secret key bytes.
    pub fn secret_bytes(&self) -> Result<[u8; 32], ValidationError> {
        base32::decode_array(&self.secret)
    }

    /// The 32 public key bytes, decoded from the address.
    pub fn public_bytes(&self) -> Result<[u8; 32], ValidationError> {
        author_pubkey_bytes(&self.address)
    }

    /// Check that the secret actually belongs to the address by signing and
    /// verifying a probe message.
    pub fn validate(&self, crypto: &dyn CryptoProvider) -> Result<(), ValidationError> {
        let sig = crypto.sign(&self.secret_bytes()?, b"keypair check");
        if crypto.verify(&self.public_bytes()?, &sig, b"keypair check") {
            Ok(())
        } else {
            Err(ValidationError::new(
                "keypair secret does not match the address",
            ))
        }
    }
}

/// A share identity: address plus secret key.
///
/// Only the address is needed to hold a replica; the secret exists so that
/// shares can be minted and invitations issued.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareKeypair {
    /// The share address, `+name.b<pubkey>`.
    pub address: String,
    /// The secret key, `b`-prefixed base32.
    pub secret: String,
}

impl std::fmt::Debug for ShareKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShareKeypair({})", self.address)
    }
}

impl ShareKeypair {
    /// Generate a fresh share keypair with the given name.
    pub fn generate(crypto: &dyn CryptoProvider, name: &str) -> Result<Self, ValidationError> {
        let kp = crypto.generate_keypair();
        let address = format!("+{name}.{}", base32::encode(kp.public));
        parse_share_address(&address)?;
        Ok(ShareKeypair {
            address,
            secret: base32::encode(kp.secret),
        })
    }
}

/// Decode the public key bytes embedded in an author address.
pub fn author_pubkey_bytes(address: &str) -> Result<[u8; 32], ValidationError> {
    let parsed = parse_author_address(address)?;
    base32::decode_array(&parsed.pubkey)
}
