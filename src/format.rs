//! Document formats: pluggable validator/signer pairs.
//!
//! A format owns one document schema: which fields are signed, how the
//! canonical hash is computed, what a wipe looks like. Formats are stateless
//! values; the built-in ones are unit structs usable as
//! `&'static dyn Format`.
//!
//! Two formats ship with the crate: [`es4::FormatEs4`] (text only) and
//! [`es5::FormatEs5`] (text plus one attachment per document).

use std::collections::BTreeMap;
use std::fmt;

use crate::address::{
    check_author_can_write_to_path, check_author_is_valid, check_path_is_valid,
    check_share_is_valid,
};
use crate::crypto::CryptoProvider;
use crate::document::{Document, Timestamp, FUTURE_CUTOFF, MAX_TIMESTAMP, MIN_TIMESTAMP};
use crate::error::ValidationError;
use crate::keys::{author_pubkey_bytes, base32, AuthorKeypair};

pub mod es4;
pub mod es5;

pub use es4::FormatEs4;
pub use es5::FormatEs5;

/// The text-only format.
pub static ES4: FormatEs4 = FormatEs4;
/// The attachment-capable format.
pub static ES5: FormatEs5 = FormatEs5;

/// The format used when callers do not name one.
pub static DEFAULT_FORMAT: &dyn Format = &ES5;

/// Look up a built-in format by its tag string.
pub fn format_by_tag(tag: &str) -> Option<&'static dyn Format> {
    match tag {
        "es.4" => Some(&ES4),
        "es.5" => Some(&ES5),
        _ => None,
    }
}

/// Size and hash of the attachment a document declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    /// Attachment size in bytes.
    pub size: u64,
    /// SHA-256 of the attachment bytes, `b`-prefixed base32.
    pub hash: String,
}

/// Input to [`Format::generate_document`].
#[derive(Debug)]
pub struct GenerateDocumentArgs<'a> {
    /// The keypair that signs the new document.
    pub keypair: &'a AuthorKeypair,
    /// The share the document belongs to.
    pub share: &'a str,
    /// The path to write at.
    pub path: String,
    /// The inline content.
    pub text: String,
    /// Claimed creation time.
    pub timestamp: Timestamp,
    /// Expiry deadline for ephemeral documents.
    pub delete_after: Option<Timestamp>,
}

/// Extra fields stripped off a document, keyed by their `_`-prefixed names.
pub type ExtraFields = BTreeMap<String, serde_json::Value>;

/// A validator and signer for one document schema.
///
/// All operations are pure: they read the document and the crypto provider
/// handed to them and never touch storage.
pub trait Format: fmt::Debug + Send + Sync {
    /// The tag string carried in `doc.format`, e.g. `"es.5"`.
    fn tag(&self) -> &'static str;

    /// Whether documents of this format can declare attachments.
    fn supports_attachments(&self) -> bool;

    /// Compute the canonical document hash: the signed fields, sorted by
    /// name, serialized as `<name>\t<value>\n`, hashed with SHA-256 and
    /// base32-encoded. `content`/`text` (represented by its hash) and
    /// `signature` are never part of the serialization; a fake but
    /// well-shaped signature is substituted for unsigned documents so the
    /// structural checks can run first.
    fn hash_document(
        &self,
        crypto: &dyn CryptoProvider,
        doc: &Document,
    ) -> Result<String, ValidationError>;

    /// Build and sign a fresh document from user input.
    fn generate_document(
        &self,
        crypto: &dyn CryptoProvider,
        args: GenerateDocumentArgs<'_>,
    ) -> Result<Document, ValidationError>;

    /// Hash and sign `doc`, returning a copy with the signature installed.
    fn sign_document(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        doc: Document,
    ) -> Result<Document, ValidationError>;

    /// Produce the empty-content replacement for `doc` at the same
    /// (path, author), with a slightly later timestamp, re-signed.
    /// Attachment-capable formats also clear the attachment descriptor.
    fn wipe_document(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        doc: &Document,
        now: Timestamp,
    ) -> Result<Document, ValidationError>;

    /// Strip fields outside the schema. Stripped fields are returned
    /// separately; fields whose names do not begin with `_` are a schema
    /// violation and fail instead.
    fn remove_extra_fields(
        &self,
        doc: Document,
    ) -> Result<(Document, ExtraFields), ValidationError>;

    /// Run the full validity check.
    ///
    /// Checks run cheapest-first: structure, timestamps, write permission,
    /// path shape, addresses, and only then the signature and the content
    /// hash, which cost real crypto.
    fn check_document_is_valid(
        &self,
        crypto: &dyn CryptoProvider,
        doc: &Document,
        now: Timestamp,
    ) -> Result<(), ValidationError>;

    /// The attachment this document declares, if any. Formats without
    /// attachment support always return an error.
    fn attachment_info(&self, doc: &Document) -> Result<Option<AttachmentInfo>, ValidationError>;

    /// Return a newly signed version of `doc` with the attachment descriptor
    /// filled in. Formats without attachment support always return an error.
    fn update_attachment_fields(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        doc: Document,
        size: u64,
        hash: &str,
    ) -> Result<Document, ValidationError>;
}

/// A well-shaped stand-in signature: 64 zero bytes, base32.
pub(crate) fn fake_signature() -> String {
    base32::encode([0u8; 64])
}

/// Serialize pre-sorted `(name, value)` pairs into the canonical
/// tab-and-newline form and hash them. `None` values are omitted.
pub(crate) fn hash_canonical_fields(
    crypto: &dyn CryptoProvider,
    fields: &[(&str, Option<String>)],
) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        if let Some(value) = value {
            out.push_str(name);
            out.push('\t');
            out.push_str(value);
            out.push('\n');
        }
    }
    base32::encode(crypto.sha256(out.as_bytes()))
}

/// Check that `value` looks like a `b`-prefixed base32 string.
pub(crate) fn check_b32_shape(value: &str, what: &str) -> Result<(), ValidationError> {
    if !value.starts_with('b') {
        return Err(ValidationError::new(format!(
            "{what} must be a base32 string starting with 'b'"
        )));
    }
    if !value[1..]
        .chars()
        .all(|c| crate::address::ALPHA_BASE32.contains(c))
    {
        return Err(ValidationError::new(format!(
            "{what} contains non-base32 characters"
        )));
    }
    Ok(())
}

/// Timestamp and ephemerality rules shared by all formats.
pub(crate) fn check_timestamps(doc: &Document, now: Timestamp) -> Result<(), ValidationError> {
    if doc.timestamp < MIN_TIMESTAMP || doc.timestamp > MAX_TIMESTAMP {
        return Err(ValidationError::new("timestamp is out of range"));
    }
    if doc.timestamp > now + FUTURE_CUTOFF {
        return Err(ValidationError::new(
            "timestamp is too far in the future (> 10 minutes ahead)",
        ));
    }
    if let Some(delete_after) = doc.delete_after {
        if delete_after < MIN_TIMESTAMP || delete_after > MAX_TIMESTAMP {
            return Err(ValidationError::new("deleteAfter is out of range"));
        }
        if delete_after <= now {
            return Err(ValidationError::new("ephemeral document has already expired"));
        }
        if delete_after <= doc.timestamp {
            return Err(ValidationError::new(
                "deleteAfter must be after the document timestamp",
            ));
        }
    }
    Ok(())
}

/// Address, permission and path rules shared by all formats. Permission
/// first, then path shape, then the addresses themselves.
pub(crate) fn check_addresses_and_path(doc: &Document) -> Result<(), ValidationError> {
    check_author_can_write_to_path(&doc.author, &doc.path)?;
    check_path_is_valid(&doc.path, doc.delete_after.is_some())?;
    check_author_is_valid(&doc.author)?;
    check_share_is_valid(&doc.share)?;
    Ok(())
}

/// Verify the author signature over the canonical hash.
pub(crate) fn check_signature(
    crypto: &dyn CryptoProvider,
    doc: &Document,
    hash: &str,
) -> Result<(), ValidationError> {
    let pubkey = author_pubkey_bytes(&doc.author)?;
    let sig = base32::decode(&doc.signature)?;
    if crypto.verify(&pubkey, &sig, hash.as_bytes()) {
        Ok(())
    } else {
        Err(ValidationError::new("signature does not match document"))
    }
}

/// Verify that `textHash` is the SHA-256 of the inline content.
pub(crate) fn check_content_hash(
    crypto: &dyn CryptoProvider,
    doc: &Document,
) -> Result<(), ValidationError> {
    let expected = base32::encode(crypto.sha256(doc.text.as_bytes()));
    if doc.text_hash == expected {
        Ok(())
    } else {
        Err(ValidationError::new("content hash does not match content"))
    }
}

/// Shared implementation of [`Format::remove_extra_fields`].
pub(crate) fn split_extra_fields(
    mut doc: Document,
) -> Result<(Document, ExtraFields), ValidationError> {
    let extra = std::mem::take(&mut doc.extra);
    for key in extra.keys() {
        if !key.starts_with('_') {
            return Err(ValidationError::new(format!(
                "unexpected field {key:?}: extra fields must start with '_'"
            )));
        }
    }
    Ok((doc, extra))
}

/// Shared implementation of [`Format::sign_document`].
pub(crate) fn sign_document_impl(
    format: &dyn Format,
    crypto: &dyn CryptoProvider,
    keypair: &AuthorKeypair,
    mut doc: Document,
) -> Result<Document, ValidationError> {
    if keypair.address != doc.author {
        return Err(ValidationError::new(
            "when signing, the keypair address must match the document author",
        ));
    }
    let hash = format.hash_document(crypto, &doc)?;
    let sig = crypto.sign(&keypair.secret_bytes()?, hash.as_bytes());
    doc.signature = base32::encode(sig);
    Ok(doc)
}

/// Timestamp for a wipe: just after the original, never in the past.
pub(crate) fn wipe_timestamp(old: &Document, now: Timestamp) -> Result<Timestamp, ValidationError> {
    let bumped = now.max(old.timestamp + 1);
    if bumped > MAX_TIMESTAMP {
        return Err(ValidationError::new(
            "cannot wipe: timestamp would exceed the representable maximum",
        ));
    }
    Ok(bumped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCrypto;

    #[test]
    fn registry_knows_builtin_formats() {
        assert_eq!(format_by_tag("es.4").unwrap().tag(), "es.4");
        assert_eq!(format_by_tag("es.5").unwrap().tag(), "es.5");
        assert!(format_by_tag("es.99").is_none());
        assert_eq!(DEFAULT_FORMAT.tag(), "es.5");
    }

    #[test]
    fn canonical_form_omits_none_and_uses_tabs() {
        let crypto = RustCrypto;
        let with_none = hash_canonical_fields(
            &crypto,
            &[("a", Some("1".into())), ("b", None), ("c", Some("2".into()))],
        );
        let without = hash_canonical_fields(&crypto, &[("a", Some("1".into())), ("c", Some("2".into()))]);
        assert_eq!(with_none, without);

        let expected = base32::encode(crypto.sha256(b"a\t1\nc\t2\n"));
        assert_eq!(with_none, expected);
    }

    #[test]
    fn fake_signature_is_well_shaped() {
        check_b32_shape(&fake_signature(), "signature").unwrap();
        assert_eq!(base32::decode(&fake_signature()).unwrap().len(), 64);
    }
}
