//! `es.5`: the attachment-capable document format.
//!
//! An `es.5` document carries a short inline `text` plus, optionally, one
//! attachment described by its size and SHA-256 hash. The attachment bytes
//! themselves never pass through the format; only the descriptor is signed.

use crate::crypto::CryptoProvider;
use crate::document::{Document, Timestamp};
use crate::error::ValidationError;
use crate::keys::{base32, AuthorKeypair};

use super::{
    check_addresses_and_path, check_b32_shape, check_content_hash, check_signature,
    check_timestamps, fake_signature, hash_canonical_fields, sign_document_impl,
    split_extra_fields, AttachmentInfo, ExtraFields, Format, GenerateDocumentArgs,
};

/// Maximum length of `es.5` inline text, in UTF-8 bytes. Large payloads
/// travel as attachments.
pub const MAX_TEXT_LENGTH: u64 = 8_000;

/// The `es.5` format: text plus at most one attachment per document.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatEs5;

impl FormatEs5 {
    fn check_basic(&self, doc: &Document) -> Result<(), ValidationError> {
        if doc.format != self.tag() {
            return Err(ValidationError::new(format!(
                "expected format {:?}, got {:?}",
                self.tag(),
                doc.format
            )));
        }
        if !doc.extra.is_empty() {
            return Err(ValidationError::new(
                "document has extra fields; strip them before validating",
            ));
        }
        if doc.content_length() > MAX_TEXT_LENGTH {
            return Err(ValidationError::new(format!(
                "text is too long ({} > {MAX_TEXT_LENGTH} bytes)",
                doc.content_length()
            )));
        }
        match (&doc.attachment_hash, doc.attachment_size) {
            (None, None) => {}
            (Some(hash), Some(_)) => check_b32_shape(hash, "attachmentHash")?,
            _ => {
                return Err(ValidationError::new(
                    "attachmentHash and attachmentSize must be both present or both absent",
                ))
            }
        }
        check_b32_shape(&doc.text_hash, "textHash")?;
        check_b32_shape(&doc.signature, "signature")?;
        Ok(())
    }

    // Signed fields, pre-sorted by name. Text is represented by textHash,
    // the attachment by its descriptor; signature and payload bytes are
    // never hashed.
    fn signed_fields(&self, doc: &Document) -> [(&'static str, Option<String>); 9] {
        [
            ("attachmentHash", doc.attachment_hash.clone()),
            ("attachmentSize", doc.attachment_size.map(|s| s.to_string())),
            ("author", Some(doc.author.clone())),
            ("deleteAfter", doc.delete_after.map(|t| t.to_string())),
            ("format", Some(doc.format.clone())),
            ("path", Some(doc.path.clone())),
            ("share", Some(doc.share.clone())),
            ("textHash", Some(doc.text_hash.clone())),
            ("timestamp", Some(doc.timestamp.to_string())),
        ]
    }
}

impl Format for FormatEs5 {
    fn tag(&self) -> &'static str {
        "es.5"
    }

    fn supports_attachments(&self) -> bool {
        true
    }

    fn hash_document(
        &self,
        crypto: &dyn CryptoProvider,
        doc: &Document,
    ) -> Result<String, ValidationError> {
        let mut probe = doc.clone();
        if probe.signature.is_empty() {
            probe.signature = fake_signature();
        }
        self.check_basic(&probe)?;
        Ok(hash_canonical_fields(crypto, &self.signed_fields(&probe)))
    }

    fn generate_document(
        &self,
        crypto: &dyn CryptoProvider,
        args: GenerateDocumentArgs<'_>,
    ) -> Result<Document, ValidationError> {
        let text_hash = base32::encode(crypto.sha256(args.text.as_bytes()));
        let doc = Document {
            format: self.tag().to_string(),
            author: args.keypair.address.clone(),
            path: args.path,
            share: args.share.to_string(),
            timestamp: args.timestamp,
            delete_after: args.delete_after,
            signature: String::new(),
            text: args.text,
            text_hash,
            attachment_size: None,
            attachment_hash: None,
            local_index: None,
            extra: Default::default(),
        };
        self.sign_document(crypto, args.keypair, doc)
    }

    fn sign_document(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        doc: Document,
    ) -> Result<Document, ValidationError> {
        sign_document_impl(self, crypto, keypair, doc)
    }

    fn wipe_document(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        doc: &Document,
        now: Timestamp,
    ) -> Result<Document, ValidationError> {
        let timestamp = super::wipe_timestamp(doc, now)?;
        let wiped = Document {
            text: String::new(),
            text_hash: base32::encode(crypto.sha256(b"")),
            attachment_size: None,
            attachment_hash: None,
            timestamp,
            signature: String::new(),
            local_index: None,
            extra: Default::default(),
            ..doc.clone()
        };
        self.sign_document(crypto, keypair, wiped)
    }

    fn remove_extra_fields(
        &self,
        doc: Document,
    ) -> Result<(Document, ExtraFields), ValidationError> {
        split_extra_fields(doc)
    }

    fn check_document_is_valid(
        &self,
        crypto: &dyn CryptoProvider,
        doc: &Document,
        now: Timestamp,
    ) -> Result<(), ValidationError> {
        self.check_basic(doc)?;
        check_timestamps(doc, now)?;
        check_addresses_and_path(doc)?;
        let hash = self.hash_document(crypto, doc)?;
        check_signature(crypto, doc, &hash)?;
        check_content_hash(crypto, doc)
    }

    fn attachment_info(&self, doc: &Document) -> Result<Option<AttachmentInfo>, ValidationError> {
        match (&doc.attachment_hash, doc.attachment_size) {
            (None, None) => Ok(None),
            (Some(hash), Some(size)) => Ok(Some(AttachmentInfo {
                size,
                hash: hash.clone(),
            })),
            _ => Err(ValidationError::new(
                "attachmentHash and attachmentSize must be both present or both absent",
            )),
        }
    }

    fn update_attachment_fields(
        &self,
        crypto: &dyn CryptoProvider,
        keypair: &AuthorKeypair,
        mut doc: Document,
        size: u64,
        hash: &str,
    ) -> Result<Document, ValidationError> {
        check_b32_shape(hash, "attachmentHash")?;
        doc.attachment_size = Some(size);
        doc.attachment_hash = Some(hash.to_string());
        doc.signature = String::new();
        self.sign_document(crypto, keypair, doc)
    }
}
