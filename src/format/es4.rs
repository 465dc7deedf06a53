//! `es.4`: the text-only document format.

use crate::crypto::CryptoProvider;
use crate::document::{Document, Timestamp};
use crate::error::ValidationError;
use crate::keys::{base32, AuthorKeypair};

use super::{
    check_addresses_and_path, check_b32_shape, check_content_hash, check_signature,
    check_timestamps, fake_signature, hash_canonical_fields, sign_document_impl,
    split_extra_fields, wipe_timestamp, AttachmentInfo, ExtraFields, Format,
    GenerateDocumentArgs,
};

/// Maximum length of `es.4` inline content, in UTF-8 bytes. Anything larger
/// must travel as an `es.5` attachment.
pub const MAX_CONTENT_LENGTH: u64 = 4_000_000;

/// The `es.4` format. Text-only; attachments are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatEs4;

impl FormatEs4 {
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
        if doc.attachment_hash.is_some() || doc.attachment_size.is_some() {
            return Err(ValidationError::new(
                "es.4 documents cannot declare attachments",
            ));
        }
        if doc.content_length() > MAX_CONTENT_LENGTH {
            return Err(ValidationError::new(format!(
                "content is too long ({} > {MAX_CONTENT_LENGTH} bytes)",
                doc.content_length()
            )));
        }
        check_b32_shape(&doc.text_hash, "contentHash")?;
        check_b32_shape(&doc.signature, "signature")?;
        Ok(())
    }

    // Signed fields, pre-sorted by name. The content itself is represented
    // by contentHash; the signature is never hashed.
    fn signed_fields(&self, doc: &Document) -> [(&'static str, Option<String>); 7] {
        [
            ("author", Some(doc.author.clone())),
            ("contentHash", Some(doc.text_hash.clone())),
            ("deleteAfter", doc.delete_after.map(|t| t.to_string())),
            ("format", Some(doc.format.clone())),
            ("path", Some(doc.path.clone())),
            ("share", Some(doc.share.clone())),
            ("timestamp", Some(doc.timestamp.to_string())),
        ]
    }
}

impl Format for FormatEs4 {
    fn tag(&self) -> &'static str {
        "es.4"
    }

    fn supports_attachments(&self) -> bool {
        false
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
        let timestamp = wipe_timestamp(doc, now)?;
        let wiped = Document {
            text: String::new(),
            text_hash: base32::encode(crypto.sha256(b"")),
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

    fn attachment_info(
        &self,
        _doc: &Document,
    ) -> Result<Option<AttachmentInfo>, ValidationError> {
        Err(ValidationError::new("es.4 documents cannot have attachments"))
    }

    fn update_attachment_fields(
        &self,
        _crypto: &dyn CryptoProvider,
        _keypair: &AuthorKeypair,
        _doc: Document,
        _size: u64,
        _hash: &str,
    ) -> Result<Document, ValidationError> {
        Err(ValidationError::new("es.4 documents cannot have attachments"))
    }
}
