//! The document record shared by all formats.
//!
//! A [`Document`] is one signed write to one path of one share. Formats give
//! the record its meaning (which fields are signed, how the content hash is
//! computed); the struct itself is deliberately format-agnostic so drivers
//! and queries can handle every format uniformly.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Microseconds since the UNIX epoch.
pub type Timestamp = u64;

/// The earliest acceptable document timestamp (10^13, which is year 2286 in
/// milliseconds, so a milliseconds value can never be mistaken for
/// microseconds).
pub const MIN_TIMESTAMP: Timestamp = 10_000_000_000_000;

/// The latest representable document timestamp, 2^53 - 2.
pub const MAX_TIMESTAMP: Timestamp = (1 << 53) - 2;

/// Accepted writes may be at most this far ahead of the local wall clock.
pub const FUTURE_CUTOFF: Timestamp = 10 * 60 * 1_000_000;

/// The current wall clock in microseconds.
pub fn now_microseconds() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}

/// One signed, path-addressed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Tag of the format that signed this document, e.g. `es.5`.
    pub format: String,
    /// Address of the author that signed this document.
    pub author: String,
    /// The path this document is stored at.
    pub path: String,
    /// Address of the share this document belongs to.
    pub share: String,
    /// Claimed creation time, microseconds since the UNIX epoch.
    pub timestamp: Timestamp,
    /// If set, the document is ephemeral and invisible from this time on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after: Option<Timestamp>,
    /// Author signature over the document hash, `b`-prefixed base32.
    pub signature: String,
    /// The document's inline content (`content` in text-only formats).
    #[serde(default)]
    pub text: String,
    /// SHA-256 of [`Self::text`], `b`-prefixed base32.
    #[serde(default)]
    pub text_hash: String,
    /// Size in bytes of the attachment, if the document declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_size: Option<u64>,
    /// SHA-256 of the attachment bytes, `b`-prefixed base32.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_hash: Option<String>,
    /// Replica-local ingest sequence number. Not part of the signed fields;
    /// assigned by the document driver on upsert.
    #[serde(
        rename = "_localIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_index: Option<u64>,
    /// Fields outside the schema, as they arrived. Formats strip these
    /// before validation; see `Format::remove_extra_fields`.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Document {
    /// Returns true if this document carries a `deleteAfter`.
    pub fn is_ephemeral(&self) -> bool {
        self.delete_after.is_some()
    }

    /// Returns true if this document must no longer be visible at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.delete_after, Some(deadline) if deadline <= now)
    }

    /// Length of the inline content in bytes of its UTF-8 encoding.
    pub fn content_length(&self) -> u64 {
        self.text.len() as u64
    }

    /// Returns true if this document declares an attachment.
    pub fn has_attachment(&self) -> bool {
        self.attachment_hash.is_some()
    }
}

/// Newest-first ordering for documents at the same path: timestamp
/// descending, ties broken by signature, descending lexicographically.
///
/// The same comparator picks the winner at a path across authors and
/// orders a path's history.
pub fn cmp_newest_first(a: &Document, b: &Document) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.signature.cmp(&a.signature))
}

/// Pick the winning (latest) document out of an iterator, by
/// [`cmp_newest_first`].
pub fn latest_of<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Option<&'a Document> {
    docs.into_iter().min_by(|a, b| cmp_newest_first(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn doc(timestamp: Timestamp, signature: &str) -> Document {
        Document {
            format: "es.5".to_string(),
            author: "@test.bxxx".to_string(),
            path: "/test".to_string(),
            share: "+test.bxxx".to_string(),
            timestamp,
            delete_after: None,
            signature: signature.to_string(),
            text: "hello".to_string(),
            text_hash: "bhash".to_string(),
            attachment_size: None,
            attachment_hash: None,
            local_index: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn newest_first_by_timestamp_then_signature() {
        let older = doc(MIN_TIMESTAMP + 1, "baaa");
        let newer = doc(MIN_TIMESTAMP + 2, "baaa");
        assert_eq!(cmp_newest_first(&newer, &older), Ordering::Less);

        // equal timestamps: higher signature wins
        let low_sig = doc(MIN_TIMESTAMP + 2, "baaa");
        let high_sig = doc(MIN_TIMESTAMP + 2, "bzzz");
        assert_eq!(cmp_newest_first(&high_sig, &low_sig), Ordering::Less);

        let winner = latest_of([&older, &newer, &high_sig]).unwrap();
        assert_eq!(winner.signature, "bzzz");
    }

    #[test]
    fn expiry_bound_is_inclusive() {
        let mut d = doc(MIN_TIMESTAMP, "bsig");
        d.delete_after = Some(MIN_TIMESTAMP + 500);
        assert!(!d.is_expired(MIN_TIMESTAMP + 499));
        assert!(d.is_expired(MIN_TIMESTAMP + 500));
        assert!(d.is_expired(MIN_TIMESTAMP + 501));
    }

    #[test]
    fn serde_uses_wire_names_and_keeps_extras() {
        let json = serde_json::json!({
            "format": "es.5",
            "author": "@test.bxxx",
            "path": "/test",
            "share": "+test.bxxx",
            "timestamp": MIN_TIMESTAMP,
            "deleteAfter": MIN_TIMESTAMP + 10,
            "signature": "bsig",
            "text": "hi",
            "textHash": "bhash",
            "_localIndex": 3,
            "_customExtra": "kept",
        });
        let doc: Document = serde_json::from_value(json).unwrap();
        assert_eq!(doc.delete_after, Some(MIN_TIMESTAMP + 10));
        assert_eq!(doc.local_index, Some(3));
        assert_eq!(doc.extra["_customExtra"], "kept");

        let out = serde_json::to_value(&doc).unwrap();
        assert_eq!(out["textHash"], "bhash");
        assert_eq!(out["_localIndex"], 3);
    }

    #[test]
    fn content_length_counts_utf8_bytes() {
        let mut d = doc(MIN_TIMESTAMP, "bsig");
        d.text = "☃".to_string();
        assert_eq!(d.content_length(), 3);
    }
}
