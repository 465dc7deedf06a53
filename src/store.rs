//! Abstract storage back-ends.
//!
//! A replica mediates two drivers: a [`DocDriver`] persisting document
//! records plus a small config key/value space, and an [`AttachmentDriver`]
//! persisting opaque attachment bytes keyed by `(format, hash)`. The replica
//! depends only on these contracts; the crate ships in-memory
//! implementations of both, a [redb](::redb)-backed document driver and a
//! filesystem attachment driver.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::document::{Document, Timestamp};
use crate::error::StorageError;
use crate::query::Query;

pub mod attachment_fs;
pub mod fs;
pub mod memory;

/// Config key under which drivers persist their share address.
pub const CONFIG_SHARE: &str = "share";
/// Config key under which drivers persist their schema version.
pub const CONFIG_SCHEMA_VERSION: &str = "schemaVersion";
/// The schema version written by this crate.
pub const SCHEMA_VERSION: &str = "2";

/// Persists document records for one share.
///
/// Drivers reject every operation after [`close`](Self::close) with
/// [`StorageError::Closed`], and a second close with
/// [`StorageError::AlreadyClosed`].
#[async_trait]
pub trait DocDriver: fmt::Debug + Send + Sync {
    /// The share this driver holds documents for: the one it was opened
    /// with, or the one inherited from persisted config.
    fn share(&self) -> Option<String>;

    /// Whether the driver has been closed.
    fn is_closed(&self) -> bool;

    /// Shut the driver down. With `erase`, backing storage is removed.
    async fn close(&self, erase: bool) -> Result<(), StorageError>;

    /// Read a persistent config value.
    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a persistent config value.
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a config value. Returns whether the key existed.
    async fn delete_config(&self, key: &str) -> Result<bool, StorageError>;

    /// List all config keys, sorted.
    async fn list_config_keys(&self) -> Result<Vec<String>, StorageError>;

    /// The highest `_localIndex` ever assigned, or `-1` when empty.
    async fn max_local_index(&self) -> Result<i64, StorageError>;

    /// Execute a canonicalised query. Expired documents are never returned.
    async fn query_docs(&self, query: &Query) -> Result<Vec<Document>, StorageError>;

    /// Store `doc`, overwriting any prior row at the same
    /// (path, author, format) and assigning the next `_localIndex`. Returns
    /// the stored document.
    async fn upsert(&self, doc: Document) -> Result<Document, StorageError>;

    /// Atomically remove every document whose `deleteAfter` has passed at
    /// `now`, returning the removed set.
    async fn erase_expired_docs(&self, now: Timestamp) -> Result<Vec<Document>, StorageError>;
}

/// Attachment bytes entering a replica: a buffer, or a stream of chunks.
pub enum AttachmentInput {
    /// In-memory bytes.
    Bytes(Bytes),
    /// A stream of chunks; every chunk boundary is a suspension point.
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

impl fmt::Debug for AttachmentInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentInput::Bytes(bytes) => {
                f.debug_tuple("Bytes").field(&bytes.len()).finish()
            }
            AttachmentInput::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

impl From<Bytes> for AttachmentInput {
    fn from(bytes: Bytes) -> Self {
        AttachmentInput::Bytes(bytes)
    }
}

impl From<Vec<u8>> for AttachmentInput {
    fn from(bytes: Vec<u8>) -> Self {
        AttachmentInput::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for AttachmentInput {
    fn from(bytes: &'static [u8]) -> Self {
        AttachmentInput::Bytes(Bytes::from_static(bytes))
    }
}

/// A readable attachment held by an [`AttachmentDriver`].
#[async_trait]
pub trait Attachment: fmt::Debug + Send + Sync {
    /// Size of the attachment in bytes.
    fn size(&self) -> u64;

    /// Read the whole attachment into memory.
    async fn bytes(&self) -> Result<Bytes, StorageError>;

    /// Open the attachment as a stream of chunks.
    async fn stream(&self)
        -> Result<BoxStream<'static, std::io::Result<Bytes>>, StorageError>;
}

/// Bytes consumed by [`AttachmentDriver::stage`]: hashed and counted but not
/// yet visible. Dropping the handle without committing leaves only staging
/// garbage, which drivers clear on their next open.
#[async_trait]
pub trait StagedAttachment: fmt::Debug + Send {
    /// SHA-256 of the staged bytes, `b`-prefixed base32.
    fn hash(&self) -> &str;

    /// Number of staged bytes.
    fn size(&self) -> u64;

    /// Atomically move the staged bytes into addressable storage. Committing
    /// a hash that is already stored is a no-op.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard the staged bytes.
    async fn reject(self: Box<Self>) -> Result<(), StorageError>;
}

/// Persists opaque attachment bytes keyed by `(format, hash)`.
#[async_trait]
pub trait AttachmentDriver: fmt::Debug + Send + Sync {
    /// Whether the driver has been closed.
    fn is_closed(&self) -> bool;

    /// Shut the driver down. With `erase`, all stored attachments are
    /// removed.
    async fn close(&self, erase: bool) -> Result<(), StorageError>;

    /// Consume `source` into staging, hashing incrementally. The returned
    /// handle carries the measured hash and size; callers compare those
    /// against whatever a document declares before committing.
    async fn stage(
        &self,
        format: &str,
        source: AttachmentInput,
    ) -> Result<Box<dyn StagedAttachment>, StorageError>;

    /// Look up committed attachment bytes.
    async fn get_attachment(
        &self,
        format: &str,
        hash: &str,
    ) -> Result<Option<Box<dyn Attachment>>, StorageError>;

    /// Erase one committed attachment. Returns whether it existed.
    async fn erase_attachment(&self, format: &str, hash: &str) -> Result<bool, StorageError>;

    /// Erase every committed attachment not in `allow`, returning the erased
    /// `(format, hash)` pairs. Used for GC against the document driver's
    /// ground truth.
    async fn filter(
        &self,
        allow: &[(String, String)],
    ) -> Result<Vec<(String, String)>, StorageError>;

    /// Erase everything. Used only when a replica is erased.
    async fn clear_all(&self) -> Result<(), StorageError>;
}

/// Collect an [`AttachmentInput`] through an incremental hasher, invoking
/// `write` per chunk. Returns the hash and total size. Shared by drivers.
pub(crate) async fn consume_input(
    crypto: &dyn crate::crypto::CryptoProvider,
    mut source: AttachmentInput,
    mut write: impl FnMut(&[u8]) -> Result<(), StorageError> + Send,
) -> Result<(String, u64), StorageError> {
    use futures::StreamExt;

    let mut hasher = crypto.updatable_sha256();
    let mut size = 0u64;
    match &mut source {
        AttachmentInput::Bytes(bytes) => {
            hasher.update(bytes);
            size = bytes.len() as u64;
            write(bytes)?;
        }
        AttachmentInput::Stream(stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                size += chunk.len() as u64;
                write(&chunk)?;
            }
        }
    }
    Ok((crate::keys::base32::encode(hasher.finish()), size))
}
