//! In-memory storage for replicas.
//!
//! The smallest useful drivers: documents in a `BTreeMap`, attachments in a
//! map of buffers. Nothing survives the process, which is exactly what tests
//! and throwaway replicas want.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tracing::trace;

use crate::crypto::{default_crypto, CryptoProvider};
use crate::document::{now_microseconds, Document, Timestamp};
use crate::error::StorageError;
use crate::query::{execute_query, Query};
use crate::store::{
    consume_input, Attachment, AttachmentDriver, AttachmentInput, DocDriver, StagedAttachment,
};

/// Rows are keyed by (path, author, format): one row per author per path
/// per format, always the newest accepted version.
type DocKey = (String, String, String);

fn doc_key(doc: &Document) -> DocKey {
    (doc.path.clone(), doc.author.clone(), doc.format.clone())
}

#[derive(Debug, Default)]
struct DocState {
    docs: BTreeMap<DocKey, Document>,
    config: BTreeMap<String, String>,
    max_local_index: i64,
}

/// An in-memory [`DocDriver`].
#[derive(Debug)]
pub struct DocDriverMemory {
    share: String,
    state: Mutex<DocState>,
    closed: AtomicBool,
}

impl DocDriverMemory {
    /// Create an empty driver for `share`.
    pub fn new(share: impl Into<String>) -> Self {
        DocDriverMemory {
            share: share.into(),
            state: Mutex::new(DocState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocDriver for DocDriverMemory {
    fn share(&self) -> Option<String> {
        Some(self.share.clone())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, erase: bool) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::AlreadyClosed);
        }
        if erase {
            let mut state = self.state.lock();
            state.docs.clear();
            state.config.clear();
            state.max_local_index = -1;
        }
        Ok(())
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_open()?;
        self.state
            .lock()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().config.remove(key).is_some())
    }

    async fn list_config_keys(&self) -> Result<Vec<String>, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().config.keys().cloned().collect())
    }

    async fn max_local_index(&self) -> Result<i64, StorageError> {
        self.check_open()?;
        Ok(self.state.lock().max_local_index)
    }

    async fn query_docs(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        self.check_open()?;
        let docs: Vec<Document> = self.state.lock().docs.values().cloned().collect();
        execute_query(docs, query, now_microseconds())
            .map_err(|err| StorageError::Database(anyhow::anyhow!(err)))
    }

    async fn upsert(&self, mut doc: Document) -> Result<Document, StorageError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.max_local_index += 1;
        doc.local_index = Some(state.max_local_index as u64);
        trace!(path = %doc.path, local_index = ?doc.local_index, "upsert");
        state.docs.insert(doc_key(&doc), doc.clone());
        Ok(doc)
    }

    async fn erase_expired_docs(&self, now: Timestamp) -> Result<Vec<Document>, StorageError> {
        self.check_open()?;
        let mut state = self.state.lock();
        let expired_keys: Vec<DocKey> = state
            .docs
            .iter()
            .filter(|(_, doc)| doc.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut erased = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(doc) = state.docs.remove(&key) {
                erased.push(doc);
            }
        }
        Ok(erased)
    }
}

type BlobMap = Arc<Mutex<BTreeMap<(String, String), Bytes>>>;

/// An in-memory [`AttachmentDriver`].
#[derive(Debug)]
pub struct AttachmentDriverMemory {
    crypto: Arc<dyn CryptoProvider>,
    blobs: BlobMap,
    closed: AtomicBool,
}

impl Default for AttachmentDriverMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl AttachmentDriverMemory {
    /// Create an empty driver using the process default crypto provider.
    pub fn new() -> Self {
        Self::with_crypto(default_crypto())
    }

    /// Create an empty driver with an explicit crypto provider.
    pub fn with_crypto(crypto: Arc<dyn CryptoProvider>) -> Self {
        AttachmentDriverMemory {
            crypto,
            blobs: Default::default(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct StagedMemoryAttachment {
    key: (String, String),
    hash: String,
    size: u64,
    bytes: Bytes,
    blobs: BlobMap,
}

#[async_trait]
impl StagedAttachment for StagedMemoryAttachment {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.blobs.lock().entry(self.key).or_insert(self.bytes);
        Ok(())
    }

    async fn reject(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryAttachment {
    bytes: Bytes,
}

#[async_trait]
impl Attachment for MemoryAttachment {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn bytes(&self) -> Result<Bytes, StorageError> {
        Ok(self.bytes.clone())
    }

    async fn stream(
        &self,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, StorageError> {
        let bytes = self.bytes.clone();
        Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
    }
}

#[async_trait]
impl AttachmentDriver for AttachmentDriverMemory {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, erase: bool) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::AlreadyClosed);
        }
        if erase {
            self.blobs.lock().clear();
        }
        Ok(())
    }

    async fn stage(
        &self,
        format: &str,
        source: AttachmentInput,
    ) -> Result<Box<dyn StagedAttachment>, StorageError> {
        self.check_open()?;
        let mut buffer = Vec::new();
        let (hash, size) = consume_input(&*self.crypto, source, |chunk| {
            buffer.extend_from_slice(chunk);
            Ok(())
        })
        .await?;
        Ok(Box::new(StagedMemoryAttachment {
            key: (format.to_string(), hash.clone()),
            hash,
            size,
            bytes: buffer.into(),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    async fn get_attachment(
        &self,
        format: &str,
        hash: &str,
    ) -> Result<Option<Box<dyn Attachment>>, StorageError> {
        self.check_open()?;
        let blobs = self.blobs.lock();
        Ok(blobs
            .get(&(format.to_string(), hash.to_string()))
            .map(|bytes| {
                Box::new(MemoryAttachment {
                    bytes: bytes.clone(),
                }) as Box<dyn Attachment>
            }))
    }

    async fn erase_attachment(&self, format: &str, hash: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        Ok(self
            .blobs
            .lock()
            .remove(&(format.to_string(), hash.to_string()))
            .is_some())
    }

    async fn filter(
        &self,
        allow: &[(String, String)],
    ) -> Result<Vec<(String, String)>, StorageError> {
        self.check_open()?;
        let mut blobs = self.blobs.lock();
        let doomed: Vec<(String, String)> = blobs
            .keys()
            .filter(|key| !allow.contains(key))
            .cloned()
            .collect();
        for key in &doomed {
            blobs.remove(key);
        }
        Ok(doomed)
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.blobs.lock().clear();
        Ok(())
    }
}
