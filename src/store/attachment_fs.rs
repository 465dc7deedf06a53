//! On-disk attachment storage.
//!
//! Attachments live as plain files at `<root>/<format>/<hash>`. Incoming
//! bytes are written to a temp file in `<root>/staging` while being hashed;
//! commit is an atomic rename into place, so a crash mid-stream leaves
//! nothing but staging garbage, which the next open clears.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::crypto::{default_crypto, CryptoProvider};
use crate::error::StorageError;
use crate::store::{
    consume_input, Attachment, AttachmentDriver, AttachmentInput, StagedAttachment,
};

const STAGING_DIR: &str = "staging";

/// An [`AttachmentDriver`] storing attachments as files under a root
/// directory.
#[derive(Debug)]
pub struct AttachmentDriverFs {
    root: PathBuf,
    crypto: Arc<dyn CryptoProvider>,
    closed: AtomicBool,
}

impl AttachmentDriverFs {
    /// Create or open the store rooted at `root`, clearing any staging
    /// leftovers from a previous crash.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_crypto(root, default_crypto())
    }

    /// Like [`Self::new`], with an explicit crypto provider.
    pub fn with_crypto(
        root: impl AsRef<Path>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        debug!(root = %root.display(), "opened attachment driver");
        Ok(AttachmentDriverFs {
            root,
            crypto,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn attachment_path(&self, format: &str, hash: &str) -> PathBuf {
        self.root.join(format).join(hash)
    }

    /// Walk `<root>/<format>/<hash>` and collect every stored pair.
    fn list_stored(&self) -> Result<Vec<(String, String)>, StorageError> {
        let mut stored = Vec::new();
        for format_entry in std::fs::read_dir(&self.root)? {
            let format_entry = format_entry?;
            let format = format_entry.file_name().to_string_lossy().to_string();
            if format == STAGING_DIR || !format_entry.file_type()?.is_dir() {
                continue;
            }
            for hash_entry in std::fs::read_dir(format_entry.path())? {
                let hash_entry = hash_entry?;
                let hash = hash_entry.file_name().to_string_lossy().to_string();
                stored.push((format.clone(), hash));
            }
        }
        Ok(stored)
    }
}

#[derive(Debug)]
struct StagedFsAttachment {
    temp: Option<tempfile::NamedTempFile>,
    dest: PathBuf,
    hash: String,
    size: u64,
}

#[async_trait]
impl StagedAttachment for StagedFsAttachment {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let temp = self.temp.take().expect("staged file already consumed");
        if self.dest.exists() {
            // already stored; the staged copy is redundant
            return Ok(());
        }
        if let Some(parent) = self.dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        temp.persist(&self.dest)
            .map_err(|err| StorageError::Io(err.error))?;
        Ok(())
    }

    async fn reject(mut self: Box<Self>) -> Result<(), StorageError> {
        // dropping the temp file deletes it
        self.temp.take();
        Ok(())
    }
}

#[derive(Debug)]
struct FsAttachment {
    path: PathBuf,
    size: u64,
}

#[async_trait]
impl Attachment for FsAttachment {
    fn size(&self) -> u64 {
        self.size
    }

    async fn bytes(&self) -> Result<Bytes, StorageError> {
        Ok(tokio::fs::read(&self.path).await?.into())
    }

    async fn stream(
        &self,
    ) -> Result<BoxStream<'static, std::io::Result<Bytes>>, StorageError> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(tokio_util::io::ReaderStream::new(file).boxed())
    }
}

#[async_trait]
impl AttachmentDriver for AttachmentDriverFs {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, erase: bool) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StorageError::AlreadyClosed);
        }
        if erase {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }

    async fn stage(
        &self,
        format: &str,
        source: AttachmentInput,
    ) -> Result<Box<dyn StagedAttachment>, StorageError> {
        self.check_open()?;
        let mut temp = tempfile::NamedTempFile::new_in(self.root.join(STAGING_DIR))?;
        let (hash, size) = consume_input(&*self.crypto, source, |chunk| {
            temp.write_all(chunk).map_err(StorageError::Io)
        })
        .await?;
        temp.flush()?;
        let dest = self.attachment_path(format, &hash);
        Ok(Box::new(StagedFsAttachment {
            temp: Some(temp),
            dest,
            hash,
            size,
        }))
    }

    async fn get_attachment(
        &self,
        format: &str,
        hash: &str,
    ) -> Result<Option<Box<dyn Attachment>>, StorageError> {
        self.check_open()?;
        let path = self.attachment_path(format, hash);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(Box::new(FsAttachment {
                path,
                size: meta.len(),
            }))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn erase_attachment(&self, format: &str, hash: &str) -> Result<bool, StorageError> {
        self.check_open()?;
        match tokio::fs::remove_file(self.attachment_path(format, hash)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn filter(
        &self,
        allow: &[(String, String)],
    ) -> Result<Vec<(String, String)>, StorageError> {
        self.check_open()?;
        let mut erased = Vec::new();
        for pair in self.list_stored()? {
            if allow.contains(&pair) {
                continue;
            }
            let path = self.attachment_path(&pair.0, &pair.1);
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to erase attachment: {err}");
                continue;
            }
            erased.push(pair);
        }
        Ok(erased)
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        self.check_open()?;
        for pair in self.list_stored()? {
            std::fs::remove_file(self.attachment_path(&pair.0, &pair.1))?;
        }
        Ok(())
    }
}
