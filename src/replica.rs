//! The replica: the authoritative local store of one share's documents.
//!
//! A replica owns exactly one [`DocDriver`] and one [`AttachmentDriver`].
//! It validates and ingests documents, assigns local indexes, keeps the two
//! drivers consistent across partial failures, sweeps expired ephemeral
//! documents, and fans typed events out to subscribers.
//!
//! All operations are cooperative: they suspend at driver calls, crypto,
//! attachment chunk boundaries and slow subscribers, and never run in
//! parallel within one replica. A single write lock serializes every
//! mutation, which is what makes `_localIndex` assignment serial and the
//! timestamp bump rule race-free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace, warn};

use crate::address::check_share_is_valid;
use crate::crypto::{default_crypto, CryptoProvider};
use crate::document::{cmp_newest_first, now_microseconds, Document, Timestamp};
use crate::error::{ReplicaError, ValidationError};
use crate::events::{
    EventBus, EventChannel, EventSubscription, IngestKind, IngestSource, ReplicaEvent,
};
use crate::format::{format_by_tag, Format, GenerateDocumentArgs, DEFAULT_FORMAT};
use crate::keys::AuthorKeypair;
use crate::query::{clean_up_query, Query, QueryFilter, WillMatch};
use crate::store::{
    Attachment, AttachmentDriver, AttachmentInput, DocDriver, CONFIG_SCHEMA_VERSION,
    CONFIG_SHARE, SCHEMA_VERSION,
};

const REASON_OBSOLETE: &str = "obsolete_from_same_author";

/// What a successful ingest call did.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The document was stored.
    Ingested {
        /// The stored document, with its `_localIndex` assigned.
        doc: Document,
        /// Whether it is the new latest at its path.
        latest: bool,
    },
    /// Nothing was written; a newer-or-equal document from the same author
    /// already exists.
    Nothing {
        /// Why the ingest was a no-op.
        reason: &'static str,
    },
}

/// Input to [`Replica::set`].
#[derive(Debug)]
pub struct SetInput {
    /// The path to write at.
    pub path: String,
    /// The inline content.
    pub text: String,
    /// Claimed creation time. Defaults to just after the newest known
    /// document at the path, so the write wins.
    pub timestamp: Option<Timestamp>,
    /// Expiry deadline; required iff the path is ephemeral.
    pub delete_after: Option<Timestamp>,
    /// Attachment bytes to stage and commit alongside the document.
    pub attachment: Option<AttachmentInput>,
    /// The format to write with. Defaults to [`DEFAULT_FORMAT`].
    pub format: Option<&'static dyn Format>,
}

impl SetInput {
    /// A plain text write at `path`.
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        SetInput {
            path: path.into(),
            text: text.into(),
            timestamp: None,
            delete_after: None,
            attachment: None,
            format: None,
        }
    }

    /// Set an explicit timestamp.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Make the document ephemeral.
    pub fn with_delete_after(mut self, delete_after: Timestamp) -> Self {
        self.delete_after = Some(delete_after);
        self
    }

    /// Attach bytes to the document.
    pub fn with_attachment(mut self, attachment: impl Into<AttachmentInput>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// Write with a specific format.
    pub fn with_format(mut self, format: &'static dyn Format) -> Self {
        self.format = Some(format);
        self
    }
}

/// Everything needed to open a [`Replica`].
#[derive(Debug)]
pub struct ReplicaOpts {
    /// The share this replica holds.
    pub share: String,
    /// Document storage.
    pub doc_driver: Arc<dyn DocDriver>,
    /// Attachment storage.
    pub attachment_driver: Arc<dyn AttachmentDriver>,
    /// Crypto provider; the process default is snapshotted when omitted.
    pub crypto: Option<Arc<dyn CryptoProvider>>,
}

struct ReplicaInner {
    share: String,
    docs: Arc<dyn DocDriver>,
    attachments: Arc<dyn AttachmentDriver>,
    crypto: Arc<dyn CryptoProvider>,
    events: EventBus,
    closed: AtomicBool,
    /// Serializes every mutation; also held across event emission so
    /// subscribers observe operations in order.
    write_lock: AsyncMutex<()>,
    expiry_wakeup: Arc<Notify>,
    expiry_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicaInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("share", &self.share)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// The local store of one share's documents and attachments.
///
/// Cheap to clone; all clones point at the same state.
#[derive(Debug, Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    /// Open a replica.
    ///
    /// Validates the share address, reconciles it with whatever the document
    /// driver has persisted (a mismatch is fatal), records the schema
    /// version, sweeps already-expired documents, prunes unreferenced
    /// attachments left over from a previous run, and arms the expiry
    /// sweeper.
    pub async fn open(opts: ReplicaOpts) -> Result<Replica, ReplicaError> {
        check_share_is_valid(&opts.share)?;

        if let Some(declared) = opts.doc_driver.share() {
            if declared != opts.share {
                return Err(ValidationError::new(format!(
                    "doc driver belongs to share {declared}, expected {}",
                    opts.share
                ))
                .into());
            }
        }
        match opts.doc_driver.get_config(CONFIG_SHARE).await? {
            None => {
                opts.doc_driver
                    .set_config(CONFIG_SHARE, &opts.share)
                    .await?
            }
            Some(persisted) if persisted == opts.share => {}
            Some(persisted) => {
                return Err(ValidationError::new(format!(
                    "doc driver persisted share {persisted}, expected {}",
                    opts.share
                ))
                .into())
            }
        }
        match opts.doc_driver.get_config(CONFIG_SCHEMA_VERSION).await? {
            None => {
                opts.doc_driver
                    .set_config(CONFIG_SCHEMA_VERSION, SCHEMA_VERSION)
                    .await?
            }
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                return Err(ValidationError::new(format!(
                    "unsupported schema version {version}"
                ))
                .into())
            }
        }

        let inner = Arc::new(ReplicaInner {
            share: opts.share,
            docs: opts.doc_driver,
            attachments: opts.attachment_driver,
            crypto: opts.crypto.unwrap_or_else(default_crypto),
            events: EventBus::default(),
            closed: AtomicBool::new(false),
            write_lock: AsyncMutex::new(()),
            expiry_wakeup: Arc::new(Notify::new()),
            expiry_task: parking_lot::Mutex::new(None),
        });

        inner.sweep_expired().await?;
        inner.prune_unreferenced_attachments().await?;

        let task = tokio::spawn(expiry_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.expiry_wakeup),
        ));
        *inner.expiry_task.lock() = Some(task);

        debug!(share = %inner.share, "replica open");
        Ok(Replica { inner })
    }

    /// The share this replica holds.
    pub fn share(&self) -> &str {
        &self.inner.share
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The crypto provider snapshotted at open time.
    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.inner.crypto
    }

    fn check_open(&self) -> Result<(), ReplicaError> {
        if self.is_closed() {
            Err(ReplicaError::ReplicaIsClosed)
        } else {
            Ok(())
        }
    }

    /// Subscribe to all events, unbounded.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe(None, None)
    }

    /// Subscribe to one channel, optionally with a bounded buffer that
    /// applies backpressure to the replica.
    pub fn subscribe_with(
        &self,
        channel: Option<EventChannel>,
        capacity: Option<usize>,
    ) -> EventSubscription {
        self.inner.events.subscribe(channel, capacity)
    }

    /// Close the replica, with `erase` also destroying backing storage.
    ///
    /// Emits `WillClose`, shuts down both drivers, emits `DidClose` and ends
    /// every event stream. A second close fails with
    /// [`ReplicaError::ReplicaIsClosed`].
    pub async fn close(&self, erase: bool) -> Result<(), ReplicaError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ReplicaError::ReplicaIsClosed);
        }
        debug!(share = %self.inner.share, erase, "replica closing");
        self.inner.events.emit(ReplicaEvent::WillClose).await;

        if let Some(task) = self.inner.expiry_task.lock().take() {
            task.abort();
        }
        let docs_result = self.inner.docs.close(erase).await;
        let attachments_result = self.inner.attachments.close(erase).await;

        self.inner
            .events
            .emit(ReplicaEvent::DidClose { erased: erase })
            .await;
        self.inner.events.close();

        docs_result?;
        attachments_result?;
        Ok(())
    }

    /// Generate, sign and ingest a document, staging and committing its
    /// attachment alongside it.
    ///
    /// The timestamp defaults to just after the newest known document at the
    /// path, so that the write wins; concurrent `set`s at the same path
    /// totally order because the bump happens under the write lock.
    pub async fn set(
        &self,
        keypair: &AuthorKeypair,
        input: SetInput,
    ) -> Result<IngestOutcome, ReplicaError> {
        self.check_open()?;
        let format = input.format.unwrap_or(DEFAULT_FORMAT);
        let crypto = Arc::clone(&self.inner.crypto);

        // stage attachment bytes before taking the write lock; streaming
        // must not block other writers
        let staged = match input.attachment {
            Some(source) => {
                if !format.supports_attachments() {
                    return Err(ReplicaError::NotSupported(format!(
                        "format {} does not support attachments",
                        format.tag()
                    )));
                }
                Some(self.inner.attachments.stage(format.tag(), source).await?)
            }
            None => None,
        };

        let guard = self.inner.write_lock.lock().await;

        let timestamp = match input.timestamp {
            Some(timestamp) => timestamp,
            None => {
                let at_path = self
                    .inner
                    .query(
                        &Query::all().with_filter(QueryFilter {
                            path: Some(input.path.clone()),
                            ..Default::default()
                        }),
                    )
                    .await?;
                let newest = at_path.iter().map(|doc| doc.timestamp).max();
                match newest {
                    Some(newest) => now_microseconds().max(newest + 1),
                    None => now_microseconds(),
                }
            }
        };

        let mut doc = format.generate_document(
            &*crypto,
            GenerateDocumentArgs {
                keypair,
                share: &self.inner.share,
                path: input.path,
                text: input.text,
                timestamp,
                delete_after: input.delete_after,
            },
        )?;

        if let Some(staged) = &staged {
            doc = format.update_attachment_fields(
                &*crypto,
                keypair,
                doc,
                staged.size(),
                staged.hash(),
            )?;
        }

        let outcome = self
            .ingest_locked(format, doc, IngestSource::Local)
            .await?;

        if let Some(staged) = staged {
            match &outcome {
                IngestOutcome::Ingested { doc, .. } => {
                    let hash = staged.hash().to_string();
                    let size = staged.size();
                    let already_present = self
                        .inner
                        .attachments
                        .get_attachment(format.tag(), &hash)
                        .await?
                        .is_some();
                    if already_present {
                        // reused attachment; do not re-store
                        staged.reject().await?;
                    } else {
                        staged.commit().await?;
                        self.inner
                            .events
                            .emit(ReplicaEvent::AttachmentIngest {
                                doc: doc.clone(),
                                hash,
                                size,
                                source: IngestSource::Local,
                            })
                            .await;
                    }
                }
                IngestOutcome::Nothing { .. } => staged.reject().await?,
            }
        }
        drop(guard);
        Ok(outcome)
    }

    /// Validate and store a document, typically one received from a peer.
    ///
    /// Invalid documents are reported as `Ingest` failure events and
    /// returned as errors; nothing is partially persisted.
    pub async fn ingest(
        &self,
        format: &dyn Format,
        doc: Document,
        source: IngestSource,
    ) -> Result<IngestOutcome, ReplicaError> {
        self.check_open()?;
        let _guard = self.inner.write_lock.lock().await;
        self.ingest_locked(format, doc, source).await
    }

    async fn ingest_locked(
        &self,
        format: &dyn Format,
        doc: Document,
        source: IngestSource,
    ) -> Result<IngestOutcome, ReplicaError> {
        let doc = match self.validate_for_ingest(format, doc) {
            Ok(doc) => doc,
            Err((doc, reason)) => {
                self.inner
                    .events
                    .emit(ReplicaEvent::Ingest {
                        doc,
                        kind: IngestKind::Failure {
                            reason: reason.clone(),
                        },
                        source,
                    })
                    .await;
                return Err(reason.into());
            }
        };

        // newest-or-equal from the same author makes this a no-op
        let same_author = self
            .inner
            .query(&Query::all().with_filter(QueryFilter {
                path: Some(doc.path.clone()),
                author: Some(doc.author.clone()),
                ..Default::default()
            }))
            .await?;
        if same_author
            .iter()
            .filter(|existing| existing.format == doc.format)
            .any(|existing| cmp_newest_first(existing, &doc).is_le())
        {
            trace!(path = %doc.path, "ingest no-op: obsolete");
            self.inner
                .events
                .emit(ReplicaEvent::Ingest {
                    doc,
                    kind: IngestKind::Nothing {
                        reason: REASON_OBSOLETE,
                    },
                    source,
                })
                .await;
            return Ok(IngestOutcome::Nothing {
                reason: REASON_OBSOLETE,
            });
        }

        let stored = self.inner.docs.upsert(doc).await?;
        if stored.is_ephemeral() {
            self.inner.expiry_wakeup.notify_one();
        }

        // is the stored doc the new winner at its path?
        let at_path = self
            .inner
            .query(&Query::all().with_filter(QueryFilter {
                path: Some(stored.path.clone()),
                ..Default::default()
            }))
            .await?;
        let latest = at_path
            .iter()
            .all(|other| cmp_newest_first(&stored, other).is_le());

        trace!(path = %stored.path, latest, local_index = ?stored.local_index, "ingested");
        self.inner
            .events
            .emit(ReplicaEvent::Ingest {
                doc: stored.clone(),
                kind: if latest {
                    IngestKind::Success
                } else {
                    IngestKind::SuccessButNotLatest
                },
                source,
            })
            .await;
        Ok(IngestOutcome::Ingested {
            doc: stored,
            latest,
        })
    }

    /// Strip extras and run the format's validity check, pairing failures
    /// with the document for failure events.
    fn validate_for_ingest(
        &self,
        format: &dyn Format,
        doc: Document,
    ) -> Result<Document, (Document, ValidationError)> {
        if doc.format != format.tag() {
            let reason = ValidationError::new(format!(
                "document format {:?} does not match {:?}",
                doc.format,
                format.tag()
            ));
            return Err((doc, reason));
        }
        if doc.share != self.inner.share {
            let reason = ValidationError::new(format!(
                "document belongs to share {}, not {}",
                doc.share, self.inner.share
            ));
            return Err((doc, reason));
        }
        let (clean, _extras) = match format.remove_extra_fields(doc.clone()) {
            Ok(split) => split,
            Err(reason) => return Err((doc, reason)),
        };
        if let Err(reason) =
            format.check_document_is_valid(&*self.inner.crypto, &clean, now_microseconds())
        {
            return Err((clean, reason));
        }
        Ok(clean)
    }

    /// Stream attachment bytes into the replica for a document that
    /// declares them.
    ///
    /// Returns `true` if the bytes were committed, `false` if the attachment
    /// was already present (no side effects). Bytes whose hash or size do
    /// not match the document's declaration are rejected before commit.
    pub async fn ingest_attachment(
        &self,
        format: &dyn Format,
        doc: &Document,
        source: AttachmentInput,
        source_tag: IngestSource,
    ) -> Result<bool, ReplicaError> {
        self.check_open()?;
        if !format.supports_attachments() {
            return Err(ReplicaError::NotSupported(format!(
                "format {} does not support attachments",
                format.tag()
            )));
        }
        let info = format
            .attachment_info(doc)?
            .ok_or_else(|| ValidationError::new("document does not declare an attachment"))?;

        // already present: idempotent no-op, no staging work
        if self
            .inner
            .attachments
            .get_attachment(format.tag(), &info.hash)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        // hash while streaming, without holding the write lock
        let staged = self.inner.attachments.stage(format.tag(), source).await?;

        let _guard = self.inner.write_lock.lock().await;
        if self
            .inner
            .attachments
            .get_attachment(format.tag(), &info.hash)
            .await?
            .is_some()
        {
            staged.reject().await?;
            return Ok(false);
        }
        if staged.hash() != info.hash || staged.size() != info.size {
            let reason = ValidationError::new(format!(
                "attachment bytes do not match declaration: got {} ({} bytes), expected {} ({} bytes)",
                staged.hash(),
                staged.size(),
                info.hash,
                info.size,
            ));
            staged.reject().await?;
            return Err(reason.into());
        }
        staged.commit().await?;
        self.inner
            .events
            .emit(ReplicaEvent::AttachmentIngest {
                doc: doc.clone(),
                hash: info.hash,
                size: info.size,
                source: source_tag,
            })
            .await;
        Ok(true)
    }

    /// The attachment a document declares: its bytes if present, `None` if
    /// declared but not (yet) ingested.
    ///
    /// Fails with [`ReplicaError::NotSupported`] for formats without
    /// attachments, and with a validation error for documents that declare
    /// none.
    pub async fn get_attachment(
        &self,
        doc: &Document,
    ) -> Result<Option<Box<dyn Attachment>>, ReplicaError> {
        self.check_open()?;
        let format = format_by_tag(&doc.format)
            .ok_or_else(|| ValidationError::new(format!("unknown format {:?}", doc.format)))?;
        if !format.supports_attachments() {
            return Err(ReplicaError::NotSupported(format!(
                "format {} does not support attachments",
                format.tag()
            )));
        }
        let info = format
            .attachment_info(doc)?
            .ok_or_else(|| ValidationError::new("document does not declare an attachment"))?;
        Ok(self
            .inner
            .attachments
            .get_attachment(&doc.format, &info.hash)
            .await?)
    }

    /// Run a query.
    pub async fn query_docs(&self, query: &Query) -> Result<Vec<Document>, ReplicaError> {
        self.check_open()?;
        self.inner.query(query).await
    }

    /// Every version of every document.
    pub async fn get_all_docs(&self) -> Result<Vec<Document>, ReplicaError> {
        self.query_docs(&Query::all()).await
    }

    /// The latest document per path.
    pub async fn get_latest_docs(&self) -> Result<Vec<Document>, ReplicaError> {
        self.query_docs(&Query::latest()).await
    }

    /// Every version stored at one path, newest first.
    pub async fn get_all_docs_at_path(&self, path: &str) -> Result<Vec<Document>, ReplicaError> {
        self.query_docs(&Query::all().with_filter(QueryFilter {
            path: Some(path.to_string()),
            ..Default::default()
        }))
        .await
    }

    /// The winning document at one path, if any.
    pub async fn get_latest_doc_at_path(
        &self,
        path: &str,
    ) -> Result<Option<Document>, ReplicaError> {
        let mut docs = self
            .query_docs(&Query::latest().with_filter(QueryFilter {
                path: Some(path.to_string()),
                ..Default::default()
            }))
            .await?;
        Ok(docs.pop())
    }

    /// The distinct authors among the documents a query matches, sorted.
    pub async fn query_authors(&self, query: &Query) -> Result<Vec<String>, ReplicaError> {
        let docs = self.query_docs(query).await?;
        let mut authors: Vec<String> = docs.into_iter().map(|doc| doc.author).collect();
        authors.sort();
        authors.dedup();
        Ok(authors)
    }

    /// The distinct paths among the documents a query matches, sorted.
    pub async fn query_paths(&self, query: &Query) -> Result<Vec<String>, ReplicaError> {
        let docs = self.query_docs(query).await?;
        let mut paths: Vec<String> = docs.into_iter().map(|doc| doc.path).collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// The highest `_localIndex` the document driver has assigned, or `-1`.
    pub async fn max_local_index(&self) -> Result<i64, ReplicaError> {
        self.check_open()?;
        Ok(self.inner.docs.max_local_index().await?)
    }

    /// Wipe every document `keypair` has in this replica, leaving empty
    /// tombstones in place. Returns the number of documents wiped.
    pub async fn overwrite_all_docs_by_author(
        &self,
        keypair: &AuthorKeypair,
        format: &dyn Format,
    ) -> Result<usize, ReplicaError> {
        self.check_open()?;
        let docs = self
            .query_docs(&Query::all().with_filter(QueryFilter {
                author: Some(keypair.address.clone()),
                ..Default::default()
            }))
            .await?;
        let mut count = 0;
        for doc in docs {
            if doc.format != format.tag() {
                continue;
            }
            self.wipe_one(keypair, format, &doc).await?;
            count += 1;
        }
        debug!(author = %keypair.address, count, "overwrote all docs by author");
        Ok(count)
    }

    /// Wipe the document `keypair` has at `path`, erasing its attachment if
    /// nothing else references it.
    pub async fn wipe_doc_at_path(
        &self,
        keypair: &AuthorKeypair,
        path: &str,
    ) -> Result<IngestOutcome, ReplicaError> {
        self.check_open()?;
        let docs = self
            .query_docs(&Query::all().with_filter(QueryFilter {
                path: Some(path.to_string()),
                author: Some(keypair.address.clone()),
                ..Default::default()
            }))
            .await?;
        let doc = docs
            .into_iter()
            .next()
            .ok_or_else(|| ReplicaError::NotFound(format!("no doc by this author at {path}")))?;
        let format = format_by_tag(&doc.format)
            .ok_or_else(|| ValidationError::new(format!("unknown format {:?}", doc.format)))?;
        self.wipe_one(keypair, format, &doc).await
    }

    async fn wipe_one(
        &self,
        keypair: &AuthorKeypair,
        format: &dyn Format,
        doc: &Document,
    ) -> Result<IngestOutcome, ReplicaError> {
        let wiped =
            format.wipe_document(&*self.inner.crypto, keypair, doc, now_microseconds())?;
        let outcome = self.ingest(format, wiped, IngestSource::Local).await?;
        if doc.has_attachment() {
            self.inner.erase_if_orphaned(doc).await?;
        }
        Ok(outcome)
    }

    /// Erase every attachment no stored document references any more,
    /// returning the erased `(format, hash)` pairs.
    pub async fn prune_attachments(&self) -> Result<Vec<(String, String)>, ReplicaError> {
        self.check_open()?;
        self.inner.prune_unreferenced_attachments().await
    }
}

impl ReplicaInner {
    /// Canonicalise and run a query, short-circuiting impossible ones.
    async fn query(&self, query: &Query) -> Result<Vec<Document>, ReplicaError> {
        let (query, will_match) = clean_up_query(query);
        if will_match == WillMatch::Nothing {
            return Ok(Vec::new());
        }
        Ok(self.docs.query_docs(&query).await?)
    }

    /// The (format, hash) pairs referenced by any stored document.
    async fn referenced_attachments(&self) -> Result<Vec<(String, String)>, ReplicaError> {
        let docs = self.query(&Query::all()).await?;
        let mut referenced: Vec<(String, String)> = docs
            .into_iter()
            .filter_map(|doc| {
                let hash = doc.attachment_hash?;
                Some((doc.format, hash))
            })
            .collect();
        referenced.sort();
        referenced.dedup();
        Ok(referenced)
    }

    async fn prune_unreferenced_attachments(
        &self,
    ) -> Result<Vec<(String, String)>, ReplicaError> {
        let referenced = self.referenced_attachments().await?;
        let erased = self.attachments.filter(&referenced).await?;
        for (format, hash) in &erased {
            trace!(format, hash, "pruned attachment");
            self.events
                .emit(ReplicaEvent::AttachmentPrune {
                    format: format.clone(),
                    hash: hash.clone(),
                })
                .await;
        }
        Ok(erased)
    }

    /// Erase `doc`'s attachment unless some stored document still declares
    /// the same (format, hash).
    async fn erase_if_orphaned(&self, doc: &Document) -> Result<(), ReplicaError> {
        let Some(hash) = &doc.attachment_hash else {
            return Ok(());
        };
        let referenced = self.referenced_attachments().await?;
        if referenced.contains(&(doc.format.clone(), hash.clone())) {
            return Ok(());
        }
        if self.attachments.erase_attachment(&doc.format, hash).await? {
            self.events
                .emit(ReplicaEvent::AttachmentPrune {
                    format: doc.format.clone(),
                    hash: hash.clone(),
                })
                .await;
        }
        Ok(())
    }

    /// Erase expired docs and report them. Runs under the write lock.
    async fn sweep_expired(&self) -> Result<(), ReplicaError> {
        let _guard = self.write_lock.lock().await;
        let erased = self.docs.erase_expired_docs(now_microseconds()).await?;
        for doc in erased {
            debug!(path = %doc.path, "expired");
            self.events.emit(ReplicaEvent::Expire { doc }).await;
        }
        Ok(())
    }

    /// The earliest `deleteAfter` among live documents.
    async fn next_expiry(&self) -> Result<Option<Timestamp>, ReplicaError> {
        let docs = self.query(&Query::all()).await?;
        Ok(docs.into_iter().filter_map(|doc| doc.delete_after).min())
    }
}

/// Background sweeper: sleeps until the earliest known deadline, woken
/// early whenever an ephemeral document is ingested.
async fn expiry_loop(replica: Weak<ReplicaInner>, wakeup: Arc<Notify>) {
    loop {
        let deadline = {
            let Some(inner) = replica.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = inner.sweep_expired().await {
                warn!("expiry sweep failed: {err}");
            }
            match inner.next_expiry().await {
                Ok(deadline) => deadline,
                Err(err) => {
                    warn!("could not determine next expiry: {err}");
                    None
                }
            }
            // the Arc drops here so an abandoned replica can be freed
        };
        match deadline {
            None => wakeup.notified().await,
            Some(deadline) => {
                let now = now_microseconds();
                if deadline > now {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_micros(deadline - now)) => {}
                        _ = wakeup.notified() => {}
                    }
                }
            }
        }
    }
}
