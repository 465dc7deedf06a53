//! Memoized queries over a replica.
//!
//! A [`ReplicaCache`] remembers query results until the next event that
//! could change them, so UIs re-rendering the same queries do not hit the
//! drivers every time. Invalidation is coarse: any ingest, expiry or prune
//! clears the whole cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::document::Document;
use crate::error::ReplicaError;
use crate::events::ReplicaEvent;
use crate::query::{clean_up_query, Query, QueryFilter, WillMatch};
use crate::replica::Replica;

type QueryResults = Arc<Mutex<HashMap<String, Vec<Document>>>>;

/// A query cache for one [`Replica`], invalidated by its event stream.
#[derive(Debug)]
pub struct ReplicaCache {
    replica: Replica,
    results: QueryResults,
    closed: AtomicBool,
    invalidation_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplicaCache {
    /// Create a cache over `replica` and start listening for invalidating
    /// events.
    pub fn new(replica: Replica) -> Self {
        let results: QueryResults = Default::default();
        let weak_results = Arc::downgrade(&results);
        let mut subscription = replica.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let invalidates = matches!(
                    event,
                    ReplicaEvent::Ingest { .. }
                        | ReplicaEvent::Expire { .. }
                        | ReplicaEvent::AttachmentPrune { .. }
                );
                if !invalidates {
                    continue;
                }
                match weak_results.upgrade() {
                    Some(results) => {
                        trace!("invalidating query cache");
                        results.lock().clear();
                    }
                    None => break,
                }
            }
        });
        ReplicaCache {
            replica,
            results,
            closed: AtomicBool::new(false),
            invalidation_task: Mutex::new(Some(task)),
        }
    }

    /// The replica this cache reads from.
    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop caching. The underlying replica stays open.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.invalidation_task.lock().take() {
            task.abort();
        }
        self.results.lock().clear();
    }

    /// Run a query, memoized until the next invalidating event.
    pub async fn query_docs(&self, query: &Query) -> Result<Vec<Document>, ReplicaError> {
        if self.is_closed() {
            return Err(ReplicaError::ReplicaCacheIsClosed);
        }
        let (canonical, will_match) = clean_up_query(query);
        if will_match == WillMatch::Nothing {
            return Ok(Vec::new());
        }
        let key = serde_json::to_string(&canonical)
            .map_err(|err| ReplicaError::NotSupported(format!("unserializable query: {err}")))?;

        if let Some(docs) = self.results.lock().get(&key) {
            return Ok(docs.clone());
        }
        let docs = self.replica.query_docs(&canonical).await?;
        self.results.lock().insert(key, docs.clone());
        Ok(docs)
    }

    /// Memoized version of [`Replica::get_latest_docs`].
    pub async fn get_latest_docs(&self) -> Result<Vec<Document>, ReplicaError> {
        self.query_docs(&Query::latest()).await
    }

    /// Memoized version of [`Replica::get_latest_doc_at_path`].
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
}
