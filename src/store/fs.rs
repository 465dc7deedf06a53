//! On-disk document storage, backed by [`redb`].
//!
//! The whole driver lives in a single database file. Documents are stored as
//! JSON under a (path, author, format) key, with secondary tables indexing
//! rows by local index and by expiry deadline, and a `config` table carrying
//! the share address and schema version.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, trace};

use crate::document::{now_microseconds, Document, Timestamp};
use crate::error::StorageError;
use crate::query::{execute_query, Query};
use crate::store::{DocDriver, CONFIG_SHARE};

/// (path, author, format) -> JSON document
const DOCS_TABLE: TableDefinition<(&str, &str, &str), &[u8]> = TableDefinition::new("docs-v1");

/// local index -> (path, author, format)
const BY_LOCAL_INDEX_TABLE: TableDefinition<u64, (&str, &str, &str)> =
    TableDefinition::new("docs-by-local-index-v1");

/// (deleteAfter, path, author, format) -> ()
const BY_EXPIRY_TABLE: TableDefinition<(u64, &str, &str, &str), ()> =
    TableDefinition::new("docs-by-expiry-v1");

/// config key -> value
const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config-v1");

/// driver-internal counters, currently just "maxLocalIndex"
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta-v1");

const META_MAX_LOCAL_INDEX: &str = "maxLocalIndex";

fn db_err(err: impl std::error::Error + Send + Sync + 'static) -> StorageError {
    StorageError::Database(anyhow::Error::new(err))
}

fn encode_doc(doc: &Document) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(doc).map_err(db_err)
}

fn decode_doc(bytes: &[u8]) -> Result<Document, StorageError> {
    serde_json::from_slice(bytes).map_err(db_err)
}

/// A persistent [`DocDriver`] holding one share's documents in a single
/// redb file.
#[derive(Debug)]
pub struct DocDriverFs {
    path: PathBuf,
    db: Mutex<Option<Database>>,
    share: Mutex<Option<String>>,
}

impl DocDriverFs {
    /// Create or open the database at `path`.
    ///
    /// A fresh database starts without a share; an existing one hands its
    /// persisted share to [`DocDriver::share`] so the replica can detect
    /// mismatches at open time.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(db_err)?;

        let write_tx = db.begin_write().map_err(db_err)?;
        {
            let _ = write_tx.open_table(DOCS_TABLE).map_err(db_err)?;
            let _ = write_tx.open_table(BY_LOCAL_INDEX_TABLE).map_err(db_err)?;
            let _ = write_tx.open_table(BY_EXPIRY_TABLE).map_err(db_err)?;
            let _ = write_tx.open_table(CONFIG_TABLE).map_err(db_err)?;
            let _ = write_tx.open_table(META_TABLE).map_err(db_err)?;
        }
        write_tx.commit().map_err(db_err)?;

        let share = {
            let read_tx = db.begin_read().map_err(db_err)?;
            let config = read_tx.open_table(CONFIG_TABLE).map_err(db_err)?;
            config
                .get(CONFIG_SHARE)
                .map_err(db_err)?
                .map(|guard| guard.value().to_string())
        };
        debug!(path = %path.display(), ?share, "opened doc driver");

        Ok(DocDriverFs {
            path,
            db: Mutex::new(Some(db)),
            share: Mutex::new(share),
        })
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let guard = self.db.lock();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StorageError::Closed),
        }
    }
}

#[async_trait]
impl DocDriver for DocDriverFs {
    fn share(&self) -> Option<String> {
        self.share.lock().clone()
    }

    fn is_closed(&self) -> bool {
        self.db.lock().is_none()
    }

    async fn close(&self, erase: bool) -> Result<(), StorageError> {
        let db = self.db.lock().take();
        match db {
            None => Err(StorageError::AlreadyClosed),
            Some(db) => {
                drop(db);
                if erase {
                    std::fs::remove_file(&self.path)?;
                }
                Ok(())
            }
        }
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_err)?;
            let config = tx.open_table(CONFIG_TABLE).map_err(db_err)?;
            Ok(config
                .get(key)
                .map_err(db_err)?
                .map(|guard| guard.value().to_string()))
        })
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(db_err)?;
            {
                let mut config = tx.open_table(CONFIG_TABLE).map_err(db_err)?;
                config.insert(key, value).map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })?;
        if key == CONFIG_SHARE {
            *self.share.lock() = Some(value.to_string());
        }
        Ok(())
    }

    async fn delete_config(&self, key: &str) -> Result<bool, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(db_err)?;
            let existed = {
                let mut config = tx.open_table(CONFIG_TABLE).map_err(db_err)?;
                let removed = config.remove(key).map_err(db_err)?.is_some();
                removed
            };
            tx.commit().map_err(db_err)?;
            Ok(existed)
        })
    }

    async fn list_config_keys(&self) -> Result<Vec<String>, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_err)?;
            let config = tx.open_table(CONFIG_TABLE).map_err(db_err)?;
            let mut keys = Vec::new();
            for item in config.iter().map_err(db_err)? {
                let (key, _) = item.map_err(db_err)?;
                keys.push(key.value().to_string());
            }
            Ok(keys)
        })
    }

    async fn max_local_index(&self) -> Result<i64, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_read().map_err(db_err)?;
            let meta = tx.open_table(META_TABLE).map_err(db_err)?;
            Ok(meta
                .get(META_MAX_LOCAL_INDEX)
                .map_err(db_err)?
                .map(|guard| guard.value() as i64)
                .unwrap_or(-1))
        })
    }

    async fn query_docs(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        let docs = self.with_db(|db| {
            let tx = db.begin_read().map_err(db_err)?;
            let table = tx.open_table(DOCS_TABLE).map_err(db_err)?;
            let mut docs = Vec::new();
            for item in table.iter().map_err(db_err)? {
                let (_, value) = item.map_err(db_err)?;
                docs.push(decode_doc(value.value())?);
            }
            Ok(docs)
        })?;
        execute_query(docs, query, now_microseconds())
            .map_err(|err| StorageError::Database(anyhow::anyhow!(err)))
    }

    async fn upsert(&self, mut doc: Document) -> Result<Document, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(db_err)?;
            {
                let mut docs = tx.open_table(DOCS_TABLE).map_err(db_err)?;
                let mut by_index = tx.open_table(BY_LOCAL_INDEX_TABLE).map_err(db_err)?;
                let mut by_expiry = tx.open_table(BY_EXPIRY_TABLE).map_err(db_err)?;
                let mut meta = tx.open_table(META_TABLE).map_err(db_err)?;

                let (path, author, format) =
                    (doc.path.clone(), doc.author.clone(), doc.format.clone());
                let key = (path.as_str(), author.as_str(), format.as_str());

                // drop the superseded row's index entries
                let old = docs
                    .get(key)
                    .map_err(db_err)?
                    .map(|guard| decode_doc(guard.value()))
                    .transpose()?;
                if let Some(old) = old {
                    if let Some(old_index) = old.local_index {
                        by_index.remove(old_index).map_err(db_err)?;
                    }
                    if let Some(old_expiry) = old.delete_after {
                        by_expiry
                            .remove((old_expiry, key.0, key.1, key.2))
                            .map_err(db_err)?;
                    }
                }

                let next_index = meta
                    .get(META_MAX_LOCAL_INDEX)
                    .map_err(db_err)?
                    .map(|guard| guard.value() + 1)
                    .unwrap_or(0);
                doc.local_index = Some(next_index);
                meta.insert(META_MAX_LOCAL_INDEX, next_index)
                    .map_err(db_err)?;

                docs.insert(key, encode_doc(&doc)?.as_slice())
                    .map_err(db_err)?;
                by_index.insert(next_index, key).map_err(db_err)?;
                if let Some(delete_after) = doc.delete_after {
                    by_expiry
                        .insert((delete_after, key.0, key.1, key.2), ())
                        .map_err(db_err)?;
                }
                trace!(path = %doc.path, local_index = next_index, "upsert");
            }
            tx.commit().map_err(db_err)?;
            Ok(doc)
        })
    }

    async fn erase_expired_docs(&self, now: Timestamp) -> Result<Vec<Document>, StorageError> {
        self.with_db(|db| {
            let tx = db.begin_write().map_err(db_err)?;
            let mut erased = Vec::new();
            {
                let mut docs = tx.open_table(DOCS_TABLE).map_err(db_err)?;
                let mut by_index = tx.open_table(BY_LOCAL_INDEX_TABLE).map_err(db_err)?;
                let mut by_expiry = tx.open_table(BY_EXPIRY_TABLE).map_err(db_err)?;

                let mut expired: Vec<(u64, String, String, String)> = Vec::new();
                for item in by_expiry.iter().map_err(db_err)? {
                    let (key, _) = item.map_err(db_err)?;
                    let (deadline, path, author, format) = key.value();
                    if deadline > now {
                        break;
                    }
                    expired.push((
                        deadline,
                        path.to_string(),
                        author.to_string(),
                        format.to_string(),
                    ));
                }

                for (deadline, path, author, format) in expired {
                    let key = (path.as_str(), author.as_str(), format.as_str());
                    if let Some(guard) = docs.remove(key).map_err(db_err)? {
                        let doc = decode_doc(guard.value())?;
                        if let Some(index) = doc.local_index {
                            by_index.remove(index).map_err(db_err)?;
                        }
                        erased.push(doc);
                    }
                    by_expiry
                        .remove((deadline, key.0, key.1, key.2))
                        .map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)?;
            Ok(erased)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::MIN_TIMESTAMP;

    fn doc(path: &str, author: &str, timestamp: Timestamp) -> Document {
        Document {
            format: "es.5".to_string(),
            author: author.to_string(),
            path: path.to_string(),
            share: "+test.bxxx".to_string(),
            timestamp,
            delete_after: None,
            signature: format!("bsig{timestamp}"),
            text: "hello".to_string(),
            text_hash: "bhash".to_string(),
            attachment_size: None,
            attachment_hash: None,
            local_index: None,
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn persists_across_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("docs.redb");

        {
            let driver = DocDriverFs::new(&db_path)?;
            driver.set_config(CONFIG_SHARE, "+test.bxxx").await?;
            driver.upsert(doc("/a", "@suzy.bxxx", MIN_TIMESTAMP + 1)).await?;
            driver.close(false).await?;
        }

        let driver = DocDriverFs::new(&db_path)?;
        assert_eq!(driver.share(), Some("+test.bxxx".to_string()));
        assert_eq!(driver.max_local_index().await?, 0);
        let docs = driver.query_docs(&Query::all()).await?;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "/a");
        assert_eq!(docs[0].local_index, Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn upsert_overwrites_and_reindexes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = DocDriverFs::new(dir.path().join("docs.redb"))?;

        driver.upsert(doc("/a", "@suzy.bxxx", MIN_TIMESTAMP + 1)).await?;
        driver.upsert(doc("/b", "@suzy.bxxx", MIN_TIMESTAMP + 2)).await?;
        let newer = driver.upsert(doc("/a", "@suzy.bxxx", MIN_TIMESTAMP + 3)).await?;
        assert_eq!(newer.local_index, Some(2));

        let docs = driver.query_docs(&Query::all()).await?;
        assert_eq!(docs.len(), 2);
        assert_eq!(driver.max_local_index().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn expiry_sweep_uses_the_index() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = DocDriverFs::new(dir.path().join("docs.redb"))?;

        let mut soon = doc("/soon!", "@suzy.bxxx", MIN_TIMESTAMP + 1);
        soon.delete_after = Some(MIN_TIMESTAMP + 10);
        let mut later = doc("/later!", "@suzy.bxxx", MIN_TIMESTAMP + 1);
        later.delete_after = Some(MIN_TIMESTAMP + 1_000);
        driver.upsert(soon).await?;
        driver.upsert(later).await?;

        let erased = driver.erase_expired_docs(MIN_TIMESTAMP + 10).await?;
        assert_eq!(erased.len(), 1);
        assert_eq!(erased[0].path, "/soon!");
        let left = driver.query_docs(&Query::all()).await?;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, "/later!");
        Ok(())
    }

    #[tokio::test]
    async fn close_with_erase_removes_the_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("docs.redb");
        let driver = DocDriverFs::new(&db_path)?;
        driver.upsert(doc("/a", "@suzy.bxxx", MIN_TIMESTAMP + 1)).await?;
        driver.close(true).await?;
        assert!(!db_path.exists());
        assert!(matches!(
            driver.close(false).await,
            Err(StorageError::AlreadyClosed)
        ));
        Ok(())
    }
}
