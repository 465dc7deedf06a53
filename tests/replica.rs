//! End-to-end replica scenarios.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use earthstar::crypto::{default_crypto, CryptoProvider};
use earthstar::format::{Format, FormatEs5, ES5};
use earthstar::query::{Query, QueryFilter};
use earthstar::store::attachment_fs::AttachmentDriverFs;
use earthstar::store::fs::DocDriverFs;
use earthstar::store::memory::{AttachmentDriverMemory, DocDriverMemory};
use earthstar::{
    AuthorKeypair, IngestKind, IngestOutcome, IngestSource, Replica, ReplicaError, ReplicaEvent,
    ReplicaOpts, SetInput, ShareKeypair,
};

async fn open_memory_replica(share: &str) -> Result<Replica> {
    Ok(Replica::open(ReplicaOpts {
        share: share.to_string(),
        doc_driver: Arc::new(DocDriverMemory::new(share)),
        attachment_driver: Arc::new(AttachmentDriverMemory::new()),
        crypto: None,
    })
    .await?)
}

fn fresh_share(name: &str) -> String {
    ShareKeypair::generate(&*default_crypto(), name)
        .unwrap()
        .address
}

fn fresh_author(shortname: &str) -> AuthorKeypair {
    AuthorKeypair::generate(&*default_crypto(), shortname).unwrap()
}

fn ingested(outcome: &IngestOutcome) -> &earthstar::Document {
    match outcome {
        IngestOutcome::Ingested { doc, .. } => doc,
        IngestOutcome::Nothing { reason } => panic!("expected ingest, got no-op: {reason}"),
    }
}

#[tokio::test]
async fn signing_roundtrip() -> Result<()> {
    let crypto = default_crypto();
    let keypair = fresh_author("test");

    let secret = keypair.secret_bytes()?;
    let public = keypair.public_bytes()?;
    let sig = crypto.sign(&secret, b"abc");

    assert!(crypto.verify(&public, &sig, b"abc"));
    assert!(!crypto.verify(&public, &sig, b"abd"));
    assert!(!crypto.verify(&public, b"garbage", b"abc"));
    // deterministic
    assert_eq!(crypto.sign(&secret, b"aaa"), crypto.sign(&secret, b"aaa"));
    Ok(())
}

#[tokio::test]
async fn ingest_then_supersede_keeps_one_row() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let now = earthstar::now_microseconds();

    replica
        .set(&author, SetInput::new("/pathA", "v1").with_timestamp(now))
        .await?;
    replica
        .set(&author, SetInput::new("/pathA", "v2").with_timestamp(now + 5))
        .await?;

    let history = replica.get_all_docs_at_path("/pathA").await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "v2");

    // re-offering the superseded version is a no-op
    let v1_again = replica
        .set(&author, SetInput::new("/pathA", "v1").with_timestamp(now))
        .await?;
    assert!(matches!(v1_again, IngestOutcome::Nothing { .. }));
    Ok(())
}

#[tokio::test]
async fn two_authors_at_one_path() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let alice = fresh_author("alic");
    let bobo = fresh_author("bobo");
    let now = earthstar::now_microseconds();

    replica
        .set(&alice, SetInput::new("/pathA", "a").with_timestamp(now))
        .await?;
    replica
        .set(&bobo, SetInput::new("/pathA", "b").with_timestamp(now + 3))
        .await?;

    let latest = replica.get_latest_doc_at_path("/pathA").await?.unwrap();
    assert_eq!(latest.text, "b");

    let history = replica.get_all_docs_at_path("/pathA").await?;
    assert_eq!(history.len(), 2);
    // later first
    assert_eq!(history[0].text, "b");
    assert_eq!(history[1].text, "a");
    Ok(())
}

#[tokio::test]
async fn overwrite_all_docs_by_author() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let alice = fresh_author("alic");
    let bobo = fresh_author("bobo");
    let now = earthstar::now_microseconds();

    for (path, offset) in [("/one", 0), ("/two", 10)] {
        replica
            .set(&alice, SetInput::new(path, "by alice").with_timestamp(now + offset))
            .await?;
        replica
            .set(&bobo, SetInput::new(path, "by bob").with_timestamp(now + offset + 1))
            .await?;
    }

    let count = replica.overwrite_all_docs_by_author(&alice, &ES5).await?;
    assert_eq!(count, 2);

    let all = replica.get_all_docs().await?;
    assert_eq!(all.len(), 4);

    for path in ["/one", "/two"] {
        let history = replica.get_all_docs_at_path(path).await?;
        let alices = history
            .iter()
            .find(|doc| doc.author == alice.address)
            .unwrap();
        assert_eq!(alices.text, "");
        assert!(alices.timestamp > now + 10);
        let bobs = history
            .iter()
            .find(|doc| doc.author == bobo.address)
            .unwrap();
        assert_eq!(bobs.text, "by bob");
    }
    Ok(())
}

#[tokio::test]
async fn ephemeral_docs_expire() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let mut events = replica.subscribe();

    let now = earthstar::now_microseconds();
    replica
        .set(
            &author,
            SetInput::new("/x!", "short-lived").with_delete_after(now + 50_000),
        )
        .await?;

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert!(replica.get_latest_doc_at_path("/x!").await?.is_none());

    // the sweeper physically erases the row and reports it
    let expired = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(ReplicaEvent::Expire { doc }) => break doc,
                Some(_) => continue,
                None => panic!("event stream ended before expiry"),
            }
        }
    })
    .await?;
    assert_eq!(expired.path, "/x!");
    Ok(())
}

#[tokio::test]
async fn attachment_roundtrip_and_cross_replica_ingest() -> Result<()> {
    let share = fresh_share("files");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");

    let outcome = replica
        .set(
            &author,
            SetInput::new("/a.txt", "hello").with_attachment(Bytes::from_static(b"Hi!")),
        )
        .await?;
    let doc = ingested(&outcome).clone();
    assert_eq!(doc.attachment_size, Some(3));

    let attachment = replica.get_attachment(&doc).await?.unwrap();
    assert_eq!(attachment.bytes().await?, Bytes::from_static(b"Hi!"));

    // a second replica of the same share learns the doc first, bytes later
    let other = open_memory_replica(&share).await?;
    other
        .ingest(&ES5, doc.clone(), IngestSource::Sync("peer".into()))
        .await?;
    assert!(other.get_attachment(&doc).await?.is_none());

    let wrong = other
        .ingest_attachment(
            &ES5,
            &doc,
            Bytes::from_static(b"WRONG").into(),
            IngestSource::Sync("peer".into()),
        )
        .await;
    assert!(matches!(wrong, Err(ReplicaError::Validation(_))));
    assert!(other.get_attachment(&doc).await?.is_none());

    let first = other
        .ingest_attachment(
            &ES5,
            &doc,
            Bytes::from_static(b"Hi!").into(),
            IngestSource::Sync("peer".into()),
        )
        .await?;
    assert!(first);
    let again = other
        .ingest_attachment(
            &ES5,
            &doc,
            Bytes::from_static(b"Hi!").into(),
            IngestSource::Sync("peer".into()),
        )
        .await?;
    assert!(!again);

    let fetched = other.get_attachment(&doc).await?.unwrap();
    assert_eq!(fetched.bytes().await?, Bytes::from_static(b"Hi!"));
    Ok(())
}

#[tokio::test]
async fn local_index_is_strictly_increasing() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");

    let mut last = -1i64;
    for i in 0..5 {
        let outcome = replica
            .set(&author, SetInput::new(format!("/doc/{i}"), "x"))
            .await?;
        let index = ingested(&outcome).local_index.unwrap() as i64;
        assert!(index > last);
        last = index;
    }
    assert_eq!(replica.max_local_index().await?, last);
    Ok(())
}

#[tokio::test]
async fn wipe_doc_at_path_leaves_tombstone_and_prunes_attachment() -> Result<()> {
    let share = fresh_share("files");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");

    let outcome = replica
        .set(
            &author,
            SetInput::new("/photo", "pic").with_attachment(Bytes::from_static(b"JPEG")),
        )
        .await?;
    let doc = ingested(&outcome).clone();
    assert!(replica.get_attachment(&doc).await?.is_some());

    replica.wipe_doc_at_path(&author, "/photo").await?;

    let latest = replica.get_latest_doc_at_path("/photo").await?.unwrap();
    assert_eq!(latest.text, "");
    assert!(latest.timestamp > doc.timestamp);
    assert_eq!(latest.attachment_hash, None);

    // the old doc's attachment is orphaned and gone
    assert!(replica.get_attachment(&doc).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn event_stream_reports_ingests_in_order() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let mut events = replica.subscribe();

    replica.set(&author, SetInput::new("/a", "one")).await?;
    replica.set(&author, SetInput::new("/a", "two")).await?;

    match events.recv().await.unwrap() {
        ReplicaEvent::Ingest { doc, kind, source } => {
            assert_eq!(doc.text, "one");
            assert!(matches!(kind, IngestKind::Success));
            assert_eq!(source, IngestSource::Local);
        }
        other => panic!("unexpected event {other:?}"),
    }
    match events.recv().await.unwrap() {
        ReplicaEvent::Ingest { doc, kind, .. } => {
            assert_eq!(doc.text, "two");
            assert!(matches!(kind, IngestKind::Success));
        }
        other => panic!("unexpected event {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn rejected_docs_emit_failure_events() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let mut events = replica.subscribe();

    let outcome = replica
        .set(&author, SetInput::new("/a", "good"))
        .await?;
    let mut forged = ingested(&outcome).clone();
    forged.text = "tampered".to_string();
    forged.timestamp += 10;

    let err = replica
        .ingest(&ES5, forged, IngestSource::Sync("peer".into()))
        .await;
    assert!(matches!(err, Err(ReplicaError::Validation(_))));

    // skip the successful set event, then expect the failure
    events.recv().await.unwrap();
    match events.recv().await.unwrap() {
        ReplicaEvent::Ingest { kind, .. } => {
            assert!(matches!(kind, IngestKind::Failure { .. }))
        }
        other => panic!("unexpected event {other:?}"),
    }

    // nothing was persisted
    let history = replica.get_all_docs_at_path("/a").await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "good");
    Ok(())
}

#[tokio::test]
async fn close_is_terminal_and_emits_lifecycle_events() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let mut events = replica.subscribe();

    replica.close(false).await?;
    assert!(replica.is_closed());
    assert!(matches!(
        events.recv().await,
        Some(ReplicaEvent::WillClose)
    ));
    assert!(matches!(
        events.recv().await,
        Some(ReplicaEvent::DidClose { erased: false })
    ));
    assert!(events.recv().await.is_none());

    assert!(matches!(
        replica.set(&author, SetInput::new("/a", "x")).await,
        Err(ReplicaError::ReplicaIsClosed)
    ));
    assert!(matches!(
        replica.get_all_docs().await,
        Err(ReplicaError::ReplicaIsClosed)
    ));
    assert!(matches!(
        replica.close(false).await,
        Err(ReplicaError::ReplicaIsClosed)
    ));
    Ok(())
}

#[tokio::test]
async fn persistent_replica_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("docs.redb");
    let blob_path = dir.path().join("attachments");
    let share = fresh_share("disk");
    let author = fresh_author("suza");

    let doc = {
        let replica = Replica::open(ReplicaOpts {
            share: share.clone(),
            doc_driver: Arc::new(DocDriverFs::new(&db_path)?),
            attachment_driver: Arc::new(AttachmentDriverFs::new(&blob_path)?),
            crypto: None,
        })
        .await?;
        let outcome = replica
            .set(
                &author,
                SetInput::new("/notes/today", "persistent")
                    .with_attachment(Bytes::from_static(b"some bytes")),
            )
            .await?;
        let doc = ingested(&outcome).clone();
        replica.close(false).await?;
        doc
    };

    let replica = Replica::open(ReplicaOpts {
        share: share.clone(),
        doc_driver: Arc::new(DocDriverFs::new(&db_path)?),
        attachment_driver: Arc::new(AttachmentDriverFs::new(&blob_path)?),
        crypto: None,
    })
    .await?;
    let loaded = replica.get_latest_doc_at_path("/notes/today").await?.unwrap();
    assert_eq!(loaded.text, "persistent");
    let attachment = replica.get_attachment(&loaded).await?.unwrap();
    assert_eq!(attachment.bytes().await?, Bytes::from_static(b"some bytes"));
    drop(doc);

    // reopening under a different share is a fatal mismatch
    replica.close(false).await?;
    let err = Replica::open(ReplicaOpts {
        share: fresh_share("disk"),
        doc_driver: Arc::new(DocDriverFs::new(&db_path)?),
        attachment_driver: Arc::new(AttachmentDriverFs::new(&blob_path)?),
        crypto: None,
    })
    .await;
    assert!(matches!(err, Err(ReplicaError::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn owned_paths_reject_other_authors() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let alice = fresh_author("alic");
    let bobo = fresh_author("bobo");

    let owned_path = format!("/about/~{}/bio", alice.address);
    replica
        .set(&alice, SetInput::new(owned_path.clone(), "me"))
        .await?;

    let err = replica
        .set(&bobo, SetInput::new(owned_path.clone(), "graffiti"))
        .await;
    assert!(matches!(err, Err(ReplicaError::Validation(_))));

    let latest = replica.get_latest_doc_at_path(&owned_path).await?.unwrap();
    assert_eq!(latest.text, "me");
    Ok(())
}

#[tokio::test]
async fn query_authors_and_paths() -> Result<()> {
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let alice = fresh_author("alic");
    let bobo = fresh_author("bobo");

    replica.set(&alice, SetInput::new("/blog/one", "1")).await?;
    replica.set(&bobo, SetInput::new("/blog/two", "2")).await?;
    replica.set(&alice, SetInput::new("/wiki/home", "3")).await?;

    let mut expected_authors = vec![alice.address.clone(), bobo.address.clone()];
    expected_authors.sort();
    assert_eq!(replica.query_authors(&Query::all()).await?, expected_authors);

    let blog_paths = replica
        .query_paths(&Query::all().with_filter(QueryFilter {
            path_starts_with: Some("/blog/".into()),
            ..Default::default()
        }))
        .await?;
    assert_eq!(blog_paths, vec!["/blog/one".to_string(), "/blog/two".to_string()]);
    Ok(())
}

#[tokio::test]
async fn reused_attachments_are_not_restored() -> Result<()> {
    let share = fresh_share("files");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");
    let mut events = replica.subscribe();

    replica
        .set(
            &author,
            SetInput::new("/one", "first").with_attachment(Bytes::from_static(b"shared")),
        )
        .await?;
    replica
        .set(
            &author,
            SetInput::new("/two", "second").with_attachment(Bytes::from_static(b"shared")),
        )
        .await?;

    // four events: two ingests, but only one attachment ingest
    let mut attachment_ingests = 0;
    for _ in 0..3 {
        if let Some(ReplicaEvent::AttachmentIngest { .. }) = events.recv().await {
            attachment_ingests += 1;
        }
    }
    assert_eq!(attachment_ingests, 1);
    Ok(())
}

#[tokio::test]
async fn format_objects_are_interchangeable() -> Result<()> {
    // formats are stateless values; a caller may hold its own
    let format = FormatEs5;
    let share = fresh_share("test");
    let replica = open_memory_replica(&share).await?;
    let author = fresh_author("suza");

    let outcome = replica
        .set(
            &author,
            SetInput::new("/a", "via default format"),
        )
        .await?;
    let doc = ingested(&outcome).clone();
    assert_eq!(doc.format, format.tag());
    Ok(())
}
