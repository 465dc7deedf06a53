//! Peer-to-peer, offline-first, path-addressed document storage.
//!
//! The crate operates on [Replicas](Replica). A replica is the authoritative
//! local store of one *share*, a replication group named by a
//! [share address](crate::address). It holds signed [`Document`]s, each
//! identified by a path and the [author](AuthorKeypair) that wrote it, with
//! last-writer-wins conflict resolution per (path, author) and full history
//! retention per path.
//!
//! Documents are validated and signed by a pluggable [format](format::Format)
//! (`es.4` is text-only, `es.5` adds one content-addressed attachment per
//! document). Attachment bytes are stored separately from document records,
//! keyed by `(format, hash)`, and staged through an incremental hash check
//! before they become visible.
//!
//! Storage is abstracted behind two driver traits,
//! [`store::DocDriver`] and [`store::AttachmentDriver`]. The crate ships
//! in-memory drivers for both, a persistent document driver backed by
//! [`redb`], and a filesystem attachment driver that commits staged bytes by
//! atomic rename.
//!
//! Every ingested document gets a replica-local, strictly increasing
//! `_localIndex`, which is what a synchronizer uses to ask a peer for
//! "everything after N". State changes are reported on a typed
//! [event stream](events::ReplicaEvent) with per-subscriber backpressure.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod address;
pub mod cache;
pub mod crypto;
mod document;
mod error;
mod events;
pub mod format;
mod keys;
pub mod query;
mod replica;
pub mod store;

pub use self::document::*;
pub use self::error::*;
pub use self::events::*;
pub use self::keys::{author_pubkey_bytes, AuthorKeypair, ShareKeypair};
pub use self::replica::*;
