//! Typed replica events and their multi-subscriber fan-out.
//!
//! Events are emitted synchronously after the corresponding state change, so
//! a subscriber that subscribed before an operation observes that
//! operation's events in order. Each subscriber picks its own buffering:
//! unbounded, or bounded with backpressure applied to the emitter.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::document::Document;
use crate::error::ValidationError;

/// What an ingest attempt did.
#[derive(Debug, Clone)]
pub enum IngestKind {
    /// The document was stored and is the new latest at its path.
    Success,
    /// The document was stored but an other author's newer document still
    /// wins at its path.
    SuccessButNotLatest,
    /// Nothing was written.
    Nothing {
        /// Why the ingest was a no-op, e.g. `"obsolete_from_same_author"`.
        reason: &'static str,
    },
    /// The document was rejected; nothing was written.
    Failure {
        /// The failing rule.
        reason: ValidationError,
    },
}

/// Where an ingested document or attachment came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestSource {
    /// Written through this replica's own API.
    Local,
    /// Received from a peer during sync; carries the peer's tag.
    Sync(String),
}

/// An event emitted by a replica.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// The replica is about to close; this is the last chance to query it.
    WillClose,
    /// The replica has closed; drivers are shut down.
    DidClose {
        /// Whether backing storage was erased.
        erased: bool,
    },
    /// An ingest attempt finished.
    Ingest {
        /// The document that was offered.
        doc: Document,
        /// What happened to it.
        kind: IngestKind,
        /// Where it came from.
        source: IngestSource,
    },
    /// Attachment bytes were committed.
    AttachmentIngest {
        /// The document declaring the attachment.
        doc: Document,
        /// The attachment hash.
        hash: String,
        /// The attachment size in bytes.
        size: u64,
        /// Where the bytes came from.
        source: IngestSource,
    },
    /// An attachment no live document references was erased.
    AttachmentPrune {
        /// The format tag the attachment was stored under.
        format: String,
        /// The attachment hash.
        hash: String,
    },
    /// An ephemeral document passed its deadline and was erased.
    Expire {
        /// The erased document.
        doc: Document,
    },
}

/// Coarse grouping of events, for channel-scoped subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChannel {
    /// `WillClose` and `DidClose`.
    Lifecycle,
    /// Document ingest outcomes.
    Ingest,
    /// Attachment ingests and prunes.
    Attachment,
    /// Ephemeral document expiry.
    Expire,
}

impl ReplicaEvent {
    /// The channel this event belongs to.
    pub fn channel(&self) -> EventChannel {
        match self {
            ReplicaEvent::WillClose | ReplicaEvent::DidClose { .. } => EventChannel::Lifecycle,
            ReplicaEvent::Ingest { .. } => EventChannel::Ingest,
            ReplicaEvent::AttachmentIngest { .. } | ReplicaEvent::AttachmentPrune { .. } => {
                EventChannel::Attachment
            }
            ReplicaEvent::Expire { .. } => EventChannel::Expire,
        }
    }
}

#[derive(Debug)]
enum EventSender {
    Bounded(mpsc::Sender<ReplicaEvent>),
    Unbounded(mpsc::UnboundedSender<ReplicaEvent>),
}

#[derive(Debug)]
enum EventReceiver {
    Bounded(mpsc::Receiver<ReplicaEvent>),
    Unbounded(mpsc::UnboundedReceiver<ReplicaEvent>),
}

/// A live subscription to a replica's events.
///
/// Implements [`Stream`]; dropping it unsubscribes lazily, when the fan-out
/// notices the closed receiver on the next emit.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: EventReceiver,
}

impl EventSubscription {
    /// Receive the next event, or `None` once the replica closed the stream.
    pub async fn recv(&mut self) -> Option<ReplicaEvent> {
        match &mut self.receiver {
            EventReceiver::Bounded(rx) => rx.recv().await,
            EventReceiver::Unbounded(rx) => rx.recv().await,
        }
    }
}

impl Stream for EventSubscription {
    type Item = ReplicaEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.receiver {
            EventReceiver::Bounded(rx) => rx.poll_recv(cx),
            EventReceiver::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    channel: Option<EventChannel>,
    sender: EventSender,
}

/// Single-producer, multi-consumer event fan-out.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: parking_lot::Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Subscribe to all events, or only those of `channel`. `capacity`
    /// bounds the subscriber's buffer; a full bounded buffer applies
    /// backpressure to emitters.
    pub fn subscribe(
        &self,
        channel: Option<EventChannel>,
        capacity: Option<usize>,
    ) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = match capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
            }
        };
        self.subscribers.lock().push(Subscriber {
            id,
            channel,
            sender,
        });
        EventSubscription { receiver }
    }

    /// Deliver `event` to every interested subscriber.
    ///
    /// Iterates over a snapshot of the subscriber list so subscriptions
    /// created during emission do not observe the event that created them.
    /// Closed subscribers are removed lazily.
    pub async fn emit(&self, event: ReplicaEvent) {
        let channel = event.channel();
        let snapshot: Vec<(u64, Option<EventChannel>, EventSender)> = self
            .subscribers
            .lock()
            .iter()
            .map(|sub| {
                let sender = match &sub.sender {
                    EventSender::Bounded(tx) => EventSender::Bounded(tx.clone()),
                    EventSender::Unbounded(tx) => EventSender::Unbounded(tx.clone()),
                };
                (sub.id, sub.channel, sender)
            })
            .collect();

        let mut dead = Vec::new();
        for (id, sub_channel, sender) in snapshot {
            if matches!(sub_channel, Some(c) if c != channel) {
                continue;
            }
            let delivered = match sender {
                EventSender::Bounded(tx) => tx.send(event.clone()).await.is_ok(),
                EventSender::Unbounded(tx) => tx.send(event.clone()).is_ok(),
            };
            if !delivered {
                dead.push(id);
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .retain(|sub| !dead.contains(&sub.id));
        }
    }

    /// Drop all subscribers, ending their streams.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }
}
