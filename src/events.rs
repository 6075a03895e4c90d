use crate::doc::Doc;
use futures::channel::mpsc;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};

/// How an ingest attempt ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IngestKind {
    /// Stored, and now the latest document at its path.
    Success,
    /// Stored, but an even newer document holds the path.
    SuccessButNotLatest,
    /// Nothing stored; carries the reason, e.g. `obsolete_from_same_author`.
    Nothing {
        /// Why the document was skipped.
        reason: String,
    },
    /// The document failed validation.
    Failure {
        /// The failing rule.
        reason: String,
    },
}

/// A state change announced by a replica, in the order it became visible.
#[derive(Clone, Debug)]
pub enum ReplicaEvent {
    /// The replica is about to close; the last chance to query it.
    WillClose,
    /// The replica has closed; every later operation fails.
    DidClose,
    /// A document went through ingestion.
    Ingest {
        /// The document as stored (or as rejected).
        doc: Doc,
        /// How the attempt ended.
        kind: IngestKind,
        /// Where the document came from: `"local"` or a peer tag.
        source: String,
    },
    /// Attachment bytes were committed.
    AttachmentIngest {
        /// Format tag the bytes belong to.
        format: String,
        /// Base32 SHA-256 of the bytes.
        hash: String,
        /// Byte count.
        size: u64,
        /// Where the bytes came from.
        source: String,
    },
    /// An unreferenced attachment was garbage-collected.
    AttachmentPrune {
        /// Format tag the bytes belonged to.
        format: String,
        /// Base32 SHA-256 of the erased bytes.
        hash: String,
    },
    /// An ephemeral document passed its deadline and was erased.
    Expire {
        /// The erased document.
        doc: Doc,
    },
}

/// The named channels a subscriber can restrict itself to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventChannel {
    /// Only [`ReplicaEvent::WillClose`].
    WillClose,
    /// Only [`ReplicaEvent::DidClose`].
    DidClose,
    /// Only [`ReplicaEvent::Ingest`].
    Ingest,
    /// Only [`ReplicaEvent::AttachmentIngest`].
    AttachmentIngest,
    /// Only [`ReplicaEvent::AttachmentPrune`].
    AttachmentPrune,
    /// Only [`ReplicaEvent::Expire`].
    Expire,
}

impl ReplicaEvent {
    /// The channel this event belongs to.
    pub fn channel(&self) -> EventChannel {
        match self {
            ReplicaEvent::WillClose => EventChannel::WillClose,
            ReplicaEvent::DidClose => EventChannel::DidClose,
            ReplicaEvent::Ingest { .. } => EventChannel::Ingest,
            ReplicaEvent::AttachmentIngest { .. } => EventChannel::AttachmentIngest,
            ReplicaEvent::AttachmentPrune { .. } => EventChannel::AttachmentPrune,
            ReplicaEvent::Expire { .. } => EventChannel::Expire,
        }
    }
}

enum SubscriberTx {
    Unbounded(mpsc::UnboundedSender<ReplicaEvent>),
    Bounded(mpsc::Sender<ReplicaEvent>),
}

impl SubscriberTx {
    fn is_closed(&self) -> bool {
        match self {
            SubscriberTx::Unbounded(tx) => tx.is_closed(),
            SubscriberTx::Bounded(tx) => tx.is_closed(),
        }
    }

    fn send(&mut self, event: ReplicaEvent) {
        match self {
            SubscriberTx::Unbounded(tx) => {
                tx.unbounded_send(event).ok();
            }
            SubscriberTx::Bounded(tx) => {
                // A full buffer is the subscriber's chosen backpressure:
                // the event is dropped for that subscriber only.
                tx.try_send(event).ok();
            }
        }
    }
}

struct Subscriber {
    channel: Option<EventChannel>,
    tx: SubscriberTx,
}

/// Single-producer multi-consumer event fan-out for one replica.
#[derive(Default)]
pub(crate) struct EventFanout {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber with an unbounded buffer; `channel` restricts the
    /// events it sees.
    pub fn subscribe(&self, channel: Option<EventChannel>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(Subscriber {
            channel,
            tx: SubscriberTx::Unbounded(tx),
        });
        EventSubscription(SubscriptionRx::Unbounded(rx))
    }

    /// Adds a subscriber whose buffer holds at most `capacity` pending
    /// events; further events are dropped until it catches up.
    pub fn subscribe_bounded(
        &self,
        channel: Option<EventChannel>,
        capacity: usize,
    ) -> EventSubscription {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.lock().push(Subscriber {
            channel,
            tx: SubscriberTx::Bounded(tx),
        });
        EventSubscription(SubscriptionRx::Bounded(rx))
    }

    /// Delivers `event` to every live subscriber whose channel matches.
    ///
    /// The subscriber list is locked for the whole delivery, so a
    /// subscriber added concurrently sees only later events; dropped ones
    /// are pruned lazily. Sends never re-enter the replica, so holding the
    /// lock here is safe.
    pub fn emit(&self, event: ReplicaEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter_mut() {
            if subscriber.channel.map_or(true, |c| c == event.channel()) {
                subscriber.tx.send(event.clone());
            }
        }
    }
}

enum SubscriptionRx {
    Unbounded(mpsc::UnboundedReceiver<ReplicaEvent>),
    Bounded(mpsc::Receiver<ReplicaEvent>),
}

/// A live event feed from one replica. Dropping it unsubscribes.
pub struct EventSubscription(SubscriptionRx);

impl Stream for EventSubscription {
    type Item = ReplicaEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().0 {
            SubscriptionRx::Unbounded(rx) => Pin::new(rx).poll_next(cx),
            SubscriptionRx::Bounded(rx) => Pin::new(rx).poll_next(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[async_std::test]
    async fn subscribers_see_events_after_subscription() {
        let fanout = EventFanout::new();
        fanout.emit(ReplicaEvent::WillClose);
        let mut sub = fanout.subscribe(None);
        fanout.emit(ReplicaEvent::DidClose);
        let event = sub.next().await.unwrap();
        assert!(matches!(event, ReplicaEvent::DidClose));
    }

    #[async_std::test]
    async fn channel_filter() {
        let fanout = EventFanout::new();
        let mut sub = fanout.subscribe(Some(EventChannel::DidClose));
        fanout.emit(ReplicaEvent::WillClose);
        fanout.emit(ReplicaEvent::DidClose);
        let event = sub.next().await.unwrap();
        assert!(matches!(event, ReplicaEvent::DidClose));
    }

    #[async_std::test]
    async fn dropped_subscribers_are_pruned() {
        let fanout = EventFanout::new();
        let sub = fanout.subscribe(None);
        drop(sub);
        fanout.emit(ReplicaEvent::WillClose);
        assert_eq!(fanout.subscribers.lock().len(), 0);
    }

    #[async_std::test]
    async fn bounded_subscriber_drops_overflow() {
        let fanout = EventFanout::new();
        // Capacity 1 plus one guaranteed sender slot: room for two events.
        let mut sub = fanout.subscribe_bounded(None, 1);
        for _ in 0..5 {
            fanout.emit(ReplicaEvent::WillClose);
        }
        drop(fanout);
        let mut seen = 0;
        while sub.next().await.is_some() {
            seen += 1;
        }
        assert!(seen >= 1 && seen < 5);
    }
}
