//! Subscription handles.
//!
//! A [`Subscription`] is the application's view of one topic membership: a
//! bounded inbox of messages plus a cancellation signal back to the router.
//! The inbox closing is the sole indication that the subscription has
//! terminated, whether by an explicit [`Subscription::cancel`] or by router
//! shutdown.

use tokio::sync::mpsc;
use tracing::trace;

use crate::wire::Message;

/// Capacity of a subscription's inbox. Deliveries beyond this are dropped;
/// the application is expected to drain faster than the topic floods.
pub(crate) const INBOX_CAPACITY: usize = 32;

/// Cancellation request sent to the router when a handle is cancelled or
/// dropped.
pub(crate) struct SubCancel {
    pub topic: String,
    pub id: u64,
}

/// A live subscription to one topic.
pub struct Subscription {
    topic: String,
    id: u64,
    inbox: mpsc::Receiver<Message>,
    cancel_tx: mpsc::UnboundedSender<SubCancel>,
    cancelled: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(
        topic: String,
        id: u64,
        inbox: mpsc::Receiver<Message>,
        cancel_tx: mpsc::UnboundedSender<SubCancel>,
    ) -> Self {
        Subscription {
            topic,
            id,
            inbox,
            cancel_tx,
            cancelled: false,
        }
    }

    /// The topic this handle is subscribed to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the subscription has terminated.
    ///
    /// A few messages already in flight may still be yielded after
    /// [`Subscription::cancel`].
    pub async fn next(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }

    /// Request termination. Non-blocking and idempotent; the router closes
    /// the inbox and, if this was the topic's last local subscriber,
    /// announces the unsubscribe to every peer.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        trace!(topic = %self.topic, sub = self.id, "subscription cancel requested");
        let _ = self.cancel_tx.send(SubCancel {
            topic: self.topic.clone(),
            id: self.id,
        });
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
