//! Subscription broker: id allocation, per-subscription routing, and
//! destination-level broadcast dedup.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::StompError;
use crate::frame::Frame;

/// Allocate the next `sub-<n>` identifier. Strictly increasing, never
/// reused for the owning connection's lifetime.
pub(crate) fn next_subscription_id(counter: &AtomicU64) -> String {
    format!("sub-{}", counter.fetch_add(1, Ordering::SeqCst))
}

/// Routing table for one connection. Mutated only from the command path
/// and the single dispatch task, under the connection's registry lock.
pub(crate) struct Registry {
    routes: HashMap<String, Route>,
    /// destination -> broadcast subscription id
    by_destination: HashMap<String, String>,
}

enum Route {
    Exclusive(mpsc::Sender<Message>),
    Broadcast {
        destination: String,
        next_token: u64,
        /// Fan-out targets in registration order.
        listeners: Vec<(u64, mpsc::Sender<Message>)>,
    },
}

pub(crate) struct BroadcastAttach {
    pub(crate) id: String,
    pub(crate) token: u64,
    /// True when this attach created the entry and a wire SUBSCRIBE is due.
    pub(crate) created: bool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            routes: HashMap::new(),
            by_destination: HashMap::new(),
        }
    }

    pub(crate) fn insert_exclusive(&mut self, id: String, sender: mpsc::Sender<Message>) {
        self.routes.insert(id, Route::Exclusive(sender));
    }

    /// Attach a listener for `destination`, creating the broadcast entry on
    /// first use. Dedup key is the exact destination string.
    pub(crate) fn attach_broadcast(
        &mut self,
        destination: &str,
        sender: mpsc::Sender<Message>,
        counter: &AtomicU64,
    ) -> BroadcastAttach {
        if let Some(id) = self.by_destination.get(destination).cloned()
            && let Some(Route::Broadcast {
                next_token,
                listeners,
                ..
            }) = self.routes.get_mut(&id)
        {
            let token = *next_token;
            *next_token += 1;
            listeners.push((token, sender));
            return BroadcastAttach {
                id,
                token,
                created: false,
            };
        }

        let id = next_subscription_id(counter);
        self.by_destination
            .insert(destination.to_string(), id.clone());
        self.routes.insert(
            id.clone(),
            Route::Broadcast {
                destination: destination.to_string(),
                next_token: 1,
                listeners: vec![(0, sender)],
            },
        );
        BroadcastAttach {
            id,
            token: 0,
            created: true,
        }
    }

    /// Remove an exclusive route. True when the id was registered and a
    /// wire UNSUBSCRIBE is due.
    pub(crate) fn remove_exclusive(&mut self, id: &str) -> bool {
        matches!(self.routes.remove(id), Some(Route::Exclusive(_)))
    }

    /// Detach one broadcast listener. True when it was the last one and a
    /// wire UNSUBSCRIBE is due.
    pub(crate) fn detach_broadcast(&mut self, id: &str, token: u64) -> bool {
        let Some(Route::Broadcast {
            destination,
            listeners,
            ..
        }) = self.routes.get_mut(id)
        else {
            return false;
        };
        listeners.retain(|(t, _)| *t != token);
        if !listeners.is_empty() {
            return false;
        }
        let destination = destination.clone();
        self.routes.remove(id);
        self.by_destination.remove(&destination);
        true
    }

    /// Route a message by subscription id.
    pub(crate) fn deliver(&mut self, id: &str, message: Message) -> Delivery {
        match self.routes.get(id) {
            Some(Route::Exclusive(sender)) => match sender.try_send(message) {
                Ok(()) => Delivery::Routed,
                Err(mpsc::error::TrySendError::Full(_)) => Delivery::Backlogged,
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoRoute,
            },
            Some(Route::Broadcast { listeners, .. }) => {
                let mut routed = false;
                let mut backlogged = false;
                for (_, sender) in listeners {
                    match sender.try_send(message.clone()) {
                        Ok(()) => routed = true,
                        Err(mpsc::error::TrySendError::Full(_)) => backlogged = true,
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
                if routed {
                    Delivery::Routed
                } else if backlogged {
                    Delivery::Backlogged
                } else {
                    Delivery::NoRoute
                }
            }
            None => Delivery::NoRoute,
        }
    }
}

/// What became of one inbound MESSAGE.
pub(crate) enum Delivery {
    /// At least one listener took it.
    Routed,
    /// A route exists but every listener's buffer was full; the message
    /// was dropped.
    Backlogged,
    /// Nothing is listening on the id.
    NoRoute,
}

/// An inbound MESSAGE frame carrying the capability to acknowledge or
/// negate itself against the connection it arrived on.
#[derive(Clone)]
pub struct Message {
    pub frame: Frame,
    subscription: String,
    ack_id: Option<String>,
    conn: Connection,
}

impl Message {
    pub(crate) fn new(
        frame: Frame,
        subscription: String,
        ack_id: Option<String>,
        conn: Connection,
    ) -> Self {
        Self {
            frame,
            subscription,
            ack_id,
            conn,
        }
    }

    /// The subscription id this message was routed by.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn destination(&self) -> Option<&str> {
        self.frame.get_header("destination")
    }

    pub fn body(&self) -> &[u8] {
        &self.frame.body
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Acknowledge this message. Uses the `ack` header value on STOMP 1.2
    /// connections and `message-id` on earlier versions.
    pub async fn ack(&self) -> Result<(), StompError> {
        self.conn.ack(self.require_ack_id()?, &self.subscription).await
    }

    /// Negative-acknowledge this message.
    pub async fn nack(&self) -> Result<(), StompError> {
        self.conn.nack(self.require_ack_id()?, &self.subscription).await
    }

    fn require_ack_id(&self) -> Result<&str, StompError> {
        self.ack_id
            .as_deref()
            .ok_or_else(|| StompError::Decode("MESSAGE frame carries no acknowledgment id".into()))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum SubscriptionKind {
    Exclusive,
    Broadcast { token: u64 },
}

/// Handle for one logical subscription. Yields [`Message`]s; tearing it
/// down (explicit [`unsubscribe`](Subscription::unsubscribe) or drop)
/// sends the wire UNSUBSCRIBE once no listener is left on its id.
pub struct Subscription {
    id: String,
    destination: String,
    receiver: mpsc::Receiver<Message>,
    conn: Connection,
    kind: SubscriptionKind,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        destination: String,
        receiver: mpsc::Receiver<Message>,
        conn: Connection,
        kind: SubscriptionKind,
    ) -> Self {
        Self {
            id,
            destination,
            receiver,
            conn,
            kind,
            released: false,
        }
    }

    /// The wire-level subscription id (`sub-<n>`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next message, or `None` after the connection is gone.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Tear down this subscription, sending the wire UNSUBSCRIBE if this
    /// was the last listener on its id.
    pub async fn unsubscribe(mut self) -> Result<(), StompError> {
        self.released = true;
        match self.conn.release_route(&self.id, &self.kind) {
            Some(frame) => self.conn.enqueue(frame).await,
            None => Ok(()),
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best-effort teardown; an explicit unsubscribe() reports errors.
        if let Some(frame) = self.conn.release_route(&self.id, &self.kind) {
            self.conn.enqueue_detached(frame);
        }
    }
}
