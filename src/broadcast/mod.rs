//! Session change broadcaster
//!
//! Subscribers register a callback and receive `(AuthEvent, Arc<Session>)` for every
//! transition the session store makes. Notifications are queued on an unbounded
//! channel and drained by a single dispatcher task, which invokes the callbacks in
//! registration order. A failing or panicking callback is logged and counted, and
//! delivery continues with the next subscriber.


use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::auth::session::{AuthEvent, Session};

/// Type for subscription IDs
pub type SubscriptionId = Uuid;

/// Callback invoked for every session transition
pub type SessionCallback = dyn Fn(AuthEvent, Arc<Session>) -> anyhow::Result<()> + Send + Sync;

/// Handle returned by `subscribe`, used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Counters describing broadcaster activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub notifications_published: u64,
    pub callbacks_invoked: u64,
    pub callback_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    invoked: AtomicU64,
    failures: AtomicU64,
}

type Subscribers = Vec<(SubscriptionId, Arc<SessionCallback>)>;

struct Notification {
    event: AuthEvent,
    session: Arc<Session>,
    /// Subscribers registered when the transition happened
    recipients: Subscribers,
}

type Registry = Arc<Mutex<Subscribers>>;

fn lock(registry: &Registry) -> MutexGuard<'_, Subscribers> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered, failure-isolated fan-out of session transitions
pub struct Broadcaster {
    subscribers: Registry,
    sender: mpsc::UnboundedSender<Notification>,
    counters: Arc<Counters>,
}

impl Broadcaster {
    /// Create a broadcaster and spawn its dispatcher.
    ///
    /// Must be called from within a Tokio runtime. The dispatcher stops once the
    /// broadcaster is dropped.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscribers: Registry = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        tokio::spawn(dispatch(
            receiver,
            Arc::clone(&subscribers),
            Arc::clone(&counters),
        ));

        Self {
            subscribers,
            sender,
            counters,
        }
    }

    /// Register a callback. It is not invoked until the next transition.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(AuthEvent, Arc<Session>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        lock(&self.subscribers).push((id, Arc::new(callback)));
        debug!(subscription_id = %id, "Registered session subscriber");
        Subscription { id }
    }

    /// Remove a subscription. Unknown or already removed handles are ignored.
    pub fn unsubscribe(&self, handle: Subscription) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != handle.id);
        let removed = subscribers.len() != before;

        if removed {
            debug!(subscription_id = %handle.id, "Unregistered session subscriber");
        } else {
            debug!(
                subscription_id = %handle.id,
                "Attempted to unregister non-existent subscriber"
            );
        }
        removed
    }

    /// Queue a notification for the subscribers registered right now. Callbacks
    /// added later do not see it.
    pub(crate) fn publish(&self, event: AuthEvent, session: Arc<Session>) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let recipients = lock(&self.subscribers).clone();
        let notification = Notification {
            event,
            session,
            recipients,
        };
        if self.sender.send(notification).is_err() {
            warn!(event = ?event, "Session dispatcher has stopped, notification dropped");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Drop every subscription
    pub fn clear(&self) {
        let mut subscribers = lock(&self.subscribers);
        let count = subscribers.len();
        subscribers.clear();
        debug!(count, "Cleared all session subscribers");
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            notifications_published: self.counters.published.load(Ordering::Relaxed),
            callbacks_invoked: self.counters.invoked.load(Ordering::Relaxed),
            callback_failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(
    mut receiver: mpsc::UnboundedReceiver<Notification>,
    subscribers: Registry,
    counters: Arc<Counters>,
) {
    debug!("Session dispatcher started");

    while let Some(notification) = receiver.recv().await {
        trace!(
            event = ?notification.event,
            subscribers = notification.recipients.len(),
            "Dispatching session notification"
        );

        for (id, callback) in &notification.recipients {
            let id = *id;
            // Skip callbacks unsubscribed since the notification was queued
            if !lock(&subscribers).iter().any(|(sid, _)| *sid == id) {
                continue;
            }

            counters.invoked.fetch_add(1, Ordering::Relaxed);
            let session = Arc::clone(&notification.session);
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(notification.event, session)));

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscription_id = %id,
                        event = ?notification.event,
                        error = %e,
                        "Session subscriber failed"
                    );
                }
                Err(_) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        subscription_id = %id,
                        event = ?notification.event,
                        "Session subscriber panicked"
                    );
                }
            }
        }
    }

    debug!("Session dispatcher stopped");
}
