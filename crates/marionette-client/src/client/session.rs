//! Client-side session lifecycle notifications.
//!
//! Session listeners observe what the engine itself is doing (the reader
//! loop starting and stopping, subscription handshakes completing, events
//! being delivered) without participating in the wire protocol. Delivery is
//! best-effort: a failing listener is logged and never disturbs the engine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

/// Log target for session notifications.
pub(crate) const SESSION_TARGET: &str = "marionette_client::session";

/// Moments in the client session observable by session listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The reader loop has started.
    ReaderStarted,
    /// The reader loop has stopped.
    ReaderStopped,
    /// The host acknowledged a topic subscription.
    SubscriptionAck {
        /// Topic that was subscribed.
        topic: String,
    },
    /// The host acknowledged a topic unsubscription.
    UnsubscriptionAck {
        /// Topic that was unsubscribed.
        topic: String,
    },
    /// An inbound event was delivered to at least one handler.
    EventDispatched {
        /// Topic of the delivered event.
        topic: String,
    },
}

/// Callback observing session lifecycle moments.
pub type SessionListener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// Token identifying a registered session listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionListenerToken(u64);

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub(crate) struct SessionListeners {
    listeners: Mutex<Vec<(SessionListenerToken, Arc<SessionListener>)>>,
    next_token: AtomicU64,
}

impl SessionListeners {
    pub(crate) fn add(&self, listener: SessionListener) -> SessionListenerToken {
        let token = SessionListenerToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        lock_ignore_poison(&self.listeners).push((token, Arc::new(listener)));
        token
    }

    pub(crate) fn remove(&self, token: SessionListenerToken) -> bool {
        let mut listeners = lock_ignore_poison(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != token);
        listeners.len() != before
    }

    /// Notifies every listener, isolating failures per listener.
    pub(crate) fn notify(&self, event: &SessionEvent) {
        let snapshot: Vec<Arc<SessionListener>> = lock_ignore_poison(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    target: SESSION_TARGET,
                    event = ?event,
                    "session listener panicked"
                );
            }
        }
    }
}
