//! Topic- and scope-based routing of host push events.
//!
//! Handlers register for a topic, optionally narrowed to one resource scope
//! (e.g. a single panel instance). Dispatch runs on the reader loop thread;
//! registration may happen from any thread, so the registry snapshots the
//! matching handlers under its lock and invokes them outside it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, warn};

/// Log target for dispatch operations.
pub(crate) const DISPATCH_TARGET: &str = "marionette_client::dispatch";

/// Error type surfaced by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked with an event payload.
pub type EventHandler = Box<dyn Fn(&Value) -> Result<(), HandlerError> + Send + Sync>;

/// Opaque identity of one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Registration {
    token: SubscriptionToken,
    scope: Option<String>,
    handler: Arc<EventHandler>,
}

#[derive(Default)]
struct Registrations {
    /// Handlers per topic, in registration order.
    by_topic: HashMap<String, Vec<Registration>>,
    /// Reverse lookup from token to owning topic.
    topic_of: HashMap<SubscriptionToken, String>,
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Maps event topics (and optional scopes) to registered handlers.
pub(crate) struct DispatchRegistry {
    registrations: Mutex<Registrations>,
    next_token: AtomicU64,
}

impl DispatchRegistry {
    pub(crate) fn new() -> Self {
        Self {
            registrations: Mutex::new(Registrations::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `topic`, optionally narrowed to `scope`.
    ///
    /// The returned flag is `true` when this is the first handler for the
    /// topic, which is the caller's cue to subscribe with the host.
    pub(crate) fn register(
        &self,
        topic: &str,
        scope: Option<&str>,
        handler: EventHandler,
    ) -> (SubscriptionToken, bool) {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut registrations = lock_ignore_poison(&self.registrations);
        let handlers = registrations.by_topic.entry(topic.to_string()).or_default();
        let first_for_topic = handlers.is_empty();
        handlers.push(Registration {
            token,
            scope: scope.map(str::to_string),
            handler: Arc::new(handler),
        });
        registrations.topic_of.insert(token, topic.to_string());
        (token, first_for_topic)
    }

    /// Removes the registration identified by `token`.
    ///
    /// Returns the topic and whether it was the topic's last handler, or
    /// `None` when the token is unknown (already unregistered).
    pub(crate) fn unregister(&self, token: SubscriptionToken) -> Option<(String, bool)> {
        let mut registrations = lock_ignore_poison(&self.registrations);
        let topic = registrations.topic_of.remove(&token)?;
        let Some(handlers) = registrations.by_topic.get_mut(&topic) else {
            return Some((topic, false));
        };
        handlers.retain(|registration| registration.token != token);
        let last_for_topic = handlers.is_empty();
        if last_for_topic {
            registrations.by_topic.remove(&topic);
        }
        Some((topic, last_for_topic))
    }

    /// Invokes every handler matching `topic` and `scope`, in registration
    /// order. Returns how many handlers were invoked.
    ///
    /// Handler failures are logged per handler; one failing handler never
    /// blocks delivery to the rest.
    pub(crate) fn dispatch(&self, topic: &str, scope: Option<&str>, payload: &Value) -> usize {
        let matching: Vec<(SubscriptionToken, Arc<EventHandler>)> = {
            let registrations = lock_ignore_poison(&self.registrations);
            let Some(handlers) = registrations.by_topic.get(topic) else {
                debug!(target: DISPATCH_TARGET, topic, "no handlers registered for topic");
                return 0;
            };
            handlers
                .iter()
                .filter(|registration| scope_matches(registration.scope.as_deref(), scope))
                .map(|registration| (registration.token, Arc::clone(&registration.handler)))
                .collect()
        };

        if matching.is_empty() {
            debug!(target: DISPATCH_TARGET, topic, ?scope, "no handlers matched scope");
            return 0;
        }

        let invoked = matching.len();
        for (token, handler) in matching {
            invoke_handler(token, &handler, topic, payload);
        }
        invoked
    }
}

/// An unscoped registration matches every scope for its topic; a scoped
/// registration matches only its exact scope id.
fn scope_matches(registered: Option<&str>, event_scope: Option<&str>) -> bool {
    match registered {
        None => true,
        Some(scope) => event_scope == Some(scope),
    }
}

fn invoke_handler(
    token: SubscriptionToken,
    handler: &EventHandler,
    topic: &str,
    payload: &Value,
) {
    match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(
                target: DISPATCH_TARGET,
                topic,
                token = ?token,
                error = %error,
                "event handler failed"
            );
        }
        Err(_) => {
            warn!(
                target: DISPATCH_TARGET,
                topic,
                token = ?token,
                "event handler panicked"
            );
        }
    }
}
