//! Client facade over the connection engine.
//!
//! [`Client`] owns the connection lifecycle and exposes the narrow surface
//! the generated wrapper methods build on: blocking [`call`](Client::call)s
//! correlated over one multiplexed socket, and [`on`](Client::on)
//! registrations for host push events. The client is cheap to clone; clones
//! share one connection, one correlation table, and one dispatch registry.

mod session;
mod state;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use marionette_config::SocketEndpoint;

use crate::correlation::CorrelationTable;
use crate::dispatch::{DispatchRegistry, EventHandler, HandlerError, SubscriptionToken};
use crate::errors::{ClientError, TransportError};
use crate::protocol::{Message, Request, RequestIdSource};
use crate::transport;

pub use session::{SessionEvent, SessionListener, SessionListenerToken};
use session::SessionListeners;
use state::{LinkState, LiveLink};

/// Log target for client lifecycle operations.
pub(crate) const CLIENT_TARGET: &str = "marionette_client::client";

/// Deadline applied to the subscribe/unsubscribe handshake with the host.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared between client clones and the reader loop.
pub(crate) struct Shared {
    link: Mutex<LinkState>,
    calls: CorrelationTable,
    subscriptions: DispatchRegistry,
    session: SessionListeners,
    ids: RequestIdSource,
}

impl Shared {
    pub(crate) fn calls(&self) -> &CorrelationTable {
        &self.calls
    }

    pub(crate) fn subscriptions(&self) -> &DispatchRegistry {
        &self.subscriptions
    }

    pub(crate) fn session(&self) -> &SessionListeners {
        &self.session
    }

    fn is_connected(&self) -> bool {
        matches!(*lock_ignore_poison(&self.link), LinkState::Connected(_))
    }

    /// Writes one frame through the live link.
    ///
    /// The link lock serializes concurrent senders, so frames from different
    /// caller threads never interleave mid-frame.
    fn send_frame(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut link = lock_ignore_poison(&self.link);
        match &mut *link {
            LinkState::Connected(live) => live.writer.send(frame).map_err(ClientError::from),
            LinkState::Disconnected | LinkState::Connecting | LinkState::Closing => {
                Err(ClientError::NotConnected)
            }
        }
    }

    /// Tears the link down after a terminal failure, exactly once.
    ///
    /// Whichever thread first moves the link out of `Connected` performs the
    /// teardown; every other trigger finds a different state and returns.
    pub(crate) fn fail_link(&self, reason: &str) {
        let live = {
            let mut link = lock_ignore_poison(&self.link);
            match std::mem::replace(&mut *link, LinkState::Disconnected) {
                LinkState::Connected(live) => live,
                other => {
                    *link = other;
                    return;
                }
            }
        };
        // The shutdown wakes a reader parked in a blocking receive; the
        // reader join handle is detached because the reader may be the
        // thread running this path.
        live.shutdown.shutdown();
        drop(live);
        warn!(target: CLIENT_TARGET, reason, "connection failed");
        self.calls.cancel_all(reason);
    }

    fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let id = self.ids.next_id();
        let slot = self.calls.register(id)?;
        let frame = Message::Request(Request {
            id,
            method: method.to_string(),
            params,
        })
        .to_bytes()?;

        debug!(target: CLIENT_TARGET, method, id, "sending request");
        if let Err(error) = self.send_frame(&frame) {
            self.calls.discard(id);
            if !matches!(error, ClientError::NotConnected) {
                self.fail_link(&format!("send failed: {error}"));
            }
            return Err(error);
        }

        match timeout {
            Some(duration) => {
                let deadline = Instant::now() + duration;
                match slot.wait_deadline(deadline) {
                    Some(outcome) => outcome,
                    None => {
                        // Deadline passed. Expire the call; a response that
                        // won the race keeps its original outcome and the
                        // slot is fulfilled either way.
                        self.calls.expire(id, duration);
                        slot.wait()
                    }
                }
            }
            None => slot.wait(),
        }
    }

    /// Unregisters a handler, informing the host when the topic's last
    /// handler goes away. The unsubscribe is best-effort.
    fn release_subscription(&self, token: SubscriptionToken) {
        let Some((topic, last_for_topic)) = self.subscriptions.unregister(token) else {
            return;
        };
        if !last_for_topic || !self.is_connected() {
            return;
        }
        let params = json!({"event": topic.clone()});
        match self.call_raw("events.unsubscribe", params, Some(HANDSHAKE_TIMEOUT)) {
            Ok(_) => {
                self.session
                    .notify(&SessionEvent::UnsubscriptionAck { topic });
            }
            Err(error) => {
                warn!(
                    target: CLIENT_TARGET,
                    topic,
                    error = %error,
                    "unsubscribe request failed"
                );
            }
        }
    }
}

/// Handle to one registered event handler.
///
/// Dropping the handle unregisters it; [`Subscription::detach`] opts out and
/// leaves the handler registered for the client's remaining lifetime.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<Shared>,
    token: Option<SubscriptionToken>,
    topic: String,
}

impl Subscription {
    /// Topic this subscription was registered for.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Leaves the handler registered for the client's remaining lifetime.
    pub fn detach(mut self) {
        self.token = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.release_subscription(token);
    }
}

/// Connection engine for one editor host.
///
/// One process-wide instance is the expected shape: thin wrapper layers
/// receive a clone rather than reaching into globals.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Shared>,
}

impl Client {
    /// Builds a client with no live connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Shared {
                link: Mutex::new(LinkState::Disconnected),
                calls: CorrelationTable::new(),
                subscriptions: DispatchRegistry::new(),
                session: SessionListeners::default(),
                ids: RequestIdSource::new(),
            }),
        }
    }

    /// Connects to the host at `endpoint` and starts the reader loop.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::AlreadyConnected` when a connection is live or
    /// mid-transition, and `ClientError::Transport` when the endpoint cannot
    /// be opened; the client returns to `Disconnected` in the latter case.
    pub fn connect(&self, endpoint: &SocketEndpoint) -> Result<(), ClientError> {
        {
            let mut link = lock_ignore_poison(&self.inner.link);
            match *link {
                LinkState::Disconnected => *link = LinkState::Connecting,
                LinkState::Connecting | LinkState::Connected(_) | LinkState::Closing => {
                    return Err(ClientError::AlreadyConnected);
                }
            }
        }

        let connected = transport::connect(endpoint);
        let mut link = lock_ignore_poison(&self.inner.link);
        let (transport_reader, writer, shutdown) = match connected {
            Ok(halves) => halves,
            Err(error) => {
                *link = LinkState::Disconnected;
                return Err(error.into());
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("marionette-reader".to_string())
            .spawn(move || crate::reader::run(transport_reader, weak));
        match spawned {
            Ok(handle) => {
                *link = LinkState::Connected(LiveLink {
                    writer,
                    shutdown,
                    reader: Some(handle),
                });
                info!(target: CLIENT_TARGET, endpoint = %endpoint, "connected to editor host");
                Ok(())
            }
            Err(error) => {
                *link = LinkState::Disconnected;
                Err(ClientError::Transport(TransportError::Io(error)))
            }
        }
    }

    /// Disconnects from the host.
    ///
    /// Every pending call fails with `ConnectionLost` before this returns.
    /// Registered event handlers stay registered; with no reader loop alive
    /// they simply receive nothing. Calling this while already disconnected
    /// is a no-op.
    pub fn disconnect(&self) {
        let live = {
            let mut link = lock_ignore_poison(&self.inner.link);
            match std::mem::replace(&mut *link, LinkState::Closing) {
                LinkState::Connected(live) => live,
                other => {
                    *link = other;
                    return;
                }
            }
        };

        let LiveLink {
            writer,
            shutdown,
            reader,
        } = live;
        shutdown.shutdown();
        if let Some(handle) = reader
            && handle.join().is_err()
        {
            warn!(target: CLIENT_TARGET, "reader thread panicked during shutdown");
        }
        drop(writer);

        self.inner.calls.cancel_all("client disconnected");
        *lock_ignore_poison(&self.inner.link) = LinkState::Disconnected;
        info!(target: CLIENT_TARGET, "disconnected from editor host");
    }

    /// Whether a connection to the host is currently live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Invokes `method` on the host and blocks for the correlated response.
    ///
    /// With `timeout` set, the call fails with `ClientError::Timeout` once
    /// the deadline passes; without it, the call blocks until a response
    /// arrives or the connection dies.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` off-session, `Timeout` past the deadline,
    /// `Remote` when the host answers with an error, `ConnectionLost` when
    /// the link dies mid-call, and `Codec` when payload (de)serialization
    /// fails.
    pub fn call<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.inner.call_raw(method, params, timeout)?;
        serde_json::from_value(result).map_err(ClientError::from)
    }

    /// Raw-value variant of [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`call`](Self::call), minus result
    /// deserialization.
    pub fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        self.inner.call_raw(method, params, timeout)
    }

    /// Registers `handler` for `topic`, optionally narrowed to one resource
    /// `scope`.
    ///
    /// The first handler for a topic triggers an `events.subscribe`
    /// handshake with the host; later registrations for the same topic share
    /// it. Registering while disconnected keeps the handler locally without
    /// a handshake.
    ///
    /// # Errors
    ///
    /// Returns the underlying call error when the subscribe handshake fails;
    /// the local registration is rolled back in that case.
    pub fn on<F>(
        &self,
        topic: &str,
        scope: Option<&str>,
        handler: F,
    ) -> Result<Subscription, ClientError>
    where
        F: Fn(&Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let boxed: EventHandler = Box::new(handler);
        let (token, first_for_topic) = self.inner.subscriptions.register(topic, scope, boxed);

        if first_for_topic && self.inner.is_connected() {
            let params = json!({"event": topic});
            if let Err(error) = self
                .inner
                .call_raw("events.subscribe", params, Some(HANDSHAKE_TIMEOUT))
            {
                self.inner.subscriptions.unregister(token);
                return Err(error);
            }
            self.inner.session.notify(&SessionEvent::SubscriptionAck {
                topic: topic.to_string(),
            });
        }

        Ok(Subscription {
            shared: Arc::downgrade(&self.inner),
            token: Some(token),
            topic: topic.to_string(),
        })
    }

    /// Unregisters `subscription`, informing the host when the topic's last
    /// handler is removed. Equivalent to dropping the handle.
    pub fn off(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Lists the topics the host currently holds subscriptions for.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`call`](Self::call).
    pub fn subscriptions(&self, timeout: Option<Duration>) -> Result<Vec<String>, ClientError> {
        self.call("events.listSubscriptions", json!({}), timeout)
    }

    /// Registers a session lifecycle listener.
    pub fn add_session_listener<F>(&self, listener: F) -> SessionListenerToken
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.session.add(Box::new(listener))
    }

    /// Removes a previously registered session listener.
    ///
    /// Returns `false` when the token was already removed.
    pub fn remove_session_listener(&self, token: SessionListenerToken) -> bool {
        self.inner.session.remove(token)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last client handle gone: close the socket so a parked reader
        // thread wakes, fails to upgrade its weak reference, and exits.
        let mut link = lock_ignore_poison(&self.link);
        if let LinkState::Connected(live) = std::mem::replace(&mut *link, LinkState::Disconnected) {
            live.shutdown.shutdown();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = lock_ignore_poison(&self.inner.link);
        let state = match &*link {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected(_) => "connected",
            LinkState::Closing => "closing",
        };
        formatter
            .debug_struct("Client")
            .field("state", &state)
            .field("pending_calls", &self.inner.calls.pending_count())
            .finish()
    }
}
