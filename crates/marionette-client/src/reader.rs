//! Background loop that drains the inbound transport.
//!
//! Exactly one reader runs per live connection. It decodes each frame and
//! routes it: responses complete the correlation table, events fan out
//! through the dispatch registry, and anything malformed is logged and
//! dropped without disturbing the frames behind it. When the transport ends,
//! the loop triggers the client's teardown path exactly once.

use std::sync::Weak;

use tracing::{debug, warn};

use crate::client::{SessionEvent, Shared};
use crate::errors::ClientError;
use crate::protocol::{EventNotification, Message, Response};
use crate::transport::TransportReader;

/// Log target for reader-loop operations.
pub(crate) const READER_TARGET: &str = "marionette_client::reader";

/// Runs the reader loop until the transport ends or every client handle is
/// dropped.
///
/// The loop holds only a weak reference to the shared client state, so
/// dropping the last `Client` lets the state unwind even while the reader is
/// parked in a blocking receive.
pub(crate) fn run(mut transport: TransportReader, shared: Weak<Shared>) {
    if let Some(shared) = shared.upgrade() {
        shared.session().notify(&SessionEvent::ReaderStarted);
    }

    let reason = loop {
        let frame = match transport.receive() {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by host".to_string(),
            Err(error) => break format!("transport failure: {error}"),
        };
        let Some(shared) = shared.upgrade() else {
            debug!(target: READER_TARGET, "client dropped; reader exiting");
            return;
        };
        route_frame(&shared, &frame);
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    shared.fail_link(&reason);
    shared.session().notify(&SessionEvent::ReaderStopped);
}

fn route_frame(shared: &Shared, frame: &[u8]) {
    match Message::from_bytes(frame) {
        Ok(Message::Response(response)) => route_response(shared, response),
        Ok(Message::Event(event)) => route_event(shared, event),
        Ok(Message::Request(request)) => {
            warn!(
                target: READER_TARGET,
                method = %request.method,
                id = request.id,
                "ignoring host-initiated request"
            );
        }
        Err(error) => {
            warn!(
                target: READER_TARGET,
                error = %error,
                "dropping malformed frame"
            );
        }
    }
}

fn route_response(shared: &Shared, response: Response) {
    let id = response.id;
    let outcome = match response.error {
        Some(error) => Err(ClientError::from_remote(error)),
        None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
    };
    if shared.calls().complete(id, outcome) {
        debug!(target: READER_TARGET, id, "completed pending call");
    } else {
        debug!(
            target: READER_TARGET,
            id,
            "discarding response with no pending call"
        );
    }
}

fn route_event(shared: &Shared, event: EventNotification) {
    let delivered =
        shared
            .subscriptions()
            .dispatch(&event.topic, event.scope.as_deref(), &event.data);
    if delivered > 0 {
        shared
            .session()
            .notify(&SessionEvent::EventDispatched { topic: event.topic });
    }
}
