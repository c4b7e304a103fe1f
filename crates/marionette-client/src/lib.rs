//! Connection and dispatch engine for driving an editor extension host.
#![deny(missing_docs)]
//!
//! The crate maintains one persistent connection to a remote editor
//! extension over a local socket and gives the layers above it a
//! synchronous-looking surface: [`Client::call`] blocks the calling thread
//! until the correlated response arrives, while a single background reader
//! loop demultiplexes responses and push events for any number of
//! concurrent callers. Everything domain-specific (command names, document
//! payloads, panel contents) passes through as opaque JSON; the engine
//! routes, it never interprets.
//!
//! # Architecture
//!
//! - `transport` frames newline-delimited JSON over a Unix or TCP socket.
//! - `protocol` encodes and decodes the three wire shapes (request,
//!   response, event).
//! - `correlation` parks callers on completion slots keyed by request id.
//! - `dispatch` fans push events out to topic/scope handler registrations.
//! - `reader` is the one thread that owns the inbound side of the socket.
//! - `client` ties the pieces into the [`Client`] lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use marionette_client::Client;
//! use marionette_config::default_socket_endpoint;
//!
//! let client = Client::new();
//! client.connect(&default_socket_endpoint())?;
//! let folders: Vec<String> = client.call("workspace.getWorkspaceFolders", (), None)?;
//! let sub = client.on("workspace.onDidSaveTextDocument", None, |payload| {
//!     println!("saved: {payload}");
//!     Ok(())
//! })?;
//! ```

mod client;
mod correlation;
mod dispatch;
mod errors;
mod protocol;
mod reader;
mod transport;

pub use client::{
    Client, SessionEvent, SessionListener, SessionListenerToken, Subscription,
};
pub use dispatch::{EventHandler, HandlerError, SubscriptionToken};
pub use errors::{ClientError, ProtocolError, TransportError};
pub use protocol::{ErrorBody, EventNotification, Message, Request, Response};
