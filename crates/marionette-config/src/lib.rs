//! Shared configuration for Marionette clients.
//!
//! The crate answers one question for the rest of the workspace: where does
//! the editor extension host listen? [`SocketEndpoint`] models the answer
//! (a Unix domain socket or a TCP address), and [`default_socket_endpoint`]
//! resolves it from the environment the way the host extension publishes it.

mod defaults;
mod socket;

pub use defaults::{DEFAULT_TCP_PORT, ENDPOINT_ENV_VAR, default_socket_endpoint};
pub use socket::{SocketEndpoint, SocketParseError, SocketPreparationError};
