//! Default endpoint resolution for the editor host.

use std::env;

#[cfg(unix)]
use camino::Utf8PathBuf;

#[cfg(unix)]
use dirs::runtime_dir;

#[cfg(unix)]
use libc::geteuid;

use crate::socket::SocketEndpoint;

/// Environment variable the host extension sets with its endpoint.
///
/// The value may be a `unix://` or `tcp://` URL, or a bare socket path.
pub const ENDPOINT_ENV_VAR: &str = "MARIONETTE_SOCKET";

/// Default TCP port used when Unix domain sockets are not available.
pub const DEFAULT_TCP_PORT: u16 = 9778;

/// Resolves the endpoint of the editor host.
///
/// Checks [`ENDPOINT_ENV_VAR`] first, then falls back to the platform
/// default location.
#[must_use]
pub fn default_socket_endpoint() -> SocketEndpoint {
    match env::var(ENDPOINT_ENV_VAR) {
        Ok(value) => endpoint_from_env_value(&value),
        Err(_) => platform_default(),
    }
}

/// Interprets the environment variable value as an endpoint.
///
/// Hosts publish either a full endpoint URL or, historically, a bare
/// socket path; a value that does not parse as a URL is taken as the
/// latter.
fn endpoint_from_env_value(value: &str) -> SocketEndpoint {
    value
        .parse()
        .unwrap_or_else(|_| SocketEndpoint::unix(value))
}

#[cfg(unix)]
fn platform_default() -> SocketEndpoint {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("marionette");
    if apply_namespace {
        base.push(user_namespace());
    }

    SocketEndpoint::unix(base.join("host.sock"))
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(unix)]
fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn platform_default() -> SocketEndpoint {
    SocketEndpoint::tcp("127.0.0.1", DEFAULT_TCP_PORT)
}
