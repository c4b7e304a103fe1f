//! Connection link state for the client engine.

use std::thread::JoinHandle;

use crate::transport::{ShutdownHandle, TransportWriter};

/// Lifecycle of the connection to the editor host.
///
/// Transitions: `Disconnected → Connecting → Connected → Closing →
/// Disconnected`, driven by explicit `connect`/`disconnect` calls or by an
/// unrecoverable transport error observed on the reader loop. Whichever
/// thread first moves the link out of `Connected` owns the teardown; every
/// later trigger finds a different state and becomes a no-op.
pub(crate) enum LinkState {
    /// No connection is established.
    Disconnected,
    /// `connect` is mid-flight on some thread.
    Connecting,
    /// Connection is live and the reader loop is running.
    Connected(LiveLink),
    /// `disconnect` is tearing the connection down.
    Closing,
}

/// Everything owned by a live connection.
pub(crate) struct LiveLink {
    /// Outbound transport half; access is serialized by the link lock.
    pub(crate) writer: TransportWriter,
    /// Wakes the reader loop out of a blocked receive.
    pub(crate) shutdown: ShutdownHandle,
    /// Reader loop thread, joined on explicit disconnect and detached when
    /// the reader itself observed the failure.
    pub(crate) reader: Option<JoinHandle<()>>,
}
