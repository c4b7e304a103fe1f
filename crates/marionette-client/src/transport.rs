//! Socket transport with newline-delimited framing.
//!
//! The engine speaks JSONL over a local socket: one frame is one line. The
//! framing layer only moves delimited byte runs; it never inspects their
//! contents. Partial reads and writes are absorbed by buffering, so a frame
//! split across arbitrary chunk boundaries still arrives whole.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use marionette_config::SocketEndpoint;

#[cfg(unix)]
use std::os::fd::OwnedFd;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

#[cfg(unix)]
use socket2::{Domain, SockAddr, Socket, Type};

use crate::errors::TransportError;

/// Log target for transport operations.
pub(crate) const TRANSPORT_TARGET: &str = "marionette_client::transport";

/// Time allowed for establishing the socket connection.
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream types the engine can connect over.
pub(crate) enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(stream) => stream.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(stream) => stream.try_clone().map(Self::Unix),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(how),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(how),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

/// Inbound half of the transport, owned by the reader loop.
pub(crate) struct TransportReader {
    reader: BufReader<Connection>,
}

impl TransportReader {
    /// Blocks until one complete frame is available.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly. Blank
    /// lines between frames are skipped.
    pub(crate) fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut frame = Vec::new();
        loop {
            frame.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut frame)?;
            if bytes_read == 0 {
                return Ok(None);
            }
            while matches!(frame.last(), Some(b'\n' | b'\r')) {
                frame.pop();
            }
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

/// Outbound half of the transport.
///
/// Callers serialize access through the client's link lock, so one `send`
/// writes a whole frame before the next begins.
pub(crate) struct TransportWriter {
    stream: Connection,
}

impl TransportWriter {
    /// Writes one frame followed by the line terminator and flushes.
    pub(crate) fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(frame)?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Handle used to unblock the reader loop during teardown.
pub(crate) struct ShutdownHandle {
    stream: Connection,
}

impl ShutdownHandle {
    /// Shuts the socket down in both directions, waking any blocked reads.
    pub(crate) fn shutdown(&self) {
        if let Err(error) = self.stream.shutdown(Shutdown::Both) {
            debug!(
                target: TRANSPORT_TARGET,
                error = %error,
                "socket shutdown failed"
            );
        }
    }
}

/// Opens the endpoint and splits the stream into its transport halves.
pub(crate) fn connect(
    endpoint: &SocketEndpoint,
) -> Result<(TransportReader, TransportWriter, ShutdownHandle), TransportError> {
    let stream = open_stream(endpoint)?;
    let read_half = stream.try_clone()?;
    let shutdown_half = stream.try_clone()?;
    Ok((
        TransportReader {
            reader: BufReader::new(read_half),
        },
        TransportWriter { stream },
        ShutdownHandle {
            stream: shutdown_half,
        },
    ))
}

fn open_stream(endpoint: &SocketEndpoint) -> Result<Connection, TransportError> {
    match endpoint {
        SocketEndpoint::Tcp { host, port } => {
            let endpoint_display = endpoint.to_string();
            let address =
                resolve_tcp_address(host, *port).map_err(|source| TransportError::Resolve {
                    endpoint: endpoint_display.clone(),
                    source,
                })?;

            TcpStream::connect_timeout(&address, CONNECTION_TIMEOUT)
                .map(Connection::Tcp)
                .map_err(|source| TransportError::Connect {
                    endpoint: endpoint_display,
                    source,
                })
        }
        SocketEndpoint::Unix { path } => {
            #[cfg(unix)]
            {
                connect_unix(path.as_str()).map_err(|source| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    source,
                })
            }

            #[cfg(not(unix))]
            {
                let _ = path;
                Err(TransportError::UnsupportedUnixTransport(
                    endpoint.to_string(),
                ))
            }
        }
    }
}

fn resolve_tcp_address(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs
        .find(|addr| matches!(addr, SocketAddr::V4(_) | SocketAddr::V6(_)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses"))
}

#[cfg(unix)]
fn connect_unix(path: &str) -> io::Result<Connection> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    let address = SockAddr::unix(path)?;
    socket.connect_timeout(&address, CONNECTION_TIMEOUT)?;
    let stream: UnixStream = OwnedFd::from(socket).into();
    Ok(Connection::Unix(stream))
}
