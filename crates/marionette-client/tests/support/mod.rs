//! Fake host utilities for behavioural tests.
//!
//! Provides a mock editor host that accepts a single connection, records the
//! requests it receives, and answers each one according to a scripted
//! behaviour, allowing the engine to be exercised without a real editor.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};

use marionette_config::SocketEndpoint;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

/// What the fake host does with one incoming request.
pub enum HostAction {
    /// Write these frames back to the client.
    Reply(Vec<String>),
    /// Write these frames, then close the connection.
    ReplyAndClose(Vec<String>),
    /// Say nothing and keep reading.
    Ignore,
}

/// Builds a success-response frame.
pub fn result_frame(id: i64, result: Value) -> String {
    json!({"id": id, "result": result}).to_string()
}

/// Builds an error-response frame.
pub fn error_frame(id: i64, code: i64, message: &str) -> String {
    json!({"id": id, "error": {"code": code, "message": message}}).to_string()
}

/// Builds an event frame, optionally scoped.
pub fn event_frame(topic: &str, scope: Option<&str>, data: Value) -> String {
    let mut frame = json!({"type": "event", "event": topic, "data": data});
    if let Some(scope) = scope {
        frame["scope"] = json!(scope);
    }
    frame.to_string()
}

/// Extracts the id of a recorded request.
pub fn request_id(request: &Value) -> i64 {
    request["id"].as_i64().expect("request id")
}

/// Answers every request with its own params echoed back, and acknowledges
/// subscription handshakes with null.
pub fn echo_behaviour(request: &Value) -> HostAction {
    let id = request_id(request);
    let method = request["method"].as_str().unwrap_or_default();
    match method {
        "events.subscribe" | "events.unsubscribe" => {
            HostAction::Reply(vec![result_frame(id, Value::Null)])
        }
        _ => HostAction::Reply(vec![result_frame(id, request["params"].clone())]),
    }
}

/// Streams that can be cloned for concurrent read/write halves.
pub trait TryCloneStream: Read + Write + Send + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
}

impl TryCloneStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

#[cfg(unix)]
impl TryCloneStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }
}

/// Reads request lines from `stream`, recording each and applying `respond`.
pub fn serve_connection<S, F>(
    stream: S,
    respond: &mut F,
    requests: &Arc<Mutex<Vec<Value>>>,
) -> Result<()>
where
    S: TryCloneStream,
    F: FnMut(&Value) -> HostAction,
{
    let mut writer = stream.try_clone_stream().context("clone stream")?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // Client hung up; not a failure of the fake host.
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = serde_json::from_str(&line).context("parse request")?;
        requests
            .lock()
            .map_err(|error| anyhow!("lock requests: {error}"))?
            .push(request.clone());

        match respond(&request) {
            HostAction::Reply(frames) => write_frames(&mut writer, &frames)?,
            HostAction::ReplyAndClose(frames) => {
                write_frames(&mut writer, &frames)?;
                break;
            }
            HostAction::Ignore => {}
        }
    }
    Ok(())
}

/// Writes frames to a stream, appending newlines and flushing.
pub fn write_frames(stream: &mut impl Write, frames: &[String]) -> Result<()> {
    for frame in frames {
        stream
            .write_all(frame.as_bytes())
            .context("write response frame")?;
        stream.write_all(b"\n").context("write frame terminator")?;
    }
    stream.flush().context("flush response")?;
    Ok(())
}

/// A mock host server that accepts a single connection over TCP.
pub struct FakeHost {
    port: u16,
    requests: Arc<Mutex<Vec<Value>>>,
    result: Arc<Mutex<Option<Result<()>>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FakeHost {
    /// Spawns a fake host listening on an ephemeral TCP port.
    pub fn spawn<F>(mut respond: F) -> Result<Self>
    where
        F: FnMut(&Value) -> HostAction + Send + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).context("bind fake host")?;
        listener
            .set_nonblocking(true)
            .context("fake host nonblocking")?;
        let port = listener.local_addr().context("local addr")?.port();
        let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let result: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let requests_clone = Arc::clone(&requests);
        let result_clone = Arc::clone(&result);
        let handle = thread::spawn(move || {
            let outcome = Self::serve_client(&listener, &mut respond, &requests_clone);
            if let Ok(mut guard) = result_clone.lock() {
                *guard = Some(outcome);
            }
        });
        Ok(Self {
            port,
            requests,
            result,
            handle: Some(handle),
        })
    }

    /// Endpoint the client should connect to.
    pub fn endpoint(&self) -> SocketEndpoint {
        SocketEndpoint::tcp("127.0.0.1", self.port)
    }

    /// Requests recorded so far, in arrival order.
    pub fn recorded_requests(&self) -> Vec<Value> {
        self.requests.lock().expect("lock requests").clone()
    }

    /// Method names recorded so far, in arrival order.
    pub fn recorded_methods(&self) -> Vec<String> {
        self.recorded_requests()
            .iter()
            .filter_map(|request| request["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Waits for the serving thread and surfaces any fake-host failure.
    pub fn finish(mut self) -> Result<Vec<Value>> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("fake host thread panicked"))?;
        }
        if let Some(outcome) = self
            .result
            .lock()
            .map_err(|error| anyhow!("lock fake host result: {error}"))?
            .take()
        {
            outcome.context("fake host failed")?;
        }
        Ok(self.recorded_requests())
    }

    fn serve_client<F>(
        listener: &TcpListener,
        respond: &mut F,
        requests: &Arc<Mutex<Vec<Value>>>,
    ) -> Result<()>
    where
        F: FnMut(&Value) -> HostAction,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).context("stream blocking")?;
                    return serve_connection(stream, respond, requests);
                }
                Err(ref error)
                    if error.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline =>
                {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                    // No client connected; exit cleanly so tests that abort
                    // before connecting do not hang.
                    return Ok(());
                }
                Err(error) => return Err(error).context("accept connection"),
            }
        }
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Accepts one Unix socket connection and serves it with `respond`.
#[cfg(unix)]
pub fn serve_unix_connection<F>(
    listener: UnixListener,
    mut respond: F,
    requests: Arc<Mutex<Vec<Value>>>,
) -> thread::JoinHandle<Result<()>>
where
    F: FnMut(&Value) -> HostAction + Send + 'static,
{
    thread::spawn(move || {
        let (stream, _) = listener.accept().context("accept unix connection")?;
        serve_connection(stream, &mut respond, &requests)
    })
}
