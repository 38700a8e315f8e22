//! # Connection
//!
//! Purpose: Own one TCP socket and keep two background tasks running on it
//! for its whole life: a writer that drains the outbound queue and a reader
//! that frames and decodes response lines.
//!
//! ## Design Principles
//! 1. **Split Halves**: Reader and writer own separate socket halves and never
//!    wait on each other.
//! 2. **One Flush Per Command**: Requests reach the socket in submission order
//!    and are never coalesced with later ones.
//! 3. **Sticky Close**: The first failure reason is kept; every later caller
//!    sees the same `ConnectionError`.
//! 4. **Buffer Reuse**: Each task keeps its own encode or read buffer.
//!
//! ## Structure Overview
//!
//! ```text
//! Connection
//!   ├── correlator: Correlator ──(Command)──► writer task ──► OwnedWriteHalf
//!   │        ▲
//!   │        └────(ClientResult<Response>)── reader task ◄── OwnedReadHalf
//!   └── shared: Arc<Shared> (lifecycle watch, close reason, task handles)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use hs_common::{decode_response, encode_command, Command, LineDecoder, Response};

use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::{ClientError, ClientResult};

/// Which of the two sockets a request travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read-only lookups.
    Read,
    /// Inserts, updates and deletes.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Lifecycle of a connection, or of the client as a whole before it has any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// State shared between a connection, its correlator and its tasks.
pub(crate) struct Shared {
    direction: Direction,
    lifecycle: watch::Sender<Lifecycle>,
    reason: Mutex<Option<String>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    fn new(direction: Direction) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Connected);
        Shared {
            direction,
            lifecycle,
            reason: Mutex::new(None),
            tasks: Mutex::new(Vec::with_capacity(2)),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Marks the connection closed. The first reason recorded wins.
    pub(crate) fn close(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.lifecycle.send_replace(Lifecycle::Closed);
    }

    /// Closes the connection and stops both tasks, dropping the socket.
    pub(crate) fn shutdown(&self, reason: impl Into<String>) {
        self.close(reason);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Error handed to callers of a closed connection.
    pub(crate) fn closed_error(&self) -> ClientError {
        let reason = self
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        ClientError::connection(self.direction, reason)
    }

    pub(crate) fn ensure_open(&self) -> ClientResult<()> {
        match self.lifecycle() {
            Lifecycle::Closed => Err(self.closed_error()),
            _ => Ok(()),
        }
    }
}

/// One dialed socket with its reader and writer tasks.
pub struct Connection {
    direction: Direction,
    addr: String,
    shared: Arc<Shared>,
    correlator: Correlator,
}

impl Connection {
    /// Dials `host:port` and starts the reader and writer tasks.
    pub(crate) async fn open(
        direction: Direction,
        host: &str,
        port: u16,
        config: &ClientConfig,
    ) -> ClientResult<Self> {
        let addr = format!("{host}:{port}");
        let stream = dial(&addr, config.connect_timeout())
            .await
            .map_err(|err| ClientError::connection(direction, format!("connect to {addr}: {err}")))?;
        // Requests are tiny and latency-bound.
        stream
            .set_nodelay(true)
            .map_err(|err| ClientError::connection(direction, err.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        let depth = config.queue_depth.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (inbound_tx, inbound_rx) = mpsc::channel(depth);
        let shared = Arc::new(Shared::new(direction));

        let writer = tokio::spawn(write_loop(write_half, outbound_rx, shared.clone()));
        let reader = tokio::spawn(read_loop(
            read_half,
            inbound_tx,
            shared.clone(),
            config.max_line_len,
        ));
        shared
            .tasks
            .lock()
            .extend([writer.abort_handle(), reader.abort_handle()]);

        debug!(%direction, %addr, "connection established");
        let correlator = Correlator::new(direction, outbound_tx, inbound_rx, shared.clone());
        Ok(Connection {
            direction,
            addr,
            shared,
            correlator,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Remote endpoint as `host:port`.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Stops both tasks and closes the socket.
    pub(crate) fn close(&self) {
        debug!(direction = %self.direction, addr = %self.addr, "closing connection");
        self.shared.shutdown("closed by client");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shutdown("connection dropped");
    }
}

async fn dial(addr: &str, timeout: Option<Duration>) -> std::io::Result<TcpStream> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?,
        None => TcpStream::connect(addr).await,
    }
}

async fn write_loop(
    half: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
) {
    let direction = shared.direction;
    let mut writer = BufWriter::new(half);
    let mut buf = Vec::with_capacity(256);

    while let Some(command) = queue.recv().await {
        buf.clear();
        encode_command(&command, &mut buf);
        trace!(
            %direction,
            command = command.name(),
            index_id = command.index_id(),
            bytes = buf.len(),
            "writing request"
        );

        let written = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(%direction, error = %err, "write failed, closing connection");
            // Stops the reader too, so a waiting caller is released.
            shared.shutdown(format!("write failed: {err}"));
            return;
        }
    }
}

async fn read_loop(
    mut half: OwnedReadHalf,
    inbound: mpsc::Sender<ClientResult<Response>>,
    shared: Arc<Shared>,
    max_line_len: usize,
) {
    let direction = shared.direction;
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut decoder = LineDecoder::new(max_line_len);

    // Closed before the terminal error is handed over, so its receiver never
    // observes a connection that still looks open.
    let (reason, error) = 'outer: loop {
        loop {
            match decoder.next_line(&mut buffer) {
                Ok(Some(line)) => {
                    trace!(%direction, bytes = line.len(), "read response line");
                    let decoded = decode_response(&line).map_err(ClientError::from);
                    if inbound.send(decoded).await.is_err() {
                        // Correlator is gone; nobody will read further lines.
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%direction, error = %err, "unframeable response, closing connection");
                    break 'outer (format!("malformed response: {err}"), Some(ClientError::from(err)));
                }
            }
        }

        match half.read_buf(&mut buffer).await {
            Ok(0) if buffer.is_empty() => {
                debug!(%direction, "connection closed by peer");
                break ("closed by peer".to_string(), None);
            }
            Ok(0) => {
                let reason = format!("peer closed mid-line after {} bytes", buffer.len());
                warn!(%direction, %reason, "truncated response");
                let error = ClientError::connection(direction, reason.clone());
                break (reason, Some(error));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%direction, error = %err, "read failed, closing connection");
                let reason = format!("read failed: {err}");
                let error = ClientError::connection(direction, reason.clone());
                break (reason, Some(error));
            }
        }
    };

    shared.close(reason);
    if let Some(error) = error {
        let _ = inbound.send(Err(error)).await;
    }
}
