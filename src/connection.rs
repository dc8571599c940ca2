//! Line-oriented connection to a block server.
//!
//! A [`Connection`] owns exactly one stream. It is never shared: the pipeline
//! borrows it mutably for the duration of a batch, and the dispatcher moves
//! one connection into each shard task.
//!
//! Any stream failure moves the connection into [`ConnState::Broken`]. A broken
//! connection refuses further I/O, so a response that was never read cannot
//! be paired with a later request.

use crate::error::ConnectionError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Expected length of a response line
const LINE_CAPACITY: usize = 32;

/// Optional limits for stream operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// Current state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Usable for requests.
    Open,
    /// A failure or desync happened; the stream must be discarded.
    Broken(String),
    /// Closed by the owner.
    Closed,
}

/// A single connection to a block server.
pub struct Connection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: Option<SocketAddr>,
    state: ConnState,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    line: Vec<u8>,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection<TcpStream> {
    /// Open a TCP connection to `addr`.
    pub async fn connect(addr: &str, timeouts: &Timeouts) -> Result<Self, ConnectionError> {
        let stream = with_timeout(timeouts.connect, "connect", TcpStream::connect(addr)).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        debug!(peer = ?peer, "Connected");

        let mut conn = Connection::new(stream).with_timeouts(timeouts);
        conn.peer = peer;
        Ok(conn)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an already established stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = split(stream);
        Connection {
            reader: BufReader::with_capacity(BUFFER_SIZE, reader),
            writer,
            peer: None,
            state: ConnState::Open,
            read_timeout: None,
            write_timeout: None,
            line: Vec::with_capacity(LINE_CAPACITY),
        }
    }

    /// Apply read and write timeouts. The connect timeout is ignored here.
    pub fn with_timeouts(mut self, timeouts: &Timeouts) -> Self {
        self.read_timeout = timeouts.read;
        self.write_timeout = timeouts.write;
        self
    }

    /// Remote address, if the stream is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// Whether requests can still be issued on this connection.
    pub fn is_usable(&self) -> bool {
        self.state == ConnState::Open
    }

    /// Mark the stream as unusable, e.g. after a response failed to parse.
    pub fn mark_broken(&mut self, reason: impl Into<String>) {
        if self.state == ConnState::Open {
            self.state = ConnState::Broken(reason.into());
        }
    }

    /// Write one request line. The `\n` terminator is appended.
    pub async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.write_all(&buf).await
    }

    /// Write a buffer of already terminated request lines and flush it.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let writer = &mut self.writer;
        let result = with_timeout(self.write_timeout, "write", async move {
            writer.write_all(buf).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(()) => {
                trace!(bytes = buf.len(), "Wrote requests");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Read one response line as raw bytes, including its terminator.
    ///
    /// UTF-8 is checked by the decoder, not here. End of stream, including a
    /// final line without `\n`, is reported as [`ConnectionError::Closed`].
    pub async fn read_line(&mut self) -> Result<&[u8], ConnectionError> {
        self.ensure_open()?;
        self.line.clear();
        let result = with_timeout(
            self.read_timeout,
            "read",
            self.reader.read_until(b'\n', &mut self.line),
        )
        .await;

        match result {
            Ok(0) => Err(self.fail(ConnectionError::Closed)),
            Ok(_) if self.line.last() != Some(&b'\n') => Err(self.fail(ConnectionError::Closed)),
            Ok(_) => Ok(&self.line),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Shut down the write side and mark the connection closed.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.state = ConnState::Closed;
        self.writer.shutdown().await?;
        debug!(peer = ?self.peer, "Connection closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        match &self.state {
            ConnState::Open => Ok(()),
            ConnState::Broken(reason) => Err(ConnectionError::Broken(reason.clone())),
            ConnState::Closed => Err(ConnectionError::Broken("connection closed".to_string())),
        }
    }

    fn fail(&mut self, err: ConnectionError) -> ConnectionError {
        self.mark_broken(err.to_string());
        err
    }
}

/// Open `count` independent connections to the same server.
pub async fn connect_pool(
    addr: &str,
    count: usize,
    timeouts: &Timeouts,
) -> Result<Vec<Connection<TcpStream>>, ConnectionError> {
    let mut connections = Vec::with_capacity(count);
    for _ in 0..count {
        connections.push(Connection::connect(addr, timeouts).await?);
    }
    debug!(addr, count, "Connection pool ready");
    Ok(connections)
}

async fn with_timeout<T, F>(
    limit: Option<Duration>,
    op: &'static str,
    fut: F,
) -> Result<T, ConnectionError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(after) => match tokio::time::timeout(after, fut).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout { op, after }),
        },
        None => fut.await.map_err(ConnectionError::from),
    }
}
