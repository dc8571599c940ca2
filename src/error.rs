//! Error types for block queries.
//!
//! Two layers:
//! - [`ConnectionError`]: stream-level failures raised by [`Connection`](crate::Connection).
//! - [`QueryError`]: the per-query failure carried inside a
//!   [`QueryResult`](crate::QueryResult). It is `Clone` because one stream
//!   failure fails every query still waiting on that stream.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure category of a query, without its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The query cannot be expressed on the wire.
    Encoding,
    /// The server sent a line that does not parse.
    Decoding,
    /// The server answered with its error token.
    Server,
    /// The stream failed before the response was read.
    Connection,
}

/// Why a single query did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The query is outside the representable range of the protocol.
    #[error("cannot encode query: {0}")]
    Encoding(String),

    /// The response line could not be parsed. The stream is out of sync.
    #[error("cannot decode response {line:?}: {reason}")]
    Decoding { line: String, reason: String },

    /// The server replied with an error token.
    #[error("server rejected query: {0}")]
    Server(String),

    /// No matching response was read.
    #[error("connection error: {0}")]
    Connection(String),
}

impl QueryError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Encoding(_) => ErrorKind::Encoding,
            QueryError::Decoding { .. } => ErrorKind::Decoding,
            QueryError::Server(_) => ErrorKind::Server,
            QueryError::Connection(_) => ErrorKind::Connection,
        }
    }

    /// Whether the connection that produced this error can keep being used.
    pub fn keeps_stream_in_sync(&self) -> bool {
        matches!(self, QueryError::Encoding(_) | QueryError::Server(_))
    }
}

impl From<&ConnectionError> for QueryError {
    fn from(err: &ConnectionError) -> Self {
        QueryError::Connection(err.to_string())
    }
}

/// Stream-level failure.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Closed,

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// An earlier failure left the stream unusable.
    #[error("connection unusable: {0}")]
    Broken(String),
}
