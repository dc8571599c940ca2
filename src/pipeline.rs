//! Pipelined query execution over a single connection.
//!
//! The protocol has no request ids. Responses arrive strictly in request
//! order on one connection, so a response is matched to its query purely by
//! position:
//!
//! ```text
//! window 1:  write q0 q1 q2 q3 ──► read r0 r1 r2 r3
//! window 2:  write q4 q5 q6 q7 ──► read r4 r5 r6 r7
//! ```
//!
//! All requests of a window are written before any response is read, so the
//! window shares a single network round trip. The window size bounds how many
//! requests are in flight and how much is buffered on either side.
//!
//! ## Failures
//!
//! - An unencodable query fails on its own and is never written.
//! - A server error token fails its query; the stream stays in sync.
//! - A read/write failure fails every unread query of the window and breaks
//!   the connection, so all later windows fail without touching the stream.
//! - An unparseable response means the stream can no longer be trusted: it is
//!   treated like a stream failure for the rest of the window.
//!
//! Results of completed windows are never revisited.

use crate::connection::Connection;
use crate::error::{ErrorKind, QueryError};
use crate::protocol::{self, BlockValue, Query};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default number of in-flight requests per connection.
pub const DEFAULT_WINDOW: usize = 256;

/// Typical request line length, used to size the window buffer.
const REQUEST_LINE_HINT: usize = 32;

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    /// Position of the query in the submitted batch.
    pub index: usize,
    pub query: Query,
    pub outcome: Result<BlockValue, QueryError>,
}

impl QueryResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<BlockValue> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&QueryError> {
        self.outcome.as_ref().err()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(QueryError::kind)
    }
}

/// Counters for a streamed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Results produced but dropped because the receiver went away.
    pub undelivered: usize,
    /// Indices of queries never sent because the run was cancelled.
    pub abandoned: Vec<usize>,
    /// First failure that left the connection unusable.
    pub stream_error: Option<QueryError>,
}

/// Pipelining engine with a fixed window size.
#[derive(Debug, Clone, Copy)]
pub struct PipelineEngine {
    window: usize,
}

impl Default for PipelineEngine {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl PipelineEngine {
    /// Create an engine. A window of zero is treated as one.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Run a batch and return one result per query, in input order.
    ///
    /// `result[i]` always answers `queries[i]`. An empty batch does not touch
    /// the connection.
    pub async fn run_batch<S>(&self, conn: &mut Connection<S>, queries: &[Query]) -> Vec<QueryResult>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut results = Vec::with_capacity(queries.len());
        if queries.is_empty() {
            return results;
        }

        let indexed = index_queries(queries);
        for window in indexed.chunks(self.window) {
            results.extend(self.run_window(conn, window).await);
        }

        debug!(
            queries = queries.len(),
            failed = results.iter().filter(|r| !r.is_ok()).count(),
            "Batch complete"
        );
        results
    }

    /// Run a batch, sending each window's results to `sink` as soon as the
    /// window completes.
    ///
    /// Results within a window keep input order. If the receiver is dropped
    /// the remaining windows are not issued.
    pub async fn run_batch_streaming<S>(
        &self,
        conn: &mut Connection<S>,
        queries: &[Query],
        sink: &mpsc::Sender<QueryResult>,
    ) -> BatchSummary
    where
        S: AsyncRead + AsyncWrite,
    {
        let indexed = index_queries(queries);
        self.drive(conn, &indexed, sink, &CancellationToken::new())
            .await
    }

    /// Window loop shared by streaming callers.
    ///
    /// Cancellation is only observed between windows: a window that was
    /// written is always read back completely, so the connection can be
    /// reused afterwards.
    pub(crate) async fn drive<S>(
        &self,
        conn: &mut Connection<S>,
        items: &[(usize, Query)],
        sink: &mpsc::Sender<QueryResult>,
        cancel: &CancellationToken,
    ) -> BatchSummary
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut summary = BatchSummary::default();

        for (n, window) in items.chunks(self.window).enumerate() {
            if cancel.is_cancelled() || sink.is_closed() {
                summary
                    .abandoned
                    .extend(items[n * self.window..].iter().map(|&(index, _)| index));
                debug!(abandoned = summary.abandoned.len(), "Stopped issuing requests");
                break;
            }

            for result in self.run_window(conn, window).await {
                match &result.outcome {
                    Ok(_) => summary.succeeded += 1,
                    Err(e) => {
                        summary.failed += 1;
                        if summary.stream_error.is_none() && !e.keeps_stream_in_sync() {
                            summary.stream_error = Some(e.clone());
                        }
                    }
                }
                if sink.send(result).await.is_err() {
                    summary.undelivered += 1;
                }
            }
        }

        summary
    }

    /// Encode, write and read back one window.
    pub(crate) async fn run_window<S>(
        &self,
        conn: &mut Connection<S>,
        items: &[(usize, Query)],
    ) -> Vec<QueryResult>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut outcomes: Vec<Option<Result<BlockValue, QueryError>>> = vec![None; items.len()];
        let mut requests = BytesMut::with_capacity(items.len() * REQUEST_LINE_HINT);
        let mut pending = Vec::with_capacity(items.len());

        for (slot, (_, query)) in items.iter().enumerate() {
            match protocol::encode_into(query, &mut requests) {
                Ok(()) => pending.push(slot),
                Err(e) => {
                    debug!(%query, error = %e, "Rejected query");
                    outcomes[slot] = Some(Err(e));
                }
            }
        }

        if !pending.is_empty() {
            exchange(conn, items, &pending, &requests, &mut outcomes).await;
        }

        items
            .iter()
            .zip(outcomes)
            .map(|(&(index, query), outcome)| QueryResult {
                index,
                query,
                outcome: outcome
                    .unwrap_or_else(|| Err(QueryError::Connection("no response read".to_string()))),
            })
            .collect()
    }
}

/// Write the pending requests of a window and pair the responses with them.
async fn exchange<S>(
    conn: &mut Connection<S>,
    items: &[(usize, Query)],
    pending: &[usize],
    requests: &[u8],
    outcomes: &mut [Option<Result<BlockValue, QueryError>>],
) where
    S: AsyncRead + AsyncWrite,
{
    if let Err(e) = conn.write_all(requests).await {
        warn!(error = %e, lost = pending.len(), "Failed to write window");
        fail_all(pending, outcomes, &QueryError::from(&e));
        return;
    }

    for (k, &slot) in pending.iter().enumerate() {
        let kind = items[slot].1.kind;
        let decoded = match conn.read_line().await {
            Ok(line) => protocol::decode_line(kind, line),
            Err(e) => {
                warn!(error = %e, lost = pending.len() - k, "Connection failed mid-window");
                fail_all(&pending[k..], outcomes, &QueryError::from(&e));
                return;
            }
        };

        match decoded {
            Err(e @ QueryError::Decoding { .. }) => {
                warn!(error = %e, lost = pending.len() - k - 1, "Response stream out of sync");
                conn.mark_broken(e.to_string());
                outcomes[slot] = Some(Err(e));
                let desync = QueryError::Connection(
                    "stream desynchronized by an unparseable response".to_string(),
                );
                fail_all(&pending[k + 1..], outcomes, &desync);
                return;
            }
            outcome => {
                trace!(query = %items[slot].1, ?outcome, "Response");
                outcomes[slot] = Some(outcome);
            }
        }
    }
}

fn fail_all(
    slots: &[usize],
    outcomes: &mut [Option<Result<BlockValue, QueryError>>],
    err: &QueryError,
) {
    for &slot in slots {
        outcomes[slot] = Some(Err(err.clone()));
    }
}

fn index_queries(queries: &[Query]) -> Vec<(usize, Query)> {
    queries.iter().copied().enumerate().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    fn blocks(n: i64) -> Vec<Query> {
        (0..n).map(|i| Query::block(i, 0, 0)).collect()
    }

    fn requests(queries: &[Query]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for query in queries {
            protocol::encode_into(query, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_touch_stream() {
        let mut conn = Connection::new(Builder::new().build());
        let engine = PipelineEngine::new(8);

        let results = engine.run_batch(&mut conn, &[]).await;
        assert!(results.is_empty());
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_single_query() {
        let mock = Builder::new()
            .write(b"world.getBlock(0,0,0)\n")
            .read(b"1\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::default()
            .run_batch(&mut conn, &[Query::block(0, 0, 0)])
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, 0);
        assert_eq!(results[0].query, Query::block(0, 0, 0));
        assert_eq!(results[0].value(), Some(BlockValue::Block(1)));
    }

    #[tokio::test]
    async fn test_order_preserved_across_windows() {
        let queries = blocks(5);
        let mock = Builder::new()
            .write(&requests(&queries[..2]))
            .read(b"10\n11\n")
            .write(&requests(&queries[2..4]))
            .read(b"12\n13\n")
            .write(&requests(&queries[4..]))
            .read(b"14\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::new(2).run_batch(&mut conn, &queries).await;
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.query, queries[i]);
            assert_eq!(result.value(), Some(BlockValue::Block(10 + i as i32)));
        }
    }

    #[tokio::test]
    async fn test_mixed_kinds() {
        let queries = vec![
            Query::block(1, 2, 3),
            Query::block_with_data(1, 2, 3),
            Query::height(1, 3),
        ];
        let mock = Builder::new()
            .write(&requests(&queries))
            .read(b"35\n35,4\n")
            .read(b"64\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::default().run_batch(&mut conn, &queries).await;
        assert_eq!(results[0].value(), Some(BlockValue::Block(35)));
        assert_eq!(
            results[1].value(),
            Some(BlockValue::BlockWithData { id: 35, data: 4 })
        );
        assert_eq!(results[2].value(), Some(BlockValue::Height(64)));
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_earlier_windows() {
        let queries = blocks(5);
        let mock = Builder::new()
            .write(&requests(&queries[..2]))
            .read(b"1\n2\n")
            .write(&requests(&queries[2..4]))
            .read(b"3\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::new(2).run_batch(&mut conn, &queries).await;
        assert_eq!(results.len(), 5);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(results[2].value(), Some(BlockValue::Block(3)));
        for result in &results[3..] {
            assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        }
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_write_failure_fails_rest_of_batch() {
        let queries = blocks(6);
        let mock = Builder::new()
            .write(&requests(&queries[..2]))
            .read(b"1\n2\n")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::new(2).run_batch(&mut conn, &queries).await;
        assert_eq!(results.len(), queries.len());
        assert_eq!(results[0].value(), Some(BlockValue::Block(1)));
        assert_eq!(results[1].value(), Some(BlockValue::Block(2)));
        for result in &results[2..] {
            assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        }
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_decoding_error_breaks_connection() {
        let queries = blocks(5);
        // Only the first window may touch the stream.
        let mock = Builder::new()
            .write(&requests(&queries[..3]))
            .read(b"1\nnot-a-number\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::new(3).run_batch(&mut conn, &queries).await;
        assert_eq!(results.len(), 5);
        assert!(results[0].is_ok());
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Decoding));
        for result in &results[2..] {
            assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        }
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_non_utf8_response_is_decoding_error() {
        let queries = blocks(2);
        let mock = Builder::new()
            .write(&requests(&queries))
            .read(b"\xff\xfe\n2\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::default().run_batch(&mut conn, &queries).await;
        let kinds: Vec<_> = results.iter().map(QueryResult::error_kind).collect();
        assert_eq!(kinds, vec![Some(ErrorKind::Decoding), Some(ErrorKind::Connection)]);
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_server_error_keeps_stream() {
        let queries = blocks(3);
        let mock = Builder::new()
            .write(&requests(&queries))
            .read(b"1\nFail\n3\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::default().run_batch(&mut conn, &queries).await;
        assert!(results[0].is_ok());
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Server));
        assert_eq!(results[2].value(), Some(BlockValue::Block(3)));
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_unencodable_query_is_not_sent() {
        let queries = vec![
            Query::block(0, 0, 0),
            Query::block(i64::MAX, 0, 0),
            Query::block(2, 0, 0),
        ];
        let sent = [queries[0], queries[2]];
        let mock = Builder::new()
            .write(&requests(&sent))
            .read(b"1\n3\n")
            .build();
        let mut conn = Connection::new(mock);

        let results = PipelineEngine::default().run_batch(&mut conn, &queries).await;
        assert_eq!(results[0].value(), Some(BlockValue::Block(1)));
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Encoding));
        assert_eq!(results[1].query, queries[1]);
        assert_eq!(results[2].value(), Some(BlockValue::Block(3)));
    }

    #[tokio::test]
    async fn test_streaming_emits_in_order() {
        let queries = blocks(4);
        let mock = Builder::new()
            .write(&requests(&queries[..3]))
            .read(b"0\n1\n2\n")
            .write(&requests(&queries[3..]))
            .read(b"3\n")
            .build();
        let mut conn = Connection::new(mock);
        let (tx, mut rx) = mpsc::channel(16);

        let summary = PipelineEngine::new(3)
            .run_batch_streaming(&mut conn, &queries, &tx)
            .await;
        drop(tx);

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 0);
        assert!(summary.abandoned.is_empty());

        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            seen.push(result.index);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_streaming_stops_when_receiver_dropped() {
        let queries = blocks(4);
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock);
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let summary = PipelineEngine::new(2)
            .run_batch_streaming(&mut conn, &queries, &tx)
            .await;
        assert_eq!(summary.abandoned, vec![0, 1, 2, 3]);
        assert!(conn.is_usable());
    }

    #[tokio::test]
    async fn test_cancelled_drive_issues_nothing() {
        let queries = index_queries(&blocks(3));
        let mut conn = Connection::new(Builder::new().build());
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = PipelineEngine::new(2)
            .drive(&mut conn, &queries, &tx, &cancel)
            .await;
        assert_eq!(summary.abandoned, vec![0, 1, 2]);
        assert_eq!(summary.succeeded + summary.failed, 0);
    }

    #[test]
    fn test_zero_window_clamped() {
        assert_eq!(PipelineEngine::new(0).window(), 1);
    }
}
