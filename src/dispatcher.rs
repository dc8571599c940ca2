//! Concurrent dispatch of a query set across several connections.
//!
//! The query set is split into disjoint shards, one per connection. Each
//! shard runs its own [`PipelineEngine`] on its own tokio task and owns its
//! connection outright, so no locking happens on the I/O path. Results from
//! all shards are merged into one bounded channel as windows complete.
//!
//! Every shard keeps input order internally, but the merged stream is in no
//! particular order. Each [`QueryResult`] carries its query and its index in
//! the submitted batch, so callers can always map it back.
//!
//! A failing shard only loses its own pending queries. The other shards keep
//! running and their results are still delivered. The [`DispatchReport`]
//! returned at the end lists which shards failed and what was lost.

use crate::connection::Connection;
use crate::pipeline::{BatchSummary, PipelineEngine, QueryResult};
use crate::protocol::Query;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Results buffered in the merge channel per pipeline window.
const CHANNEL_WINDOWS: usize = 4;

/// How queries are assigned to connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardingStrategy {
    /// Query `i` goes to connection `i % n`.
    #[default]
    RoundRobin,
    /// Consecutive runs of queries go to the same connection.
    Contiguous,
}

impl ShardingStrategy {
    /// Split queries into `shards` disjoint, indexed sets.
    ///
    /// Always returns exactly `shards` sets (at least one); some may be empty.
    pub fn split(&self, queries: Vec<Query>, shards: usize) -> Vec<Vec<(usize, Query)>> {
        let shards = shards.max(1);
        let mut out: Vec<Vec<(usize, Query)>> = (0..shards)
            .map(|_| Vec::with_capacity(queries.len().div_ceil(shards)))
            .collect();

        match self {
            ShardingStrategy::RoundRobin => {
                for (index, query) in queries.into_iter().enumerate() {
                    out[index % shards].push((index, query));
                }
            }
            ShardingStrategy::Contiguous => {
                let per_shard = queries.len().div_ceil(shards).max(1);
                for (index, query) in queries.into_iter().enumerate() {
                    out[index / per_shard].push((index, query));
                }
            }
        }

        out
    }
}

/// Outcome of one shard.
#[derive(Debug)]
pub struct ShardReport<S> {
    pub shard: usize,
    /// Number of queries assigned to the shard.
    pub assigned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Results produced after the receiver went away.
    pub undelivered: usize,
    /// Batch indices of queries that were never sent.
    pub abandoned: Vec<usize>,
    /// Why the shard's connection became unusable, if it did.
    pub error: Option<String>,
    /// The shard's connection, if it can be reused.
    pub connection: Option<Connection<S>>,
}

impl<S> ShardReport<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn finished(shard: usize, assigned: usize, summary: BatchSummary, conn: Connection<S>) -> Self {
        ShardReport {
            shard,
            assigned,
            succeeded: summary.succeeded,
            failed: summary.failed,
            undelivered: summary.undelivered,
            abandoned: summary.abandoned,
            error: summary.stream_error.map(|e| e.to_string()),
            connection: conn.is_usable().then_some(conn),
        }
    }
}

impl<S> ShardReport<S> {
    fn crashed(shard: usize, assigned: usize, reason: String) -> Self {
        ShardReport {
            shard,
            assigned,
            succeeded: 0,
            failed: 0,
            undelivered: 0,
            abandoned: Vec::new(),
            error: Some(reason),
            connection: None,
        }
    }

    /// Queries of this shard whose result never reached the caller.
    ///
    /// For a crashed shard this is an upper bound.
    pub fn lost(&self) -> usize {
        let delivered = (self.succeeded + self.failed).saturating_sub(self.undelivered);
        self.assigned.saturating_sub(delivered)
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Outcome of a concurrent run.
#[derive(Debug)]
pub struct DispatchReport<S> {
    /// One report per shard, ordered by shard number.
    pub shards: Vec<ShardReport<S>>,
    /// Queries that had no connection to run on.
    pub unassigned: Vec<usize>,
}

impl<S> DispatchReport<S> {
    /// Shards whose connection failed.
    pub fn failed_shards(&self) -> impl Iterator<Item = &ShardReport<S>> {
        self.shards.iter().filter(|s| s.is_failed())
    }

    /// Total results that never reached the caller.
    pub fn lost(&self) -> usize {
        self.shards.iter().map(ShardReport::lost).sum::<usize>() + self.unassigned.len()
    }

    /// Total results tagged as failed.
    pub fn failed(&self) -> usize {
        self.shards.iter().map(|s| s.failed).sum()
    }

    /// Every query produced a result (successful or not).
    pub fn is_complete(&self) -> bool {
        self.lost() == 0
    }

    /// Sorted batch indices of all queries that were never sent.
    pub fn abandoned(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .shards
            .iter()
            .flat_map(|s| s.abandoned.iter().copied())
            .chain(self.unassigned.iter().copied())
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Take back the connections that are still usable.
    pub fn into_connections(self) -> Vec<Connection<S>> {
        self.shards
            .into_iter()
            .filter_map(|s| s.connection)
            .collect()
    }
}

/// Fans a query set out over a pool of connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher {
    engine: PipelineEngine,
    strategy: ShardingStrategy,
}

impl Dispatcher {
    pub fn new(engine: PipelineEngine, strategy: ShardingStrategy) -> Self {
        Dispatcher { engine, strategy }
    }

    pub fn engine(&self) -> &PipelineEngine {
        &self.engine
    }

    pub fn strategy(&self) -> ShardingStrategy {
        self.strategy
    }

    /// Start a concurrent run. Must be called from within a tokio runtime.
    ///
    /// Each connection is moved into its own shard task; usable ones are
    /// handed back in the final [`DispatchReport`].
    pub fn run_concurrent<S>(&self, connections: Vec<Connection<S>>, queries: Vec<Query>) -> ConcurrentRun<S>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let total = queries.len();
        let cancel = CancellationToken::new();
        let capacity = (self.engine.window() * CHANNEL_WINDOWS).max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let mut unassigned = Vec::new();
        let mut tasks = Vec::with_capacity(connections.len());

        if connections.is_empty() {
            warn!(queries = total, "No connections available, nothing dispatched");
            unassigned.extend(0..total);
        } else {
            let shards = self.strategy.split(queries, connections.len());
            for (shard, (mut conn, items)) in connections.into_iter().zip(shards).enumerate() {
                let assigned = items.len();
                let engine = self.engine;
                let tx = tx.clone();
                let cancel = cancel.clone();

                let handle = tokio::spawn(async move {
                    debug!(shard, assigned, "Shard started");
                    let summary = engine.drive(&mut conn, &items, &tx, &cancel).await;
                    if let Some(e) = &summary.stream_error {
                        warn!(shard, error = %e, "Shard connection failed");
                    }
                    ShardReport::finished(shard, assigned, summary, conn)
                });
                tasks.push(ShardTask {
                    shard,
                    assigned,
                    handle,
                });
            }
        }

        info!(
            queries = total,
            shards = tasks.len(),
            window = self.engine.window(),
            strategy = ?self.strategy,
            "Concurrent run started"
        );

        ConcurrentRun {
            results: rx,
            tasks,
            unassigned,
            _guard: cancel.clone().drop_guard(),
            cancel,
            total,
        }
    }
}

struct ShardTask<S> {
    shard: usize,
    assigned: usize,
    handle: JoinHandle<ShardReport<S>>,
}

/// A running concurrent dispatch.
///
/// Dropping it cancels the run: shards finish the window they are reading,
/// then stop issuing requests.
pub struct ConcurrentRun<S> {
    results: mpsc::Receiver<QueryResult>,
    tasks: Vec<ShardTask<S>>,
    unassigned: Vec<usize>,
    cancel: CancellationToken,
    _guard: DropGuard,
    total: usize,
}

impl<S> ConcurrentRun<S> {
    /// Number of queries submitted.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Token that stops the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next result from any shard, or `None` once every shard has finished.
    pub async fn next(&mut self) -> Option<QueryResult> {
        self.results.recv().await
    }

    /// Wait for all shards and gather every remaining result, unordered.
    pub async fn collect(mut self) -> (Vec<QueryResult>, DispatchReport<S>) {
        let mut results = Vec::with_capacity(self.total);
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        let report = self.join().await;
        (results, report)
    }

    /// Like [`collect`](Self::collect), with results sorted back into input order.
    pub async fn collect_ordered(self) -> (Vec<QueryResult>, DispatchReport<S>) {
        let (mut results, report) = self.collect().await;
        results.sort_by_key(|r| r.index);
        (results, report)
    }

    /// Stop the run and discard results not yet received.
    ///
    /// Shards drain the window they already wrote before stopping, so the
    /// connections in the report are safe to reuse.
    pub async fn abandon(mut self) -> DispatchReport<S> {
        self.cancel.cancel();
        self.results.close();
        while self.results.recv().await.is_some() {}
        self.join().await
    }

    async fn join(self) -> DispatchReport<S> {
        let mut shards = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.handle.await {
                Ok(report) => shards.push(report),
                Err(e) => {
                    warn!(shard = task.shard, error = %e, "Shard task failed");
                    shards.push(ShardReport::crashed(
                        task.shard,
                        task.assigned,
                        format!("shard task failed: {e}"),
                    ));
                }
            }
        }

        let report = DispatchReport {
            shards,
            unassigned: self.unassigned,
        };
        info!(
            queries = self.total,
            failed = report.failed(),
            lost = report.lost(),
            failed_shards = report.failed_shards().count(),
            "Concurrent run finished"
        );
        report
    }
}
