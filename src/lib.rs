//! mcpi-fast-query: fast bulk block queries for the Minecraft Pi protocol.
//!
//! The server answers one request line with one response line, strictly in
//! order. A naive client waits a full round trip per query. This crate hides
//! that latency two ways:
//!
//! - [`PipelineEngine`]: writes a whole window of requests before reading any
//!   response, matching responses to queries by position.
//! - [`Dispatcher`]: splits a query set across several connections and runs
//!   one pipeline per connection in parallel, merging results as they arrive.
//!
//! ```no_run
//! use mcpi_fast_query::{BlockQueryKind, Connection, PipelineEngine, Position, Region, Timeouts};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut conn = Connection::connect("127.0.0.1:4711", &Timeouts::default()).await?;
//! let region = Region::new(Position::new(-2, 0, -2), Position::new(2, 0, 2))?;
//! let queries = region.queries(BlockQueryKind::BlockTypeWithData);
//!
//! for result in PipelineEngine::default().run_batch(&mut conn, &queries).await {
//!     println!("{} -> {:?}", result.query, result.outcome);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod region;

pub use connection::{connect_pool, ConnState, Connection, Timeouts};
pub use dispatcher::{ConcurrentRun, DispatchReport, Dispatcher, ShardReport, ShardingStrategy};
pub use error::{ConnectionError, ErrorKind, QueryError};
pub use pipeline::{BatchSummary, PipelineEngine, QueryResult, DEFAULT_WINDOW};
pub use protocol::{BlockQueryKind, BlockValue, Query};
pub use region::{Position, Region, RegionError};
