//! mcpi-fast-query: bulk block queries against a Minecraft Pi server
//!
//! Queries every position of a cuboid region and prints the results in
//! region order.
//!
//! Modes:
//! - One connection: a single pipelined connection
//! - Several connections: queries sharded across parallel pipelines
//!
//! Configuration via CLI arguments or TOML file.

use mcpi_fast_query::config::Config;
use mcpi_fast_query::{connect_pool, Connection, Dispatcher, PipelineEngine, Query, QueryResult};
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let queries = config.region.queries(config.kind);

    info!(
        server = %config.server,
        kind = ?config.kind,
        queries = queries.len(),
        window = config.window,
        connections = config.connections,
        "Starting block queries"
    );

    let engine = PipelineEngine::new(config.window);
    let start = Instant::now();

    let results = if config.connections <= 1 {
        run_single(&config, engine, &queries).await?
    } else {
        run_sharded(&config, engine, queries).await?
    };

    let elapsed = start.elapsed();
    let failed = results.iter().filter(|r| !r.is_ok()).count();

    print_results(&results)?;

    info!(
        queries = results.len(),
        failed,
        elapsed_ms = elapsed.as_millis() as u64,
        per_second = (results.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "Finished block queries"
    );
    if failed > 0 {
        warn!(failed, "Some queries failed; rerun to retry them");
    }

    Ok(())
}

/// Run all queries over one pipelined connection
async fn run_single(
    config: &Config,
    engine: PipelineEngine,
    queries: &[Query],
) -> Result<Vec<QueryResult>, Box<dyn std::error::Error>> {
    info!("Using single pipeline");
    let mut conn = Connection::connect(&config.server, &config.timeouts).await?;
    let results = engine.run_batch(&mut conn, queries).await;
    if conn.is_usable() {
        conn.close().await?;
    }
    Ok(results)
}

/// Shard the queries across a pool of connections
async fn run_sharded(
    config: &Config,
    engine: PipelineEngine,
    queries: Vec<Query>,
) -> Result<Vec<QueryResult>, Box<dyn std::error::Error>> {
    info!(strategy = ?config.sharding, "Using concurrent dispatcher");
    let pool = connect_pool(&config.server, config.connections, &config.timeouts).await?;

    let dispatcher = Dispatcher::new(engine, config.sharding);
    let (results, report) = dispatcher.run_concurrent(pool, queries).collect_ordered().await;

    for shard in report.failed_shards() {
        warn!(
            shard = shard.shard,
            lost = shard.lost(),
            failed = shard.failed,
            error = shard.error.as_deref().unwrap_or_default(),
            "Shard failed"
        );
    }
    for mut conn in report.into_connections() {
        conn.close().await?;
    }
    Ok(results)
}

fn print_results(results: &[QueryResult]) -> std::io::Result<()> {
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for result in results {
        let q = &result.query;
        match &result.outcome {
            Ok(value) => writeln!(out, "{},{},{}\t{}", q.x, q.y, q.z, value)?,
            Err(e) => writeln!(out, "{},{},{}\terror: {}", q.x, q.y, q.z, e)?,
        }
    }
    out.flush()
}
