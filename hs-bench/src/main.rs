//! # HandlerSocket Client Benchmark
//!
//! Purpose: Drive a live HandlerSocket server through `hs-client` and report
//! throughput for inserts, point lookups and updates.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use fixed PRNG seeds for stable comparisons.
//! 2. **Allocation Control**: Pre-build keys before timing starts.
//! 3. **Shared Client**: All workers share one `Arc<HandlerSocket>`, so the
//!    numbers include correlation overhead on the two sockets.
//!
//! Usage: `hs-bench [rows] [ops] [workers] [database] [table]`. Client
//! settings (host, ports, timeouts) come from the JSON file named by
//! `HS_BENCH_CONFIG`, falling back to defaults.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use hs_client::{ClientConfig, ClientError, HandlerSocket, ModifyOp, Operator, PRIMARY_INDEX};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_ROW_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 100_000;
const DEFAULT_WORKERS: usize = 8;
const BENCH_INDEX: u32 = 1;

struct BenchConfig {
    rows: usize,
    ops: usize,
    workers: usize,
    database: String,
    table: String,
    client: ClientConfig,
}

impl BenchConfig {
    fn from_env() -> Result<Self> {
        let mut args = env::args().skip(1);
        let rows = parse_usize(args.next(), DEFAULT_ROW_COUNT).max(1);
        let ops = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let workers = parse_usize(args.next(), DEFAULT_WORKERS).max(1);
        let database = args.next().unwrap_or_else(|| "hstest".to_string());
        let table = args.next().unwrap_or_else(|| "hstest_table1".to_string());

        let client = match env::var("HS_BENCH_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading client config {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing client config {path}"))?
            }
            Err(_) => ClientConfig::default(),
        };

        Ok(BenchConfig {
            rows,
            ops,
            workers,
            database,
            table,
            client,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// Tiny deterministic PRNG; keeps the key sequence reproducible across runs.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, len: usize) -> usize {
        (self.next_u64() % len as u64) as usize
    }
}

fn build_keys(count: usize) -> Arc<Vec<String>> {
    Arc::new((0..count).map(|idx| format!("bench-{idx:08}")).collect())
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.1} us/op)");
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run().await {
        eprintln!("hs-bench failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = BenchConfig::from_env()?;
    let client = Arc::new(HandlerSocket::with_config(config.client.clone()));
    client
        .connect(&config.client.host)
        .await
        .context("connecting to server")?;
    client
        .open_index(
            BENCH_INDEX,
            &config.database,
            &config.table,
            PRIMARY_INDEX,
            &["k", "v"],
        )
        .await
        .context("opening bench index")?;

    info!(
        rows = config.rows,
        ops = config.ops,
        workers = config.workers,
        database = %config.database,
        table = %config.table,
        "starting benchmark"
    );
    let keys = build_keys(config.rows);

    let start = Instant::now();
    let mut duplicates = 0usize;
    for key in keys.iter() {
        match client.insert(BENCH_INDEX, &[key.as_str(), "seed"]).await {
            Ok(()) => {}
            Err(ClientError::DuplicateKey { .. }) => duplicates += 1,
            Err(err) => return Err(err).context("seeding rows"),
        }
    }
    if duplicates > 0 {
        warn!(duplicates, "rows already present from an earlier run");
    }
    report("INSERT", keys.len(), start.elapsed());

    let start = Instant::now();
    let found = run_workers(&client, &keys, &config, Workload::Find).await?;
    report("FIND", config.ops, start.elapsed());
    if found != config.ops {
        bail!("expected {} hits, found {found}", config.ops);
    }

    let start = Instant::now();
    let updated = run_workers(&client, &keys, &config, Workload::Update).await?;
    report("UPDATE", config.ops, start.elapsed());
    info!(updated, "benchmark finished");

    client.close()?;
    Ok(())
}

#[derive(Clone, Copy)]
enum Workload {
    Find,
    Update,
}

/// Splits `config.ops` across workers; returns matched (find) or affected
/// (update) row totals.
async fn run_workers(
    client: &Arc<HandlerSocket>,
    keys: &Arc<Vec<String>>,
    config: &BenchConfig,
    workload: Workload,
) -> Result<usize> {
    let per_worker = config.ops / config.workers;
    let remainder = config.ops % config.workers;
    let mut handles = Vec::with_capacity(config.workers);

    for worker in 0..config.workers {
        let client = client.clone();
        let keys = keys.clone();
        let ops = per_worker + usize::from(worker < remainder);
        let seed = 0x1234_5678_9ABC_DEF0 ^ (worker as u64 + 1);
        handles.push(tokio::spawn(async move {
            let mut rng = XorShift64::new(seed);
            let mut total = 0usize;
            for op in 0..ops {
                let key = keys[rng.next_index(keys.len())].as_str();
                total += match workload {
                    Workload::Find => client
                        .find(BENCH_INDEX, Operator::Eq, 1, 0, &[key])
                        .await?
                        .len(),
                    Workload::Update => {
                        let value = format!("w{worker}-{op}");
                        let affected = client
                            .modify(
                                BENCH_INDEX,
                                Operator::Eq,
                                1,
                                0,
                                ModifyOp::Update,
                                &[key],
                                &[key, value.as_str()],
                            )
                            .await?;
                        affected as usize
                    }
                };
            }
            Ok::<usize, ClientError>(total)
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.context("worker panicked")??;
    }
    Ok(total)
}
