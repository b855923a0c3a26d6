//! keyq CLI — drain a batch of messages through the key-partitioned queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use keyq::config::Config;
use keyq::model::{Message, Operation};
use keyq::queue::Queue;
use keyq::store::MemoryStore;
use keyq::telemetry::init_telemetry;
use keyq::worker::{PoolReport, WorkerPool};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "keyq", about = "Key-partitioned work queue")]
struct Cli {
    /// TOML config file (environment variables are used otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Max random store latency per apply, in milliseconds
    #[arg(long, global = true, default_value_t = 0)]
    latency_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue messages from a JSON array and drain them
    Run {
        /// File holding `[{"id", "key", "operation", "operand"}, ...]`
        #[arg(long)]
        input: PathBuf,
    },
    /// Generate SET-then-ADD/SUB traffic per item and drain it
    Demo {
        /// Number of distinct keys
        #[arg(long, default_value_t = 4)]
        items: usize,
        /// ADD/SUB pairs per key
        #[arg(long, default_value_t = 10)]
        rounds: usize,
        /// RNG seed for operands and arrival order
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Serialize)]
struct Output {
    values: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<BTreeMap<String, f64>>,
    #[serde(flatten)]
    report: PoolReport,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    anyhow::ensure!(config.workers > 0, "--workers must be at least 1");

    let _guard = init_telemetry(config.telemetry_config("keyq"))?;

    let store = if cli.latency_ms > 0 {
        MemoryStore::with_latency(Duration::from_millis(cli.latency_ms))
    } else {
        MemoryStore::new()
    };

    let (messages, expected) = match cli.command {
        Command::Run { input } => (read_messages(&input)?, None),
        Command::Demo {
            items,
            rounds,
            seed,
        } => {
            let (messages, expected) = demo_messages(items, rounds, seed);
            (messages, Some(expected))
        }
    };

    let output = drain(&config, store, messages, expected).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    if let Some(ref expected) = output.expected {
        anyhow::ensure!(
            *expected == output.values,
            "final values diverge from expected totals"
        );
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    })
}

fn read_messages(path: &Path) -> anyhow::Result<Vec<Message>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}

/// One SET 100 per item, followed by `rounds` ADD/SUB pairs per item in
/// shuffled order. Returns the messages and the totals they must produce.
fn demo_messages(items: usize, rounds: usize, seed: u64) -> (Vec<Message>, BTreeMap<String, f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut expected = BTreeMap::new();
    let mut messages = Vec::with_capacity(items * (1 + 2 * rounds));

    for i in 0..items {
        let key = format!("item{i}");
        messages.push(Message::new(&key, Operation::Set, 100.0));
        expected.insert(key, 100.0);
    }

    let mut updates = Vec::with_capacity(items * 2 * rounds);
    for i in 0..items {
        let key = format!("item{i}");
        for _ in 0..rounds {
            let add = f64::from(rng.gen_range(1..=10u32));
            let sub = f64::from(rng.gen_range(1..=10u32));
            updates.push(Message::new(&key, Operation::Add, add));
            updates.push(Message::new(&key, Operation::Sub, sub));
            if let Some(total) = expected.get_mut(&key) {
                *total += add - sub;
            }
        }
    }
    updates.shuffle(&mut rng);
    messages.extend(updates);

    (messages, expected)
}

async fn drain(
    config: &Config,
    store: MemoryStore,
    messages: Vec<Message>,
    expected: Option<BTreeMap<String, f64>>,
) -> anyhow::Result<Output> {
    let queue = Arc::new(Queue::with_config(config.queue_config()));
    let store = Arc::new(store);

    let count = messages.len();
    for message in messages {
        queue.enqueue(message);
    }
    tracing::info!(messages = count, workers = config.workers, ordering = %config.ordering, "draining");

    let pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        config.workers,
        config.worker_config(),
    );
    let shutdown = pool.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    let report = pool.run().await?;
    Ok(Output {
        values: store.snapshot()?,
        expected,
        report,
    })
}
