//! A small demo binary: seeds a handful of tasks into an in-process
//! [`queue_memory::MemoryStore`], runs a toy processor against them through
//! a [`queue_core::TaskQueue`], and shuts down cleanly on Ctrl-C.

use std::time::Duration;

use clap::Parser;
use queue_core::{processor, Config, Store, TaskQueue, TaskSpec};
use queue_memory::MemoryStore;
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Prefix used to derive each worker's id, `"<queue-id>:<index>"`.
    #[arg(long, env = "QUEUE_ID", default_value = "demo")]
    queue_id: String,

    /// Number of Workers to run against the shared task node.
    #[arg(long, env = "QUEUE_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Only claim tasks whose `_state` equals this value; absent matches an
    /// unset `_state`.
    #[arg(long)]
    start_state: Option<String>,

    /// Number of demo tasks to seed before starting the pool.
    #[arg(long, default_value_t = 5)]
    seed: usize,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().without_time().with_filter(tracing_subscriber::EnvFilter::new(&args.log_level)))
        .init();

    let store = MemoryStore::new(args.queue_id.clone());
    for i in 0..args.seed {
        let mut task = json!({ "index": i });
        if let Some(state) = &args.start_state {
            task["_state"] = json!(state);
        }
        store.push(Some(task)).await?;
    }

    let spec = TaskSpec {
        start_state: args.start_state.clone(),
        ..TaskSpec::default()
    };

    let processor = processor::from_fn(|task, ctx| async move {
        let index = task.get("index").and_then(serde_json::Value::as_i64).unwrap_or(-1);
        tracing::info!(index, "processing task");
        ctx.set_progress(json!(50)).await.ok();
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(None)
    });

    let queue = TaskQueue::builder(store, spec, processor, args.queue_id)
        .config(Config { num_workers: args.workers, ..Config::default() })
        .build()?;

    tracing::info!(workers = ?queue.worker_ids(), "queue-cli starting up");
    let handle = queue.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("got signal, shutting down");
    handle.shutdown();
    handle.join().await;

    Ok(())
}
