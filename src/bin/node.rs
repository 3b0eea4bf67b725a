use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use serde_json::Map;
use syncdb::{Node, StorageConfig, SyncEngineConfig};

/// Runs one syncdb node: owns a local block DAG and document store, and
/// keeps them converged with every other node on the same account via the
/// broker at `--broker-url`. Also exposes a tiny REPL over the node's own
/// `Database` so the convergence engine can be driven without a real UI.
#[derive(Parser, Debug)]
#[command(name = "syncdb-node", version, about)]
struct Args {
    /// Identifier this node presents to the broker. Generated if omitted.
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Account id every check-in is scoped to.
    #[arg(long, env = "USER_ID")]
    user_id: String,

    /// Base URL of the broker, e.g. http://localhost:9090.
    #[arg(long, env = "BROKER_URL")]
    broker_url: String,

    /// Directory documents and blocks are persisted under.
    #[arg(long, env = "DATA_DIR", default_value = "./syncdb_data")]
    data_dir: String,

    /// Base interval between check-ins when nothing is changing.
    #[arg(long, env = "CHECK_IN_INTERVAL_MS", default_value_t = 5000)]
    check_in_interval_ms: u64,

    /// Upper bound on the check-in backoff once nothing new is found.
    #[arg(long, env = "MAX_CHECK_IN_BACKOFF_MS", default_value_t = 60_000)]
    max_check_in_backoff_ms: u64,

    /// Long-poll timeout asked of the broker's /pull-blocks endpoint.
    #[arg(long, env = "PULL_TIMEOUT_MS", default_value_t = 120_000)]
    pull_timeout_ms: u64,

    /// Accepted for compatibility with harnesses that generate synthetic
    /// load against this node; this build performs no data generation.
    #[arg(long, env = "MAX_GENERATION_TICKS")]
    max_generation_ticks: Option<u64>,

    /// Seeds the check-in backoff jitter, for reproducible test runs.
    #[arg(long, env = "RANDOM_SEED")]
    random_seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if args.max_generation_ticks.is_some() {
        tracing::debug!("MAX_GENERATION_TICKS accepted but unused: this build has no data generator");
    }

    let node_id = args.node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut engine_config = SyncEngineConfig::new(node_id.clone());
    engine_config.check_in_interval = Duration::from_millis(args.check_in_interval_ms);
    engine_config.max_check_in_backoff = Duration::from_millis(args.max_check_in_backoff_ms);
    engine_config.pull_long_poll_timeout = Duration::from_millis(args.pull_timeout_ms);
    engine_config.random_seed = args.random_seed;
    if let Some(seed) = args.random_seed {
        tracing::info!(seed, "check-in backoff jitter seeded for a reproducible run");
    }

    let node = Node::new(
        node_id.clone(),
        StorageConfig { data_dir: args.data_dir },
        args.broker_url,
        args.user_id,
        engine_config,
    )?;

    node.engine.start_sync().await?;
    tracing::info!(node_id = %node_id, "syncdb-node running");

    println!("syncdb-node interactive mode");
    println!("Commands: put <collection> <id> <field> <value>, get <collection> <id>, list <collection>, stats, quit");

    loop {
        print!("syncdb> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // no terminal attached (e.g. run under a harness) - fall back to
            // waiting on a signal instead of busy-looping on EOF.
            break;
        }

        let parts: Vec<&str> = input.trim().split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0] {
            "put" => {
                if parts.len() >= 4 {
                    let collection = parts[1];
                    let id = parts[2];
                    let field = parts[3];
                    let raw_value = parts[4..].join(" ");
                    let value = serde_json::from_str(&raw_value)
                        .unwrap_or_else(|_| serde_json::Value::String(raw_value));
                    let mut fields = Map::new();
                    fields.insert(field.to_string(), value);
                    match node.database.collection(collection).upsert_one(id, fields).await {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("Error: {e}"),
                    }
                } else {
                    println!("Usage: put <collection> <id> <field> <value>");
                }
            }
            "get" => {
                if parts.len() >= 3 {
                    let collection = parts[1];
                    let id = parts[2];
                    match node.database.collection(collection).get(id).await {
                        Ok(Some(doc)) => println!("{doc}"),
                        Ok(None) => println!("(nil)"),
                        Err(e) => println!("Error: {e}"),
                    }
                } else {
                    println!("Usage: get <collection> <id>");
                }
            }
            "list" => {
                if parts.len() >= 2 {
                    let collection = parts[1];
                    match node.database.collection(collection).get_all().await {
                        Ok(docs) if docs.is_empty() => println!("(empty)"),
                        Ok(docs) => {
                            for doc in docs {
                                println!("{doc}");
                            }
                        }
                        Err(e) => println!("Error: {e}"),
                    }
                } else {
                    println!("Usage: list <collection>");
                }
            }
            "stats" => {
                println!("syncdb-node statistics:");
                println!("  Node id: {node_id}");
                println!("  Head blocks: {}", node.engine.block_graph().get_head_block_ids().len());
                match node.database.hash().await {
                    Ok(hash) => println!("  Database hash: {hash}"),
                    Err(e) => println!("  Database hash: error ({e})"),
                }
            }
            "quit" | "exit" => {
                println!("Goodbye!");
                node.engine.stop_sync();
                return Ok(());
            }
            _ => {
                println!("Unknown command. Available: put, get, list, stats, quit");
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    node.engine.stop_sync();
    Ok(())
}
