use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use syncdb::{Broker, BrokerConfig};

/// Runs the syncdb broker: a relay every node checks in with and long-polls
/// for new blocks from peers on the same account.
#[derive(Parser, Debug)]
#[command(name = "syncdb-broker", version, about)]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 9090)]
    port: u16,

    #[arg(long, env = "GC_INTERVAL_MS", default_value_t = 1000)]
    gc_interval_ms: u64,

    #[arg(long, env = "NODE_TIMEOUT_MS", default_value_t = 20_000)]
    node_timeout_ms: u64,

    #[arg(long, env = "PULL_TIMEOUT_MS", default_value_t = 120_000)]
    pull_timeout_ms: u64,

    #[arg(long, env = "MAX_NODES_PER_USER", default_value_t = 256)]
    max_nodes_per_user: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let broker = Arc::new(Broker::new(BrokerConfig {
        node_timeout: Duration::from_millis(args.node_timeout_ms),
        pull_timeout: Duration::from_millis(args.pull_timeout_ms),
        gc_interval: Duration::from_millis(args.gc_interval_ms),
        max_nodes_per_user: args.max_nodes_per_user,
    }));

    let _gc_handle = broker.clone().spawn_gc_loop();

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    syncdb::broker::http::serve(broker, addr).await?;
    Ok(())
}
