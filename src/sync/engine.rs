use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::SyncError;
use crate::graph::{BlockGraph, PendingBlockMap};
use crate::model::{Block, NodeId, Update};
use crate::storage::Storage;
use crate::sync::{check_in, receive_blocks, BrokerClient, IncomingSink};

#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub node_id: NodeId,
    pub check_in_interval: Duration,
    pub max_check_in_backoff: Duration,
    pub pull_retry_delay: Duration,
    /// How long the broker's `/pull-blocks` long-poll is allowed to block.
    /// Used as the floor for the HTTP client's own request timeout so a slow
    /// broker response isn't mistaken for a transport failure.
    pub pull_long_poll_timeout: Duration,
    /// Seeds the check-in loop's backoff-jitter RNG. `None` draws from OS
    /// entropy; set for reproducible harness runs.
    pub random_seed: Option<u64>,
}

impl SyncEngineConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            check_in_interval: Duration::from_secs(5),
            max_check_in_backoff: Duration::from_secs(60),
            pull_retry_delay: Duration::from_millis(500),
            pull_long_poll_timeout: Duration::from_millis(120_000),
            random_seed: None,
        }
    }
}

/// Owns a node's [`BlockGraph`] and [`PendingBlockMap`] and drives the two
/// network loops `SyncCore` needs to stay converged: a check-in tick and a
/// pull long-poll. A third, purely local task bridges [`crate::collection`]'s
/// outgoing updates into `graph.commit` — it isn't one of the two protocol
/// loops, just plumbing so `Database` doesn't need a direct reference back
/// into the engine.
pub struct SyncEngine<S: Storage, C: BrokerClient> {
    node_id: NodeId,
    graph: Arc<BlockGraph<S>>,
    pending: Arc<PendingBlockMap>,
    client: Arc<C>,
    config: SyncEngineConfig,
    running: Arc<AtomicBool>,
    outgoing_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<Update>>>,
    on_incoming: Arc<IncomingSink>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    jitter_rng: AsyncMutex<StdRng>,
}

impl<S, C> SyncEngine<S, C>
where
    S: Storage + 'static,
    C: BrokerClient + 'static,
{
    pub fn new(
        graph: Arc<BlockGraph<S>>,
        pending: Arc<PendingBlockMap>,
        client: Arc<C>,
        outgoing_rx: mpsc::UnboundedReceiver<Vec<Update>>,
        on_incoming: impl Fn(Vec<Update>) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync + 'static,
        config: SyncEngineConfig,
    ) -> Arc<Self> {
        let jitter_rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Arc::new(Self {
            node_id: config.node_id.clone(),
            graph,
            pending,
            client,
            config,
            running: Arc::new(AtomicBool::new(false)),
            outgoing_rx: AsyncMutex::new(outgoing_rx),
            on_incoming: Arc::new(on_incoming),
            handles: std::sync::Mutex::new(Vec::new()),
            jitter_rng: AsyncMutex::new(jitter_rng),
        })
    }

    /// Loads persisted head state and spawns the check-in, pull, and
    /// outgoing-bridge tasks. Idempotent calls after the first are no-ops
    /// while the engine is already running.
    pub async fn start_sync(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.graph.load_head_blocks().await?;

        let outgoing = self.clone();
        let check_in_task = self.clone();
        let pull_task = self.clone();
        let handles = vec![
            tokio::spawn(async move { outgoing.outgoing_bridge_loop().await }),
            tokio::spawn(async move { check_in_task.check_in_loop().await }),
            tokio::spawn(async move { pull_task.pull_loop().await }),
        ];
        *self.handles.lock().unwrap() = handles;

        tracing::info!(node_id = %self.node_id, "sync engine started");
        Ok(())
    }

    /// Signals all three loops to exit at their next opportunity. Does not
    /// block — loops observe `running` between iterations and unwind on
    /// their own schedule (the pull loop may be mid-long-poll).
    pub fn stop_sync(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(node_id = %self.node_id, "sync engine stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn commit_updates(&self, updates: Vec<Update>) -> Result<Block, SyncError> {
        self.graph.commit(updates).await
    }

    pub fn block_graph(&self) -> Arc<BlockGraph<S>> {
        self.graph.clone()
    }

    async fn outgoing_bridge_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut rx = self.outgoing_rx.lock().await;
                rx.recv().await
            };
            match next {
                Some(updates) => {
                    if let Err(err) = self.graph.commit(updates).await {
                        tracing::error!(error = %err, "failed to commit outgoing updates");
                    }
                }
                None => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    async fn check_in_loop(self: Arc<Self>) {
        let mut backoff = self.config.check_in_interval;
        while self.running.load(Ordering::SeqCst) {
            let heads_before = self.graph.get_head_block_ids();
            if let Err(err) = check_in(&self.node_id, &self.graph, &self.pending, self.client.as_ref()).await
            {
                tracing::error!(error = %err, "check-in failed");
            }
            let heads_after = self.graph.get_head_block_ids();

            backoff = if heads_before == heads_after {
                (backoff * 2).min(self.config.max_check_in_backoff)
            } else {
                self.config.check_in_interval
            };

            let jitter_ms: u64 = self.jitter_rng.lock().await.gen_range(0..250);
            tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
        }
    }

    async fn pull_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let on_incoming = self.on_incoming.clone();
            let result =
                receive_blocks(&self.graph, &self.pending, self.client.as_ref(), on_incoming.as_ref())
                    .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "receive-blocks failed");
                tokio::time::sleep(self.config.pull_retry_delay).await;
            }
        }
    }
}
