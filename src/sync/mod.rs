//! `SyncCore`: the two transport-agnostic procedures a node runs against the
//! broker. Both are pure with respect to the network — everything they need
//! from the broker goes through [`BrokerClient`], so they can be exercised in
//! tests against a fake in the same process.

pub mod engine;
pub mod http_client;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::SyncError;
use crate::graph::{BlockGraph, PendingBlockMap};
use crate::model::{Block, HeadBlockDetails, NodeId, Update};
use crate::storage::Storage;

pub use engine::{SyncEngine, SyncEngineConfig};
pub use http_client::HttpBrokerClient;

/// A callback invoked with every update a node learns about from a peer,
/// already merged and sorted into deterministic replay order. Returns a
/// future because applying updates touches storage.
pub type IncomingSink = dyn Fn(Vec<Update>) -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync;

/// Everything `SyncCore` needs from the broker. A real node talks to
/// [`HttpBrokerClient`]; tests can supply an in-memory fake.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn check_in(
        &self,
        head_blocks: Vec<HeadBlockDetails>,
    ) -> Result<crate::wire::CheckInResponse, SyncError>;

    async fn push_blocks(&self, to_node: &NodeId, blocks: Vec<Block>) -> Result<(), SyncError>;

    async fn request_blocks(&self, required: Vec<Uuid>) -> Result<(), SyncError>;

    async fn pull_blocks(&self) -> Result<Vec<Block>, SyncError>;
}

/// Advertises this node's current heads to the broker, pushes any blocks a
/// peer asked for, and asks the broker to have peers push back any blocks
/// this node is missing. Transport failures are logged and swallowed: the
/// next tick simply tries again.
pub async fn check_in<S: Storage, C: BrokerClient>(
    node_id: &NodeId,
    graph: &BlockGraph<S>,
    pending: &PendingBlockMap,
    client: &C,
) -> Result<(), SyncError> {
    let mut head_blocks = Vec::new();
    for id in graph.get_head_block_ids() {
        if let Some(block) = graph.get_block(id).await? {
            head_blocks.push(block.head_details());
        }
    }

    let response = match client.check_in(head_blocks).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "check-in transport failure, will retry next tick");
            return Ok(());
        }
    };

    if let Some(wants_data) = &response.wants_data {
        for (peer_id, want) in wants_data {
            if peer_id == node_id {
                continue;
            }
            let mut resolved = Vec::new();
            for hash in &want.required_hashes {
                let Ok(id) = Uuid::parse_str(hash) else { continue };
                if let Some(block) = graph.get_block(id).await? {
                    resolved.push(block);
                }
            }
            if resolved.is_empty() {
                continue;
            }
            if let Err(err) = client.push_blocks(peer_id, resolved).await {
                tracing::warn!(error = %err, peer = %peer_id, "push-blocks transport failure");
            }
        }
    }

    let mut needed: HashSet<Uuid> = HashSet::new();
    for (peer_id, detail) in &response.node_details {
        if peer_id == node_id {
            continue;
        }
        for head in &detail.head_blocks {
            if !pending.contains(&head.id) && graph.get_block(head.id).await?.is_none() {
                needed.insert(head.id);
            }
        }
    }
    for block in pending.snapshot() {
        for parent in &block.prev_blocks {
            if !pending.contains(parent) && graph.get_block(*parent).await?.is_none() {
                needed.insert(*parent);
            }
        }
    }

    if !needed.is_empty() {
        if let Err(err) = client.request_blocks(needed.into_iter().collect()).await {
            tracing::warn!(error = %err, "request-blocks transport failure");
        }
    }

    Ok(())
}

/// Long-polls the broker for new blocks, stashes them in `pending`, and
/// integrates whatever in `pending` now has every parent present — possibly
/// cascading through several blocks at once. `on_incoming` is invoked once
/// per integrated block with that block's updates merged against the local
/// blocks its integration walk passed over, in deterministic replay order.
pub async fn receive_blocks<S: Storage, C: BrokerClient>(
    graph: &BlockGraph<S>,
    pending: &PendingBlockMap,
    client: &C,
    on_incoming: &IncomingSink,
) -> Result<(), SyncError> {
    let incoming = match client.pull_blocks().await {
        Ok(blocks) => blocks,
        Err(err) => {
            tracing::warn!(error = %err, "pull-blocks transport failure or timeout");
            Vec::new()
        }
    };
    for block in incoming {
        pending.insert(block);
    }

    loop {
        let mut integrated_any = false;
        for block in pending.snapshot() {
            let mut all_parents_present = true;
            for parent in &block.prev_blocks {
                if !graph.has_block(*parent).await? {
                    all_parents_present = false;
                    break;
                }
            }
            if !all_parents_present {
                continue;
            }
            integrate_incoming(graph, &block, on_incoming).await?;
            pending.remove(&block.id);
            integrated_any = true;
        }
        if !integrated_any {
            break;
        }
    }
    Ok(())
}

async fn integrate_incoming<S: Storage>(
    graph: &BlockGraph<S>,
    block: &Block,
    on_incoming: &IncomingSink,
) -> Result<(), SyncError> {
    let min_t = block
        .first_timestamp()
        .ok_or_else(|| SyncError::InvariantBreach("integrated block carries no updates".into()))?;
    let passed_over = find_blocks_from_time(graph, min_t).await?;

    graph.integrate(block.clone()).await?;

    let mut all_updates: Vec<Update> = Vec::new();
    for passed in &passed_over {
        all_updates.extend(passed.data.clone());
    }
    all_updates.extend(block.data.clone());
    all_updates.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    on_incoming(all_updates).await
}

/// Walks backward from the current heads, stopping at any block whose last
/// update is older than `min_t`. Deliberately not a full DAG traversal: once
/// a block falls before the cutoff its ancestors were already applied by an
/// earlier integration, so there's nothing further to gain from descending.
async fn find_blocks_from_time<S: Storage>(
    graph: &BlockGraph<S>,
    min_t: i64,
) -> Result<Vec<Block>, SyncError> {
    let mut visited = HashSet::new();
    let mut result = Vec::new();
    let mut queue: Vec<Uuid> = graph.get_head_block_ids().into_iter().collect();

    while let Some(id) = queue.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(block) = graph.get_block(id).await? else { continue };
        let last_ts = block.last_timestamp().unwrap_or(i64::MIN);
        if last_ts < min_t {
            continue;
        }
        queue.extend(block.prev_blocks.iter().copied());
        result.push(block);
    }
    Ok(result)
}
