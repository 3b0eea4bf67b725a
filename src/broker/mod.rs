//! The broker: a relay every node in a user's account checks in with and
//! long-polls for new blocks. State is scoped per user id and guarded by a
//! per-user lock so two nodes belonging to different users never contend on
//! the same mutex.

pub mod http;

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::model::{HeadBlockDetails, NodeId};
use crate::wire::{
    CheckInRequest, CheckInResponse, NodeDetail, PullBlocksRequest, PullBlocksResponse,
    PushBlocksRequest, RequestBlocksRequest, WantsDataEntry,
};

const BROKER_NODE_ID: &str = "broker";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a node may go without checking in before it's dropped from
    /// the directory.
    pub node_timeout: Duration,
    /// How long a `/pull-blocks` long-poll waits before returning empty.
    pub pull_timeout: Duration,
    /// Interval between offline-node sweeps.
    pub gc_interval: Duration,
    /// Soft ceiling on distinct nodes tracked per user; the least-recently
    /// seen node is evicted to make room for a new one past this limit.
    pub max_nodes_per_user: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_millis(20_000),
            pull_timeout: Duration::from_millis(120_000),
            gc_interval: Duration::from_millis(1_000),
            max_nodes_per_user: 256,
        }
    }
}

struct NodeDirectoryEntry {
    head_blocks: Vec<HeadBlockDetails>,
    time: i64,
    last_seen: Instant,
    database_hash: Option<String>,
    generating_data: Option<bool>,
}

#[derive(Default)]
struct UserState {
    nodes: HashMap<NodeId, NodeDirectoryEntry>,
    block_requests: HashMap<NodeId, HashSet<Uuid>>,
    pull_registrations: HashMap<NodeId, oneshot::Sender<PullBlocksResponse>>,
}

/// Per-user relay state plus the gossip endpoints: node directory, a
/// block-request registry each node's next check-in consults, and pull
/// rendezvous via a one-shot channel raced against a timeout.
pub struct Broker {
    users: DashMap<String, Arc<Mutex<UserState>>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { users: DashMap::new(), config }
    }

    fn user_state(&self, user: &str) -> Arc<Mutex<UserState>> {
        self.users.entry(user.to_string()).or_insert_with(|| Arc::new(Mutex::new(UserState::default()))).clone()
    }

    pub async fn check_in(&self, user: &str, request: CheckInRequest) -> CheckInResponse {
        let state_arc = self.user_state(user);
        let mut state = state_arc.lock().await;

        if !state.nodes.contains_key(&request.node_id) && state.nodes.len() >= self.config.max_nodes_per_user {
            if let Some(oldest) = state.nodes.iter().min_by_key(|(_, e)| e.last_seen).map(|(id, _)| id.clone()) {
                tracing::warn!(
                    user,
                    evicted = %oldest,
                    ceiling = self.config.max_nodes_per_user,
                    "broker node directory ceiling hit, evicting least-recently-seen node"
                );
                state.nodes.remove(&oldest);
                state.block_requests.remove(&oldest);
                state.pull_registrations.remove(&oldest);
            }
        }

        state.nodes.insert(
            request.node_id.clone(),
            NodeDirectoryEntry {
                head_blocks: request.head_blocks,
                time: request.time,
                last_seen: Instant::now(),
                database_hash: request.database_hash,
                generating_data: request.generating_data,
            },
        );

        let node_details = state
            .nodes
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    NodeDetail {
                        head_blocks: entry.head_blocks.clone(),
                        time: entry.time,
                        last_seen_millis: entry.last_seen.elapsed().as_millis() as u64,
                        database_hash: entry.database_hash.clone(),
                        generating_data: entry.generating_data,
                    },
                )
            })
            .collect();

        let mut wants_data = HashMap::new();
        for (node_id, required) in &state.block_requests {
            if !required.is_empty() {
                wants_data.insert(
                    node_id.clone(),
                    WantsDataEntry { required_hashes: required.iter().map(Uuid::to_string).collect() },
                );
            }
        }

        CheckInResponse {
            node_details,
            wants_data: if wants_data.is_empty() { None } else { Some(wants_data) },
        }
    }

    /// Installs a pull registration for `node_id` and waits for either a
    /// matching `/push-blocks` call or the configured timeout, whichever
    /// comes first. If a registration for this node already exists, returns
    /// immediately with an empty batch rather than displacing it.
    pub async fn pull_blocks(&self, user: &str, request: PullBlocksRequest) -> PullBlocksResponse {
        let state_arc = self.user_state(user);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = state_arc.lock().await;
            if state.pull_registrations.contains_key(&request.node_id) {
                return empty_pull_response();
            }
            state.pull_registrations.insert(request.node_id.clone(), tx);
        }

        tokio::select! {
            received = rx => received.unwrap_or_else(|_| empty_pull_response()),
            _ = tokio::time::sleep(self.config.pull_timeout) => {
                let mut state = state_arc.lock().await;
                state.pull_registrations.remove(&request.node_id);
                empty_pull_response()
            }
        }
    }

    /// Delivers `blocks` to a pending pull registration for `to_node_id`, if
    /// one still exists. A push that arrives with no matching registration
    /// (already timed out, or never made) is dropped silently.
    pub async fn push_blocks(&self, user: &str, request: PushBlocksRequest) {
        let state_arc = self.user_state(user);
        let mut state = state_arc.lock().await;
        let Some(sender) = state.pull_registrations.remove(&request.to_node_id) else {
            return;
        };
        let delivered: Vec<Uuid> = request.blocks.iter().map(|b| b.id).collect();
        let response = PullBlocksResponse { blocks: request.blocks, from_node_id: request.from_node_id };
        if sender.send(response).is_ok() {
            if let Some(pending) = state.block_requests.get_mut(&request.to_node_id) {
                for id in delivered {
                    pending.remove(&id);
                }
            }
        }
    }

    /// Replaces (not merges with) the set of block ids `request.node_id`
    /// wants from its peers. The next `/check-in` from any other node in this
    /// account will see it in `wantsData`.
    pub async fn request_blocks(&self, user: &str, request: RequestBlocksRequest) {
        let state_arc = self.user_state(user);
        let mut state = state_arc.lock().await;
        state.block_requests.insert(request.node_id, request.required_ids().into_iter().collect());
    }

    pub async fn status(&self, user: &str) -> serde_json::Value {
        let state_arc = self.user_state(user);
        let state = state_arc.lock().await;
        serde_json::json!({
            "nodeCount": state.nodes.len(),
            "nodes": state.nodes.keys().collect::<Vec<_>>(),
            "pendingPullRegistrations": state.pull_registrations.keys().collect::<Vec<_>>(),
            "outstandingBlockRequests": state.block_requests.iter()
                .map(|(id, set)| (id.clone(), set.len()))
                .collect::<HashMap<_, _>>(),
        })
    }

    /// Drops nodes that haven't checked in within `node_timeout`, and any
    /// user whose directory becomes empty as a result. Intended to be driven
    /// by [`Broker::spawn_gc_loop`].
    pub async fn gc_tick(&self) {
        let mut empty_users = Vec::new();
        for entry in self.users.iter() {
            let user = entry.key().clone();
            let state_arc = entry.value().clone();
            let mut state = state_arc.lock().await;
            let stale: Vec<NodeId> = state
                .nodes
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() > self.config.node_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for node in &stale {
                state.nodes.remove(node);
                state.block_requests.remove(node);
                state.pull_registrations.remove(node);
                tracing::info!(user, node, "broker gc: dropped offline node");
            }
            if state.nodes.is_empty() {
                empty_users.push(user);
            }
        }
        for user in empty_users {
            self.users.remove(&user);
        }
    }

    pub fn spawn_gc_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.config.gc_interval).await;
                self.gc_tick().await;
            }
        })
    }
}

fn empty_pull_response() -> PullBlocksResponse {
    PullBlocksResponse { blocks: Vec::new(), from_node_id: BROKER_NODE_ID.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Block;

    fn check_in_request(node_id: &str) -> CheckInRequest {
        CheckInRequest {
            node_id: node_id.to_string(),
            head_blocks: vec![],
            time: 0,
            database_hash: None,
            generating_data: None,
        }
    }

    #[tokio::test]
    async fn check_in_lists_every_node_in_the_account() {
        let broker = Broker::new(BrokerConfig::default());
        broker.check_in("alice", check_in_request("node-a")).await;
        let response = broker.check_in("alice", check_in_request("node-b")).await;
        assert_eq!(response.node_details.len(), 2);
    }

    #[tokio::test]
    async fn different_users_do_not_see_each_other() {
        let broker = Broker::new(BrokerConfig::default());
        broker.check_in("alice", check_in_request("node-a")).await;
        let response = broker.check_in("bob", check_in_request("node-b")).await;
        assert_eq!(response.node_details.len(), 1);
    }

    #[tokio::test]
    async fn pull_times_out_with_empty_blocks() {
        let broker = Broker::new(BrokerConfig {
            pull_timeout: Duration::from_millis(20),
            ..BrokerConfig::default()
        });
        let response =
            broker.pull_blocks("alice", PullBlocksRequest { node_id: "node-a".to_string() }).await;
        assert!(response.blocks.is_empty());
    }

    #[tokio::test]
    async fn push_delivers_to_a_waiting_pull() {
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let broker_clone = broker.clone();
        let pull = tokio::spawn(async move {
            broker_clone.pull_blocks("alice", PullBlocksRequest { node_id: "node-a".to_string() }).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let block = Block { id: Uuid::new_v4(), prev_blocks: HashSet::new(), data: vec![] };
        broker
            .push_blocks(
                "alice",
                PushBlocksRequest {
                    to_node_id: "node-a".to_string(),
                    from_node_id: "node-b".to_string(),
                    blocks: vec![block.clone()],
                },
            )
            .await;

        let response = pull.await.unwrap();
        assert_eq!(response.blocks.len(), 1);
        assert_eq!(response.blocks[0].id, block.id);
    }

    #[tokio::test]
    async fn second_pull_for_already_registered_node_returns_immediately() {
        let broker = Arc::new(Broker::new(BrokerConfig::default()));
        let broker_clone = broker.clone();
        let _first = tokio::spawn(async move {
            broker_clone.pull_blocks("alice", PullBlocksRequest { node_id: "node-a".to_string() }).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second =
            broker.pull_blocks("alice", PullBlocksRequest { node_id: "node-a".to_string() }).await;
        assert!(second.blocks.is_empty());
    }

    #[tokio::test]
    async fn request_blocks_replaces_rather_than_unions() {
        let broker = Broker::new(BrokerConfig::default());
        let first_id = Uuid::new_v4();
        let second_id = Uuid::new_v4();
        broker
            .request_blocks(
                "alice",
                RequestBlocksRequest { node_id: "node-a".to_string(), required_hashes: vec![first_id.to_string()] },
            )
            .await;
        broker
            .request_blocks(
                "alice",
                RequestBlocksRequest { node_id: "node-a".to_string(), required_hashes: vec![second_id.to_string()] },
            )
            .await;

        let response = broker.check_in("alice", check_in_request("node-b")).await;
        let wants = response.wants_data.unwrap();
        let required = &wants.get("node-a").unwrap().required_hashes;
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], second_id.to_string());
    }

    #[tokio::test]
    async fn gc_drops_stale_nodes_and_empty_users() {
        let broker = Broker::new(BrokerConfig {
            node_timeout: Duration::from_millis(10),
            ..BrokerConfig::default()
        });
        broker.check_in("alice", check_in_request("node-a")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.gc_tick().await;
        assert!(!broker.users.contains_key("alice"));
    }

    #[tokio::test]
    async fn node_ceiling_evicts_least_recently_seen() {
        let broker = Broker::new(BrokerConfig { max_nodes_per_user: 2, ..BrokerConfig::default() });
        broker.check_in("alice", check_in_request("node-a")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        broker.check_in("alice", check_in_request("node-b")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let response = broker.check_in("alice", check_in_request("node-c")).await;
        assert_eq!(response.node_details.len(), 2);
        assert!(!response.node_details.contains_key("node-a"));
    }
}
