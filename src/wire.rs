//! JSON request/response shapes exchanged between a node and the broker over
//! HTTP. Field names use `camelCase` on the wire regardless of the `snake_case`
//! used internally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::{Block, HeadBlockDetails, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    pub node_id: NodeId,
    pub head_blocks: Vec<HeadBlockDetails>,
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generating_data: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetail {
    pub head_blocks: Vec<HeadBlockDetails>,
    pub time: i64,
    pub last_seen_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generating_data: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WantsDataEntry {
    pub required_hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckInResponse {
    pub node_details: HashMap<NodeId, NodeDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wants_data: Option<HashMap<NodeId, WantsDataEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullBlocksRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PullBlocksResponse {
    pub blocks: Vec<Block>,
    pub from_node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBlocksRequest {
    pub to_node_id: NodeId,
    pub from_node_id: NodeId,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBlocksRequest {
    pub node_id: NodeId,
    pub required_hashes: Vec<String>,
}

impl RequestBlocksRequest {
    pub fn required_ids(&self) -> Vec<Uuid> {
        self.required_hashes.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect()
    }
}
