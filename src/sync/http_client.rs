use async_trait::async_trait;
use hyper::{Body, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{Block, HeadBlockDetails, NodeId};
use crate::sync::BrokerClient;
use crate::wire::{
    CheckInRequest, CheckInResponse, PullBlocksRequest, PullBlocksResponse, PushBlocksRequest,
    RequestBlocksRequest,
};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// The node side of the wire protocol: an HTTP+JSON client that authenticates
/// every call with an `X-User-Id` header and talks to the broker's
/// `/check-in`, `/pull-blocks`, `/push-blocks` and `/request-blocks`
/// endpoints.
pub struct HttpBrokerClient {
    client: Client<hyper::client::HttpConnector>,
    base_url: String,
    user_id: String,
    node_id: NodeId,
    pull_timeout: Duration,
}

impl HttpBrokerClient {
    pub fn new(base_url: String, user_id: String, node_id: NodeId, pull_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id,
            node_id,
            pull_timeout,
        }
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, SyncError> {
        let uri = format!("{}{}", self.base_url, path);
        let payload = serde_json::to_vec(body)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("X-User-Id", &self.user_id)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .map_err(|err| SyncError::transport(path, err))?;

        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| SyncError::transport(path, "request timed out"))?
            .map_err(|err| SyncError::transport(path, err))?;

        if !response.status().is_success() {
            return Err(SyncError::transport(path, format!("http {}", response.status())));
        }

        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|err| SyncError::transport(path, err))?;
        serde_json::from_slice(&bytes).map_err(SyncError::from)
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn check_in(&self, head_blocks: Vec<HeadBlockDetails>) -> Result<CheckInResponse, SyncError> {
        let body = CheckInRequest {
            node_id: self.node_id.clone(),
            head_blocks,
            time: now_millis(),
            database_hash: None,
            generating_data: None,
        };
        self.post("/check-in", &body, Duration::from_secs(10)).await
    }

    async fn push_blocks(&self, to_node: &NodeId, blocks: Vec<Block>) -> Result<(), SyncError> {
        let body = PushBlocksRequest {
            to_node_id: to_node.clone(),
            from_node_id: self.node_id.clone(),
            blocks,
        };
        let _: serde_json::Value = self.post("/push-blocks", &body, Duration::from_secs(10)).await?;
        Ok(())
    }

    async fn request_blocks(&self, required: Vec<Uuid>) -> Result<(), SyncError> {
        let body = RequestBlocksRequest {
            node_id: self.node_id.clone(),
            required_hashes: required.iter().map(Uuid::to_string).collect(),
        };
        let _: serde_json::Value =
            self.post("/request-blocks", &body, Duration::from_secs(10)).await?;
        Ok(())
    }

    async fn pull_blocks(&self) -> Result<Vec<Block>, SyncError> {
        let body = PullBlocksRequest { node_id: self.node_id.clone() };
        let response: PullBlocksResponse = self
            .post("/pull-blocks", &body, self.pull_timeout + Duration::from_secs(10))
            .await?;
        Ok(response.blocks)
    }
}
