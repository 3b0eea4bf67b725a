pub mod broker;
pub mod collection;
pub mod error;
pub mod graph;
pub mod model;
pub mod storage;
pub mod sync;
pub mod wire;

pub use broker::{Broker, BrokerConfig};
pub use collection::{Collection, Database, Subscription};
pub use error::SyncError;
pub use graph::{BlockGraph, PendingBlockMap};
pub use model::{Block, HeadBlockDetails, NodeId, Update};
pub use storage::{FileStorage, Storage, StorageConfig};
pub use sync::{BrokerClient, HttpBrokerClient, SyncEngine, SyncEngineConfig};

use std::sync::Arc;
use tokio::sync::mpsc;

/// Wires a [`Database`] and a [`SyncEngine`] together over one `FileStorage`
/// backend: the arrangement every `syncdb-node` process runs. Application
/// code interacts with `database`, calls `engine.start_sync()` once at
/// startup, and never touches the channel that connects them.
pub struct Node {
    pub database: Arc<Database<FileStorage>>,
    pub engine: Arc<SyncEngine<FileStorage, HttpBrokerClient>>,
}

impl Node {
    pub fn new(
        node_id: NodeId,
        storage_config: StorageConfig,
        broker_url: String,
        user_id: String,
        engine_config: SyncEngineConfig,
    ) -> Result<Self, SyncError> {
        let storage = Arc::new(FileStorage::new(storage_config)?);
        let graph = Arc::new(BlockGraph::new(storage.clone()));
        let pending = Arc::new(PendingBlockMap::new());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let database = Arc::new(Database::new(storage, node_id.clone(), outgoing_tx));
        let client = Arc::new(HttpBrokerClient::new(
            broker_url,
            user_id,
            node_id,
            engine_config.pull_long_poll_timeout,
        ));

        let incoming_db = database.clone();
        let engine = SyncEngine::new(
            graph,
            pending,
            client,
            outgoing_rx,
            move |updates| {
                let db = incoming_db.clone();
                Box::pin(async move { db.apply_incoming_updates(updates).await })
            },
            engine_config,
        );

        Ok(Self { database, engine })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    #[tokio::test]
    async fn node_starts_sync_and_accepts_local_writes() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(
            "node-a".to_string(),
            StorageConfig { data_dir: dir.path().to_string_lossy().to_string() },
            "http://127.0.0.1:1".to_string(),
            "alice".to_string(),
            SyncEngineConfig::new("node-a".to_string()),
        )
        .unwrap();

        node.engine.start_sync().await.unwrap();
        assert!(node.engine.is_running());

        let widgets = node.database.collection("widgets");
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        widgets.upsert_one("a", fields).await.unwrap();

        let doc = widgets.get("a").await.unwrap().unwrap();
        assert_eq!(doc["color"], "red");

        node.engine.stop_sync();
    }
}
