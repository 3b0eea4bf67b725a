use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{Block, Update};
use crate::storage::Storage;

const BLOCKS_COLLECTION: &str = "blocks";
const GRAPH_COLLECTION: &str = "block-graphs";
const HEAD_RECORD_ID: &str = "head-blocks";

/// A node's append-only block DAG, fronted by an in-memory cache over a
/// [`Storage`] backend. `blocks` and `heads` are cache-in-front-of-disk:
/// every committed or integrated block is written through to storage before
/// the call returns, so a restart just replays `load_head_blocks` and
/// rehydrates blocks on demand via `get_block`.
pub struct BlockGraph<S: Storage> {
    storage: Arc<S>,
    blocks: RwLock<HashMap<Uuid, Block>>,
    heads: RwLock<HashSet<Uuid>>,
    commit_lock: AsyncMutex<()>,
}

impl<S: Storage> BlockGraph<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            blocks: RwLock::new(HashMap::new()),
            heads: RwLock::new(HashSet::new()),
            commit_lock: AsyncMutex::new(()),
        }
    }

    /// Reads the persisted head-block record, if any, and hydrates the
    /// blocks it names into the cache. Call once at startup before the sync
    /// loops begin; a node with no prior history simply ends up with an
    /// empty head set, which `commit` treats as the genesis case.
    pub async fn load_head_blocks(&self) -> Result<(), SyncError> {
        let Some(doc) = self.storage.get_document(GRAPH_COLLECTION, HEAD_RECORD_ID).await? else {
            return Ok(());
        };
        let head_ids: Vec<Uuid> = doc
            .get("heads")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let mut heads = HashSet::new();
        for id in head_ids {
            if self.get_block(id).await?.is_some() {
                heads.insert(id);
            } else {
                tracing::warn!(block = %id, "head block named in graph record is missing from storage");
            }
        }
        *self.heads.write() = heads;
        Ok(())
    }

    pub fn get_head_block_ids(&self) -> HashSet<Uuid> {
        self.heads.read().clone()
    }

    pub async fn has_block(&self, id: Uuid) -> Result<bool, SyncError> {
        if self.blocks.read().contains_key(&id) {
            return Ok(true);
        }
        Ok(self.storage.get_document(BLOCKS_COLLECTION, &id.to_string()).await?.is_some())
    }

    pub async fn get_block(&self, id: Uuid) -> Result<Option<Block>, SyncError> {
        if let Some(block) = self.blocks.read().get(&id).cloned() {
            return Ok(Some(block));
        }
        let Some(doc) = self.storage.get_document(BLOCKS_COLLECTION, &id.to_string()).await? else {
            return Ok(None);
        };
        let block: Block = serde_json::from_value(doc)?;
        self.blocks.write().insert(id, block.clone());
        Ok(Some(block))
    }

    /// Snapshot of every block currently hydrated into the cache. Debug/test
    /// use only — a node that never called `get_block` on an ancestor won't
    /// see it here even though it's on disk.
    pub fn loaded_blocks(&self) -> Vec<Block> {
        self.blocks.read().values().cloned().collect()
    }

    /// Creates a new block whose parents are the current heads, makes it the
    /// sole head, and persists both the block and the head record. Serialized
    /// by `commit_lock` so concurrent `commitUpdates` calls from the same
    /// node never race to read stale heads.
    pub async fn commit(&self, data: Vec<Update>) -> Result<Block, SyncError> {
        let _guard = self.commit_lock.lock().await;
        let prev_blocks = self.heads.read().clone();
        let block = Block { id: Uuid::new_v4(), prev_blocks, data };
        self.persist_as_new_head(&block).await?;
        Ok(block)
    }

    /// Folds an incoming block from a peer into the local DAG: its parents
    /// are no longer heads, it is. Idempotent — integrating a block whose id
    /// is already known is a silent no-op, since a node may receive the same
    /// block from more than one peer.
    pub async fn integrate(&self, block: Block) -> Result<(), SyncError> {
        if self.blocks.read().contains_key(&block.id) {
            return Ok(());
        }
        self.persist_as_new_head(&block).await
    }

    async fn persist_as_new_head(&self, block: &Block) -> Result<(), SyncError> {
        {
            let mut heads = self.heads.write();
            for parent in &block.prev_blocks {
                heads.remove(parent);
            }
            heads.insert(block.id);
        }
        self.blocks.write().insert(block.id, block.clone());

        let mut block_doc = serde_json::to_value(block)?;
        block_doc["_id"] = serde_json::Value::String(block.id.to_string());
        let heads_doc = self.heads_document();

        let (stored_block, stored_heads) = tokio::join!(
            self.storage.store_document(BLOCKS_COLLECTION, block_doc),
            self.storage.store_document(GRAPH_COLLECTION, heads_doc),
        );
        stored_block?;
        stored_heads?;
        Ok(())
    }

    fn heads_document(&self) -> serde_json::Value {
        let heads: Vec<Uuid> = self.heads.read().iter().copied().collect();
        serde_json::json!({"_id": HEAD_RECORD_ID, "heads": heads})
    }
}

/// Blocks that have arrived from the broker but whose parents aren't all
/// present in the local graph yet. Disjoint from `BlockGraph`'s own block
/// map by construction: a block is removed from here the instant it's
/// integrated there.
pub struct PendingBlockMap {
    inner: SyncMutex<HashMap<Uuid, Block>>,
}

impl PendingBlockMap {
    pub fn new() -> Self {
        Self { inner: SyncMutex::new(HashMap::new()) }
    }

    pub fn insert(&self, block: Block) {
        self.inner.lock().insert(block.id, block);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Block> {
        self.inner.lock().remove(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.inner.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingBlockMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, StorageConfig};
    use tempfile::TempDir;

    fn graph() -> (TempDir, BlockGraph<FileStorage>) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(StorageConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
        })
        .unwrap();
        (dir, BlockGraph::new(Arc::new(storage)))
    }

    #[tokio::test]
    async fn commit_with_no_prior_history_has_no_parents() {
        let (_dir, graph) = graph();
        let block = graph.commit(vec![]).await.unwrap();
        assert!(block.prev_blocks.is_empty());
        assert_eq!(graph.get_head_block_ids(), HashSet::from([block.id]));
    }

    #[tokio::test]
    async fn sequential_commits_chain_single_head() {
        let (_dir, graph) = graph();
        let first = graph.commit(vec![]).await.unwrap();
        let second = graph.commit(vec![]).await.unwrap();
        assert_eq!(second.prev_blocks, HashSet::from([first.id]));
        assert_eq!(graph.get_head_block_ids(), HashSet::from([second.id]));
    }

    #[tokio::test]
    async fn integrating_same_block_twice_is_a_no_op() {
        let (_dir, graph) = graph();
        let block = Block { id: Uuid::new_v4(), prev_blocks: HashSet::new(), data: vec![] };
        graph.integrate(block.clone()).await.unwrap();
        graph.integrate(block.clone()).await.unwrap();
        assert_eq!(graph.get_head_block_ids(), HashSet::from([block.id]));
    }

    #[tokio::test]
    async fn integrating_a_block_retires_its_parents_from_heads() {
        let (_dir, graph) = graph();
        let local = graph.commit(vec![]).await.unwrap();
        let incoming =
            Block { id: Uuid::new_v4(), prev_blocks: HashSet::from([local.id]), data: vec![] };
        graph.integrate(incoming.clone()).await.unwrap();
        assert_eq!(graph.get_head_block_ids(), HashSet::from([incoming.id]));
    }

    #[tokio::test]
    async fn load_head_blocks_restores_state_after_restart() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig { data_dir: dir.path().to_string_lossy().to_string() };
        let committed_id = {
            let storage = Arc::new(FileStorage::new(config.clone()).unwrap());
            let graph = BlockGraph::new(storage);
            graph.commit(vec![]).await.unwrap().id
        };
        let storage = Arc::new(FileStorage::new(config).unwrap());
        let graph = BlockGraph::new(storage);
        graph.load_head_blocks().await.unwrap();
        assert_eq!(graph.get_head_block_ids(), HashSet::from([committed_id]));
    }
}
