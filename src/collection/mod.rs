use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::model::{NodeId, Update};
use crate::storage::Storage;

type Subscriber = dyn Fn(&[Update]) + Send + Sync;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// RAII handle returned by [`Collection::subscribe`]. Dropping it removes the
/// subscriber; there is no separate `unsubscribe` call to forget to make.
pub struct Subscription {
    id: u64,
    subscribers: Arc<RwLock<Vec<(u64, Arc<Subscriber>)>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.write().retain(|(id, _)| *id != self.id);
    }
}

struct CollectionInner<S: Storage> {
    name: String,
    storage: Arc<S>,
    node_id: NodeId,
    outgoing_tx: mpsc::UnboundedSender<Vec<Update>>,
    subscribers: Arc<RwLock<Vec<(u64, Arc<Subscriber>)>>>,
    next_subscriber_id: AtomicU64,
}

/// A named set of documents. Every mutation is expressed as one or more
/// [`Update`]s: subscribers are notified, the update batch is handed off to
/// the sync engine via `outgoing_tx`, and the local copy in storage is
/// updated to match — in that order, so a subscriber never observes a write
/// the engine hasn't been told about yet.
#[derive(Clone)]
pub struct Collection<S: Storage> {
    inner: Arc<CollectionInner<S>>,
}

impl<S: Storage> Collection<S> {
    fn new(
        name: String,
        storage: Arc<S>,
        node_id: NodeId,
        outgoing_tx: mpsc::UnboundedSender<Vec<Update>>,
    ) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                name,
                storage,
                node_id,
                outgoing_tx,
                subscribers: Arc::new(RwLock::new(Vec::new())),
                next_subscriber_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn get(&self, id: &str) -> Result<Option<Value>, SyncError> {
        self.inner.storage.get_document(&self.inner.name, id).await
    }

    pub async fn get_all(&self) -> Result<Vec<Value>, SyncError> {
        self.inner.storage.get_all_documents(&self.inner.name).await
    }

    pub async fn find_by_field(&self, field: &str, value: &Value) -> Result<Vec<Value>, SyncError> {
        self.inner.storage.get_matching_documents(&self.inner.name, field, value).await
    }

    /// Merges `fields` into the document named `id` (creating it if absent),
    /// emitting one `Update::Field` per key in `fields`.
    pub async fn upsert_one(&self, id: &str, fields: Map<String, Value>) -> Result<(), SyncError> {
        let timestamp = now_millis();
        let updates: Vec<Update> = fields
            .iter()
            .enumerate()
            .map(|(index, (field, value))| Update::Field {
                timestamp,
                collection: self.inner.name.clone(),
                doc_id: id.to_string(),
                field: field.clone(),
                value: value.clone(),
                origin_node: self.inner.node_id.clone(),
                index_in_block: index,
            })
            .collect();

        if updates.is_empty() {
            return Ok(());
        }

        self.notify_subscribers(&updates);
        self.send_outgoing(updates.clone());

        let mut doc = self
            .inner
            .storage
            .get_document(&self.inner.name, id)
            .await?
            .unwrap_or_else(|| serde_json::json!({"_id": id}));
        if let Some(obj) = doc.as_object_mut() {
            for (field, value) in fields {
                obj.insert(field, value);
            }
        }
        self.inner.storage.store_document(&self.inner.name, doc).await
    }

    pub async fn delete_one(&self, id: &str) -> Result<(), SyncError> {
        let update = Update::Delete {
            timestamp: now_millis(),
            collection: self.inner.name.clone(),
            doc_id: id.to_string(),
            origin_node: self.inner.node_id.clone(),
            index_in_block: 0,
        };
        self.notify_subscribers(std::slice::from_ref(&update));
        self.send_outgoing(vec![update]);
        self.inner.storage.delete_document(&self.inner.name, id).await
    }

    /// Registers `callback` to be invoked with every batch of updates this
    /// collection produces or absorbs, local or remote. The returned
    /// [`Subscription`] must be kept alive for as long as the callback should
    /// keep firing.
    pub fn subscribe(&self, callback: impl Fn(&[Update]) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.write().push((id, Arc::new(callback)));
        Subscription { id, subscribers: self.inner.subscribers.clone() }
    }

    /// Applies a single already-ordered incoming update from a peer directly
    /// to storage. Used by [`super::Database::apply_incoming_updates`], which
    /// also handles cross-collection notification and ordering.
    async fn apply_incoming(&self, update: &Update) -> Result<(), SyncError> {
        match update {
            Update::Field { doc_id, field, value, .. } => {
                let mut doc = self
                    .inner
                    .storage
                    .get_document(&self.inner.name, doc_id)
                    .await?
                    .unwrap_or_else(|| serde_json::json!({"_id": doc_id}));
                if let Some(obj) = doc.as_object_mut() {
                    obj.insert(field.clone(), value.clone());
                }
                self.inner.storage.store_document(&self.inner.name, doc).await
            }
            Update::Delete { doc_id, .. } => {
                self.inner.storage.delete_document(&self.inner.name, doc_id).await
            }
        }
    }

    fn notify_subscribers(&self, updates: &[Update]) {
        let subscribers = self.inner.subscribers.read().clone();
        for (_, callback) in subscribers {
            callback(updates);
        }
    }

    fn send_outgoing(&self, updates: Vec<Update>) {
        if self.inner.outgoing_tx.send(updates).is_err() {
            tracing::warn!(collection = %self.inner.name, "outgoing update dropped, sync engine not running");
        }
    }
}

/// The document store a node exposes to its application code: a registry of
/// [`Collection`]s sharing one [`Storage`] backend and one outgoing channel
/// to the sync engine.
pub struct Database<S: Storage> {
    storage: Arc<S>,
    node_id: NodeId,
    outgoing_tx: mpsc::UnboundedSender<Vec<Update>>,
    collections: DashMap<String, Collection<S>>,
}

impl<S: Storage> Database<S> {
    pub fn new(storage: Arc<S>, node_id: NodeId, outgoing_tx: mpsc::UnboundedSender<Vec<Update>>) -> Self {
        Self { storage, node_id, outgoing_tx, collections: DashMap::new() }
    }

    pub fn collection(&self, name: &str) -> Collection<S> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| {
                Collection::new(name.to_string(), self.storage.clone(), self.node_id.clone(), self.outgoing_tx.clone())
            })
            .clone()
    }

    /// Routes an already timestamp-ordered batch of updates (as produced by
    /// `SyncCore::receive_blocks`) to their respective collections, applying
    /// each in order and notifying that collection's subscribers once per
    /// contiguous run of updates for it.
    pub async fn apply_incoming_updates(&self, updates: Vec<Update>) -> Result<(), SyncError> {
        let mut index = 0;
        while index < updates.len() {
            let collection_name = updates[index].collection().to_string();
            let mut run_end = index + 1;
            while run_end < updates.len() && updates[run_end].collection() == collection_name {
                run_end += 1;
            }
            let run = &updates[index..run_end];
            let collection = self.collection(&collection_name);
            collection.notify_subscribers(run);
            for update in run {
                collection.apply_incoming(update).await?;
            }
            index = run_end;
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form of every document in the named
    /// collections, ordered first by collection name then by document `_id`.
    /// Relies on `serde_json::Map`'s default `BTreeMap`-backed key ordering —
    /// this crate must never enable serde_json's `preserve_order` feature, or
    /// two nodes with documents inserted in different field orders would hash
    /// differently despite being identical.
    pub async fn hash(&self) -> Result<String, SyncError> {
        let mut by_collection: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for entry in self.collections.iter() {
            let name = entry.key().clone();
            let mut docs = self.storage.get_all_documents(&name).await?;
            docs.sort_by(|a, b| a["_id"].as_str().unwrap_or("").cmp(b["_id"].as_str().unwrap_or("")));
            by_collection.insert(name, docs);
        }
        let canonical = serde_json::to_vec(&by_collection)?;
        let digest = Sha256::digest(&canonical);
        Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, StorageConfig};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn database() -> (TempDir, Database<FileStorage>, mpsc::UnboundedReceiver<Vec<Update>>) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            FileStorage::new(StorageConfig { data_dir: dir.path().to_string_lossy().to_string() })
                .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        (dir, Database::new(storage, "node-a".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn upsert_creates_and_forwards_updates() {
        let (_dir, db, mut rx) = database();
        let widgets = db.collection("widgets");
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        widgets.upsert_one("a", fields).await.unwrap();

        let doc = widgets.get("a").await.unwrap().unwrap();
        assert_eq!(doc["color"], "red");

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].doc_id(), "a");
    }

    #[tokio::test]
    async fn subscriber_fires_on_local_upsert() {
        let (_dir, db, _rx) = database();
        let widgets = db.collection("widgets");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _sub = widgets.subscribe(move |updates| {
            seen_clone.fetch_add(updates.len(), Ordering::SeqCst);
        });
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        widgets.upsert_one("a", fields).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_subscription_stops_notifications() {
        let (_dir, db, _rx) = database();
        let widgets = db.collection("widgets");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let sub = widgets.subscribe(move |updates| {
            seen_clone.fetch_add(updates.len(), Ordering::SeqCst);
        });
        drop(sub);
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        widgets.upsert_one("a", fields).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn apply_incoming_delete_then_field_recreates_with_only_that_field() {
        let (_dir, db, _rx) = database();
        let widgets = db.collection("widgets");
        let mut fields = Map::new();
        fields.insert("color".to_string(), json!("red"));
        fields.insert("size".to_string(), json!("large"));
        widgets.upsert_one("a", fields).await.unwrap();

        db.apply_incoming_updates(vec![
            Update::Delete {
                timestamp: 10,
                collection: "widgets".to_string(),
                doc_id: "a".to_string(),
                origin_node: "node-b".to_string(),
                index_in_block: 0,
            },
            Update::Field {
                timestamp: 20,
                collection: "widgets".to_string(),
                doc_id: "a".to_string(),
                field: "color".to_string(),
                value: json!("blue"),
                origin_node: "node-b".to_string(),
                index_in_block: 0,
            },
        ])
        .await
        .unwrap();

        let doc = widgets.get("a").await.unwrap().unwrap();
        assert_eq!(doc["color"], "blue");
        assert!(doc.get("size").is_none());
    }

    #[tokio::test]
    async fn hash_is_stable_across_field_insertion_order() {
        let (_dir, db, _rx) = database();
        let widgets = db.collection("widgets");
        let mut fields_a = Map::new();
        fields_a.insert("color".to_string(), json!("red"));
        fields_a.insert("size".to_string(), json!("large"));
        widgets.upsert_one("a", fields_a).await.unwrap();
        let first_hash = db.hash().await.unwrap();

        let (_dir2, db2, _rx2) = database();
        let widgets2 = db2.collection("widgets");
        let mut fields_b = Map::new();
        fields_b.insert("size".to_string(), json!("large"));
        fields_b.insert("color".to_string(), json!("red"));
        widgets2.upsert_one("a", fields_b).await.unwrap();
        let second_hash = db2.hash().await.unwrap();

        assert_eq!(first_hash, second_hash);
    }
}
