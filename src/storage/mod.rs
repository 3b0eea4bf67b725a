use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::SyncError;

/// Configuration for [`FileStorage`]. Mirrors the teacher's `BlockDBConfig`
/// shape without the LSM-specific knobs that no longer apply.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: "./syncdb_data".to_string() }
    }
}

/// A `(collectionName, id) -> document` capability. Every document is a JSON
/// object carrying its own `_id` field; callers never address storage by
/// byte key the way the teacher's KV layer did.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_all_documents(&self, collection: &str) -> Result<Vec<Value>, SyncError>;

    async fn get_matching_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, SyncError>;

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, SyncError>;

    /// Upserts a document. `document` must contain a string `_id` field.
    async fn store_document(&self, collection: &str, document: Value) -> Result<(), SyncError>;

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), SyncError>;

    async fn delete_all_documents(&self, collection: &str) -> Result<(), SyncError>;
}

fn doc_id(document: &Value) -> Result<String, SyncError> {
    document
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SyncError::MalformedMessage("document missing string _id field".into()))
}

/// One JSON file per document under `<data_dir>/<collection>/<id>.json`,
/// fronted by an in-memory cache so repeat reads never hit disk. Collections
/// are loaded into the cache lazily, on first access, by scanning their
/// directory once.
pub struct FileStorage {
    data_dir: PathBuf,
    cache: DashMap<(String, String), Value>,
    loaded_collections: DashMap<String, ()>,
}

impl FileStorage {
    pub fn new(config: StorageConfig) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            data_dir: PathBuf::from(config.data_dir),
            cache: DashMap::new(),
            loaded_collections: DashMap::new(),
        })
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.data_dir.join(collection)
    }

    fn doc_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{id}.json"))
    }

    fn ensure_loaded(&self, collection: &str) -> Result<(), SyncError> {
        if self.loaded_collections.contains_key(collection) {
            return Ok(());
        }
        let dir = self.collection_dir(collection);
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let bytes = std::fs::read(&path)?;
                let value: Value = serde_json::from_slice(&bytes)?;
                let id = doc_id(&value)?;
                self.cache.insert((collection.to_string(), id), value);
            }
        }
        self.loaded_collections.insert(collection.to_string(), ());
        Ok(())
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_all_documents(&self, collection: &str) -> Result<Vec<Value>, SyncError> {
        self.ensure_loaded(collection)?;
        Ok(self
            .cache
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_matching_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, SyncError> {
        self.ensure_loaded(collection)?;
        Ok(self
            .cache
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .filter(|entry| entry.value().get(field) == Some(value))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, SyncError> {
        let key = (collection.to_string(), id.to_string());
        if let Some(doc) = self.cache.get(&key) {
            return Ok(Some(doc.clone()));
        }
        let path = self.doc_path(collection, id);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let value: Value = serde_json::from_slice(&bytes)?;
        self.cache.insert(key, value.clone());
        Ok(Some(value))
    }

    async fn store_document(&self, collection: &str, document: Value) -> Result<(), SyncError> {
        let id = doc_id(&document)?;
        let path = self.doc_path(collection, &id);
        let bytes = serde_json::to_vec(&document)?;
        Self::write_atomic(&path, &bytes)?;
        self.cache.insert((collection.to_string(), id), document);
        self.loaded_collections.insert(collection.to_string(), ());
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        let path = self.doc_path(collection, id);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        self.cache.remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }

    async fn delete_all_documents(&self, collection: &str) -> Result<(), SyncError> {
        let dir = self.collection_dir(collection);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)?;
        }
        self.cache.retain(|key, _| key.0 != collection);
        self.loaded_collections.remove(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn storage() -> (TempDir, FileStorage) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(StorageConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
        })
        .unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let (_dir, storage) = storage();
        storage
            .store_document("widgets", json!({"_id": "a", "color": "red"}))
            .await
            .unwrap();
        let doc = storage.get_document("widgets", "a").await.unwrap().unwrap();
        assert_eq!(doc["color"], "red");
    }

    #[tokio::test]
    async fn survives_cache_eviction_via_fresh_instance() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig { data_dir: dir.path().to_string_lossy().to_string() };
        {
            let storage = FileStorage::new(config.clone()).unwrap();
            storage
                .store_document("widgets", json!({"_id": "a", "color": "red"}))
                .await
                .unwrap();
        }
        let storage = FileStorage::new(config).unwrap();
        let doc = storage.get_document("widgets", "a").await.unwrap().unwrap();
        assert_eq!(doc["color"], "red");
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let (_dir, storage) = storage();
        storage.store_document("widgets", json!({"_id": "a"})).await.unwrap();
        storage.delete_document("widgets", "a").await.unwrap();
        assert!(storage.get_document("widgets", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_matching_documents_filters_by_field() {
        let (_dir, storage) = storage();
        storage.store_document("widgets", json!({"_id": "a", "color": "red"})).await.unwrap();
        storage.store_document("widgets", json!({"_id": "b", "color": "blue"})).await.unwrap();
        let matches = storage
            .get_matching_documents("widgets", "color", &json!("red"))
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0]["_id"], "a");
    }
}
