use crate::{ObjectInfo, ObjectMeta, ObjectStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use common::DbResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Objects kept in a shared map. Clones see the same objects.
#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, meta: ObjectMeta) -> DbResult<u64> {
        let size = data.len() as u64;
        self.objects
            .write()
            .await
            .insert(key.to_string(), StoredObject { meta, size, data });
        Ok(size)
    }

    async fn get(&self, key: &str) -> DbResult<Option<StoredObject>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn info(&self, key: &str) -> DbResult<Option<ObjectInfo>> {
        Ok(self.objects.read().await.get(key).map(StoredObject::info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(sequence: u64) -> ObjectMeta {
        ObjectMeta {
            sequence,
            modified_ms: 1_000,
            node_id: "node-a".into(),
        }
    }

    #[tokio::test]
    async fn put_replaces_and_get_returns_latest() {
        let store = MemoryObjectStore::new();
        assert!(store.get("snapshot").await.unwrap().is_none());
        assert!(store.is_empty().await);

        store.put("snapshot", Bytes::from_static(b"one"), meta(1)).await.unwrap();
        let size = store
            .put("snapshot", Bytes::from_static(b"second"), meta(2))
            .await
            .unwrap();
        assert_eq!(size, 6);
        assert_eq!(store.len().await, 1);

        let object = store.get("snapshot").await.unwrap().unwrap();
        assert_eq!(object.data, Bytes::from_static(b"second"));
        assert_eq!(object.meta.sequence, 2);

        let info = store.info("snapshot").await.unwrap().unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(info.meta, meta(2));
    }

    #[tokio::test]
    async fn clones_share_objects() {
        let store = MemoryObjectStore::new();
        let other = store.clone();
        store.put("k", Bytes::from_static(b"v"), meta(3)).await.unwrap();
        assert!(other.info("k").await.unwrap().is_some());
    }
}
