//! In-memory object store

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FabricError, Result};

use super::{EncodedObject, ObjectRef, ObjectStore};

/// RwLock-guarded map store; the default store of a node.
pub struct MemoryObjectStore {
    id: String,
    objects: RwLock<HashMap<String, EncodedObject>>,
    streams: RwLock<HashMap<String, Vec<Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create a store with the given instance identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Number of non-stream objects held
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// True when no objects are held
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn save_object(&self, object: EncodedObject) -> Result<ObjectRef> {
        let reference = ObjectRef { id: object.id.clone(), source: self.id.clone() };
        let mut objects = self.objects.write().await;
        if objects.contains_key(&object.id) {
            debug!(id = %object.id, "object already saved");
            return Ok(reference);
        }
        objects.insert(object.id.clone(), object);
        Ok(reference)
    }

    async fn get_object(&self, reference: &ObjectRef) -> Result<EncodedObject> {
        self.objects
            .read()
            .await
            .get(&reference.id)
            .cloned()
            .ok_or_else(|| FabricError::not_found(format!("object {}", reference.id)))
    }

    async fn save_stream_chunk(&self, id: &str, chunk: Vec<u8>) -> Result<u64> {
        let mut streams = self.streams.write().await;
        let chunks = streams.entry(id.to_string()).or_default();
        chunks.push(chunk);
        Ok(chunks.len() as u64 - 1)
    }

    async fn get_stream_chunk(&self, id: &str, offset: u64) -> Result<Vec<u8>> {
        self.streams
            .read()
            .await
            .get(id)
            .and_then(|chunks| chunks.get(offset as usize))
            .cloned()
            .ok_or_else(|| FabricError::not_found(format!("stream {id} chunk {offset}")))
    }

    fn store_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Language;

    fn object(id: &str, payload: &[u8]) -> EncodedObject {
        EncodedObject {
            id: id.to_string(),
            data: payload.to_vec(),
            language: Language::Json,
            is_stream: false,
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = MemoryObjectStore::new("store-a");
        let obj = object("obj-1", b"{\"x\":1}");
        let reference = store.save_object(obj.clone()).await.unwrap();
        assert_eq!(reference.source, "store-a");
        assert_eq!(store.get_object(&reference).await.unwrap(), obj);
    }

    #[tokio::test]
    async fn duplicate_save_is_not_an_error() {
        let store = MemoryObjectStore::new("store-a");
        let first = object("obj-1", b"first");
        let second = object("obj-1", b"second");
        store.save_object(first.clone()).await.unwrap();
        let reference = store.save_object(second).await.unwrap();
        // The original bytes win; the second save is absorbed.
        assert_eq!(store.get_object(&reference).await.unwrap().data, b"first");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::new("store-a");
        let reference = ObjectRef { id: "ghost".to_string(), source: "store-a".to_string() };
        let err = store.get_object(&reference).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stream_chunks_keep_their_order() {
        let store = MemoryObjectStore::new("store-a");
        assert_eq!(store.save_stream_chunk("s", b"one".to_vec()).await.unwrap(), 0);
        assert_eq!(store.save_stream_chunk("s", b"two".to_vec()).await.unwrap(), 1);
        assert_eq!(store.get_stream_chunk("s", 0).await.unwrap(), b"one");
        assert_eq!(store.get_stream_chunk("s", 1).await.unwrap(), b"two");
        assert!(store.get_stream_chunk("s", 2).await.is_err());
    }
}
