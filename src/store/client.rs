//! Remote object store client
//!
//! [`ObjectStore`] over the fabric RPC, used when the upstream store
//! named in a deployment's `STORE_ADDR` lives on another node.

use async_trait::async_trait;

use crate::error::{FabricError, Result};
use crate::rpc::{Request, Response, RpcClient, OBJECT_DEADLINE};

use super::{EncodedObject, ObjectRef, ObjectStore};

/// A store served by a peer's generic RPC listener
pub struct StoreClient {
    addr: String,
    id: String,
    client: RpcClient,
}

impl StoreClient {
    /// Point at the store behind `addr`.
    pub fn new(addr: impl Into<String>, client: RpcClient) -> Self {
        let addr = addr.into();
        Self { id: format!("store@{addr}"), addr, client }
    }

    /// Ask the remote store for its own instance identifier.
    pub async fn remote_store_id(&self) -> Result<String> {
        match self.client.call(&self.addr, &Request::GetStoreId, OBJECT_DEADLINE).await? {
            Response::StoreId(id) => Ok(id),
            Response::Error { message } => Err(FabricError::transport(message)),
            _ => Err(FabricError::internal("unexpected reply to store id")),
        }
    }
}

#[async_trait]
impl ObjectStore for StoreClient {
    async fn save_object(&self, object: EncodedObject) -> Result<ObjectRef> {
        self.client.save_object(&self.addr, object).await
    }

    async fn get_object(&self, reference: &ObjectRef) -> Result<EncodedObject> {
        self.client.get_object(&self.addr, reference.clone()).await
    }

    async fn save_stream_chunk(&self, id: &str, chunk: Vec<u8>) -> Result<u64> {
        let request = Request::SaveStreamChunk { id: id.to_string(), chunk };
        match self.client.call(&self.addr, &request, OBJECT_DEADLINE).await? {
            Response::ChunkSaved(offset) => Ok(offset),
            Response::Error { message } => Err(FabricError::transport(message)),
            _ => Err(FabricError::internal("unexpected reply to chunk save")),
        }
    }

    async fn get_stream_chunk(&self, id: &str, offset: u64) -> Result<Vec<u8>> {
        let request = Request::GetStreamChunk { id: id.to_string(), offset };
        match self.client.call(&self.addr, &request, OBJECT_DEADLINE).await? {
            Response::Chunk(chunk) => Ok(chunk),
            Response::Error { message } => Err(FabricError::not_found(message)),
            _ => Err(FabricError::internal("unexpected reply to chunk get")),
        }
    }

    fn store_id(&self) -> &str {
        &self.id
    }
}
