//! Encoded-object store
//!
//! Content-addressed storage for the encoded values and stream chunks
//! components exchange. Objects are addressed by ID; the `source` of
//! an [`ObjectRef`] names the store instance able to serve the bytes,
//! so references can be handed across nodes and languages freely.

mod client;
mod memory;

pub use client::StoreClient;
pub use memory::MemoryObjectStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Encoding of an object's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// UTF-8 JSON text
    Json,
    /// Python pickle bytes
    Python,
    /// Go gob bytes
    Go,
}

impl Language {
    /// Parse a language name, case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "python" => Some(Self::Python),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Python => "python",
            Self::Go => "go",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encoded value at rest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedObject {
    /// Content address
    pub id: String,
    /// Encoded payload
    pub data: Vec<u8>,
    /// Payload encoding
    pub language: Language,
    /// Streams are chunked, never materialised as a single value
    pub is_stream: bool,
}

/// A portable handle to an object held by some store instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Content address
    pub id: String,
    /// Store instance able to serve the bytes
    pub source: String,
}

/// The store contract consumed by the session fabric and providers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist an object. Idempotent by ID: saving an object that
    /// already exists returns the existing reference, never an error.
    async fn save_object(&self, object: EncodedObject) -> Result<ObjectRef>;

    /// Fetch an object by reference. `not-found` when unknown.
    async fn get_object(&self, reference: &ObjectRef) -> Result<EncodedObject>;

    /// Append one chunk to a streamed payload, returning its offset.
    async fn save_stream_chunk(&self, id: &str, chunk: Vec<u8>) -> Result<u64>;

    /// Fetch the chunk at `offset` of a streamed payload.
    async fn get_stream_chunk(&self, id: &str, offset: u64) -> Result<Vec<u8>>;

    /// Identifier embedded in every [`ObjectRef::source`] this store
    /// produces.
    fn store_id(&self) -> &str;
}
