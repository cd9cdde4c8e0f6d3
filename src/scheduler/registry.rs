//! Global registry client
//!
//! The optional directory service above a domain. A node pushes
//! periodic JSON heartbeats and may, as a last resort, hand a
//! placement to the registry's global scheduler. Only this contract is
//! fixed; the registry itself is an external collaborator, and its
//! absence never blocks a node.

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};
use crate::node::NodeId;
use crate::provider::ProviderInfo;
use crate::resources::Capacity;
use crate::scheduler::types::{DeployComponentRequest, DeployReply};

/// Heartbeat pushed to the registry
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHeartbeat {
    /// Reporting node
    pub node_id: NodeId,
    /// Node's domain
    pub domain_id: String,
    /// Always `online` while the loop runs
    pub status: String,
    /// Aggregated local provider capacity
    pub capacity: Capacity,
    /// Capability labels
    pub tags: Vec<String>,
    /// Generic RPC address
    pub address: String,
    /// Whether this node fronts the domain
    pub is_head: bool,
    /// Local providers
    pub providers: Vec<ProviderInfo>,
}

/// Registry's answer to a heartbeat
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryReply {
    /// Interval the registry would like between heartbeats
    #[serde(default)]
    pub recommended_interval_seconds: Option<u64>,
    /// The registry lost this node; re-register synchronously
    #[serde(default)]
    pub require_reregister: bool,
}

/// HTTP/JSON client for the registry
pub struct RegistryClient {
    base: String,
    http: reqwest::Client,
}

impl RegistryClient {
    /// Point at a registry base URL.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self { base, http: reqwest::Client::new() }
    }

    /// Push one heartbeat.
    pub async fn register(&self, heartbeat: &RegistryHeartbeat) -> Result<RegistryReply> {
        let url = format!("{}/v1/nodes/register", self.base);
        let response = self
            .http
            .post(&url)
            .json(heartbeat)
            .send()
            .await
            .map_err(|e| FabricError::transport(format!("registry {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(FabricError::transport(format!(
                "registry {url}: status {}",
                response.status()
            )));
        }
        response
            .json::<RegistryReply>()
            .await
            .map_err(|e| FabricError::internal(format!("registry reply: {e}")))
    }

    /// One best-effort global placement.
    pub async fn global_schedule(&self, request: &DeployComponentRequest) -> Result<DeployReply> {
        let url = format!("{}/v1/schedule", self.base);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| FabricError::transport(format!("registry {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(FabricError::transport(format!(
                "registry {url}: status {}",
                response.status()
            )));
        }
        response
            .json::<DeployReply>()
            .await
            .map_err(|e| FabricError::internal(format!("registry reply: {e}")))
    }
}
