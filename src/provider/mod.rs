//! Provider contract
//!
//! A provider is a local execution back-end (process, container, VM,
//! unikernel) that hosts components. The fabric sees every back-end
//! through the same narrow trait; authentication, binding state, and
//! health-gated capacity reporting live in the [`registry`], so
//! concrete runners stay free of token bookkeeping.

pub mod inprocess;
pub mod registry;

pub use inprocess::InProcessProvider;
pub use registry::{ProviderEvent, ProviderHandle, ProviderRegistry};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resources::{Capacity, CapabilityTags, ResourceInfo};
use crate::store::Language;

/// Serialises external build-tool invocations (unikernel image
/// compilation shares one tool-chain lockfile); every provider that
/// shells out to a builder must hold this for the build's duration.
pub static BUILD_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Environment key for the message-passing endpoint
pub const ENV_ZMQ_ADDR: &str = "ZMQ_ADDR";
/// Environment key for the object-store endpoint
pub const ENV_STORE_ADDR: &str = "STORE_ADDR";
/// Environment key for the log-stream endpoint
pub const ENV_LOGGER_ADDR: &str = "LOGGER_ADDR";

/// Kind of execution back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Plain host process
    Process,
    /// Container runtime
    Container,
    /// Virtual machine
    Vm,
    /// Unikernel image
    Unikernel,
}

/// Connection status of a provider binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Bound and fresh
    Connected,
    /// No binding, or the binding went stale
    Disconnected,
    /// Bound but failing
    Error,
}

/// Snapshot of a provider for listings and registry heartbeats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider identifier
    pub id: String,
    /// Human-facing name
    pub name: String,
    /// Back-end kind
    pub kind: ProviderKind,
    /// Binding status
    pub status: ProviderStatus,
    /// Capability bits
    pub capability_tags: CapabilityTags,
    /// Health-gated capacity; omitted in resource-free listings
    pub capacity: Option<Capacity>,
    /// Languages the back-end executes
    pub supported_languages: Vec<Language>,
}

/// Deployment order handed to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Component instance identifier; deploys are idempotent on it
    pub instance_id: String,
    /// Language of the component's handler
    pub language: Language,
    /// Resources the deployment commits
    pub resources: ResourceInfo,
    /// Environment for the component, including the upstream
    /// `ZMQ_ADDR` / `STORE_ADDR` / `LOGGER_ADDR` endpoints
    pub env: HashMap<String, String>,
}

/// Reply to a successful connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAck {
    /// Back-end kind
    pub kind: ProviderKind,
    /// Languages the back-end executes
    pub supported_languages: Vec<Language>,
}

/// Reply to a health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Current capacity
    pub capacity: Capacity,
    /// Capability bits
    pub capability_tags: CapabilityTags,
    /// Languages the back-end executes
    pub supported_languages: Vec<Language>,
}

/// The raw back-end surface a concrete runner implements.
///
/// Token authentication and binding lifecycle are layered on top by
/// [`registry::ProviderHandle`]; implementations only execute.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identifier
    fn id(&self) -> &str;

    /// Human-facing name
    fn name(&self) -> &str;

    /// Back-end kind
    fn kind(&self) -> ProviderKind;

    /// Capability bits of the backing hardware
    fn capability_tags(&self) -> CapabilityTags;

    /// Languages this back-end executes
    fn supported_languages(&self) -> Vec<Language>;

    /// Current capacity; allowed pre-connect for read-only probes
    async fn capacity(&self) -> Result<Capacity>;

    /// Instantaneous usage, best-effort
    async fn real_time_usage(&self) -> Result<ResourceInfo>;

    /// Place a component. Idempotent on `instance_id`.
    async fn deploy(&self, request: DeployRequest) -> Result<()>;

    /// Remove a component, releasing its resources best-effort.
    async fn undeploy(&self, component_id: &str) -> Result<()>;
}
