//! Scheduler request and reply types
//!
//! Every reply is a `{success, error}` envelope plus the operation's
//! payload, so transport failures and application failures collapse to
//! the same caller-visible shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::provider::ProviderInfo;
use crate::resources::ResourceInfo;
use crate::store::Language;

/// Runtime environment of a component to place
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEnv {
    /// Image or artefact reference
    pub image: String,
    /// Handler language
    pub language: Language,
}

/// Upstream ecosystem addresses a deployment attaches to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamAddrs {
    /// Message-passing endpoint
    pub zmq_addr: String,
    /// Object-store endpoint
    pub store_addr: String,
    /// Log-stream endpoint
    pub logger_addr: String,
}

impl UpstreamAddrs {
    /// Render as the environment map handed to providers.
    pub fn env(&self) -> HashMap<String, String> {
        HashMap::from([
            (crate::provider::ENV_ZMQ_ADDR.to_string(), self.zmq_addr.clone()),
            (crate::provider::ENV_STORE_ADDR.to_string(), self.store_addr.clone()),
            (crate::provider::ENV_LOGGER_ADDR.to_string(), self.logger_addr.clone()),
        ])
    }
}

/// Top-level placement request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployComponentRequest {
    /// What to run
    pub runtime: RuntimeEnv,
    /// How much it needs
    pub resources: ResourceInfo,
    /// Pin the placement to a node, bypassing the coordinator
    pub target_node_id: Option<NodeId>,
    /// Scheduler address of the pinned node, when already known
    pub target_address: Option<String>,
    /// Ecosystem addresses for the deployed component
    pub upstream: UpstreamAddrs,
}

/// First phase: ask a node for a candidate provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    /// The placement request being matched
    pub resources: ResourceInfo,
    /// Handler language the provider must support
    pub language: Option<Language>,
    /// Requesting node, for policy context
    pub requester_node_id: NodeId,
    /// Requesting domain, for policy context
    pub requester_domain_id: String,
}

/// Second phase: bind a prior proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// What to run
    pub runtime: RuntimeEnv,
    /// How much it commits
    pub resources: ResourceInfo,
    /// The exact provider a prior proposal named
    pub provider_id: String,
    /// Ecosystem addresses for the deployed component
    pub upstream: UpstreamAddrs,
}

/// Undeploy order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployRequest {
    /// Component to remove
    pub component_id: String,
    /// Namespaced provider the component is bound to, when known
    pub provider_id: Option<String>,
}

/// Proposal reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposeReply {
    /// Whether a candidate was found
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
    /// Proposing node
    pub node_id: Option<NodeId>,
    /// Proposing node's name
    pub node_name: Option<String>,
    /// Candidate provider
    pub provider_id: Option<String>,
    /// Provider headroom at proposal time
    pub available: Option<ResourceInfo>,
    /// Language the candidate would execute
    pub language: Option<Language>,
}

/// Deploy / commit reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployReply {
    /// Whether the deployment committed
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
    /// Committed component
    pub component_id: Option<String>,
    /// Namespaced provider the component landed on
    pub provider_id: Option<String>,
    /// Node that executed the commit
    pub node_id: Option<NodeId>,
}

impl DeployReply {
    /// A successful reply
    pub fn ok(component_id: String, provider_id: String, node_id: NodeId) -> Self {
        Self {
            success: true,
            error: None,
            component_id: Some(component_id),
            provider_id: Some(provider_id),
            node_id: Some(node_id),
        }
    }

    /// A failed reply carrying a short message
    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }
}

/// Provider listing reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersReply {
    /// Whether the listing succeeded
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
    /// Providers on the answering node
    pub providers: Vec<ProviderInfo>,
}

/// Bare `{success, error}` envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckReply {
    /// Whether the operation succeeded
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
}

impl AckReply {
    /// A successful envelope
    pub fn ok() -> Self {
        Self { success: true, error: None }
    }

    /// A failed envelope
    pub fn fail(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()) }
    }
}

/// A committed component as recorded by its owning node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Routing key; persists across messages
    pub id: String,
    /// Image or artefact reference
    pub image: String,
    /// Resources the deployment committed
    pub resource_usage: ResourceInfo,
    /// Namespaced provider binding
    pub provider_id: String,
    /// Commit time
    pub deployed_at: DateTime<Utc>,
}

impl ComponentRecord {
    /// Generate a component ID with 64 bits of entropy.
    pub fn fresh_id() -> String {
        format!("comp.{:016x}", rand::random::<u64>())
    }
}

/// Deployment status reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReply {
    /// Whether the component is known
    pub success: bool,
    /// Failure detail
    pub error: Option<String>,
    /// The component's record, when known
    pub component: Option<ComponentRecord>,
}

/// Namespace a provider ID for a component the local node committed.
pub fn local_provider_id(provider_id: &str) -> String {
    format!("local.{provider_id}")
}

/// Namespace a provider ID for a component committed on a peer.
pub fn remote_provider_id(provider_id: &str, node_id: &str) -> String {
    format!("{provider_id}@{node_id}")
}

/// Namespace a provider ID for a globally placed component.
pub fn global_provider_id(provider_id: &str, node_id: &str) -> String {
    format!("global.{provider_id}@{node_id}")
}

/// Split a namespaced provider ID into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderBinding {
    /// `local.<pid>`
    Local {
        /// Raw provider ID
        provider_id: String,
    },
    /// `<pid>@<node>`
    Remote {
        /// Raw provider ID
        provider_id: String,
        /// Owning node
        node_id: String,
    },
    /// `global.<pid>@<node>`
    Global {
        /// Raw provider ID
        provider_id: String,
        /// Owning node
        node_id: String,
    },
}

impl ProviderBinding {
    /// Parse a namespaced provider ID.
    pub fn parse(namespaced: &str) -> Option<Self> {
        if let Some(pid) = namespaced.strip_prefix("local.") {
            return Some(Self::Local { provider_id: pid.to_string() });
        }
        if let Some(rest) = namespaced.strip_prefix("global.") {
            let (pid, node) = rest.split_once('@')?;
            return Some(Self::Global { provider_id: pid.to_string(), node_id: node.to_string() });
        }
        let (pid, node) = namespaced.split_once('@')?;
        Some(Self::Remote { provider_id: pid.to_string(), node_id: node.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_namespacing_round_trips() {
        assert_eq!(
            ProviderBinding::parse(&local_provider_id("p1")),
            Some(ProviderBinding::Local { provider_id: "p1".to_string() })
        );
        assert_eq!(
            ProviderBinding::parse(&remote_provider_id("p1", "node.b")),
            Some(ProviderBinding::Remote {
                provider_id: "p1".to_string(),
                node_id: "node.b".to_string()
            })
        );
        assert_eq!(
            ProviderBinding::parse(&global_provider_id("p1", "node.b")),
            Some(ProviderBinding::Global {
                provider_id: "p1".to_string(),
                node_id: "node.b".to_string()
            })
        );
        assert_eq!(ProviderBinding::parse("garbage"), None);
    }

    #[test]
    fn component_ids_carry_entropy() {
        let a = ComponentRecord::fresh_id();
        let b = ComponentRecord::fresh_id();
        assert!(a.starts_with("comp."));
        assert_ne!(a, b);
    }

    #[test]
    fn upstream_env_carries_all_three_endpoints() {
        let upstream = UpstreamAddrs {
            zmq_addr: "h:1".to_string(),
            store_addr: "h:2".to_string(),
            logger_addr: "h:3".to_string(),
        };
        let env = upstream.env();
        assert_eq!(env.get(crate::provider::ENV_ZMQ_ADDR).unwrap(), "h:1");
        assert_eq!(env.get(crate::provider::ENV_STORE_ADDR).unwrap(), "h:2");
        assert_eq!(env.get(crate::provider::ENV_LOGGER_ADDR).unwrap(), "h:3");
    }
}
