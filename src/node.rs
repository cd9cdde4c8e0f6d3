//! Peer node model and node-identity bootstrap
//!
//! A [`PeerNode`] is the replicated unit of gossip: everything one
//! node knows about another, including the version counter that
//! drives conflict resolution when the same node is observed through
//! different gossip paths.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::resources::{Capacity, CapabilityTags};

/// Stable node identifier, `node.<entropy>` once generated
pub type NodeId = String;

/// Lifecycle status of a node as seen by its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Node is reachable and reporting resources
    Online,
    /// Node announced an orderly departure
    Offline,
    /// Node is reachable but unhealthy
    Error,
    /// Nothing is known yet
    Unknown,
}

/// One node's view of a peer (or of itself), replicated by gossip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    /// Stable identifier, persisted across restarts
    pub id: NodeId,
    /// Human-facing name
    pub name: String,
    /// Administrative domain; gossip never crosses domains
    pub domain_id: String,
    /// Generic RPC address (discovery, store)
    pub address: String,
    /// Scheduler RPC address
    pub scheduler_address: String,
    /// Current status
    pub status: NodeStatus,
    /// Resource capacity snapshot; replaced whole on every update,
    /// including cleared-to-`None` transitions, because it describes
    /// the sender's current truth
    pub capacity: Option<Capacity>,
    /// Capability bits
    pub capability_tags: Option<CapabilityTags>,
    /// Monotonically increasing per-origin version
    pub version: u64,
    /// Last time any gossip mentioned this node
    pub last_seen: DateTime<Utc>,
    /// Last time the node itself changed its record
    pub last_updated: DateTime<Utc>,
    /// First time this node appeared in the local table
    pub discovered_at: DateTime<Utc>,
    /// Peer the latest observation arrived through; never replicated
    #[serde(skip)]
    pub source_peer: Option<String>,
    /// Gossip hop counter
    pub hops: u32,
}

impl PeerNode {
    /// Create a fresh record for the local node.
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        domain_id: impl Into<String>,
        address: impl Into<String>,
        scheduler_address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            domain_id: domain_id.into(),
            address: address.into(),
            scheduler_address: scheduler_address.into(),
            status: NodeStatus::Online,
            capacity: None,
            capability_tags: None,
            version: 1,
            last_seen: now,
            last_updated: now,
            discovered_at: now,
            source_peer: None,
            hops: 0,
        }
    }

    /// Conflict rule: does `incoming` supersede `self`? Higher version
    /// wins; on a tie the later `last_updated` wins; same-or-lower is
    /// ignored.
    pub fn superseded_by(&self, incoming: &PeerNode) -> bool {
        incoming.version > self.version
            || (incoming.version == self.version && incoming.last_updated > self.last_updated)
    }

    /// Headroom score of this node, zero when no capacity is known.
    pub fn availability_score(&self) -> f64 {
        self.capacity
            .as_ref()
            .map(|c| c.available.availability_score())
            .unwrap_or(0.0)
    }

    /// Available resources, empty when no capacity is known.
    pub fn available(&self) -> crate::resources::ResourceInfo {
        self.capacity.as_ref().map(|c| c.available.clone()).unwrap_or_default()
    }
}

/// File under the data directory holding the generated node ID
const NODE_ID_FILE: &str = "node_id";

/// Load the persisted node identity, generating and persisting a fresh
/// `node.<entropy>` on first start. A write failure is logged and the
/// freshly generated ID is used anyway; identity then lasts for this
/// process only.
pub fn load_or_create_node_id(data_dir: &Path) -> NodeId {
    let path = data_dir.join(NODE_ID_FILE);
    if let Ok(existing) = fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let id = format!("node.{}", hex::encode(rand::random::<[u8; 8]>()));
    if let Err(err) = fs::create_dir_all(data_dir).and_then(|_| fs::write(&path, &id)) {
        warn!(path = %path.display(), %err, "failed to persist node id; continuing with ephemeral identity");
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceInfo;
    use chrono::Duration;

    fn node(version: u64) -> PeerNode {
        PeerNode {
            version,
            ..PeerNode::new(
                "node.aa".to_string(),
                "a",
                "dom",
                "127.0.0.1:7000",
                "127.0.0.1:7001",
            )
        }
    }

    #[test]
    fn higher_version_supersedes() {
        let current = node(7);
        let mut incoming = node(8);
        incoming.last_updated = current.last_updated - Duration::seconds(60);
        assert!(current.superseded_by(&incoming));
    }

    #[test]
    fn lower_version_is_ignored_even_with_later_timestamp() {
        let current = node(7);
        let mut incoming = node(5);
        incoming.last_updated = current.last_updated + Duration::seconds(60);
        assert!(!current.superseded_by(&incoming));
    }

    #[test]
    fn equal_version_resolves_on_last_updated() {
        let current = node(7);
        let mut incoming = node(7);
        incoming.last_updated = current.last_updated + Duration::seconds(1);
        assert!(current.superseded_by(&incoming));

        incoming.last_updated = current.last_updated;
        assert!(!current.superseded_by(&incoming));
    }

    #[test]
    fn score_is_zero_without_capacity() {
        let mut n = node(1);
        assert_eq!(n.availability_score(), 0.0);
        n.capacity = Some(Capacity::new(ResourceInfo::new(2000, 0, 0), ResourceInfo::default()));
        assert!(n.availability_score() > 0.0);
    }

    #[test]
    fn node_id_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_node_id(dir.path());
        let second = load_or_create_node_id(dir.path());
        assert!(first.starts_with("node."));
        assert_eq!(first, second);
    }
}
