//! Discovery wire messages
//!
//! Gossip, resource query, and peer exchange payloads carried over the
//! generic RPC surface. All cleartext within one administrative
//! domain; cross-domain traffic is dropped at the receiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::node::{NodeId, PeerNode};
use crate::resources::{CapabilityTags, ResourceInfo};

/// Snapshot broadcast: local node plus the known-node table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Origin node
    pub sender_node_id: NodeId,
    /// Origin's generic RPC address
    pub sender_address: String,
    /// Origin's domain; receivers in other domains drop the message
    pub sender_domain_id: String,
    /// Replicated node records
    pub nodes: Vec<PeerNode>,
    /// Dedup key; duplicates within the sliding window are dropped
    pub message_id: Uuid,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Remaining forwards; decremented on each hop
    pub ttl: i32,
    /// Hop budget the origin chose
    pub max_hops: u32,
}

/// Reply to a gossip message: the receiver's own snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipAck {
    /// Echoed dedup key
    pub message_id: Uuid,
    /// Reply time
    pub timestamp: DateTime<Utc>,
    /// Receiver's snapshot; empty for duplicates and cross-domain
    pub nodes: Vec<PeerNode>,
}

/// Recursive candidate discovery for a placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuery {
    /// Query identity
    pub query_id: Uuid,
    /// Node that needs the resources
    pub requester_node_id: NodeId,
    /// Requester's generic RPC address
    pub requester_address: String,
    /// Requester's domain
    pub requester_domain_id: String,
    /// The placement request being matched
    pub request: ResourceInfo,
    /// Capability bits candidates must offer
    pub required_tags: Option<CapabilityTags>,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Remaining hop budget
    pub ttl: i32,
    /// Hop budget the origin chose
    pub max_hops: u32,
    /// Hops taken so far
    pub current_hops: u32,
}

/// Reply to a resource query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQueryReply {
    /// Echoed query identity
    pub query_id: Uuid,
    /// Replying node
    pub responder_node_id: NodeId,
    /// Replying node's address
    pub responder_address: String,
    /// Candidate nodes that fit the request
    pub available_nodes: Vec<PeerNode>,
    /// Reply time
    pub timestamp: DateTime<Utc>,
    /// True when the hop budget is exhausted past this reply
    pub is_final: bool,
}

/// Peer-address exchange for bootstrap and mesh densification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerExchange {
    /// Address of the requester, offered for the receiver's peer set
    pub requester_address: String,
    /// Requester's domain
    pub requester_domain_id: String,
    /// Addresses the requester already knows
    pub known_peers: Vec<String>,
}

/// Reply to a peer exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerExchangeReply {
    /// Addresses the responder knows
    pub known_peers: Vec<String>,
    /// Reply time
    pub timestamp: DateTime<Utc>,
}
