//! Discovery service
//!
//! Drives the periodic gossip rounds, serves the inbound gossip and
//! resource-query RPCs, and runs the cleanup timer. One task owns the
//! gossip timer, one the cleanup timer; per-peer dials run
//! concurrently and a slow peer never stalls a round.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::node::PeerNode;
use crate::resources::{CapabilityTags, ResourceInfo};
use crate::rpc::RpcClient;

use super::manager::DiscoveryManager;
use super::messages::{
    GossipAck, GossipMessage, PeerExchange, PeerExchangeReply, ResourceQuery, ResourceQueryReply,
};

/// Interval of the eviction sweep
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// The gossip and query front of the discovery manager.
pub struct DiscoveryService {
    manager: Arc<DiscoveryManager>,
    client: RpcClient,
}

impl DiscoveryService {
    /// Wire the service over its manager.
    pub fn new(manager: Arc<DiscoveryManager>, client: RpcClient) -> Self {
        Self { manager, client }
    }

    /// The backing manager
    pub fn manager(&self) -> &Arc<DiscoveryManager> {
        &self.manager
    }

    /// Receiver side of a gossip exchange. Duplicates, spent TTLs, and
    /// cross-domain messages get an empty reply but are still marked
    /// processed so loops die out.
    pub fn handle_gossip(&self, message: GossipMessage) -> GossipAck {
        let local = self.manager.local_node();
        let duplicate = self.manager.is_message_processed(&message.message_id);
        self.manager.mark_message_processed(message.message_id);

        if duplicate || message.ttl <= 0 || message.sender_domain_id != local.domain_id {
            debug!(
                message = %message.message_id,
                duplicate,
                ttl = message.ttl,
                "gossip suppressed"
            );
            return GossipAck { message_id: message.message_id, timestamp: Utc::now(), nodes: Vec::new() };
        }

        self.manager.add_peer(&message.sender_address);
        for mut node in message.nodes {
            node.hops = node.hops.saturating_add(1);
            self.manager.process_node_info(node, &message.sender_address);
        }

        GossipAck {
            message_id: message.message_id,
            timestamp: Utc::now(),
            nodes: self.manager.snapshot(),
        }
    }

    /// Receiver side of a resource query.
    pub fn handle_query(&self, query: ResourceQuery) -> ResourceQueryReply {
        let local = self.manager.local_node();
        let expired = query.ttl <= 0 || query.requester_domain_id != local.domain_id;

        let available_nodes = if expired {
            Vec::new()
        } else {
            self.manager
                .find_available_nodes(&query.request, &query.required_tags.unwrap_or_default())
                .into_iter()
                .filter(|n| n.id != query.requester_node_id)
                .collect()
        };

        ResourceQueryReply {
            query_id: query.query_id,
            responder_node_id: local.id,
            responder_address: local.address,
            available_nodes,
            timestamp: Utc::now(),
            is_final: expired || query.current_hops + 1 >= query.max_hops,
        }
    }

    /// Receiver side of a peer exchange.
    pub fn handle_peer_exchange(&self, exchange: PeerExchange) -> PeerExchangeReply {
        let local = self.manager.local_node();
        if exchange.requester_domain_id == local.domain_id {
            self.manager.add_peer(&exchange.requester_address);
            for peer in &exchange.known_peers {
                if peer != &local.address {
                    self.manager.add_peer(peer);
                }
            }
        }
        PeerExchangeReply { known_peers: self.manager.peers(), timestamp: Utc::now() }
    }

    /// The local node record, for address→node resolution by peers.
    pub fn handle_local_node_info(&self) -> PeerNode {
        self.manager.local_node()
    }

    /// One gossip round: fan out the snapshot to at most
    /// `max_gossip_peers` peers, merging whatever comes back. Per-peer
    /// failures are logged and skipped.
    pub async fn gossip_round(&self) {
        let tuning = self.manager.tuning().clone();
        let mut peers = self.manager.peers();
        if peers.is_empty() {
            return;
        }
        {
            use rand::seq::SliceRandom;
            peers.shuffle(&mut rand::thread_rng());
        }
        peers.truncate(tuning.max_gossip_peers);

        let local = self.manager.local_node();
        let message = GossipMessage {
            sender_node_id: local.id.clone(),
            sender_address: local.address.clone(),
            sender_domain_id: local.domain_id.clone(),
            nodes: self.manager.snapshot(),
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            ttl: tuning.max_hops as i32,
            max_hops: tuning.max_hops,
        };
        // Mark our own message so forwarded copies die at the door.
        self.manager.mark_message_processed(message.message_id);

        let exchanges = peers.iter().map(|peer| {
            let message = GossipMessage { ttl: message.ttl - 1, ..message.clone() };
            let peer = peer.clone();
            async move {
                match self.client.gossip(&peer, message).await {
                    Ok(ack) => Some((peer, ack)),
                    Err(err) => {
                        debug!(%peer, %err, "gossip exchange failed");
                        None
                    }
                }
            }
        });

        for outcome in futures::future::join_all(exchanges).await.into_iter().flatten() {
            let (peer, ack) = outcome;
            for node in ack.nodes {
                self.manager.process_node_info(node, &peer);
            }
        }
    }

    /// Candidate discovery: the local aggregate first, then a peer
    /// broadcast that stops at the first non-empty answer. Nodes a
    /// peer reports are merged into the local table as a side effect.
    pub async fn query_resources(
        &self,
        request: &ResourceInfo,
        required_tags: &CapabilityTags,
    ) -> Vec<PeerNode> {
        let local = self.manager.local_node();
        let candidates: Vec<PeerNode> = self
            .manager
            .find_available_nodes(request, required_tags)
            .into_iter()
            .filter(|n| n.id != local.id)
            .collect();
        if !candidates.is_empty() {
            return candidates;
        }

        let tuning = self.manager.tuning().clone();
        let peers = self.manager.peers();
        if peers.is_empty() {
            return Vec::new();
        }

        let query = ResourceQuery {
            query_id: Uuid::new_v4(),
            requester_node_id: local.id.clone(),
            requester_address: local.address.clone(),
            requester_domain_id: local.domain_id.clone(),
            request: request.clone(),
            required_tags: Some(*required_tags),
            timestamp: Utc::now(),
            ttl: tuning.max_hops as i32,
            max_hops: tuning.max_hops,
            current_hops: 0,
        };

        let mut in_flight: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let query = query.clone();
                let peer = peer.clone();
                async move {
                    match self.client.query_resources(&peer, query).await {
                        Ok(reply) => Some((peer, reply)),
                        Err(err) => {
                            debug!(%peer, %err, "resource query failed");
                            None
                        }
                    }
                }
            })
            .collect();

        while let Some(outcome) = in_flight.next().await {
            if let Some((peer, reply)) = outcome {
                if reply.available_nodes.is_empty() {
                    continue;
                }
                info!(
                    peer = %peer,
                    candidates = reply.available_nodes.len(),
                    "resource query answered"
                );
                for node in &reply.available_nodes {
                    self.manager.process_node_info(node.clone(), &peer);
                }
                return reply.available_nodes;
            }
        }
        Vec::new()
    }

    /// Drive the gossip and cleanup timers until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let gossip = {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            async move {
                let mut tick = tokio::time::interval(service.manager.tuning().gossip_interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => service.gossip_round().await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        };

        let cleanup = {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            async move {
                let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let lost = service.manager.cleanup();
                            if !lost.is_empty() {
                                warn!(count = lost.len(), "nodes aged out of the domain view");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        };

        tokio::join!(gossip, cleanup);
        debug!("discovery service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::manager::DiscoveryTuning;
    use crate::resources::Capacity;

    fn service() -> DiscoveryService {
        let local = PeerNode::new(
            "node.local".to_string(),
            "local",
            "dom",
            "127.0.0.1:7000",
            "127.0.0.1:7001",
        );
        let manager = Arc::new(DiscoveryManager::new(local, DiscoveryTuning::default()));
        DiscoveryService::new(manager, RpcClient::new())
    }

    fn peer(id: &str) -> PeerNode {
        let mut node = PeerNode::new(id.to_string(), id, "dom", format!("{id}:1"), format!("{id}:2"));
        node.capacity = Some(Capacity::new(ResourceInfo::new(8000, 0, 0), ResourceInfo::default()));
        node.capability_tags = Some(CapabilityTags { cpu: true, memory: true, ..Default::default() });
        node
    }

    fn gossip(id: Uuid, ttl: i32, domain: &str) -> GossipMessage {
        GossipMessage {
            sender_node_id: "node.b".to_string(),
            sender_address: "node.b:1".to_string(),
            sender_domain_id: domain.to_string(),
            nodes: vec![peer("node.b")],
            message_id: id,
            timestamp: Utc::now(),
            ttl,
            max_hops: 5,
        }
    }

    #[test]
    fn gossip_is_merged_then_deduplicated() {
        let svc = service();
        let id = Uuid::new_v4();

        let ack = svc.handle_gossip(gossip(id, 5, "dom"));
        assert!(!ack.nodes.is_empty());
        assert_eq!(svc.manager().known_nodes().len(), 1);
        assert!(svc.manager().is_message_processed(&id));

        // The same message forwarded back is suppressed with an empty
        // reply, and the table is untouched.
        let before = svc.manager().node_by_id("node.b").unwrap();
        let ack = svc.handle_gossip(gossip(id, 4, "dom"));
        assert!(ack.nodes.is_empty());
        let after = svc.manager().node_by_id("node.b").unwrap();
        assert_eq!(before.last_seen, after.last_seen);
        assert_eq!(before.version, after.version);
    }

    #[test]
    fn spent_ttl_and_foreign_domain_are_suppressed() {
        let svc = service();
        assert!(svc.handle_gossip(gossip(Uuid::new_v4(), 0, "dom")).nodes.is_empty());
        assert!(svc.handle_gossip(gossip(Uuid::new_v4(), 5, "elsewhere")).nodes.is_empty());
        assert!(svc.manager().known_nodes().is_empty());
    }

    #[test]
    fn queries_answer_with_fitting_nodes_only() {
        let svc = service();
        svc.manager().process_node_info(peer("node.big"), "p");
        let mut small = peer("node.small");
        small.capacity = Some(Capacity::new(ResourceInfo::new(500, 0, 0), ResourceInfo::default()));
        svc.manager().process_node_info(small, "p");

        let reply = svc.handle_query(ResourceQuery {
            query_id: Uuid::new_v4(),
            requester_node_id: "node.req".to_string(),
            requester_address: "req:1".to_string(),
            requester_domain_id: "dom".to_string(),
            request: ResourceInfo::new(4000, 0, 0),
            required_tags: None,
            timestamp: Utc::now(),
            ttl: 5,
            max_hops: 5,
            current_hops: 0,
        });
        assert_eq!(reply.available_nodes.len(), 1);
        assert_eq!(reply.available_nodes[0].id, "node.big");
        assert!(!reply.is_final);
    }

    #[test]
    fn expired_queries_are_final_and_empty() {
        let svc = service();
        svc.manager().process_node_info(peer("node.big"), "p");
        let reply = svc.handle_query(ResourceQuery {
            query_id: Uuid::new_v4(),
            requester_node_id: "node.req".to_string(),
            requester_address: "req:1".to_string(),
            requester_domain_id: "dom".to_string(),
            request: ResourceInfo::new(100, 0, 0),
            required_tags: None,
            timestamp: Utc::now(),
            ttl: 0,
            max_hops: 5,
            current_hops: 5,
        });
        assert!(reply.available_nodes.is_empty());
        assert!(reply.is_final);
    }

    #[test]
    fn peer_exchange_merges_addresses_within_the_domain() {
        let svc = service();
        let reply = svc.handle_peer_exchange(PeerExchange {
            requester_address: "node.b:1".to_string(),
            requester_domain_id: "dom".to_string(),
            known_peers: vec!["node.c:1".to_string(), "127.0.0.1:7000".to_string()],
        });
        let mut peers = svc.manager().peers();
        peers.sort();
        assert_eq!(peers, vec!["node.b:1".to_string(), "node.c:1".to_string()]);
        assert_eq!(reply.known_peers.len(), 2);
    }
}
