//! Discovery manager
//!
//! Holds the local node record, the known-node table, the peer set,
//! and the gossip dedup window, and keeps the aggregate view rebuilt
//! on every change. All mutation is linearised behind one lock; every
//! `PeerNode` handed out is a copy, never an internal instance.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::node::{NodeId, PeerNode};
use crate::resources::{Capacity, CapabilityTags, ResourceInfo};

use super::aggregate::{AggregateView, ViewCounts};

/// Tuning knobs of the discovery subsystem
#[derive(Debug, Clone)]
pub struct DiscoveryTuning {
    /// Interval between gossip rounds
    pub gossip_interval: Duration,
    /// Age at which a silent node is evicted
    pub node_ttl: Duration,
    /// Fan-out cap per gossip round
    pub max_gossip_peers: usize,
    /// Hop budget stamped on outgoing gossip and queries
    pub max_hops: u32,
    /// Sliding dedup window for processed message IDs
    pub message_ttl: Duration,
}

impl Default for DiscoveryTuning {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(10),
            node_ttl: Duration::from_secs(120),
            max_gossip_peers: 10,
            max_hops: 5,
            message_ttl: Duration::from_secs(300),
        }
    }
}

/// Membership changes surfaced to the wiring layer. Emitted through an
/// unbounded channel; the manager never runs subscriber work inline.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A node appeared in the known table
    NodeDiscovered(PeerNode),
    /// A known node's record was superseded
    NodeUpdated(PeerNode),
    /// A node aged out of the known table
    NodeLost(NodeId),
}

struct State {
    local: PeerNode,
    known: HashMap<NodeId, PeerNode>,
    address_index: HashMap<String, NodeId>,
    peer_addresses: HashSet<String>,
    view: AggregateView,
}

impl State {
    fn rebuild_view(&mut self) {
        self.view = AggregateView::rebuild(std::iter::once(&self.local).chain(self.known.values()));
    }
}

/// The discovery state holder
pub struct DiscoveryManager {
    state: RwLock<State>,
    processed: Mutex<HashMap<Uuid, Instant>>,
    tuning: DiscoveryTuning,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
}

impl DiscoveryManager {
    /// Create a manager owning `local` for the process lifetime.
    pub fn new(local: PeerNode, tuning: DiscoveryTuning) -> Self {
        let mut state = State {
            local,
            known: HashMap::new(),
            address_index: HashMap::new(),
            peer_addresses: HashSet::new(),
            view: AggregateView::default(),
        };
        state.rebuild_view();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(state),
            processed: Mutex::new(HashMap::new()),
            tuning,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Tuning knobs in effect
    pub fn tuning(&self) -> &DiscoveryTuning {
        &self.tuning
    }

    /// Take the membership event stream; yields once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.events_rx.lock().take()
    }

    /// Replace the local resource snapshot, bump the version, and
    /// rebuild the view.
    pub fn update_local_node(&self, capacity: Option<Capacity>, tags: Option<CapabilityTags>) {
        let mut state = self.state.write();
        let now = Utc::now();
        state.local.capacity = capacity;
        state.local.capability_tags = tags;
        state.local.version += 1;
        state.local.last_updated = now;
        state.local.last_seen = now;
        state.rebuild_view();
    }

    /// Copy of the local record
    pub fn local_node(&self) -> PeerNode {
        self.state.read().local.clone()
    }

    /// Copies of every known record
    pub fn known_nodes(&self) -> Vec<PeerNode> {
        self.state.read().known.values().cloned().collect()
    }

    /// Copy of one known record
    pub fn node_by_id(&self, id: &str) -> Option<PeerNode> {
        let state = self.state.read();
        if state.local.id == id {
            return Some(state.local.clone());
        }
        state.known.get(id).cloned()
    }

    /// Resolve a generic RPC address to a node ID
    pub fn resolve_address(&self, address: &str) -> Option<NodeId> {
        self.state.read().address_index.get(address).cloned()
    }

    /// The gossip payload: local plus known records.
    pub fn snapshot(&self) -> Vec<PeerNode> {
        let state = self.state.read();
        let mut nodes = Vec::with_capacity(1 + state.known.len());
        nodes.push(state.local.clone());
        nodes.extend(state.known.values().cloned());
        nodes
    }

    /// Merge one replicated record observed through `source_peer`.
    /// Returns true when the record was accepted.
    pub fn process_node_info(&self, incoming: PeerNode, source_peer: &str) -> bool {
        let mut state = self.state.write();
        if incoming.domain_id != state.local.domain_id || incoming.id == state.local.id {
            return false;
        }

        let now = Utc::now();
        let accepted = match state.known.get(&incoming.id) {
            None => {
                let mut node = incoming;
                node.discovered_at = now;
                node.last_seen = now;
                node.source_peer = Some(source_peer.to_string());
                info!(node = %node.id, via = source_peer, "node discovered");
                state.address_index.insert(node.address.clone(), node.id.clone());
                let _ = self.events_tx.send(DiscoveryEvent::NodeDiscovered(node.clone()));
                state.known.insert(node.id.clone(), node);
                true
            }
            Some(current) if current.superseded_by(&incoming) => {
                let mut node = incoming;
                node.discovered_at = current.discovered_at;
                node.last_seen = now;
                node.source_peer = Some(source_peer.to_string());
                debug!(node = %node.id, version = node.version, "node record superseded");
                state.address_index.insert(node.address.clone(), node.id.clone());
                let _ = self.events_tx.send(DiscoveryEvent::NodeUpdated(node.clone()));
                state.known.insert(node.id.clone(), node);
                true
            }
            Some(_) => false,
        };

        if accepted {
            state.rebuild_view();
        }
        accepted
    }

    /// Online nodes whose capability bits cover `required_tags` and
    /// whose available resources fit `request`, best headroom first.
    pub fn find_available_nodes(
        &self,
        request: &ResourceInfo,
        required_tags: &CapabilityTags,
    ) -> Vec<PeerNode> {
        let state = self.state.read();
        state
            .view
            .nodes_by_availability
            .iter()
            .filter(|node| {
                node.capability_tags
                    .as_ref()
                    .map(|tags| tags.superset_of(required_tags))
                    .unwrap_or(required_tags.is_empty())
            })
            .filter(|node| node.available().fits(request))
            .cloned()
            .collect()
    }

    /// Aggregate capacity totals over online nodes
    pub fn aggregate_totals(&self) -> Capacity {
        self.state.read().view.totals.clone()
    }

    /// Union of online nodes' capability bits
    pub fn aggregate_tags(&self) -> CapabilityTags {
        self.state.read().view.tag_union
    }

    /// Status counts for observability
    pub fn counts(&self) -> ViewCounts {
        self.state.read().view.counts
    }

    /// Add a peer address; empty addresses are a no-op.
    pub fn add_peer(&self, address: &str) {
        if address.is_empty() {
            return;
        }
        self.state.write().peer_addresses.insert(address.to_string());
    }

    /// Remove a peer address
    pub fn remove_peer(&self, address: &str) {
        self.state.write().peer_addresses.remove(address);
    }

    /// Copy of the peer set
    pub fn peers(&self) -> Vec<String> {
        self.state.read().peer_addresses.iter().cloned().collect()
    }

    /// Whether a gossip message ID is inside the dedup window
    pub fn is_message_processed(&self, message_id: &Uuid) -> bool {
        self.processed.lock().contains_key(message_id)
    }

    /// Record a gossip message ID in the dedup window
    pub fn mark_message_processed(&self, message_id: Uuid) {
        self.processed.lock().insert(message_id, Instant::now());
    }

    /// Evict aged nodes and expired message IDs. Runs on the cleanup
    /// timer; returns the IDs of nodes that were lost.
    pub fn cleanup(&self) -> Vec<NodeId> {
        let node_ttl =
            chrono::Duration::from_std(self.tuning.node_ttl).unwrap_or(chrono::Duration::seconds(120));
        let cutoff = Utc::now() - node_ttl;

        let mut lost = Vec::new();
        {
            let mut state = self.state.write();
            let expired: Vec<NodeId> = state
                .known
                .values()
                .filter(|n| n.last_seen < cutoff)
                .map(|n| n.id.clone())
                .collect();
            for id in &expired {
                if let Some(node) = state.known.remove(id) {
                    state.address_index.remove(&node.address);
                    info!(node = %id, "node aged out");
                    let _ = self.events_tx.send(DiscoveryEvent::NodeLost(id.clone()));
                    lost.push(id.clone());
                }
            }
            if !lost.is_empty() {
                state.rebuild_view();
            }
        }

        let message_ttl = self.tuning.message_ttl;
        self.processed.lock().retain(|_, seen| seen.elapsed() < message_ttl);

        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn manager() -> DiscoveryManager {
        let local = PeerNode::new(
            "node.local".to_string(),
            "local",
            "dom",
            "127.0.0.1:7000",
            "127.0.0.1:7001",
        );
        DiscoveryManager::new(local, DiscoveryTuning::default())
    }

    fn peer(id: &str, version: u64) -> PeerNode {
        let mut node = PeerNode::new(id.to_string(), id, "dom", format!("{id}:7000"), format!("{id}:7001"));
        node.version = version;
        node.capacity = Some(Capacity::new(ResourceInfo::new(4000, 0, 0), ResourceInfo::default()));
        node.capability_tags = Some(CapabilityTags { cpu: true, ..Default::default() });
        node
    }

    #[test]
    fn unknown_nodes_are_inserted_and_announced() {
        let m = manager();
        let mut events = m.events().unwrap();
        assert!(m.process_node_info(peer("node.b", 1), "node.b:7000"));
        assert_eq!(m.known_nodes().len(), 1);
        assert!(matches!(events.try_recv().unwrap(), DiscoveryEvent::NodeDiscovered(_)));
        assert_eq!(m.resolve_address("node.b:7000").unwrap(), "node.b");
    }

    #[test]
    fn cross_domain_and_self_records_are_dropped() {
        let m = manager();
        let mut foreign = peer("node.x", 1);
        foreign.domain_id = "other".to_string();
        assert!(!m.process_node_info(foreign, "peer"));

        let own = PeerNode::new("node.local".to_string(), "me", "dom", "a", "b");
        assert!(!m.process_node_info(own, "peer"));
        assert!(m.known_nodes().is_empty());
    }

    #[test]
    fn stale_versions_leave_state_unchanged() {
        let m = manager();
        assert!(m.process_node_info(peer("node.b", 7), "p1"));
        let before = m.node_by_id("node.b").unwrap();

        let mut stale = peer("node.b", 5);
        stale.last_updated = before.last_updated + ChronoDuration::seconds(60);
        assert!(!m.process_node_info(stale, "p2"));

        let after = m.node_by_id("node.b").unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.last_seen, before.last_seen);
        assert_eq!(after.source_peer, before.source_peer);
    }

    #[test]
    fn newer_versions_replace_resource_fields_whole() {
        let m = manager();
        assert!(m.process_node_info(peer("node.b", 1), "p1"));

        let mut newer = peer("node.b", 2);
        newer.capacity = None;
        assert!(m.process_node_info(newer, "p2"));

        let merged = m.node_by_id("node.b").unwrap();
        assert_eq!(merged.version, 2);
        assert!(merged.capacity.is_none());
        // Null capacity keeps the node in the online set.
        assert_eq!(m.counts().online, 2);
    }

    #[test]
    fn local_updates_bump_version_and_rebuild() {
        let m = manager();
        let v0 = m.local_node().version;
        m.update_local_node(
            Some(Capacity::new(ResourceInfo::new(2000, 0, 0), ResourceInfo::default())),
            Some(CapabilityTags { cpu: true, ..Default::default() }),
        );
        assert_eq!(m.local_node().version, v0 + 1);
        assert_eq!(m.aggregate_totals().total.cpu, 2000);
    }

    #[test]
    fn find_available_nodes_honours_tags_and_fit() {
        let m = manager();
        m.process_node_info(peer("node.cpu", 1), "p");
        let mut gpu_node = peer("node.gpu", 1);
        gpu_node.capacity = Some(Capacity::new(ResourceInfo::new(1000, 0, 4), ResourceInfo::default()));
        gpu_node.capability_tags = Some(CapabilityTags { cpu: true, gpu: true, ..Default::default() });
        m.process_node_info(gpu_node, "p");

        let wants_gpu = CapabilityTags { gpu: true, ..Default::default() };
        let found = m.find_available_nodes(&ResourceInfo::new(500, 0, 1), &wants_gpu);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "node.gpu");

        let found = m.find_available_nodes(&ResourceInfo::new(500, 0, 0), &CapabilityTags::default());
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn cleanup_evicts_aged_nodes_and_message_ids() {
        let local = PeerNode::new("node.local".to_string(), "l", "dom", "a:1", "a:2");
        let tuning = DiscoveryTuning {
            node_ttl: Duration::from_secs(60),
            message_ttl: Duration::from_millis(0),
            ..Default::default()
        };
        let m = DiscoveryManager::new(local, tuning);
        let mut events = m.events().unwrap();

        let mut old = peer("node.old", 1);
        old.last_seen = Utc::now() - ChronoDuration::seconds(3600);
        // Insert through the merge path, then age it artificially.
        m.process_node_info(old.clone(), "p");
        {
            let mut state = m.state.write();
            state.known.get_mut("node.old").unwrap().last_seen =
                Utc::now() - ChronoDuration::seconds(3600);
        }

        let id = Uuid::new_v4();
        m.mark_message_processed(id);

        let lost = m.cleanup();
        assert_eq!(lost, vec!["node.old".to_string()]);
        assert!(!m.is_message_processed(&id));
        // Skip discovery event, expect the loss afterwards.
        assert!(matches!(events.try_recv().unwrap(), DiscoveryEvent::NodeDiscovered(_)));
        assert!(matches!(events.try_recv().unwrap(), DiscoveryEvent::NodeLost(_)));
    }

    #[test]
    fn duplicate_message_window() {
        let m = manager();
        let id = Uuid::new_v4();
        assert!(!m.is_message_processed(&id));
        m.mark_message_processed(id);
        assert!(m.is_message_processed(&id));
    }

    #[test]
    fn empty_peer_address_is_a_noop() {
        let m = manager();
        m.add_peer("");
        assert!(m.peers().is_empty());
        m.add_peer("10.0.0.2:7000");
        assert_eq!(m.peers(), vec!["10.0.0.2:7000".to_string()]);
        m.remove_peer("10.0.0.2:7000");
        assert!(m.peers().is_empty());
    }
}
