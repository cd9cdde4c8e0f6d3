//! Aggregate resource view
//!
//! The derived, domain-wide snapshot rebuilt on every discovery
//! change: component-wise totals over online nodes, the tag union,
//! per-tag node lists, and the availability-sorted node index the
//! placement path consumes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, NodeStatus, PeerNode};
use crate::resources::{Capacity, CapabilityTags};

/// Node counts for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewCounts {
    /// All nodes in the table, local included
    pub total: usize,
    /// Nodes currently online
    pub online: usize,
    /// Nodes that announced departure
    pub offline: usize,
    /// Nodes in an error state
    pub error: usize,
}

/// The rebuilt aggregate
#[derive(Debug, Clone, Default)]
pub struct AggregateView {
    /// Component-wise capacity sums over online nodes
    pub totals: Capacity,
    /// OR of all online nodes' capability bits
    pub tag_union: CapabilityTags,
    /// Per-tag node lists, in scan order
    pub nodes_by_tag: HashMap<String, Vec<NodeId>>,
    /// Online nodes sorted descending by availability score
    pub nodes_by_availability: Vec<PeerNode>,
    /// Status counts
    pub counts: ViewCounts,
}

impl AggregateView {
    /// Rebuild from the local node and the known-node table. Called
    /// under the discovery write lock so readers see either the old
    /// or the new snapshot, never an interleaving.
    pub fn rebuild<'a>(nodes: impl Iterator<Item = &'a PeerNode>) -> Self {
        let mut view = AggregateView::default();

        for node in nodes {
            view.counts.total += 1;
            match node.status {
                NodeStatus::Online => view.counts.online += 1,
                NodeStatus::Offline => view.counts.offline += 1,
                NodeStatus::Error => view.counts.error += 1,
                NodeStatus::Unknown => {}
            }

            if node.status != NodeStatus::Online {
                continue;
            }

            // A node with no capacity snapshot stays in the online set
            // and simply contributes nothing to the totals.
            if let Some(capacity) = &node.capacity {
                view.totals = view.totals.plus(capacity);
            }
            if let Some(tags) = &node.capability_tags {
                view.tag_union = view.tag_union.union(tags);
                for label in tags.labels() {
                    view.nodes_by_tag.entry(label).or_default().push(node.id.clone());
                }
            }

            view.nodes_by_availability.push(node.clone());
        }

        view.nodes_by_availability.sort_by(|a, b| {
            b.availability_score()
                .partial_cmp(&a.availability_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceInfo;

    fn node(id: &str, status: NodeStatus, cpu: i64) -> PeerNode {
        let mut n = PeerNode::new(id.to_string(), id, "dom", "addr", "sched");
        n.status = status;
        n.capacity = Some(Capacity::new(ResourceInfo::new(cpu * 2, 0, 0), ResourceInfo::new(cpu, 0, 0)));
        n.capability_tags = Some(CapabilityTags { cpu: true, ..Default::default() });
        n
    }

    #[test]
    fn only_online_nodes_contribute() {
        let nodes = vec![
            node("node.a", NodeStatus::Online, 1000),
            node("node.b", NodeStatus::Offline, 4000),
            node("node.c", NodeStatus::Error, 2000),
        ];
        let view = AggregateView::rebuild(nodes.iter());
        assert_eq!(view.counts, ViewCounts { total: 3, online: 1, offline: 1, error: 1 });
        assert_eq!(view.totals.total.cpu, 2000);
        assert_eq!(view.nodes_by_availability.len(), 1);
    }

    #[test]
    fn availability_index_is_sorted_descending() {
        let nodes = vec![
            node("node.small", NodeStatus::Online, 500),
            node("node.big", NodeStatus::Online, 8000),
            node("node.mid", NodeStatus::Online, 2000),
        ];
        let view = AggregateView::rebuild(nodes.iter());
        let scores: Vec<f64> =
            view.nodes_by_availability.iter().map(|n| n.availability_score()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(view.nodes_by_availability[0].id, "node.big");
    }

    #[test]
    fn null_capacity_keeps_the_node_online_with_zero_contribution() {
        let mut bare = node("node.bare", NodeStatus::Online, 0);
        bare.capacity = None;
        let nodes = vec![bare, node("node.full", NodeStatus::Online, 1000)];
        let view = AggregateView::rebuild(nodes.iter());
        assert_eq!(view.counts.online, 2);
        assert_eq!(view.nodes_by_availability.len(), 2);
        assert_eq!(view.totals.total.cpu, 2000);
        // The empty-handed node ranks last.
        assert_eq!(view.nodes_by_availability[1].id, "node.bare");
    }

    #[test]
    fn per_tag_lists_follow_scan_order() {
        let nodes = vec![
            node("node.a", NodeStatus::Online, 100),
            node("node.b", NodeStatus::Online, 100),
        ];
        let view = AggregateView::rebuild(nodes.iter());
        assert_eq!(view.nodes_by_tag.get("cpu").unwrap(), &vec!["node.a".to_string(), "node.b".to_string()]);
        assert!(view.tag_union.cpu);
        assert!(!view.tag_union.gpu);
    }
}
