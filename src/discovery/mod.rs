//! Gossip-based discovery
//!
//! Maintains the live, domain-wide view of per-node resources and
//! capability tags. Eventually consistent by design: nodes exchange
//! versioned snapshots on a timer, merge by version, and age out
//! silent peers.

pub mod aggregate;
pub mod manager;
pub mod messages;
pub mod service;

pub use aggregate::{AggregateView, ViewCounts};
pub use manager::{DiscoveryEvent, DiscoveryManager, DiscoveryTuning};
pub use service::DiscoveryService;
