//! WeaveMesh - Domain-scoped peer-to-peer compute fabric
//!
//! A set of equal-status nodes within one administrative domain
//! cooperate to place components on providers. Four substrates carry
//! the placement pipeline:
//!
//! - **discovery**: gossip-aggregated, eventually consistent view of
//!   per-node resources and capability tags
//! - **scheduler**: two-phase (propose/commit) cross-node placement
//!   with local → peer → optional-global fallback
//! - **session**: one control stream per back-end multiplexing every
//!   deployed component, bridging the RPC control plane and the
//!   per-component message-passing plane
//! - **provider / store**: the execution back-end contract with
//!   health-gated capacity, and the content-addressed object store
//!   shuttling values between producers and consumers

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod audit;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fabric;
pub mod node;
pub mod provider;
pub mod resources;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod store;

pub use config::FabricConfig;
pub use error::{FabricError, Result};
pub use fabric::FabricNode;
pub use node::{NodeId, NodeStatus, PeerNode};
pub use resources::{Capacity, CapabilityTags, ResourceInfo};
