//! Two-phase cross-node scheduling
//!
//! A placement request becomes (a) a ranked set of candidate nodes,
//! (b) a proposed provider on a chosen node, and (c) a committed
//! deployment, with local → peer → optional-global fallback ordering.

pub mod components;
pub mod coordinator;
pub mod policy;
pub mod registry;
pub mod service;
pub mod types;

pub use components::ComponentTable;
pub use coordinator::PlacementCoordinator;
pub use policy::{AdmitAll, DomainGuard, PolicyChain, PolicyContext, PolicyDecision, SchedulePolicy};
pub use registry::{RegistryClient, RegistryHeartbeat, RegistryReply};
pub use service::{ScheduleProposal, SchedulerService};
pub use types::{
    global_provider_id, local_provider_id, remote_provider_id, AckReply, CommitRequest,
    ComponentRecord, DeployComponentRequest, DeployReply, ProposeReply, ProposeRequest,
    ProviderBinding, ProvidersReply, RuntimeEnv, StatusReply, UndeployRequest, UpstreamAddrs,
};
