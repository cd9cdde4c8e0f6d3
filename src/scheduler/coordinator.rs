//! Placement coordinator
//!
//! The entry point for placement: try the local node, then peers
//! ranked by headroom through the two-phase remote schedule, then an
//! optional global scheduler. Also owns the node's two background
//! loops: the registry/health loop that keeps the gossiped local view
//! fresh, and the usage-polling loop.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::discovery::DiscoveryService;
use crate::error::{FabricError, Result};
use crate::node::PeerNode;
use crate::provider::ProviderRegistry;
use crate::resources::CapabilityTags;
use crate::rpc::RpcClient;

use super::components::ComponentTable;
use super::policy::{PolicyChain, PolicyContext};
use super::registry::{RegistryClient, RegistryHeartbeat};
use super::service::SchedulerService;
use super::types::{
    global_provider_id, remote_provider_id, CommitRequest, ComponentRecord,
    DeployComponentRequest, DeployReply, ProposeRequest, ProviderBinding,
};

/// Classify a remote `{success, error}` envelope failure. Peers speak
/// in strings, so capacity exhaustion on the far side is recognised by
/// its canonical message fragment, mirroring the typed gate the local
/// path uses.
fn remote_failure(error: Option<String>, fallback: &str) -> FabricError {
    let message = error.unwrap_or_else(|| fallback.to_string());
    if FabricError::message_indicates_capacity(&message) {
        let detail = message
            .strip_prefix("no available provider: ")
            .unwrap_or(&message)
            .to_string();
        FabricError::capacity_exhausted(detail)
    } else {
        FabricError::internal(message)
    }
}

/// Default interval of the registry/health loop
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
/// Interval of the usage-polling loop
const USAGE_INTERVAL: Duration = Duration::from_secs(2);
/// Deadline for one usage fan-out round
const USAGE_ROUND_DEADLINE: Duration = Duration::from_secs(10);

/// The placement entry point
pub struct PlacementCoordinator {
    discovery: Arc<DiscoveryService>,
    scheduler: Arc<SchedulerService>,
    providers: Arc<ProviderRegistry>,
    components: Arc<ComponentTable>,
    policies: PolicyChain,
    client: RpcClient,
    registry: Option<RegistryClient>,
    base_tags: CapabilityTags,
    utilisation: RwLock<f64>,
}

impl PlacementCoordinator {
    /// Wire the coordinator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<DiscoveryService>,
        scheduler: Arc<SchedulerService>,
        providers: Arc<ProviderRegistry>,
        components: Arc<ComponentTable>,
        policies: PolicyChain,
        client: RpcClient,
        registry: Option<RegistryClient>,
        base_tags: CapabilityTags,
    ) -> Self {
        Self {
            discovery,
            scheduler,
            providers,
            components,
            policies,
            client,
            registry,
            base_tags,
            utilisation: RwLock::new(0.0),
        }
    }

    /// Rolling node utilisation ratio from the usage-polling loop
    pub fn utilisation(&self) -> f64 {
        *self.utilisation.read()
    }

    /// Place a component: local, then peers, then the optional global
    /// scheduler.
    pub async fn deploy_component(&self, request: DeployComponentRequest) -> Result<DeployReply> {
        let local = self.discovery.manager().local_node();

        // 1. Local attempt.
        let local_error = match self.try_local(&request).await {
            Ok(reply) => return Ok(reply),
            // 2. Delegation gate: only a full local node falls through.
            Err(err) if err.is_capacity_exhausted() => err,
            Err(err) => return Err(err),
        };
        info!(%local_error, "local placement failed; delegating to peers");

        // 3. Candidate discovery, ranked by headroom.
        let required_tags = CapabilityTags::for_request(&request.resources);
        let mut candidates =
            self.discovery.query_resources(&request.resources, &required_tags).await;
        candidates.sort_by(|a, b| {
            b.availability_score()
                .partial_cmp(&a.availability_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // 4. Two-phase commit, best proposal first. Peers answer in
        // `{success, error}` envelopes, so capacity exhaustion on the
        // far side is recognised by its message fragment; those misses
        // just mean the gossiped headroom went stale.
        let mut first_peer_error: Option<String> = None;
        let mut peers_all_exhausted = true;
        for candidate in &candidates {
            match self.try_delegate(&request, &local, candidate).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    if err.is_capacity_exhausted() {
                        debug!(peer = %candidate.id, %err, "peer had no room after all");
                    } else {
                        peers_all_exhausted = false;
                        debug!(peer = %candidate.id, %err, "delegated placement failed");
                    }
                    if first_peer_error.is_none() {
                        first_peer_error = Some(format!("{}: {err}", candidate.id));
                    }
                }
            }
        }

        // 5. Global fallback, once and best-effort.
        if let Some(registry) = &self.registry {
            match registry.global_schedule(&request).await {
                Ok(reply) if reply.success => {
                    if let (Some(component_id), Some(provider_id), Some(node_id)) =
                        (&reply.component_id, &reply.provider_id, &reply.node_id)
                    {
                        let namespaced = global_provider_id(provider_id, node_id);
                        self.components.register(ComponentRecord {
                            id: component_id.clone(),
                            image: request.runtime.image.clone(),
                            resource_usage: request.resources.clone(),
                            provider_id: namespaced.clone(),
                            deployed_at: chrono::Utc::now(),
                        });
                        return Ok(DeployReply {
                            provider_id: Some(namespaced),
                            ..reply
                        });
                    }
                    return Ok(reply);
                }
                Ok(reply) => {
                    debug!(error = ?reply.error, "global scheduler declined");
                }
                Err(err) => {
                    debug!(%err, "global scheduler unreachable");
                }
            }
        }

        let peer_part = first_peer_error
            .unwrap_or_else(|| "no peer returned a candidate".to_string());
        let composite = format!("local: {local_error}; peer: {peer_part}");
        if peers_all_exhausted {
            // The whole reachable domain is full: keep the kind the
            // delegation gate matches on, so an upstream node that
            // forwarded this placement treats the subtree as exhausted
            // rather than broken.
            Err(FabricError::capacity_exhausted(composite))
        } else {
            Err(FabricError::internal(composite))
        }
    }

    async fn try_local(&self, request: &DeployComponentRequest) -> Result<DeployReply> {
        let local = self.discovery.manager().local_node();
        let proposal = self
            .scheduler
            .propose_local_schedule(&ProposeRequest {
                resources: request.resources.clone(),
                language: Some(request.runtime.language),
                requester_node_id: local.id.clone(),
                requester_domain_id: local.domain_id.clone(),
            })
            .await?;
        let record = self
            .scheduler
            .commit_local_schedule(&CommitRequest {
                runtime: request.runtime.clone(),
                resources: request.resources.clone(),
                provider_id: proposal.provider_id,
                upstream: request.upstream.clone(),
            })
            .await?;
        Ok(DeployReply::ok(record.id, record.provider_id, local.id))
    }

    async fn try_delegate(
        &self,
        request: &DeployComponentRequest,
        local: &PeerNode,
        candidate: &PeerNode,
    ) -> Result<DeployReply> {
        // Phase one: the peer names a provider.
        let proposal = self
            .client
            .propose_schedule(
                &candidate.scheduler_address,
                ProposeRequest {
                    resources: request.resources.clone(),
                    language: Some(request.runtime.language),
                    requester_node_id: local.id.clone(),
                    requester_domain_id: local.domain_id.clone(),
                },
            )
            .await?;
        if !proposal.success {
            return Err(remote_failure(proposal.error, "proposal refused"));
        }
        let provider_id = proposal
            .provider_id
            .ok_or_else(|| FabricError::internal("proposal without a provider"))?;

        // Policy gate before any commit goes out.
        self.policies.check(&PolicyContext {
            node_id: candidate.id.clone(),
            node_name: proposal.node_name.unwrap_or_else(|| candidate.name.clone()),
            provider_id: provider_id.clone(),
            available: proposal.available.unwrap_or_default(),
            request: request.resources.clone(),
            proposal_domain_id: candidate.domain_id.clone(),
            local_node_id: local.id.clone(),
            local_domain_id: local.domain_id.clone(),
        })?;

        // Phase two: bind exactly that provider.
        let commit = self
            .client
            .commit_schedule(
                &candidate.scheduler_address,
                CommitRequest {
                    runtime: request.runtime.clone(),
                    resources: request.resources.clone(),
                    provider_id: provider_id.clone(),
                    upstream: request.upstream.clone(),
                },
            )
            .await?;
        if !commit.success {
            return Err(remote_failure(commit.error, "commit refused"));
        }

        // Register the component here so it stays addressable.
        let component_id = commit
            .component_id
            .clone()
            .ok_or_else(|| FabricError::internal("commit without a component id"))?;
        let raw_provider = match commit.provider_id.as_deref().and_then(ProviderBinding::parse) {
            Some(ProviderBinding::Local { provider_id }) => provider_id,
            _ => provider_id,
        };
        let namespaced = remote_provider_id(&raw_provider, &candidate.id);
        self.components.register(ComponentRecord {
            id: component_id.clone(),
            image: request.runtime.image.clone(),
            resource_usage: request.resources.clone(),
            provider_id: namespaced.clone(),
            deployed_at: chrono::Utc::now(),
        });
        info!(component = %component_id, node = %candidate.id, "component delegated");

        Ok(DeployReply::ok(component_id, namespaced, candidate.id.clone()))
    }

    /// Aggregate local provider capacity and push it into discovery,
    /// so gossip always carries the freshest local view. Then, when a
    /// registry is configured, push a heartbeat; its reply may adjust
    /// the loop interval.
    pub async fn refresh_local_view(&self) -> Option<Duration> {
        let capacity = self.providers.aggregate_capacity().await;
        let tags = self.providers.aggregate_tags().union(&self.base_tags);
        self.discovery.manager().update_local_node(Some(capacity.clone()), Some(tags));

        let registry = self.registry.as_ref()?;
        let local = self.discovery.manager().local_node();
        let heartbeat = RegistryHeartbeat {
            node_id: local.id.clone(),
            domain_id: local.domain_id.clone(),
            status: "online".to_string(),
            capacity,
            tags: tags.labels(),
            address: local.address.clone(),
            is_head: false,
            providers: self.providers.list(true).await,
        };

        match registry.register(&heartbeat).await {
            Ok(reply) => {
                if reply.require_reregister {
                    debug!("registry requested re-registration");
                    if let Err(err) = registry.register(&heartbeat).await {
                        warn!(%err, "re-registration failed");
                    }
                }
                reply.recommended_interval_seconds.map(Duration::from_secs)
            }
            Err(err) => {
                warn!(%err, "registry heartbeat failed");
                None
            }
        }
    }

    /// One usage round: fan out to all connected providers in
    /// parallel under a round deadline, then fold into the rolling
    /// utilisation ratio. Providers missed this round are simply
    /// retried on the next.
    pub async fn poll_usage(&self) {
        let handles = self.providers.connected();
        if handles.is_empty() {
            return;
        }

        let round = join_all(handles.iter().map(|(id, handle)| {
            let id = id.clone();
            let handle = handle.clone();
            async move {
                match handle.provider().real_time_usage().await {
                    Ok(usage) => Some(usage),
                    Err(err) => {
                        debug!(provider = %id, %err, "usage probe failed");
                        None
                    }
                }
            }
        }));

        let usages = match timeout(USAGE_ROUND_DEADLINE, round).await {
            Ok(usages) => usages,
            Err(_) => {
                warn!("usage round hit its deadline");
                return;
            }
        };

        let used: f64 = usages.into_iter().flatten().map(|u| u.availability_score()).sum();
        let total = self.providers.aggregate_capacity().await.total.availability_score();
        if total <= 0.0 {
            return;
        }
        let ratio = (used / total).clamp(0.0, 1.0);
        let mut utilisation = self.utilisation.write();
        *utilisation = (*utilisation + ratio) / 2.0;
    }

    /// Drive the registry/health loop and the usage-polling loop
    /// until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let health = {
            let coordinator = self.clone();
            let mut shutdown = shutdown.clone();
            async move {
                let mut interval = HEALTH_INTERVAL;
                let mut tick = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            if let Some(recommended) = coordinator.refresh_local_view().await {
                                if recommended != interval && !recommended.is_zero() {
                                    info!(seconds = recommended.as_secs(), "registry adjusted the heartbeat interval");
                                    interval = recommended;
                                    tick = tokio::time::interval(interval);
                                    tick.tick().await;
                                }
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

        let usage = {
            let coordinator = self.clone();
            let mut shutdown = shutdown.clone();
            async move {
                let mut tick = tokio::time::interval(USAGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = tick.tick() => coordinator.poll_usage().await,
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        };

        tokio::join!(health, usage);
        debug!("placement coordinator stopped");
    }
}
