//! Scheduler service
//!
//! The two-phase placement surface of a node: propose picks a provider
//! without committing anything, commit binds a specific prior proposal
//! and deploys. The same operations serve local callers and peers over
//! the scheduler RPC listener.

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{AuditLog, OperationLog};
use crate::discovery::DiscoveryManager;
use crate::error::{FabricError, Result};
use crate::node::NodeId;
use crate::provider::ProviderRegistry;
use crate::resources::ResourceInfo;
use crate::rpc::{Request, Response, RpcClient, RpcService};
use crate::session::SessionFabric;
use crate::store::Language;

use super::components::ComponentTable;
use super::coordinator::PlacementCoordinator;
use super::types::{
    local_provider_id, AckReply, CommitRequest, ComponentRecord, DeployComponentRequest,
    DeployReply, ProposeReply, ProposeRequest, ProviderBinding, ProvidersReply, StatusReply,
    UndeployRequest,
};

/// Output of the propose phase: a candidate, nothing committed.
#[derive(Debug, Clone)]
pub struct ScheduleProposal {
    /// Proposing node
    pub node_id: NodeId,
    /// Proposing node's name
    pub node_name: String,
    /// Raw (un-namespaced) provider ID on that node
    pub provider_id: String,
    /// Provider headroom at proposal time
    pub available: ResourceInfo,
    /// Language the provider would execute
    pub language: Language,
}

/// The node's scheduling surface
pub struct SchedulerService {
    providers: Arc<ProviderRegistry>,
    components: Arc<ComponentTable>,
    discovery: Arc<DiscoveryManager>,
    fabric: Arc<SessionFabric>,
    audit: Arc<AuditLog>,
    client: RpcClient,
    coordinator: OnceLock<Arc<PlacementCoordinator>>,
}

impl SchedulerService {
    /// Wire the service over its collaborators.
    pub fn new(
        providers: Arc<ProviderRegistry>,
        components: Arc<ComponentTable>,
        discovery: Arc<DiscoveryManager>,
        fabric: Arc<SessionFabric>,
        audit: Arc<AuditLog>,
        client: RpcClient,
    ) -> Self {
        Self {
            providers,
            components,
            discovery,
            fabric,
            audit,
            client,
            coordinator: OnceLock::new(),
        }
    }

    /// Late wiring of the placement coordinator; set once at startup.
    pub fn set_coordinator(&self, coordinator: Arc<PlacementCoordinator>) {
        let _ = self.coordinator.set(coordinator);
    }

    /// The component table
    pub fn components(&self) -> &Arc<ComponentTable> {
        &self.components
    }

    /// The provider registry
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    async fn record_audit(&self, operation: &str, resource_id: &str, action: &str) {
        let log = OperationLog::fabric(operation, "component", resource_id, action);
        if let Err(err) = self.audit.record_operation(log).await {
            warn!(%err, "audit append failed");
        }
    }

    /// First phase: pick a provider on this node that fits the
    /// request. Nothing is deployed.
    pub async fn propose_local_schedule(&self, request: &ProposeRequest) -> Result<ScheduleProposal> {
        let local = self.discovery.local_node();
        let (provider_id, available, language) =
            self.providers.find_for_request(&request.resources, request.language).await?;
        Ok(ScheduleProposal {
            node_id: local.id,
            node_name: local.name,
            provider_id,
            available,
            language,
        })
    }

    /// Second phase: deploy on the exact provider a prior proposal
    /// named. Refuses stale proposals: disconnected provider, language
    /// no longer offered, or capacity gone.
    pub async fn commit_local_schedule(&self, request: &CommitRequest) -> Result<ComponentRecord> {
        let handle = self
            .providers
            .get(&request.provider_id)
            .ok_or_else(|| FabricError::not_found(format!("provider {}", request.provider_id)))?;

        if !handle.is_connected() {
            return Err(FabricError::conflict(format!(
                "provider {} is not connected",
                request.provider_id
            )));
        }
        if !handle.provider().supported_languages().contains(&request.runtime.language) {
            return Err(FabricError::unsupported(format!(
                "language {} on provider {}",
                request.runtime.language, request.provider_id
            )));
        }
        if !handle.reported_capacity().await.available.fits(&request.resources) {
            return Err(FabricError::capacity_exhausted(format!(
                "provider {} no longer fits the request",
                request.provider_id
            )));
        }

        let component_id = ComponentRecord::fresh_id();
        let deploy = crate::provider::DeployRequest {
            instance_id: component_id.clone(),
            language: request.runtime.language,
            resources: request.resources.clone(),
            env: request.upstream.env(),
        };
        handle.deploy(&request.provider_id, deploy).await?;

        let record = ComponentRecord {
            id: component_id.clone(),
            image: request.runtime.image.clone(),
            resource_usage: request.resources.clone(),
            provider_id: local_provider_id(&request.provider_id),
            deployed_at: Utc::now(),
        };
        self.components.register(record.clone());
        self.record_audit("commit_schedule", &record.id, "create").await;
        info!(component = %record.id, provider = %record.provider_id, "schedule committed");

        // The session plane is separate from the placement plane: a
        // socket that cannot be bound yet does not undo the commit.
        if let Err(err) =
            self.fabric.open_session(&component_id, &component_id, &request.upstream.zmq_addr).await
        {
            warn!(component = %component_id, %err, "session not opened");
        }

        Ok(record)
    }

    /// Top-level deploy: targetless requests go through the placement
    /// coordinator, targeted ones are forwarded to the target's
    /// scheduler.
    pub async fn deploy_component(&self, request: DeployComponentRequest) -> DeployReply {
        let local = self.discovery.local_node();
        match request.target_node_id.clone() {
            Some(target) if target != local.id => {
                let addr = request.target_address.clone().or_else(|| {
                    self.discovery.node_by_id(&target).map(|n| n.scheduler_address)
                });
                let Some(addr) = addr else {
                    return DeployReply::fail(format!("unknown target node {target}"));
                };
                let mut forwarded = request;
                forwarded.target_node_id = None;
                forwarded.target_address = None;
                match self.client.deploy_component(&addr, forwarded).await {
                    Ok(reply) => reply,
                    Err(err) => DeployReply::fail(err.to_string()),
                }
            }
            _ => match self.coordinator.get() {
                Some(coordinator) => match coordinator.deploy_component(request).await {
                    Ok(reply) => reply,
                    Err(err) => DeployReply::fail(err.to_string()),
                },
                None => DeployReply::fail("placement coordinator not wired"),
            },
        }
    }

    /// Providers on this node.
    pub async fn list_providers(&self, include_resources: bool) -> ProvidersReply {
        ProvidersReply {
            success: true,
            error: None,
            providers: self.providers.list(include_resources).await,
        }
    }

    /// Providers on a peer, resolved through discovery.
    pub async fn list_remote_providers(
        &self,
        node_id: &str,
        include_resources: bool,
    ) -> Result<ProvidersReply> {
        let node = self
            .discovery
            .node_by_id(node_id)
            .ok_or_else(|| FabricError::not_found(format!("node {node_id}")))?;
        self.client.list_providers(&node.scheduler_address, include_resources).await
    }

    /// Remove a component wherever its namespaced provider ID says it
    /// runs.
    pub async fn undeploy_component(&self, request: &UndeployRequest) -> Result<()> {
        let record = self.components.get(&request.component_id);
        let namespaced = request
            .provider_id
            .clone()
            .or_else(|| record.as_ref().map(|r| r.provider_id.clone()))
            .ok_or_else(|| {
                FabricError::not_found(format!("component {}", request.component_id))
            })?;

        match ProviderBinding::parse(&namespaced) {
            Some(ProviderBinding::Local { provider_id }) => {
                let handle = self
                    .providers
                    .get(&provider_id)
                    .ok_or_else(|| FabricError::not_found(format!("provider {provider_id}")))?;
                handle.undeploy(&provider_id, &request.component_id).await?;
                self.fabric.stop_session(&request.component_id).await;
            }
            Some(ProviderBinding::Remote { node_id, .. })
            | Some(ProviderBinding::Global { node_id, .. }) => {
                let node = self
                    .discovery
                    .node_by_id(&node_id)
                    .ok_or_else(|| FabricError::not_found(format!("node {node_id}")))?;
                let ack = self
                    .client
                    .undeploy_component(
                        &node.scheduler_address,
                        UndeployRequest {
                            component_id: request.component_id.clone(),
                            provider_id: None,
                        },
                    )
                    .await?;
                if !ack.success {
                    return Err(FabricError::internal(
                        ack.error.unwrap_or_else(|| "remote undeploy failed".to_string()),
                    ));
                }
            }
            None => {
                return Err(FabricError::internal(format!(
                    "unparseable provider binding {namespaced}"
                )));
            }
        }

        self.components.remove(&request.component_id);
        self.record_audit("undeploy_component", &request.component_id, "delete").await;
        Ok(())
    }

    /// Status of a committed component.
    pub fn get_deployment_status(&self, component_id: &str) -> StatusReply {
        match self.components.get(component_id) {
            Some(record) => StatusReply { success: true, error: None, component: Some(record) },
            None => StatusReply {
                success: false,
                error: Some(format!("component {component_id} not found")),
                component: None,
            },
        }
    }
}

#[async_trait]
impl RpcService for SchedulerService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::DeployComponent(req) => Response::Deploy(self.deploy_component(req).await),
            Request::ProposeSchedule(req) => {
                let reply = match self.propose_local_schedule(&req).await {
                    Ok(proposal) => ProposeReply {
                        success: true,
                        error: None,
                        node_id: Some(proposal.node_id),
                        node_name: Some(proposal.node_name),
                        provider_id: Some(proposal.provider_id),
                        available: Some(proposal.available),
                        language: Some(proposal.language),
                    },
                    Err(err) => ProposeReply {
                        success: false,
                        error: Some(err.to_string()),
                        ..Default::default()
                    },
                };
                Response::Propose(reply)
            }
            Request::CommitSchedule(req) => {
                let local = self.discovery.local_node();
                let reply = match self.commit_local_schedule(&req).await {
                    Ok(record) => DeployReply::ok(record.id, record.provider_id, local.id),
                    Err(err) => DeployReply::fail(err.to_string()),
                };
                Response::Deploy(reply)
            }
            Request::ListProviders { include_resources } => {
                Response::Providers(self.list_providers(include_resources).await)
            }
            Request::UndeployComponent(req) => {
                let reply = match self.undeploy_component(&req).await {
                    Ok(()) => AckReply::ok(),
                    Err(err) => AckReply::fail(err.to_string()),
                };
                Response::Ack(reply)
            }
            Request::GetDeploymentStatus { component_id } => {
                Response::DeploymentStatus(self.get_deployment_status(&component_id))
            }
            _ => Response::Error { message: "not served on the scheduler surface".to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditStore;
    use crate::discovery::DiscoveryTuning;
    use crate::node::PeerNode;
    use crate::provider::InProcessProvider;
    use crate::resources::CapabilityTags;
    use crate::scheduler::types::{RuntimeEnv, UpstreamAddrs};
    use crate::session::{memory_control_pair, MemoryComponentConnector, ProcessTranscoder};
    use crate::store::MemoryObjectStore;
    use std::time::Duration;

    fn service() -> SchedulerService {
        let local = PeerNode::new(
            "node.local".to_string(),
            "local",
            "dom",
            "127.0.0.1:0",
            "127.0.0.1:0",
        );
        let discovery = Arc::new(DiscoveryManager::new(local, DiscoveryTuning::default()));
        let providers = Arc::new(ProviderRegistry::new(Duration::from_secs(90)));

        let provider = Arc::new(InProcessProvider::new(
            "proc-0",
            "local pool",
            ResourceInfo::new(4000, 8 * 1024 * 1024 * 1024, 0),
            CapabilityTags { cpu: true, memory: true, ..Default::default() },
            vec![Language::Json, Language::Python],
        ));
        providers.register(provider).connect("proc-0").unwrap();

        let (control, _backend) = memory_control_pair();
        let store = Arc::new(MemoryObjectStore::new("store-local"));
        let fabric = SessionFabric::start(
            Arc::new(control),
            store.clone(),
            store,
            Arc::new(ProcessTranscoder::new()),
            Arc::new(MemoryComponentConnector::new()),
        );

        SchedulerService::new(
            providers,
            Arc::new(ComponentTable::new()),
            discovery,
            fabric,
            Arc::new(AuditLog::new(Box::new(MemoryAuditStore::new()))),
            RpcClient::new(),
        )
    }

    fn commit_request(provider_id: &str, cpu: i64) -> CommitRequest {
        CommitRequest {
            runtime: RuntimeEnv { image: "demo:latest".to_string(), language: Language::Json },
            resources: ResourceInfo::new(cpu, 512 * 1024 * 1024, 0),
            provider_id: provider_id.to_string(),
            upstream: UpstreamAddrs::default(),
        }
    }

    #[tokio::test]
    async fn propose_then_commit_deploys_once() {
        let svc = service();
        let proposal = svc
            .propose_local_schedule(&ProposeRequest {
                resources: ResourceInfo::new(1000, 0, 0),
                language: Some(Language::Json),
                requester_node_id: "node.local".to_string(),
                requester_domain_id: "dom".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(proposal.provider_id, "proc-0");
        assert_eq!(proposal.language, Language::Json);

        let record = svc.commit_local_schedule(&commit_request(&proposal.provider_id, 1000)).await.unwrap();
        assert!(record.provider_id.starts_with("local."));
        assert_eq!(svc.components().len(), 1);
        assert_eq!(svc.get_deployment_status(&record.id).component.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn propose_without_capacity_is_exhausted() {
        let svc = service();
        let err = svc
            .propose_local_schedule(&ProposeRequest {
                resources: ResourceInfo::new(64_000, 0, 0),
                language: Some(Language::Json),
                requester_node_id: "node.local".to_string(),
                requester_domain_id: "dom".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.is_capacity_exhausted());
    }

    #[tokio::test]
    async fn commit_refuses_unknown_and_disconnected_providers() {
        let svc = service();
        let err = svc.commit_local_schedule(&commit_request("ghost", 100)).await.unwrap_err();
        assert!(matches!(err, FabricError::NotFound { .. }));

        svc.providers().get("proc-0").unwrap().disconnect("proc-0").unwrap();
        let err = svc.commit_local_schedule(&commit_request("proc-0", 100)).await.unwrap_err();
        assert!(matches!(err, FabricError::Conflict { .. }));
    }

    #[tokio::test]
    async fn commit_refuses_unsupported_language() {
        let svc = service();
        let mut request = commit_request("proc-0", 100);
        request.runtime.language = Language::Go;
        let err = svc.commit_local_schedule(&request).await.unwrap_err();
        assert!(matches!(err, FabricError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn commit_refuses_vanished_capacity() {
        let svc = service();
        let err = svc.commit_local_schedule(&commit_request("proc-0", 64_000)).await.unwrap_err();
        assert!(err.is_capacity_exhausted());
    }

    #[tokio::test]
    async fn undeploy_releases_the_local_provider() {
        let svc = service();
        let record = svc.commit_local_schedule(&commit_request("proc-0", 1000)).await.unwrap();
        svc.undeploy_component(&UndeployRequest {
            component_id: record.id.clone(),
            provider_id: None,
        })
        .await
        .unwrap();
        assert!(svc.components().is_empty());

        let capacity =
            svc.providers().get("proc-0").unwrap().reported_capacity().await;
        assert_eq!(capacity.used.cpu, 0);
    }

    #[tokio::test]
    async fn unknown_component_status_is_a_failed_envelope() {
        let svc = service();
        let status = svc.get_deployment_status("comp.ghost");
        assert!(!status.success);
        assert!(status.error.unwrap().contains("comp.ghost"));
    }
}
