//! Node assembly
//!
//! Explicit wiring at startup: every subsystem is constructed once,
//! handed narrow interfaces to its collaborators, and driven by one
//! shared shutdown signal. Every node runs one instance of every
//! component.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, MemoryAuditStore, SledAuditStore};
use crate::config::FabricConfig;
use crate::discovery::{DiscoveryManager, DiscoveryService, DiscoveryTuning};
use crate::error::{FabricError, Result};
use crate::node::{load_or_create_node_id, NodeId, PeerNode};
use crate::provider::{InProcessProvider, ProviderRegistry};
use crate::resources::{CapabilityTags, ResourceInfo};
use crate::rpc::{LogControl, Request, Response, RpcClient, RpcServer, RpcService};
use crate::scheduler::{
    ComponentTable, DeployComponentRequest, DeployReply, PlacementCoordinator, PolicyChain,
    RegistryClient, SchedulerService,
};
use crate::session::{
    channel::MemoryBackend, memory_control_pair, ControlChannel, ProcessTranscoder, SessionFabric,
    TcpComponentConnector, TcpControlChannel,
};
use crate::store::{Language, MemoryObjectStore, ObjectStore};

/// Serves the generic RPC surface: discovery, the object store, and
/// the per-component log stream.
struct GenericRpcService {
    discovery: Arc<DiscoveryService>,
    store: Arc<dyn ObjectStore>,
}

#[async_trait]
impl RpcService for GenericRpcService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Gossip(message) => Response::Gossip(self.discovery.handle_gossip(message)),
            Request::QueryResources(query) => {
                Response::QueryResources(self.discovery.handle_query(query))
            }
            Request::ExchangePeers(exchange) => {
                Response::ExchangePeers(self.discovery.handle_peer_exchange(exchange))
            }
            Request::GetLocalNodeInfo => {
                Response::LocalNodeInfo(self.discovery.handle_local_node_info())
            }

            Request::SaveObject(object) => match self.store.save_object(object).await {
                Ok(reference) => Response::ObjectSaved(reference),
                Err(err) => Response::Error { message: err.to_string() },
            },
            Request::GetObject(reference) => match self.store.get_object(&reference).await {
                Ok(object) => Response::Object(object),
                Err(err) => Response::Error { message: err.to_string() },
            },
            Request::SaveStreamChunk { id, chunk } => {
                match self.store.save_stream_chunk(&id, chunk).await {
                    Ok(offset) => Response::ChunkSaved(offset),
                    Err(err) => Response::Error { message: err.to_string() },
                }
            }
            Request::GetStreamChunk { id, offset } => {
                match self.store.get_stream_chunk(&id, offset).await {
                    Ok(chunk) => Response::Chunk(chunk),
                    Err(err) => Response::Error { message: err.to_string() },
                }
            }
            Request::GetStoreId => Response::StoreId(self.store.store_id().to_string()),

            Request::StreamLog(control) => {
                match control {
                    LogControl::Entry(entry) => {
                        info!(
                            component = %entry.component_id,
                            level = %entry.level,
                            "{}",
                            entry.message
                        );
                    }
                    LogControl::Close { component_id } => {
                        debug!(component = %component_id, "log stream closed");
                    }
                }
                Response::Ack(crate::scheduler::AckReply::ok())
            }

            _ => Response::Error { message: "not served on the generic surface".to_string() },
        }
    }
}

/// One running node: every core component wired and serving.
pub struct FabricNode {
    node_id: NodeId,
    discovery: Arc<DiscoveryService>,
    scheduler: Arc<SchedulerService>,
    coordinator: Arc<PlacementCoordinator>,
    providers: Arc<ProviderRegistry>,
    session_fabric: Arc<SessionFabric>,
    store: Arc<dyn ObjectStore>,
    rpc_addr: SocketAddr,
    scheduler_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    /// Keeps an in-memory back-end alive when no real one is attached
    _loopback_backend: Option<MemoryBackend>,
}

impl FabricNode {
    /// Start a node with the default (admit-everything) policy chain.
    pub async fn start(config: FabricConfig) -> Result<Arc<Self>> {
        Self::start_with_policies(config, PolicyChain::new()).await
    }

    /// Start a node with an explicit policy chain.
    pub async fn start_with_policies(
        config: FabricConfig,
        policies: PolicyChain,
    ) -> Result<Arc<Self>> {
        let node_id = load_or_create_node_id(&config.node.data_dir);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = RpcClient::with_hosts(config.dns.hosts.clone());

        // Listeners come first so ephemeral ports are known before the
        // local record is built.
        let store: Arc<dyn ObjectStore> =
            Arc::new(MemoryObjectStore::new(format!("store.{node_id}")));

        let bind = |port: u16| format!("{}:{port}", config.server.host);
        let advertised = |configured: &Option<String>, addr: SocketAddr| {
            configured.clone().unwrap_or_else(|| format!("127.0.0.1:{}", addr.port()))
        };

        // Local identity and the discovery substrate.
        let tuning = DiscoveryTuning {
            gossip_interval: config.gossip_interval(),
            node_ttl: config.node_ttl(),
            max_gossip_peers: config.discovery.max_gossip_peers,
            max_hops: config.discovery.max_hops,
            ..Default::default()
        };

        // Providers: one in-process provider carrying the configured
        // resource envelope; container/VM/unikernel runners register
        // through the same contract.
        let providers = Arc::new(ProviderRegistry::new(std::time::Duration::from_secs(
            config.provider.health_ttl_secs.max(1),
        )));
        let languages: Vec<Language> = config
            .supported_languages
            .iter()
            .filter_map(|name| Language::parse(name))
            .collect();
        let base_tags = CapabilityTags::parse(&config.resource_tags);
        let provider_id = format!("proc.{node_id}");
        let provider = Arc::new(InProcessProvider::new(
            provider_id.clone(),
            "in-process provider",
            ResourceInfo::new(config.resource.cpu, config.resource.memory.bytes(), config.resource.gpu),
            base_tags,
            languages,
        ));
        providers.register(provider).connect(&provider_id)?;

        // Session fabric over the back-end control stream; without a
        // configured back-end a loopback pair keeps the plane inert.
        let (control, loopback_backend): (Arc<dyn ControlChannel>, Option<MemoryBackend>) =
            match &config.backend_addr {
                Some(addr) => match TcpControlChannel::connect(addr).await {
                    Ok(channel) => (Arc::new(channel), None),
                    Err(err) => {
                        warn!(%addr, %err, "back-end unreachable; running with a loopback control stream");
                        let (control, backend) = memory_control_pair();
                        (Arc::new(control), Some(backend))
                    }
                },
                None => {
                    let (control, backend) = memory_control_pair();
                    (Arc::new(control), Some(backend))
                }
            };
        let session_fabric = SessionFabric::start(
            control,
            store.clone(),
            store.clone(),
            Arc::new(ProcessTranscoder::new()),
            Arc::new(TcpComponentConnector),
        );

        // Audit log under the data directory; memory fallback keeps
        // the node alive when the directory is unwritable.
        let audit = match sled::open(config.node.data_dir.join("audit"))
            .map_err(|e| FabricError::internal(format!("audit db: {e}")))
            .and_then(|db| SledAuditStore::open(&db))
        {
            Ok(sled_store) => Arc::new(AuditLog::new(Box::new(sled_store))),
            Err(err) => {
                warn!(%err, "audit persistence unavailable; using in-memory log");
                Arc::new(AuditLog::new(Box::new(MemoryAuditStore::new())))
            }
        };

        // Bind both surfaces before advertising anything; services
        // attach when serving starts.
        let generic_server = RpcServer::bind(&bind(config.server.port)).await?;
        let scheduler_server = RpcServer::bind(&bind(config.server.scheduler_port)).await?;
        let rpc_addr = generic_server.local_addr();
        let scheduler_addr = scheduler_server.local_addr();

        let mut local = PeerNode::new(
            node_id.clone(),
            config.node.name.clone(),
            config.node.domain_id.clone(),
            advertised(&config.node.address, rpc_addr),
            advertised(&config.node.scheduler_address, scheduler_addr),
        );
        local.capability_tags = Some(base_tags);
        let manager = Arc::new(DiscoveryManager::new(local, tuning));
        for peer in &config.node.peers {
            manager.add_peer(peer);
        }
        let discovery = Arc::new(DiscoveryService::new(manager, client.clone()));

        // Scheduling stack.
        let components = Arc::new(ComponentTable::new());
        let scheduler = Arc::new(SchedulerService::new(
            providers.clone(),
            components.clone(),
            discovery.manager().clone(),
            session_fabric.clone(),
            audit,
            client.clone(),
        ));
        let registry = config.node.global_registry_addr.as_deref().map(RegistryClient::new);
        let coordinator = Arc::new(PlacementCoordinator::new(
            discovery.clone(),
            scheduler.clone(),
            providers.clone(),
            components,
            policies,
            client,
            registry,
            base_tags,
        ));
        scheduler.set_coordinator(coordinator.clone());

        // Seed gossip with the configured provider envelope before the
        // first health tick.
        coordinator.refresh_local_view().await;

        // Serve both surfaces on the listeners bound above.
        let generic_service =
            Arc::new(GenericRpcService { discovery: discovery.clone(), store: store.clone() });
        tokio::spawn(generic_server.serve(generic_service, shutdown_rx.clone()));
        tokio::spawn(scheduler_server.serve(scheduler.clone(), shutdown_rx.clone()));
        tokio::spawn(providers.clone().run(shutdown_rx.clone()));
        tokio::spawn(discovery.clone().run(shutdown_rx.clone()));
        tokio::spawn(coordinator.clone().run(shutdown_rx));

        info!(
            node = %node_id,
            rpc = %rpc_addr,
            scheduler = %scheduler_addr,
            domain = %config.node.domain_id,
            "node started"
        );

        Ok(Arc::new(Self {
            node_id,
            discovery,
            scheduler,
            coordinator,
            providers,
            session_fabric,
            store,
            rpc_addr,
            scheduler_addr,
            shutdown_tx,
            _loopback_backend: loopback_backend,
        }))
    }

    /// Stable node identity
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bound generic RPC address
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Bound scheduler RPC address
    pub fn scheduler_addr(&self) -> SocketAddr {
        self.scheduler_addr
    }

    /// The discovery service
    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// The scheduler service
    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    /// The placement coordinator
    pub fn coordinator(&self) -> &Arc<PlacementCoordinator> {
        &self.coordinator
    }

    /// The provider registry
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// The component session fabric
    pub fn session_fabric(&self) -> &Arc<SessionFabric> {
        &self.session_fabric
    }

    /// The node's object store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Place a component through the full pipeline.
    pub async fn deploy(&self, request: DeployComponentRequest) -> DeployReply {
        self.scheduler.deploy_component(request).await
    }

    /// Stop every loop and listener; children observe within one
    /// polling tick.
    pub fn shutdown(&self) {
        info!(node = %self.node_id, "node stopping");
        self.session_fabric.shutdown();
        let _ = self.shutdown_tx.send(true);
    }
}
