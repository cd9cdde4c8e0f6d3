//! Fabric RPC transport
//!
//! Length-prefixed bincode envelopes over plain TCP — cleartext within
//! a trusted administrative domain. Every request/response pair rides
//! one short-lived connection; callers attach their own deadline and a
//! deadline miss is just another candidate-selection signal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::discovery::messages::{
    GossipAck, GossipMessage, PeerExchange, PeerExchangeReply, ResourceQuery, ResourceQueryReply,
};
use crate::error::{FabricError, Result};
use crate::node::PeerNode;
use crate::scheduler::types::{
    AckReply, CommitRequest, DeployComponentRequest, DeployReply, ProposeReply, ProposeRequest,
    ProvidersReply, StatusReply, UndeployRequest,
};
use crate::store::{EncodedObject, ObjectRef};

/// Deadline for discovery and scheduling calls
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for object fetches
pub const OBJECT_DEADLINE: Duration = Duration::from_secs(30);

/// One per-component log record on the log stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Component that produced the line
    pub component_id: String,
    /// Severity label
    pub level: String,
    /// Log line
    pub message: String,
    /// Producer timestamp
    pub timestamp: DateTime<Utc>,
}

/// Log-stream control frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogControl {
    /// A log record
    Entry(LogEntry),
    /// The component's stream is complete
    Close {
        /// Component whose stream closed
        component_id: String,
    },
}

/// Every request the fabric carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Gossip snapshot exchange
    Gossip(GossipMessage),
    /// Recursive candidate discovery
    QueryResources(ResourceQuery),
    /// Peer-address exchange
    ExchangePeers(PeerExchange),
    /// The responder's own node record
    GetLocalNodeInfo,

    /// Top-level placement
    DeployComponent(DeployComponentRequest),
    /// Status of a committed component
    GetDeploymentStatus {
        /// Component to look up
        component_id: String,
    },
    /// Two-phase schedule, first phase
    ProposeSchedule(ProposeRequest),
    /// Two-phase schedule, second phase
    CommitSchedule(CommitRequest),
    /// Provider listing
    ListProviders {
        /// Include health-gated capacity in the listing
        include_resources: bool,
    },
    /// Remove a committed component
    UndeployComponent(UndeployRequest),

    /// Persist an encoded object
    SaveObject(EncodedObject),
    /// Fetch an encoded object
    GetObject(ObjectRef),
    /// Append a stream chunk
    SaveStreamChunk {
        /// Stream identity
        id: String,
        /// Chunk payload
        chunk: Vec<u8>,
    },
    /// Fetch a stream chunk
    GetStreamChunk {
        /// Stream identity
        id: String,
        /// Chunk offset
        offset: u64,
    },
    /// The responder's store instance ID
    GetStoreId,

    /// Per-component log stream frame
    StreamLog(LogControl),
}

/// Every reply the fabric carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to [`Request::Gossip`]
    Gossip(GossipAck),
    /// Reply to [`Request::QueryResources`]
    QueryResources(ResourceQueryReply),
    /// Reply to [`Request::ExchangePeers`]
    ExchangePeers(PeerExchangeReply),
    /// Reply to [`Request::GetLocalNodeInfo`]
    LocalNodeInfo(PeerNode),

    /// Reply to deploy and commit requests
    Deploy(DeployReply),
    /// Reply to [`Request::GetDeploymentStatus`]
    DeploymentStatus(StatusReply),
    /// Reply to [`Request::ProposeSchedule`]
    Propose(ProposeReply),
    /// Reply to [`Request::ListProviders`]
    Providers(ProvidersReply),
    /// Bare envelope
    Ack(AckReply),

    /// Reply to [`Request::SaveObject`]
    ObjectSaved(ObjectRef),
    /// Reply to [`Request::GetObject`]
    Object(EncodedObject),
    /// Reply to [`Request::SaveStreamChunk`]
    ChunkSaved(u64),
    /// Reply to [`Request::GetStreamChunk`]
    Chunk(Vec<u8>),
    /// Reply to [`Request::GetStoreId`]
    StoreId(String),

    /// Transport-level failure report
    Error {
        /// Short failure description
        message: String,
    },
}

/// A handler serving one RPC surface.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Handle one request. Application failures belong inside the
    /// reply envelope; returning `Response::Error` is reserved for
    /// requests this surface does not serve.
    async fn handle(&self, request: Request) -> Response;
}

/// One TCP listener serving an [`RpcService`].
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RpcServer {
    /// Bind a listener. Port 0 binds an ephemeral port; read it back
    /// with [`RpcServer::local_addr`] before serving.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FabricError::transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| FabricError::transport(format!("local addr: {e}")))?;
        Ok(Self { listener, local_addr })
    }

    /// The bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown. Each connection gets its own
    /// task and may carry any number of request/response pairs.
    pub async fn serve(self, service: Arc<dyn RpcService>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let service = service.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, service).await {
                                    debug!(%peer, %err, "connection ended with error");
                                }
                            });
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(addr = %self.local_addr, "rpc server stopping");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, service: Arc<dyn RpcService>) -> Result<()> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(|e| FabricError::transport(format!("recv: {e}")))?;
        let response = match bincode::deserialize::<Request>(&frame) {
            Ok(request) => service.handle(request).await,
            Err(err) => {
                // Unknown or malformed frames are logged and answered,
                // never fatal: newer peers may speak newer tags.
                warn!(%err, "undecodable request frame");
                Response::Error { message: format!("undecodable request: {err}") }
            }
        };
        let bytes = bincode::serialize(&response)?;
        framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| FabricError::transport(format!("send: {e}")))?;
    }
    Ok(())
}

/// Dialling side of the fabric RPC.
#[derive(Clone, Default)]
pub struct RpcClient {
    hosts: HashMap<String, String>,
}

impl RpcClient {
    /// Client with no host overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Client applying static host→IP overrides before dialling
    pub fn with_hosts(hosts: HashMap<String, String>) -> Self {
        Self { hosts }
    }

    fn resolve(&self, addr: &str) -> String {
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Some(ip) = self.hosts.get(host) {
                return format!("{ip}:{port}");
            }
        }
        addr.to_string()
    }

    /// One request/response exchange under `deadline`.
    pub async fn call(&self, addr: &str, request: &Request, deadline: Duration) -> Result<Response> {
        let target = self.resolve(addr);
        let exchange = async {
            let stream = TcpStream::connect(&target)
                .await
                .map_err(|e| FabricError::transport(format!("dial {target}: {e}")))?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            framed
                .send(Bytes::from(bincode::serialize(request)?))
                .await
                .map_err(|e| FabricError::transport(format!("send {target}: {e}")))?;
            match framed.next().await {
                Some(Ok(frame)) => Ok(bincode::deserialize::<Response>(&frame)?),
                Some(Err(err)) => Err(FabricError::transport(format!("recv {target}: {err}"))),
                None => Err(FabricError::transport(format!("{target} closed the stream"))),
            }
        };
        timeout(deadline, exchange)
            .await
            .map_err(|_| FabricError::deadline(format!("rpc to {target}")))?
    }

    /// Send a gossip snapshot, returning the peer's snapshot.
    pub async fn gossip(&self, addr: &str, message: GossipMessage) -> Result<GossipAck> {
        match self.call(addr, &Request::Gossip(message), QUERY_DEADLINE).await? {
            Response::Gossip(ack) => Ok(ack),
            other => Err(unexpected("gossip", &other)),
        }
    }

    /// Run a resource query against one peer.
    pub async fn query_resources(&self, addr: &str, query: ResourceQuery) -> Result<ResourceQueryReply> {
        match self.call(addr, &Request::QueryResources(query), QUERY_DEADLINE).await? {
            Response::QueryResources(reply) => Ok(reply),
            other => Err(unexpected("query", &other)),
        }
    }

    /// Exchange peer addresses with one peer.
    pub async fn exchange_peers(&self, addr: &str, exchange: PeerExchange) -> Result<PeerExchangeReply> {
        match self.call(addr, &Request::ExchangePeers(exchange), QUERY_DEADLINE).await? {
            Response::ExchangePeers(reply) => Ok(reply),
            other => Err(unexpected("peer exchange", &other)),
        }
    }

    /// Fetch a peer's own node record.
    pub async fn local_node_info(&self, addr: &str) -> Result<PeerNode> {
        match self.call(addr, &Request::GetLocalNodeInfo, QUERY_DEADLINE).await? {
            Response::LocalNodeInfo(node) => Ok(node),
            other => Err(unexpected("node info", &other)),
        }
    }

    /// First schedule phase against a peer's scheduler address.
    pub async fn propose_schedule(&self, addr: &str, request: ProposeRequest) -> Result<ProposeReply> {
        match self.call(addr, &Request::ProposeSchedule(request), QUERY_DEADLINE).await? {
            Response::Propose(reply) => Ok(reply),
            other => Err(unexpected("propose", &other)),
        }
    }

    /// Second schedule phase against a peer's scheduler address.
    pub async fn commit_schedule(&self, addr: &str, request: CommitRequest) -> Result<DeployReply> {
        match self.call(addr, &Request::CommitSchedule(request), QUERY_DEADLINE).await? {
            Response::Deploy(reply) => Ok(reply),
            other => Err(unexpected("commit", &other)),
        }
    }

    /// Forward a full placement to a peer's scheduler address.
    pub async fn deploy_component(
        &self,
        addr: &str,
        request: DeployComponentRequest,
    ) -> Result<DeployReply> {
        match self.call(addr, &Request::DeployComponent(request), OBJECT_DEADLINE).await? {
            Response::Deploy(reply) => Ok(reply),
            other => Err(unexpected("deploy", &other)),
        }
    }

    /// List a peer's providers.
    pub async fn list_providers(&self, addr: &str, include_resources: bool) -> Result<ProvidersReply> {
        match self.call(addr, &Request::ListProviders { include_resources }, QUERY_DEADLINE).await? {
            Response::Providers(reply) => Ok(reply),
            other => Err(unexpected("providers", &other)),
        }
    }

    /// Undeploy a component on a peer.
    pub async fn undeploy_component(&self, addr: &str, request: UndeployRequest) -> Result<AckReply> {
        match self.call(addr, &Request::UndeployComponent(request), QUERY_DEADLINE).await? {
            Response::Ack(reply) => Ok(reply),
            other => Err(unexpected("undeploy", &other)),
        }
    }

    /// Save an object in a remote store.
    pub async fn save_object(&self, addr: &str, object: EncodedObject) -> Result<ObjectRef> {
        match self.call(addr, &Request::SaveObject(object), OBJECT_DEADLINE).await? {
            Response::ObjectSaved(reference) => Ok(reference),
            Response::Error { message } => Err(FabricError::transport(message)),
            other => Err(unexpected("save object", &other)),
        }
    }

    /// Fetch an object from a remote store.
    pub async fn get_object(&self, addr: &str, reference: ObjectRef) -> Result<EncodedObject> {
        match self.call(addr, &Request::GetObject(reference), OBJECT_DEADLINE).await? {
            Response::Object(object) => Ok(object),
            Response::Error { message } => Err(FabricError::not_found(message)),
            other => Err(unexpected("get object", &other)),
        }
    }
}

fn unexpected(operation: &str, response: &Response) -> FabricError {
    match response {
        Response::Error { message } => FabricError::transport(message.clone()),
        _ => FabricError::internal(format!("unexpected reply to {operation}")),
    }
}
