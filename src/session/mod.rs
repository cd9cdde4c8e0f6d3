//! Component session fabric
//!
//! One control stream to the execution back-end is shared by every
//! component on it. All outbound commands funnel through a single
//! unbounded queue drained by one writer task, because the back-end
//! control plane requires strictly serialised writes; one reader task
//! drains the stream and routes replies back to sessions. Each
//! component additionally owns a message-passing socket handled by its
//! own receive loop.

pub mod channel;
pub mod messages;
pub mod session;
pub mod transcode;

pub use channel::{
    memory_component_pair, memory_control_pair, ComponentChannel, ComponentConnector,
    ControlChannel, MemoryComponentConnector, TcpComponentConnector, TcpControlChannel,
};
pub use messages::{ArgValue, BackendCommand, BackendReply, ComponentMessage, ReturnValue, RuntimeId};
pub use session::{ComponentSession, SessionState};
pub use transcode::{ProcessTranscoder, Transcoder};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{EncodedObject, Language, ObjectRef, ObjectStore};

/// The shared fabric multiplexing every component session over one
/// back-end control stream.
pub struct SessionFabric {
    local_store: Arc<dyn ObjectStore>,
    upstream_store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    connector: Arc<dyn ComponentConnector>,
    sessions: RwLock<HashMap<String, Arc<ComponentSession>>>,
    /// `sessionID::instanceID` → component, written after each Invoke
    /// is enqueued and before its reply can possibly be routed
    routing: DashMap<String, String>,
    /// object → component that asked for its bytes
    object_routing: DashMap<String, String>,
    /// Process-wide object cache: object → back-end store holding it;
    /// `None` until a reply reveals the store
    backend_objects: DashMap<String, Option<String>>,
    send_tx: mpsc::UnboundedSender<Vec<BackendCommand>>,
    local_store_id: String,
    shutdown_tx: watch::Sender<bool>,
    me: Weak<SessionFabric>,
}

impl SessionFabric {
    /// Start the fabric over a back-end control channel, spawning the
    /// writer and reader tasks.
    pub fn start(
        control: Arc<dyn ControlChannel>,
        local_store: Arc<dyn ObjectStore>,
        upstream_store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn Transcoder>,
        connector: Arc<dyn ComponentConnector>,
    ) -> Arc<Self> {
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Vec<BackendCommand>>();
        let (shutdown_tx, _) = watch::channel(false);
        let local_store_id = local_store.store_id().to_string();

        let fabric = Arc::new_cyclic(|me| Self {
            local_store,
            upstream_store,
            transcoder,
            connector,
            sessions: RwLock::new(HashMap::new()),
            routing: DashMap::new(),
            object_routing: DashMap::new(),
            backend_objects: DashMap::new(),
            send_tx,
            local_store_id,
            shutdown_tx,
            me: me.clone(),
        });

        // Writer: the only caller of Send on the shared stream. Drains
        // batches in FIFO order; a batch's commands stay contiguous.
        {
            let control = control.clone();
            let mut shutdown = fabric.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        batch = send_rx.recv() => {
                            let Some(batch) = batch else { break };
                            for command in batch {
                                if let Err(err) = control.send(command).await {
                                    warn!(%err, "control stream send failed");
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("fabric writer stopped");
            });
        }

        // Reader: drains the shared stream and routes each reply.
        {
            let fabric = fabric.clone();
            let mut shutdown = fabric.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        reply = control.recv() => {
                            match reply {
                                Ok(Some(reply)) => fabric.route_reply(reply).await,
                                Ok(None) => {
                                    debug!("control stream closed");
                                    break;
                                }
                                Err(err) => {
                                    warn!(%err, "control stream recv failed");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("fabric reader stopped");
            });
        }

        fabric
    }

    /// Store instance components should be told about
    pub fn local_store_id(&self) -> &str {
        &self.local_store_id
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Session of a component, when one exists
    pub fn session(&self, component_id: &str) -> Option<Arc<ComponentSession>> {
        self.sessions.read().get(component_id).cloned()
    }

    fn enqueue(&self, batch: Vec<BackendCommand>) {
        if self.send_tx.send(batch).is_err() {
            warn!("fabric send queue closed; commands dropped");
        }
    }

    /// Open a session for a freshly deployed component: dial its
    /// message socket at `messaging_addr` with the instance identity,
    /// announce readiness to the back-end, and start the socket loop.
    pub async fn open_session(
        &self,
        component_id: &str,
        instance_id: &str,
        messaging_addr: &str,
    ) -> Result<Arc<ComponentSession>> {
        let channel = self.connector.connect(messaging_addr, instance_id).await?;
        let session_id = Uuid::new_v4().simple().to_string();
        let session = Arc::new(ComponentSession::new(component_id, instance_id, session_id, channel));
        self.sessions.write().insert(component_id.to_string(), session.clone());

        // Ready fires once on stream creation.
        self.enqueue(vec![BackendCommand::Ready { instance_id: instance_id.to_string() }]);
        info!(component = component_id, instance = instance_id, "session opened");

        let fabric = self
            .me
            .upgrade()
            .ok_or_else(|| crate::error::FabricError::internal("session fabric stopped"))?;
        let loop_session = session.clone();
        tokio::spawn(async move {
            let mut cancelled = loop_session.cancelled();
            let mut shutdown = fabric.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    message = loop_session.channel().recv() => {
                        match message {
                            Ok(Some(message)) => {
                                fabric.handle_component_message(&loop_session, message).await;
                            }
                            Ok(None) => {
                                debug!(component = %loop_session.component_id, "component socket closed");
                                break;
                            }
                            Err(err) => {
                                warn!(component = %loop_session.component_id, %err, "component socket failed");
                                break;
                            }
                        }
                    }
                    _ = cancelled.changed() => {
                        if *cancelled.borrow() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(session)
    }

    async fn handle_component_message(
        &self,
        session: &Arc<ComponentSession>,
        message: ComponentMessage,
    ) {
        match message {
            ComponentMessage::Ready => {
                // The socket's own ready, forwarded once per connect.
                self.enqueue(vec![BackendCommand::Ready {
                    instance_id: session.instance_id.clone(),
                }]);
            }
            ComponentMessage::Function { name, language, payload } => {
                if session.mark_function_sent() {
                    session.set_language(language);
                    self.enqueue(vec![BackendCommand::AppendFunction {
                        session_id: session.session_id.clone(),
                        instance_id: session.instance_id.clone(),
                        name,
                        language,
                        payload,
                    }]);
                } else {
                    debug!(component = %session.component_id, "duplicate function suppressed");
                }
            }
            ComponentMessage::InvokeRequest { runtime_id, args } => {
                if let Err(err) = self.convert_invoke(session, &runtime_id, args).await {
                    warn!(component = %session.component_id, %err, "invoke conversion failed");
                    let reply = ComponentMessage::InvokeResponse {
                        runtime_id,
                        error: Some(err.to_string()),
                        value: None,
                    };
                    if let Err(err) = session.channel().send(reply).await {
                        warn!(component = %session.component_id, %err, "invoke error reply failed");
                    }
                }
            }
            ComponentMessage::InvokeResponse { runtime_id, .. } => {
                debug!(component = %session.component_id, %runtime_id, "unexpected inbound invoke response ignored");
            }
        }
    }

    /// Expand an invoke into `AppendArg… Invoke`, enqueued as one
    /// contiguous batch, then register the reply route.
    async fn convert_invoke(
        &self,
        session: &Arc<ComponentSession>,
        runtime_id: &str,
        args: Vec<ObjectRef>,
    ) -> Result<()> {
        let rid = RuntimeId::parse(runtime_id)?;
        let mut batch = Vec::with_capacity(args.len() + 1);

        for arg in args {
            let known = self.backend_objects.get(&arg.id).map(|entry| entry.value().clone());
            match known {
                Some(source) => {
                    batch.push(BackendCommand::AppendArg {
                        session_id: rid.session_id.clone(),
                        instance_id: rid.instance_id.clone(),
                        value: ArgValue::Ref { id: arg.id, source: source.unwrap_or_default() },
                    });
                }
                None => {
                    let object = self.upstream_store.get_object(&arg).await?;
                    let object = match session.language() {
                        Some(language) if language != object.language => {
                            self.transcoder.transcode(&object, Language::Json).await?
                        }
                        _ => object,
                    };
                    // The back-end now holds the bytes; the exact store
                    // is patched in when a reply names it.
                    self.backend_objects.insert(arg.id.clone(), None);
                    batch.push(BackendCommand::AppendArg {
                        session_id: rid.session_id.clone(),
                        instance_id: rid.instance_id.clone(),
                        value: ArgValue::Encoded(object),
                    });
                }
            }
        }

        batch.push(BackendCommand::Invoke {
            session_id: rid.session_id.clone(),
            instance_id: rid.instance_id.clone(),
            name: rid.name.clone(),
        });
        self.enqueue(batch);
        self.routing.insert(rid.routing_key(), session.component_id.clone());
        session.mark_running();
        Ok(())
    }

    async fn route_reply(&self, reply: BackendReply) {
        match reply {
            BackendReply::ReturnResult { ref session_id, ref instance_id, .. } => {
                let key = format!("{session_id}::{instance_id}");
                let target = self.routing.get(&key).map(|entry| entry.value().clone());
                match target.and_then(|cid| self.session(&cid)) {
                    Some(session) => self.deliver_return(&session, reply).await,
                    None => {
                        warn!(%key, "no routing entry for result; broadcasting to all sessions");
                        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
                        for session in sessions {
                            self.deliver_return(&session, reply.clone()).await;
                        }
                    }
                }
            }
            BackendReply::ResponseObject { object, store_id } => {
                self.backend_objects.insert(object.id.clone(), Some(store_id));
                let target = self
                    .object_routing
                    .remove(&object.id)
                    .and_then(|(_, component_id)| self.session(&component_id));
                match target {
                    Some(session) => self.deliver_response_object(&session, object).await,
                    None => {
                        // No requester recorded (restart, late reply):
                        // broadcast so the original requester still
                        // sees the bytes land. Saves are deduplicated.
                        warn!(object = %object.id, "no requester recorded for response object; broadcasting to all sessions");
                        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
                        if sessions.is_empty() {
                            self.persist_local(object).await;
                        } else {
                            for session in sessions {
                                self.deliver_response_object(&session, object.clone()).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Hand a fetched object to one session: the session's side of the
    /// contract is persisting the bytes into the local store, where
    /// the component's earlier `ObjectRef` points.
    async fn deliver_response_object(&self, session: &Arc<ComponentSession>, object: EncodedObject) {
        debug!(component = %session.component_id, object = %object.id, "response object delivered");
        self.persist_local(object).await;
    }

    async fn deliver_return(&self, session: &Arc<ComponentSession>, reply: BackendReply) {
        let BackendReply::ReturnResult { session_id, instance_id, name, error, value } = reply else {
            return;
        };
        let runtime_id = format!("{name}::{session_id}::{instance_id}");

        let response = if let Some(error) = error {
            ComponentMessage::InvokeResponse { runtime_id, error: Some(error), value: None }
        } else {
            match value {
                Some(ReturnValue::Ref { id, store_id }) => {
                    // The reply names the back-end store: patch the
                    // object cache, then fetch the bytes for the local
                    // store in the background.
                    self.backend_objects.insert(id.clone(), Some(store_id));
                    self.object_routing.insert(id.clone(), session.component_id.clone());
                    self.enqueue(vec![BackendCommand::RequestObject { id: id.clone() }]);
                    ComponentMessage::InvokeResponse {
                        runtime_id,
                        error: None,
                        value: Some(ObjectRef { id, source: self.local_store_id.clone() }),
                    }
                }
                Some(ReturnValue::Encoded(object)) => {
                    let reference =
                        ObjectRef { id: object.id.clone(), source: self.local_store_id.clone() };
                    if let Some(fabric) = self.me.upgrade() {
                        tokio::spawn(async move {
                            fabric.persist_local(object).await;
                        });
                    }
                    ComponentMessage::InvokeResponse {
                        runtime_id,
                        error: None,
                        value: Some(reference),
                    }
                }
                None => ComponentMessage::InvokeResponse { runtime_id, error: None, value: None },
            }
        };

        if let Err(err) = session.channel().send(response).await {
            warn!(component = %session.component_id, %err, "result delivery failed");
        }
    }

    /// Save into the local store, deduplicating by a get first; a
    /// duplicate save is benign either way.
    async fn persist_local(&self, object: EncodedObject) {
        let reference = ObjectRef { id: object.id.clone(), source: self.local_store_id.clone() };
        if self.local_store.get_object(&reference).await.is_ok() {
            return;
        }
        if let Err(err) = self.local_store.save_object(object).await {
            debug!(object = %reference.id, %err, "local persist skipped");
        }
    }

    /// Stop one component's session: cancel its loop, close its
    /// socket, drop its routing entries. Idempotent.
    pub async fn stop_session(&self, component_id: &str) -> bool {
        let session = self.sessions.write().remove(component_id);
        let Some(session) = session else {
            return false;
        };
        session.begin_close();
        session.channel().close().await;
        self.routing.retain(|_, cid| cid != component_id);
        self.object_routing.retain(|_, cid| cid != component_id);
        session.finish_close();
        info!(component = component_id, "session closed");
        true
    }

    /// Stop the writer and reader tasks and every session loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
