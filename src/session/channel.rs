//! Session fabric channels
//!
//! Two channel seams: the shared control stream to the execution
//! back-end and the per-component message-passing socket. Each has a
//! framed-TCP realisation for real deployments and a channel-backed
//! in-memory realisation used by tests and in-process harnesses.
//!
//! A component socket dials the upstream message endpoint and opens
//! with one identity frame carrying the component's instance ID, the
//! way a dealer socket announces itself to a router.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{FabricError, Result};

use super::messages::{BackendCommand, BackendReply, ComponentMessage};

/// The shared control stream to the execution back-end.
///
/// Only the fabric's writer task may call `send`; everyone else
/// enqueues. `recv` returning `Ok(None)` means the stream closed.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Write one command to the stream
    async fn send(&self, command: BackendCommand) -> Result<()>;

    /// Read the next reply; `None` when the stream closed
    async fn recv(&self) -> Result<Option<BackendReply>>;
}

/// A component's message-passing socket.
#[async_trait]
pub trait ComponentChannel: Send + Sync {
    /// Write one message to the component
    async fn send(&self, message: ComponentMessage) -> Result<()>;

    /// Read the next message; `None` when the socket closed
    async fn recv(&self) -> Result<Option<ComponentMessage>>;

    /// Close the socket
    async fn close(&self);
}

/// Dials component sockets; injected so tests can hand out in-memory
/// halves instead of TCP connections.
#[async_trait]
pub trait ComponentConnector: Send + Sync {
    /// Dial `addr`, announcing `identity` in the opening frame.
    async fn connect(&self, addr: &str, identity: &str) -> Result<Arc<dyn ComponentChannel>>;
}

// ---------------------------------------------------------------------------
// Framed TCP realisations
// ---------------------------------------------------------------------------

type FramedWrite = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FramedRead = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

struct FramedHalves {
    write: Mutex<FramedWrite>,
    read: Mutex<FramedRead>,
}

impl FramedHalves {
    async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| FabricError::transport(format!("dial {addr}: {e}")))?;
        let (write, read) = Framed::new(stream, LengthDelimitedCodec::new()).split();
        Ok(Self { write: Mutex::new(write), read: Mutex::new(read) })
    }

    async fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.write
            .lock()
            .await
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| FabricError::transport(format!("stream send: {e}")))
    }

    async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(frame)) => match bincode::deserialize::<T>(&frame) {
                    Ok(value) => return Ok(Some(value)),
                    Err(err) => {
                        // Unknown tags from newer peers are skipped.
                        warn!(%err, "undecodable stream frame ignored");
                        continue;
                    }
                },
                Some(Err(err)) => {
                    return Err(FabricError::transport(format!("stream recv: {err}")));
                }
                None => return Ok(None),
            }
        }
    }
}

/// Control stream over framed TCP
pub struct TcpControlChannel {
    halves: FramedHalves,
}

impl TcpControlChannel {
    /// Dial the back-end control endpoint.
    pub async fn connect(addr: &str) -> Result<Self> {
        Ok(Self { halves: FramedHalves::connect(addr).await? })
    }
}

#[async_trait]
impl ControlChannel for TcpControlChannel {
    async fn send(&self, command: BackendCommand) -> Result<()> {
        self.halves.send(&command).await
    }

    async fn recv(&self) -> Result<Option<BackendReply>> {
        self.halves.recv().await
    }
}

/// Component socket over framed TCP
pub struct TcpComponentChannel {
    halves: FramedHalves,
}

impl TcpComponentChannel {
    /// Dial the upstream message endpoint, announcing `identity`.
    pub async fn connect(addr: &str, identity: &str) -> Result<Self> {
        let halves = FramedHalves::connect(addr).await?;
        halves.send(&identity.to_string()).await?;
        Ok(Self { halves })
    }
}

#[async_trait]
impl ComponentChannel for TcpComponentChannel {
    async fn send(&self, message: ComponentMessage) -> Result<()> {
        self.halves.send(&message).await
    }

    async fn recv(&self) -> Result<Option<ComponentMessage>> {
        self.halves.recv().await
    }

    async fn close(&self) {
        let _ = self.halves.write.lock().await.close().await;
    }
}

/// TCP-dialling connector used by real nodes
pub struct TcpComponentConnector;

#[async_trait]
impl ComponentConnector for TcpComponentConnector {
    async fn connect(&self, addr: &str, identity: &str) -> Result<Arc<dyn ComponentChannel>> {
        Ok(Arc::new(TcpComponentChannel::connect(addr, identity).await?))
    }
}

// ---------------------------------------------------------------------------
// In-memory realisations
// ---------------------------------------------------------------------------

/// One direction-typed half of an in-memory duplex
pub struct MemoryHalf<Out, In> {
    tx: mpsc::UnboundedSender<Out>,
    rx: Mutex<mpsc::UnboundedReceiver<In>>,
}

impl<Out, In> MemoryHalf<Out, In> {
    fn send_inner(&self, value: Out) -> Result<()> {
        self.tx
            .send(value)
            .map_err(|_| FabricError::transport("memory channel closed"))
    }

    async fn recv_inner(&self) -> Option<In> {
        self.rx.lock().await.recv().await
    }
}

/// Fabric side of an in-memory control stream
pub type MemoryControl = MemoryHalf<BackendCommand, BackendReply>;
/// Back-end side of an in-memory control stream
pub type MemoryBackend = MemoryHalf<BackendReply, BackendCommand>;

/// Build a connected control-stream pair: `(fabric side, back-end side)`.
pub fn memory_control_pair() -> (MemoryControl, MemoryBackend) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    (
        MemoryHalf { tx: cmd_tx, rx: Mutex::new(reply_rx) },
        MemoryHalf { tx: reply_tx, rx: Mutex::new(cmd_rx) },
    )
}

#[async_trait]
impl ControlChannel for MemoryControl {
    async fn send(&self, command: BackendCommand) -> Result<()> {
        self.send_inner(command)
    }

    async fn recv(&self) -> Result<Option<BackendReply>> {
        Ok(self.recv_inner().await)
    }
}

impl MemoryBackend {
    /// Act as the back-end: read the next command.
    pub async fn next_command(&self) -> Option<BackendCommand> {
        self.recv_inner().await
    }

    /// Act as the back-end: push a reply toward the fabric.
    pub fn push_reply(&self, reply: BackendReply) -> Result<()> {
        self.send_inner(reply)
    }
}

/// One end of an in-memory component socket
pub type MemoryComponentChannel = MemoryHalf<ComponentMessage, ComponentMessage>;

/// Build a connected component-socket pair: `(session side, component side)`.
pub fn memory_component_pair() -> (MemoryComponentChannel, MemoryComponentChannel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryHalf { tx: a_tx, rx: Mutex::new(b_rx) },
        MemoryHalf { tx: b_tx, rx: Mutex::new(a_rx) },
    )
}

#[async_trait]
impl ComponentChannel for MemoryComponentChannel {
    async fn send(&self, message: ComponentMessage) -> Result<()> {
        self.send_inner(message)
    }

    async fn recv(&self) -> Result<Option<ComponentMessage>> {
        Ok(self.recv_inner().await)
    }

    async fn close(&self) {
        self.rx.lock().await.close();
    }
}

/// Connector handing out pre-built in-memory channels, in order.
#[derive(Default)]
pub struct MemoryComponentConnector {
    prepared: parking_lot::Mutex<Vec<Arc<dyn ComponentChannel>>>,
}

impl MemoryComponentConnector {
    /// Empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a channel for the next `connect` call.
    pub fn prepare(&self, channel: Arc<dyn ComponentChannel>) {
        self.prepared.lock().push(channel);
    }
}

#[async_trait]
impl ComponentConnector for MemoryComponentConnector {
    async fn connect(&self, addr: &str, _identity: &str) -> Result<Arc<dyn ComponentChannel>> {
        let mut prepared = self.prepared.lock();
        if prepared.is_empty() {
            return Err(FabricError::transport(format!("no prepared channel for {addr}")));
        }
        Ok(prepared.remove(0))
    }
}
