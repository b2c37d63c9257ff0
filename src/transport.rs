//! Message delivery between nodes.
//!
//! The consensus core only needs [`Transport`]: point-to-point send plus broadcast over a
//! peer list. Delivery may duplicate or reorder messages; every protocol tolerates both.
//! [`InMemoryNetwork`] routes JSON-encoded envelopes between nodes of one process.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    byzantine::PbftMessage, error::ConsensusError, gossip::GossipMessage,
    protocol::ConsensusProtocol, raft::RaftMessage, types::NodeId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "body", rename_all = "lowercase")]
pub enum WireMessage {
    Raft(RaftMessage),
    Byzantine(PbftMessage),
    Gossip(GossipMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: WireMessage,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to_peer(&self, to: &str, message: WireMessage) -> Result<(), ConsensusError>;

    async fn broadcast(
        &self,
        peers: &[NodeId],
        message: WireMessage,
    ) -> Vec<(NodeId, Result<(), ConsensusError>)> {
        let sends = peers.iter().map(|peer| {
            let message = message.clone();
            async move { (peer.clone(), self.send_to_peer(peer, message).await) }
        });
        join_all(sends).await
    }
}

/// Fire-and-forget sending on behalf of one node.
///
/// Sends run on their own tasks so a slow peer never stalls the caller's timers.
/// Failures are logged and dropped; quorum math absorbs lost messages.
#[derive(Clone)]
pub struct Outbox {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
}

impl Outbox {
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>) -> Self {
        Self { node_id, transport }
    }

    pub fn send(&self, to: NodeId, message: WireMessage) {
        let transport = Arc::clone(&self.transport);
        let from = self.node_id.clone();
        spawn_detached(async move {
            if let Err(err) = transport.send_to_peer(&to, message).await {
                debug!(node_id = %from, peer = %to, error = %err, "send failed");
            }
        });
    }

    pub fn broadcast(&self, peers: Vec<NodeId>, message: WireMessage) {
        if peers.is_empty() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let from = self.node_id.clone();
        spawn_detached(async move {
            for (peer, result) in transport.broadcast(&peers, message).await {
                if let Err(err) = result {
                    debug!(node_id = %from, peer = %peer, error = %err, "broadcast send failed");
                }
            }
        });
    }
}

fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("no tokio runtime available, dropping outgoing message"),
    }
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: HashSet<NodeId>,
}

/// In-process message router for simulated clusters.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` and return its transport handle and inbox.
    ///
    /// Joining again with the same id replaces the previous inbox.
    pub fn join(&self, node_id: impl Into<NodeId>) -> (Arc<InMemoryTransport>, Inbox) {
        let node_id = node_id.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.write().inboxes.insert(node_id.clone(), sender);

        let transport = Arc::new(InMemoryTransport {
            node_id: node_id.clone(),
            network: self.clone(),
        });
        (transport, Inbox { node_id, receiver })
    }

    pub fn leave(&self, node_id: &str) {
        let mut state = self.state.write();
        state.inboxes.remove(node_id);
        state.isolated.remove(node_id);
    }

    /// Cut `node_id` off: nothing it sends or is sent gets delivered until [`heal`](Self::heal).
    pub fn isolate(&self, node_id: &str) {
        self.state.write().isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.state.write().isolated.remove(node_id);
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.state.read().inboxes.keys().cloned().collect()
    }

    fn deliver(&self, from: &str, to: &str, message: WireMessage) -> Result<(), ConsensusError> {
        let state = self.state.read();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return Err(ConsensusError::PeerUnreachable(to.to_string()));
        }
        let inbox = state
            .inboxes
            .get(to)
            .ok_or_else(|| ConsensusError::PeerUnreachable(to.to_string()))?;

        let bytes = serde_json::to_vec(&Envelope {
            from: from.to_string(),
            message,
        })?;
        inbox
            .send(bytes)
            .map_err(|_| ConsensusError::PeerUnreachable(to.to_string()))
    }
}

pub struct InMemoryTransport {
    node_id: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_to_peer(&self, to: &str, message: WireMessage) -> Result<(), ConsensusError> {
        self.network.deliver(&self.node_id, to, message)
    }
}

/// Receiving side of an [`InMemoryNetwork`] registration.
pub struct Inbox {
    node_id: NodeId,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Next decodable envelope, or `None` once the network dropped this inbox.
    pub async fn recv(&mut self) -> Option<Envelope> {
        while let Some(bytes) = self.receiver.recv().await {
            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => return Some(envelope),
                Err(err) => warn!(node_id = %self.node_id, error = %err, "dropping malformed envelope"),
            }
        }
        None
    }

    /// Feed every incoming message to `protocol` on a dedicated task.
    pub fn drive(mut self, protocol: Arc<dyn ConsensusProtocol>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                if let Err(err) = protocol.handle_message(envelope.from, envelope.message) {
                    debug!(node_id = %self.node_id, error = %err, "message handling failed");
                }
            }
        })
    }
}
