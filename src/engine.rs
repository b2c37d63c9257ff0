use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::info;

use crate::{
    algorithm::Algorithm,
    byzantine::ByzantineNode,
    config::ConsensusConfig,
    error::ConsensusError,
    events::{BroadcastEventBus, ConsensusEventBus},
    gossip::GossipNode,
    protocol::{self, ConsensusProtocol},
    raft::RaftNode,
    transport::{Inbox, Transport},
    types::{ConsensusProposal, ConsensusResult, ConsensusVote, NodeId, NodeOptions},
};

struct EngineInner {
    config: ConsensusConfig,
    protocol: Arc<dyn ConsensusProtocol>,
}

/// Uniform proposal/vote façade over one consensus algorithm.
///
/// The algorithm is chosen once, at [`initialize`](Self::initialize); every later call
/// delegates to that implementation without inspecting the tag again.
pub struct ConsensusEngine<E = BroadcastEventBus>
where
    E: ConsensusEventBus,
{
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    event_bus: E,
    inner: RwLock<Option<EngineInner>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

pub type DefaultConsensusEngine = ConsensusEngine<BroadcastEventBus>;

impl DefaultConsensusEngine {
    pub fn new(node_id: impl Into<NodeId>, transport: Arc<dyn Transport>) -> Self {
        Self::new_with_components(node_id, transport, BroadcastEventBus::default())
    }
}

impl<E> ConsensusEngine<E>
where
    E: ConsensusEventBus,
{
    pub fn new_with_components(
        node_id: impl Into<NodeId>,
        transport: Arc<dyn Transport>,
        event_bus: E,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            event_bus,
            inner: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    /// Build the node for `config.algorithm` and arm its timers.
    ///
    /// `paxos` runs the Raft implementation. Must be called from within a Tokio runtime.
    pub fn initialize(&self, config: ConsensusConfig) -> Result<(), ConsensusError> {
        config.validate()?;
        if Handle::try_current().is_err() {
            return Err(ConsensusError::RuntimeUnavailable);
        }

        let mut inner = self.inner.write();
        if inner.is_some() {
            return Err(ConsensusError::AlreadyInitialized);
        }

        let node_id = self.node_id.clone();
        let transport = Arc::clone(&self.transport);
        let event_bus = self.event_bus.clone();
        let protocol: Arc<dyn ConsensusProtocol> = match config.algorithm.implementation() {
            Algorithm::Byzantine => Arc::new(ByzantineNode::new(
                node_id,
                config.clone(),
                transport,
                event_bus,
            )),
            Algorithm::Gossip => Arc::new(GossipNode::new(
                node_id,
                config.clone(),
                transport,
                event_bus,
            )),
            Algorithm::Raft | Algorithm::Paxos => Arc::new(RaftNode::new(
                node_id,
                config.clone(),
                transport,
                event_bus,
            )),
        };
        Arc::clone(&protocol).start();

        info!(
            node_id = %self.node_id,
            algorithm = %config.algorithm,
            "consensus engine initialized"
        );
        *inner = Some(EngineInner { config, protocol });
        Ok(())
    }

    pub fn initialize_with_defaults(&self) -> Result<(), ConsensusError> {
        self.initialize(ConsensusConfig::default())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }

    /// Cancel timers and message listeners. The engine may be initialized again afterwards.
    pub fn shutdown(&self) {
        for handle in self.listeners.lock().drain(..) {
            handle.abort();
        }
        if let Some(inner) = self.inner.write().take() {
            inner.protocol.shutdown();
            info!(node_id = %self.node_id, algorithm = %inner.config.algorithm, "consensus engine shut down");
        }
    }

    /// Feed messages arriving on `inbox` to the running algorithm until shutdown.
    pub fn listen(&self, inbox: Inbox) -> Result<(), ConsensusError> {
        let handle = inbox.drive(self.protocol()?);
        self.listeners.lock().push(handle);
        Ok(())
    }

    /// The running algorithm, for direct access to protocol operations.
    pub fn protocol(&self) -> Result<Arc<dyn ConsensusProtocol>, ConsensusError> {
        self.inner
            .read()
            .as_ref()
            .map(|inner| Arc::clone(&inner.protocol))
            .ok_or(ConsensusError::NotInitialized)
    }

    pub fn config(&self) -> Result<ConsensusConfig, ConsensusError> {
        self.inner
            .read()
            .as_ref()
            .map(|inner| inner.config.clone())
            .ok_or(ConsensusError::NotInitialized)
    }

    /// The configured tag, which may be `paxos` even though Raft runs underneath.
    pub fn get_algorithm(&self) -> Result<Algorithm, ConsensusError> {
        Ok(self.config()?.algorithm)
    }

    pub fn add_node(
        &self,
        node_id: impl Into<NodeId>,
        options: NodeOptions,
    ) -> Result<(), ConsensusError> {
        self.protocol()?.add_node(node_id.into(), options)
    }

    pub fn remove_node(&self, node_id: &str) -> Result<bool, ConsensusError> {
        Ok(self.protocol()?.remove_node(node_id))
    }

    pub fn propose(
        &self,
        value: Value,
        proposer_id: Option<NodeId>,
    ) -> Result<ConsensusProposal, ConsensusError> {
        self.protocol()?.propose(value, proposer_id)
    }

    pub fn vote(&self, proposal_id: &str, vote: ConsensusVote) -> Result<(), ConsensusError> {
        self.protocol()?.vote(proposal_id, vote)
    }

    pub fn get_proposal(
        &self,
        proposal_id: &str,
    ) -> Result<Option<ConsensusProposal>, ConsensusError> {
        Ok(self.protocol()?.proposal(proposal_id))
    }

    pub fn get_active_proposals(&self) -> Result<Vec<ConsensusProposal>, ConsensusError> {
        Ok(self.protocol()?.active_proposals())
    }

    pub(crate) fn all_proposals(&self) -> Result<Vec<ConsensusProposal>, ConsensusError> {
        Ok(self.protocol()?.proposals())
    }

    /// Wait for a decision, closing the proposal once the configured timeout elapses.
    pub async fn await_consensus(
        &self,
        proposal_id: &str,
    ) -> Result<ConsensusResult, ConsensusError> {
        let timeout = self.config()?.timeout();
        self.await_consensus_with_timeout(proposal_id, timeout)
            .await
    }

    pub async fn await_consensus_with_timeout(
        &self,
        proposal_id: &str,
        timeout: Duration,
    ) -> Result<ConsensusResult, ConsensusError> {
        let protocol = self.protocol()?;
        protocol::await_consensus(protocol.as_ref(), proposal_id, timeout).await
    }

    pub fn is_leader(&self) -> Result<bool, ConsensusError> {
        Ok(self.protocol()?.is_leader())
    }

    pub fn get_leader_id(&self) -> Result<Option<NodeId>, ConsensusError> {
        Ok(self.protocol()?.leader_id())
    }
}

impl<E> Drop for ConsensusEngine<E>
where
    E: ConsensusEventBus,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}
