use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::types::{NodeId, ProposalId, ProposalStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusEvent {
    /// A proposal reached a decision (accepted or rejected) on this node.
    ConsensusAchieved {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },
    /// This node won a Raft election.
    LeaderElected { node_id: NodeId, term: u64 },
    /// A pending proposal was closed without a decision.
    ProposalExpired { proposal_id: ProposalId },
    /// This node moved to a new PBFT view.
    ViewChanged { view: u64, primary: Option<NodeId> },
}

impl ConsensusEvent {
    /// Dotted event name, e.g. `consensus.achieved`.
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusEvent::ConsensusAchieved { .. } => "consensus.achieved",
            ConsensusEvent::LeaderElected { .. } => "leader.elected",
            ConsensusEvent::ProposalExpired { .. } => "proposal.expired",
            ConsensusEvent::ViewChanged { .. } => "view.changed",
        }
    }
}

pub trait ConsensusEventBus: Clone + Send + Sync + 'static {
    /// Type returned to consumers that subscribe to consensus events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, event: ConsensusEvent);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ConsensusEvent>,
}

impl BroadcastEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ConsensusEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<ConsensusEvent>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, event: ConsensusEvent) {
        let _ = self.sender.send(event);
    }
}

/// Adapt a broadcast receiver into a stream.
///
/// Lagged gaps are skipped; the stream ends when the bus is dropped.
pub fn event_stream(
    mut receiver: broadcast::Receiver<ConsensusEvent>,
) -> impl Stream<Item = ConsensusEvent> + Send + 'static {
    stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => yield event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
