use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::time::{Instant, sleep};
use tracing::info;

use crate::{
    error::ConsensusError,
    events::{ConsensusEvent, ConsensusEventBus},
    proposals::ProposalBook,
    transport::WireMessage,
    types::{
        ConsensusProposal, ConsensusResult, ConsensusVote, NodeId, NodeOptions, ProposalStatus,
    },
};

/// How often `await_consensus` re-checks a pending proposal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Operations every consensus algorithm offers to the engine.
///
/// Each implementation owns one node's state and serializes its own mutations; all methods
/// take `&self` and are safe to call while the node's timers are running.
pub trait ConsensusProtocol: Send + Sync + 'static {
    fn node_id(&self) -> &str;

    /// Arm timers (election, heartbeat, gossip rounds). Called once after construction.
    fn start(self: Arc<Self>);

    /// Cancel every timer owned by this node.
    fn shutdown(&self);

    fn add_node(&self, node_id: NodeId, options: NodeOptions) -> Result<(), ConsensusError>;

    /// Returns whether the node was known.
    fn remove_node(&self, node_id: &str) -> bool;

    /// Nodes known besides this one.
    fn peers(&self) -> Vec<NodeId>;

    fn propose(
        &self,
        value: Value,
        proposer_id: Option<NodeId>,
    ) -> Result<ConsensusProposal, ConsensusError>;

    fn vote(&self, proposal_id: &str, vote: ConsensusVote) -> Result<(), ConsensusError>;

    fn handle_message(&self, from: NodeId, message: WireMessage) -> Result<(), ConsensusError>;

    fn proposal(&self, proposal_id: &str) -> Option<ConsensusProposal>;

    fn proposals(&self) -> Vec<ConsensusProposal>;

    fn active_proposals(&self) -> Vec<ConsensusProposal> {
        self.proposals()
            .into_iter()
            .filter(ConsensusProposal::is_pending)
            .collect()
    }

    /// Close a proposal whose consensus timeout elapsed and return its final snapshot.
    fn expire(&self, proposal_id: &str) -> Option<ConsensusProposal>;

    /// Voters a proposal is measured against (peers plus self).
    fn total_voters(&self) -> usize;

    fn is_leader(&self) -> bool;

    fn leader_id(&self) -> Option<NodeId>;
}

/// Wait until `proposal_id` is decided, or close it once `timeout` elapses.
///
/// Polls between checks so the node's own timers keep running.
pub async fn await_consensus(
    protocol: &dyn ConsensusProtocol,
    proposal_id: &str,
    timeout: Duration,
) -> Result<ConsensusResult, ConsensusError> {
    let deadline = Instant::now() + timeout;
    loop {
        let proposal = protocol
            .proposal(proposal_id)
            .ok_or_else(|| ConsensusError::ProposalNotFound(proposal_id.to_string()))?;
        if !proposal.is_pending() {
            return Ok(ConsensusResult::from_proposal(
                &proposal,
                protocol.total_voters(),
            ));
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep(POLL_INTERVAL.min(deadline - now)).await;
    }

    let proposal = protocol
        .expire(proposal_id)
        .ok_or_else(|| ConsensusError::ProposalNotFound(proposal_id.to_string()))?;
    Ok(ConsensusResult::from_proposal(
        &proposal,
        protocol.total_voters(),
    ))
}

pub(crate) fn publish_decision<E: ConsensusEventBus>(event_bus: &E, proposal: &ConsensusProposal) {
    let event = match proposal.status {
        ProposalStatus::Pending => return,
        ProposalStatus::Expired => ConsensusEvent::ProposalExpired {
            proposal_id: proposal.id.clone(),
        },
        status => ConsensusEvent::ConsensusAchieved {
            proposal_id: proposal.id.clone(),
            status,
        },
    };
    event_bus.publish(event);
}

/// Shared timeout handling: close the proposal in `book` and announce the outcome.
pub(crate) fn expire_in_book<E: ConsensusEventBus>(
    node_id: &str,
    book: &mut ProposalBook,
    proposal_id: &str,
    require_quorum: bool,
    threshold: f64,
    event_bus: &E,
) -> Option<ConsensusProposal> {
    let was_pending = book.get(proposal_id)?.is_pending();
    let proposal = book.expire(proposal_id, require_quorum, threshold)?;
    if was_pending {
        info!(
            node_id = %node_id,
            proposal_id = %proposal_id,
            status = ?proposal.status,
            "consensus timeout reached"
        );
        publish_decision(event_bus, &proposal);
    }
    Some(proposal)
}
