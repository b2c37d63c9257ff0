use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::current_timestamp_ms;

/// Stable identifier of a node in the cluster.
pub type NodeId = String;
/// Identifier of a proposal (UUID v4 rendered as a string).
pub type ProposalId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Votes are still being collected.
    Pending,
    /// The algorithm's quorum approved the value.
    Accepted,
    /// Reaching the quorum became impossible.
    Rejected,
    /// No decision was reached before the consensus timeout.
    Expired,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub voter_id: NodeId,
    pub approve: bool,
    /// Voter confidence in `[0, 1]`.
    pub confidence: f64,
    /// Milliseconds since Unix epoch.
    pub timestamp: u64,
}

impl ConsensusVote {
    pub fn new(voter_id: impl Into<NodeId>, approve: bool) -> Self {
        Self {
            voter_id: voter_id.into(),
            approve,
            confidence: 1.0,
            timestamp: current_timestamp_ms().unwrap_or(0),
        }
    }

    pub fn approve(voter_id: impl Into<NodeId>) -> Self {
        Self::new(voter_id, true)
    }

    pub fn reject(voter_id: impl Into<NodeId>) -> Self {
        Self::new(voter_id, false)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub id: ProposalId,
    pub proposer_id: NodeId,
    /// Opaque payload being agreed on.
    pub value: Value,
    /// Algorithm-defined epoch: Raft term, PBFT view, or gossip version.
    pub term: u64,
    /// Creation time in milliseconds since Unix epoch.
    pub timestamp: u64,
    /// Latest vote per voter.
    pub votes: HashMap<NodeId, ConsensusVote>,
    pub status: ProposalStatus,
    /// Protocol rounds observed while pending.
    pub rounds: u32,
    /// When the status left `Pending`.
    pub decided_at: Option<u64>,
}

impl ConsensusProposal {
    pub fn new(
        id: ProposalId,
        proposer_id: impl Into<NodeId>,
        value: Value,
        term: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            proposer_id: proposer_id.into(),
            value,
            term,
            timestamp,
            votes: HashMap::new(),
            status: ProposalStatus::Pending,
            rounds: 0,
            decided_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    pub fn approvals(&self) -> usize {
        self.votes.values().filter(|v| v.approve).count()
    }

    pub fn rejections(&self) -> usize {
        self.votes.values().filter(|v| !v.approve).count()
    }

    /// Record a vote, replacing any earlier vote from the same voter.
    ///
    /// Returns `false` when the proposal is no longer pending; decided proposals are immutable.
    pub fn record_vote(&mut self, vote: ConsensusVote) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.votes.insert(vote.voter_id.clone(), vote);
        true
    }

    /// Move out of `Pending`. A proposal never re-enters `Pending` nor changes a terminal status.
    pub fn finalize(&mut self, status: ProposalStatus) -> bool {
        if !self.is_pending() || status == ProposalStatus::Pending {
            return false;
        }
        self.status = status;
        self.decided_at = Some(current_timestamp_ms().unwrap_or(self.timestamp));
        true
    }
}

/// Read-only summary of a proposal once it is decided or timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub proposal_id: ProposalId,
    pub approved: bool,
    /// approving / total voted
    pub approval_rate: f64,
    /// voted / total voters
    pub participation_rate: f64,
    pub final_value: Option<Value>,
    pub rounds: u32,
    pub duration_ms: u64,
}

impl ConsensusResult {
    pub fn from_proposal(proposal: &ConsensusProposal, total_voters: usize) -> Self {
        let voted = proposal.votes.len();
        let approvals = proposal.approvals();
        let approved = proposal.status == ProposalStatus::Accepted;

        let approval_rate = if voted == 0 {
            0.0
        } else {
            approvals as f64 / voted as f64
        };
        let participation_rate = if total_voters == 0 {
            0.0
        } else {
            (voted as f64 / total_voters as f64).min(1.0)
        };

        let finished_at = proposal
            .decided_at
            .unwrap_or_else(|| current_timestamp_ms().unwrap_or(proposal.timestamp));

        Self {
            proposal_id: proposal.id.clone(),
            approved,
            approval_rate,
            participation_rate,
            final_value: approved.then(|| proposal.value.clone()),
            rounds: proposal.rounds,
            duration_ms: finished_at.saturating_sub(proposal.timestamp),
        }
    }
}

/// Per-node options accepted by `add_node`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeOptions {
    /// Only meaningful for the Byzantine algorithm: pin this node as primary of the current view.
    pub is_primary: bool,
}

impl NodeOptions {
    pub fn primary() -> Self {
        Self { is_primary: true }
    }
}
