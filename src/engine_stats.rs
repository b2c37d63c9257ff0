use crate::{
    algorithm::Algorithm, engine::ConsensusEngine, error::ConsensusError,
    events::ConsensusEventBus, types::ProposalStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStats {
    pub algorithm: Algorithm,
    /// Every proposal this node knows about.
    pub total_proposals: usize,
    /// How many proposals are still collecting votes.
    pub pending_proposals: usize,
    pub accepted_proposals: usize,
    pub rejected_proposals: usize,
    /// How many proposals timed out (or were dropped by a view change) without a decision.
    pub expired_proposals: usize,
}

impl<E> ConsensusEngine<E>
where
    E: ConsensusEventBus,
{
    /// Count proposals by status.
    ///
    /// Computed from the proposal registry on every call, so the numbers always match
    /// what [`get_proposal`](Self::get_proposal) reports.
    pub fn get_stats(&self) -> Result<ConsensusStats, ConsensusError> {
        let algorithm = self.get_algorithm()?;
        let proposals = self.all_proposals()?;
        let count = |status: ProposalStatus| {
            proposals
                .iter()
                .filter(|proposal| proposal.status == status)
                .count()
        };

        Ok(ConsensusStats {
            algorithm,
            total_proposals: proposals.len(),
            pending_proposals: count(ProposalStatus::Pending),
            accepted_proposals: count(ProposalStatus::Accepted),
            rejected_proposals: count(ProposalStatus::Rejected),
            expired_proposals: count(ProposalStatus::Expired),
        })
    }
}
