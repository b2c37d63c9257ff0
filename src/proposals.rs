use std::collections::HashMap;

use crate::{
    error::ConsensusError,
    types::{ConsensusProposal, ConsensusVote, ProposalId, ProposalStatus},
};

/// Proposals owned by a single node, keyed by id.
///
/// Every algorithm keeps one book inside its node state; the engine only reads through it.
#[derive(Debug, Clone, Default)]
pub struct ProposalBook {
    proposals: HashMap<ProposalId, ConsensusProposal>,
}

impl ProposalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a proposal unless one with the same id already exists.
    /// Returns whether it was inserted.
    pub fn insert(&mut self, proposal: ConsensusProposal) -> bool {
        if self.proposals.contains_key(&proposal.id) {
            return false;
        }
        self.proposals.insert(proposal.id.clone(), proposal);
        true
    }

    pub fn contains(&self, proposal_id: &str) -> bool {
        self.proposals.contains_key(proposal_id)
    }

    pub fn get(&self, proposal_id: &str) -> Option<&ConsensusProposal> {
        self.proposals.get(proposal_id)
    }

    pub fn get_mut(&mut self, proposal_id: &str) -> Option<&mut ConsensusProposal> {
        self.proposals.get_mut(proposal_id)
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn list(&self) -> Vec<ConsensusProposal> {
        self.proposals.values().cloned().collect()
    }

    pub fn active(&self) -> Vec<ConsensusProposal> {
        self.proposals
            .values()
            .filter(|p| p.is_pending())
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsensusProposal> {
        self.proposals.values()
    }

    /// Record a vote (last write per voter wins).
    /// Returns `false` if the proposal is already decided.
    pub fn record_vote(
        &mut self,
        proposal_id: &str,
        vote: ConsensusVote,
    ) -> Result<bool, ConsensusError> {
        let proposal = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ConsensusError::ProposalNotFound(proposal_id.to_string()))?;
        Ok(proposal.record_vote(vote))
    }

    pub fn finalize(&mut self, proposal_id: &str, status: ProposalStatus) -> bool {
        self.proposals
            .get_mut(proposal_id)
            .is_some_and(|p| p.finalize(status))
    }

    /// Count one more protocol round on every pending proposal.
    pub fn tick_rounds(&mut self) {
        for proposal in self.proposals.values_mut().filter(|p| p.is_pending()) {
            proposal.rounds = proposal.rounds.saturating_add(1);
        }
    }

    /// Close a proposal whose consensus timeout elapsed.
    ///
    /// With `require_quorum` the proposal becomes `Expired`. Without it, a proposal that
    /// collected votes is decided by approval rate among the votes cast.
    pub fn expire(
        &mut self,
        proposal_id: &str,
        require_quorum: bool,
        threshold: f64,
    ) -> Option<ConsensusProposal> {
        let proposal = self.proposals.get_mut(proposal_id)?;
        if proposal.is_pending() {
            let voted = proposal.votes.len();
            let status = if require_quorum || voted == 0 {
                ProposalStatus::Expired
            } else if proposal.approvals() as f64 / voted as f64 >= threshold {
                ProposalStatus::Accepted
            } else {
                ProposalStatus::Rejected
            };
            proposal.finalize(status);
        }
        Some(proposal.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn book_with(id: &str) -> ProposalBook {
        let mut book = ProposalBook::new();
        book.insert(ConsensusProposal::new(id.into(), "a", json!(1), 0, 0));
        book
    }

    #[test]
    fn insert_keeps_first_copy() {
        let mut book = book_with("p");
        let mut duplicate = ConsensusProposal::new("p".into(), "b", json!(2), 0, 0);
        duplicate.rounds = 7;
        assert!(!book.insert(duplicate));
        assert_eq!(book.get("p").unwrap().proposer_id, "a");
    }

    #[test]
    fn vote_on_unknown_proposal_fails() {
        let mut book = ProposalBook::new();
        let err = book.record_vote("missing", ConsensusVote::approve("a"));
        assert!(matches!(err, Err(ConsensusError::ProposalNotFound(_))));
    }

    #[test]
    fn expire_with_quorum_required() {
        let mut book = book_with("p");
        book.record_vote("p", ConsensusVote::approve("a")).unwrap();
        let proposal = book.expire("p", true, 0.66).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Expired);
    }

    #[test]
    fn expire_without_quorum_decides_on_cast_votes() {
        let mut book = book_with("p");
        book.record_vote("p", ConsensusVote::approve("a")).unwrap();
        book.record_vote("p", ConsensusVote::approve("b")).unwrap();
        book.record_vote("p", ConsensusVote::reject("c")).unwrap();
        let proposal = book.expire("p", false, 0.66).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Accepted);

        let mut book = book_with("q");
        book.record_vote("q", ConsensusVote::reject("a")).unwrap();
        assert_eq!(
            book.expire("q", false, 0.66).unwrap().status,
            ProposalStatus::Rejected
        );

        let mut book = book_with("r");
        assert_eq!(
            book.expire("r", false, 0.66).unwrap().status,
            ProposalStatus::Expired
        );
    }

    #[test]
    fn tick_rounds_skips_decided() {
        let mut book = book_with("p");
        book.insert(ConsensusProposal::new("q".into(), "a", json!(1), 0, 0));
        book.finalize("q", ProposalStatus::Rejected);
        book.tick_rounds();
        book.tick_rounds();
        assert_eq!(book.get("p").unwrap().rounds, 2);
        assert_eq!(book.get("q").unwrap().rounds, 0);
        assert_eq!(book.active().len(), 1);
    }
}
