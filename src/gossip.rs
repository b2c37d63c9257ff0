//! Epidemic dissemination with anti-entropy repair.
//!
//! There is no leader. Any node proposes, every node that learns a proposal votes on it,
//! and proposals and votes spread to `fanout` random neighbors per round until they
//! exceed `max_hops`. A node considers a proposal converged once the share of known nodes
//! approving it reaches `convergence_threshold`. Agreement is eventual: two nodes may
//! decide at different times.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info};

use crate::{
    config::ConsensusConfig,
    error::ConsensusError,
    events::{BroadcastEventBus, ConsensusEventBus},
    proposals::ProposalBook,
    protocol::{ConsensusProtocol, expire_in_book, publish_decision},
    transport::{Outbox, Transport, WireMessage},
    types::{ConsensusProposal, ConsensusVote, NodeId, NodeOptions, ProposalId, ProposalStatus},
    utils::{
        TallyOutcome, calculate_convergence_votes, current_timestamp_ms, evaluate_tally,
        generate_id,
    },
};

/// One replicated key. Higher `version` wins; ties go to the larger origin id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
    pub origin: NodeId,
}

impl VersionedValue {
    fn supersedes(&self, other: &VersionedValue) -> bool {
        (self.version, &self.origin) > (other.version, &other.origin)
    }
}

/// Full state exchanged during anti-entropy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GossipSnapshot {
    pub version: u64,
    pub state: HashMap<String, VersionedValue>,
    pub proposals: Vec<ConsensusProposal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipPayload {
    Proposal {
        proposal: ConsensusProposal,
    },
    Vote {
        proposal_id: ProposalId,
        vote: ConsensusVote,
    },
    State {
        key: String,
        entry: VersionedValue,
    },
    AntiEntropy {
        snapshot: GossipSnapshot,
        /// Set on the answer so the exchange stops after one round trip.
        reply: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Dedup key. A proposal message reuses the proposal id.
    pub id: String,
    pub origin: NodeId,
    pub hops: u32,
    /// Nodes the message already passed through.
    pub path: Vec<NodeId>,
    pub payload: GossipPayload,
}

struct GossipState {
    version: u64,
    entries: HashMap<String, VersionedValue>,
    seen_messages: HashSet<String>,
    last_sync: Option<u64>,
    proposals: ProposalBook,
    /// Messages waiting for the next gossip round.
    outgoing: Vec<GossipMessage>,
    /// Votes for proposals this node has not seen yet.
    orphan_votes: HashMap<ProposalId, Vec<ConsensusVote>>,
    /// Rounds each own proposal has been re-pushed.
    push_rounds: HashMap<ProposalId, u32>,
}

/// Stamp a locally cast `vote` after any stored vote from the same voter, so the latest
/// `vote()` call replaces it here and wins the timestamp merge on every neighbor.
fn supersede_stored_vote(proposal: &ConsensusProposal, mut vote: ConsensusVote) -> ConsensusVote {
    if let Some(existing) = proposal.votes.get(&vote.voter_id)
        && existing.timestamp >= vote.timestamp
        && *existing != vote
    {
        vote.timestamp = existing.timestamp + 1;
    }
    vote
}

/// Apply `vote` unless a newer vote from the same voter is already recorded.
fn merge_vote(proposal: &mut ConsensusProposal, vote: ConsensusVote) -> bool {
    if proposal
        .votes
        .get(&vote.voter_id)
        .is_some_and(|existing| existing.timestamp > vote.timestamp || *existing == vote)
    {
        return false;
    }
    proposal.record_vote(vote)
}

pub struct GossipNode<E = BroadcastEventBus>
where
    E: ConsensusEventBus,
{
    node_id: NodeId,
    config: ConsensusConfig,
    neighbors: RwLock<BTreeSet<NodeId>>,
    state: Mutex<GossipState>,
    outbox: Outbox,
    event_bus: E,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E> GossipNode<E>
where
    E: ConsensusEventBus,
{
    pub fn new(
        node_id: impl Into<NodeId>,
        config: ConsensusConfig,
        transport: Arc<dyn Transport>,
        event_bus: E,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            outbox: Outbox::new(node_id.clone(), transport),
            node_id,
            config,
            neighbors: RwLock::new(BTreeSet::new()),
            state: Mutex::new(GossipState {
                version: 0,
                entries: HashMap::new(),
                seen_messages: HashSet::new(),
                last_sync: None,
                proposals: ProposalBook::new(),
                outgoing: Vec::new(),
                orphan_votes: HashMap::new(),
                push_rounds: HashMap::new(),
            }),
            event_bus,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    pub fn has_seen(&self, message_id: &str) -> bool {
        self.state.lock().seen_messages.contains(message_id)
    }

    pub fn seen_count(&self) -> usize {
        self.state.lock().seen_messages.len()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Milliseconds timestamp of the last completed anti-entropy exchange.
    pub fn last_sync(&self) -> Option<u64> {
        self.state.lock().last_sync
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Write `key` locally and queue it for dissemination.
    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        let mut state = self.state.lock();
        let message = self.write_entry(&mut state, key.into(), value);
        state.outgoing.push(message);
    }

    fn write_entry(&self, state: &mut GossipState, key: String, value: Value) -> GossipMessage {
        state.version += 1;
        let entry = VersionedValue {
            value,
            version: state.version,
            origin: self.node_id.clone(),
        };
        state.entries.insert(key.clone(), entry.clone());
        self.new_message(state, generate_id(), GossipPayload::State { key, entry })
    }

    fn new_message(
        &self,
        state: &mut GossipState,
        id: String,
        payload: GossipPayload,
    ) -> GossipMessage {
        state.seen_messages.insert(id.clone());
        GossipMessage {
            id,
            origin: self.node_id.clone(),
            hops: 0,
            path: vec![self.node_id.clone()],
            payload,
        }
    }

    fn neighbor_list(&self) -> Vec<NodeId> {
        self.neighbors.read().iter().cloned().collect()
    }

    fn known_nodes(&self) -> usize {
        self.neighbors.read().len() + 1
    }

    async fn run(self: Arc<Self>) {
        let mut gossip = interval(self.config.gossip.gossip_interval());
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut anti_entropy = interval(self.config.gossip.anti_entropy_interval());
        anti_entropy.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = gossip.tick() => self.gossip_round(),
                _ = anti_entropy.tick() => self.anti_entropy(),
            }
        }
    }

    /// Send queued messages to `fanout` random neighbors and re-push own pending proposals.
    /// Queued messages stay queued while the node has no neighbors.
    pub fn gossip_round(&self) {
        let neighbors = self.neighbor_list();
        if neighbors.is_empty() {
            return;
        }
        let batch = {
            let mut state = self.state.lock();
            state.proposals.tick_rounds();

            let mut batch = std::mem::take(&mut state.outgoing);
            let max_rounds = self.config.max_rounds;
            let repush: Vec<ConsensusProposal> = state
                .proposals
                .iter()
                .filter(|proposal| proposal.is_pending() && proposal.proposer_id == self.node_id)
                .filter(|proposal| {
                    state
                        .push_rounds
                        .get(&proposal.id)
                        .is_some_and(|rounds| *rounds < max_rounds)
                })
                .cloned()
                .collect();
            for proposal in repush {
                *state.push_rounds.entry(proposal.id.clone()).or_default() += 1;
                batch.push(GossipMessage {
                    id: proposal.id.clone(),
                    origin: self.node_id.clone(),
                    hops: 0,
                    path: vec![self.node_id.clone()],
                    payload: GossipPayload::Proposal { proposal },
                });
            }
            batch
        };

        if batch.is_empty() {
            return;
        }
        debug!(node_id = %self.node_id, messages = batch.len(), "gossip round");

        let mut rng = rand::thread_rng();
        for message in batch {
            let mut targets: Vec<&NodeId> = neighbors
                .iter()
                .filter(|neighbor| !message.path.contains(neighbor))
                .collect();
            targets.shuffle(&mut rng);
            targets.truncate(self.config.gossip.fanout);
            for target in targets {
                self.send_to_neighbor(target, message.clone());
            }
        }
    }

    fn send_to_neighbor(&self, neighbor: &str, message: GossipMessage) {
        self.outbox
            .send(neighbor.to_string(), WireMessage::Gossip(message));
    }

    /// Reconcile full state with one random neighbor.
    pub fn anti_entropy(&self) {
        let neighbors = self.neighbor_list();
        let Some(peer) = neighbors.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        self.anti_entropy_with(&peer);
    }

    pub fn anti_entropy_with(&self, peer: &str) {
        let message = {
            let mut state = self.state.lock();
            let snapshot = Self::snapshot(&state);
            self.new_message(
                &mut state,
                generate_id(),
                GossipPayload::AntiEntropy {
                    snapshot,
                    reply: false,
                },
            )
        };
        debug!(node_id = %self.node_id, peer = %peer, "anti-entropy push");
        self.send_to_neighbor(peer, message);
    }

    fn snapshot(state: &GossipState) -> GossipSnapshot {
        GossipSnapshot {
            version: state.version,
            state: state.entries.clone(),
            proposals: state.proposals.list(),
        }
    }

    fn receive(&self, from: &str, message: GossipMessage) {
        let known = self.known_nodes();
        let mut state = self.state.lock();

        if message.hops > self.config.gossip.max_hops {
            debug!(node_id = %self.node_id, message_id = %message.id, hops = message.hops, "dropping message past max hops");
            return;
        }
        if !state.seen_messages.insert(message.id.clone()) {
            debug!(node_id = %self.node_id, message_id = %message.id, "duplicate message");
            return;
        }

        let forward = !matches!(message.payload, GossipPayload::AntiEntropy { .. })
            && message.hops < self.config.gossip.max_hops;
        if forward {
            let mut forwarded = message.clone();
            forwarded.hops += 1;
            forwarded.path.push(self.node_id.clone());
            state.outgoing.push(forwarded);
        }

        match message.payload {
            GossipPayload::Proposal { proposal } => {
                self.learn_proposal(&mut state, proposal, known);
            }
            GossipPayload::Vote { proposal_id, vote } => {
                self.learn_vote(&mut state, &proposal_id, vote, known);
            }
            GossipPayload::State { key, entry } => {
                Self::merge_entry(&mut state, key, entry);
            }
            GossipPayload::AntiEntropy { snapshot, reply } => {
                self.merge_snapshot(&mut state, snapshot, known);
                state.last_sync = current_timestamp_ms().ok();
                if !reply {
                    let snapshot = Self::snapshot(&state);
                    let answer = self.new_message(
                        &mut state,
                        generate_id(),
                        GossipPayload::AntiEntropy {
                            snapshot,
                            reply: true,
                        },
                    );
                    drop(state);
                    self.send_to_neighbor(from, answer);
                }
            }
        }
    }

    fn learn_proposal(&self, state: &mut GossipState, proposal: ConsensusProposal, known: usize) {
        let proposal_id = proposal.id.clone();
        state.seen_messages.insert(proposal_id.clone());

        if state.proposals.contains(&proposal_id) {
            if let Some(local) = state.proposals.get_mut(&proposal_id) {
                for vote in proposal.votes.into_values() {
                    merge_vote(local, vote);
                }
            }
        } else {
            let mut local = proposal;
            local.status = ProposalStatus::Pending;
            local.decided_at = None;
            local.rounds = 0;
            if let Some(orphans) = state.orphan_votes.remove(&proposal_id) {
                for vote in orphans {
                    merge_vote(&mut local, vote);
                }
            }
            state.version = state.version.max(local.term);
            debug!(node_id = %self.node_id, proposal_id = %proposal_id, "learned proposal");
            state.proposals.insert(local);
        }

        let already_voted = state
            .proposals
            .get(&proposal_id)
            .is_some_and(|proposal| proposal.votes.contains_key(&self.node_id));
        if self.config.gossip.auto_vote && !already_voted {
            self.cast_vote(state, &proposal_id, ConsensusVote::approve(self.node_id.clone()));
        }
        self.check_convergence(state, &proposal_id, known);
    }

    fn learn_vote(
        &self,
        state: &mut GossipState,
        proposal_id: &str,
        vote: ConsensusVote,
        known: usize,
    ) {
        match state.proposals.get_mut(proposal_id) {
            Some(proposal) => {
                merge_vote(proposal, vote);
                self.check_convergence(state, proposal_id, known);
            }
            None => {
                debug!(node_id = %self.node_id, proposal_id = %proposal_id, "buffering vote for unknown proposal");
                state
                    .orphan_votes
                    .entry(proposal_id.to_string())
                    .or_default()
                    .push(vote);
            }
        }
    }

    /// Record `vote` locally and queue it for dissemination.
    fn cast_vote(&self, state: &mut GossipState, proposal_id: &str, vote: ConsensusVote) {
        let Some(proposal) = state.proposals.get_mut(proposal_id) else {
            return;
        };
        if !merge_vote(proposal, vote.clone()) {
            return;
        }
        let message = self.new_message(
            state,
            generate_id(),
            GossipPayload::Vote {
                proposal_id: proposal_id.to_string(),
                vote,
            },
        );
        state.outgoing.push(message);
    }

    fn merge_entry(state: &mut GossipState, key: String, entry: VersionedValue) {
        state.version = state.version.max(entry.version);
        let newer = state
            .entries
            .get(&key)
            .is_none_or(|existing| entry.supersedes(existing));
        if newer {
            state.entries.insert(key, entry);
        }
    }

    fn merge_snapshot(&self, state: &mut GossipState, snapshot: GossipSnapshot, known: usize) {
        state.version = state.version.max(snapshot.version);
        for (key, entry) in snapshot.state {
            Self::merge_entry(state, key, entry);
        }
        for proposal in snapshot.proposals {
            self.learn_proposal(state, proposal, known);
        }
    }

    /// Decide `proposal_id` once enough known nodes approve, or once that became impossible.
    fn check_convergence(&self, state: &mut GossipState, proposal_id: &str, known: usize) {
        let Some(proposal) = state.proposals.get_mut(proposal_id) else {
            return;
        };
        if !proposal.is_pending() {
            return;
        }

        let required = calculate_convergence_votes(known, self.config.gossip.convergence_threshold);
        let approvals = proposal.approvals();
        let status = match evaluate_tally(approvals, proposal.votes.len(), known, required) {
            TallyOutcome::Accepted => ProposalStatus::Accepted,
            TallyOutcome::Rejected => ProposalStatus::Rejected,
            TallyOutcome::Undecided => return,
        };
        proposal.finalize(status);
        info!(
            node_id = %self.node_id,
            proposal_id = %proposal_id,
            status = ?status,
            approvals,
            required,
            "proposal converged"
        );
        publish_decision(&self.event_bus, proposal);

        if status == ProposalStatus::Accepted {
            let value = proposal.value.clone();
            let message = self.write_entry(state, format!("proposal:{proposal_id}"), value);
            state.outgoing.push(message);
        }
    }
}

impl<E> ConsensusProtocol for GossipNode<E>
where
    E: ConsensusEventBus,
{
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn start(self: Arc<Self>) {
        let node = Arc::clone(&self);
        let handle = tokio::spawn(node.run());
        self.tasks.lock().push(handle);
    }

    fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn add_node(&self, node_id: NodeId, _options: NodeOptions) -> Result<(), ConsensusError> {
        if node_id == self.node_id {
            return Ok(());
        }
        let mut neighbors = self.neighbors.write();
        if let Some(max) = self.config.max_nodes
            && !neighbors.contains(&node_id)
            && neighbors.len() + 1 >= max
        {
            return Err(ConsensusError::NodeLimit { max });
        }
        neighbors.insert(node_id);
        Ok(())
    }

    fn remove_node(&self, node_id: &str) -> bool {
        self.neighbors.write().remove(node_id)
    }

    fn peers(&self) -> Vec<NodeId> {
        self.neighbor_list()
    }

    fn propose(
        &self,
        value: Value,
        proposer_id: Option<NodeId>,
    ) -> Result<ConsensusProposal, ConsensusError> {
        let known = self.known_nodes();
        let mut state = self.state.lock();
        state.version += 1;

        let mut proposal = ConsensusProposal::new(
            generate_id(),
            proposer_id.unwrap_or_else(|| self.node_id.clone()),
            value,
            state.version,
            current_timestamp_ms()?,
        );
        proposal.record_vote(ConsensusVote::approve(self.node_id.clone()));
        let proposal_id = proposal.id.clone();

        // Disseminated by the re-push of the next gossip rounds.
        state.seen_messages.insert(proposal_id.clone());
        state.push_rounds.insert(proposal_id.clone(), 0);
        state.proposals.insert(proposal);
        debug!(node_id = %self.node_id, proposal_id = %proposal_id, "proposal queued for gossip");

        self.check_convergence(&mut state, &proposal_id, known);
        state
            .proposals
            .get(&proposal_id)
            .cloned()
            .ok_or(ConsensusError::ProposalNotFound(proposal_id))
    }

    fn vote(&self, proposal_id: &str, vote: ConsensusVote) -> Result<(), ConsensusError> {
        let known = self.known_nodes();
        let mut state = self.state.lock();
        let Some(proposal) = state.proposals.get(proposal_id) else {
            return Err(ConsensusError::ProposalNotFound(proposal_id.to_string()));
        };
        let vote = supersede_stored_vote(proposal, vote);
        self.cast_vote(&mut state, proposal_id, vote);
        self.check_convergence(&mut state, proposal_id, known);
        Ok(())
    }

    fn handle_message(&self, from: NodeId, message: WireMessage) -> Result<(), ConsensusError> {
        match message {
            WireMessage::Gossip(message) => {
                self.receive(&from, message);
                Ok(())
            }
            _ => {
                debug!(node_id = %self.node_id, from = %from, "ignoring non-gossip message");
                Ok(())
            }
        }
    }

    fn proposal(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        self.state.lock().proposals.get(proposal_id).cloned()
    }

    fn proposals(&self) -> Vec<ConsensusProposal> {
        self.state.lock().proposals.list()
    }

    fn expire(&self, proposal_id: &str) -> Option<ConsensusProposal> {
        let mut state = self.state.lock();
        expire_in_book(
            &self.node_id,
            &mut state.proposals,
            proposal_id,
            self.config.require_quorum,
            self.config.threshold,
            &self.event_bus,
        )
    }

    fn total_voters(&self) -> usize {
        self.known_nodes()
    }

    fn is_leader(&self) -> bool {
        false
    }

    fn leader_id(&self) -> Option<NodeId> {
        None
    }
}

impl<E> Drop for GossipNode<E>
where
    E: ConsensusEventBus,
{
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::InMemoryNetwork;

    fn node(id: &str, neighbors: &[&str]) -> GossipNode {
        let network = InMemoryNetwork::new();
        let (transport, _inbox) = network.join(id);
        let node = GossipNode::new(
            id,
            ConsensusConfig::from(crate::algorithm::Algorithm::Gossip),
            transport,
            BroadcastEventBus::default(),
        );
        for neighbor in neighbors {
            node.add_node(neighbor.to_string(), NodeOptions::default())
                .unwrap();
        }
        node
    }

    fn message(id: &str, hops: u32, payload: GossipPayload) -> WireMessage {
        WireMessage::Gossip(GossipMessage {
            id: id.into(),
            origin: "b".into(),
            hops,
            path: vec!["b".into()],
            payload,
        })
    }

    #[test]
    fn newer_version_supersedes() {
        let old = VersionedValue {
            value: json!(1),
            version: 1,
            origin: "z".into(),
        };
        let new = VersionedValue {
            value: json!(2),
            version: 2,
            origin: "a".into(),
        };
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }

    #[tokio::test]
    async fn single_node_converges_immediately() {
        let node = node("a", &[]);
        let proposal = node.propose(json!("X"), None).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Accepted);
        assert_eq!(node.get_state(&format!("proposal:{}", proposal.id)), Some(json!("X")));
    }

    #[tokio::test]
    async fn message_past_max_hops_is_dropped() {
        let node = node("a", &["b"]);
        let entry = VersionedValue {
            value: json!(1),
            version: 1,
            origin: "b".into(),
        };
        let payload = GossipPayload::State {
            key: "k".into(),
            entry,
        };
        node.handle_message("b".into(), message("m1", 6, payload.clone()))
            .unwrap();
        assert!(!node.has_seen("m1"));
        assert_eq!(node.get_state("k"), None);

        node.handle_message("b".into(), message("m2", 5, payload))
            .unwrap();
        assert!(node.has_seen("m2"));
        assert_eq!(node.get_state("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn vote_before_proposal_is_buffered() {
        let node = node("a", &["b", "c", "d"]);
        let proposal = ConsensusProposal::new("p".into(), "b", json!("X"), 1, 0);

        node.handle_message(
            "c".into(),
            message(
                "v1",
                1,
                GossipPayload::Vote {
                    proposal_id: "p".into(),
                    vote: ConsensusVote::approve("c"),
                },
            ),
        )
        .unwrap();
        assert!(node.proposal("p").is_none());

        node.handle_message("b".into(), message("p", 0, GossipPayload::Proposal { proposal }))
            .unwrap();
        let stored = node.proposal("p").unwrap();
        assert!(stored.votes.contains_key("c"));
        assert!(stored.votes.contains_key("a"));
    }
}
