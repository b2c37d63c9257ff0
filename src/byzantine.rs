//! PBFT-style three-phase commit.
//!
//! The primary of a view is `sorted(nodes)[view mod n]` unless a node was pinned as primary
//! through [`NodeOptions`]. Each phase (pre-prepare, prepare, commit) advances once `2f+1`
//! matching messages for the same `(view, sequence)` slot and digest are collected.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::ConsensusConfig,
    error::ConsensusError,
    events::{BroadcastEventBus, ConsensusEvent, ConsensusEventBus},
    proposals::ProposalBook,
    protocol::{ConsensusProtocol, expire_in_book, publish_decision},
    transport::{Outbox, Transport, WireMessage},
    types::{ConsensusProposal, ConsensusVote, NodeId, NodeOptions, ProposalId, ProposalStatus},
    utils::{
        byzantine_quorum, compute_digest, current_timestamp_ms, generate_id, max_tolerable_faults,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PbftMessage {
    PrePrepare {
        view: u64,
        sequence: u64,
        digest: String,
        proposal: ConsensusProposal,
    },
    Prepare {
        view: u64,
        sequence: u64,
        digest: String,
    },
    Commit {
        view: u64,
        sequence: u64,
        digest: String,
    },
    ViewChange {
        new_view: u64,
    },
}

/// Slot of the three-phase protocol, rendered as `{view}_{sequence}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewSeqKey {
    pub view: u64,
    pub sequence: u64,
}

impl ViewSeqKey {
    pub fn new(view: u64, sequence: u64) -> Self {
        Self { view, sequence }
    }
}

impl fmt::Display for ViewSeqKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.view, self.sequence)
    }
}

struct Slot {
    digest: String,
    proposal_id: ProposalId,
    pre_prepared_at: Instant,
}

struct ByzantineState {
    view: u64,
    sequence: u64,
    pinned_primary: Option<NodeId>,
    slots: HashMap<ViewSeqKey, Slot>,
    /// Sender to digest, per slot.
    prepared_messages: HashMap<ViewSeqKey, HashMap<NodeId, String>>,
    committed_messages: HashMap<ViewSeqKey, HashMap<NodeId, String>>,
    prepared: HashSet<ViewSeqKey>,
    committed: HashSet<ViewSeqKey>,
    view_change_requests: HashMap<u64, HashSet<NodeId>>,
    proposals: ProposalBook,
}

impl ByzantineState {
    fn matching(
        messages: &HashMap<ViewSeqKey, HashMap<NodeId, String>>,
        key: &ViewSeqKey,
        digest: &str,
    ) -> usize {
        messages
            .get(key)
            .map_or(0, |senders| senders.values().filter(|d| *d == digest).count())
    }
}

pub struct ByzantineNode<E = BroadcastEventBus>
where
    E: ConsensusEventBus,
{
    node_id: NodeId,
    config: ConsensusConfig,
    peers: RwLock<BTreeSet<NodeId>>,
    state: Mutex<ByzantineState>,
    outbox: Outbox,
    event_bus: E,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E> ByzantineNode<E>
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
            peers: RwLock::new(BTreeSet::new()),
            state: Mutex::new(ByzantineState {
                view: 0,
                sequence: 0,
                pinned_primary: None,
                slots: HashMap::new(),
                prepared_messages: HashMap::new(),
                committed_messages: HashMap::new(),
                prepared: HashSet::new(),
                committed: HashSet::new(),
                view_change_requests: HashMap::new(),
                proposals: ProposalBook::new(),
            }),
            event_bus,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    pub fn view(&self) -> u64 {
        self.state.lock().view
    }

    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Nodes participating, self included.
    pub fn node_count(&self) -> usize {
        self.peers.read().len() + 1
    }

    fn quorum(&self) -> usize {
        byzantine_quorum(self.config.byzantine.max_faulty_nodes)
    }

    /// Whether a cluster of the current size survives `faulty` Byzantine nodes.
    pub fn can_tolerate(&self, faulty: usize) -> bool {
        faulty <= max_tolerable_faults(self.node_count())
    }

    pub fn primary(&self) -> NodeId {
        let state = self.state.lock();
        self.elect_primary(&state)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.node_id
    }

    /// Round-robin over the sorted node ids, unless a primary was pinned for this view.
    fn elect_primary(&self, state: &ByzantineState) -> NodeId {
        if let Some(pinned) = &state.pinned_primary {
            return pinned.clone();
        }
        let peers = self.peers.read();
        let mut nodes: BTreeSet<&NodeId> = peers.iter().collect();
        nodes.insert(&self.node_id);
        let index = (state.view % nodes.len() as u64) as usize;
        nodes
            .into_iter()
            .nth(index)
            .cloned()
            .unwrap_or_else(|| self.node_id.clone())
    }

    /// Pending proposals of the current view stay stuck if the primary fails. Ask to move on.
    pub fn initiate_view_change(&self) {
        let peers = self.peer_list();
        let new_view = {
            let mut state = self.state.lock();
            let new_view = state.view + 1;
            info!(node_id = %self.node_id, view = state.view, new_view, "initiating view change");
            self.enter_view(&mut state, new_view);
            new_view
        };
        self.outbox.broadcast(
            peers,
            WireMessage::Byzantine(PbftMessage::ViewChange { new_view }),
        );
    }

    fn enter_view(&self, state: &mut ByzantineState, new_view: u64) {
        if new_view <= state.view {
            return;
        }
        state.view = new_view;
        state.pinned_primary = None;
        state.view_change_requests.retain(|view, _| *view > new_view);

        let stale: Vec<ProposalId> = state
            .proposals
            .iter()
            .filter(|proposal| proposal.is_pending())
            .map(|proposal| proposal.id.clone())
            .collect();
        for proposal_id in stale {
            if state.proposals.finalize(&proposal_id, ProposalStatus::Expired)
                && let Some(proposal) = state.proposals.get(&proposal_id)
            {
                debug!(node_id = %self.node_id, proposal_id = %proposal_id, "expired by view change");
                publish_decision(&self.event_bus, proposal);
            }
        }

        let primary = self.elect_primary(state);
        info!(node_id = %self.node_id, view = new_view, primary = %primary, "entered new view");
        self.event_bus.publish(ConsensusEvent::ViewChanged {
            view: new_view,
            primary: Some(primary),
        });
    }

    fn peer_list(&self) -> Vec<NodeId> {
        self.peers.read().iter().cloned().collect()
    }

    async fn run(self: Arc<Self>) {
        let timeout = self.config.byzantine.view_change_timeout();
        loop {
            sleep(timeout / 2).await;
            if self.primary_timed_out() {
                self.initiate_view_change();
            }
        }
    }

    /// A backup holding a pre-prepared, uncommitted slot of this view for too long.
    fn primary_timed_out(&self) -> bool {
        if self.is_primary() {
            return false;
        }
        let timeout = self.config.byzantine.view_change_timeout();
        let state = self.state.lock();
        state.slots.iter().any(|(key, slot)| {
            key.view == state.view
                && !state.committed.contains(key)
                && slot.pre_prepared_at.elapsed() >= timeout
        })
    }

    fn process(
        &self,
        state: &mut ByzantineState,
        from: &str,
        message: PbftMessage,
        out: &mut Vec<PbftMessage>,
    ) {
        match message {
            PbftMessage::PrePrepare {
                view,
                sequence,
                digest,
                proposal,
            } => self.on_pre_prepare(state, from, view, sequence, digest, proposal, out),
            PbftMessage::Prepare {
                view,
                sequence,
                digest,
            } => {
                if view != state.view {
                    debug!(node_id = %self.node_id, from = %from, view, current = state.view, "stale prepare");
                    return;
                }
                let key = ViewSeqKey::new(view, sequence);
                state
                    .prepared_messages
                    .entry(key)
                    .or_default()
                    .insert(from.to_string(), digest);
                self.try_prepare(state, key, out);
            }
            PbftMessage::Commit {
                view,
                sequence,
                digest,
            } => {
                if view != state.view {
                    debug!(node_id = %self.node_id, from = %from, view, current = state.view, "stale commit");
                    return;
                }
                let key = ViewSeqKey::new(view, sequence);
                state
                    .committed_messages
                    .entry(key)
                    .or_default()
                    .insert(from.to_string(), digest);
                self.try_commit(state, key);
            }
            PbftMessage::ViewChange { new_view } => {
                if new_view <= state.view {
                    return;
                }
                let requests = state.view_change_requests.entry(new_view).or_default();
                requests.insert(from.to_string());
                let count = requests.len();
                debug!(node_id = %self.node_id, from = %from, new_view, count, "view change request");
                if count > self.config.byzantine.max_faulty_nodes {
                    self.enter_view(state, new_view);
                    out.push(PbftMessage::ViewChange { new_view });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_pre_prepare(
        &self,
        state: &mut ByzantineState,
        from: &str,
        view: u64,
        sequence: u64,
        digest: String,
        proposal: ConsensusProposal,
        out: &mut Vec<PbftMessage>,
    ) {
        if view != state.view {
            warn!(node_id = %self.node_id, from = %from, view, current = state.view, "pre-prepare for another view");
            return;
        }
        let primary = self.elect_primary(state);
        if from != primary {
            warn!(node_id = %self.node_id, from = %from, primary = %primary, "pre-prepare from non-primary");
            return;
        }
        if compute_digest(&proposal.value) != digest {
            warn!(node_id = %self.node_id, from = %from, "pre-prepare digest does not match value");
            return;
        }

        let key = ViewSeqKey::new(view, sequence);
        if let Some(existing) = state.slots.get(&key) {
            if existing.digest != digest {
                warn!(node_id = %self.node_id, slot = %key, "conflicting pre-prepare rejected");
            }
            return;
        }

        let mut proposal = proposal;
        proposal.votes.clear();
        proposal.status = ProposalStatus::Pending;
        proposal.decided_at = None;
        proposal.term = view;
        let proposal_id = proposal.id.clone();
        if !state.proposals.insert(proposal) {
            debug!(node_id = %self.node_id, proposal_id = %proposal_id, "proposal already known");
            return;
        }

        state.sequence = state.sequence.max(sequence);
        state.slots.insert(
            key,
            Slot {
                digest: digest.clone(),
                proposal_id,
                pre_prepared_at: Instant::now(),
            },
        );
        debug!(node_id = %self.node_id, slot = %key, "pre-prepared");

        state
            .prepared_messages
            .entry(key)
            .or_default()
            .insert(self.node_id.clone(), digest.clone());
        out.push(PbftMessage::Prepare {
            view,
            sequence,
            digest,
        });
        self.try_prepare(state, key, out);
        self.try_commit(state, key);
    }

    fn try_prepare(&self, state: &mut ByzantineState, key: ViewSeqKey, out: &mut Vec<PbftMessage>) {
        if state.prepared.contains(&key) {
            return;
        }
        let Some(slot) = state.slots.get(&key) else {
            return;
        };
        let digest = slot.digest.clone();
        let proposal_id = slot.proposal_id.clone();
        let count = ByzantineState::matching(&state.prepared_messages, &key, &digest);
        if count < self.quorum() {
            return;
        }

        state.prepared.insert(key);
        let _ = state
            .proposals
            .record_vote(&proposal_id, ConsensusVote::approve(self.node_id.clone()));
        debug!(node_id = %self.node_id, slot = %key, prepares = count, "prepared");

        state
            .committed_messages
            .entry(key)
            .or_default()
            .insert(self.node_id.clone(), digest.clone());
        out.push(PbftMessage::Commit {
            view: key.view,
            sequence: key.sequence,
            digest,
        });
        self.try_commit(state, key);
    }

    fn try_commit(&self, state: &mut ByzantineState, key: ViewSeqKey) {
        if state.committed.contains(&key) {
            return;
        }
        let Some(slot) = state.slots.get(&key) else {
            return;
        };
        let proposal_id = slot.proposal_id.clone();
        let count = ByzantineState::matching(&state.committed_messages, &key, &slot.digest);
        if count < self.quorum() {
            return;
        }

        state.committed.insert(key);
        if state.proposals.finalize(&proposal_id, ProposalStatus::Accepted)
            && let Some(proposal) = state.proposals.get(&proposal_id)
        {
            info!(node_id = %self.node_id, slot = %key, proposal_id = %proposal_id, commits = count, "committed");
            publish_decision(&self.event_bus, proposal);
        }
    }

    /// Feed one protocol message from `from` and broadcast whatever it triggers.
    fn receive(&self, from: &str, message: PbftMessage) {
        if from != self.node_id && !self.peers.read().contains(from) {
            warn!(node_id = %self.node_id, from = %from, "ignoring message from non-member");
            return;
        }
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            self.process(&mut state, from, message, &mut out);
        }
        self.flush(out);
    }

    fn flush(&self, out: Vec<PbftMessage>) {
        if out.is_empty() {
            return;
        }
        let peers = self.peer_list();
        for message in out {
            self.outbox
                .broadcast(peers.clone(), WireMessage::Byzantine(message));
        }
    }
}

impl<E> ConsensusProtocol for ByzantineNode<E>
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

    fn add_node(&self, node_id: NodeId, options: NodeOptions) -> Result<(), ConsensusError> {
        if node_id != self.node_id {
            let mut peers = self.peers.write();
            if let Some(max) = self.config.max_nodes
                && !peers.contains(&node_id)
                && peers.len() + 1 >= max
            {
                return Err(ConsensusError::NodeLimit { max });
            }
            peers.insert(node_id.clone());
        }
        if options.is_primary {
            let mut state = self.state.lock();
            info!(node_id = %self.node_id, primary = %node_id, view = state.view, "primary pinned");
            state.pinned_primary = Some(node_id);
        }
        Ok(())
    }

    fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.peers.write().remove(node_id);
        if removed {
            let mut state = self.state.lock();
            if state.pinned_primary.as_deref() == Some(node_id) {
                state.pinned_primary = None;
            }
        }
        removed
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peer_list()
    }

    fn propose(
        &self,
        value: Value,
        proposer_id: Option<NodeId>,
    ) -> Result<ConsensusProposal, ConsensusError> {
        let mut out = Vec::new();
        let proposal = {
            let mut state = self.state.lock();
            let primary = self.elect_primary(&state);
            if primary != self.node_id {
                return Err(ConsensusError::NotPrimary {
                    primary: Some(primary),
                });
            }

            let sequence = state.sequence + 1;
            let view = state.view;
            let digest = compute_digest(&value);
            let proposal = ConsensusProposal::new(
                generate_id(),
                proposer_id.unwrap_or_else(|| self.node_id.clone()),
                value,
                view,
                current_timestamp_ms()?,
            );
            let proposal_id = proposal.id.clone();

            let pre_prepare = PbftMessage::PrePrepare {
                view,
                sequence,
                digest,
                proposal,
            };
            out.push(pre_prepare.clone());
            let node_id = self.node_id.clone();
            self.process(&mut state, &node_id, pre_prepare, &mut out);

            state
                .proposals
                .get(&proposal_id)
                .cloned()
                .ok_or(ConsensusError::ProposalNotFound(proposal_id))?
        };
        self.flush(out);
        Ok(proposal)
    }

    fn vote(&self, proposal_id: &str, vote: ConsensusVote) -> Result<(), ConsensusError> {
        let total = self.node_count();
        let quorum = self.quorum();
        let mut state = self.state.lock();
        state.proposals.record_vote(proposal_id, vote)?;

        let Some(proposal) = state.proposals.get_mut(proposal_id) else {
            return Ok(());
        };
        if !proposal.is_pending() {
            return Ok(());
        }
        let approvals = proposal.approvals();
        let status = if approvals >= quorum {
            ProposalStatus::Accepted
        } else if proposal.votes.len() >= total {
            ProposalStatus::Rejected
        } else {
            return Ok(());
        };
        proposal.finalize(status);
        info!(node_id = %self.node_id, proposal_id = %proposal_id, status = ?status, approvals, quorum, "decided by vote tally");
        publish_decision(&self.event_bus, proposal);
        Ok(())
    }

    fn handle_message(&self, from: NodeId, message: WireMessage) -> Result<(), ConsensusError> {
        match message {
            WireMessage::Byzantine(message) => {
                self.receive(&from, message);
                Ok(())
            }
            _ => {
                debug!(node_id = %self.node_id, from = %from, "ignoring non-pbft message");
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
        self.node_count()
    }

    fn is_leader(&self) -> bool {
        self.is_primary()
    }

    fn leader_id(&self) -> Option<NodeId> {
        Some(self.primary())
    }
}

impl<E> Drop for ByzantineNode<E>
where
    E: ConsensusEventBus,
{
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
