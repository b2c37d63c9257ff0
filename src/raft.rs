//! Leader-based consensus: elections, heartbeats and majority replication.
//!
//! A node starts as a follower in term 0. When its randomized election deadline passes it
//! becomes a candidate, and with a majority of votes it becomes leader. A leader appends
//! proposals to its log, replicates them on every heartbeat, and advances `commit_index` once a
//! majority holds an entry. A follower acknowledging an entry counts as that follower approving the
//! entry's proposal.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, info};

use crate::{
    config::ConsensusConfig,
    error::ConsensusError,
    events::{BroadcastEventBus, ConsensusEvent, ConsensusEventBus},
    proposals::ProposalBook,
    protocol::{ConsensusProtocol, expire_in_book, publish_decision},
    transport::{Outbox, Transport, WireMessage},
    types::{ConsensusProposal, ConsensusVote, NodeId, NodeOptions, ProposalId, ProposalStatus},
    utils::{
        TallyOutcome, calculate_required_votes, current_timestamp_ms, evaluate_tally,
        generate_id, majority,
    },
};

/// Upper bound on entries shipped in one AppendEntries message.
const MAX_ENTRIES_PER_MESSAGE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based position in the log.
    pub index: u64,
    pub command: Value,
    pub proposal_id: ProposalId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        /// Last index known to match the leader; on failure, a hint for `next_index`.
        match_index: u64,
    },
}

/// Snapshot of a Raft node's local view.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_len: usize,
}

struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    votes_received: HashSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    election_deadline: Instant,
    proposals: ProposalBook,
}

impl RaftState {
    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |entry| entry.term)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|entry| entry.term)
    }

    /// Step down, adopting `term` if it is newer. Terms never decrease.
    fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received.clear();
    }

    fn apply_committed(&mut self) {
        if self.last_applied < self.commit_index {
            self.last_applied = self.commit_index;
        }
    }
}

pub struct RaftNode<E = BroadcastEventBus>
where
    E: ConsensusEventBus,
{
    node_id: NodeId,
    config: ConsensusConfig,
    peers: RwLock<BTreeSet<NodeId>>,
    state: Mutex<RaftState>,
    outbox: Outbox,
    event_bus: E,
    wakeup: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E> RaftNode<E>
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
        let election_deadline = Instant::now() + config.raft.random_election_timeout();
        Self {
            outbox: Outbox::new(node_id.clone(), transport),
            node_id,
            config,
            peers: RwLock::new(BTreeSet::new()),
            state: Mutex::new(RaftState {
                role: RaftRole::Follower,
                current_term: 0,
                voted_for: None,
                leader_id: None,
                log: Vec::new(),
                commit_index: 0,
                last_applied: 0,
                votes_received: HashSet::new(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline,
                proposals: ProposalBook::new(),
            }),
            event_bus,
            wakeup: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    pub fn status(&self) -> RaftStatus {
        let state = self.state.lock();
        RaftStatus {
            node_id: self.node_id.clone(),
            role: state.role,
            term: state.current_term,
            voted_for: state.voted_for.clone(),
            leader_id: state.leader_id.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: state.log.len(),
        }
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.state.lock().log.clone()
    }

    fn peer_list(&self) -> Vec<NodeId> {
        self.peers.read().iter().cloned().collect()
    }

    fn cluster_size(&self) -> usize {
        self.peers.read().len() + 1
    }

    fn rearm_election_timeout(&self, state: &mut RaftState) {
        state.election_deadline = Instant::now() + self.config.raft.random_election_timeout();
    }

    async fn run(self: Arc<Self>) {
        loop {
            let (role, deadline) = {
                let state = self.state.lock();
                (state.role, state.election_deadline)
            };

            if role == RaftRole::Leader {
                self.send_append_entries(true);
                sleep(self.config.raft.heartbeat_interval()).await;
            } else {
                tokio::select! {
                    _ = sleep_until(deadline) => self.on_election_deadline(),
                    _ = self.wakeup.notified() => {}
                }
            }
        }
    }

    fn on_election_deadline(&self) {
        let mut state = self.state.lock();
        if state.role == RaftRole::Leader || Instant::now() < state.election_deadline {
            return;
        }
        if state.role == RaftRole::Candidate {
            info!(
                node_id = %self.node_id,
                term = state.current_term,
                votes = state.votes_received.len(),
                "election failed, reverting to follower"
            );
            let term = state.current_term;
            state.become_follower(term);
            self.rearm_election_timeout(&mut state);
            return;
        }
        drop(state);
        self.start_election();
    }

    /// Become candidate for the next term and ask every peer for its vote.
    pub fn start_election(&self) {
        let peers = self.peer_list();
        let cluster_size = peers.len() + 1;

        let request = {
            let mut state = self.state.lock();
            state.current_term += 1;
            state.role = RaftRole::Candidate;
            state.voted_for = Some(self.node_id.clone());
            state.leader_id = None;
            state.votes_received.clear();
            state.votes_received.insert(self.node_id.clone());
            self.rearm_election_timeout(&mut state);

            info!(
                node_id = %self.node_id,
                term = state.current_term,
                "starting election"
            );

            if state.votes_received.len() >= majority(cluster_size) {
                self.become_leader(&mut state, &peers);
                None
            } else {
                Some(RaftMessage::RequestVote {
                    term: state.current_term,
                    candidate_id: self.node_id.clone(),
                    last_log_index: state.last_log_index(),
                    last_log_term: state.last_log_term(),
                })
            }
        };

        match request {
            Some(request) => self.outbox.broadcast(peers, WireMessage::Raft(request)),
            None => self.replicate_to_followers(),
        }
    }

    fn become_leader(&self, state: &mut RaftState, peers: &[NodeId]) {
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.node_id.clone());
        state.votes_received.clear();
        let next = state.last_log_index() + 1;
        state.next_index = peers.iter().map(|peer| (peer.clone(), next)).collect();
        state.match_index = peers.iter().map(|peer| (peer.clone(), 0)).collect();

        info!(node_id = %self.node_id, term = state.current_term, "became leader");
        self.event_bus.publish(ConsensusEvent::LeaderElected {
            node_id: self.node_id.clone(),
            term: state.current_term,
        });
        self.wakeup.notify_one();
    }

    /// Decide whether to grant `candidate_id` our vote for `term`.
    pub fn handle_vote_request(
        &self,
        term: u64,
        candidate_id: &str,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        let mut state = self.state.lock();
        if term < state.current_term {
            return RaftMessage::RequestVoteResponse {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if term > state.current_term {
            state.become_follower(term);
        }

        let up_to_date = last_log_term > state.last_log_term()
            || (last_log_term == state.last_log_term()
                && last_log_index >= state.last_log_index());
        let can_vote = state
            .voted_for
            .as_deref()
            .is_none_or(|voted| voted == candidate_id);
        let vote_granted = can_vote && up_to_date;

        if vote_granted {
            state.voted_for = Some(candidate_id.to_string());
            self.rearm_election_timeout(&mut state);
            debug!(node_id = %self.node_id, candidate = %candidate_id, term, "granted vote");
        }

        RaftMessage::RequestVoteResponse {
            term: state.current_term,
            vote_granted,
        }
    }

    fn handle_vote_response(&self, from: &str, term: u64, vote_granted: bool) {
        let peers = self.peer_list();
        if !peers.iter().any(|peer| peer == from) {
            return;
        }

        let became_leader = {
            let mut state = self.state.lock();
            if term > state.current_term {
                state.become_follower(term);
                self.rearm_election_timeout(&mut state);
                return;
            }
            if state.role != RaftRole::Candidate || term < state.current_term || !vote_granted {
                return;
            }

            state.votes_received.insert(from.to_string());
            if state.votes_received.len() >= majority(peers.len() + 1) {
                self.become_leader(&mut state, &peers);
                true
            } else {
                false
            }
        };

        if became_leader {
            self.replicate_to_followers();
        }
    }

    /// Follower side of log replication.
    pub fn handle_append_entries(
        &self,
        term: u64,
        leader_id: &str,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftMessage {
        let mut state = self.state.lock();
        if term < state.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: 0,
            };
        }

        if term > state.current_term || state.role != RaftRole::Follower {
            state.become_follower(term);
        }
        state.leader_id = Some(leader_id.to_string());
        self.rearm_election_timeout(&mut state);

        if state.term_at(prev_log_index) != Some(prev_log_term) {
            let hint = state
                .last_log_index()
                .min(prev_log_index.saturating_sub(1));
            return RaftMessage::AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: hint,
            };
        }

        let mut match_index = prev_log_index;
        for entry in entries {
            match state.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(_) if entry.index > state.commit_index => {
                    state.log.truncate(entry.index as usize - 1);
                    state.log.push(entry.clone());
                }
                Some(_) => break,
                None if entry.index == state.last_log_index() + 1 => {
                    state.log.push(entry.clone());
                }
                None => break,
            }
            match_index = entry.index;
        }

        if leader_commit > state.commit_index {
            state.commit_index = leader_commit.min(match_index).max(state.commit_index);
            state.apply_committed();
        }

        RaftMessage::AppendEntriesResponse {
            term: state.current_term,
            success: true,
            match_index,
        }
    }

    fn handle_append_response(&self, from: &str, term: u64, success: bool, match_index: u64) {
        let peers = self.peer_list();
        if !peers.iter().any(|peer| peer == from) {
            return;
        }
        let total_voters = peers.len() + 1;

        let mut state = self.state.lock();
        if term > state.current_term {
            info!(node_id = %self.node_id, term, "stepping down, newer term observed");
            state.become_follower(term);
            self.rearm_election_timeout(&mut state);
            return;
        }
        if state.role != RaftRole::Leader || term < state.current_term {
            return;
        }

        let last_index = state.last_log_index();
        if success {
            let match_index = match_index.min(last_index);
            let previous = state.match_index.get(from).copied().unwrap_or(0);
            if match_index > previous {
                state.match_index.insert(from.to_string(), match_index);
                let acknowledged: Vec<ProposalId> = state.log
                    [previous as usize..match_index as usize]
                    .iter()
                    .map(|entry| entry.proposal_id.clone())
                    .collect();
                for proposal_id in acknowledged {
                    if state.proposals.contains(&proposal_id) {
                        let _ = state
                            .proposals
                            .record_vote(&proposal_id, ConsensusVote::approve(from));
                        self.check_consensus(&mut state, &proposal_id, total_voters);
                    }
                }
            }
            let next = state.match_index.get(from).copied().unwrap_or(0) + 1;
            state.next_index.insert(from.to_string(), next);
            self.advance_commit_index(&mut state, total_voters);
        } else {
            let current_next = state
                .next_index
                .get(from)
                .copied()
                .unwrap_or(last_index + 1);
            let next = (match_index + 1).min(current_next.saturating_sub(1)).max(1);
            state.next_index.insert(from.to_string(), next);
            debug!(node_id = %self.node_id, peer = %from, next, "log mismatch, backing off");
        }
    }

    /// Commit the highest current-term entry stored on a majority.
    fn advance_commit_index(&self, state: &mut RaftState, cluster_size: usize) {
        let needed = majority(cluster_size);
        let mut candidate = state.last_log_index();
        while candidate > state.commit_index {
            let replicated = 1 + state
                .match_index
                .values()
                .filter(|&&matched| matched >= candidate)
                .count();
            if replicated >= needed && state.term_at(candidate) == Some(state.current_term) {
                state.commit_index = candidate;
                state.apply_committed();
                debug!(node_id = %self.node_id, commit_index = candidate, "advanced commit index");
                break;
            }
            candidate -= 1;
        }
    }

    fn check_consensus(&self, state: &mut RaftState, proposal_id: &str, total_voters: usize) {
        let Some(proposal) = state.proposals.get_mut(proposal_id) else {
            return;
        };
        if !proposal.is_pending() {
            return;
        }

        let required = calculate_required_votes(total_voters, self.config.threshold);
        let status = match evaluate_tally(
            proposal.approvals(),
            proposal.votes.len(),
            total_voters,
            required,
        ) {
            TallyOutcome::Accepted => ProposalStatus::Accepted,
            TallyOutcome::Rejected => ProposalStatus::Rejected,
            TallyOutcome::Undecided => return,
        };

        proposal.finalize(status);
        info!(
            node_id = %self.node_id,
            proposal_id = %proposal_id,
            status = ?status,
            approvals = proposal.approvals(),
            required,
            "proposal decided"
        );
        publish_decision(&self.event_bus, proposal);
    }

    /// Ship every follower the entries it is missing.
    pub fn replicate_to_followers(&self) {
        self.send_append_entries(false);
    }

    fn send_append_entries(&self, heartbeat: bool) {
        let peers = self.peer_list();
        let messages: Vec<(NodeId, RaftMessage)> = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return;
            }
            if heartbeat {
                state.proposals.tick_rounds();
            }

            let default_next = state.last_log_index() + 1;
            peers
                .iter()
                .map(|peer| {
                    let next = *state
                        .next_index
                        .entry(peer.clone())
                        .or_insert(default_next);
                    let prev_log_index = next.saturating_sub(1);
                    let start = prev_log_index as usize;
                    let end = (start + MAX_ENTRIES_PER_MESSAGE).min(state.log.len());
                    let message = RaftMessage::AppendEntries {
                        term: state.current_term,
                        leader_id: self.node_id.clone(),
                        prev_log_index,
                        prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
                        entries: state.log.get(start..end).unwrap_or_default().to_vec(),
                        leader_commit: state.commit_index,
                    };
                    (peer.clone(), message)
                })
                .collect()
        };

        for (peer, message) in messages {
            self.outbox.send(peer, WireMessage::Raft(message));
        }
    }
}

impl<E> ConsensusProtocol for RaftNode<E>
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
        debug!(node_id = %self.node_id, "raft timers armed");
    }

    fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        debug!(node_id = %self.node_id, "raft timers cancelled");
    }

    fn add_node(&self, node_id: NodeId, _options: NodeOptions) -> Result<(), ConsensusError> {
        if node_id == self.node_id {
            return Ok(());
        }
        let mut peers = self.peers.write();
        if let Some(max) = self.config.max_nodes
            && !peers.contains(&node_id)
            && peers.len() + 1 >= max
        {
            return Err(ConsensusError::NodeLimit { max });
        }
        peers.insert(node_id);
        Ok(())
    }

    fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.peers.write().remove(node_id);
        if removed {
            let mut state = self.state.lock();
            state.next_index.remove(node_id);
            state.match_index.remove(node_id);
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
        let cluster_size = self.cluster_size();
        let proposal = {
            let mut state = self.state.lock();
            if state.role != RaftRole::Leader {
                return Err(ConsensusError::NotLeader {
                    leader: state.leader_id.clone(),
                });
            }

            let now = current_timestamp_ms()?;
            let proposal_id = generate_id();
            let index = state.last_log_index() + 1;
            let term = state.current_term;
            state.log.push(LogEntry {
                term,
                index,
                command: value.clone(),
                proposal_id: proposal_id.clone(),
                timestamp: now,
            });

            let mut proposal = ConsensusProposal::new(
                proposal_id.clone(),
                proposer_id.unwrap_or_else(|| self.node_id.clone()),
                value,
                term,
                now,
            );
            proposal.record_vote(ConsensusVote::approve(self.node_id.clone()));
            state.proposals.insert(proposal);

            debug!(node_id = %self.node_id, proposal_id = %proposal_id, index, term, "appended proposal");
            self.check_consensus(&mut state, &proposal_id, cluster_size);
            self.advance_commit_index(&mut state, cluster_size);
            state
                .proposals
                .get(&proposal_id)
                .cloned()
                .ok_or(ConsensusError::ProposalNotFound(proposal_id))?
        };

        self.replicate_to_followers();
        Ok(proposal)
    }

    fn vote(&self, proposal_id: &str, vote: ConsensusVote) -> Result<(), ConsensusError> {
        let total_voters = self.cluster_size();
        let mut state = self.state.lock();
        state.proposals.record_vote(proposal_id, vote)?;
        self.check_consensus(&mut state, proposal_id, total_voters);
        Ok(())
    }

    fn handle_message(&self, from: NodeId, message: WireMessage) -> Result<(), ConsensusError> {
        let WireMessage::Raft(message) = message else {
            debug!(node_id = %self.node_id, from = %from, "ignoring non-raft message");
            return Ok(());
        };

        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let response =
                    self.handle_vote_request(term, &candidate_id, last_log_index, last_log_term);
                self.outbox.send(from, WireMessage::Raft(response));
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_vote_response(&from, term, vote_granted);
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let response = self.handle_append_entries(
                    term,
                    &leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                self.outbox.send(from, WireMessage::Raft(response));
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                self.handle_append_response(&from, term, success, match_index);
            }
        }
        Ok(())
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
        self.cluster_size()
    }

    fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().leader_id.clone()
    }
}

impl<E> Drop for RaftNode<E>
where
    E: ConsensusEventBus,
{
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
