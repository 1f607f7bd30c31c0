//! Unstable, low-level API for the complete state of a Raft node.
//!
//! The transitions below follow the structure of the Raft TLA+ specification; where a block corresponds closely to
//! the TLA+ the matching action name is given in a comment. Membership is the part that departs from it: only voters
//! campaign, vote and count towards quorums, and the configuration is replaced through [`State::reconfigure`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter;

use bytes::Bytes;
use log::{debug, info, warn};
use rand_core::RngCore;

use crate::log::{CommittedIter, Log, LogConflict, LogState};
use crate::membership::Membership;
use crate::message::*;
use crate::node::{AppendError, Config};

use self::LeadershipState::*;

/// The state of Raft log replication from a Raft node to one of its peers.
pub struct ReplicationState {
    /// The index of the next log entry to be sent to this peer.
    pub next_idx: LogIndex,

    /// The index of the last log entry on this peer up to which the peer's log is known to match this node's log.
    pub match_idx: LogIndex,

    /// The index of the last log entry sent to this peer but which has not yet been acknowledged by the peer.
    pub inflight: Option<LogIndex>,

    /// Timer ticks elapsed since [`inflight`](Self::inflight) was sent.
    inflight_ticks: u32,

    /// Whether this node is currently probing to discover the correct [`match_idx`][Self::match_idx] for this peer.
    pub send_probe: bool,

    /// Whether a heartbeat "ping" message is due to be sent to this peer.
    send_heartbeat: bool,
}

// CONSTANTS Follower, Candidate, Leader
enum LeadershipState<NodeId> {
    Follower(FollowerState<NodeId>),
    Candidate(CandidateState<NodeId>),
    Leader(LeaderState<NodeId>),
}

struct FollowerState<NodeId> {
    leader: Option<NodeId>,

    election_ticks: u32,
    random_election_ticks: u32,
}

struct CandidateState<NodeId> {
    // VARIABLE votesGranted
    votes_granted: BTreeSet<NodeId>,

    election_ticks: u32,
}

struct LeaderState<NodeId> {
    // VARIABLES nextIndex, matchIndex
    followers: BTreeMap<NodeId, ReplicationState>,

    heartbeat_ticks: u32,
}

/// The complete state of a Raft node.
pub struct State<L, Random, NodeId: Ord> {
    node_id: NodeId,
    membership: Membership<NodeId>,
    /// Every member of [`membership`](Self::membership) except this node.
    peers: BTreeSet<NodeId>,
    random: Random,
    config: Config,

    // VARIABLE currentTerm
    current_term: TermId,

    // VARIABLE votedFor
    voted_for: Option<NodeId>,

    // VARIABLE state
    leadership: LeadershipState<NodeId>,

    // VARIABLES log, commitIndex
    log: LogState<L>,
}

impl ReplicationState {
    fn new(next_idx: LogIndex) -> Self {
        Self {
            next_idx,
            match_idx: LogIndex::default(),
            inflight: None,
            inflight_ticks: 0,
            send_probe: false,
            send_heartbeat: true,
        }
    }
}

#[allow(missing_docs)]
impl<L, Random, NodeId> State<L, Random, NodeId>
where
    L: Log,
    Random: RngCore,
    NodeId: Ord + Clone + fmt::Display,
{
    /// A voter in a group whose voters are `peers` and this node.
    pub fn new(node_id: NodeId, peers: BTreeSet<NodeId>, log: L, random: Random, config: Config) -> Self {
        let membership = Membership::new(peers.into_iter().chain(iter::once(node_id.clone())));
        Self::with_membership(node_id, membership, log, random, config)
    }

    pub fn with_membership(
        node_id: NodeId,
        membership: Membership<NodeId>,
        log: L,
        mut random: Random,
        config: Config,
    ) -> Self {
        let random_election_ticks = random_election_timeout(&mut random, config.election_timeout_ticks);
        let peers = peers_of(&node_id, &membership);
        Self {
            node_id,
            membership,
            peers,
            random,
            config,
            log: LogState::new(log),
            current_term: TermId::default(),
            voted_for: None,
            leadership: Follower(FollowerState {
                leader: None,
                election_ticks: random_election_ticks,
                random_election_ticks,
            }),
        }
    }

    pub fn commit_idx(&self) -> &LogIndex {
        &self.log.commit_idx
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.leadership, Candidate(_))
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.leadership, Leader(_))
    }

    pub fn is_voter(&self) -> bool {
        self.membership.is_voter(&self.node_id)
    }

    /// Whether this node leads and has committed an entry of its own term, which guarantees that every entry of
    /// previous terms is committed as well.
    pub fn has_committed_in_term(&mut self) -> bool {
        self.is_leader() && self.log.get_term(self.log.commit_idx) == Some(self.current_term)
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn leader(&self) -> (Option<&NodeId>, &TermId) {
        let leader = match &self.leadership {
            Follower(follower_state) => follower_state.leader.as_ref(),
            Candidate(_) => None,
            Leader(_) => Some(&self.node_id),
        };
        (leader, &self.current_term)
    }

    pub fn log(&self) -> &L {
        self.log.log()
    }

    pub fn membership(&self) -> &Membership<NodeId> {
        &self.membership
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn peers(&self) -> &BTreeSet<NodeId> {
        &self.peers
    }

    pub fn replication_state(&self, peer_node_id: &NodeId) -> Option<&ReplicationState> {
        if let Leader(leader_state) = &self.leadership {
            leader_state.followers.get(peer_node_id)
        } else {
            None
        }
    }

    pub fn take_committed(&mut self) -> CommittedIter<'_, L> {
        self.log.take_committed()
    }

    /// Replaces the group configuration.
    ///
    /// Called once a configuration entry has been applied. A leader starts or stops replicating to the nodes added or
    /// removed, and steps down if it is no longer a voter. A node that is not a voter stops campaigning.
    pub fn reconfigure(&mut self, membership: Membership<NodeId>) {
        if membership == self.membership {
            return;
        }
        info!("reconfigured at {} to {}", &self.current_term, &membership);
        self.peers = peers_of(&self.node_id, &membership);
        self.membership = membership;

        let voter = self.is_voter();
        let next_idx = self.log.last_index() + 1;
        let mut step_down = false;
        match &mut self.leadership {
            Leader(leader_state) if voter => {
                let peers = &self.peers;
                leader_state.followers.retain(|id, _| peers.contains(id));
                for peer in peers {
                    if !leader_state.followers.contains_key(peer) {
                        info!("replicating to new member {} from {}", peer, &next_idx);
                        leader_state
                            .followers
                            .insert(peer.clone(), ReplicationState::new(next_idx));
                    }
                }
            }
            Candidate(candidate_state) if voter => {
                let voters = &self.membership.voters;
                candidate_state.votes_granted.retain(|id| voters.contains(id));
            }
            Leader(_) | Candidate(_) => step_down = true,
            Follower(_) => {}
        }

        if step_down {
            info!("stepping down at {}, no longer a voter", &self.current_term);
            let random_election_ticks = self.random_election_timeout();
            self.leadership = Follower(FollowerState {
                leader: None,
                election_ticks: random_election_ticks,
                random_election_ticks,
            });
        }
        self.become_leader();
        self.advance_commit_idx();
    }

    pub fn timer_tick(&mut self) -> Option<SendableMessage<NodeId>> {
        let voter = self.is_voter();
        match &mut self.leadership {
            Follower(FollowerState { election_ticks, .. }) | Candidate(CandidateState { election_ticks, .. }) => {
                if !voter {
                    return None;
                }
                match election_ticks.saturating_sub(1) {
                    0 => {
                        info!("election timeout at {}", &self.current_term);
                        self.timeout()
                    }
                    new_election_ticks => {
                        *election_ticks = new_election_ticks;
                        None
                    }
                }
            }
            Leader(leader_state) => {
                let inflight_timeout_ticks = self.config.election_timeout_ticks;
                for (peer, replication) in leader_state.followers.iter_mut() {
                    if replication.inflight.is_none() {
                        continue;
                    }
                    replication.inflight_ticks += 1;
                    if replication.inflight_ticks >= inflight_timeout_ticks {
                        debug!("append to {} unacknowledged, probing again", peer);
                        replication.inflight = None;
                        replication.inflight_ticks = 0;
                        replication.send_probe = true;
                        replication.send_heartbeat = true;
                    }
                }

                match leader_state.heartbeat_ticks.saturating_sub(1) {
                    0 => {
                        leader_state.heartbeat_ticks = self.config.heartbeat_interval_ticks;
                        verbose!("sending heartbeat");
                        for replication in leader_state.followers.values_mut() {
                            replication.send_heartbeat = true;
                        }
                    }
                    new_heartbeat_ticks => {
                        leader_state.heartbeat_ticks = new_heartbeat_ticks;
                    }
                }
                None
            }
        }
    }

    /// Starts a new election. Does nothing on a leader or on a node which is not a voter.
    pub fn timeout(&mut self) -> Option<SendableMessage<NodeId>> {
        // Timeout(i)
        if self.is_leader() || !self.is_voter() {
            return None;
        }
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        let election_ticks = self.random_election_timeout();
        self.leadership = Candidate(CandidateState {
            votes_granted: iter::once(self.node_id.clone()).collect(),
            election_ticks,
        });

        info!("became candidate at {}", &self.current_term);
        self.become_leader();
        self.advance_commit_idx();
        self.request_vote().map(|message| SendableMessage {
            message,
            dest: MessageDestination::Broadcast,
        })
    }

    // RequestVote(i, j)
    fn request_vote(&self) -> Option<Message> {
        match self.leadership {
            Candidate(_) => Some(Message {
                term: self.current_term,
                rpc: Some(Rpc::VoteRequest(VoteRequest {
                    last_log_term: self.log.last_term(),
                    last_log_idx: self.log.last_index(),
                })),
            }),
            _ => None,
        }
    }

    /// Builds the next append request for `to_node_id`, if one is due.
    ///
    /// At most one request is in flight per peer. Entries are batched up to
    /// [`replication_chunk_size`](Config::replication_chunk_size) bytes, always sending at least one.
    pub fn append_entries(&mut self, to_node_id: NodeId) -> Option<SendableMessage<NodeId>> {
        // AppendEntries(i, j)
        let leader_state = match &mut self.leadership {
            Leader(leader_state) => leader_state,
            _ => return None,
        };
        let replication = leader_state.followers.get_mut(&to_node_id)?;
        let last_log_idx = self.log.last_index();
        let next_idx = replication.next_idx;
        let send_entries = last_log_idx >= next_idx && !replication.send_probe;
        if (!send_entries && !replication.send_heartbeat) || replication.inflight.is_some() {
            return None;
        }

        let prev_log_idx = next_idx - 1;
        let prev_log_term = match self.log.get_term(prev_log_idx) {
            Some(prev_log_term) => prev_log_term,
            None => {
                warn!("missing log {} to send to {}", &prev_log_idx, &to_node_id);
                return None;
            }
        };

        let mut entries: Vec<LogEntry> = Vec::new();
        if send_entries {
            let mut entries_size = 0usize;
            let max_entries_size = self.config.replication_chunk_size;
            let mut entry_log_idx = next_idx;
            while entry_log_idx <= last_log_idx {
                let log_entry = match self.log.get(entry_log_idx) {
                    Some(log_entry) => log_entry,
                    None => {
                        warn!("failed to read log {} to send to {}", &entry_log_idx, &to_node_id);
                        break;
                    }
                };
                entries_size = entries_size.saturating_add(self.log.entry_len(&log_entry));
                if !entries.is_empty() && entries_size > max_entries_size {
                    break;
                }
                entries.push(log_entry);
                entry_log_idx = entry_log_idx + 1;
            }
        }
        let last_entry = prev_log_idx + entries.len() as u64;

        replication.send_heartbeat = false;
        replication.inflight = Some(last_entry);
        replication.inflight_ticks = 0;
        Some(SendableMessage {
            message: Message {
                term: self.current_term,
                rpc: Some(Rpc::AppendRequest(AppendRequest {
                    prev_log_idx,
                    prev_log_term,
                    entries,
                    leader_commit: self.log.commit_idx.min(last_entry),
                })),
            },
            dest: MessageDestination::To(to_node_id),
        })
    }

    // BecomeLeader(i)
    fn become_leader(&mut self) {
        let candidate_state = match &self.leadership {
            Candidate(candidate_state) => candidate_state,
            _ => return,
        };
        let votes = (candidate_state.votes_granted.iter())
            .filter(|id| self.membership.is_voter(id))
            .count();
        if votes < self.membership.quorum_size() {
            return;
        }

        info!("became leader at {}", &self.current_term);
        let next_idx = self.log.last_index() + 1;
        self.leadership = Leader(LeaderState {
            followers: (self.peers.iter().cloned())
                .map(|id| (id, ReplicationState::new(next_idx)))
                .collect(),
            heartbeat_ticks: 0,
        });
        // a noop in the new term commits entries left over from previous terms (Raft section 5.4.2)
        let _ignore = self.client_request(Bytes::new());
    }

    // ClientRequest(i, v)
    pub fn client_request(&mut self, data: Bytes) -> Result<(), AppendError<L::Error>> {
        if !self.is_leader() {
            return Err(AppendError::Cancelled { data });
        }
        let entry = LogEntry {
            term: self.current_term,
            data,
        };
        self.log.append(entry).map_err(AppendError::LogErr)?;
        self.advance_commit_idx();
        Ok(())
    }

    // AdvanceCommitIndex(i)
    //
    // The commit index moves to the highest index stored by a quorum of voters, but only when that entry belongs to
    // the current term. Learner acknowledgements are ignored.
    fn advance_commit_idx(&mut self) {
        let leader_state = match &self.leadership {
            Leader(leader_state) => leader_state,
            _ => return,
        };
        let voters = &self.membership.voters;
        let own_idx = Some(self.log.last_index()).filter(|_| voters.contains(&self.node_id));
        let mut match_idxs: Vec<LogIndex> = (leader_state.followers.iter())
            .filter(|(id, _)| voters.contains(*id))
            .map(|(_, replication)| replication.match_idx)
            .chain(own_idx)
            .collect();
        match_idxs.sort_unstable();
        let agree_idx = match match_idxs.into_iter().rev().nth(self.membership.quorum_size() - 1) {
            Some(agree_idx) if agree_idx > self.log.commit_idx => agree_idx,
            _ => return,
        };
        if self.log.get_term(agree_idx) == Some(self.current_term) {
            debug!("committed entries from {} to {}", &self.log.commit_idx, &agree_idx);
            self.log.commit_idx = agree_idx;
        }
    }

    // HandleRequestVoteRequest(i, j, m)
    fn handle_vote_request(
        &mut self,
        msg_term: TermId,
        msg: VoteRequest,
        from: NodeId,
    ) -> Option<SendableMessage<NodeId>> {
        assert!(msg_term <= self.current_term);
        let last_log_idx = self.log.last_index();
        let last_log_term = self.log.last_term();
        let log_ok = (msg.last_log_term, msg.last_log_idx) >= (last_log_term, last_log_idx);
        let grant = msg_term == self.current_term
            && log_ok
            && self.voted_for.as_ref().map(|vote| &from == vote).unwrap_or(true);

        if grant {
            self.voted_for = Some(from.clone());
            info!(
                "granted vote at {} with {} at {} for node {} with {} at {}",
                &self.current_term, &last_log_idx, &last_log_term, &from, &msg.last_log_idx, &msg.last_log_term
            );
            if let Follower(follower_state) = &mut self.leadership {
                follower_state.election_ticks = follower_state.random_election_ticks;
            }
        } else if msg_term != self.current_term {
            info!("ignored message with {} < current {}: {}", &msg_term, &self.current_term, &msg);
        } else if let Some(vote) = &self.voted_for {
            info!(
                "rejected vote at {} for node {} as already voted for {}",
                &self.current_term, &from, vote
            );
        } else {
            info!(
                "rejected vote at {} with {} at {} for node {} with {} at {}",
                &self.current_term, &last_log_idx, &last_log_term, &from, &msg.last_log_idx, &msg.last_log_term
            );
        }

        Some(SendableMessage {
            message: Message {
                term: self.current_term,
                rpc: Some(Rpc::VoteResponse(VoteResponse { vote_granted: grant })),
            },
            dest: MessageDestination::To(from),
        })
    }

    // HandleRequestVoteResponse(i, j, m)
    fn handle_vote_response(
        &mut self,
        msg_term: TermId,
        msg: VoteResponse,
        from: NodeId,
    ) -> Option<SendableMessage<NodeId>> {
        assert!(msg_term == self.current_term);
        let voter = self.membership.is_voter(&from);
        if let Candidate(candidate_state) = &mut self.leadership {
            if msg.vote_granted && voter {
                info!("received vote granted from {} at {}", &from, &self.current_term);
                candidate_state.votes_granted.insert(from);
            } else if msg.vote_granted {
                info!("ignored vote from non-voter {} at {}", &from, &self.current_term);
            } else {
                info!("received vote rejected from {} at {}", &from, &self.current_term);
            }
        }
        None
    }

    // HandleAppendEntriesRequest(i, j, m)
    fn handle_append_request(
        &mut self,
        msg_term: TermId,
        msg: AppendRequest,
        from: NodeId,
    ) -> Option<SendableMessage<NodeId>> {
        assert!(msg_term <= self.current_term);
        if msg_term < self.current_term {
            info!("ignored message with {} < current {}: {}", &msg_term, &self.current_term, &msg);
            return Some(self.append_response(false, LogIndex::default(), from));
        }

        // return to follower state
        match &mut self.leadership {
            Candidate(_) => {
                let random_election_ticks = self.random_election_timeout();
                self.leadership = Follower(FollowerState {
                    leader: Some(from.clone()),
                    election_ticks: random_election_ticks,
                    random_election_ticks,
                });
                info!("became follower at {} of {}", &self.current_term, &from);
            }
            Follower(follower_state) => {
                if follower_state.leader.is_none() {
                    info!("became follower at {} of {}", &self.current_term, &from);
                }
                follower_state.leader = Some(from.clone());
                follower_state.election_ticks = follower_state.random_election_ticks;
            }
            Leader(_) => {
                panic!(
                    "received append request as leader at {} from {}",
                    &self.current_term, &from
                );
            }
        }
        assert_match!(Follower(_) = &self.leadership);

        let AppendRequest {
            prev_log_idx,
            prev_log_term,
            leader_commit,
            entries,
        } = msg;
        match self.log.append_after(prev_log_idx, prev_log_term, entries) {
            Ok(last_matched_idx) => {
                let leader_commit = leader_commit.min(last_matched_idx);
                if leader_commit > self.log.commit_idx {
                    debug!("committed entries from {} to {}", &self.log.commit_idx, &leader_commit);
                    self.log.commit_idx = leader_commit;
                }
                Some(self.append_response(true, last_matched_idx, from))
            }
            Err(conflict @ LogConflict { our_term: Some(_), .. }) => {
                warn!("rejected append from {} with {}: {}", &from, &prev_log_term, &conflict);
                Some(self.append_response(false, LogIndex::default(), from))
            }
            Err(conflict) => {
                verbose!(
                    "rejected append from {}: {}, we are behind at {}",
                    &from,
                    &conflict,
                    self.log.last_index()
                );
                Some(self.append_response(false, LogIndex::default(), from))
            }
        }
    }

    fn append_response(&self, success: bool, match_idx: LogIndex, to: NodeId) -> SendableMessage<NodeId> {
        SendableMessage {
            message: Message {
                term: self.current_term,
                rpc: Some(Rpc::AppendResponse(AppendResponse {
                    success,
                    match_idx,
                    last_log_idx: self.log.last_index(),
                })),
            },
            dest: MessageDestination::To(to),
        }
    }

    // HandleAppendEntriesResponse(i, j, m)
    fn handle_append_response(
        &mut self,
        msg_term: TermId,
        msg: AppendResponse,
        from: NodeId,
    ) -> Option<SendableMessage<NodeId>> {
        assert!(msg_term == self.current_term);
        let leader_state = match &mut self.leadership {
            Leader(leader_state) => leader_state,
            _ => return None,
        };
        let replication = leader_state.followers.get_mut(&from)?;
        if msg.success {
            if Some(msg.match_idx) >= replication.inflight {
                replication.inflight = None;
            }
            if msg.match_idx + 1 > replication.next_idx {
                replication.next_idx = msg.match_idx + 1;
            }
            if msg.match_idx > replication.match_idx {
                replication.match_idx = msg.match_idx;
            }
            replication.send_probe = false;
            return None;
        }

        if replication.send_probe {
            verbose!(
                "received append rejection at {} from {} having {}",
                &replication.next_idx,
                &from,
                &msg.last_log_idx
            );
        } else {
            info!(
                "received append rejection at {} from {} having {}",
                &replication.next_idx, &from, &msg.last_log_idx
            );
        }
        replication.next_idx = (replication.next_idx - 1)
            .min(msg.last_log_idx + 1)
            .max(replication.match_idx + 1);
        replication.send_probe = true;
        replication.inflight = None;

        // skip back a whole chunk at a time while the follower is far behind
        let mut chunk_size_remaining = self.config.replication_chunk_size;
        while let Some(next_idx) = replication.next_idx.checked_sub(1) {
            if next_idx <= replication.match_idx {
                break;
            }
            let entry_len = match self.log.get_len(replication.next_idx) {
                Some(entry_len) => entry_len,
                None => break,
            };
            chunk_size_remaining = match chunk_size_remaining.checked_sub(entry_len) {
                Some(remaining) => remaining,
                None => break,
            };
            replication.next_idx = next_idx;
        }
        None
    }

    // UpdateTerm(i, j, m)
    fn update_term(&mut self, from: &NodeId, msg: &Message) {
        if msg.term <= self.current_term {
            return;
        }
        info!(
            "became follower at {} (from {}) due to message from {}: {}",
            &msg.term, &self.current_term, from, &msg
        );
        let random_election_ticks = self.random_election_timeout();
        let election_ticks = match &self.leadership {
            Follower(FollowerState { election_ticks, .. }) | Candidate(CandidateState { election_ticks, .. }) => {
                *election_ticks
            }
            Leader(_) => random_election_ticks,
        };
        self.current_term = msg.term;
        self.leadership = Follower(FollowerState {
            leader: None,
            election_ticks,
            random_election_ticks,
        });
        self.voted_for = None;
    }

    // DropStaleResponse(i, j, m)
    fn drop_stale_response<T: fmt::Display>(&self, msg_term: TermId, msg: T) -> Result<(), T> {
        if msg_term < self.current_term {
            info!("ignored message with {} < current {}: {}", &msg_term, &self.current_term, &msg);
            Ok(())
        } else {
            Err(msg)
        }
    }

    /// Processes a message from `from`.
    ///
    /// Messages from nodes outside the configuration are accepted, since a node that has just been added does not
    /// know its group yet. Vote requests are the exception: they are dropped unless the candidate is a voter, so a
    /// removed node cannot disrupt the group by raising its term.
    pub fn receive(&mut self, msg: Message, from: NodeId) -> Option<SendableMessage<NodeId>> {
        // Receive(m)
        if let Some(Rpc::VoteRequest(_)) = &msg.rpc {
            if !self.membership.is_voter(&from) {
                info!("ignored vote request from non-voter {}: {}", &from, &msg);
                return None;
            }
        }
        self.update_term(&from, &msg);
        let reply = match msg.rpc {
            Some(Rpc::VoteRequest(request)) => self.handle_vote_request(msg.term, request, from),
            Some(Rpc::VoteResponse(response)) => match self.drop_stale_response(msg.term, response) {
                Ok(()) => None,
                Err(response) => self.handle_vote_response(msg.term, response, from),
            },
            Some(Rpc::AppendRequest(request)) => self.handle_append_request(msg.term, request, from),
            Some(Rpc::AppendResponse(response)) => match self.drop_stale_response(msg.term, response) {
                Ok(()) => None,
                Err(response) => self.handle_append_response(msg.term, response, from),
            },
            None => None,
        };
        self.become_leader();
        self.advance_commit_idx();
        reply
    }

    fn random_election_timeout(&mut self) -> u32 {
        random_election_timeout(&mut self.random, self.config.election_timeout_ticks)
    }
}

fn peers_of<NodeId: Ord + Clone>(node_id: &NodeId, membership: &Membership<NodeId>) -> BTreeSet<NodeId> {
    (membership.replicas())
        .filter(|id| *id != node_id)
        .cloned()
        .collect()
}

fn random_election_timeout(random: &mut impl RngCore, election_timeout_ticks: u32) -> u32 {
    let random = random.next_u32().checked_rem(election_timeout_ticks).unwrap_or(0);
    election_timeout_ticks.saturating_add(random)
}
