//! Per-node consensus state and role transitions.

use std::collections::HashMap;

use kestrel_common::types::{LogIndex, NodeId, NodeRole, Term};

/// Replication bookkeeping the leader keeps per follower.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each follower.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each follower.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new<I: IntoIterator<Item = NodeId>>(peers: I, last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
        }
        Self {
            next_index,
            match_index,
        }
    }

    /// Track a peer that joined after this leader took over.
    pub fn ensure_peer(&mut self, peer: NodeId, last_log_index: LogIndex) {
        self.next_index.entry(peer).or_insert(last_log_index + 1);
        self.match_index.entry(peer).or_insert(0);
    }

    pub fn forget_peer(&mut self, peer: NodeId) {
        self.next_index.remove(&peer);
        self.match_index.remove(&peer);
    }

    pub fn update_match(&mut self, peer: NodeId, match_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    pub fn rewind_next(&mut self, peer: NodeId, to: LogIndex) {
        self.next_index.insert(peer, to.max(1));
    }
}

/// All of one node's consensus state apart from the log.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: NodeId,
    pub role: NodeRole,
    /// Last node observed acting as leader, for client redirection.
    pub leader_hint: Option<NodeId>,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// Present only while `role == Leader`.
    pub leader: Option<LeaderState>,
}

impl RaftState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: NodeRole::Follower,
            leader_hint: None,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied: 0,
            leader: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn become_follower(&mut self, term: Term, leader_hint: Option<NodeId>) {
        if term > self.current_term {
            self.voted_for = None;
        }
        self.role = NodeRole::Follower;
        self.current_term = term;
        self.leader_hint = leader_hint;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term,
            leader = ?leader_hint,
            "became follower"
        );
    }

    pub fn become_candidate(&mut self) {
        self.role = NodeRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.leader_hint = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.current_term,
            "became candidate"
        );
    }

    pub fn become_leader<I: IntoIterator<Item = NodeId>>(
        &mut self,
        peers: I,
        last_log_index: LogIndex,
    ) {
        self.role = NodeRole::Leader;
        self.leader_hint = Some(self.node_id);
        self.leader = Some(LeaderState::new(peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.current_term,
            "became leader"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = RaftState::new(1);
        assert_eq!(state.role, NodeRole::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.leader_hint.is_none());
        assert!(state.voted_for.is_none());
    }

    #[test]
    fn test_candidate_votes_for_self() {
        let mut state = RaftState::new(1);
        state.become_candidate();
        assert_eq!(state.role, NodeRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn test_leader_initializes_replication_state() {
        let mut state = RaftState::new(1);
        state.become_candidate();
        state.become_leader([2, 3], 5);

        assert!(state.is_leader());
        let leader = state.leader.as_ref().unwrap();
        assert_eq!(leader.next_index.get(&2), Some(&6));
        assert_eq!(leader.match_index.get(&3), Some(&0));
    }

    #[test]
    fn test_higher_term_clears_vote() {
        let mut state = RaftState::new(1);
        state.become_candidate();
        assert_eq!(state.voted_for, Some(1));

        state.become_follower(5, Some(2));
        assert_eq!(state.current_term, 5);
        assert!(state.voted_for.is_none());
        assert_eq!(state.leader_hint, Some(2));
    }

    #[test]
    fn test_same_term_step_down_keeps_vote() {
        let mut state = RaftState::new(1);
        state.become_candidate();
        let term = state.current_term;
        state.become_follower(term, Some(3));
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn test_leader_state_rewind_floor() {
        let mut leader = LeaderState::new([2], 10);
        leader.rewind_next(2, 0);
        assert_eq!(leader.next_index.get(&2), Some(&1));
        leader.update_match(2, 7);
        assert_eq!(leader.next_index.get(&2), Some(&8));
    }
}
