//! Replica driver for a single shard.
//!
//! This file contains the role machinery (leader/follower/candidate/learner),
//! the tick counters, and the ready/dispatch surface. The driver never does
//! I/O: storage, apply, and transport work is requested through messages
//! drained from `Ready` and acknowledged back through `step`.

use std::collections::HashMap;

use rand::Rng;

use super::log::ReplicaLog;
use super::types::{
    Entry, HardState, Message, MessageKind, ReplicaConfig, ReplicaError, ReplicaOptions, Role,
    SpeedLevel, Status, SyncInfo, ALL_NODES, NO_NODE,
};

/// Work produced by one readiness pass: an optional hard-state change plus
/// the messages to dispatch.
#[derive(Debug, Default)]
pub struct Ready {
    pub hard_state: Option<HardState>,
    pub messages: Vec<Message>,
}

pub struct Replica {
    pub(super) opts: ReplicaOptions,
    pub(super) node_id: u64,
    pub(super) cfg: ReplicaConfig,
    pub(super) log: ReplicaLog,
    pub(super) msgs: Vec<Message>,

    pub(super) role: Role,
    pub(super) status: Status,
    pub(super) leader: u64,
    pub(super) term: u32,

    pub(super) speed_level: SpeedLevel,
    pub(super) sync_interval_tick: u64,
    pub(super) sync_tick: u64,
    pub(super) syncing: bool,
    pub(super) log_conflict_check_tick: u64,

    /// Replica ids of the shard excluding the local node.
    pub(super) peers: Vec<u64>,
    /// Per-replica sync progress; leader only.
    pub(super) last_sync_info: HashMap<u64, SyncInfo>,

    pub(super) stop_propose: bool,
    pub(super) is_role_transitioning: bool,
    pub(super) role_transition_tick: u64,
    pub(super) transfer_target: Option<u64>,

    pub(super) election_elapsed: u64,
    pub(super) heartbeat_elapsed: u64,
    pub(super) randomized_election_timeout: u64,
    pub(super) vote_for: u64,
    pub(super) votes: HashMap<u64, bool>,

    pre_hard_state: HardState,
}

impl Replica {
    pub fn new(opts: ReplicaOptions) -> Self {
        let node_id = opts.node_id;
        let mut replica = Self {
            node_id,
            cfg: ReplicaConfig::default(),
            log: ReplicaLog::new(),
            msgs: Vec::new(),
            role: Role::Unknown,
            status: Status::Uninitialized,
            leader: NO_NODE,
            term: 0,
            speed_level: SpeedLevel::Fast,
            sync_interval_tick: opts.sync_interval_tick,
            sync_tick: 0,
            syncing: false,
            log_conflict_check_tick: opts.request_timeout_tick,
            peers: Vec::new(),
            last_sync_info: HashMap::new(),
            stop_propose: false,
            is_role_transitioning: false,
            role_transition_tick: 0,
            transfer_target: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            vote_for: NO_NODE,
            votes: HashMap::new(),
            pre_hard_state: HardState::default(),
            opts,
        };
        replica.reset_randomized_election_timeout();
        replica
    }

    // ---------------------------------------------------------------- state

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader_id(&self) -> u64 {
        self.leader
    }

    pub fn term(&self) -> u32 {
        self.term
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.cfg
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_log_index
    }

    pub fn committed_index(&self) -> u64 {
        self.log.committed_index
    }

    pub fn applied_index(&self) -> u64 {
        self.log.applied_index
    }

    pub fn speed_level(&self) -> SpeedLevel {
        self.speed_level
    }

    /// Last log index a replica is known to hold (leader-side view).
    pub fn replica_last_log(&self, replica_id: u64) -> u64 {
        if replica_id == self.node_id {
            return self.log.last_log_index;
        }
        match self.last_sync_info.get(&replica_id) {
            Some(info) if info.last_sync_index > 0 => info.last_sync_index - 1,
            _ => 0,
        }
    }

    pub(super) fn is_single_node(&self) -> bool {
        self.peers.is_empty()
    }

    pub(super) fn quorum(&self) -> usize {
        if self.cfg.replicas.is_empty() {
            1
        } else {
            self.cfg.quorum()
        }
    }

    // ------------------------------------------------------------- proposal

    /// Propose one payload. Returns the index the entry was appended at.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<u64, ReplicaError> {
        self.propose_all(vec![data]).map(|(_, last)| last)
    }

    /// Propose a batch; returns the (first, last) appended index pair.
    pub fn propose_all(&mut self, batch: Vec<Vec<u8>>) -> Result<(u64, u64), ReplicaError> {
        if batch.is_empty() {
            let last = self.log.last_log_index;
            return Ok((last, last));
        }
        let count = batch.len() as u64;
        let entries = batch
            .into_iter()
            .map(|data| Entry {
                index: 0,
                term: 0,
                data,
            })
            .collect();
        self.step(Message {
            kind: MessageKind::Propose,
            from: self.node_id,
            term: self.term,
            entries,
            ..Default::default()
        })?;
        let last = self.log.last_log_index;
        Ok((last - count + 1, last))
    }

    // ------------------------------------------------------------ readiness

    fn hard_state_changed(&self) -> bool {
        self.pre_hard_state.leader_id != self.leader
            || self.pre_hard_state.term != self.term
            || self.pre_hard_state.conf_version != self.cfg.version
    }

    pub fn has_ready(&self) -> bool {
        let is_follower = matches!(self.role, Role::Follower | Role::Learner);
        if self.status != Status::Ready {
            if self.status == Status::Uninitialized {
                return true;
            }
            if self.status == Status::LogConflictCheck && is_follower {
                return self.leader != NO_NODE
                    && self.log_conflict_check_tick >= self.opts.request_timeout_tick;
            }
            return !self.msgs.is_empty() || self.hard_state_changed();
        }

        if is_follower
            && self.leader != NO_NODE
            && self.sync_tick >= self.sync_interval_tick
            && !self.syncing
        {
            return true;
        }
        if self.log.has_storage() || self.log.has_apply() {
            return true;
        }
        !self.msgs.is_empty() || self.hard_state_changed()
    }

    pub fn ready(&mut self) -> Ready {
        let mut rd = Ready::default();

        if self.status == Status::Uninitialized {
            self.status = Status::Initing;
            let msg = self.new_message(MessageKind::Init, self.node_id);
            self.send(msg);
            rd.messages = std::mem::take(&mut self.msgs);
            return rd;
        }

        if self.hard_state_changed() {
            let hs = HardState {
                leader_id: self.leader,
                term: self.term,
                conf_version: self.cfg.version,
            };
            rd.hard_state = Some(hs);
            self.pre_hard_state = hs;
        }

        let is_follower = matches!(self.role, Role::Follower | Role::Learner);

        if self.status == Status::LogConflictCheck {
            if is_follower
                && self.leader != NO_NODE
                && self.log_conflict_check_tick >= self.opts.request_timeout_tick
            {
                self.log_conflict_check_tick = 0;
                let msg = self.new_log_conflict_check();
                self.send(msg);
            }
            rd.messages = std::mem::take(&mut self.msgs);
            return rd;
        }

        if self.status != Status::Ready {
            rd.messages = std::mem::take(&mut self.msgs);
            return rd;
        }

        if is_follower
            && self.leader != NO_NODE
            && self.sync_tick >= self.sync_interval_tick
            && !self.syncing
        {
            self.sync_tick = 0;
            self.syncing = true;
            let msg = self.new_sync_req();
            self.send(msg);
        }

        if self.log.has_storage() {
            let entries = self.log.next_storage_entries();
            if !entries.is_empty() {
                self.log.storaging = true;
                let last = entries.last().map(|e| e.index).unwrap_or(0);
                let mut msg = self.new_message(MessageKind::StoreAppend, self.node_id);
                msg.index = last;
                msg.entries = entries;
                self.send(msg);
            }
        }

        if self.log.has_apply() {
            self.log.applying = true;
            let commit = self.log.committed_index.min(self.log.storaged_index);
            let mut msg = self.new_message(MessageKind::ApplyLogs, self.node_id);
            msg.index = self.log.applying_index;
            msg.applied_index = self.log.applied_index;
            msg.committed_index = commit;
            self.log.applying_index = commit;
            self.send(msg);
        }

        rd.messages = std::mem::take(&mut self.msgs);
        rd
    }

    // ----------------------------------------------------------------- tick

    pub fn tick(&mut self) {
        if matches!(self.role, Role::Follower | Role::Learner) {
            if self.status == Status::Ready {
                self.sync_tick += 1;
                if self.syncing && self.sync_tick > self.sync_interval_tick * 5 {
                    // Sync round went unanswered; clear and rearm.
                    let msg = self.new_message(MessageKind::SyncTimeout, self.node_id);
                    self.send(msg);
                    self.syncing = false;
                    self.sync_tick = 0;
                }
            } else if self.status == Status::LogConflictCheck {
                self.log_conflict_check_tick += 1;
            }
        }

        match self.role {
            Role::Leader => self.tick_heartbeat(),
            Role::Follower | Role::Candidate => self.tick_election(),
            _ => {}
        }
    }

    fn tick_election(&mut self) {
        if !self.opts.election_on {
            return;
        }
        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_timeout {
            self.election_elapsed = 0;
            let _ = self.step(Message {
                kind: MessageKind::Hup,
                ..Default::default()
            });
        }
    }

    fn tick_heartbeat(&mut self) {
        if self.is_role_transitioning {
            self.role_transition_tick += 1;
            if self.role_transition_tick >= self.opts.learner_to_timeout_tick {
                self.is_role_transitioning = false;
                self.role_transition_tick = 0;
                self.stop_propose = false;
                self.transfer_target = None;
            }
        }

        if self.opts.election_on {
            self.heartbeat_elapsed += 1;
            self.election_elapsed += 1;
            if self.election_elapsed >= self.opts.election_interval_tick {
                self.election_elapsed = 0;
            }
            if self.heartbeat_elapsed >= self.opts.heartbeat_interval_tick {
                self.heartbeat_elapsed = 0;
                let _ = self.step(Message {
                    kind: MessageKind::Beat,
                    from: self.node_id,
                    to: ALL_NODES,
                    ..Default::default()
                });
            }
        } else {
            // Ping replicas that have gone quiet so appointed-leader shards
            // still advertise leadership and commit progress.
            let mut quiet = Vec::new();
            for (id, info) in self.last_sync_info.iter_mut() {
                info.sync_tick += 1;
                if info.sync_tick >= self.sync_interval_tick.max(1) * 4 {
                    info.sync_tick = 0;
                    quiet.push(*id);
                }
            }
            for id in quiet {
                let _ = self.step(Message {
                    kind: MessageKind::Beat,
                    from: self.node_id,
                    to: id,
                    ..Default::default()
                });
            }
        }
    }

    // ------------------------------------------------------- role switching

    /// Adopt a new shard configuration. Stale versions are ignored.
    pub fn switch_config(&mut self, cfg: ReplicaConfig) {
        if self.cfg.version > cfg.version {
            return;
        }
        self.cfg = cfg.clone();

        let mut term = if self.term == 0 { 1 } else { self.term };
        if cfg.term > term {
            term = cfg.term;
        }

        if cfg.is_learner(self.node_id) {
            if self.role != Role::Learner
                || term > self.term
                || (cfg.leader != NO_NODE && self.leader != cfg.leader)
            {
                self.become_learner(term, cfg.leader);
            }
        } else {
            match cfg.role {
                Role::Leader => {
                    if self.role != Role::Leader || term > self.term {
                        self.become_leader(term);
                    }
                }
                Role::Follower => {
                    if self.role != Role::Follower
                        || term > self.term
                        || (cfg.leader != NO_NODE && self.leader != cfg.leader)
                    {
                        self.become_follower(term, cfg.leader);
                    }
                }
                Role::Candidate => {
                    if self.role != Role::Candidate || term > self.term {
                        self.become_candidate_with_term(term);
                    }
                }
                Role::Unknown => {
                    if cfg.leader == self.node_id {
                        if self.role != Role::Leader || term > self.term {
                            self.become_leader(term);
                        }
                    } else if cfg.leader != NO_NODE {
                        if self.role != Role::Follower
                            || term > self.term
                            || self.leader != cfg.leader
                        {
                            self.become_follower(term, cfg.leader);
                        }
                    } else if self.role == Role::Learner {
                        self.become_follower(term, self.leader);
                    }
                }
                Role::Learner => {}
            }
        }

        self.init_leader_info();

        if self.opts.election_on {
            if self.is_single_node() {
                if self.role == Role::Unknown {
                    self.become_leader(term);
                }
            } else if self.role == Role::Unknown {
                self.become_candidate_with_term(term + 1);
            }
        }
    }

    pub(super) fn init_leader_info(&mut self) {
        self.is_role_transitioning = false;
        self.role_transition_tick = 0;
        self.stop_propose = false;
        self.transfer_target = None;

        self.peers = self
            .cfg
            .replicas
            .iter()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect();

        self.last_sync_info.clear();
        if self.is_leader() {
            for id in self.peers.clone() {
                self.last_sync_info.insert(id, SyncInfo::default());
            }
            for id in self.cfg.learners.clone() {
                if id != self.node_id {
                    self.last_sync_info.insert(id, SyncInfo::default());
                }
            }
        }
    }

    pub(super) fn become_leader(&mut self, term: u32) {
        self.reset(term);
        self.term = term;
        self.leader = self.node_id;
        self.role = Role::Leader;
        self.init_leader_info();
        tracing::info!(shard = %self.opts.shard, term = self.term, "become leader");
    }

    pub(super) fn become_follower(&mut self, term: u32, leader: u64) {
        self.reset(term);
        self.term = term;
        self.leader = leader;
        self.role = Role::Follower;
        tracing::debug!(shard = %self.opts.shard, term, leader, "become follower");
        if self.log.last_log_index > 0 && self.leader != NO_NODE {
            self.status = Status::LogConflictCheck;
            self.log_conflict_check_tick = self.opts.request_timeout_tick;
        }
    }

    pub(super) fn become_learner(&mut self, term: u32, leader: u64) {
        self.reset(term);
        self.term = term;
        self.leader = leader;
        self.role = Role::Learner;
        tracing::info!(shard = %self.opts.shard, term, leader, "become learner");
        if self.log.last_log_index > 0 && self.leader != NO_NODE {
            self.status = Status::LogConflictCheck;
            self.log_conflict_check_tick = self.opts.request_timeout_tick;
        }
    }

    pub(super) fn become_candidate(&mut self) {
        self.become_candidate_with_term(self.term + 1);
    }

    pub(super) fn become_candidate_with_term(&mut self, term: u32) {
        debug_assert!(self.role != Role::Leader, "invalid transition leader -> candidate");
        self.reset(term);
        self.term = term;
        self.vote_for = self.node_id;
        self.leader = NO_NODE;
        self.role = Role::Candidate;
        tracing::info!(shard = %self.opts.shard, term = self.term, "become candidate");
    }

    fn reset(&mut self, term: u32) {
        self.term = term;
        self.vote_for = NO_NODE;
        self.votes.clear();
        self.stop_propose = false;
        self.is_role_transitioning = false;
        self.role_transition_tick = 0;
        self.transfer_target = None;
        self.leader = NO_NODE;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.syncing = false;
        self.sync_tick = 0;
        self.set_speed_level(SpeedLevel::Fast);
        self.reset_randomized_election_timeout();
        self.log.storaging = false;
        self.log.applying = false;
        if self.status == Status::LogConflictCheck {
            self.status = Status::Ready;
        }
    }

    pub(super) fn campaign(&mut self) {
        self.become_candidate();
        // Local vote is recorded directly; peers get a VoteReq.
        self.votes.insert(self.node_id, true);
        if self.granted_votes() >= self.quorum() {
            let term = self.term;
            self.become_leader(term);
            return;
        }
        let (last_index, last_term) = self.log.last_index_and_term();
        for peer in self.peers.clone() {
            tracing::info!(shard = %self.opts.shard, to = peer, term = self.term, "request vote");
            let mut msg = self.new_message(MessageKind::VoteReq, peer);
            msg.index = last_index;
            msg.entries = vec![Entry {
                index: last_index,
                term: last_term,
                data: Vec::new(),
            }];
            self.send(msg);
        }
    }

    pub(super) fn granted_votes(&self) -> usize {
        self.votes.values().filter(|granted| **granted).count()
    }

    pub(super) fn rejected_votes(&self) -> usize {
        self.votes.values().filter(|granted| !**granted).count()
    }

    fn reset_randomized_election_timeout(&mut self) {
        let base = self.opts.election_interval_tick.max(1);
        self.randomized_election_timeout = base + rand::thread_rng().gen_range(0..base);
    }

    // ---------------------------------------------------------- speed level

    pub fn set_speed_level(&mut self, level: SpeedLevel) {
        self.sync_interval_tick = self.opts.sync_interval_tick.max(1) * level.factor();
        if level != self.speed_level {
            let mut msg = self.new_message(MessageKind::SpeedLevelChange, self.node_id);
            msg.speed_level = level;
            self.send(msg);
        }
        self.speed_level = level;
    }

    // --------------------------------------------------------------- commit

    /// Advance the commit index to the highest entry a quorum holds. The
    /// local node counts through its durable cursor, peers through their
    /// reported sync progress; learners never count.
    pub(super) fn maybe_commit(&mut self) {
        if !self.is_leader() {
            return;
        }
        let voters = if self.cfg.replicas.is_empty() {
            vec![self.node_id]
        } else {
            self.cfg.replicas.clone()
        };
        let mut matches: Vec<u64> = voters
            .iter()
            .map(|id| {
                if *id == self.node_id {
                    self.log.storaged_index
                } else {
                    self.last_sync_info
                        .get(id)
                        .map(|info| info.last_sync_index.saturating_sub(1))
                        .unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.quorum() - 1];
        if candidate > self.log.committed_index {
            self.log.commit_to(candidate);
        }
    }

    // ------------------------------------------------------------- messages

    pub(super) fn send(&mut self, msg: Message) {
        self.msgs.push(msg);
    }

    pub(super) fn new_message(&self, kind: MessageKind, to: u64) -> Message {
        Message {
            kind,
            from: self.node_id,
            to,
            term: self.term,
            ..Default::default()
        }
    }

    pub(super) fn new_sync_req(&self) -> Message {
        let mut msg = self.new_message(MessageKind::SyncReq, self.leader);
        msg.index = self.log.last_log_index + 1;
        msg
    }

    pub(super) fn new_sync_resp(&self, to: u64, index: u64, entries: Vec<Entry>) -> Message {
        let mut msg = self.new_message(MessageKind::SyncResp, to);
        msg.index = index;
        msg.entries = entries;
        msg.committed_index = self.log.committed_index;
        msg.speed_level = self.speed_level;
        msg
    }

    pub(super) fn new_log_conflict_check(&self) -> Message {
        let (last_index, last_term) = self.log.last_index_and_term();
        let mut msg = self.new_message(MessageKind::LogConflictCheck, self.leader);
        msg.index = last_index;
        msg.entries = vec![Entry {
            index: last_index,
            term: last_term,
            data: Vec::new(),
        }];
        msg
    }

    pub(super) fn new_ping(&self, to: u64) -> Message {
        let mut msg = self.new_message(MessageKind::Ping, to);
        msg.index = self.log.last_log_index;
        msg.committed_index = self.log.committed_index;
        msg.speed_level = self.speed_level;
        msg.conf_version = self.cfg.version;
        msg
    }

    pub(super) fn send_ping(&mut self, to: u64) {
        if !self.is_leader() {
            return;
        }
        if to != ALL_NODES {
            let msg = self.new_ping(to);
            self.send(msg);
            return;
        }
        for peer in self.peers.clone() {
            let msg = self.new_ping(peer);
            self.send(msg);
        }
        for learner in self.cfg.learners.clone() {
            if learner != self.node_id {
                let msg = self.new_ping(learner);
                self.send(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::*;
    use super::*;

    fn new_replica(node_id: u64, replicas: Vec<u64>, election_on: bool) -> Replica {
        let mut r = Replica::new(ReplicaOptions {
            node_id,
            shard: format!("test-{node_id}"),
            election_on,
            ..Default::default()
        });
        // Drive through init so the instance is usable.
        let rd = r.ready();
        assert!(rd.messages.iter().any(|m| m.kind == MessageKind::Init));
        r.step(Message {
            kind: MessageKind::InitResp,
            from: node_id,
            to: node_id,
            index: 0,
            applied_index: 0,
            entries: vec![Entry::default()],
            config: Some(ReplicaConfig {
                version: 1,
                replicas,
                leader: NO_NODE,
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap();
        r
    }

    #[test]
    fn single_node_with_election_becomes_leader() {
        let r = new_replica(1, vec![1], true);
        assert_eq!(r.role(), Role::Leader);
        assert_eq!(r.leader_id(), 1);
    }

    #[test]
    fn single_node_propose_commits_after_storage_ack() {
        let mut r = new_replica(1, vec![1], true);
        let index = r.propose(b"hello".to_vec()).unwrap();
        assert_eq!(index, 1);

        let rd = r.ready();
        let store = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::StoreAppend)
            .expect("store append emitted");
        assert_eq!(store.entries.len(), 1);

        r.step(Message {
            kind: MessageKind::StoreAppendResp,
            from: 1,
            to: 1,
            index: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(r.committed_index(), 1);

        let rd = r.ready();
        assert!(rd
            .messages
            .iter()
            .any(|m| m.kind == MessageKind::ApplyLogs && m.committed_index == 1));
    }

    #[test]
    fn propose_on_follower_fails() {
        let mut r = new_replica(2, vec![1, 2], false);
        r.switch_config(ReplicaConfig {
            version: 2,
            replicas: vec![1, 2],
            leader: 1,
            term: 1,
            ..Default::default()
        });
        assert_eq!(r.role(), Role::Follower);
        assert_eq!(r.propose(b"x".to_vec()).unwrap_err(), ReplicaError::NotLeader);
    }

    #[test]
    fn appointed_leader_serves_followers() {
        let mut leader = new_replica(1, vec![1, 2], false);
        leader.switch_config(ReplicaConfig {
            version: 2,
            replicas: vec![1, 2],
            leader: 1,
            term: 1,
            ..Default::default()
        });
        assert!(leader.is_leader());

        leader.propose(b"a".to_vec()).unwrap();

        // The entry is still in the unstable tail, so a follower poll is
        // answered directly.
        leader
            .step(Message {
                kind: MessageKind::SyncReq,
                from: 2,
                to: 1,
                term: 1,
                index: 1,
                ..Default::default()
            })
            .unwrap();
        let rd = leader.ready();
        let resp = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::SyncResp)
            .expect("sync resp");
        assert_eq!(resp.to, 2);
        assert_eq!(resp.entries.len(), 1);
        let last = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::StoreAppend)
            .unwrap()
            .index;

        leader
            .step(Message {
                kind: MessageKind::StoreAppendResp,
                from: 1,
                to: 1,
                index: last,
                ..Default::default()
            })
            .unwrap();

        // Commit needs both local durability and a quorum of sync progress.
        leader
            .step(Message {
                kind: MessageKind::SyncReq,
                from: 2,
                to: 1,
                term: 1,
                index: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(leader.committed_index(), 1);

        // Entries that left the unstable tail are fetched through storage.
        leader
            .step(Message {
                kind: MessageKind::SyncReq,
                from: 2,
                to: 1,
                term: 1,
                index: 1,
                ..Default::default()
            })
            .unwrap();
        let rd = leader.ready();
        assert!(rd
            .messages
            .iter()
            .any(|m| m.kind == MessageKind::SyncGet && m.from == 2));
    }

    #[test]
    fn follower_sync_timeout_rearms() {
        let mut r = new_replica(2, vec![1, 2], false);
        r.switch_config(ReplicaConfig {
            version: 2,
            replicas: vec![1, 2],
            leader: 1,
            term: 1,
            ..Default::default()
        });
        // Fire the first sync.
        for _ in 0..r.sync_interval_tick {
            r.tick();
        }
        let rd = r.ready();
        assert!(rd.messages.iter().any(|m| m.kind == MessageKind::SyncReq));
        assert!(r.syncing);

        // No response: after 5x the interval the replica gives up and rearms.
        for _ in 0..(r.sync_interval_tick * 5 + 1) {
            r.tick();
        }
        assert!(!r.syncing);
    }
}
