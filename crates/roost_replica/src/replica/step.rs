//! Role transition functions.
//!
//! Every state change is a deterministic function of `(role, message, term)`.
//! The tables are kept explicit so the protocol can be read top to bottom
//! instead of being scattered over virtual dispatch.

use super::raft::Replica;
use super::types::{
    Entry, Message, MessageKind, ReplicaError, Role, Status, SyncInfo, NO_NODE,
};

impl Replica {
    /// Feed one message through the state machine.
    pub fn step(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg.kind {
            MessageKind::Hup => {
                self.campaign();
                return Ok(());
            }
            MessageKind::InitResp => {
                self.handle_init_resp(msg);
                return Ok(());
            }
            MessageKind::ConfigChange => {
                if let Some(cfg) = msg.config {
                    self.switch_config(cfg);
                }
                return Ok(());
            }
            MessageKind::ConfigReq => {
                let mut resp = self.new_message(MessageKind::ConfigResp, msg.from);
                resp.conf_version = self.cfg.version;
                resp.config = Some(self.cfg.clone());
                self.send(resp);
                return Ok(());
            }
            MessageKind::ConfigResp => {
                if let Some(cfg) = msg.config {
                    if cfg.version > self.cfg.version {
                        self.switch_config(cfg);
                    }
                }
                return Ok(());
            }
            MessageKind::SpeedLevelChange => {
                self.set_speed_level(msg.speed_level);
                return Ok(());
            }
            MessageKind::StoreAppendResp => {
                self.log.storage_appended(msg.index);
                self.maybe_commit();
                return Ok(());
            }
            MessageKind::StoreTruncateResp => {
                return Ok(());
            }
            MessageKind::ApplyLogsResp => {
                self.log.applied_to(msg.index);
                return Ok(());
            }
            MessageKind::VoteReq => {
                self.handle_vote_request(msg);
                return Ok(());
            }
            _ => {}
        }

        // A higher term from a live peer always demotes.
        if msg.term > self.term {
            match msg.kind {
                MessageKind::Ping | MessageKind::SyncResp => {
                    self.become_follower(msg.term, msg.from);
                }
                MessageKind::Pong
                | MessageKind::SyncReq
                | MessageKind::VoteResp
                | MessageKind::LogConflictCheck => {
                    self.become_follower(msg.term, NO_NODE);
                }
                _ => {}
            }
        }

        match self.role {
            Role::Leader => self.step_leader(msg),
            Role::Follower => self.step_follower(msg),
            Role::Candidate => self.step_candidate(msg),
            Role::Learner => self.step_learner(msg),
            Role::Unknown => Ok(()),
        }
    }

    fn handle_init_resp(&mut self, msg: Message) {
        let last_term = msg.entries.first().map(|e| e.term).unwrap_or(0);
        self.log.restore(msg.index, last_term, msg.applied_index);
        self.status = Status::Ready;
        if let Some(cfg) = msg.config {
            // May demote straight into a conflict check when the restored log
            // is non-empty and a leader is already known.
            self.switch_config(cfg);
        }
        tracing::debug!(
            shard = %self.opts.shard,
            last_index = msg.index,
            applied = msg.applied_index,
            "replica initialized"
        );
    }

    fn handle_vote_request(&mut self, msg: Message) {
        if msg.term < self.term {
            let mut resp = self.new_message(MessageKind::VoteResp, msg.from);
            resp.reject = true;
            self.send(resp);
            return;
        }
        if msg.term > self.term {
            self.become_follower(msg.term, NO_NODE);
        }

        let (last_index, last_term) = self.last_index_and_term_for_vote();
        let (cand_index, cand_term) = msg
            .entries
            .first()
            .map(|e| (e.index, e.term))
            .unwrap_or((msg.index, 0));
        let up_to_date =
            cand_term > last_term || (cand_term == last_term && cand_index >= last_index);
        let can_vote = self.vote_for == NO_NODE || self.vote_for == msg.from;
        let grant = up_to_date && can_vote && self.role != Role::Leader;

        if grant {
            self.vote_for = msg.from;
            self.election_elapsed = 0;
        }
        tracing::debug!(
            shard = %self.opts.shard,
            candidate = msg.from,
            term = msg.term,
            grant,
            "vote request"
        );
        let mut resp = self.new_message(MessageKind::VoteResp, msg.from);
        resp.term = msg.term;
        resp.index = self.log.last_log_index;
        resp.reject = !grant;
        self.send(resp);
    }

    fn last_index_and_term_for_vote(&self) -> (u64, u32) {
        (self.log.last_log_index, self.log.last_log_term)
    }

    // --------------------------------------------------------------- leader

    fn step_leader(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg.kind {
            MessageKind::Propose => {
                if self.stop_propose {
                    return Err(ReplicaError::ProposeStopped);
                }
                let mut next = self.log.last_log_index + 1;
                let term = self.term;
                let entries: Vec<Entry> = msg
                    .entries
                    .into_iter()
                    .map(|mut e| {
                        e.index = next;
                        e.term = term;
                        next += 1;
                        e
                    })
                    .collect();
                self.log.append(&entries)?;
                Ok(())
            }
            MessageKind::SyncReq => {
                let from = msg.from;
                let info = self.last_sync_info.entry(from).or_insert_with(SyncInfo::default);
                info.last_sync_index = msg.index;
                info.sync_tick = 0;
                self.maybe_commit();
                self.maybe_finish_transfer(from, msg.index);

                match self
                    .log
                    .unstable_entries_from(msg.index, self.opts.max_sync_size)
                {
                    Some(entries) => {
                        let resp = self.new_sync_resp(from, msg.index, entries);
                        self.send(resp);
                    }
                    None => {
                        // The requested range left the unstable tail; ask the
                        // storage collaborator and answer on SyncGetResp.
                        let mut get = self.new_message(MessageKind::SyncGet, self.node_id);
                        get.from = from;
                        get.index = msg.index;
                        self.send(get);
                    }
                }
                Ok(())
            }
            MessageKind::SyncGetResp => {
                // `from` still names the follower that asked.
                let resp = self.new_sync_resp(msg.from, msg.index, msg.entries);
                self.send(resp);
                Ok(())
            }
            MessageKind::Beat => {
                self.send_ping(msg.to);
                Ok(())
            }
            MessageKind::Pong => {
                if let Some(info) = self.last_sync_info.get_mut(&msg.from) {
                    info.sync_tick = 0;
                }
                Ok(())
            }
            MessageKind::LogConflictCheck => {
                let (follower_index, follower_term) = msg
                    .entries
                    .first()
                    .map(|e| (e.index, e.term))
                    .unwrap_or((msg.index, 0));
                let agreed = if follower_term == self.log.last_log_term {
                    follower_index.min(self.log.last_log_index)
                } else {
                    // Terms diverged; fall back to the committed prefix,
                    // which the follower re-syncs from.
                    follower_index.min(self.log.committed_index)
                };
                let mut resp = self.new_message(MessageKind::LogConflictCheckResp, msg.from);
                resp.index = agreed;
                self.send(resp);
                Ok(())
            }
            MessageKind::LearnerToFollower => {
                self.promote_learner(msg.transfer_to, false);
                Ok(())
            }
            MessageKind::LearnerToLeader | MessageKind::FollowerToLeader => {
                self.begin_leader_transfer(msg.transfer_to);
                Ok(())
            }
            MessageKind::SyncTimeout | MessageKind::Ping | MessageKind::SyncResp => Ok(()),
            _ => Ok(()),
        }
    }

    fn promote_learner(&mut self, learner: u64, to_leader: bool) {
        if learner == NO_NODE || self.is_role_transitioning {
            return;
        }
        let caught_up = self
            .last_sync_info
            .get(&learner)
            .map(|info| info.last_sync_index > self.log.committed_index)
            .unwrap_or(false);
        if !caught_up {
            return;
        }
        self.is_role_transitioning = true;
        self.role_transition_tick = 0;
        let mut cfg = self.cfg.clone();
        cfg.learners.retain(|id| *id != learner);
        if !cfg.replicas.contains(&learner) {
            cfg.replicas.push(learner);
        }
        cfg.version += 1;
        if to_leader {
            cfg.leader = learner;
            cfg.term = self.term + 1;
        }
        tracing::info!(shard = %self.opts.shard, learner, to_leader, "promote learner");
        let mut change = self.new_message(MessageKind::ConfigChange, self.node_id);
        change.config = Some(cfg);
        self.send(change);
    }

    fn begin_leader_transfer(&mut self, target: u64) {
        if target == NO_NODE || target == self.node_id || self.is_role_transitioning {
            return;
        }
        self.is_role_transitioning = true;
        self.role_transition_tick = 0;
        self.stop_propose = true;
        self.transfer_target = Some(target);
        // If the target is already caught up the transfer completes now;
        // otherwise its next sync request finishes it.
        let caught_up = self
            .last_sync_info
            .get(&target)
            .map(|info| info.last_sync_index > self.log.last_log_index)
            .unwrap_or(false);
        if caught_up {
            self.complete_leader_transfer(target);
        }
    }

    fn maybe_finish_transfer(&mut self, from: u64, next_index: u64) {
        if self.transfer_target == Some(from) && next_index > self.log.last_log_index {
            self.complete_leader_transfer(from);
        }
    }

    fn complete_leader_transfer(&mut self, target: u64) {
        let mut cfg = self.cfg.clone();
        cfg.learners.retain(|id| *id != target);
        if !cfg.replicas.contains(&target) {
            cfg.replicas.push(target);
        }
        cfg.leader = target;
        cfg.term = self.term + 1;
        cfg.version += 1;
        cfg.role = Role::Unknown;
        tracing::info!(shard = %self.opts.shard, target, term = cfg.term, "transfer leadership");
        self.transfer_target = None;
        let mut change = self.new_message(MessageKind::ConfigChange, self.node_id);
        change.config = Some(cfg);
        self.send(change);
    }

    // ------------------------------------------------------------- follower

    fn step_follower(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg.kind {
            MessageKind::Propose => Err(ReplicaError::NotLeader),
            MessageKind::Ping => {
                self.handle_ping(msg);
                Ok(())
            }
            MessageKind::SyncResp => {
                self.handle_sync_resp(msg);
                Ok(())
            }
            MessageKind::LogConflictCheckResp => {
                self.handle_conflict_resp(msg);
                Ok(())
            }
            MessageKind::SyncTimeout => Ok(()),
            _ => Ok(()),
        }
    }

    fn handle_ping(&mut self, msg: Message) {
        if msg.term < self.term {
            return;
        }
        if self.leader != msg.from {
            self.become_follower(msg.term, msg.from);
        }
        self.election_elapsed = 0;
        self.log.commit_to(msg.committed_index.min(self.log.storaged_index));
        if msg.conf_version > self.cfg.version {
            let req = self.new_message(MessageKind::ConfigReq, msg.from);
            self.send(req);
        }
        let mut pong = self.new_message(MessageKind::Pong, msg.from);
        pong.committed_index = self.log.committed_index;
        self.send(pong);
    }

    fn handle_sync_resp(&mut self, msg: Message) {
        if msg.from != self.leader {
            return;
        }
        self.syncing = false;
        self.sync_tick = 0;
        self.set_speed_level(msg.speed_level);

        if let Some(first) = msg.entries.first() {
            if first.index <= self.log.last_log_index {
                // Overlap means our tail diverged; drop it before appending.
                if self.log.truncate_after(first.index - 1) {
                    let mut truncate = self.new_message(MessageKind::StoreTruncate, self.node_id);
                    truncate.index = first.index - 1;
                    self.send(truncate);
                }
            }
            if first.index == self.log.last_log_index + 1 {
                if let Err(err) = self.log.append(&msg.entries) {
                    tracing::warn!(shard = %self.opts.shard, ?err, "sync append rejected");
                    self.status = Status::LogConflictCheck;
                    self.log_conflict_check_tick = self.opts.request_timeout_tick;
                    return;
                }
            } else if first.index > self.log.last_log_index + 1 {
                // Gap: re-sync from our own tail next round.
                return;
            }
        }
        self.log
            .commit_to(msg.committed_index.min(self.log.last_log_index));
    }

    fn handle_conflict_resp(&mut self, msg: Message) {
        if self.status != Status::LogConflictCheck {
            return;
        }
        let agreed = msg.index;
        tracing::info!(shard = %self.opts.shard, agreed, last = self.log.last_log_index, "log conflict resolved");
        if self.log.truncate_after(agreed) {
            let mut truncate = self.new_message(MessageKind::StoreTruncate, self.node_id);
            truncate.index = agreed;
            self.send(truncate);
        }
        self.status = Status::Ready;
        self.syncing = false;
        self.sync_tick = self.sync_interval_tick;
    }

    // ------------------------------------------------------------ candidate

    fn step_candidate(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg.kind {
            MessageKind::Propose => Err(ReplicaError::NotLeader),
            MessageKind::VoteResp => {
                if msg.term == self.term {
                    self.votes.insert(msg.from, !msg.reject);
                    let quorum = self.quorum();
                    if self.granted_votes() >= quorum {
                        let term = self.term;
                        self.become_leader(term);
                        self.send_ping(super::types::ALL_NODES);
                    } else if self.rejected_votes() >= quorum {
                        let term = self.term;
                        self.become_follower(term, NO_NODE);
                    }
                }
                Ok(())
            }
            MessageKind::Ping => {
                if msg.term >= self.term {
                    self.become_follower(msg.term, msg.from);
                    self.handle_ping(msg);
                }
                Ok(())
            }
            MessageKind::SyncResp => {
                if msg.term >= self.term {
                    self.become_follower(msg.term, msg.from);
                    self.handle_sync_resp(msg);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------- learner

    fn step_learner(&mut self, msg: Message) -> Result<(), ReplicaError> {
        match msg.kind {
            MessageKind::Propose => Err(ReplicaError::NotLeader),
            MessageKind::Ping => {
                if msg.term >= self.term {
                    if self.leader != msg.from {
                        self.leader = msg.from;
                        self.term = msg.term;
                    }
                    self.election_elapsed = 0;
                    self.log
                        .commit_to(msg.committed_index.min(self.log.storaged_index));
                    let mut pong = self.new_message(MessageKind::Pong, msg.from);
                    pong.committed_index = self.log.committed_index;
                    self.send(pong);
                }
                Ok(())
            }
            MessageKind::SyncResp => {
                self.handle_sync_resp(msg);
                Ok(())
            }
            MessageKind::LogConflictCheckResp => {
                self.handle_conflict_resp(msg);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::super::raft::Replica;
    use super::super::types::*;
    use std::collections::HashMap;

    /// Tiny in-memory harness: plays the storage/init collaborator for each
    /// replica and shuttles peer messages between instances.
    struct Harness {
        replicas: HashMap<u64, Replica>,
        stores: HashMap<u64, Vec<Entry>>,
        config: ReplicaConfig,
    }

    impl Harness {
        fn new(ids: &[u64], election_on: bool, leader: u64) -> Self {
            let config = ReplicaConfig {
                version: 1,
                replicas: ids.to_vec(),
                leader,
                term: if leader == NO_NODE { 0 } else { 1 },
                ..Default::default()
            };
            let mut replicas = HashMap::new();
            let mut stores = HashMap::new();
            for id in ids {
                replicas.insert(
                    *id,
                    Replica::new(ReplicaOptions {
                        node_id: *id,
                        shard: format!("h{id}"),
                        election_on,
                        election_interval_tick: 4,
                        ..Default::default()
                    }),
                );
                stores.insert(*id, Vec::new());
            }
            Self {
                replicas,
                stores,
                config,
            }
        }

        /// One scheduler pass: tick everyone, drain readiness, dispatch until
        /// the message pool drains.
        fn turn(&mut self) {
            let ids: Vec<u64> = self.replicas.keys().copied().collect();
            let mut inflight: Vec<Message> = Vec::new();
            for id in &ids {
                let replica = self.replicas.get_mut(id).unwrap();
                replica.tick();
            }
            for id in &ids {
                self.drain(*id, &mut inflight);
            }
            self.dispatch(&mut inflight);
        }

        fn dispatch(&mut self, inflight: &mut Vec<Message>) {
            while let Some(msg) = inflight.pop() {
                let owner = msg.from;
                match msg.kind {
                    MessageKind::Init => {
                        let store = self.stores.get(&owner).cloned().unwrap_or_default();
                        let last = store.last().cloned().unwrap_or_default();
                        let last_index = last.index;
                        let replica = self.replicas.get_mut(&owner).unwrap();
                        let _ = replica.step(Message {
                            kind: MessageKind::InitResp,
                            from: owner,
                            to: owner,
                            index: last_index,
                            applied_index: 0,
                            entries: vec![last],
                            config: Some(self.config.clone()),
                            ..Default::default()
                        });
                        self.drain(owner, inflight);
                    }
                    MessageKind::StoreAppend => {
                        let store = self.stores.get_mut(&owner).unwrap();
                        for entry in &msg.entries {
                            if entry.index as usize > store.len() {
                                store.push(entry.clone());
                            }
                        }
                        let replica = self.replicas.get_mut(&owner).unwrap();
                        let _ = replica.step(Message {
                            kind: MessageKind::StoreAppendResp,
                            from: owner,
                            to: owner,
                            index: msg.index,
                            ..Default::default()
                        });
                        self.drain(owner, inflight);
                    }
                    MessageKind::StoreTruncate => {
                        let store = self.stores.get_mut(&owner).unwrap();
                        store.truncate(msg.index as usize);
                        let replica = self.replicas.get_mut(&owner).unwrap();
                        let _ = replica.step(Message {
                            kind: MessageKind::StoreTruncateResp,
                            from: owner,
                            to: owner,
                            index: msg.index,
                            ..Default::default()
                        });
                        self.drain(owner, inflight);
                    }
                    MessageKind::ApplyLogs => {
                        let replica = self.replicas.get_mut(&owner).unwrap();
                        let _ = replica.step(Message {
                            kind: MessageKind::ApplyLogsResp,
                            from: owner,
                            to: owner,
                            index: msg.committed_index,
                            ..Default::default()
                        });
                        self.drain(owner, inflight);
                    }
                    MessageKind::SyncGet => {
                        let follower = msg.from;
                        let entries: Vec<Entry> = self.stores[&msg.to]
                            .iter()
                            .filter(|e| e.index >= msg.index)
                            .cloned()
                            .collect();
                        let replica = self.replicas.get_mut(&msg.to).unwrap();
                        let _ = replica.step(Message {
                            kind: MessageKind::SyncGetResp,
                            from: follower,
                            to: msg.to,
                            index: msg.index,
                            entries,
                            ..Default::default()
                        });
                        self.drain(msg.to, inflight);
                    }
                    MessageKind::SyncTimeout
                    | MessageKind::SpeedLevelChange
                    | MessageKind::ConfigChange => {}
                    _ => {
                        let target = msg.to;
                        if let Some(replica) = self.replicas.get_mut(&target) {
                            let _ = replica.step(msg);
                        }
                        self.drain(target, inflight);
                    }
                }
            }
        }

        fn drain(&mut self, id: u64, inflight: &mut Vec<Message>) {
            if let Some(replica) = self.replicas.get_mut(&id) {
                while replica.has_ready() {
                    let rd = replica.ready();
                    let empty = rd.messages.is_empty();
                    inflight.extend(rd.messages);
                    if empty {
                        break;
                    }
                }
            }
        }

        fn leader_count(&self) -> usize {
            self.replicas.values().filter(|r| r.is_leader()).count()
        }

        fn leader_id(&self) -> Option<u64> {
            self.replicas
                .iter()
                .find(|(_, r)| r.is_leader())
                .map(|(id, _)| *id)
        }
    }

    #[test]
    fn three_node_election_converges() {
        let mut h = Harness::new(&[1, 2, 3], true, NO_NODE);
        for _ in 0..300 {
            h.turn();
            if h.leader_count() == 1 {
                break;
            }
        }
        assert_eq!(h.leader_count(), 1, "exactly one leader");
        let leader = h.leader_id().unwrap();
        for _ in 0..10 {
            h.turn();
        }
        for (id, replica) in &h.replicas {
            if *id != leader {
                assert_eq!(replica.leader_id(), leader);
            }
        }
    }

    #[test]
    fn appointed_shard_replicates_and_commits() {
        let mut h = Harness::new(&[1, 2], false, 1);
        for _ in 0..10 {
            h.turn();
        }
        assert!(h.replicas[&1].is_leader());
        assert_eq!(h.replicas[&2].role(), Role::Follower);

        h.replicas
            .get_mut(&1)
            .unwrap()
            .propose(b"hello".to_vec())
            .unwrap();
        for _ in 0..40 {
            h.turn();
            if h.replicas[&2].committed_index() == 1 && h.stores[&2].len() == 1 {
                break;
            }
        }
        assert_eq!(h.stores[&1].len(), 1);
        assert_eq!(h.stores[&2].len(), 1);
        assert_eq!(h.stores[&2][0].data, b"hello".to_vec());
        assert_eq!(h.replicas[&1].committed_index(), 1);
        assert_eq!(h.replicas[&2].committed_index(), 1);
    }

    #[test]
    fn committed_entries_form_leader_prefix() {
        let mut h = Harness::new(&[1, 2, 3], false, 1);
        for _ in 0..10 {
            h.turn();
        }
        for i in 0..5u8 {
            h.replicas.get_mut(&1).unwrap().propose(vec![i]).unwrap();
        }
        for _ in 0..80 {
            h.turn();
            if h.replicas.values().all(|r| r.committed_index() == 5) {
                break;
            }
        }
        let leader_store = h.stores[&1].clone();
        assert_eq!(leader_store.len(), 5);
        for id in [2u64, 3] {
            let committed = h.replicas[&id].committed_index() as usize;
            assert!(committed <= leader_store.len());
            assert_eq!(h.stores[&id][..committed], leader_store[..committed]);
        }
    }

    #[test]
    fn vote_rejected_for_stale_log() {
        let mut voter = Replica::new(ReplicaOptions {
            node_id: 2,
            shard: "vote".into(),
            election_on: false,
            ..Default::default()
        });
        let _ = voter.ready();
        voter
            .step(Message {
                kind: MessageKind::InitResp,
                from: 2,
                to: 2,
                index: 5,
                applied_index: 5,
                entries: vec![Entry {
                    index: 5,
                    term: 2,
                    data: Vec::new(),
                }],
                config: Some(ReplicaConfig {
                    version: 1,
                    replicas: vec![1, 2, 3],
                    leader: NO_NODE,
                    term: 2,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();

        // Candidate with a shorter log at the same term is rejected.
        voter
            .step(Message {
                kind: MessageKind::VoteReq,
                from: 3,
                to: 2,
                term: 3,
                index: 3,
                entries: vec![Entry {
                    index: 3,
                    term: 2,
                    data: Vec::new(),
                }],
                ..Default::default()
            })
            .unwrap();
        let rd = voter.ready();
        let resp = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::VoteResp)
            .expect("vote resp");
        assert!(resp.reject);

        // A longer same-term log gets the vote.
        voter
            .step(Message {
                kind: MessageKind::VoteReq,
                from: 1,
                to: 2,
                term: 3,
                index: 6,
                entries: vec![Entry {
                    index: 6,
                    term: 2,
                    data: Vec::new(),
                }],
                ..Default::default()
            })
            .unwrap();
        let rd = voter.ready();
        let resp = rd
            .messages
            .iter()
            .find(|m| m.kind == MessageKind::VoteResp)
            .expect("vote resp");
        assert!(!resp.reject);
    }
}
