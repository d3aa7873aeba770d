//! Shard scheduler: drives a set of replica instances on a fixed-period
//! tick.
//!
//! Shards are partitioned over N lanes by hash of the shard key; one task
//! owns each lane's shards exclusively, so there is no shared mutation.
//! Every tick the lane delivers inbound messages, calls `tick`, collects
//! `Ready`, and dispatches: storage work is executed inline against the log
//! collaborator, apply work goes to the shard's state machine, and remote
//! messages are handed to the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use roost_replica::replica::{
    Entry, HardState, Message, MessageKind, Replica, ReplicaConfig, ReplicaOptions,
};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{encode_shard_message, ShardKind};
use crate::error::ClusterError;
use crate::storage::LogStorage;
use crate::transport::Transport;

/// Path carrying replica traffic between nodes.
pub const SHARD_MESSAGE_PATH: &str = "/shard/message";

const LANE_QUEUE_CAPACITY: usize = 1024;

/// Applies committed entries to the shard's state machine. Returns the new
/// applied index.
pub trait ShardApply: Send + Sync + 'static {
    fn apply(&self, shard: &str, entries: &[Entry]) -> anyhow::Result<u64>;
}

/// Observer for hard-state changes (leadership, term, config version).
pub type HardStateHook = Arc<dyn Fn(&str, HardState) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ShardInfo {
    pub role: roost_replica::replica::Role,
    pub leader: u64,
    pub term: u32,
    pub last_index: u64,
    pub committed_index: u64,
    pub applied_index: u64,
}

#[derive(Clone)]
pub struct SchedulerOptions {
    pub node_id: u64,
    pub kind: ShardKind,
    pub lanes: usize,
    pub tick_interval: Duration,
    pub propose_timeout: Duration,
}

impl SchedulerOptions {
    pub fn new(node_id: u64, kind: ShardKind) -> Self {
        Self {
            node_id,
            kind,
            lanes: 4,
            tick_interval: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(5),
        }
    }
}

enum LaneCommand {
    Ensure {
        shard: String,
        config: ReplicaConfig,
        options: ReplicaOptions,
    },
    Step {
        shard: String,
        msg: Message,
    },
    Propose {
        shard: String,
        batch: Vec<Vec<u8>>,
        done: oneshot::Sender<Result<(u64, u64), ClusterError>>,
    },
    Info {
        shard: String,
        done: oneshot::Sender<Option<ShardInfo>>,
    },
    Remove {
        shard: String,
    },
}

pub struct ShardScheduler {
    lanes: Vec<mpsc::Sender<LaneCommand>>,
    opts: SchedulerOptions,
}

impl ShardScheduler {
    pub fn start(
        opts: SchedulerOptions,
        storage: Arc<dyn LogStorage>,
        apply: Arc<dyn ShardApply>,
        transport: Arc<Transport>,
        on_hard_state: Option<HardStateHook>,
    ) -> Arc<Self> {
        let lane_count = opts.lanes.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        for lane_index in 0..lane_count {
            let (tx, rx) = mpsc::channel(LANE_QUEUE_CAPACITY);
            let lane = Lane {
                node_id: opts.node_id,
                kind: opts.kind,
                shards: HashMap::new(),
                storage: Arc::clone(&storage),
                apply: Arc::clone(&apply),
                transport: Arc::clone(&transport),
                on_hard_state: on_hard_state.clone(),
                propose_timeout: opts.propose_timeout,
            };
            let tick_interval = opts.tick_interval;
            tokio::spawn(lane.run(lane_index, rx, tick_interval));
            lanes.push(tx);
        }
        Arc::new(Self { lanes, opts })
    }

    fn lane(&self, shard: &str) -> &mpsc::Sender<LaneCommand> {
        let idx = crc32fast::hash(shard.as_bytes()) as usize % self.lanes.len();
        &self.lanes[idx]
    }

    /// Create the shard if missing and (re)apply its configuration.
    pub async fn ensure_shard(
        &self,
        shard: &str,
        config: ReplicaConfig,
        options: ReplicaOptions,
    ) -> Result<(), ClusterError> {
        self.lane(shard)
            .send(LaneCommand::Ensure {
                shard: shard.to_string(),
                config,
                options,
            })
            .await
            .map_err(|_| ClusterError::ShardStopped(shard.to_string()))
    }

    /// Feed one replica message into the shard. Messages for unknown shards
    /// are dropped; the sync protocol re-drives them once the shard exists.
    pub fn step(&self, shard: &str, msg: Message) -> Result<(), ClusterError> {
        self.lane(shard)
            .try_send(LaneCommand::Step {
                shard: shard.to_string(),
                msg,
            })
            .map_err(|_| ClusterError::ShardStopped(shard.to_string()))
    }

    /// Propose a batch and wait until the entries are applied. Returns the
    /// (first, last) index pair.
    pub async fn propose_and_wait(
        &self,
        shard: &str,
        batch: Vec<Vec<u8>>,
    ) -> Result<(u64, u64), ClusterError> {
        let (done, rx) = oneshot::channel();
        self.lane(shard)
            .send(LaneCommand::Propose {
                shard: shard.to_string(),
                batch,
                done,
            })
            .await
            .map_err(|_| ClusterError::ShardStopped(shard.to_string()))?;
        match tokio::time::timeout(self.opts.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::ShardStopped(shard.to_string())),
            Err(_) => Err(ClusterError::ProposalTimeout),
        }
    }

    pub async fn info(&self, shard: &str) -> Option<ShardInfo> {
        let (done, rx) = oneshot::channel();
        self.lane(shard)
            .send(LaneCommand::Info {
                shard: shard.to_string(),
                done,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn remove(&self, shard: &str) {
        let _ = self
            .lane(shard)
            .send(LaneCommand::Remove {
                shard: shard.to_string(),
            })
            .await;
    }
}

struct Waiter {
    first: u64,
    last: u64,
    deadline: Instant,
    done: oneshot::Sender<Result<(u64, u64), ClusterError>>,
}

struct ShardState {
    replica: Replica,
    config: ReplicaConfig,
    waiters: Vec<Waiter>,
    /// Set on storage/apply failure; the lane excludes the shard until
    /// restart.
    failed: bool,
}

struct Lane {
    node_id: u64,
    kind: ShardKind,
    shards: HashMap<String, ShardState>,
    storage: Arc<dyn LogStorage>,
    apply: Arc<dyn ShardApply>,
    transport: Arc<Transport>,
    on_hard_state: Option<HardStateHook>,
    propose_timeout: Duration,
}

impl Lane {
    async fn run(
        mut self,
        lane_index: usize,
        mut rx: mpsc::Receiver<LaneCommand>,
        tick_interval: Duration,
    ) {
        tracing::debug!(lane = lane_index, "shard lane started");
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick();
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(lane = lane_index, "shard lane stopped");
    }

    fn on_tick(&mut self) {
        let keys: Vec<String> = self.shards.keys().cloned().collect();
        for key in keys {
            let Some(state) = self.shards.get_mut(&key) else {
                continue;
            };
            if state.failed {
                continue;
            }
            state.replica.tick();
            self.drive(&key);
            self.expire_waiters(&key);
        }
    }

    async fn on_command(&mut self, cmd: LaneCommand) {
        match cmd {
            LaneCommand::Ensure {
                shard,
                config,
                options,
            } => {
                match self.shards.get_mut(&shard) {
                    Some(state) => {
                        state.config = config.clone();
                        state.replica.switch_config(config);
                    }
                    None => {
                        let replica = Replica::new(options);
                        self.shards.insert(
                            shard.clone(),
                            ShardState {
                                replica,
                                config,
                                waiters: Vec::new(),
                                failed: false,
                            },
                        );
                    }
                }
                self.drive(&shard);
            }
            LaneCommand::Step { shard, msg } => {
                let Some(state) = self.shards.get_mut(&shard) else {
                    tracing::debug!(shard, kind = ?msg.kind, "drop message for unknown shard");
                    return;
                };
                if state.failed {
                    return;
                }
                if let Err(err) = state.replica.step(msg) {
                    tracing::debug!(shard, error = %err, "step rejected");
                }
                self.drive(&shard);
            }
            LaneCommand::Propose { shard, batch, done } => {
                let Some(state) = self.shards.get_mut(&shard) else {
                    let _ = done.send(Err(ClusterError::ChannelNotFound));
                    return;
                };
                if state.failed {
                    let _ = done.send(Err(ClusterError::ShardStopped(shard)));
                    return;
                }
                match state.replica.propose_all(batch) {
                    Ok((first, last)) => {
                        state.waiters.push(Waiter {
                            first,
                            last,
                            deadline: Instant::now() + self.propose_timeout,
                            done,
                        });
                        self.drive(&shard);
                    }
                    Err(err) => {
                        let _ = done.send(Err(err.into()));
                    }
                }
            }
            LaneCommand::Info { shard, done } => {
                let info = self.shards.get(&shard).map(|state| ShardInfo {
                    role: state.replica.role(),
                    leader: state.replica.leader_id(),
                    term: state.replica.term(),
                    last_index: state.replica.last_log_index(),
                    committed_index: state.replica.committed_index(),
                    applied_index: state.replica.applied_index(),
                });
                let _ = done.send(info);
            }
            LaneCommand::Remove { shard } => {
                self.shards.remove(&shard);
            }
        }
    }

    /// Drain readiness and dispatch until the shard settles.
    fn drive(&mut self, shard: &str) {
        loop {
            let Some(state) = self.shards.get_mut(shard) else {
                return;
            };
            if state.failed || !state.replica.has_ready() {
                break;
            }
            let rd = state.replica.ready();
            if let Some(hs) = rd.hard_state {
                if let Some(hook) = &self.on_hard_state {
                    hook(shard, hs);
                }
            }
            if rd.messages.is_empty() && rd.hard_state.is_none() {
                break;
            }
            for msg in rd.messages {
                self.dispatch(shard, msg);
            }
        }
        self.resolve_waiters(shard);
    }

    fn dispatch(&mut self, shard: &str, msg: Message) {
        match msg.kind {
            MessageKind::Init => self.handle_init(shard),
            MessageKind::StoreAppend => self.handle_store_append(shard, msg),
            MessageKind::StoreTruncate => self.handle_store_truncate(shard, msg),
            MessageKind::ApplyLogs => self.handle_apply_logs(shard, msg),
            MessageKind::SyncGet => self.handle_sync_get(shard, msg),
            MessageKind::SyncTimeout | MessageKind::SpeedLevelChange => {}
            _ => {
                if msg.to == self.node_id {
                    self.step_local(shard, msg);
                } else {
                    self.send_remote(shard, msg);
                }
            }
        }
    }

    fn step_local(&mut self, shard: &str, msg: Message) {
        if let Some(state) = self.shards.get_mut(shard) {
            if let Err(err) = state.replica.step(msg) {
                tracing::debug!(shard, error = %err, "local step rejected");
            }
        }
    }

    fn send_remote(&mut self, shard: &str, msg: Message) {
        let body = encode_shard_message(self.kind, shard, &msg);
        let transport = Arc::clone(&self.transport);
        let to = msg.to;
        tokio::spawn(async move {
            if let Err(err) = transport.notify(to, SHARD_MESSAGE_PATH, body).await {
                tracing::debug!(to, error = %err, "shard message dropped");
            }
        });
    }

    fn handle_init(&mut self, shard: &str) {
        let last = match self.storage.last_entry(shard) {
            Ok(last) => last.unwrap_or_default(),
            Err(err) => {
                self.fail_shard(shard, "read last entry", err);
                return;
            }
        };
        let applied = match self.storage.applied_index(shard) {
            Ok(applied) => applied,
            Err(err) => {
                self.fail_shard(shard, "read applied index", err);
                return;
            }
        };
        let Some(state) = self.shards.get_mut(shard) else {
            return;
        };
        let msg = Message {
            kind: MessageKind::InitResp,
            from: self.node_id,
            to: self.node_id,
            index: last.index,
            applied_index: applied.min(last.index),
            entries: vec![last],
            config: Some(state.config.clone()),
            ..Default::default()
        };
        if let Err(err) = state.replica.step(msg) {
            tracing::warn!(shard, error = %err, "init step rejected");
        }
    }

    fn handle_store_append(&mut self, shard: &str, msg: Message) {
        if let Err(err) = self.storage.append_logs(shard, &msg.entries) {
            self.fail_shard(shard, "append logs", err);
            return;
        }
        self.step_local(
            shard,
            Message {
                kind: MessageKind::StoreAppendResp,
                from: self.node_id,
                to: self.node_id,
                index: msg.index,
                ..Default::default()
            },
        );
    }

    fn handle_store_truncate(&mut self, shard: &str, msg: Message) {
        if let Err(err) = self.storage.truncate_after(shard, msg.index) {
            self.fail_shard(shard, "truncate logs", err);
            return;
        }
        self.step_local(
            shard,
            Message {
                kind: MessageKind::StoreTruncateResp,
                from: self.node_id,
                to: self.node_id,
                index: msg.index,
                ..Default::default()
            },
        );
    }

    fn handle_apply_logs(&mut self, shard: &str, msg: Message) {
        let from = msg.index + 1;
        let entries = match self.storage.get_logs(shard, from, u64::MAX) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.index <= msg.committed_index)
                .collect::<Vec<_>>(),
            Err(err) => {
                self.fail_shard(shard, "read apply range", err);
                return;
            }
        };
        let applied = match self.apply.apply(shard, &entries) {
            Ok(applied) => applied.max(msg.committed_index),
            Err(err) => {
                self.fail_shard(shard, "apply entries", err);
                return;
            }
        };
        if let Err(err) = self.storage.set_applied_index(shard, applied) {
            self.fail_shard(shard, "record applied index", err);
            return;
        }
        self.step_local(
            shard,
            Message {
                kind: MessageKind::ApplyLogsResp,
                from: self.node_id,
                to: self.node_id,
                index: applied,
                ..Default::default()
            },
        );
    }

    fn handle_sync_get(&mut self, shard: &str, msg: Message) {
        let entries = match self.storage.get_logs(shard, msg.index, 1024 * 1024 * 2) {
            Ok(entries) => entries,
            Err(err) => {
                self.fail_shard(shard, "read sync range", err);
                return;
            }
        };
        self.step_local(
            shard,
            Message {
                kind: MessageKind::SyncGetResp,
                from: msg.from,
                to: self.node_id,
                index: msg.index,
                entries,
                ..Default::default()
            },
        );
    }

    fn fail_shard(&mut self, shard: &str, action: &str, err: anyhow::Error) {
        tracing::error!(shard, action, error = %err, "shard failed; excluding until restart");
        if let Some(state) = self.shards.get_mut(shard) {
            state.failed = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter
                    .done
                    .send(Err(ClusterError::ShardStopped(shard.to_string())));
            }
        }
    }

    fn resolve_waiters(&mut self, shard: &str) {
        let Some(state) = self.shards.get_mut(shard) else {
            return;
        };
        let applied = state.replica.applied_index();
        let mut remaining = Vec::with_capacity(state.waiters.len());
        for waiter in state.waiters.drain(..) {
            if waiter.last <= applied {
                let _ = waiter.done.send(Ok((waiter.first, waiter.last)));
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
    }

    fn expire_waiters(&mut self, shard: &str) {
        let Some(state) = self.shards.get_mut(shard) else {
            return;
        };
        let now = Instant::now();
        let mut remaining = Vec::with_capacity(state.waiters.len());
        for waiter in state.waiters.drain(..) {
            if waiter.deadline <= now {
                let _ = waiter.done.send(Err(ClusterError::ProposalTimeout));
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStorage;
    use crate::transport::{AddrResolver, Transport};
    use roost_replica::replica::Role;

    struct NoopApply;

    impl ShardApply for NoopApply {
        fn apply(&self, _shard: &str, entries: &[Entry]) -> anyhow::Result<u64> {
            Ok(entries.last().map(|e| e.index).unwrap_or(0))
        }
    }

    fn test_transport(node_id: u64) -> Arc<Transport> {
        let resolver: AddrResolver = Arc::new(|_| None);
        Transport::new(node_id, "tok".into(), resolver)
    }

    fn fast_options(node_id: u64, shard: &str) -> ReplicaOptions {
        ReplicaOptions {
            node_id,
            shard: shard.to_string(),
            election_on: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_node_shard_proposes_and_applies() {
        let storage = Arc::new(MemoryLogStorage::new());
        let scheduler = ShardScheduler::start(
            SchedulerOptions {
                tick_interval: Duration::from_millis(5),
                ..SchedulerOptions::new(1, ShardKind::Channel)
            },
            storage.clone(),
            Arc::new(NoopApply),
            test_transport(1),
            None,
        );

        scheduler
            .ensure_shard(
                "ch@2",
                ReplicaConfig {
                    version: 1,
                    replicas: vec![1],
                    leader: 1,
                    term: 1,
                    ..Default::default()
                },
                fast_options(1, "ch@2"),
            )
            .await
            .unwrap();

        let (first, last) = scheduler
            .propose_and_wait("ch@2", vec![b"hello".to_vec()])
            .await
            .unwrap();
        assert_eq!((first, last), (1, 1));
        assert_eq!(storage.last_index("ch@2").unwrap(), 1);

        let info = scheduler.info("ch@2").await.unwrap();
        assert_eq!(info.role, Role::Leader);
        assert_eq!(info.committed_index, 1);
    }

    #[tokio::test]
    async fn propose_on_unknown_shard_fails() {
        let scheduler = ShardScheduler::start(
            SchedulerOptions::new(1, ShardKind::Channel),
            Arc::new(MemoryLogStorage::new()),
            Arc::new(NoopApply),
            test_transport(1),
            None,
        );
        let err = scheduler
            .propose_and_wait("nope@1", vec![b"x".to_vec()])
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ChannelNotFound));
    }
}
