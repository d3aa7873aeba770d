//! Shared types for the replica state machine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the replica engine and the scheduler/transport layers that
//! drive it.

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Sentinel for "no node" (unknown leader, no vote cast, …).
pub const NO_NODE: NodeId = 0;
/// Sentinel destination meaning "every replica of the shard".
pub const ALL_NODES: NodeId = u64::MAX;

/// Role of a replica inside its shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Unknown,
    Leader,
    Follower,
    Candidate,
    Learner,
}

/// Lifecycle status of a replica instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    /// Fresh instance; the first `Ready` emits `Init` so the driver can seed
    /// log state and configuration.
    #[default]
    Uninitialized,
    /// `Init` has been emitted; waiting for `InitResp`.
    Initing,
    /// Follower with a non-empty log checking for divergence with the leader.
    LogConflictCheck,
    Ready,
}

/// Replication pacing. The follower sync interval is the base interval
/// multiplied by the level factor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpeedLevel {
    #[default]
    Fast,
    Middle,
    Slow,
    Slowest,
    Stop,
}

impl SpeedLevel {
    /// Multiplier applied to the base sync interval.
    pub fn factor(self) -> u64 {
        match self {
            SpeedLevel::Fast => 1,
            SpeedLevel::Middle => 2,
            SpeedLevel::Slow => 4,
            SpeedLevel::Slowest => 8,
            SpeedLevel::Stop => 100_000,
        }
    }

    pub fn from_u8(v: u8) -> SpeedLevel {
        match v {
            1 => SpeedLevel::Middle,
            2 => SpeedLevel::Slow,
            3 => SpeedLevel::Slowest,
            4 => SpeedLevel::Stop,
            _ => SpeedLevel::Fast,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            SpeedLevel::Fast => 0,
            SpeedLevel::Middle => 1,
            SpeedLevel::Slow => 2,
            SpeedLevel::Slowest => 3,
            SpeedLevel::Stop => 4,
        }
    }
}

/// One replicated log entry. Indexes are dense per shard and start at 1;
/// terms are monotonic per shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u32,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn encoded_size(&self) -> u64 {
        (8 + 4 + self.data.len()) as u64
    }
}

/// Durable per-shard state surfaced through `Ready` whenever it changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub leader_id: NodeId,
    pub term: u32,
    pub conf_version: u64,
}

/// Replica-set configuration for one shard.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaConfig {
    /// Monotonic configuration version; stale versions are ignored.
    pub version: u64,
    pub replicas: Vec<NodeId>,
    pub learners: Vec<NodeId>,
    pub leader: NodeId,
    pub term: u32,
    /// Role hint for the local node. `Unknown` lets the replica decide from
    /// membership and elections.
    pub role: Role,
}

impl ReplicaConfig {
    pub fn is_replica(&self, node_id: NodeId) -> bool {
        self.replicas.contains(&node_id)
    }

    pub fn is_learner(&self, node_id: NodeId) -> bool {
        self.learners.contains(&node_id)
    }

    /// Majority of the voting replica set.
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }
}

/// Message vocabulary of the replica state machine. Messages are exchanged
/// with the driver (storage, apply, init) and with peer replicas (sync,
/// votes, pings); they are never RPCs on their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageKind {
    #[default]
    None,
    /// Emitted once by an uninitialized replica; the driver answers with
    /// `InitResp` carrying durable log state and the current configuration.
    Init,
    InitResp,
    Propose,
    /// Ask the storage collaborator to durably append the unstable tail.
    StoreAppend,
    StoreAppendResp,
    /// Ask the storage collaborator to drop entries after `index`.
    StoreTruncate,
    StoreTruncateResp,
    /// Ask the apply collaborator to apply committed entries.
    ApplyLogs,
    ApplyLogsResp,
    /// Follower → leader poll for entries starting at `index`.
    SyncReq,
    /// Leader → storage request for entries it no longer holds in memory.
    SyncGet,
    SyncGetResp,
    /// Leader → follower entries plus commit index.
    SyncResp,
    /// Local notification that a sync round went unanswered.
    SyncTimeout,
    Ping,
    Pong,
    VoteReq,
    VoteResp,
    /// Local heartbeat trigger for the leader.
    Beat,
    /// Local election trigger.
    Hup,
    ConfigReq,
    ConfigResp,
    ConfigChange,
    /// Follower → leader divergence probe carrying `(last_index, last_term)`.
    LogConflictCheck,
    LogConflictCheckResp,
    LearnerToFollower,
    LearnerToLeader,
    FollowerToLeader,
    SpeedLevelChange,
}

/// A single replica message. One flat struct with a kind tag keeps the
/// ready/step plumbing uniform; unused fields stay at their defaults.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub kind: MessageKind,
    pub from: NodeId,
    pub to: NodeId,
    pub term: u32,
    /// Kind-dependent log index (next wanted for `SyncReq`, last appended for
    /// acks, agreed index for conflict responses, …).
    pub index: u64,
    pub committed_index: u64,
    pub applied_index: u64,
    pub reject: bool,
    pub speed_level: SpeedLevel,
    /// Configuration version carried by pings so followers can detect a
    /// stale local configuration.
    pub conf_version: u64,
    pub entries: Vec<Entry>,
    pub config: Option<ReplicaConfig>,
    /// Target of learner/follower promotion messages.
    pub transfer_to: NodeId,
}

impl Message {
    pub fn is_local(&self, node_id: NodeId) -> bool {
        self.to == node_id
    }
}

/// Per-replica sync progress tracked by the leader.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncInfo {
    /// Next index the replica asked for; the replica has everything below it.
    pub last_sync_index: u64,
    /// Ticks since the replica last issued a sync request.
    pub sync_tick: u64,
}

/// Construction-time tuning for one replica instance. All timeouts are tick
/// counts against the driver's coarse tick.
#[derive(Clone, Debug)]
pub struct ReplicaOptions {
    pub node_id: NodeId,
    /// Shard label used in log output.
    pub shard: String,
    /// Base ticks between follower sync polls.
    pub sync_interval_tick: u64,
    /// Base election timeout E; the effective timeout is randomized in [E, 2E).
    pub election_interval_tick: u64,
    pub heartbeat_interval_tick: u64,
    /// Ticks between conflict-check retries and other request timeouts.
    pub request_timeout_tick: u64,
    /// Ticks before a stuck learner promotion is abandoned.
    pub learner_to_timeout_tick: u64,
    /// Byte bound for entries carried by one `SyncResp`.
    pub max_sync_size: u64,
    /// Whether this shard elects its own leader. Slots do; channels have
    /// their leader appointed through placement.
    pub election_on: bool,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            node_id: NO_NODE,
            shard: String::new(),
            sync_interval_tick: 1,
            election_interval_tick: 10,
            heartbeat_interval_tick: 1,
            request_timeout_tick: 10,
            learner_to_timeout_tick: 20,
            max_sync_size: 1024 * 1024 * 2,
            election_on: false,
        }
    }
}

/// Errors surfaced by `step`/`propose`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("not leader")]
    NotLeader,
    #[error("proposals stopped during role transition")]
    ProposeStopped,
    #[error("replica uninitialized")]
    Uninitialized,
    #[error("out of order append: expected {expected}, got {got}")]
    OutOfOrderAppend { expected: u64, got: u64 },
}
