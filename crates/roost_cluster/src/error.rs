//! Error kinds surfaced by the cluster core, grouped by recovery policy:
//! transient failures retry locally with back-off, routing failures refresh
//! cached placement and retry once, consensus failures surface to the caller.

use roost_replica::replica::ReplicaError;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not the channel leader")]
    NotLeader,
    #[error("channel cluster config is old")]
    ClusterConfigOld,
    #[error("slot {0} does not exist")]
    SlotNotExist(u32),
    #[error("channel not found")]
    ChannelNotFound,
    #[error("node {0} not found")]
    NodeNotFound(u64),
    #[error("reactor stopped")]
    ReactorStopped,
    #[error("reactor lane busy")]
    ReactorBusy,
    #[error("no leader")]
    NoLeader,
    #[error("proposal timed out")]
    ProposalTimeout,
    #[error("request timed out")]
    RequestTimeout,
    #[error("shard {0} stopped")]
    ShardStopped(String),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Status byte carried by transport responses.
pub mod status {
    pub const OK: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const CLUSTER_CONFIG_OLD: u8 = 2;
    pub const NOT_LEADER: u8 = 3;
    pub const NOT_FOUND: u8 = 4;
}

impl ClusterError {
    /// Map an error onto the wire status byte.
    pub fn to_status(&self) -> u8 {
        match self {
            ClusterError::ClusterConfigOld => status::CLUSTER_CONFIG_OLD,
            ClusterError::NotLeader | ClusterError::Replica(ReplicaError::NotLeader) => {
                status::NOT_LEADER
            }
            ClusterError::ChannelNotFound | ClusterError::NodeNotFound(_) => status::NOT_FOUND,
            _ => status::ERROR,
        }
    }

    /// Reconstruct the matchable kinds from a wire status byte.
    pub fn from_status(code: u8, context: &str) -> ClusterError {
        match code {
            status::CLUSTER_CONFIG_OLD => ClusterError::ClusterConfigOld,
            status::NOT_LEADER => ClusterError::NotLeader,
            status::NOT_FOUND => ClusterError::ChannelNotFound,
            _ => ClusterError::Other(anyhow::anyhow!("remote error: {context}")),
        }
    }
}
