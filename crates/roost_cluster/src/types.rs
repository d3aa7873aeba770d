//! Shared domain types: channel keys, producer messages, placement records,
//! and the wire request/response bodies exchanged between nodes.

use serde::{Deserialize, Serialize};

/// Well-known channel types. Stored as a raw `u8` on the wire so unknown
/// application-defined types pass through untouched.
pub const CHANNEL_TYPE_PERSON: u8 = 1;
pub const CHANNEL_TYPE_GROUP: u8 = 2;
pub const CHANNEL_TYPE_CUSTOMER_SERVICE: u8 = 3;
pub const CHANNEL_TYPE_TEMP: u8 = 4;

/// Key of a channel: `(channelId, channelType)`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelKey {
    pub channel_id: String,
    pub channel_type: u8,
}

impl ChannelKey {
    pub fn new(channel_id: impl Into<String>, channel_type: u8) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_type,
        }
    }

    /// Stable string form, used as the shard key of the channel's log.
    pub fn shard(&self) -> String {
        channel_key(&self.channel_id, self.channel_type)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.channel_id, self.channel_type)
    }
}

pub fn channel_key(channel_id: &str, channel_type: u8) -> String {
    format!("{channel_id}@{channel_type}")
}

/// Producer-visible outcome of a send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    #[default]
    Success,
    PermissionDenied,
    SystemError,
    NoLeader,
    Timeout,
}

impl ReasonCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ReasonCode::Success => 0,
            ReasonCode::PermissionDenied => 1,
            ReasonCode::SystemError => 2,
            ReasonCode::NoLeader => 3,
            ReasonCode::Timeout => 4,
        }
    }

    pub fn from_u8(v: u8) -> ReasonCode {
        match v {
            1 => ReasonCode::PermissionDenied,
            2 => ReasonCode::SystemError,
            3 => ReasonCode::NoLeader,
            4 => ReasonCode::Timeout,
            _ => ReasonCode::Success,
        }
    }
}

/// One in-flight producer message moving through the channel pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReactorMessage {
    /// Position in the owning channel's message queue; assigned on enqueue.
    pub index: u64,
    /// Client-assigned id, echoed back on the ack.
    pub message_id: i64,
    /// Server-assigned sequence; 0 until the storage stage commits.
    pub message_seq: u64,
    pub from_uid: String,
    /// Node the producer's connection lives on.
    pub from_node: u64,
    pub from_conn_id: u64,
    pub payload: Vec<u8>,
    pub is_encrypted: bool,
    /// Whether this message is part of a multi-part stream.
    pub is_stream: bool,
    pub reason_code: ReasonCode,
}

/// Channel placement: maps a channel to its leader and replica set. Owned by
/// the slot that covers the channel key; replicated through the slot log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPlacement {
    pub channel_id: String,
    pub channel_type: u8,
    pub leader_id: u64,
    pub replicas: Vec<u64>,
    pub replica_count: u32,
    pub term: u32,
}

impl ChannelPlacement {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel_id.clone(), self.channel_type)
    }

    pub fn is_replica(&self, node_id: u64) -> bool {
        self.replicas.contains(&node_id)
    }
}

/// Commands applied by the slot state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SlotCommand {
    SavePlacement(ChannelPlacement),
    DeletePlacement { channel_id: String, channel_type: u8 },
}

// ---------------------------------------------------------------- wire bodies

/// Request paths served between nodes.
pub mod paths {
    pub const GET_SUBSCRIBERS: &str = "/channel/subscribers";
    pub const CHANNEL_PROPOSE: &str = "/channel/propose";
    pub const CHANNEL_PLACEMENT_GET: &str = "/channel/placement";
    pub const CHANNEL_LAST_LOG_INFO: &str = "/channel/lastloginfo";
    pub const CHANNEL_APPOINT_LEADER: &str = "/channel/appointleader";
    /// One-way fan-out of stored messages to a subscriber-owning node.
    pub const CHANNEL_DELIVER: &str = "/channel/deliver";
    /// One-way producer ack routed back to the producer's node.
    pub const CHANNEL_SENDACK: &str = "/channel/sendack";
    pub const NODE_PING: &str = "/node/ping";
    pub const NODE_CONFIG_GET: &str = "/node/config";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriberGetReq {
    pub channel_id: String,
    pub channel_type: u8,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscriberGetResp {
    pub subscribers: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementGetReq {
    pub channel_id: String,
    pub channel_type: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastLogInfoReq {
    pub channel_id: String,
    pub channel_type: u8,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LastLogInfoResp {
    pub log_index: u64,
    pub term: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppointLeaderReq {
    pub channel_id: String,
    pub channel_type: u8,
    pub leader_id: u64,
    pub term: u32,
}

/// Forwarded propose result: the server-assigned sequence per message id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChannelProposeResp {
    pub message_seqs: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePingReq {
    pub from: u64,
    pub config_version: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodePingResp {
    pub config_version: u32,
}
