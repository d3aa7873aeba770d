//! Clustered message-processing engine.
//!
//! A node hosts three cooperating planes: the slot plane (a fixed number of
//! elected replicated-log shards holding channel placement), the channel
//! plane (one appointed-leader log per active channel), and the channel
//! reactor (the staged pipeline that takes a producer send through decrypt,
//! permission check, storage, ack, and delivery).

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod placement;
pub mod reactor;
pub mod shard;
pub mod slots;
pub mod storage;
pub mod tag;
pub mod transport;
pub mod types;

pub use config::{ClusterConfig, ClusterConfigManager, Node as ClusterNode, Slot};
pub use error::ClusterError;
pub use node::{Node, NodeOptions};
pub use types::{channel_key, ChannelKey, ChannelPlacement, ReactorMessage, ReasonCode};
