//! Replica module wiring.
//!
//! `raft` contains the replica driver (roles, ticks, readiness), `step` the
//! role transition functions, `log` the in-memory log cursors, and `types`
//! the shared message vocabulary and configuration contracts.

mod log;
mod raft;
mod step;
mod types;

pub use raft::{Ready, Replica};
pub use types::{
    Entry, HardState, Message, MessageKind, ReplicaConfig, ReplicaError, ReplicaOptions, Role,
    SpeedLevel, Status, SyncInfo, ALL_NODES, NO_NODE,
};
