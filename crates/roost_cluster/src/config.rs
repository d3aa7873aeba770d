//! Cluster-wide configuration: node membership and slot assignments.
//!
//! The configuration is a monotonically-versioned JSON document persisted via
//! temp-file + atomic rename. The node-leader owns writes; other nodes mirror
//! it through version gossip and only mutate their local copy when a newer
//! version arrives.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

const CLUSTER_CONFIG_FILE: &str = "clusterconfig.json";

/// Membership state of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    WaitInit,
    Joined,
}

/// One cluster member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub cluster_addr: String,
    #[serde(default)]
    pub api_addr: String,
    #[serde(default)]
    pub status: NodeStatus,
    pub online: bool,
    pub allow_vote: bool,
    pub data_term: u32,
    #[serde(default)]
    pub offline_count: u32,
}

/// One slot: a partition of the channel key-space backed by its own
/// replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Slot {
    pub id: u32,
    pub leader: u64,
    pub replicas: Vec<u64>,
    pub term: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u32,
    pub term: u32,
    pub slot_count: u32,
    pub nodes: Vec<Node>,
    pub slots: Vec<Slot>,
}

impl ClusterConfig {
    pub fn node(&self, id: u64) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn slot(&self, id: u32) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }
}

/// Owner of the local configuration copy.
pub struct ClusterConfigManager {
    node_id: u64,
    path: PathBuf,
    state: RwLock<ClusterConfig>,
}

impl ClusterConfigManager {
    /// Load the persisted configuration, or build one from the seed list.
    /// Slot replica assignment is a deterministic function of the sorted seed
    /// ids so every node computes the same initial layout without
    /// coordination.
    pub fn load_or_create(
        node_id: u64,
        data_dir: &Path,
        init_nodes: &BTreeMap<u64, String>,
        slot_count: u32,
        slot_replica_count: u32,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir).context("create data dir")?;
        let path = data_dir.join(CLUSTER_CONFIG_FILE);

        let state = match fs::read(&path) {
            Ok(data) if !data.is_empty() => {
                serde_json::from_slice(&data).context("parse cluster config")?
            }
            _ => {
                let config = Self::initial_config(init_nodes, slot_count, slot_replica_count);
                write_atomic(&path, &config)?;
                config
            }
        };

        Ok(Self {
            node_id,
            path,
            state: RwLock::new(state),
        })
    }

    fn initial_config(
        init_nodes: &BTreeMap<u64, String>,
        slot_count: u32,
        slot_replica_count: u32,
    ) -> ClusterConfig {
        let mut nodes: Vec<Node> = init_nodes
            .iter()
            .map(|(id, addr)| Node {
                id: *id,
                cluster_addr: addr.clone(),
                api_addr: String::new(),
                status: NodeStatus::WaitInit,
                online: true,
                allow_vote: true,
                data_term: 1,
                offline_count: 0,
            })
            .collect();
        nodes.sort_by_key(|n| n.id);

        let ids: Vec<u64> = nodes.iter().map(|n| n.id).collect();
        let replica_count = (slot_replica_count.max(1) as usize).min(ids.len().max(1));
        let slots = (0..slot_count)
            .map(|slot_id| {
                let replicas = (0..replica_count)
                    .map(|j| ids[(slot_id as usize + j) % ids.len()])
                    .collect();
                Slot {
                    id: slot_id,
                    leader: 0,
                    replicas,
                    term: 0,
                }
            })
            .collect();

        ClusterConfig {
            version: 1,
            term: 0,
            slot_count,
            nodes,
            slots,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Snapshot of the whole document.
    pub fn config(&self) -> ClusterConfig {
        self.state.read().expect("config lock").clone()
    }

    pub fn version(&self) -> u32 {
        self.state.read().expect("config lock").version
    }

    pub fn slot_count(&self) -> u32 {
        self.state.read().expect("config lock").slot_count
    }

    /// Owning slot of a channel key.
    pub fn slot_id_for_key(&self, shard_key: &str) -> u32 {
        let count = self.slot_count().max(1);
        crc32fast::hash(shard_key.as_bytes()) % count
    }

    pub fn slot(&self, id: u32) -> Result<Slot, ClusterError> {
        self.state
            .read()
            .expect("config lock")
            .slot(id)
            .cloned()
            .ok_or(ClusterError::SlotNotExist(id))
    }

    pub fn node(&self, id: u64) -> Option<Node> {
        self.state.read().expect("config lock").node(id).cloned()
    }

    pub fn node_is_online(&self, id: u64) -> bool {
        self.node(id).map(|n| n.online).unwrap_or(false)
    }

    pub fn allow_vote_nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .expect("config lock")
            .nodes
            .iter()
            .filter(|n| n.allow_vote)
            .cloned()
            .collect()
    }

    pub fn online_nodes(&self) -> Vec<Node> {
        self.state
            .read()
            .expect("config lock")
            .nodes
            .iter()
            .filter(|n| n.online)
            .cloned()
            .collect()
    }

    /// The node-leader coordinates configuration writes. Deterministic rule:
    /// lowest online allow-vote id.
    pub fn node_leader_id(&self) -> u64 {
        self.state
            .read()
            .expect("config lock")
            .nodes
            .iter()
            .filter(|n| n.online && n.allow_vote)
            .map(|n| n.id)
            .min()
            .unwrap_or(0)
    }

    pub fn is_node_leader(&self) -> bool {
        self.node_leader_id() == self.node_id
    }

    /// Flip a node's online flag. Going offline bumps its offline count and
    /// data term, per the membership lifecycle.
    pub fn set_node_online(&self, id: u64, online: bool) -> anyhow::Result<()> {
        let mut state = self.state.write().expect("config lock");
        let Some(node) = state.nodes.iter_mut().find(|n| n.id == id) else {
            return Ok(());
        };
        if node.online == online {
            return Ok(());
        }
        node.online = online;
        if !online {
            node.offline_count += 1;
            node.data_term += 1;
        }
        Self::bump_and_persist(&self.path, &mut state)
    }

    /// Record a slot leadership observed through replica hard state.
    pub fn update_slot_leader(&self, slot_id: u32, leader: u64, term: u32) -> anyhow::Result<()> {
        let mut state = self.state.write().expect("config lock");
        let Some(slot) = state.slots.iter_mut().find(|s| s.id == slot_id) else {
            return Ok(());
        };
        if slot.leader == leader && slot.term == term {
            return Ok(());
        }
        if term < slot.term {
            return Ok(());
        }
        slot.leader = leader;
        slot.term = term;
        Self::bump_and_persist(&self.path, &mut state)
    }

    /// Adopt a full configuration received from the node-leader. Older or
    /// same-version documents are ignored.
    pub fn update_config(&self, config: ClusterConfig) -> anyhow::Result<bool> {
        let mut state = self.state.write().expect("config lock");
        if config.version <= state.version {
            return Ok(false);
        }
        *state = config;
        write_atomic(&self.path, &state)?;
        Ok(true)
    }

    fn bump_and_persist(path: &Path, state: &mut ClusterConfig) -> anyhow::Result<()> {
        state.version += 1;
        write_atomic(path, state)
    }
}

fn write_atomic(path: &Path, config: &ClusterConfig) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(config).context("serialize cluster config")?;
    fs::write(&tmp, data).context("write cluster config temp file")?;
    fs::rename(&tmp, path).context("replace cluster config")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeds(n: u64) -> BTreeMap<u64, String> {
        (1..=n)
            .map(|id| (id, format!("127.0.0.1:{}", 11000 + id)))
            .collect()
    }

    #[test]
    fn initial_slots_cover_all_nodes_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let mgr =
            ClusterConfigManager::load_or_create(1, dir.path(), &seeds(3), 8, 2).unwrap();
        let config = mgr.config();
        assert_eq!(config.slots.len(), 8);
        for slot in &config.slots {
            assert_eq!(slot.replicas.len(), 2);
            assert_eq!(slot.leader, 0);
        }
        // Same seed list on another node yields the same layout.
        let dir2 = tempfile::tempdir().unwrap();
        let mgr2 =
            ClusterConfigManager::load_or_create(2, dir2.path(), &seeds(3), 8, 2).unwrap();
        let config2 = mgr2.config();
        for (a, b) in config.slots.iter().zip(config2.slots.iter()) {
            assert_eq!(a.replicas, b.replicas);
        }
    }

    #[test]
    fn version_strictly_increases_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr =
            ClusterConfigManager::load_or_create(1, dir.path(), &seeds(2), 4, 2).unwrap();
        let v0 = mgr.version();
        mgr.set_node_online(2, false).unwrap();
        let v1 = mgr.version();
        assert!(v1 > v0);
        mgr.update_slot_leader(0, 1, 1).unwrap();
        let v2 = mgr.version();
        assert!(v2 > v1);

        // Reload sees the persisted document.
        let reloaded =
            ClusterConfigManager::load_or_create(1, dir.path(), &seeds(2), 4, 2).unwrap();
        assert_eq!(reloaded.version(), v2);
        assert!(!reloaded.node_is_online(2));
        assert_eq!(reloaded.node(2).unwrap().offline_count, 1);
    }

    #[test]
    fn node_leader_is_lowest_online_voter() {
        let dir = tempfile::tempdir().unwrap();
        let mgr =
            ClusterConfigManager::load_or_create(2, dir.path(), &seeds(3), 4, 2).unwrap();
        assert_eq!(mgr.node_leader_id(), 1);
        assert!(!mgr.is_node_leader());
        mgr.set_node_online(1, false).unwrap();
        assert_eq!(mgr.node_leader_id(), 2);
        assert!(mgr.is_node_leader());
    }

    #[test]
    fn stale_config_update_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mgr =
            ClusterConfigManager::load_or_create(1, dir.path(), &seeds(2), 4, 2).unwrap();
        mgr.set_node_online(2, false).unwrap();
        let stale = ClusterConfig {
            version: 1,
            ..mgr.config()
        };
        assert!(!mgr.update_config(stale).unwrap());
        assert!(!mgr.node_is_online(2));
    }
}
