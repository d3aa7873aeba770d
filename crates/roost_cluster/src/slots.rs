//! Slot plane: a fixed number of elected replicated-log shards.
//!
//! Each slot's log stores placement records for the channels whose key hashes
//! into it. The slot state machine applies committed commands to the local
//! placement store; leadership observed through hard-state changes is folded
//! back into the cluster configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use roost_replica::replica::{Entry, HardState, ReplicaConfig, ReplicaOptions, Role};

use crate::codec::ShardKind;
use crate::config::ClusterConfigManager;
use crate::error::ClusterError;
use crate::shard::{HardStateHook, SchedulerOptions, ShardApply, ShardScheduler};
use crate::storage::{LogStorage, PlacementStore};
use crate::transport::Transport;
use crate::types::SlotCommand;

pub fn slot_shard_key(slot_id: u32) -> String {
    format!("slot-{slot_id}")
}

pub fn parse_slot_shard_key(shard: &str) -> Option<u32> {
    shard.strip_prefix("slot-")?.parse().ok()
}

/// Applies committed slot commands to the placement store.
pub struct SlotStateMachine {
    placements: Arc<dyn PlacementStore>,
}

impl SlotStateMachine {
    pub fn new(placements: Arc<dyn PlacementStore>) -> Self {
        Self { placements }
    }
}

impl ShardApply for SlotStateMachine {
    fn apply(&self, shard: &str, entries: &[Entry]) -> anyhow::Result<u64> {
        for entry in entries {
            let cmd: SlotCommand =
                serde_json::from_slice(&entry.data).context("decode slot command")?;
            match cmd {
                SlotCommand::SavePlacement(placement) => {
                    tracing::debug!(
                        shard,
                        channel = %placement.key(),
                        leader = placement.leader_id,
                        term = placement.term,
                        "apply placement"
                    );
                    self.placements.save(&placement)?;
                }
                SlotCommand::DeletePlacement {
                    channel_id,
                    channel_type,
                } => {
                    self.placements
                        .delete(&crate::types::ChannelKey::new(channel_id, channel_type))?;
                }
            }
        }
        Ok(entries.last().map(|e| e.index).unwrap_or(0))
    }
}

#[derive(Clone)]
pub struct SlotOptions {
    pub lanes: usize,
    pub tick_interval: Duration,
    pub propose_timeout: Duration,
    pub election_interval_tick: u64,
    pub sync_interval_tick: u64,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            lanes: 2,
            tick_interval: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(5),
            election_interval_tick: 10,
            sync_interval_tick: 1,
        }
    }
}

/// The node-local slot shard group.
pub struct SlotGroup {
    node_id: u64,
    config: Arc<ClusterConfigManager>,
    scheduler: Arc<ShardScheduler>,
    opts: SlotOptions,
}

impl SlotGroup {
    pub async fn start(
        config: Arc<ClusterConfigManager>,
        storage: Arc<dyn LogStorage>,
        placements: Arc<dyn PlacementStore>,
        transport: Arc<Transport>,
        opts: SlotOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let node_id = config.node_id();

        // Leadership observed on a slot replica flows back into the local
        // cluster configuration copy.
        let hook_config = Arc::clone(&config);
        let on_hard_state: HardStateHook = Arc::new(move |shard, hs: HardState| {
            if let Some(slot_id) = parse_slot_shard_key(shard) {
                if hs.leader_id != 0 {
                    if let Err(err) = hook_config.update_slot_leader(slot_id, hs.leader_id, hs.term)
                    {
                        tracing::warn!(slot_id, error = %err, "record slot leader failed");
                    }
                }
            }
        });

        let scheduler = ShardScheduler::start(
            SchedulerOptions {
                lanes: opts.lanes,
                tick_interval: opts.tick_interval,
                propose_timeout: opts.propose_timeout,
                ..SchedulerOptions::new(node_id, ShardKind::Slot)
            },
            storage,
            Arc::new(SlotStateMachine::new(placements)),
            transport,
            Some(on_hard_state),
        );

        let group = Arc::new(Self {
            node_id,
            config,
            scheduler,
            opts,
        });
        group.ensure_local_slots().await?;
        Ok(group)
    }

    /// Create a replica for every slot this node participates in.
    async fn ensure_local_slots(&self) -> anyhow::Result<()> {
        let snapshot = self.config.config();
        for slot in &snapshot.slots {
            if !slot.replicas.contains(&self.node_id) {
                continue;
            }
            let shard = slot_shard_key(slot.id);
            let replica_config = ReplicaConfig {
                version: snapshot.version as u64,
                replicas: slot.replicas.clone(),
                learners: Vec::new(),
                leader: slot.leader,
                term: slot.term,
                role: Role::Unknown,
            };
            self.scheduler
                .ensure_shard(
                    &shard,
                    replica_config,
                    ReplicaOptions {
                        node_id: self.node_id,
                        shard: shard.clone(),
                        election_on: true,
                        election_interval_tick: self.opts.election_interval_tick,
                        sync_interval_tick: self.opts.sync_interval_tick,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| anyhow::anyhow!("ensure slot shard: {err}"))?;
        }
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<ShardScheduler> {
        &self.scheduler
    }

    /// Propose a command into a slot's log and wait for apply.
    pub async fn propose_command(
        &self,
        slot_id: u32,
        cmd: &SlotCommand,
    ) -> Result<u64, ClusterError> {
        let data = serde_json::to_vec(cmd)
            .map_err(|err| ClusterError::Other(anyhow::anyhow!("encode slot command: {err}")))?;
        let shard = slot_shard_key(slot_id);
        let (_, last) = self.scheduler.propose_and_wait(&shard, vec![data]).await?;
        Ok(last)
    }

    /// Current leader of a slot as this node sees it: live replica state
    /// first, config fallback for slots we do not replicate.
    pub async fn leader_of(&self, slot_id: u32) -> Result<u64, ClusterError> {
        let shard = slot_shard_key(slot_id);
        if let Some(info) = self.scheduler.info(&shard).await {
            if info.leader != 0 {
                return Ok(info.leader);
            }
        }
        let slot = self.config.slot(slot_id)?;
        if slot.leader == 0 {
            return Err(ClusterError::NoLeader);
        }
        Ok(slot.leader)
    }

    /// True when every slot this node replicates has an elected leader.
    pub async fn all_local_slots_ready(&self) -> bool {
        let snapshot = self.config.config();
        for slot in &snapshot.slots {
            if !slot.replicas.contains(&self.node_id) {
                continue;
            }
            match self.scheduler.info(&slot_shard_key(slot.id)).await {
                Some(info) if info.leader != 0 => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPlacementStore;
    use crate::types::ChannelPlacement;

    #[test]
    fn slot_shard_key_round_trip() {
        assert_eq!(parse_slot_shard_key(&slot_shard_key(42)), Some(42));
        assert_eq!(parse_slot_shard_key("ch@2"), None);
    }

    #[test]
    fn state_machine_applies_placement_commands() {
        let store = Arc::new(MemoryPlacementStore::new());
        let sm = SlotStateMachine::new(store.clone());
        let placement = ChannelPlacement {
            channel_id: "room".into(),
            channel_type: 2,
            leader_id: 1,
            replicas: vec![1, 2],
            replica_count: 2,
            term: 1,
        };
        let save = Entry {
            index: 1,
            term: 1,
            data: serde_json::to_vec(&SlotCommand::SavePlacement(placement.clone())).unwrap(),
        };
        let applied = sm.apply("slot-0", &[save]).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(store.get(&placement.key()).unwrap().unwrap(), placement);

        let delete = Entry {
            index: 2,
            term: 1,
            data: serde_json::to_vec(&SlotCommand::DeletePlacement {
                channel_id: "room".into(),
                channel_type: 2,
            })
            .unwrap(),
        };
        sm.apply("slot-0", &[delete]).unwrap();
        assert!(store.get(&placement.key()).unwrap().is_none());
    }
}
