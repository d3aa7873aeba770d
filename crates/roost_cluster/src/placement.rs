//! Channel placement: maps a channel to its leader and replica set.
//!
//! The slot leader owns placement for its channels: it synthesizes the
//! record on first use, decides whether an election is needed, polls replica
//! log heights, and persists the outcome through the slot log. Every other
//! node reads placement from its local cache or fetches it from the slot
//! leader.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use rand::seq::SliceRandom;

use crate::config::ClusterConfigManager;
use crate::error::{status, ClusterError};
use crate::slots::SlotGroup;
use crate::storage::{LogStorage, PlacementStore};
use crate::transport::{Transport, DEFAULT_REQUEST_TIMEOUT, ELECTION_REQUEST_TIMEOUT};
use crate::types::{
    paths, AppointLeaderReq, ChannelKey, ChannelPlacement, LastLogInfoReq, LastLogInfoResp,
    PlacementGetReq, SlotCommand,
};

pub struct PlacementManager {
    node_id: u64,
    config: Arc<ClusterConfigManager>,
    store: Arc<dyn PlacementStore>,
    slots: Arc<SlotGroup>,
    transport: Arc<Transport>,
    channel_log: Arc<dyn LogStorage>,
    channel_replica_count: u32,
    /// Serializes create/election per channel key.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PlacementManager {
    pub fn new(
        config: Arc<ClusterConfigManager>,
        store: Arc<dyn PlacementStore>,
        slots: Arc<SlotGroup>,
        transport: Arc<Transport>,
        channel_log: Arc<dyn LogStorage>,
        channel_replica_count: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id(),
            config,
            store,
            slots,
            transport,
            channel_log,
            channel_replica_count: channel_replica_count.max(1),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    fn key_lock(&self, shard: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("key locks");
        locks
            .entry(shard.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn store(&self) -> &Arc<dyn PlacementStore> {
        &self.store
    }

    /// Resolve the placement for a channel, creating and electing on the
    /// slot leader when needed.
    pub async fn resolve(&self, key: &ChannelKey) -> Result<ChannelPlacement, ClusterError> {
        let shard = key.shard();
        let slot_id = self.config.slot_id_for_key(&shard);
        let slot_leader = self.slots.leader_of(slot_id).await?;

        if slot_leader == self.node_id {
            self.resolve_as_slot_leader(key, slot_id).await
        } else {
            self.resolve_from_slot_leader(key, slot_leader).await
        }
    }

    async fn resolve_as_slot_leader(
        &self,
        key: &ChannelKey,
        slot_id: u32,
    ) -> Result<ChannelPlacement, ClusterError> {
        let shard = key.shard();
        let lock = self.key_lock(&shard);
        let _guard = lock.lock().await;

        let mut placement = match self.store.get(key)? {
            Some(placement) => placement,
            None => {
                let placement = self.synthesize(key)?;
                self.persist(slot_id, &placement).await?;
                placement
            }
        };

        if self.needs_election(&placement) {
            placement = self.elect(slot_id, placement).await?;
        }
        Ok(placement)
    }

    /// Initial record: this node plus randomly chosen allow-vote peers,
    /// no leader yet, term seeded from the channel log's last term.
    fn synthesize(&self, key: &ChannelKey) -> Result<ChannelPlacement, ClusterError> {
        let shard = key.shard();
        let last_term = self
            .channel_log
            .last_entry(&shard)?
            .map(|e| e.term)
            .unwrap_or(0);

        let mut replicas = vec![self.node_id];
        let mut candidates: Vec<u64> = self
            .config
            .allow_vote_nodes()
            .into_iter()
            .map(|n| n.id)
            .filter(|id| *id != self.node_id)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        for id in candidates {
            if replicas.len() >= self.channel_replica_count as usize {
                break;
            }
            replicas.push(id);
        }

        tracing::debug!(channel = %key, ?replicas, "synthesize placement");
        Ok(ChannelPlacement {
            channel_id: key.channel_id.clone(),
            channel_type: key.channel_type,
            leader_id: 0,
            replicas,
            replica_count: self.channel_replica_count,
            term: last_term,
        })
    }

    fn needs_election(&self, placement: &ChannelPlacement) -> bool {
        placement.leader_id == 0 || !self.config.node_is_online(placement.leader_id)
    }

    fn quorum(&self, placement: &ChannelPlacement) -> usize {
        if self.config.config().nodes.len() <= 1 {
            1
        } else {
            placement.replicas.len() / 2 + 1
        }
    }

    /// Elect the replica with the highest log, preferring self on ties, then
    /// persist the new placement through the slot log and notify replicas.
    async fn elect(
        &self,
        slot_id: u32,
        mut placement: ChannelPlacement,
    ) -> Result<ChannelPlacement, ClusterError> {
        let quorum = self.quorum(&placement);
        let online: Vec<u64> = placement
            .replicas
            .iter()
            .copied()
            .filter(|id| *id == self.node_id || self.config.node_is_online(*id))
            .collect();
        if online.len() < quorum {
            tracing::warn!(
                channel = %placement.key(),
                online = online.len(),
                quorum,
                "not enough online replicas for election"
            );
            return Err(ClusterError::NoLeader);
        }

        let heights = self.poll_log_heights(&placement, &online).await;
        if heights.len() < quorum {
            return Err(ClusterError::NoLeader);
        }

        let mut leader = 0u64;
        let mut leader_height = 0u64;
        for (id, height) in &heights {
            if *height > leader_height || leader == 0 {
                leader = *id;
                leader_height = *height;
            }
        }
        // Matching height on the local node wins the tie.
        if leader != self.node_id {
            if let Some(own) = heights.get(&self.node_id) {
                if *own >= leader_height {
                    leader = self.node_id;
                }
            }
        }
        if leader == 0 {
            return Err(ClusterError::NoLeader);
        }

        placement.leader_id = leader;
        placement.term += 1;
        tracing::info!(
            channel = %placement.key(),
            leader,
            term = placement.term,
            "channel leader elected"
        );
        self.persist(slot_id, &placement).await?;
        self.broadcast_appointment(&placement).await;
        Ok(placement)
    }

    /// Ask each online replica for its channel log height. The local node
    /// answers from storage directly; peers get a 10 s election deadline.
    async fn poll_log_heights(
        &self,
        placement: &ChannelPlacement,
        online: &[u64],
    ) -> HashMap<u64, u64> {
        let shard = placement.key().shard();
        let mut heights = HashMap::new();
        let mut polls = Vec::new();

        for id in online {
            if *id == self.node_id {
                if let Ok(last) = self.channel_log.last_index(&shard) {
                    heights.insert(*id, last);
                }
                continue;
            }
            let req = LastLogInfoReq {
                channel_id: placement.channel_id.clone(),
                channel_type: placement.channel_type,
            };
            let body = serde_json::to_vec(&req).unwrap_or_default();
            let transport = Arc::clone(&self.transport);
            let id = *id;
            polls.push(async move {
                match transport
                    .request(
                        id,
                        paths::CHANNEL_LAST_LOG_INFO,
                        body,
                        ELECTION_REQUEST_TIMEOUT,
                    )
                    .await
                {
                    Ok((code, body)) if code == status::OK => {
                        serde_json::from_slice::<LastLogInfoResp>(&body)
                            .ok()
                            .map(|resp| (id, resp.log_index))
                    }
                    Ok((code, _)) => {
                        tracing::warn!(to = id, code, "last log info poll rejected");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(to = id, error = %err, "last log info poll failed");
                        None
                    }
                }
            });
        }

        for result in join_all(polls).await.into_iter().flatten() {
            heights.insert(result.0, result.1);
        }
        heights
    }

    async fn persist(&self, slot_id: u32, placement: &ChannelPlacement) -> Result<(), ClusterError> {
        self.slots
            .propose_command(slot_id, &SlotCommand::SavePlacement(placement.clone()))
            .await?;
        Ok(())
    }

    /// Tell every replica about the new leader so their channel shards adopt
    /// the configuration without waiting for the next fetch.
    async fn broadcast_appointment(&self, placement: &ChannelPlacement) {
        let req = AppointLeaderReq {
            channel_id: placement.channel_id.clone(),
            channel_type: placement.channel_type,
            leader_id: placement.leader_id,
            term: placement.term,
        };
        let body = match serde_json::to_vec(&req) {
            Ok(body) => body,
            Err(_) => return,
        };
        for id in &placement.replicas {
            if *id == self.node_id {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let body = body.clone();
            let id = *id;
            tokio::spawn(async move {
                if let Err(err) = transport
                    .request(id, paths::CHANNEL_APPOINT_LEADER, body, DEFAULT_REQUEST_TIMEOUT)
                    .await
                {
                    tracing::debug!(to = id, error = %err, "appoint leader notify failed");
                }
            });
        }
    }

    /// Non-slot-leader path: local cache first, then fetch from the slot
    /// leader and cache the result.
    async fn resolve_from_slot_leader(
        &self,
        key: &ChannelKey,
        slot_leader: u64,
    ) -> Result<ChannelPlacement, ClusterError> {
        if let Some(placement) = self.store.get(key)? {
            if placement.leader_id != 0 {
                return Ok(placement);
            }
        }

        let req = PlacementGetReq {
            channel_id: key.channel_id.clone(),
            channel_type: key.channel_type,
        };
        let body = serde_json::to_vec(&req)
            .map_err(|err| ClusterError::Other(anyhow::anyhow!("encode placement get: {err}")))?;
        let (code, body) = self
            .transport
            .request(
                slot_leader,
                paths::CHANNEL_PLACEMENT_GET,
                body,
                DEFAULT_REQUEST_TIMEOUT,
            )
            .await?;
        if code != status::OK {
            return Err(ClusterError::from_status(code, "placement get"));
        }
        let placement: ChannelPlacement = serde_json::from_slice(&body)
            .map_err(|err| ClusterError::Other(anyhow::anyhow!("decode placement: {err}")))?;
        self.store.save(&placement)?;
        Ok(placement)
    }

    /// Drop the cached record, typically after a `ClusterConfigOld` answer.
    pub fn purge(&self, key: &ChannelKey) -> Result<(), ClusterError> {
        tracing::info!(channel = %key, "purge cached placement");
        self.store.delete(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ShardKind;
    use crate::shard::{SchedulerOptions, ShardScheduler};
    use crate::slots::{SlotOptions, SlotStateMachine};
    use crate::storage::{MemoryLogStorage, MemoryPlacementStore};
    use crate::transport::AddrResolver;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn single_node_manager() -> (Arc<PlacementManager>, Arc<MemoryLogStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let seeds: BTreeMap<u64, String> = [(1u64, "127.0.0.1:12001".to_string())].into();
        let config =
            Arc::new(ClusterConfigManager::load_or_create(1, dir.path(), &seeds, 4, 1).unwrap());
        let resolver: AddrResolver = Arc::new(|_| None);
        let transport = Transport::new(1, "tok".into(), resolver);
        let slot_storage = Arc::new(MemoryLogStorage::new());
        let placements = Arc::new(MemoryPlacementStore::new());
        let slots = SlotGroup::start(
            Arc::clone(&config),
            slot_storage,
            Arc::clone(&placements) as Arc<dyn PlacementStore>,
            Arc::clone(&transport),
            SlotOptions {
                tick_interval: Duration::from_millis(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Single node: slot leaders elect immediately; wait for readiness.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !slots.all_local_slots_ready().await {
            assert!(std::time::Instant::now() < deadline, "slots never elected");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let channel_log = Arc::new(MemoryLogStorage::new());
        let manager = PlacementManager::new(
            config,
            placements,
            slots,
            transport,
            Arc::clone(&channel_log) as Arc<dyn LogStorage>,
            2,
        );
        (manager, channel_log)
    }

    #[tokio::test]
    async fn slot_leader_creates_and_elects_self() {
        let (manager, _log) = single_node_manager().await;
        let key = ChannelKey::new("room", 2);
        let placement = manager.resolve(&key).await.unwrap();
        assert_eq!(placement.leader_id, 1);
        assert_eq!(placement.replicas, vec![1]);
        assert_eq!(placement.term, 1);

        // Idempotent until a new election: repeated resolves return the same
        // record.
        let again = manager.resolve(&key).await.unwrap();
        assert_eq!(again, placement);
    }

    #[tokio::test]
    async fn purge_forces_recreate() {
        let (manager, _log) = single_node_manager().await;
        let key = ChannelKey::new("room", 2);
        let first = manager.resolve(&key).await.unwrap();
        manager.purge(&key).unwrap();
        let second = manager.resolve(&key).await.unwrap();
        // A fresh record is synthesized and re-elected; term restarts from
        // the channel log's last term.
        assert_eq!(second.leader_id, 1);
        assert_eq!(second.replicas, first.replicas);
    }

    // Keep the scheduler types exercised from this module's tests.
    #[tokio::test]
    async fn slot_scheduler_is_reachable_for_raw_proposes() {
        let storage = Arc::new(MemoryLogStorage::new());
        let placements = Arc::new(MemoryPlacementStore::new());
        let resolver: AddrResolver = Arc::new(|_| None);
        let transport = Transport::new(1, "tok".into(), resolver);
        let scheduler = ShardScheduler::start(
            SchedulerOptions {
                tick_interval: Duration::from_millis(5),
                ..SchedulerOptions::new(1, ShardKind::Slot)
            },
            storage,
            Arc::new(SlotStateMachine::new(placements.clone())),
            transport,
            None,
        );
        scheduler
            .ensure_shard(
                "slot-0",
                roost_replica::replica::ReplicaConfig {
                    version: 1,
                    replicas: vec![1],
                    leader: 1,
                    term: 1,
                    ..Default::default()
                },
                roost_replica::replica::ReplicaOptions {
                    node_id: 1,
                    shard: "slot-0".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let placement = ChannelPlacement {
            channel_id: "c".into(),
            channel_type: 2,
            leader_id: 1,
            replicas: vec![1],
            replica_count: 1,
            term: 1,
        };
        let data = serde_json::to_vec(&SlotCommand::SavePlacement(placement.clone())).unwrap();
        scheduler.propose_and_wait("slot-0", vec![data]).await.unwrap();
        assert_eq!(placements.get(&placement.key()).unwrap().unwrap(), placement);
    }
}
