//! Node runtime: wires configuration, storage, transport, the slot plane,
//! the channel plane, and the reactor into one process, and serves the
//! inter-node request paths the core consumes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roost_replica::replica::{Entry, Message, MessageKind, ReplicaConfig, Role};

use crate::channel::ChannelOptions;
use crate::codec::{decode_channel_batch, decode_deliver, decode_shard_message, ShardKind};
use crate::config::ClusterConfigManager;
use crate::error::{status, ClusterError};
use crate::pipeline::{
    AllowAll, DeliverySink, PayloadDecryptor, PermissionChecker, PlainDecryptor, RecordingSink,
    StaticSubscribers, SubscriberSource,
};
use crate::placement::PlacementManager;
use crate::reactor::{ChannelReactor, ReactorDeps};
use crate::shard::{SchedulerOptions, ShardApply, ShardScheduler, SHARD_MESSAGE_PATH};
use crate::slots::{slot_shard_key, SlotGroup, SlotOptions};
use crate::storage::{
    FjallLogStorage, FjallPlacementStore, LogStorage, MemoryLogStorage, MemoryPlacementStore,
    PlacementStore,
};
use crate::tag::TagManager;
use crate::transport::{AddrResolver, Transport, TransportHandler, DEFAULT_REQUEST_TIMEOUT};
use crate::types::{
    paths, AppointLeaderReq, ChannelKey, LastLogInfoReq, LastLogInfoResp, NodePingReq,
    NodePingResp, PlacementGetReq, ReactorMessage, SubscriberGetReq, SubscriberGetResp,
};

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub node_id: u64,
    pub listen_addr: String,
    /// Static seed list: node id to cluster address.
    pub init_nodes: BTreeMap<u64, String>,
    pub data_dir: PathBuf,
    pub slot_count: u32,
    pub slot_replica_count: u32,
    pub channel_replica_count: u32,
    /// Shared secret verified at transport handshake.
    pub token: String,
    pub reactor_lanes: usize,
    pub shard_lanes: usize,
    /// The single coarse time source driving every state machine.
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub channel: ChannelOptions,
    /// Use in-memory engines instead of fjall (tests, ephemeral nodes).
    pub in_memory: bool,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:11000".into(),
            init_nodes: BTreeMap::new(),
            data_dir: PathBuf::from("./roost-data"),
            slot_count: 64,
            slot_replica_count: 2,
            channel_replica_count: 2,
            token: "roost".into(),
            reactor_lanes: 4,
            shard_lanes: 4,
            tick_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            channel: ChannelOptions::default(),
            in_memory: false,
        }
    }
}

/// External collaborators of the pipeline. Defaults keep a node fully
/// functional for embedding and tests.
pub struct Collaborators {
    pub decryptor: Arc<dyn PayloadDecryptor>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub subscribers: Arc<dyn SubscriberSource>,
    pub sink: Arc<dyn DeliverySink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            decryptor: Arc::new(PlainDecryptor),
            permissions: Arc::new(AllowAll),
            subscribers: Arc::new(StaticSubscribers::default()),
            sink: Arc::new(RecordingSink::new()),
        }
    }
}

/// The channel log's state machine: entries are the payload log itself, so
/// apply only advances the cursor.
struct ChannelLogStateMachine;

impl ShardApply for ChannelLogStateMachine {
    fn apply(&self, _shard: &str, entries: &[Entry]) -> anyhow::Result<u64> {
        Ok(entries.last().map(|e| e.index).unwrap_or(0))
    }
}

pub struct Node {
    opts: NodeOptions,
    config: Arc<ClusterConfigManager>,
    transport: Arc<Transport>,
    log_storage: Arc<dyn LogStorage>,
    placement_store: Arc<dyn PlacementStore>,
    slots: Arc<SlotGroup>,
    placement: Arc<PlacementManager>,
    channel_shards: Arc<ShardScheduler>,
    reactor: Arc<ChannelReactor>,
    tags: Arc<TagManager>,
    sink: Arc<dyn DeliverySink>,
    subscribers: Arc<dyn SubscriberSource>,
    next_message_id: AtomicI64,
    stopped: AtomicBool,
}

impl Node {
    pub async fn start(opts: NodeOptions) -> anyhow::Result<Arc<Self>> {
        Self::start_with(opts, Collaborators::default()).await
    }

    pub async fn start_with(
        opts: NodeOptions,
        collaborators: Collaborators,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(ClusterConfigManager::load_or_create(
            opts.node_id,
            &opts.data_dir,
            &opts.init_nodes,
            opts.slot_count,
            opts.slot_replica_count,
        )?);

        let (log_storage, placement_store): (Arc<dyn LogStorage>, Arc<dyn PlacementStore>) =
            if opts.in_memory {
                (
                    Arc::new(MemoryLogStorage::new()),
                    Arc::new(MemoryPlacementStore::new()),
                )
            } else {
                (
                    Arc::new(FjallLogStorage::open(opts.data_dir.join("logs"))?),
                    Arc::new(FjallPlacementStore::open(opts.data_dir.join("placements"))?),
                )
            };

        let resolver: AddrResolver = {
            let config = Arc::clone(&config);
            Arc::new(move |id| config.node(id).map(|n| n.cluster_addr))
        };
        let transport = Transport::new(opts.node_id, opts.token.clone(), resolver);

        let channel_shards = ShardScheduler::start(
            SchedulerOptions {
                lanes: opts.shard_lanes,
                tick_interval: opts.tick_interval,
                ..SchedulerOptions::new(opts.node_id, ShardKind::Channel)
            },
            Arc::clone(&log_storage),
            Arc::new(ChannelLogStateMachine),
            Arc::clone(&transport),
            None,
        );

        let slots = SlotGroup::start(
            Arc::clone(&config),
            Arc::clone(&log_storage),
            Arc::clone(&placement_store),
            Arc::clone(&transport),
            SlotOptions {
                lanes: opts.shard_lanes,
                tick_interval: opts.tick_interval,
                ..Default::default()
            },
        )
        .await?;

        let placement = PlacementManager::new(
            Arc::clone(&config),
            Arc::clone(&placement_store),
            Arc::clone(&slots),
            Arc::clone(&transport),
            Arc::clone(&log_storage),
            opts.channel_replica_count,
        );

        let tags = Arc::new(TagManager::new());
        let deps = Arc::new(ReactorDeps {
            node_id: opts.node_id,
            config: Arc::clone(&config),
            placement: Arc::clone(&placement),
            channel_shards: Arc::clone(&channel_shards),
            slots: Arc::clone(&slots),
            transport: Arc::clone(&transport),
            tags: Arc::clone(&tags),
            decryptor: collaborators.decryptor,
            permissions: collaborators.permissions,
            subscribers: Arc::clone(&collaborators.subscribers),
            sink: Arc::clone(&collaborators.sink),
            channel_opts: opts.channel.clone(),
            system_uid: "system".into(),
        });
        let reactor = ChannelReactor::start(deps, opts.reactor_lanes, opts.tick_interval);

        let node = Arc::new(Self {
            config,
            transport: Arc::clone(&transport),
            log_storage,
            placement_store,
            slots,
            placement,
            channel_shards,
            reactor,
            tags,
            sink: collaborators.sink,
            subscribers: collaborators.subscribers,
            next_message_id: AtomicI64::new(1),
            stopped: AtomicBool::new(false),
            opts,
        });

        transport.set_handler(Arc::clone(&node) as Arc<dyn TransportHandler>);
        transport.start(&node.opts.listen_addr).await?;

        let heartbeat = Arc::clone(&node);
        tokio::spawn(async move {
            heartbeat.heartbeat_loop().await;
        });

        tracing::info!(node = node.opts.node_id, addr = %node.opts.listen_addr, "node started");
        Ok(node)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.reactor.stop();
        tracing::info!(node = self.opts.node_id, "node stopping");
    }

    // ------------------------------------------------------------ accessors

    pub fn id(&self) -> u64 {
        self.opts.node_id
    }

    pub fn config(&self) -> &Arc<ClusterConfigManager> {
        &self.config
    }

    pub fn reactor(&self) -> &Arc<ChannelReactor> {
        &self.reactor
    }

    pub fn placement(&self) -> &Arc<PlacementManager> {
        &self.placement
    }

    pub fn slots(&self) -> &Arc<SlotGroup> {
        &self.slots
    }

    pub fn log_storage(&self) -> &Arc<dyn LogStorage> {
        &self.log_storage
    }

    pub fn tags(&self) -> &Arc<TagManager> {
        &self.tags
    }

    // -------------------------------------------------------------- sending

    /// Producer entry point: enqueue a send into the channel's pipeline.
    pub fn propose_send(
        &self,
        channel_id: &str,
        channel_type: u8,
        from_uid: &str,
        payload: Vec<u8>,
    ) -> Result<i64, ClusterError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClusterError::ReactorStopped);
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let key = ChannelKey::new(channel_id, channel_type);
        self.reactor.propose_send(
            &key,
            vec![ReactorMessage {
                message_id,
                from_uid: from_uid.to_string(),
                from_node: self.opts.node_id,
                payload,
                ..Default::default()
            }],
        )?;
        Ok(message_id)
    }

    /// Flip a node's online flag in the local configuration copy. Intended
    /// for operators and failure-injection in tests.
    pub fn set_node_online(&self, node_id: u64, online: bool) -> anyhow::Result<()> {
        self.config.set_node_online(node_id, online)
    }

    /// Migrate a channel's leadership: bump the placement term, appoint the
    /// new leader, and broadcast the appointment to every node.
    pub async fn appoint_channel_leader(
        &self,
        channel_id: &str,
        channel_type: u8,
        leader_id: u64,
    ) -> Result<(), ClusterError> {
        let key = ChannelKey::new(channel_id, channel_type);
        let term = self
            .placement_store
            .get(&key)?
            .map(|p| p.term)
            .unwrap_or(0)
            + 1;
        let req = AppointLeaderReq {
            channel_id: channel_id.to_string(),
            channel_type,
            leader_id,
            term,
        };
        let body = serde_json::to_vec(&req)
            .map_err(|err| ClusterError::Other(anyhow::anyhow!("encode appoint: {err}")))?;
        for node in self.config.config().nodes {
            let (code, resp) = self
                .transport
                .request(
                    node.id,
                    paths::CHANNEL_APPOINT_LEADER,
                    body.clone(),
                    DEFAULT_REQUEST_TIMEOUT,
                )
                .await?;
            if code != status::OK {
                return Err(ClusterError::from_status(
                    code,
                    &String::from_utf8_lossy(&resp),
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ heartbeat

    /// Node-plane upkeep: the node-leader reassigns slots led by offline
    /// nodes and gossips its configuration version; every node folds the
    /// current configuration into its local slot replicas.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.opts.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if self.config.is_node_leader() {
                if let Err(err) = self.reassign_offline_slot_leaders() {
                    tracing::warn!(error = %err, "slot reassignment failed");
                }
                self.gossip_config_version().await;
            }
            self.sync_slot_replicas_with_config().await;
        }
    }

    /// Move leadership of any slot whose leader is offline onto an online
    /// replica, bumping the slot term and the config version.
    fn reassign_offline_slot_leaders(&self) -> anyhow::Result<()> {
        let snapshot = self.config.config();
        for slot in &snapshot.slots {
            if slot.leader == 0 {
                continue;
            }
            let leader_online = snapshot
                .node(slot.leader)
                .map(|n| n.online)
                .unwrap_or(false);
            if leader_online {
                continue;
            }
            let Some(new_leader) = slot
                .replicas
                .iter()
                .copied()
                .find(|id| snapshot.node(*id).map(|n| n.online).unwrap_or(false))
            else {
                tracing::warn!(slot = slot.id, "no online replica to take over slot");
                continue;
            };
            tracing::info!(
                slot = slot.id,
                old = slot.leader,
                new = new_leader,
                "reassign offline slot leader"
            );
            self.config
                .update_slot_leader(slot.id, new_leader, slot.term + 1)?;
        }
        Ok(())
    }

    async fn gossip_config_version(&self) {
        let version = self.config.version();
        let req = NodePingReq {
            from: self.opts.node_id,
            config_version: version,
        };
        let Ok(body) = serde_json::to_vec(&req) else {
            return;
        };
        for node in self.config.online_nodes() {
            if node.id == self.opts.node_id {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let body = body.clone();
            tokio::spawn(async move {
                let _ = transport
                    .request(node.id, paths::NODE_PING, body, Duration::from_secs(2))
                    .await;
            });
        }
    }

    /// Feed the configured slot layout into the local replicas so appointed
    /// leadership changes take effect. Only configurations that are ahead of
    /// the live replica term are stepped, so ongoing elections are not
    /// disturbed.
    async fn sync_slot_replicas_with_config(&self) {
        let snapshot = self.config.config();
        for slot in &snapshot.slots {
            if !slot.replicas.contains(&self.opts.node_id) {
                continue;
            }
            if slot.leader == 0 {
                continue;
            }
            let shard = slot_shard_key(slot.id);
            match self.slots.scheduler().info(&shard).await {
                Some(info) if slot.term > info.term => {}
                Some(_) => continue,
                None => {}
            }
            let msg = Message {
                kind: MessageKind::ConfigChange,
                from: self.opts.node_id,
                to: self.opts.node_id,
                config: Some(ReplicaConfig {
                    version: snapshot.version as u64,
                    replicas: slot.replicas.clone(),
                    learners: Vec::new(),
                    leader: slot.leader,
                    term: slot.term,
                    role: Role::Unknown,
                }),
                ..Default::default()
            };
            let _ = self.slots.scheduler().step(&shard, msg);
        }
    }

    // ------------------------------------------------------------- handlers

    async fn handle_channel_propose(&self, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok((channel_id, channel_type, messages)) = decode_channel_batch(&body) else {
            return (status::ERROR, b"bad propose body".to_vec());
        };
        let key = ChannelKey::new(channel_id, channel_type);

        // Forwarders must be pointed at the current leader; a stale target
        // answers with the dedicated status so the caller purges and
        // retries.
        match self.placement_store.get(&key) {
            Ok(Some(placement)) if placement.leader_id == self.opts.node_id => {}
            Ok(Some(_)) | Ok(None) => return (status::CLUSTER_CONFIG_OLD, Vec::new()),
            Err(err) => return (status::ERROR, err.to_string().into_bytes()),
        }

        match self.reactor.propose_send(&key, messages) {
            Ok(()) => (status::OK, Vec::new()),
            Err(err) => (err.to_status(), err.to_string().into_bytes()),
        }
    }

    async fn handle_placement_get(&self, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok(req) = serde_json::from_slice::<PlacementGetReq>(&body) else {
            return (status::ERROR, b"bad placement request".to_vec());
        };
        let key = ChannelKey::new(req.channel_id, req.channel_type);
        match self.placement.resolve(&key).await {
            Ok(placement) => match serde_json::to_vec(&placement) {
                Ok(body) => (status::OK, body),
                Err(err) => (status::ERROR, err.to_string().into_bytes()),
            },
            Err(err) => (err.to_status(), err.to_string().into_bytes()),
        }
    }

    async fn handle_last_log_info(&self, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok(req) = serde_json::from_slice::<LastLogInfoReq>(&body) else {
            return (status::ERROR, b"bad last log info request".to_vec());
        };
        let key = ChannelKey::new(req.channel_id, req.channel_type);
        let shard = key.shard();
        let resp = match self.log_storage.last_entry(&shard) {
            Ok(last) => LastLogInfoResp {
                log_index: last.as_ref().map(|e| e.index).unwrap_or(0),
                term: last.as_ref().map(|e| e.term).unwrap_or(0),
            },
            Err(err) => return (status::ERROR, err.to_string().into_bytes()),
        };
        match serde_json::to_vec(&resp) {
            Ok(body) => (status::OK, body),
            Err(err) => (status::ERROR, err.to_string().into_bytes()),
        }
    }

    async fn handle_appoint_leader(&self, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok(req) = serde_json::from_slice::<crate::types::AppointLeaderReq>(&body) else {
            return (status::ERROR, b"bad appoint leader request".to_vec());
        };
        let key = ChannelKey::new(req.channel_id.clone(), req.channel_type);
        let mut placement = match self.placement_store.get(&key) {
            Ok(Some(placement)) => placement,
            Ok(None) => crate::types::ChannelPlacement {
                channel_id: req.channel_id,
                channel_type: req.channel_type,
                leader_id: 0,
                replicas: vec![req.leader_id],
                replica_count: 1,
                term: 0,
            },
            Err(err) => return (status::ERROR, err.to_string().into_bytes()),
        };
        if req.term < placement.term {
            return (status::OK, Vec::new());
        }
        placement.leader_id = req.leader_id;
        placement.term = req.term;
        if let Err(err) = self.placement_store.save(&placement) {
            return (status::ERROR, err.to_string().into_bytes());
        }
        // A live replica adopts the new leader without waiting for the next
        // placement fetch.
        if placement.is_replica(self.opts.node_id) {
            let config = ReplicaConfig {
                version: placement.term as u64,
                replicas: placement.replicas.clone(),
                learners: Vec::new(),
                leader: placement.leader_id,
                term: placement.term,
                role: Role::Unknown,
            };
            let msg = Message {
                kind: MessageKind::ConfigChange,
                from: self.opts.node_id,
                to: self.opts.node_id,
                config: Some(config),
                ..Default::default()
            };
            let _ = self.channel_shards.step(&key.shard(), msg);
        }
        (status::OK, Vec::new())
    }

    async fn handle_get_subscribers(&self, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok(req) = serde_json::from_slice::<SubscriberGetReq>(&body) else {
            return (status::ERROR, b"bad subscriber request".to_vec());
        };
        let key = ChannelKey::new(req.channel_id, req.channel_type);
        match self.subscribers.subscribers(&key).await {
            Ok(subscribers) => {
                let resp = SubscriberGetResp { subscribers };
                match serde_json::to_vec(&resp) {
                    Ok(body) => (status::OK, body),
                    Err(err) => (status::ERROR, err.to_string().into_bytes()),
                }
            }
            Err(err) => (status::ERROR, err.to_string().into_bytes()),
        }
    }

    async fn handle_node_ping(&self, from: u64, body: Vec<u8>) -> (u8, Vec<u8>) {
        let Ok(req) = serde_json::from_slice::<NodePingReq>(&body) else {
            return (status::ERROR, b"bad node ping".to_vec());
        };
        let ours = self.config.version();
        if req.config_version > ours {
            // The leader has a newer document; pull it before answering so
            // the next ping sees the updated version.
            self.pull_config_from(from).await;
        }
        let resp = NodePingResp {
            config_version: self.config.version(),
        };
        (status::OK, serde_json::to_vec(&resp).unwrap_or_default())
    }

    async fn pull_config_from(&self, from: u64) {
        match self
            .transport
            .request(from, paths::NODE_CONFIG_GET, Vec::new(), Duration::from_secs(2))
            .await
        {
            Ok((code, body)) if code == status::OK => {
                match serde_json::from_slice(&body) {
                    Ok(config) => {
                        if let Err(err) = self.config.update_config(config) {
                            tracing::warn!(error = %err, "apply gossiped config failed");
                        } else {
                            self.sync_slot_replicas_with_config().await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "bad gossiped config");
                    }
                }
            }
            _ => {}
        }
    }

    /// Channel-plane replica traffic may target a shard that does not exist
    /// here yet (a fresh follower): resolve placement and register it before
    /// stepping.
    async fn step_channel_message(&self, shard: String, msg: Message) {
        if let Some((channel_id, channel_type)) = split_channel_shard(&shard) {
            let key = ChannelKey::new(channel_id, channel_type);
            let placement = match self.placement_store.get(&key) {
                Ok(Some(placement)) => Some(placement),
                Ok(None) => self.placement.resolve(&key).await.ok(),
                Err(err) => {
                    tracing::warn!(shard, error = %err, "placement read failed");
                    None
                }
            };
            if let Some(placement) = placement {
                if placement.is_replica(self.opts.node_id) {
                    let config = ReplicaConfig {
                        version: placement.term as u64,
                        replicas: placement.replicas.clone(),
                        learners: Vec::new(),
                        leader: placement.leader_id,
                        term: placement.term,
                        role: Role::Unknown,
                    };
                    let _ = self
                        .channel_shards
                        .ensure_shard(
                            &shard,
                            config,
                            roost_replica::replica::ReplicaOptions {
                                node_id: self.opts.node_id,
                                shard: shard.clone(),
                                election_on: false,
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
        }
        let _ = self.channel_shards.step(&shard, msg);
    }
}

fn split_channel_shard(shard: &str) -> Option<(String, u8)> {
    let at = shard.rfind('@')?;
    let channel_type = shard[at + 1..].parse().ok()?;
    Some((shard[..at].to_string(), channel_type))
}

#[async_trait]
impl TransportHandler for Node {
    async fn handle_request(&self, from: u64, path: &str, body: Vec<u8>) -> (u8, Vec<u8>) {
        match path {
            paths::CHANNEL_PROPOSE => self.handle_channel_propose(body).await,
            paths::CHANNEL_PLACEMENT_GET => self.handle_placement_get(body).await,
            paths::CHANNEL_LAST_LOG_INFO => self.handle_last_log_info(body).await,
            paths::CHANNEL_APPOINT_LEADER => self.handle_appoint_leader(body).await,
            paths::GET_SUBSCRIBERS => self.handle_get_subscribers(body).await,
            paths::NODE_PING => self.handle_node_ping(from, body).await,
            paths::NODE_CONFIG_GET => {
                match serde_json::to_vec(&self.config.config()) {
                    Ok(body) => (status::OK, body),
                    Err(err) => (status::ERROR, err.to_string().into_bytes()),
                }
            }
            _ => (status::NOT_FOUND, format!("unknown path {path}").into_bytes()),
        }
    }

    async fn handle_notify(&self, _from: u64, path: &str, body: Vec<u8>) {
        match path {
            SHARD_MESSAGE_PATH => match decode_shard_message(&body) {
                Ok((ShardKind::Slot, shard, msg)) => {
                    let _ = self.slots.scheduler().step(&shard, msg);
                }
                Ok((ShardKind::Channel, shard, msg)) => {
                    self.step_channel_message(shard, msg).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "bad shard message");
                }
            },
            paths::CHANNEL_DELIVER => match decode_deliver(&body) {
                Ok((channel_id, channel_type, uids, messages)) => {
                    let key = ChannelKey::new(channel_id, channel_type);
                    self.sink.deliver(&key, &uids, &messages).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "bad deliver body");
                }
            },
            paths::CHANNEL_SENDACK => match decode_channel_batch(&body) {
                Ok((channel_id, channel_type, messages)) => {
                    let key = ChannelKey::new(channel_id, channel_type);
                    for msg in &messages {
                        self.sink.ack(&key, msg).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "bad sendack body");
                }
            },
            _ => {
                tracing::debug!(path, "unknown notify path");
            }
        }
    }
}
