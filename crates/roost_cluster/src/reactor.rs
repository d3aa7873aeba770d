//! Channel reactor: lane-partitioned driver for channel state machines.
//!
//! Channels are spread over N lanes by key hash; each lane is one task that
//! owns its channels exclusively. The lane pulls ready actions, hands them
//! to async processors (decrypt, permission, storage, ack, deliver,
//! forward), and absorbs completions through its step channel. The lane
//! itself never blocks on I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roost_replica::replica::{ReplicaConfig, ReplicaOptions, Role};
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, ChannelAction, ChannelOptions, ChannelRole, ChannelStatus};
use crate::codec::{encode_channel_batch, encode_deliver, encode_reactor_message};
use crate::config::ClusterConfigManager;
use crate::error::{status, ClusterError};
use crate::pipeline::{DeliverySink, PayloadDecryptor, PermissionChecker, SubscriberSource};
use crate::placement::PlacementManager;
use crate::shard::ShardScheduler;
use crate::slots::SlotGroup;
use crate::tag::{group_by_node, TagManager};
use crate::transport::{Transport, DEFAULT_REQUEST_TIMEOUT};
use crate::types::{
    channel_key, paths, ChannelKey, ChannelPlacement, ReactorMessage, ReasonCode,
    SubscriberGetReq, SubscriberGetResp, CHANNEL_TYPE_CUSTOMER_SERVICE, CHANNEL_TYPE_PERSON,
    CHANNEL_TYPE_TEMP,
};

/// Bound of each lane's step channel. When the queue is full, external
/// producers fail fast with `ReactorBusy`.
const STEP_QUEUE_CAPACITY: usize = 1024;

/// Everything the reactor and its processors need. No back-references: the
/// reactor owns channels, the deps own collaborators.
pub struct ReactorDeps {
    pub node_id: u64,
    pub config: Arc<ClusterConfigManager>,
    pub placement: Arc<PlacementManager>,
    pub channel_shards: Arc<ShardScheduler>,
    pub slots: Arc<SlotGroup>,
    pub transport: Arc<Transport>,
    pub tags: Arc<TagManager>,
    pub decryptor: Arc<dyn PayloadDecryptor>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub subscribers: Arc<dyn SubscriberSource>,
    pub sink: Arc<dyn DeliverySink>,
    pub channel_opts: ChannelOptions,
    pub system_uid: String,
}

impl ReactorDeps {
    fn channel_replica_options(&self, shard: &str) -> ReplicaOptions {
        ReplicaOptions {
            node_id: self.node_id,
            shard: shard.to_string(),
            election_on: false,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelSnapshot {
    pub role: ChannelRole,
    pub status: ChannelStatus,
    pub leader_id: u64,
    pub queue_len: usize,
    pub last_index: u64,
}

enum LaneMsg {
    Step {
        key: ChannelKey,
        action: ChannelAction,
        ensure: bool,
    },
    SetTmpSubscribers {
        key: ChannelKey,
        subscribers: Vec<String>,
    },
    Query {
        key: ChannelKey,
        done: oneshot::Sender<Option<ChannelSnapshot>>,
    },
}

pub struct ChannelReactor {
    lanes: Vec<mpsc::Sender<LaneMsg>>,
    stopped: Arc<AtomicBool>,
}

impl ChannelReactor {
    pub fn start(deps: Arc<ReactorDeps>, lanes: usize, tick_interval: Duration) -> Arc<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(lanes.max(1));
        for index in 0..lanes.max(1) {
            let (tx, rx) = mpsc::channel(STEP_QUEUE_CAPACITY);
            let lane = ReactorLane {
                index,
                deps: Arc::clone(&deps),
                channels: HashMap::new(),
                tx: tx.clone(),
            };
            tokio::spawn(lane.run(rx, tick_interval));
            senders.push(tx);
        }
        Arc::new(Self {
            lanes: senders,
            stopped,
        })
    }

    fn lane(&self, key: &ChannelKey) -> &mpsc::Sender<LaneMsg> {
        let idx = crc32fast::hash(key.shard().as_bytes()) as usize % self.lanes.len();
        &self.lanes[idx]
    }

    /// Producer entry: enqueue a send into the channel, creating the channel
    /// object on first use. Fails fast when the lane is saturated.
    pub fn propose_send(
        &self,
        key: &ChannelKey,
        messages: Vec<ReactorMessage>,
    ) -> Result<(), ClusterError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClusterError::ReactorStopped);
        }
        self.lane(key)
            .try_send(LaneMsg::Step {
                key: key.clone(),
                action: ChannelAction::Send { messages },
                ensure: true,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ClusterError::ReactorBusy,
                mpsc::error::TrySendError::Closed(_) => ClusterError::ReactorStopped,
            })
    }

    pub fn set_tmp_subscribers(
        &self,
        key: &ChannelKey,
        subscribers: Vec<String>,
    ) -> Result<(), ClusterError> {
        self.lane(key)
            .try_send(LaneMsg::SetTmpSubscribers {
                key: key.clone(),
                subscribers,
            })
            .map_err(|_| ClusterError::ReactorStopped)
    }

    pub async fn snapshot(&self, key: &ChannelKey) -> Option<ChannelSnapshot> {
        let (done, rx) = oneshot::channel();
        self.lane(key)
            .send(LaneMsg::Query {
                key: key.clone(),
                done,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn channel_exists(&self, key: &ChannelKey) -> bool {
        self.snapshot(key).await.is_some()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

struct ReactorLane {
    index: usize,
    deps: Arc<ReactorDeps>,
    channels: HashMap<String, Channel>,
    /// Handle processors use to feed completions back into this lane.
    tx: mpsc::Sender<LaneMsg>,
}

impl ReactorLane {
    async fn run(mut self, mut rx: mpsc::Receiver<LaneMsg>, tick_interval: Duration) {
        tracing::debug!(lane = self.index, "reactor lane started");
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for channel in self.channels.values_mut() {
                        channel.tick();
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => self.on_msg(msg),
                        None => break,
                    }
                }
            }
            self.readys();
        }
        tracing::debug!(lane = self.index, "reactor lane stopped");
    }

    fn on_msg(&mut self, msg: LaneMsg) {
        match msg {
            LaneMsg::Step {
                key,
                action,
                ensure,
            } => {
                let shard = key.shard();
                if !self.channels.contains_key(&shard) {
                    if !ensure {
                        return;
                    }
                    self.channels.insert(
                        shard.clone(),
                        Channel::new(key.clone(), self.deps.channel_opts.clone()),
                    );
                }
                let released = self
                    .channels
                    .get_mut(&shard)
                    .and_then(|channel| channel.step(action));
                if let Some(tag_key) = released {
                    self.deps.tags.release(&tag_key);
                }
            }
            LaneMsg::SetTmpSubscribers { key, subscribers } => {
                if let Some(channel) = self.channels.get(&key.shard()) {
                    channel.set_tmp_subscribers(subscribers);
                }
            }
            LaneMsg::Query { key, done } => {
                let snapshot = self.channels.get(&key.shard()).map(|ch| ChannelSnapshot {
                    role: ch.role,
                    status: ch.status,
                    leader_id: ch.leader_id,
                    queue_len: ch.msg_queue.len(),
                    last_index: ch.msg_queue.last_index,
                });
                let _ = done.send(snapshot);
            }
        }
    }

    fn readys(&mut self) {
        let mut work: Vec<(ChannelKey, Vec<String>, Vec<ChannelAction>)> = Vec::new();
        let mut closed: Vec<String> = Vec::new();

        for (shard, channel) in self.channels.iter_mut() {
            if !channel.has_ready() {
                continue;
            }
            let actions = channel.ready();
            if actions
                .iter()
                .any(|action| matches!(action, ChannelAction::Close))
            {
                closed.push(shard.clone());
                continue;
            }
            if !actions.is_empty() {
                work.push((channel.key.clone(), channel.tmp_subscribers(), actions));
            }
        }

        for shard in closed {
            if let Some(channel) = self.channels.remove(&shard) {
                tracing::debug!(channel = %channel.key, "channel closed after idle deadline");
                if let Some(tag_key) = channel.receiver_tag_key {
                    self.deps.tags.release(&tag_key);
                }
            }
        }

        for (key, tmp_subscribers, actions) in work {
            for action in actions {
                self.dispatch(&key, &tmp_subscribers, action);
            }
        }
    }

    fn dispatch(&self, key: &ChannelKey, tmp_subscribers: &[String], action: ChannelAction) {
        let deps = Arc::clone(&self.deps);
        let tx = self.tx.clone();
        let key = key.clone();
        let tmp_subscribers = tmp_subscribers.to_vec();
        tokio::spawn(async move {
            let completions: Vec<ChannelAction> = match action {
                ChannelAction::Init => vec![process_init(&deps, &key).await],
                ChannelAction::PayloadDecrypt { messages } => {
                    vec![process_payload_decrypt(&deps, &key, messages).await]
                }
                ChannelAction::PermissionCheck { messages } => {
                    vec![process_permission_check(&deps, &key, messages).await]
                }
                ChannelAction::Storage { messages } => {
                    vec![process_storage(&deps, &key, messages).await]
                }
                ChannelAction::Sendack { messages } => {
                    vec![process_sendack(&deps, &key, messages).await]
                }
                ChannelAction::Deliver { tag_key, messages } => {
                    vec![process_deliver(&deps, &key, &tmp_subscribers, tag_key, messages).await]
                }
                ChannelAction::Forward {
                    leader_id,
                    messages,
                } => process_forward(&deps, &key, leader_id, messages).await,
                ChannelAction::StreamPayloadDecrypt { messages } => {
                    vec![process_stream_decrypt(&deps, &key, messages).await]
                }
                ChannelAction::StreamDeliver { tag_key, messages } => {
                    vec![
                        process_stream_deliver(&deps, &key, &tmp_subscribers, tag_key, messages)
                            .await,
                    ]
                }
                ChannelAction::StreamForward {
                    leader_id,
                    messages,
                } => vec![process_stream_forward(&deps, &key, leader_id, messages).await],
                ChannelAction::CheckTag { tag_key } => {
                    vec![process_check_tag(&deps, &key, &tmp_subscribers, tag_key).await]
                }
                _ => Vec::new(),
            };
            for completion in completions {
                // Completions use the blocking send: losing one would wedge
                // the stage's processing gate.
                let _ = tx
                    .send(LaneMsg::Step {
                        key: key.clone(),
                        action: completion,
                        ensure: false,
                    })
                    .await;
            }
        });
    }
}

// ------------------------------------------------------------- processors

async fn process_init(deps: &ReactorDeps, key: &ChannelKey) -> ChannelAction {
    match deps.placement.resolve(key).await {
        Ok(placement) => {
            if placement.leader_id == deps.node_id {
                if let Err(err) = ensure_channel_shard(deps, &placement).await {
                    tracing::warn!(channel = %key, error = %err, "channel shard setup failed");
                    return ChannelAction::InitResp {
                        role: ChannelRole::Unknown,
                        leader_id: 0,
                        success: false,
                    };
                }
                ChannelAction::InitResp {
                    role: ChannelRole::Leader,
                    leader_id: placement.leader_id,
                    success: true,
                }
            } else {
                if placement.is_replica(deps.node_id) {
                    if let Err(err) = ensure_channel_shard(deps, &placement).await {
                        tracing::warn!(channel = %key, error = %err, "channel replica setup failed");
                    }
                }
                ChannelAction::InitResp {
                    role: ChannelRole::Proxy,
                    leader_id: placement.leader_id,
                    success: placement.leader_id != 0,
                }
            }
        }
        Err(err) => {
            tracing::warn!(channel = %key, error = %err, "placement resolve failed");
            ChannelAction::InitResp {
                role: ChannelRole::Unknown,
                leader_id: 0,
                success: false,
            }
        }
    }
}

/// Register the channel's replica-log shard according to placement.
pub async fn ensure_channel_shard(
    deps: &ReactorDeps,
    placement: &ChannelPlacement,
) -> Result<(), ClusterError> {
    let shard = placement.key().shard();
    let config = ReplicaConfig {
        version: placement.term as u64,
        replicas: placement.replicas.clone(),
        learners: Vec::new(),
        leader: placement.leader_id,
        term: placement.term,
        role: Role::Unknown,
    };
    deps.channel_shards
        .ensure_shard(&shard, config, deps.channel_replica_options(&shard))
        .await
}

async fn process_payload_decrypt(
    deps: &ReactorDeps,
    key: &ChannelKey,
    mut messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    for msg in &mut messages {
        if !msg.is_encrypted {
            continue;
        }
        match deps.decryptor.decrypt(key, msg).await {
            Ok(clear) => {
                msg.payload = clear;
                msg.is_encrypted = false;
            }
            Err(err) => {
                tracing::warn!(channel = %key, message_id = msg.message_id, error = %err, "payload decrypt failed");
                msg.reason_code = ReasonCode::SystemError;
            }
        }
    }
    ChannelAction::PayloadDecryptResp {
        messages,
        end_index,
        success: true,
    }
}

async fn process_permission_check(
    deps: &ReactorDeps,
    key: &ChannelKey,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    let mut reasons = Vec::with_capacity(messages.len());
    let mut verdicts: HashMap<String, ReasonCode> = HashMap::new();
    for msg in &messages {
        if msg.reason_code != ReasonCode::Success {
            reasons.push((msg.index, msg.reason_code));
            continue;
        }
        let verdict = match verdicts.get(&msg.from_uid) {
            Some(verdict) => *verdict,
            None => match deps.permissions.check(key, &msg.from_uid).await {
                Ok(verdict) => {
                    verdicts.insert(msg.from_uid.clone(), verdict);
                    verdict
                }
                Err(err) => {
                    tracing::warn!(channel = %key, from = %msg.from_uid, error = %err, "permission check failed");
                    return ChannelAction::PermissionCheckResp {
                        reasons: Vec::new(),
                        end_index,
                        success: false,
                    };
                }
            },
        };
        reasons.push((msg.index, verdict));
    }
    ChannelAction::PermissionCheckResp {
        reasons,
        end_index,
        success: true,
    }
}

async fn process_storage(
    deps: &ReactorDeps,
    key: &ChannelKey,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    let permitted: Vec<&ReactorMessage> = messages
        .iter()
        .filter(|m| m.reason_code == ReasonCode::Success)
        .collect();
    if permitted.is_empty() {
        return ChannelAction::StorageResp {
            seqs: Vec::new(),
            end_index,
            success: true,
        };
    }
    let batch: Vec<Vec<u8>> = permitted
        .iter()
        .map(|m| encode_reactor_message(m))
        .collect();
    match deps
        .channel_shards
        .propose_and_wait(&key.shard(), batch)
        .await
    {
        Ok((first, _last)) => {
            let seqs = permitted
                .iter()
                .enumerate()
                .map(|(i, m)| (m.index, first + i as u64))
                .collect();
            ChannelAction::StorageResp {
                seqs,
                end_index,
                success: true,
            }
        }
        Err(err) => {
            tracing::warn!(channel = %key, error = %err, "storage propose failed");
            ChannelAction::StorageResp {
                seqs: Vec::new(),
                end_index,
                success: false,
            }
        }
    }
}

async fn process_sendack(
    deps: &ReactorDeps,
    key: &ChannelKey,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    let mut success = true;
    for msg in &messages {
        if msg.from_node == deps.node_id || msg.from_node == 0 {
            deps.sink.ack(key, msg).await;
            continue;
        }
        let body = encode_channel_batch(&key.channel_id, key.channel_type, &[msg.clone()]);
        if let Err(err) = deps
            .transport
            .notify(msg.from_node, paths::CHANNEL_SENDACK, body)
            .await
        {
            tracing::warn!(channel = %key, to = msg.from_node, error = %err, "sendack notify failed");
            success = false;
        }
    }
    ChannelAction::SendackResp { end_index, success }
}

/// Build (or reuse) the receiver tag and fan messages out per node group.
async fn process_deliver(
    deps: &ReactorDeps,
    key: &ChannelKey,
    tmp_subscribers: &[String],
    tag_key: Option<String>,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    let tag = match tag_key.as_deref().and_then(|k| deps.tags.get(k)) {
        Some(tag) => tag,
        None => match make_receiver_tag(deps, key, tmp_subscribers, tag_key.as_deref()).await {
            Ok(tag) => tag,
            Err(err) => {
                tracing::warn!(channel = %key, error = %err, "receiver tag build failed");
                return ChannelAction::DeliverResp {
                    end_index,
                    tag_key: None,
                    success: false,
                };
            }
        },
    };

    let deliverable: Vec<ReactorMessage> = messages
        .iter()
        .filter(|m| m.reason_code == ReasonCode::Success)
        .cloned()
        .collect();
    let mut success = true;
    if !deliverable.is_empty() {
        for group in &tag.node_users {
            if group.node_id == deps.node_id {
                deps.sink.deliver(key, &group.uids, &deliverable).await;
                continue;
            }
            let body = encode_deliver(
                &key.channel_id,
                key.channel_type,
                &group.uids,
                &deliverable,
            );
            if let Err(err) = deps
                .transport
                .notify(group.node_id, paths::CHANNEL_DELIVER, body)
                .await
            {
                tracing::warn!(channel = %key, to = group.node_id, error = %err, "deliver notify failed");
                success = false;
            }
        }
    }

    ChannelAction::DeliverResp {
        end_index,
        tag_key: Some(tag.key.clone()),
        success,
    }
}

async fn process_forward(
    deps: &ReactorDeps,
    key: &ChannelKey,
    leader_id: u64,
    messages: Vec<ReactorMessage>,
) -> Vec<ChannelAction> {
    let end_index = messages.last().map(|m| m.index).unwrap_or(0);
    let body = encode_channel_batch(&key.channel_id, key.channel_type, &messages);

    match deps
        .transport
        .request(leader_id, paths::CHANNEL_PROPOSE, body.clone(), DEFAULT_REQUEST_TIMEOUT)
        .await
    {
        Ok((code, _)) if code == status::OK => vec![ChannelAction::ForwardResp {
            end_index,
            success: true,
        }],
        Ok((code, _)) if code == status::CLUSTER_CONFIG_OLD => {
            // Stale placement: purge the cache and re-resolve, then either
            // take over (we are the new leader), or retry once toward the
            // fresh leader and re-point the channel at it.
            tracing::info!(channel = %key, stale_leader = leader_id, "placement is old; refreshing");
            let _ = deps.placement.purge(key);
            match deps.placement.resolve(key).await {
                Ok(placement) if placement.leader_id == deps.node_id => {
                    if let Err(err) = ensure_channel_shard(deps, &placement).await {
                        tracing::warn!(channel = %key, error = %err, "takeover shard setup failed");
                        return vec![ChannelAction::ForwardResp {
                            end_index,
                            success: false,
                        }];
                    }
                    // The queued messages re-enter the pipeline through the
                    // leader stages; nothing was forwarded, so nothing
                    // duplicates.
                    vec![ChannelAction::InitResp {
                        role: ChannelRole::Leader,
                        leader_id: placement.leader_id,
                        success: true,
                    }]
                }
                Ok(placement) if placement.leader_id != 0 => {
                    let retry = deps
                        .transport
                        .request(
                            placement.leader_id,
                            paths::CHANNEL_PROPOSE,
                            body,
                            DEFAULT_REQUEST_TIMEOUT,
                        )
                        .await;
                    let success = matches!(retry, Ok((code, _)) if code == status::OK);
                    let mut completions = vec![ChannelAction::ForwardResp { end_index, success }];
                    if success {
                        // Re-point the proxy at the new leader for the next
                        // batch.
                        completions.push(ChannelAction::InitResp {
                            role: ChannelRole::Proxy,
                            leader_id: placement.leader_id,
                            success: true,
                        });
                    }
                    completions
                }
                _ => vec![ChannelAction::ForwardResp {
                    end_index,
                    success: false,
                }],
            }
        }
        Ok((code, _)) => {
            tracing::warn!(channel = %key, leader_id, code, "forward rejected");
            vec![ChannelAction::ForwardResp {
                end_index,
                success: false,
            }]
        }
        Err(err) => {
            tracing::warn!(channel = %key, leader_id, error = %err, "forward failed");
            vec![ChannelAction::ForwardResp {
                end_index,
                success: false,
            }]
        }
    }
}

async fn process_stream_decrypt(
    deps: &ReactorDeps,
    key: &ChannelKey,
    mut messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let mut success = true;
    for msg in &mut messages {
        if !msg.is_encrypted {
            continue;
        }
        match deps.decryptor.decrypt(key, msg).await {
            Ok(clear) => {
                msg.payload = clear;
                msg.is_encrypted = false;
            }
            Err(err) => {
                tracing::warn!(channel = %key, message_id = msg.message_id, error = %err, "stream decrypt failed");
                success = false;
            }
        }
    }
    ChannelAction::StreamPayloadDecryptResp { messages, success }
}

async fn process_stream_deliver(
    deps: &ReactorDeps,
    key: &ChannelKey,
    tmp_subscribers: &[String],
    tag_key: Option<String>,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let message_ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
    let tag = match tag_key.as_deref().and_then(|k| deps.tags.get(k)) {
        Some(tag) => tag,
        None => match make_receiver_tag(deps, key, tmp_subscribers, tag_key.as_deref()).await {
            Ok(tag) => tag,
            Err(err) => {
                tracing::warn!(channel = %key, error = %err, "receiver tag build failed");
                return ChannelAction::StreamDeliverResp {
                    message_ids,
                    tag_key: None,
                    success: false,
                };
            }
        },
    };
    let mut success = true;
    for group in &tag.node_users {
        if group.node_id == deps.node_id {
            deps.sink.deliver(key, &group.uids, &messages).await;
            continue;
        }
        let body = encode_deliver(&key.channel_id, key.channel_type, &group.uids, &messages);
        if deps
            .transport
            .notify(group.node_id, paths::CHANNEL_DELIVER, body)
            .await
            .is_err()
        {
            success = false;
        }
    }
    ChannelAction::StreamDeliverResp {
        message_ids,
        tag_key: Some(tag.key.clone()),
        success,
    }
}

async fn process_stream_forward(
    deps: &ReactorDeps,
    key: &ChannelKey,
    leader_id: u64,
    messages: Vec<ReactorMessage>,
) -> ChannelAction {
    let message_ids: Vec<i64> = messages.iter().map(|m| m.message_id).collect();
    let body = encode_channel_batch(&key.channel_id, key.channel_type, &messages);
    let success = matches!(
        deps.transport
            .request(leader_id, paths::CHANNEL_PROPOSE, body, DEFAULT_REQUEST_TIMEOUT)
            .await,
        Ok((code, _)) if code == status::OK
    );
    ChannelAction::StreamForwardResp {
        message_ids,
        success,
    }
}

async fn process_check_tag(
    deps: &ReactorDeps,
    key: &ChannelKey,
    tmp_subscribers: &[String],
    tag_key: Option<String>,
) -> ChannelAction {
    match make_receiver_tag(deps, key, tmp_subscribers, tag_key.as_deref()).await {
        Ok(tag) => ChannelAction::CheckTagResp {
            tag_key: Some(tag.key.clone()),
        },
        Err(err) => {
            tracing::debug!(channel = %key, error = %err, "tag re-resolve failed");
            ChannelAction::CheckTagResp { tag_key }
        }
    }
}

/// Resolve the channel's subscribers per its type, group them by the node
/// owning each subscriber's user-slot, and store the grouping under a fresh
/// tag key.
pub async fn make_receiver_tag(
    deps: &ReactorDeps,
    key: &ChannelKey,
    tmp_subscribers: &[String],
    previous: Option<&str>,
) -> Result<Arc<crate::tag::Tag>, ClusterError> {
    let mut subscribers: Vec<String> = match key.channel_type {
        CHANNEL_TYPE_PERSON => key
            .channel_id
            .split('@')
            .filter(|uid| !uid.is_empty() && *uid != deps.system_uid)
            .map(str::to_string)
            .collect(),
        CHANNEL_TYPE_TEMP => tmp_subscribers.to_vec(),
        _ => fetch_subscribers(deps, key).await?,
    };

    if key.channel_type == CHANNEL_TYPE_CUSTOMER_SERVICE {
        if let Ok(Some(visitor)) = deps.subscribers.visitor_uid(key).await {
            if !visitor.trim().is_empty() {
                subscribers.push(visitor);
            }
        }
    }

    let mut owners: HashMap<String, u64> = HashMap::new();
    for uid in &subscribers {
        let user_shard = channel_key(uid, CHANNEL_TYPE_PERSON);
        let slot_id = deps.config.slot_id_for_key(&user_shard);
        match deps.slots.leader_of(slot_id).await {
            Ok(leader) => {
                owners.insert(uid.clone(), leader);
            }
            Err(err) => {
                tracing::warn!(uid = %uid, slot_id, error = %err, "user slot leader unknown");
                return Err(err);
            }
        }
    }

    let groups = group_by_node(&subscribers, |uid| owners.get(uid).copied());
    Ok(deps.tags.make_tag(key, groups, previous))
}

/// Subscriber list for persistent channels: local store when this node holds
/// channel info, the channel-info leader over transport otherwise.
async fn fetch_subscribers(
    deps: &ReactorDeps,
    key: &ChannelKey,
) -> Result<Vec<String>, ClusterError> {
    let placement = deps.placement.resolve(key).await?;
    if placement.leader_id == deps.node_id || placement.leader_id == 0 {
        return deps
            .subscribers
            .subscribers(key)
            .await
            .map_err(ClusterError::Other);
    }
    let req = SubscriberGetReq {
        channel_id: key.channel_id.clone(),
        channel_type: key.channel_type,
    };
    let body = serde_json::to_vec(&req)
        .map_err(|err| ClusterError::Other(anyhow::anyhow!("encode subscriber get: {err}")))?;
    let (code, body) = deps
        .transport
        .request(
            placement.leader_id,
            paths::GET_SUBSCRIBERS,
            body,
            DEFAULT_REQUEST_TIMEOUT,
        )
        .await?;
    if code != status::OK {
        return Err(ClusterError::from_status(code, "subscriber get"));
    }
    let resp: SubscriberGetResp = serde_json::from_slice(&body)
        .map_err(|err| ClusterError::Other(anyhow::anyhow!("decode subscriber get: {err}")))?;
    Ok(resp.subscribers)
}
