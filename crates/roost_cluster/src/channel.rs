//! Per-channel state machine.
//!
//! A channel object sequences a producer send through the staged pipeline:
//! decrypt, permission check, storage, producer ack, delivery — or, on a
//! proxy, a single forward stage toward the channel leader. Readiness is
//! cursor-driven: each stage fires when its cursor lags the upstream cursor
//! and the stage is not already processing.

use std::collections::VecDeque;
use std::sync::RwLock;

use crate::types::{ChannelKey, ReactorMessage, ReasonCode};

/// Logical role of the local node for one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelRole {
    #[default]
    Unknown,
    Leader,
    Proxy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelStatus {
    #[default]
    Uninitialized,
    Initializing,
    Initialized,
}

/// Per-stage dispatch gate. `processing` blocks re-dispatch until the
/// action's completion callback clears it; `will_retry` holds the stage
/// closed until the back-off expires.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadyState {
    pub processing: bool,
    pub will_retry: bool,
    pub retry_tick: u64,
}

impl ReadyState {
    fn blocked(&self) -> bool {
        self.processing || self.will_retry
    }

    fn complete_ok(&mut self) {
        *self = ReadyState::default();
    }

    fn complete_retry(&mut self) {
        self.processing = false;
        self.will_retry = true;
        self.retry_tick = 0;
    }

    fn tick(&mut self, retry_tick_count: u64) {
        if self.will_retry {
            self.retry_tick += 1;
            if self.retry_tick >= retry_tick_count {
                self.will_retry = false;
                self.retry_tick = 0;
            }
        }
    }
}

/// The closed set of actions a channel can emit or absorb.
#[derive(Clone, Debug)]
pub enum ChannelAction {
    Init,
    InitResp {
        role: ChannelRole,
        leader_id: u64,
        success: bool,
    },
    Send {
        messages: Vec<ReactorMessage>,
    },
    PayloadDecrypt {
        messages: Vec<ReactorMessage>,
    },
    PayloadDecryptResp {
        messages: Vec<ReactorMessage>,
        end_index: u64,
        success: bool,
    },
    PermissionCheck {
        messages: Vec<ReactorMessage>,
    },
    PermissionCheckResp {
        reasons: Vec<(u64, ReasonCode)>,
        end_index: u64,
        success: bool,
    },
    Storage {
        messages: Vec<ReactorMessage>,
    },
    StorageResp {
        seqs: Vec<(u64, u64)>,
        end_index: u64,
        success: bool,
    },
    Sendack {
        messages: Vec<ReactorMessage>,
    },
    SendackResp {
        end_index: u64,
        success: bool,
    },
    Deliver {
        tag_key: Option<String>,
        messages: Vec<ReactorMessage>,
    },
    DeliverResp {
        end_index: u64,
        tag_key: Option<String>,
        success: bool,
    },
    Forward {
        leader_id: u64,
        messages: Vec<ReactorMessage>,
    },
    ForwardResp {
        end_index: u64,
        success: bool,
    },
    StreamPayloadDecrypt {
        messages: Vec<ReactorMessage>,
    },
    StreamPayloadDecryptResp {
        messages: Vec<ReactorMessage>,
        success: bool,
    },
    StreamDeliver {
        tag_key: Option<String>,
        messages: Vec<ReactorMessage>,
    },
    StreamDeliverResp {
        message_ids: Vec<i64>,
        tag_key: Option<String>,
        success: bool,
    },
    StreamForward {
        leader_id: u64,
        messages: Vec<ReactorMessage>,
    },
    StreamForwardResp {
        message_ids: Vec<i64>,
        success: bool,
    },
    CheckTag {
        tag_key: Option<String>,
    },
    CheckTagResp {
        tag_key: Option<String>,
    },
    Close,
}

/// Bounded in-memory queue of in-flight messages, partitioned by the stage
/// cursors. Reaped entries keep their queue positions; cursors only move
/// forward.
#[derive(Debug, Default)]
pub struct ChannelMsgQueue {
    messages: VecDeque<ReactorMessage>,
    /// Queue position of the entry before `messages[0]`.
    reaped_to: u64,
    pub last_index: u64,
    pub payload_decrypting_index: u64,
    pub permission_checking_index: u64,
    pub storaging_index: u64,
    pub sendacking_index: u64,
    pub delivering_index: u64,
    pub forwarding_index: u64,
}

impl ChannelMsgQueue {
    pub fn append(&mut self, mut msg: ReactorMessage) -> u64 {
        self.last_index += 1;
        msg.index = self.last_index;
        self.messages.push_back(msg);
        self.last_index
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut ReactorMessage> {
        if index <= self.reaped_to {
            return None;
        }
        let offset = (index - self.reaped_to - 1) as usize;
        self.messages.get_mut(offset)
    }

    /// Messages with positions in `[lo, hi]`, bounded by `max_size` payload
    /// bytes; at least one message is returned when the range is non-empty.
    /// `max_size == 0` means unbounded.
    pub fn slice_with_size(&self, lo: u64, hi: u64, max_size: u64) -> Vec<ReactorMessage> {
        let mut out = Vec::new();
        let mut size = 0u64;
        for msg in &self.messages {
            if msg.index < lo {
                continue;
            }
            if msg.index > hi {
                break;
            }
            size += msg.payload.len() as u64;
            if !out.is_empty() && max_size > 0 && size > max_size {
                break;
            }
            out.push(msg.clone());
        }
        out
    }

    /// Drop every message at or below `index`.
    pub fn truncate_to(&mut self, index: u64) {
        while let Some(front) = self.messages.front() {
            if front.index <= index {
                let popped = self.messages.pop_front().expect("front checked");
                self.reaped_to = popped.index;
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.reaped_to = 0;
        self.last_index = 0;
        self.payload_decrypting_index = 0;
        self.permission_checking_index = 0;
        self.storaging_index = 0;
        self.sendacking_index = 0;
        self.delivering_index = 0;
        self.forwarding_index = 0;
    }

    /// The six cursors must stay ordered; violated only by a bug.
    pub fn cursors_ordered(&self) -> bool {
        self.delivering_index <= self.sendacking_index
            && self.sendacking_index <= self.storaging_index
            && self.storaging_index <= self.permission_checking_index
            && self.permission_checking_index <= self.payload_decrypting_index
            && self.payload_decrypting_index <= self.last_index
            && self.forwarding_index <= self.payload_decrypting_index
    }
}

#[derive(Debug)]
struct StreamItem {
    msg: ReactorMessage,
    decrypting: bool,
    decrypted: bool,
    in_flight: bool,
    done: bool,
}

/// Side list for multi-part stream messages. They share the channel's
/// decrypt/deliver/forward gates but carry their own per-message flags.
#[derive(Debug, Default)]
pub struct StreamList {
    items: Vec<StreamItem>,
}

impl StreamList {
    pub fn push(&mut self, msg: ReactorMessage) {
        self.items.push(StreamItem {
            decrypted: !msg.is_encrypted,
            msg,
            decrypting: false,
            in_flight: false,
            done: false,
        });
    }

    pub fn has_undecrypted(&self) -> bool {
        self.items
            .iter()
            .any(|item| !item.decrypted && !item.decrypting)
    }

    pub fn undecrypted(&mut self) -> Vec<ReactorMessage> {
        let mut out = Vec::new();
        for item in &mut self.items {
            if !item.decrypted && !item.decrypting {
                item.decrypting = true;
                out.push(item.msg.clone());
            }
        }
        out
    }

    pub fn mark_decrypted(&mut self, messages: &[ReactorMessage], success: bool) {
        for done in messages {
            if let Some(item) = self
                .items
                .iter_mut()
                .find(|item| item.msg.message_id == done.message_id)
            {
                item.decrypting = false;
                if success {
                    item.decrypted = true;
                    item.msg.payload = done.payload.clone();
                    item.msg.is_encrypted = false;
                }
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.items
            .iter()
            .any(|item| item.decrypted && !item.done && !item.in_flight)
    }

    pub fn pending(&mut self) -> Vec<ReactorMessage> {
        let mut out = Vec::new();
        for item in &mut self.items {
            if item.decrypted && !item.done && !item.in_flight {
                item.in_flight = true;
                out.push(item.msg.clone());
            }
        }
        out
    }

    pub fn mark_done(&mut self, message_ids: &[i64], success: bool) {
        for id in message_ids {
            if let Some(item) = self
                .items
                .iter_mut()
                .find(|item| item.msg.message_id == *id)
            {
                item.in_flight = false;
                if success {
                    item.done = true;
                }
            }
        }
        self.items.retain(|item| !item.done);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct ChannelOptions {
    /// Ticks between init attempts.
    pub process_interval_tick: u64,
    /// Idle ticks before the channel reaps itself.
    pub deadline_tick: u64,
    /// Ticks between receiver-tag revalidations.
    pub tag_check_interval_tick: u64,
    /// Back-off ticks before a failed stage re-opens.
    pub retry_tick_count: u64,
    pub storage_max_size: u64,
    pub deliver_max_size: u64,
    pub forward_max_size: u64,
    pub decrypt_max_size: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            process_interval_tick: 1,
            deadline_tick: 3000,
            tag_check_interval_tick: 100,
            retry_tick_count: 20,
            storage_max_size: 1024 * 1024 * 2,
            deliver_max_size: 1024 * 1024 * 2,
            forward_max_size: 1024 * 1024 * 2,
            decrypt_max_size: 1024 * 1024 * 2,
        }
    }
}

pub struct Channel {
    pub key: ChannelKey,
    pub msg_queue: ChannelMsgQueue,
    pub streams: StreamList,
    actions: Vec<ChannelAction>,

    pub role: ChannelRole,
    pub status: ChannelStatus,
    pub leader_id: u64,
    pub receiver_tag_key: Option<String>,

    /// Temporary-channel subscriber list; written by transport handlers,
    /// read by tag construction.
    pub tmp_subscribers: RwLock<Vec<String>>,

    payload_decrypt_state: ReadyState,
    permission_check_state: ReadyState,
    storage_state: ReadyState,
    sendack_state: ReadyState,
    delivery_state: ReadyState,
    forward_state: ReadyState,

    init_tick: u64,
    tag_check_tick: u64,
    pub idle_tick: u64,

    opts: ChannelOptions,
}

impl Channel {
    pub fn new(key: ChannelKey, opts: ChannelOptions) -> Self {
        Self {
            key,
            msg_queue: ChannelMsgQueue::default(),
            streams: StreamList::default(),
            actions: Vec::new(),
            role: ChannelRole::Unknown,
            status: ChannelStatus::Uninitialized,
            leader_id: 0,
            receiver_tag_key: None,
            tmp_subscribers: RwLock::new(Vec::new()),
            payload_decrypt_state: ReadyState::default(),
            permission_check_state: ReadyState::default(),
            storage_state: ReadyState::default(),
            sendack_state: ReadyState::default(),
            delivery_state: ReadyState::default(),
            forward_state: ReadyState::default(),
            // First init fires immediately; failed inits wait a full
            // interval before retrying.
            init_tick: opts.process_interval_tick,
            tag_check_tick: 0,
            idle_tick: 0,
            opts,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.status == ChannelStatus::Initialized
    }

    // ------------------------------------------------------------- gating

    fn has_payload_undecrypt(&self) -> bool {
        !self.payload_decrypt_state.blocked()
            && self.msg_queue.payload_decrypting_index < self.msg_queue.last_index
    }

    fn has_permission_uncheck(&self) -> bool {
        !self.permission_check_state.blocked()
            && self.msg_queue.permission_checking_index < self.msg_queue.payload_decrypting_index
    }

    fn has_unstorage(&self) -> bool {
        !self.storage_state.blocked()
            && self.msg_queue.storaging_index < self.msg_queue.permission_checking_index
    }

    fn has_unsendack(&self) -> bool {
        !self.sendack_state.blocked()
            && self.msg_queue.sendacking_index < self.msg_queue.storaging_index
    }

    fn has_undeliver(&self) -> bool {
        !self.delivery_state.blocked()
            && self.msg_queue.delivering_index < self.msg_queue.sendacking_index
    }

    fn has_unforward(&self) -> bool {
        !self.forward_state.blocked()
            && self.msg_queue.forwarding_index < self.msg_queue.payload_decrypting_index
    }

    pub fn has_ready(&self) -> bool {
        if !self.is_initialized() {
            if self.init_tick < self.opts.process_interval_tick {
                return false;
            }
            return self.status != ChannelStatus::Initializing;
        }

        if self.has_payload_undecrypt() || self.streams.has_undecrypted() {
            return true;
        }

        match self.role {
            ChannelRole::Leader => {
                if self.has_permission_uncheck()
                    || self.has_unstorage()
                    || self.has_unsendack()
                    || self.has_undeliver()
                    || self.streams.has_pending()
                {
                    return true;
                }
            }
            ChannelRole::Proxy => {
                if self.has_unforward() || self.streams.has_pending() {
                    return true;
                }
            }
            ChannelRole::Unknown => {}
        }
        !self.actions.is_empty()
    }

    // -------------------------------------------------------------- ready

    pub fn ready(&mut self) -> Vec<ChannelAction> {
        if !self.is_initialized() {
            if self.status == ChannelStatus::Initializing {
                return Vec::new();
            }
            self.status = ChannelStatus::Initializing;
            self.init_tick = 0;
            self.actions.push(ChannelAction::Init);
            return std::mem::take(&mut self.actions);
        }

        if self.has_payload_undecrypt() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.payload_decrypting_index + 1,
                self.msg_queue.last_index,
                self.opts.decrypt_max_size,
            );
            if !msgs.is_empty() {
                self.payload_decrypt_state.processing = true;
                self.actions
                    .push(ChannelAction::PayloadDecrypt { messages: msgs });
            }
        }

        if self.streams.has_undecrypted() {
            let msgs = self.streams.undecrypted();
            if !msgs.is_empty() {
                self.actions
                    .push(ChannelAction::StreamPayloadDecrypt { messages: msgs });
            }
        }

        match self.role {
            ChannelRole::Leader => self.ready_leader(),
            ChannelRole::Proxy => self.ready_proxy(),
            ChannelRole::Unknown => {}
        }

        std::mem::take(&mut self.actions)
    }

    fn ready_leader(&mut self) {
        if self.has_permission_uncheck() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.permission_checking_index + 1,
                self.msg_queue.payload_decrypting_index,
                0,
            );
            if !msgs.is_empty() {
                self.permission_check_state.processing = true;
                self.actions
                    .push(ChannelAction::PermissionCheck { messages: msgs });
            }
        }

        if self.has_unstorage() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.storaging_index + 1,
                self.msg_queue.permission_checking_index,
                self.opts.storage_max_size,
            );
            if !msgs.is_empty() {
                self.storage_state.processing = true;
                self.actions.push(ChannelAction::Storage { messages: msgs });
            }
        }

        if self.has_unsendack() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.sendacking_index + 1,
                self.msg_queue.storaging_index,
                0,
            );
            if !msgs.is_empty() {
                self.sendack_state.processing = true;
                self.actions.push(ChannelAction::Sendack { messages: msgs });
            }
        }

        if self.has_undeliver() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.delivering_index + 1,
                self.msg_queue.sendacking_index,
                self.opts.deliver_max_size,
            );
            if !msgs.is_empty() {
                self.delivery_state.processing = true;
                self.actions.push(ChannelAction::Deliver {
                    tag_key: self.receiver_tag_key.clone(),
                    messages: msgs,
                });
            }
        }

        if self.streams.has_pending() {
            let msgs = self.streams.pending();
            if !msgs.is_empty() {
                self.actions.push(ChannelAction::StreamDeliver {
                    tag_key: self.receiver_tag_key.clone(),
                    messages: msgs,
                });
            }
        }
    }

    fn ready_proxy(&mut self) {
        if self.has_unforward() {
            let msgs = self.msg_queue.slice_with_size(
                self.msg_queue.forwarding_index + 1,
                self.msg_queue.payload_decrypting_index,
                self.opts.forward_max_size,
            );
            if !msgs.is_empty() {
                self.forward_state.processing = true;
                self.actions.push(ChannelAction::Forward {
                    leader_id: self.leader_id,
                    messages: msgs,
                });
            }
        }

        if self.streams.has_pending() {
            let msgs = self.streams.pending();
            if !msgs.is_empty() {
                self.actions.push(ChannelAction::StreamForward {
                    leader_id: self.leader_id,
                    messages: msgs,
                });
            }
        }
    }

    // --------------------------------------------------------------- tick

    pub fn tick(&mut self) {
        self.init_tick += 1;
        self.idle_tick += 1;
        if self.idle_tick >= self.opts.deadline_tick {
            self.idle_tick = 0;
            self.actions.push(ChannelAction::Close);
        }

        let retry = self.opts.retry_tick_count;
        self.payload_decrypt_state.tick(retry);
        self.permission_check_state.tick(retry);
        self.storage_state.tick(retry);
        self.sendack_state.tick(retry);
        self.delivery_state.tick(retry);
        self.forward_state.tick(retry);

        if self.role == ChannelRole::Leader {
            self.tag_check_tick += 1;
            if self.tag_check_tick >= self.opts.tag_check_interval_tick {
                self.tag_check_tick = 0;
                if self.receiver_tag_key.is_some() {
                    self.actions.push(ChannelAction::CheckTag {
                        tag_key: self.receiver_tag_key.clone(),
                    });
                }
            }
        }
    }

    // --------------------------------------------------------------- step

    /// Absorb a completion (or a send). Returns a tag key to release, when
    /// the step displaced one.
    pub fn step(&mut self, action: ChannelAction) -> Option<String> {
        match action {
            ChannelAction::Send { messages } => {
                self.idle_tick = 0;
                for mut msg in messages {
                    msg.reason_code = ReasonCode::Success;
                    if msg.is_stream {
                        self.streams.push(msg);
                    } else {
                        self.msg_queue.append(msg);
                    }
                }
                None
            }
            ChannelAction::InitResp {
                role,
                leader_id,
                success,
            } => {
                self.idle_tick = 0;
                if !success {
                    self.status = ChannelStatus::Uninitialized;
                    self.init_tick = 0;
                    return None;
                }
                self.status = ChannelStatus::Initialized;
                let released = match role {
                    ChannelRole::Leader => self.become_leader(),
                    ChannelRole::Proxy => self.become_proxy(leader_id),
                    ChannelRole::Unknown => None,
                };
                released
            }
            ChannelAction::PayloadDecryptResp {
                messages,
                end_index,
                success,
            } => {
                self.idle_tick = 0;
                if success {
                    for done in &messages {
                        if let Some(msg) = self.msg_queue.get_mut(done.index) {
                            msg.payload = done.payload.clone();
                            msg.is_encrypted = false;
                            msg.reason_code = done.reason_code;
                        }
                    }
                    self.msg_queue.payload_decrypting_index =
                        end_index.max(self.msg_queue.payload_decrypting_index);
                    self.payload_decrypt_state.complete_ok();
                } else {
                    self.payload_decrypt_state.complete_retry();
                }
                None
            }
            ChannelAction::PermissionCheckResp {
                reasons,
                end_index,
                success,
            } => {
                self.idle_tick = 0;
                if success {
                    for (index, reason) in reasons {
                        if let Some(msg) = self.msg_queue.get_mut(index) {
                            msg.reason_code = reason;
                        }
                    }
                    self.msg_queue.permission_checking_index =
                        end_index.max(self.msg_queue.permission_checking_index);
                    self.permission_check_state.complete_ok();
                } else {
                    self.permission_check_state.complete_retry();
                }
                None
            }
            ChannelAction::StorageResp {
                seqs,
                end_index,
                success,
            } => {
                self.idle_tick = 0;
                if success {
                    for (index, seq) in seqs {
                        if let Some(msg) = self.msg_queue.get_mut(index) {
                            msg.message_seq = seq;
                        }
                    }
                    self.msg_queue.storaging_index =
                        end_index.max(self.msg_queue.storaging_index);
                    self.storage_state.complete_ok();
                } else {
                    self.storage_state.complete_retry();
                }
                None
            }
            ChannelAction::SendackResp { end_index, success } => {
                if success {
                    self.msg_queue.sendacking_index =
                        end_index.max(self.msg_queue.sendacking_index);
                    self.sendack_state.complete_ok();
                    self.reap();
                } else {
                    self.sendack_state.complete_retry();
                }
                None
            }
            ChannelAction::DeliverResp {
                end_index,
                tag_key,
                success,
            } => {
                let released = if success {
                    self.msg_queue.delivering_index =
                        end_index.max(self.msg_queue.delivering_index);
                    self.delivery_state.complete_ok();
                    let released = self.swap_tag(tag_key);
                    self.reap();
                    released
                } else {
                    self.delivery_state.complete_retry();
                    None
                };
                released
            }
            ChannelAction::ForwardResp { end_index, success } => {
                if success {
                    self.msg_queue.forwarding_index =
                        end_index.max(self.msg_queue.forwarding_index);
                    self.forward_state.complete_ok();
                    self.msg_queue.truncate_to(self.msg_queue.forwarding_index);
                } else {
                    self.forward_state.complete_retry();
                }
                None
            }
            ChannelAction::StreamPayloadDecryptResp { messages, success } => {
                self.streams.mark_decrypted(&messages, success);
                None
            }
            ChannelAction::StreamDeliverResp {
                message_ids,
                tag_key,
                success,
            } => {
                self.streams.mark_done(&message_ids, success);
                if success {
                    self.swap_tag(tag_key)
                } else {
                    None
                }
            }
            ChannelAction::StreamForwardResp {
                message_ids,
                success,
            } => {
                self.streams.mark_done(&message_ids, success);
                None
            }
            ChannelAction::CheckTagResp { tag_key } => self.swap_tag(tag_key),
            // Dispatch-side variants never come back through step.
            _ => None,
        }
    }

    fn swap_tag(&mut self, tag_key: Option<String>) -> Option<String> {
        if tag_key.is_none() || tag_key == self.receiver_tag_key {
            return None;
        }
        let released = self.receiver_tag_key.take();
        self.receiver_tag_key = tag_key;
        released
    }

    /// Leaders hold a message until both the ack and the delivery have
    /// cleared it.
    fn reap(&mut self) {
        let reap_to = self
            .msg_queue
            .sendacking_index
            .min(self.msg_queue.delivering_index);
        self.msg_queue.truncate_to(reap_to);
    }

    pub fn become_leader(&mut self) -> Option<String> {
        let released = self.reset_for_role();
        self.role = ChannelRole::Leader;
        self.leader_id = 0;
        tracing::info!(channel = %self.key, "become channel leader");
        released
    }

    pub fn become_proxy(&mut self, leader_id: u64) -> Option<String> {
        let released = self.reset_for_role();
        self.role = ChannelRole::Proxy;
        self.leader_id = leader_id;
        tracing::info!(channel = %self.key, leader_id, "become channel proxy");
        released
    }

    fn reset_for_role(&mut self) -> Option<String> {
        // Queued sends survive the role switch; only stage gates and the
        // receiver tag are dropped.
        let released = self.receiver_tag_key.take();
        self.payload_decrypt_state = ReadyState::default();
        self.permission_check_state = ReadyState::default();
        self.storage_state = ReadyState::default();
        self.sendack_state = ReadyState::default();
        self.delivery_state = ReadyState::default();
        self.forward_state = ReadyState::default();
        self.idle_tick = 0;
        self.init_tick = 0;
        released
    }

    pub fn set_tmp_subscribers(&self, subscribers: Vec<String>) {
        *self.tmp_subscribers.write().expect("tmp subscribers") = subscribers;
    }

    pub fn tmp_subscribers(&self) -> Vec<String> {
        self.tmp_subscribers.read().expect("tmp subscribers").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(ch: &mut Channel, payloads: &[&str]) {
        let messages = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| ReactorMessage {
                message_id: i as i64 + 1,
                from_uid: "u1".into(),
                payload: p.as_bytes().to_vec(),
                ..Default::default()
            })
            .collect();
        ch.step(ChannelAction::Send { messages });
    }

    fn init_leader(ch: &mut Channel) {
        assert!(ch.has_ready());
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Init));
        ch.step(ChannelAction::InitResp {
            role: ChannelRole::Leader,
            leader_id: 0,
            success: true,
        });
    }

    #[test]
    fn pipeline_runs_in_stage_order() {
        let mut ch = Channel::new(ChannelKey::new("room", 2), ChannelOptions::default());
        init_leader(&mut ch);
        send(&mut ch, &["hello"]);

        // Stage 1: decrypt.
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        let ChannelAction::PayloadDecrypt { messages } = &actions[0] else {
            panic!("expected decrypt, got {actions:?}");
        };
        assert!(ch.msg_queue.cursors_ordered());
        // Stage busy: no duplicate dispatch.
        assert!(!ch.has_ready());
        ch.step(ChannelAction::PayloadDecryptResp {
            messages: messages.clone(),
            end_index: 1,
            success: true,
        });

        // Stage 2: permission check.
        let actions = ch.ready();
        let ChannelAction::PermissionCheck { messages } = &actions[0] else {
            panic!("expected permission check, got {actions:?}");
        };
        ch.step(ChannelAction::PermissionCheckResp {
            reasons: messages.iter().map(|m| (m.index, ReasonCode::Success)).collect(),
            end_index: 1,
            success: true,
        });

        // Stage 3: storage.
        let actions = ch.ready();
        let ChannelAction::Storage { messages } = &actions[0] else {
            panic!("expected storage, got {actions:?}");
        };
        ch.step(ChannelAction::StorageResp {
            seqs: messages.iter().map(|m| (m.index, m.index)).collect(),
            end_index: 1,
            success: true,
        });

        // Stage 4: producer ack; delivery waits behind it.
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ChannelAction::Sendack { .. }));
        assert!(ch.msg_queue.cursors_ordered());

        ch.step(ChannelAction::SendackResp {
            end_index: 1,
            success: true,
        });
        // Held until the delivery also clears.
        assert_eq!(ch.msg_queue.len(), 1);

        // Stage 5: deliver.
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ChannelAction::Deliver { .. }));
        ch.step(ChannelAction::DeliverResp {
            end_index: 1,
            tag_key: Some("tag-1".into()),
            success: true,
        });
        assert_eq!(ch.msg_queue.len(), 0);
        assert!(ch.msg_queue.cursors_ordered());
        assert!(!ch.has_ready());
    }

    #[test]
    fn failed_stage_retries_after_backoff() {
        let mut ch = Channel::new(ChannelKey::new("room", 2), ChannelOptions::default());
        init_leader(&mut ch);
        send(&mut ch, &["x"]);

        let actions = ch.ready();
        let ChannelAction::PayloadDecrypt { messages } = &actions[0] else {
            panic!("expected decrypt");
        };
        let messages = messages.clone();
        ch.step(ChannelAction::PayloadDecryptResp {
            messages: messages.clone(),
            end_index: 1,
            success: false,
        });

        // Gate stays closed during back-off.
        assert!(!ch.has_ready());
        for _ in 0..ChannelOptions::default().retry_tick_count {
            ch.tick();
        }
        assert!(ch.has_ready());
        // The retry re-dispatches the same indices.
        let actions = ch.ready();
        let ChannelAction::PayloadDecrypt { messages: retry } = &actions[0] else {
            panic!("expected decrypt retry");
        };
        assert_eq!(retry[0].index, messages[0].index);
    }

    #[test]
    fn proxy_forwards_decrypted_tail() {
        let mut ch = Channel::new(ChannelKey::new("room", 2), ChannelOptions::default());
        assert!(ch.has_ready());
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Init));
        ch.step(ChannelAction::InitResp {
            role: ChannelRole::Proxy,
            leader_id: 7,
            success: true,
        });
        send(&mut ch, &["a", "b"]);

        let actions = ch.ready();
        let ChannelAction::PayloadDecrypt { messages } = &actions[0] else {
            panic!("expected decrypt first");
        };
        ch.step(ChannelAction::PayloadDecryptResp {
            messages: messages.clone(),
            end_index: 2,
            success: true,
        });

        let actions = ch.ready();
        let ChannelAction::Forward { leader_id, messages } = &actions[0] else {
            panic!("expected forward, got {actions:?}");
        };
        assert_eq!(*leader_id, 7);
        assert_eq!(messages.len(), 2);
        ch.step(ChannelAction::ForwardResp {
            end_index: 2,
            success: true,
        });
        assert!(ch.msg_queue.is_empty());
    }

    #[test]
    fn idle_reap_emits_close() {
        let mut ch = Channel::new(
            ChannelKey::new("room", 2),
            ChannelOptions {
                deadline_tick: 5,
                ..Default::default()
            },
        );
        init_leader(&mut ch);
        for _ in 0..5 {
            ch.tick();
        }
        let actions = ch.ready();
        assert!(actions.iter().any(|a| matches!(a, ChannelAction::Close)));
    }

    #[test]
    fn denied_message_keeps_cursor_moving() {
        let mut ch = Channel::new(ChannelKey::new("room", 2), ChannelOptions::default());
        init_leader(&mut ch);
        send(&mut ch, &["a"]);
        let actions = ch.ready();
        let ChannelAction::PayloadDecrypt { messages } = &actions[0] else {
            panic!()
        };
        ch.step(ChannelAction::PayloadDecryptResp {
            messages: messages.clone(),
            end_index: 1,
            success: true,
        });
        let _ = ch.ready();
        ch.step(ChannelAction::PermissionCheckResp {
            reasons: vec![(1, ReasonCode::PermissionDenied)],
            end_index: 1,
            success: true,
        });
        // The denied message still flows to storage (which skips it) and to
        // sendack so the producer learns the outcome.
        let actions = ch.ready();
        assert!(matches!(actions[0], ChannelAction::Storage { .. }));
        let denied = ch.msg_queue.get_mut(1).unwrap();
        assert_eq!(denied.reason_code, ReasonCode::PermissionDenied);
    }
}
