//! Binary codecs for log entries and replica traffic.
//!
//! Everything on the wire and in the log is big-endian with length-prefixed
//! variable fields. Control-plane bodies (placement, subscriber lists) use
//! JSON instead; these codecs cover the hot paths.

use roost_replica::replica::{Entry, Message, MessageKind, ReplicaConfig, Role, SpeedLevel};

use crate::types::{ReactorMessage, ReasonCode};

pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.extend_from_slice(v);
}

pub fn put_str(out: &mut Vec<u8>, v: &str) {
    put_bytes(out, v.as_bytes());
}

pub fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset + 1 <= data.len(), "short u8");
    let v = data[*offset];
    *offset += 1;
    Ok(v)
}

pub fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_i64(data: &[u8], offset: &mut usize) -> anyhow::Result<i64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short i64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(i64::from_be_bytes(buf))
}

pub fn read_bytes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    anyhow::ensure!(*offset + len <= data.len(), "short bytes");
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}

pub fn read_str(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("invalid utf8 string"))
}

// ------------------------------------------------------------ reactor message

pub fn encode_reactor_message(msg: &ReactorMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + msg.payload.len());
    put_u64(&mut out, msg.index);
    put_i64(&mut out, msg.message_id);
    put_u64(&mut out, msg.message_seq);
    put_str(&mut out, &msg.from_uid);
    put_u64(&mut out, msg.from_node);
    put_u64(&mut out, msg.from_conn_id);
    put_u8(&mut out, msg.is_encrypted as u8);
    put_u8(&mut out, msg.is_stream as u8);
    put_u8(&mut out, msg.reason_code.as_u8());
    put_bytes(&mut out, &msg.payload);
    out
}

pub fn decode_reactor_message(data: &[u8]) -> anyhow::Result<ReactorMessage> {
    let mut offset = 0usize;
    let index = read_u64(data, &mut offset)?;
    let message_id = read_i64(data, &mut offset)?;
    let message_seq = read_u64(data, &mut offset)?;
    let from_uid = read_str(data, &mut offset)?;
    let from_node = read_u64(data, &mut offset)?;
    let from_conn_id = read_u64(data, &mut offset)?;
    let is_encrypted = read_u8(data, &mut offset)? != 0;
    let is_stream = read_u8(data, &mut offset)? != 0;
    let reason_code = ReasonCode::from_u8(read_u8(data, &mut offset)?);
    let payload = read_bytes(data, &mut offset)?;
    Ok(ReactorMessage {
        index,
        message_id,
        message_seq,
        from_uid,
        from_node,
        from_conn_id,
        payload,
        is_encrypted,
        is_stream,
        reason_code,
    })
}

/// Body of a forwarded propose and of fan-out frames: the channel key plus a
/// message batch.
pub fn encode_channel_batch(channel_id: &str, channel_type: u8, msgs: &[ReactorMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    put_str(&mut out, channel_id);
    put_u8(&mut out, channel_type);
    let body = encode_reactor_messages(msgs);
    out.extend_from_slice(&body);
    out
}

pub fn decode_channel_batch(data: &[u8]) -> anyhow::Result<(String, u8, Vec<ReactorMessage>)> {
    let mut offset = 0usize;
    let channel_id = read_str(data, &mut offset)?;
    let channel_type = read_u8(data, &mut offset)?;
    let msgs = decode_reactor_messages(&data[offset..])?;
    Ok((channel_id, channel_type, msgs))
}

/// Body of a remote delivery: channel key, target uids, message batch.
pub fn encode_deliver(
    channel_id: &str,
    channel_type: u8,
    uids: &[String],
    msgs: &[ReactorMessage],
) -> Vec<u8> {
    let mut out = Vec::new();
    put_str(&mut out, channel_id);
    put_u8(&mut out, channel_type);
    put_u32(&mut out, uids.len() as u32);
    for uid in uids {
        put_str(&mut out, uid);
    }
    let body = encode_reactor_messages(msgs);
    out.extend_from_slice(&body);
    out
}

pub fn decode_deliver(data: &[u8]) -> anyhow::Result<(String, u8, Vec<String>, Vec<ReactorMessage>)> {
    let mut offset = 0usize;
    let channel_id = read_str(data, &mut offset)?;
    let channel_type = read_u8(data, &mut offset)?;
    let uid_count = read_u32(data, &mut offset)? as usize;
    let mut uids = Vec::with_capacity(uid_count);
    for _ in 0..uid_count {
        uids.push(read_str(data, &mut offset)?);
    }
    let msgs = decode_reactor_messages(&data[offset..])?;
    Ok((channel_id, channel_type, uids, msgs))
}

pub fn encode_reactor_messages(msgs: &[ReactorMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, msgs.len() as u32);
    for msg in msgs {
        let body = encode_reactor_message(msg);
        put_bytes(&mut out, &body);
    }
    out
}

pub fn decode_reactor_messages(data: &[u8]) -> anyhow::Result<Vec<ReactorMessage>> {
    let mut offset = 0usize;
    let count = read_u32(data, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let body = read_bytes(data, &mut offset)?;
        out.push(decode_reactor_message(&body)?);
    }
    Ok(out)
}

// -------------------------------------------------------------- replica wire

fn put_entry(out: &mut Vec<u8>, entry: &Entry) {
    put_u64(out, entry.index);
    put_u32(out, entry.term);
    put_bytes(out, &entry.data);
}

fn read_entry(data: &[u8], offset: &mut usize) -> anyhow::Result<Entry> {
    let index = read_u64(data, offset)?;
    let term = read_u32(data, offset)?;
    let payload = read_bytes(data, offset)?;
    Ok(Entry {
        index,
        term,
        data: payload,
    })
}

fn put_config(out: &mut Vec<u8>, cfg: &ReplicaConfig) {
    put_u64(out, cfg.version);
    put_u64(out, cfg.leader);
    put_u32(out, cfg.term);
    put_u8(out, role_to_u8(cfg.role));
    put_u32(out, cfg.replicas.len() as u32);
    for id in &cfg.replicas {
        put_u64(out, *id);
    }
    put_u32(out, cfg.learners.len() as u32);
    for id in &cfg.learners {
        put_u64(out, *id);
    }
}

fn read_config(data: &[u8], offset: &mut usize) -> anyhow::Result<ReplicaConfig> {
    let version = read_u64(data, offset)?;
    let leader = read_u64(data, offset)?;
    let term = read_u32(data, offset)?;
    let role = role_from_u8(read_u8(data, offset)?);
    let replica_count = read_u32(data, offset)? as usize;
    let mut replicas = Vec::with_capacity(replica_count);
    for _ in 0..replica_count {
        replicas.push(read_u64(data, offset)?);
    }
    let learner_count = read_u32(data, offset)? as usize;
    let mut learners = Vec::with_capacity(learner_count);
    for _ in 0..learner_count {
        learners.push(read_u64(data, offset)?);
    }
    Ok(ReplicaConfig {
        version,
        replicas,
        learners,
        leader,
        term,
        role,
    })
}

fn role_to_u8(role: Role) -> u8 {
    match role {
        Role::Unknown => 0,
        Role::Leader => 1,
        Role::Follower => 2,
        Role::Candidate => 3,
        Role::Learner => 4,
    }
}

fn role_from_u8(v: u8) -> Role {
    match v {
        1 => Role::Leader,
        2 => Role::Follower,
        3 => Role::Candidate,
        4 => Role::Learner,
        _ => Role::Unknown,
    }
}

fn kind_to_u8(kind: MessageKind) -> u8 {
    match kind {
        MessageKind::None => 0,
        MessageKind::Init => 1,
        MessageKind::InitResp => 2,
        MessageKind::Propose => 3,
        MessageKind::StoreAppend => 4,
        MessageKind::StoreAppendResp => 5,
        MessageKind::StoreTruncate => 6,
        MessageKind::StoreTruncateResp => 7,
        MessageKind::ApplyLogs => 8,
        MessageKind::ApplyLogsResp => 9,
        MessageKind::SyncReq => 10,
        MessageKind::SyncGet => 11,
        MessageKind::SyncGetResp => 12,
        MessageKind::SyncResp => 13,
        MessageKind::SyncTimeout => 14,
        MessageKind::Ping => 15,
        MessageKind::Pong => 16,
        MessageKind::VoteReq => 17,
        MessageKind::VoteResp => 18,
        MessageKind::Beat => 19,
        MessageKind::Hup => 20,
        MessageKind::ConfigReq => 21,
        MessageKind::ConfigResp => 22,
        MessageKind::ConfigChange => 23,
        MessageKind::LogConflictCheck => 24,
        MessageKind::LogConflictCheckResp => 25,
        MessageKind::LearnerToFollower => 26,
        MessageKind::LearnerToLeader => 27,
        MessageKind::FollowerToLeader => 28,
        MessageKind::SpeedLevelChange => 29,
    }
}

fn kind_from_u8(v: u8) -> MessageKind {
    match v {
        1 => MessageKind::Init,
        2 => MessageKind::InitResp,
        3 => MessageKind::Propose,
        4 => MessageKind::StoreAppend,
        5 => MessageKind::StoreAppendResp,
        6 => MessageKind::StoreTruncate,
        7 => MessageKind::StoreTruncateResp,
        8 => MessageKind::ApplyLogs,
        9 => MessageKind::ApplyLogsResp,
        10 => MessageKind::SyncReq,
        11 => MessageKind::SyncGet,
        12 => MessageKind::SyncGetResp,
        13 => MessageKind::SyncResp,
        14 => MessageKind::SyncTimeout,
        15 => MessageKind::Ping,
        16 => MessageKind::Pong,
        17 => MessageKind::VoteReq,
        18 => MessageKind::VoteResp,
        19 => MessageKind::Beat,
        20 => MessageKind::Hup,
        21 => MessageKind::ConfigReq,
        22 => MessageKind::ConfigResp,
        23 => MessageKind::ConfigChange,
        24 => MessageKind::LogConflictCheck,
        25 => MessageKind::LogConflictCheckResp,
        26 => MessageKind::LearnerToFollower,
        27 => MessageKind::LearnerToLeader,
        28 => MessageKind::FollowerToLeader,
        29 => MessageKind::SpeedLevelChange,
        _ => MessageKind::None,
    }
}

/// Scope of a replica frame: which plane owns the shard key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardKind {
    Slot,
    Channel,
}

/// Encode a replica message addressed to `shard` on a peer node.
pub fn encode_shard_message(kind: ShardKind, shard: &str, msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + shard.len());
    put_u8(
        &mut out,
        match kind {
            ShardKind::Slot => 0,
            ShardKind::Channel => 1,
        },
    );
    put_str(&mut out, shard);
    put_u8(&mut out, kind_to_u8(msg.kind));
    put_u64(&mut out, msg.from);
    put_u64(&mut out, msg.to);
    put_u32(&mut out, msg.term);
    put_u64(&mut out, msg.index);
    put_u64(&mut out, msg.committed_index);
    put_u64(&mut out, msg.applied_index);
    put_u8(&mut out, msg.reject as u8);
    put_u8(&mut out, msg.speed_level.as_u8());
    put_u64(&mut out, msg.conf_version);
    put_u64(&mut out, msg.transfer_to);
    put_u32(&mut out, msg.entries.len() as u32);
    for entry in &msg.entries {
        put_entry(&mut out, entry);
    }
    match &msg.config {
        Some(cfg) => {
            put_u8(&mut out, 1);
            put_config(&mut out, cfg);
        }
        None => put_u8(&mut out, 0),
    }
    out
}

pub fn decode_shard_message(data: &[u8]) -> anyhow::Result<(ShardKind, String, Message)> {
    let mut offset = 0usize;
    let kind = match read_u8(data, &mut offset)? {
        0 => ShardKind::Slot,
        1 => ShardKind::Channel,
        other => anyhow::bail!("unknown shard kind {other}"),
    };
    let shard = read_str(data, &mut offset)?;
    let msg_kind = kind_from_u8(read_u8(data, &mut offset)?);
    let from = read_u64(data, &mut offset)?;
    let to = read_u64(data, &mut offset)?;
    let term = read_u32(data, &mut offset)?;
    let index = read_u64(data, &mut offset)?;
    let committed_index = read_u64(data, &mut offset)?;
    let applied_index = read_u64(data, &mut offset)?;
    let reject = read_u8(data, &mut offset)? != 0;
    let speed_level = SpeedLevel::from_u8(read_u8(data, &mut offset)?);
    let conf_version = read_u64(data, &mut offset)?;
    let transfer_to = read_u64(data, &mut offset)?;
    let entry_count = read_u32(data, &mut offset)? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        entries.push(read_entry(data, &mut offset)?);
    }
    let config = if read_u8(data, &mut offset)? != 0 {
        Some(read_config(data, &mut offset)?)
    } else {
        None
    };
    Ok((
        kind,
        shard,
        Message {
            kind: msg_kind,
            from,
            to,
            term,
            index,
            committed_index,
            applied_index,
            reject,
            speed_level,
            conf_version,
            entries,
            config,
            transfer_to,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_message_codec_preserves_fields() {
        let msg = ReactorMessage {
            index: 4,
            message_id: -7,
            message_seq: 42,
            from_uid: "u1".into(),
            from_node: 3,
            from_conn_id: 9,
            payload: b"payload".to_vec(),
            is_encrypted: true,
            is_stream: false,
            reason_code: ReasonCode::PermissionDenied,
        };
        let got = decode_reactor_message(&encode_reactor_message(&msg)).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn shard_message_codec_carries_entries_and_config() {
        let msg = Message {
            kind: MessageKind::SyncResp,
            from: 1,
            to: 2,
            term: 3,
            index: 10,
            committed_index: 8,
            entries: vec![Entry {
                index: 10,
                term: 3,
                data: b"x".to_vec(),
            }],
            config: Some(ReplicaConfig {
                version: 5,
                replicas: vec![1, 2],
                leader: 1,
                term: 3,
                ..Default::default()
            }),
            ..Default::default()
        };
        let encoded = encode_shard_message(ShardKind::Channel, "room@2", &msg);
        let (kind, shard, got) = decode_shard_message(&encoded).unwrap();
        assert_eq!(kind, ShardKind::Channel);
        assert_eq!(shard, "room@2");
        assert_eq!(got.kind, MessageKind::SyncResp);
        assert_eq!(got.entries.len(), 1);
        assert_eq!(got.config.unwrap().replicas, vec![1, 2]);
    }
}
