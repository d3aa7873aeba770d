//! Collaborator seams of the channel pipeline.
//!
//! The reactor drives these through its staged actions: payload decryption,
//! permission checks, subscriber fetch, and the delivery/ack sink. Auth,
//! push encoding, and offline queues live behind these traits; the default
//! implementations keep the pipeline complete for embedding and tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::types::{ChannelKey, ReactorMessage, ReasonCode};

/// Decrypts producer payloads before permission checks.
#[async_trait]
pub trait PayloadDecryptor: Send + Sync + 'static {
    /// Returns the clear payload, or an error when the payload is garbage.
    async fn decrypt(&self, channel: &ChannelKey, msg: &ReactorMessage)
        -> anyhow::Result<Vec<u8>>;
}

/// Identity decryptor for deployments that terminate encryption upstream.
pub struct PlainDecryptor;

#[async_trait]
impl PayloadDecryptor for PlainDecryptor {
    async fn decrypt(
        &self,
        _channel: &ChannelKey,
        msg: &ReactorMessage,
    ) -> anyhow::Result<Vec<u8>> {
        Ok(msg.payload.clone())
    }
}

/// Authorizes a sender against a channel.
#[async_trait]
pub trait PermissionChecker: Send + Sync + 'static {
    async fn check(&self, channel: &ChannelKey, from_uid: &str) -> anyhow::Result<ReasonCode>;
}

/// Allows everything; the auth collaborator is external.
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn check(&self, _channel: &ChannelKey, _from_uid: &str) -> anyhow::Result<ReasonCode> {
        Ok(ReasonCode::Success)
    }
}

/// Source of a channel's subscriber list, consulted by the channel-info
/// leader when a receiver tag is built.
#[async_trait]
pub trait SubscriberSource: Send + Sync + 'static {
    async fn subscribers(&self, channel: &ChannelKey) -> anyhow::Result<Vec<String>>;
    /// Visitor uid of a customer-service channel, when one exists.
    async fn visitor_uid(&self, _channel: &ChannelKey) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Fixed subscriber list, primarily for embedding and tests.
#[derive(Default)]
pub struct StaticSubscribers {
    subscribers: Mutex<Vec<String>>,
}

impl StaticSubscribers {
    pub fn new(subscribers: Vec<String>) -> Self {
        Self {
            subscribers: Mutex::new(subscribers),
        }
    }

    pub fn set(&self, subscribers: Vec<String>) {
        *self.subscribers.lock().expect("subscribers lock") = subscribers;
    }
}

#[async_trait]
impl SubscriberSource for StaticSubscribers {
    async fn subscribers(&self, _channel: &ChannelKey) -> anyhow::Result<Vec<String>> {
        Ok(self.subscribers.lock().expect("subscribers lock").clone())
    }
}

/// Local delivery and producer-ack sink. The push codec and offline storage
/// are external; this seam receives the fan-out for uids owned by this node
/// and acks for producers connected to this node.
#[async_trait]
pub trait DeliverySink: Send + Sync + 'static {
    async fn deliver(&self, channel: &ChannelKey, uids: &[String], messages: &[ReactorMessage]);
    async fn ack(&self, channel: &ChannelKey, message: &ReactorMessage);
}

/// Records deliveries and acks; used by tests and as a stand-in sink.
#[derive(Default)]
pub struct RecordingSink {
    pub deliveries: Mutex<Vec<(ChannelKey, Vec<String>, Vec<ReactorMessage>)>>,
    pub acks: Mutex<Vec<(ChannelKey, ReactorMessage)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().expect("sink lock").len()
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().expect("sink lock").len()
    }

    pub fn acks_snapshot(&self) -> Vec<(ChannelKey, ReactorMessage)> {
        self.acks.lock().expect("sink lock").clone()
    }

    pub fn deliveries_snapshot(&self) -> Vec<(ChannelKey, Vec<String>, Vec<ReactorMessage>)> {
        self.deliveries.lock().expect("sink lock").clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, channel: &ChannelKey, uids: &[String], messages: &[ReactorMessage]) {
        self.deliveries
            .lock()
            .expect("sink lock")
            .push((channel.clone(), uids.to_vec(), messages.to_vec()));
    }

    async fn ack(&self, channel: &ChannelKey, message: &ReactorMessage) {
        self.acks
            .lock()
            .expect("sink lock")
            .push((channel.clone(), message.clone()));
    }
}
