//! Subscriber tag service.
//!
//! A tag is a cached grouping of a channel's subscribers by the node that
//! owns each subscriber's user-slot. Delivery looks tags up by key; making a
//! new tag for a channel releases the previous one. Invalidation triggers:
//! subscription change, leadership change, and the periodic `CheckTag`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::types::ChannelKey;

/// Subscribers grouped under their owner node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUsers {
    pub node_id: u64,
    pub uids: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Tag {
    pub key: String,
    pub channel: ChannelKey,
    pub node_users: Vec<NodeUsers>,
}

impl Tag {
    pub fn uids_for(&self, node_id: u64) -> Option<&[String]> {
        self.node_users
            .iter()
            .find(|group| group.node_id == node_id)
            .map(|group| group.uids.as_slice())
    }
}

/// Group `subscribers` by owner node according to `owner_of`.
pub fn group_by_node(
    subscribers: &[String],
    mut owner_of: impl FnMut(&str) -> Option<u64>,
) -> Vec<NodeUsers> {
    let mut groups: Vec<NodeUsers> = Vec::new();
    for uid in subscribers {
        let Some(node_id) = owner_of(uid) else {
            continue;
        };
        match groups.iter_mut().find(|g| g.node_id == node_id) {
            Some(group) => group.uids.push(uid.clone()),
            None => groups.push(NodeUsers {
                node_id,
                uids: vec![uid.clone()],
            }),
        }
    }
    groups
}

#[derive(Default)]
pub struct TagManager {
    tags: RwLock<HashMap<String, Arc<Tag>>>,
    counter: AtomicU64,
}

impl TagManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_key(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let nonce: u64 = rand::thread_rng().gen();
        format!("tag-{seq}-{nonce:016x}")
    }

    /// Store a fresh grouping under a new key, releasing `previous` if given.
    pub fn make_tag(
        &self,
        channel: &ChannelKey,
        node_users: Vec<NodeUsers>,
        previous: Option<&str>,
    ) -> Arc<Tag> {
        let tag = Arc::new(Tag {
            key: self.new_key(),
            channel: channel.clone(),
            node_users,
        });
        let mut tags = self.tags.write().expect("tag lock");
        if let Some(previous) = previous {
            tags.remove(previous);
        }
        tags.insert(tag.key.clone(), Arc::clone(&tag));
        tag
    }

    pub fn get(&self, key: &str) -> Option<Arc<Tag>> {
        self.tags.read().expect("tag lock").get(key).cloned()
    }

    pub fn release(&self, key: &str) {
        self.tags.write().expect("tag lock").remove(key);
    }

    pub fn len(&self) -> usize {
        self.tags.read().expect("tag lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_collects_uids_per_node() {
        let owners: HashMap<&str, u64> = [("u1", 1), ("u2", 2), ("u3", 2)].into();
        let groups = group_by_node(
            &["u1".into(), "u2".into(), "u3".into()],
            |uid| owners.get(uid).copied(),
        );
        assert_eq!(groups.len(), 2);
        let node1 = groups.iter().find(|g| g.node_id == 1).unwrap();
        assert_eq!(node1.uids, vec!["u1".to_string()]);
        let node2 = groups.iter().find(|g| g.node_id == 2).unwrap();
        assert_eq!(node2.uids, vec!["u2".to_string(), "u3".to_string()]);
    }

    #[test]
    fn make_tag_releases_previous() {
        let manager = TagManager::new();
        let channel = ChannelKey::new("room", 2);
        let first = manager.make_tag(&channel, Vec::new(), None);
        assert!(manager.get(&first.key).is_some());

        let second = manager.make_tag(&channel, Vec::new(), Some(&first.key));
        assert!(manager.get(&first.key).is_none());
        assert!(manager.get(&second.key).is_some());
        assert_eq!(manager.len(), 1);
        assert_ne!(first.key, second.key);
    }
}
