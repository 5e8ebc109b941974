// Trust & policy store: base tags, blocked tags, blocked peers
//
// One owned state object behind a single lock. Setters persist first and only
// then swap the in-memory copy, so a failed write leaves memory consistent
// with disk.

use crate::message::Message;
use crate::store::{RelayStore, StoreError};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Clone)]
struct PolicyState {
    base_tags: Vec<String>,
    blocked_tags: HashSet<String>,
    blocked_peers: HashSet<String>,
}

pub struct PolicyStore {
    store: Arc<dyn RelayStore>,
    state: RwLock<PolicyState>,
}

impl PolicyStore {
    /// Load persisted policy, seeding from configuration.
    ///
    /// Persisted base tags win over `config_base_tags` once they have been
    /// saved. Blocked peers are the union of config and persisted entries.
    pub async fn load(
        store: Arc<dyn RelayStore>,
        config_base_tags: &[String],
        config_blocked_peers: &[String],
    ) -> Result<Self, StoreError> {
        let base_tags = match store.load_base_tags().await? {
            Some(tags) => tags,
            None => dedup_tags(config_base_tags.iter().cloned()),
        };
        let blocked_tags: HashSet<String> = store.load_blocked_tags().await?.into_iter().collect();

        let mut blocked_peers: HashSet<String> =
            store.load_blocked_peers().await?.into_iter().collect();
        let before = blocked_peers.len();
        blocked_peers.extend(
            config_blocked_peers
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        );
        if blocked_peers.len() != before {
            store.save_blocked_peers(&sorted(&blocked_peers)).await?;
        }

        info!(
            "Policy loaded: {} base tags, {} blocked tags, {} blocked peers",
            base_tags.len(),
            blocked_tags.len(),
            blocked_peers.len()
        );

        Ok(Self {
            store,
            state: RwLock::new(PolicyState {
                base_tags,
                blocked_tags,
                blocked_peers,
            }),
        })
    }

    pub fn base_tags(&self) -> Vec<String> {
        self.state.read().base_tags.clone()
    }

    /// Blocked tags, sorted for stable output.
    pub fn blocked_tags(&self) -> Vec<String> {
        sorted(&self.state.read().blocked_tags)
    }

    pub fn blocked_peers(&self) -> Vec<String> {
        sorted(&self.state.read().blocked_peers)
    }

    pub fn is_peer_blocked(&self, peer_id: &str) -> bool {
        self.state.read().blocked_peers.contains(peer_id)
    }

    /// Does `message` carry any locally blocked tag?
    pub fn has_blocked_tag(&self, message: &Message) -> bool {
        let state = self.state.read();
        message.has_any_tag(&state.blocked_tags)
    }

    pub async fn set_base_tags(&self, tags: Vec<String>) -> Result<Vec<String>, StoreError> {
        let tags = dedup_tags(tags);
        self.store.save_base_tags(&tags).await?;
        self.state.write().base_tags = tags.clone();
        Ok(tags)
    }

    /// Replace the blocked-tag set wholesale.
    pub async fn set_blocked_tags(&self, tags: Vec<String>) -> Result<Vec<String>, StoreError> {
        let set: HashSet<String> = dedup_tags(tags).into_iter().collect();
        let persisted = sorted(&set);
        self.store.save_blocked_tags(&persisted).await?;
        self.state.write().blocked_tags = set;
        Ok(persisted)
    }

    pub async fn set_peer_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), StoreError> {
        let mut next = self.state.read().blocked_peers.clone();
        let changed = if blocked {
            next.insert(peer_id.to_string())
        } else {
            next.remove(peer_id)
        };
        if !changed {
            return Ok(());
        }

        self.store.save_blocked_peers(&sorted(&next)).await?;
        let mut state = self.state.write();
        if blocked {
            state.blocked_peers.insert(peer_id.to_string());
        } else {
            state.blocked_peers.remove(peer_id);
        }
        Ok(())
    }
}

/// Trim, drop empties and duplicates, keep first-seen order.
pub(crate) fn dedup_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    set.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvRelayStore, MemoryStorage};
    use serde_json::json;

    fn store() -> Arc<dyn RelayStore> {
        Arc::new(KvRelayStore::new(Arc::new(MemoryStorage::new())))
    }

    fn tagged(tags: &[&str]) -> Message {
        Message {
            id: "m".into(),
            message_type: "ping".into(),
            data: json!({}),
            sender: "a".into(),
            recipient: None,
            timestamp: 1,
            signature: String::new(),
            relay_path: vec![],
            validations: vec![],
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_config_seeds_empty_store() {
        let policy = PolicyStore::load(store(), &["relay".into(), "relay".into()], &["p1".into()])
            .await
            .unwrap();
        assert_eq!(policy.base_tags(), vec!["relay".to_string()]);
        assert!(policy.is_peer_blocked("p1"));
        assert!(policy.blocked_tags().is_empty());
    }

    #[tokio::test]
    async fn test_persisted_policy_survives_reload() {
        let store = store();
        {
            let policy = PolicyStore::load(store.clone(), &["seed".into()], &[]).await.unwrap();
            policy.set_base_tags(vec!["news".into()]).await.unwrap();
            policy.set_blocked_tags(vec!["spam".into(), " ".into()]).await.unwrap();
            policy.set_peer_blocked("bad", true).await.unwrap();
        }

        let policy = PolicyStore::load(store, &["seed".into()], &["cfg".into()]).await.unwrap();
        assert_eq!(policy.base_tags(), vec!["news".to_string()]);
        assert_eq!(policy.blocked_tags(), vec!["spam".to_string()]);
        assert_eq!(policy.blocked_peers(), vec!["bad".to_string(), "cfg".to_string()]);
    }

    #[tokio::test]
    async fn test_blocked_tag_filter() {
        let policy = PolicyStore::load(store(), &[], &[]).await.unwrap();
        policy.set_blocked_tags(vec!["spam".into()]).await.unwrap();

        assert!(policy.has_blocked_tag(&tagged(&["demo", "spam"])));
        assert!(!policy.has_blocked_tag(&tagged(&["demo"])));
        assert!(!policy.has_blocked_tag(&tagged(&[])));

        // replacing the set unblocks previous entries
        policy.set_blocked_tags(vec![]).await.unwrap();
        assert!(!policy.has_blocked_tag(&tagged(&["spam"])));
    }

    #[tokio::test]
    async fn test_unblock_peer() {
        let policy = PolicyStore::load(store(), &[], &[]).await.unwrap();
        policy.set_peer_blocked("x", true).await.unwrap();
        assert!(policy.is_peer_blocked("x"));
        policy.set_peer_blocked("x", false).await.unwrap();
        assert!(!policy.is_peer_blocked("x"));
        // idempotent
        policy.set_peer_blocked("x", false).await.unwrap();
    }

    #[test]
    fn test_dedup_tags() {
        let tags = dedup_tags(vec!["a".into(), " b ".into(), "a".into(), "".into()]);
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
    }
}
