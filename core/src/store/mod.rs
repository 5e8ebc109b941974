// Store module: the persistence collaborator the relay engine talks to
//
// The engine only sees the `RelayStore` trait. `KvRelayStore` implements it
// on any `StorageBackend` (sled on disk, or memory).

pub mod backend;
mod relay_store;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};
pub use relay_store::KvRelayStore;

use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Durable record of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    /// Hex-encoded Ed25519 public key; empty until the peer announces itself
    pub public_key: String,
    pub tags: Vec<String>,
    pub blocked: bool,
}

/// Time-range message query with optional tag filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQuery {
    /// Inclusive lower bound (Unix ms)
    pub start: u64,
    /// Inclusive upper bound (Unix ms)
    pub end: u64,
    /// Keep messages carrying at least one of these tags
    pub include_tags: Option<Vec<String>>,
    /// Drop messages carrying any of these tags
    pub exclude_tags: Option<Vec<String>>,
}

impl MessageQuery {
    pub fn between(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    pub fn including(mut self, tags: Vec<String>) -> Self {
        self.include_tags = Some(tags);
        self
    }

    pub fn excluding(mut self, tags: Vec<String>) -> Self {
        self.exclude_tags = Some(tags);
        self
    }

    /// Tag filters only; the time range is applied by the store's scan.
    pub fn matches_tags(&self, message: &Message) -> bool {
        if let Some(include) = self.include_tags.as_ref().filter(|t| !t.is_empty()) {
            if !message.has_any_tag(include) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude_tags {
            if message.has_any_tag(exclude) {
                return false;
            }
        }
        true
    }
}

/// Narrow persistence interface used by the relay engine.
#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn store_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages in `[start, end]` passing the tag filters, newest first.
    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError>;

    /// Delete messages with `timestamp < before`; returns how many went.
    async fn delete_messages_before(&self, before: u64) -> Result<usize, StoreError>;

    async fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, StoreError>;

    async fn upsert_peer(&self, record: &PeerRecord) -> Result<(), StoreError>;

    async fn update_peer_tags(&self, peer_id: &str, tags: &[String]) -> Result<(), StoreError>;

    async fn update_peer_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), StoreError>;

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;

    async fn load_blocked_tags(&self) -> Result<Vec<String>, StoreError>;

    /// Replaces the whole blocked-tag set.
    async fn save_blocked_tags(&self, tags: &[String]) -> Result<(), StoreError>;

    /// `None` until base tags have been saved once.
    async fn load_base_tags(&self) -> Result<Option<Vec<String>>, StoreError>;

    async fn save_base_tags(&self, tags: &[String]) -> Result<(), StoreError>;

    async fn load_blocked_peers(&self) -> Result<Vec<String>, StoreError>;

    async fn save_blocked_peers(&self, peers: &[String]) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tagged(tags: &[&str]) -> Message {
        Message {
            id: "m".into(),
            message_type: "ping".into(),
            data: json!(null),
            sender: "a".into(),
            recipient: None,
            timestamp: 1,
            signature: String::new(),
            relay_path: vec![],
            validations: vec![],
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_query_tag_filters() {
        let query = MessageQuery::between(0, 10)
            .including(vec!["news".into(), "demo".into()])
            .excluding(vec!["spam".into()]);

        assert!(query.matches_tags(&tagged(&["demo"])));
        assert!(!query.matches_tags(&tagged(&["other"])));
        assert!(!query.matches_tags(&tagged(&["demo", "spam"])));
    }

    #[test]
    fn test_empty_include_list_keeps_everything() {
        let query = MessageQuery::between(0, 10).including(vec![]);
        assert!(query.matches_tags(&tagged(&[])));
        assert!(query.matches_tags(&tagged(&["x"])));
    }
}
