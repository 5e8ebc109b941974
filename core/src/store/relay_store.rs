// Key/value implementation of the relay store
//
// Key layout:
//   msg:<timestamp, 20 digits>:<id>  -> Message (JSON)
//   peer:<peer id>                   -> PeerRecord (JSON)
//   policy:<name>                    -> Vec<String> (JSON)

use super::backend::StorageBackend;
use super::{MessageQuery, PeerRecord, RelayStore, StoreError};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

const MESSAGE_PREFIX: &str = "msg:";
const PEER_PREFIX: &str = "peer:";
const BLOCKED_TAGS_KEY: &[u8] = b"policy:blocked_tags";
const BASE_TAGS_KEY: &[u8] = b"policy:base_tags";
const BLOCKED_PEERS_KEY: &[u8] = b"policy:blocked_peers";

/// Width of the zero-padded timestamp in message keys
const TIMESTAMP_WIDTH: usize = 20;

#[derive(Clone)]
pub struct KvRelayStore {
    backend: Arc<dyn StorageBackend>,
}

impl KvRelayStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    fn message_key(message: &Message) -> Vec<u8> {
        format!(
            "{}{:0width$}:{}",
            MESSAGE_PREFIX,
            message.timestamp,
            message.id,
            width = TIMESTAMP_WIDTH
        )
        .into_bytes()
    }

    fn peer_key(peer_id: &str) -> Vec<u8> {
        format!("{}{}", PEER_PREFIX, peer_id).into_bytes()
    }

    /// Timestamp embedded in a message key, without decoding the value
    fn key_timestamp(key: &[u8]) -> Option<u64> {
        let start = MESSAGE_PREFIX.len();
        let digits = key.get(start..start + TIMESTAMP_WIDTH)?;
        std::str::from_utf8(digits).ok()?.parse().ok()
    }

    fn load_list(&self, key: &[u8]) -> Result<Option<Vec<String>>, StoreError> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_list(&self, key: &[u8], values: &[String]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(values)?;
        self.backend.put(key, &bytes)?;
        self.backend.flush()
    }

    fn read_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, StoreError> {
        match self.backend.get(&Self::peer_key(peer_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.backend.put(&Self::peer_key(&record.id), &bytes)
    }

    /// Run backend work on the blocking pool; sled reads, writes and flushes
    /// can all touch the disk.
    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&KvRelayStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl RelayStore for KvRelayStore {
    async fn store_message(&self, message: &Message) -> Result<(), StoreError> {
        let key = Self::message_key(message);
        let bytes = serde_json::to_vec(message)?;
        self.blocking(move |store| store.backend.put(&key, &bytes))
            .await
    }

    async fn get_messages(&self, query: &MessageQuery) -> Result<Vec<Message>, StoreError> {
        let query = query.clone();
        self.blocking(move |store| {
            let mut results = Vec::new();
            for (key, value) in store.backend.scan_prefix(MESSAGE_PREFIX.as_bytes())? {
                let Some(timestamp) = Self::key_timestamp(&key) else {
                    continue;
                };
                if timestamp < query.start {
                    continue;
                }
                if timestamp > query.end {
                    break;
                }
                let message: Message = serde_json::from_slice(&value)?;
                if query.matches_tags(&message) {
                    results.push(message);
                }
            }
            results.reverse();
            Ok(results)
        })
        .await
    }

    async fn delete_messages_before(&self, before: u64) -> Result<usize, StoreError> {
        self.blocking(move |store| {
            let mut deleted = 0;
            for (key, _) in store.backend.scan_prefix(MESSAGE_PREFIX.as_bytes())? {
                match Self::key_timestamp(&key) {
                    Some(timestamp) if timestamp < before => {
                        store.backend.remove(&key)?;
                        deleted += 1;
                    }
                    Some(_) => break,
                    None => continue,
                }
            }
            store.backend.flush()?;
            Ok(deleted)
        })
        .await
    }

    async fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>, StoreError> {
        let peer_id = peer_id.to_string();
        self.blocking(move |store| store.read_peer(&peer_id)).await
    }

    async fn upsert_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |store| store.write_peer(&record)).await
    }

    async fn update_peer_tags(&self, peer_id: &str, tags: &[String]) -> Result<(), StoreError> {
        let peer_id = peer_id.to_string();
        let tags = tags.to_vec();
        self.blocking(move |store| {
            let mut record = store.read_peer(&peer_id)?.unwrap_or_else(|| PeerRecord {
                id: peer_id.clone(),
                ..Default::default()
            });
            record.tags = tags;
            store.write_peer(&record)
        })
        .await
    }

    async fn update_peer_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), StoreError> {
        let peer_id = peer_id.to_string();
        self.blocking(move |store| {
            let mut record = store.read_peer(&peer_id)?.unwrap_or_else(|| PeerRecord {
                id: peer_id.clone(),
                ..Default::default()
            });
            record.blocked = blocked;
            store.write_peer(&record)
        })
        .await
    }

    async fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        self.blocking(|store| {
            store
                .backend
                .scan_prefix(PEER_PREFIX.as_bytes())?
                .into_iter()
                .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
                .collect()
        })
        .await
    }

    async fn load_blocked_tags(&self) -> Result<Vec<String>, StoreError> {
        let tags = self.blocking(|store| store.load_list(BLOCKED_TAGS_KEY)).await?;
        Ok(tags.unwrap_or_default())
    }

    async fn save_blocked_tags(&self, tags: &[String]) -> Result<(), StoreError> {
        let tags = tags.to_vec();
        self.blocking(move |store| store.save_list(BLOCKED_TAGS_KEY, &tags))
            .await
    }

    async fn load_base_tags(&self) -> Result<Option<Vec<String>>, StoreError> {
        self.blocking(|store| store.load_list(BASE_TAGS_KEY)).await
    }

    async fn save_base_tags(&self, tags: &[String]) -> Result<(), StoreError> {
        let tags = tags.to_vec();
        self.blocking(move |store| store.save_list(BASE_TAGS_KEY, &tags))
            .await
    }

    async fn load_blocked_peers(&self) -> Result<Vec<String>, StoreError> {
        let peers = self.blocking(|store| store.load_list(BLOCKED_PEERS_KEY)).await?;
        Ok(peers.unwrap_or_default())
    }

    async fn save_blocked_peers(&self, peers: &[String]) -> Result<(), StoreError> {
        let peers = peers.to_vec();
        self.blocking(move |store| store.save_list(BLOCKED_PEERS_KEY, &peers))
            .await
    }
}
