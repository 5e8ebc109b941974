// Peer directory: in-memory mirror of known peers over the relay store

use crate::message::now_millis;
use crate::store::{PeerRecord, RelayStore, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// What this node knows about a remote peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    /// Transport addresses (multiaddrs) seen for this peer
    pub addresses: Vec<String>,
    /// Unix timestamp (milliseconds); 0 if never connected this run
    pub last_seen: u64,
    /// Hex-encoded Ed25519 key; empty until announced
    pub public_key: String,
    pub tags: Vec<String>,
    pub blocked: bool,
}

impl PeerInfo {
    fn from_record(record: PeerRecord) -> Self {
        Self {
            id: record.id,
            public_key: record.public_key,
            tags: record.tags,
            blocked: record.blocked,
            ..Default::default()
        }
    }

    fn to_record(&self) -> PeerRecord {
        PeerRecord {
            id: self.id.clone(),
            public_key: self.public_key.clone(),
            tags: self.tags.clone(),
            blocked: self.blocked,
        }
    }
}

pub struct PeerDirectory {
    store: Arc<dyn RelayStore>,
    /// Hot peers: connected this run or touched recently
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self {
            store,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Mirror entry, falling back to the store. Store failures read as absent.
    async fn lookup(&self, peer_id: &str) -> Option<PeerInfo> {
        if let Some(info) = self.peers.read().get(peer_id) {
            return Some(info.clone());
        }
        match self.store.get_peer(peer_id).await {
            Ok(record) => record.map(PeerInfo::from_record),
            Err(e) => {
                warn!("Peer lookup for {} failed: {}", peer_id, e);
                None
            }
        }
    }

    pub async fn resolve_public_key(&self, peer_id: &str) -> Option<String> {
        self.lookup(peer_id)
            .await
            .map(|info| info.public_key)
            .filter(|key| !key.is_empty())
    }

    pub async fn get_tags(&self, peer_id: &str) -> Vec<String> {
        self.lookup(peer_id).await.map(|info| info.tags).unwrap_or_default()
    }

    pub async fn is_blocked(&self, peer_id: &str) -> bool {
        self.lookup(peer_id).await.map(|info| info.blocked).unwrap_or(false)
    }

    /// Record a peer's announced key. Idempotent.
    pub async fn upsert_announcement(
        &self,
        peer_id: &str,
        public_key: &str,
        tags: Vec<String>,
        blocked: bool,
    ) -> Result<(), StoreError> {
        let mut info = self.lookup(peer_id).await.unwrap_or_else(|| PeerInfo {
            id: peer_id.to_string(),
            ..Default::default()
        });
        info.public_key = public_key.to_string();
        info.tags = tags;
        info.blocked = blocked;

        self.store.upsert_peer(&info.to_record()).await?;
        self.peers.write().insert(peer_id.to_string(), info);
        Ok(())
    }

    /// Replace a peer's self-declared tags. Callers gate this on a verified
    /// `update-tags` signature.
    pub async fn update_tags(&self, peer_id: &str, tags: Vec<String>) -> Result<(), StoreError> {
        self.store.update_peer_tags(peer_id, &tags).await?;
        if let Some(info) = self.peers.write().get_mut(peer_id) {
            info.tags = tags;
        }
        Ok(())
    }

    pub async fn set_blocked(&self, peer_id: &str, blocked: bool) -> Result<(), StoreError> {
        self.store.update_peer_blocked(peer_id, blocked).await?;
        if let Some(info) = self.peers.write().get_mut(peer_id) {
            info.blocked = blocked;
        }
        Ok(())
    }

    /// A transport-level discovery. Stored tags and key are carried over;
    /// `blocked` comes from local policy.
    pub async fn record_discovery(
        &self,
        peer_id: &str,
        addresses: Vec<String>,
        blocked: bool,
    ) -> PeerInfo {
        let mut info = self.lookup(peer_id).await.unwrap_or_else(|| PeerInfo {
            id: peer_id.to_string(),
            ..Default::default()
        });
        for addr in addresses {
            if !info.addresses.contains(&addr) {
                info.addresses.push(addr);
            }
        }
        info.last_seen = now_millis();
        info.blocked = info.blocked || blocked;

        debug!("Directory: discovered {} ({} addresses)", peer_id, info.addresses.len());
        self.peers.write().insert(peer_id.to_string(), info.clone());
        info
    }

    /// Only refreshes `last_seen`; the peer stays known.
    pub fn record_disconnect(&self, peer_id: &str) {
        if let Some(info) = self.peers.write().get_mut(peer_id) {
            info.last_seen = now_millis();
        }
    }

    /// Every known peer, stored or hot, sorted by id.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let mut merged: BTreeMap<String, PeerInfo> = BTreeMap::new();
        match self.store.list_peers().await {
            Ok(records) => {
                for record in records {
                    merged.insert(record.id.clone(), PeerInfo::from_record(record));
                }
            }
            Err(e) => warn!("Listing stored peers failed: {}", e),
        }
        for (id, info) in self.peers.read().iter() {
            merged.insert(id.clone(), info.clone());
        }
        merged.into_values().collect()
    }
}
