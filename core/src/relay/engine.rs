// Relay engine: inbound state machine and directed-message forwarding
//
// Per frame: decode → sender block check → dedup → update-tags → store →
// emit → forward. Validation results are recorded, never enforced: a failed
// signature check does not stop storage, emission or relay.

use super::dedup::DedupCache;
use super::directory::{PeerDirectory, PeerInfo};
use super::policy::{dedup_tags, PolicyStore};
use crate::error::RelayError;
use crate::identity::{verify_message, IdentityKeys};
use crate::message::{
    decode_announcement, decode_message, encode_announcement, encode_message, now_millis,
    Message, PeerAnnouncement, ValidationResult,
};
use crate::store::RelayStore;
use crate::transport::{GossipPublisher, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Notifications for local listeners.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A message passed the local tag filter
    MessageReceived(Message),
    PeerDiscovered(PeerInfo),
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Malformed,
    BlockedSender,
    Duplicate,
    Processed {
        stored: bool,
        emitted: bool,
        relayed: bool,
    },
}

/// Why a directed message was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Forwarded,
    /// This node is the recipient
    Delivered,
    /// Already in the relay path
    Loop,
    BlockedSender,
    BlockedForwarder,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dedup_ttl: Duration,
    pub event_capacity: usize,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: super::dedup::DEFAULT_DEDUP_TTL,
            event_capacity: 256,
            bootstrap_nodes: Vec::new(),
        }
    }
}

/// Shared handle to the relay core. Cheap to clone; all state is behind `Arc`.
#[derive(Clone)]
pub struct RelayEngine {
    pub(super) local_id: Arc<str>,
    pub(super) keys: Arc<IdentityKeys>,
    pub(super) dedup: Arc<DedupCache>,
    pub(super) directory: Arc<PeerDirectory>,
    pub(super) policy: Arc<PolicyStore>,
    pub(super) store: Arc<dyn RelayStore>,
    pub(super) publisher: Arc<dyn GossipPublisher>,
    pub(super) events: broadcast::Sender<RelayEvent>,
    pub(super) bootstrap_nodes: Arc<Vec<String>>,
}

impl RelayEngine {
    pub fn new(
        keys: IdentityKeys,
        store: Arc<dyn RelayStore>,
        policy: Arc<PolicyStore>,
        publisher: Arc<dyn GossipPublisher>,
        config: EngineConfig,
    ) -> Result<Self, RelayError> {
        let local_id: Arc<str> = keys.peer_id()?.into();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(Self {
            local_id,
            keys: Arc::new(keys),
            dedup: Arc::new(DedupCache::new(config.dedup_ttl)),
            directory: Arc::new(PeerDirectory::new(store.clone())),
            policy,
            store,
            publisher,
            events,
            bootstrap_nodes: Arc::new(config.bootstrap_nodes),
        })
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_id
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    /// Subscribe to local notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn dedup(&self) -> Arc<DedupCache> {
        self.dedup.clone()
    }

    pub fn directory(&self) -> Arc<PeerDirectory> {
        self.directory.clone()
    }

    pub fn policy(&self) -> Arc<PolicyStore> {
        self.policy.clone()
    }

    /// Decode and process one frame from the `network-messages` topic.
    /// `source` is the peer that handed us the frame.
    pub async fn handle_network_frame(&self, data: &[u8], source: Option<&str>) -> InboundOutcome {
        match decode_message(data) {
            Ok(message) => self.on_inbound(message, source).await,
            Err(e) => {
                warn!("Dropping malformed frame from {:?}: {}", source, e);
                InboundOutcome::Malformed
            }
        }
    }

    pub async fn on_inbound(&self, message: Message, source: Option<&str>) -> InboundOutcome {
        if self.sender_blocked(&message.sender).await {
            debug!("Dropping {} from blocked sender {}", message.id, message.sender);
            return InboundOutcome::BlockedSender;
        }

        if !self.dedup.check_and_mark(&message.id) {
            debug!("Duplicate {} suppressed", message.id);
            return InboundOutcome::Duplicate;
        }

        if let Some(tags) = message.update_tags_payload() {
            self.apply_update_tags(&message, tags).await;
        }

        let tag_blocked = self.policy.has_blocked_tag(&message);

        let stored = if message.is_for(&self.local_id) && !tag_blocked {
            self.persist(&message).await
        } else {
            false
        };

        let emitted = !tag_blocked;
        if emitted {
            // no listeners is fine
            let _ = self.events.send(RelayEvent::MessageReceived(message.clone()));
        }

        let relayed = if message.recipient.is_some() {
            self.forward(message, source).await == ForwardDecision::Forwarded
        } else {
            false
        };

        InboundOutcome::Processed {
            stored,
            emitted,
            relayed,
        }
    }

    /// Forward a directed message one hop, recording this node's validation.
    /// The originator's signature is carried unchanged.
    pub async fn forward(&self, mut message: Message, source: Option<&str>) -> ForwardDecision {
        if message.recipient.as_deref() == Some(&*self.local_id) {
            return ForwardDecision::Delivered;
        }
        if message.relay_path.iter().any(|hop| hop.as_str() == &*self.local_id) {
            debug!("Not relaying {}: already in relay path", message.id);
            return ForwardDecision::Loop;
        }
        if self.sender_blocked(&message.sender).await {
            return ForwardDecision::BlockedSender;
        }
        if let Some(source) = source {
            if source != message.sender && self.sender_blocked(source).await {
                debug!("Not relaying {}: forwarded by blocked peer {}", message.id, source);
                return ForwardDecision::BlockedForwarder;
            }
        }

        let is_valid = self.check_signature(&message).await;
        message.validations.push(ValidationResult {
            relay_id: self.local_id.to_string(),
            is_valid,
            timestamp: now_millis(),
        });
        message.relay_path.push(self.local_id.to_string());

        let bytes = match encode_message(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot re-encode {} for relay: {}", message.id, e);
                return ForwardDecision::Failed;
            }
        };
        match self.publisher.publish(Topic::Messages, bytes).await {
            Ok(()) => {
                debug!(
                    "Relayed {} toward {:?} (valid: {}, hops: {})",
                    message.id,
                    message.recipient,
                    is_valid,
                    message.relay_path.len()
                );
                ForwardDecision::Forwarded
            }
            Err(e) => {
                warn!("Relay publish of {} failed: {}", message.id, e);
                ForwardDecision::Failed
            }
        }
    }

    /// Record a `{peerId, publicKey}` announcement.
    ///
    /// The key must derive the announced peer id, so a node cannot register
    /// its key under another peer's id. Stored tags and the local blocked
    /// flag are kept.
    pub async fn handle_announcement(&self, data: &[u8]) -> bool {
        let announcement = match decode_announcement(data) {
            Ok(a) => a,
            Err(e) => {
                warn!("Dropping malformed announcement: {}", e);
                return false;
            }
        };
        if announcement.peer_id == *self.local_id {
            return false;
        }
        if IdentityKeys::peer_id_for_public_key(&announcement.public_key).as_deref()
            != Some(announcement.peer_id.as_str())
        {
            warn!("Announcement key does not match peer id {}", announcement.peer_id);
            return false;
        }

        let tags = self.directory.get_tags(&announcement.peer_id).await;
        let blocked = self.sender_blocked(&announcement.peer_id).await;
        match self
            .directory
            .upsert_announcement(&announcement.peer_id, &announcement.public_key, tags, blocked)
            .await
        {
            Ok(()) => {
                debug!("Recorded key for {}", announcement.peer_id);
                true
            }
            Err(e) => {
                warn!("Storing announcement from {} failed: {}", announcement.peer_id, e);
                false
            }
        }
    }

    /// Publish this node's `{peerId, publicKey}`.
    pub async fn announce(&self) -> Result<(), RelayError> {
        let announcement = PeerAnnouncement {
            peer_id: self.local_id.to_string(),
            public_key: self.keys.public_key_hex(),
        };
        let bytes = encode_announcement(&announcement)?;
        self.publisher.publish(Topic::Announcements, bytes).await?;
        Ok(())
    }

    pub async fn on_peer_discovered(&self, peer_id: &str, addresses: Vec<String>) -> PeerInfo {
        let blocked = self.policy.is_peer_blocked(peer_id);
        let info = self
            .directory
            .record_discovery(peer_id, addresses, blocked)
            .await;
        info!("Peer discovered: {}", peer_id);
        let _ = self.events.send(RelayEvent::PeerDiscovered(info.clone()));
        info
    }

    pub fn on_peer_disconnected(&self, peer_id: &str) {
        self.directory.record_disconnect(peer_id);
    }

    /// Re-announce whenever someone joins the announcement topic, so a node
    /// that started alone still becomes known.
    pub async fn on_peer_subscribed(&self, peer_id: &str, topic: Topic) {
        if topic != Topic::Announcements {
            return;
        }
        debug!("{} joined {}, re-announcing", peer_id, topic);
        if let Err(e) = self.announce().await {
            debug!("Announcement failed: {}", e);
        }
    }

    pub(super) async fn sender_blocked(&self, peer_id: &str) -> bool {
        self.policy.is_peer_blocked(peer_id) || self.directory.is_blocked(peer_id).await
    }

    /// Signature check against the sender's key on file; no key means invalid.
    pub(super) async fn check_signature(&self, message: &Message) -> bool {
        match self.directory.resolve_public_key(&message.sender).await {
            Some(public_key) => verify_message(message, &public_key),
            None => {
                debug!("No key on file for {}", message.sender);
                false
            }
        }
    }

    /// Persist, logging failures. Returns whether the write succeeded.
    pub(super) async fn persist(&self, message: &Message) -> bool {
        match self.store.store_message(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Persisting {} failed: {}", message.id, e);
                false
            }
        }
    }

    async fn apply_update_tags(&self, message: &Message, tags: Vec<String>) {
        if !self.check_signature(message).await {
            debug!("Ignoring unverified update-tags from {}", message.sender);
            return;
        }
        let tags = dedup_tags(tags);
        match self.directory.update_tags(&message.sender, tags).await {
            Ok(()) => debug!("Updated tags for {}", message.sender),
            Err(e) => warn!("Updating tags for {} failed: {}", message.sender, e),
        }
    }
}
