// Message types: what travels on the gossip channel

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type carrying a peer's self-declared tags.
pub const UPDATE_TAGS_TYPE: &str = "update-tags";

/// Length of a generated message id.
const MESSAGE_ID_LEN: usize = 9;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// One relay's opinion of a message signature.
///
/// Never a veto: a `false` here does not stop storage, emission or relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// Peer id of the node that checked the signature
    pub relay_id: String,
    pub is_valid: bool,
    /// Unix timestamp (milliseconds) of the check
    pub timestamp: u64,
}

/// A signed gossip message.
///
/// Only `validations` and `relay_path` grow after creation; every other
/// field is fixed by the originating node and covered by the signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Short random token, unique only probabilistically
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    /// Peer id of the original signer
    pub sender: String,
    /// Absent means network-wide broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Unix timestamp (milliseconds)
    pub timestamp: u64,
    /// Hex-encoded Ed25519 signature over the canonical subset
    pub signature: String,
    #[serde(default)]
    pub relay_path: Vec<String>,
    #[serde(default)]
    pub validations: Vec<ValidationResult>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The caller-supplied part of an outbound message.
///
/// Everything else (sender, timestamp, signature, validations) is filled in
/// by the engine at broadcast time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    /// Pre-assigned id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_path: Option<Vec<String>>,
}

/// Announcement of a node's signing key on the `peer-announcements` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAnnouncement {
    pub peer_id: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
}

/// Payload of an `update-tags` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsPayload {
    pub tags: Vec<String>,
}

impl Message {
    /// True if any of this message's tags is in `blocked`.
    pub fn has_any_tag<'a, I>(&self, blocked: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        blocked.into_iter().any(|tag| self.tags.contains(tag))
    }

    /// Is this message addressed to `peer_id` (or to everyone)?
    pub fn is_for(&self, peer_id: &str) -> bool {
        match &self.recipient {
            None => true,
            Some(recipient) => recipient == peer_id,
        }
    }

    /// Tags carried by an `update-tags` payload, if this is one and it parses.
    pub fn update_tags_payload(&self) -> Option<Vec<String>> {
        if self.message_type != UPDATE_TAGS_TYPE {
            return None;
        }
        serde_json::from_value::<TagsPayload>(self.data.clone())
            .ok()
            .map(|p| p.tags)
    }
}

impl MessageDraft {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            ..Default::default()
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }
}

/// Generate a short random message id (base-36).
pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MESSAGE_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
