// Outbound path: sign, self-validate, store, publish

use super::engine::RelayEngine;
use super::policy::dedup_tags;
use crate::error::RelayError;
use crate::identity::{sign_message, verify_message};
use crate::message::{
    encode_message, generate_message_id, now_millis, Message, MessageDraft, TagsPayload,
    ValidationResult, UPDATE_TAGS_TYPE,
};
use crate::transport::Topic;
use tracing::{debug, warn};

impl RelayEngine {
    /// Sign and publish a message from this node; returns its id.
    ///
    /// Publish failures are logged, not returned: delivery is best effort and
    /// the message is already stored locally. Oversized drafts are rejected
    /// before anything is stored.
    pub async fn broadcast(&self, draft: MessageDraft) -> Result<String, RelayError> {
        let mut message = Message {
            id: draft
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_message_id),
            message_type: draft.message_type,
            data: draft.data,
            sender: self.local_id.to_string(),
            recipient: draft.recipient,
            timestamp: now_millis(),
            signature: String::new(),
            relay_path: draft.relay_path.unwrap_or_default(),
            validations: Vec::new(),
            tags: draft.tags.unwrap_or_default(),
        };
        message.signature = sign_message(&message, &self.keys)?;

        let is_valid = verify_message(&message, &self.keys.public_key_hex());
        message.validations.push(ValidationResult {
            relay_id: self.local_id.to_string(),
            is_valid,
            timestamp: now_millis(),
        });

        let bytes = encode_message(&message)?;

        // our own frame echoed back by a relay must not be reprocessed
        self.dedup.mark_seen(&message.id);

        if message.is_for(&self.local_id) && !self.policy.has_blocked_tag(&message) {
            self.persist(&message).await;
        }

        match self.publisher.publish(Topic::Messages, bytes).await {
            Ok(()) => debug!("Broadcast {} ({})", message.id, message.message_type),
            Err(e) => warn!("Publishing {} failed: {}", message.id, e),
        }
        Ok(message.id)
    }

    /// Announce this node's tags: base tags plus `extra_tags`.
    pub async fn update_tags(&self, extra_tags: Vec<String>) -> Result<String, RelayError> {
        let tags = dedup_tags(self.policy.base_tags().into_iter().chain(extra_tags));
        let data = serde_json::to_value(TagsPayload { tags })
            .map_err(|e| RelayError::Codec(e.into()))?;
        self.broadcast(MessageDraft::new(UPDATE_TAGS_TYPE, data)).await
    }

    /// Replace and persist base tags, then announce them.
    pub async fn update_base_tags(&self, tags: Vec<String>) -> Result<String, RelayError> {
        self.policy.set_base_tags(tags).await?;
        self.update_tags(Vec::new()).await
    }
}
