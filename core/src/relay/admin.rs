// Administrative operations: local policy and store access
//
// None of these broadcast: blocking and tag filters are unilateral.

use super::directory::PeerInfo;
use super::engine::RelayEngine;
use crate::error::RelayError;
use crate::message::Message;
use crate::store::MessageQuery;
use tracing::{info, warn};

impl RelayEngine {
    /// Stored messages in `[start, end]`, newest first. With no explicit
    /// exclusion the current blocked tags are excluded.
    pub async fn query_messages(
        &self,
        start: u64,
        end: u64,
        include_tags: Option<Vec<String>>,
        exclude_tags: Option<Vec<String>>,
    ) -> Result<Vec<Message>, RelayError> {
        let query = MessageQuery {
            start,
            end,
            include_tags,
            exclude_tags: Some(exclude_tags.unwrap_or_else(|| self.policy.blocked_tags())),
        };
        Ok(self.store.get_messages(&query).await?)
    }

    /// Retention sweep: drop messages older than `timestamp`.
    pub async fn delete_messages_before(&self, timestamp: u64) -> Result<usize, RelayError> {
        let deleted = self.store.delete_messages_before(timestamp).await?;
        info!("Deleted {} messages before {}", deleted, timestamp);
        Ok(deleted)
    }

    pub async fn get_peers(&self) -> Vec<PeerInfo> {
        self.directory.peers().await
    }

    pub fn get_base_tags(&self) -> Vec<String> {
        self.policy.base_tags()
    }

    pub fn get_blocked_tags(&self) -> Vec<String> {
        self.policy.blocked_tags()
    }

    pub async fn update_blocked_tags(&self, tags: Vec<String>) -> Result<Vec<String>, RelayError> {
        let tags = self.policy.set_blocked_tags(tags).await?;
        info!("Blocked tags now: {:?}", tags);
        Ok(tags)
    }

    /// Block or unblock a peer as a sender and forwarder.
    ///
    /// The directory flag is written before the enforced policy set; if the
    /// policy write then fails the flag is put back, so a failed call leaves
    /// both as they were.
    pub async fn block_peer(&self, peer_id: &str, blocked: bool) -> Result<(), RelayError> {
        let was_blocked = self.policy.is_peer_blocked(peer_id);
        self.directory.set_blocked(peer_id, blocked).await?;
        if let Err(e) = self.policy.set_peer_blocked(peer_id, blocked).await {
            if let Err(undo) = self.directory.set_blocked(peer_id, was_blocked).await {
                warn!("Restoring directory flag for {} failed: {}", peer_id, undo);
            }
            return Err(e.into());
        }
        info!("Peer {} {}", peer_id, if blocked { "blocked" } else { "unblocked" });
        Ok(())
    }

    pub fn get_blocked_peers(&self) -> Vec<String> {
        self.policy.blocked_peers()
    }

    pub fn get_bootstrap_nodes(&self) -> Vec<String> {
        self.bootstrap_nodes.as_ref().clone()
    }
}
