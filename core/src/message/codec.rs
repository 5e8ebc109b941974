// Message codec: JSON wire format with size limits to prevent abuse

use super::types::{Message, PeerAnnouncement};
use thiserror::Error;

/// Maximum encoded frame size: 64 KB (the gossipsub transmit limit).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Serialize a Message to UTF-8 JSON bytes
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(msg)?;
    check_size(bytes.len())?;
    Ok(bytes)
}

/// Deserialize a gossip frame to a Message
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    check_size(bytes.len())?;
    let msg: Message = serde_json::from_slice(bytes)?;
    if msg.id.is_empty() {
        return Err(CodecError::MissingField("id"));
    }
    if msg.sender.is_empty() {
        return Err(CodecError::MissingField("sender"));
    }
    Ok(msg)
}

pub fn encode_announcement(announcement: &PeerAnnouncement) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(announcement)?)
}

pub fn decode_announcement(bytes: &[u8]) -> Result<PeerAnnouncement, CodecError> {
    check_size(bytes.len())?;
    let announcement: PeerAnnouncement = serde_json::from_slice(bytes)?;
    if announcement.peer_id.is_empty() {
        return Err(CodecError::MissingField("peerId"));
    }
    Ok(announcement)
}

fn check_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
