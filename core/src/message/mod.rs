// Message module: types and wire encoding for the gossip protocol

pub mod codec;
pub mod types;

pub use codec::{
    decode_announcement, decode_message, encode_announcement, encode_message, CodecError,
    MAX_MESSAGE_SIZE,
};
pub use types::{
    generate_message_id, now_millis, Message, MessageDraft, PeerAnnouncement, TagsPayload,
    ValidationResult, UPDATE_TAGS_TYPE,
};
