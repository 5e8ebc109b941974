// Message signing and verification
//
// The signature covers {id, type, data, sender, recipient, timestamp} only.
// relayPath, validations and tags stay outside so relays can append to them
// without invalidating the originator's signature.

use super::{IdentityError, IdentityKeys};
use crate::message::Message;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Serialize)]
struct CanonicalMessage<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    message_type: &'a str,
    data: &'a Value,
    sender: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient: Option<&'a str>,
    timestamp: u64,
}

/// SHA-256 digest of the canonical JSON of the signed subset.
///
/// `serde_json` maps are ordered by key, so `data` serializes identically on
/// every node regardless of the order fields arrived in.
pub fn canonical_digest(message: &Message) -> Result<[u8; 32], serde_json::Error> {
    let canonical = CanonicalMessage {
        id: &message.id,
        message_type: &message.message_type,
        data: &message.data,
        sender: &message.sender,
        recipient: message.recipient.as_deref(),
        timestamp: message.timestamp,
    };
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Sign a message; any existing `signature` field is ignored.
pub fn sign_message(message: &Message, keys: &IdentityKeys) -> Result<String, IdentityError> {
    let digest = canonical_digest(message).map_err(|e| IdentityError::Signing(e.to_string()))?;
    Ok(hex::encode(keys.sign(&digest)))
}

/// Check a message signature against a hex-encoded public key.
///
/// Returns `false` on any malformed input or mismatch, never an error.
pub fn verify_message(message: &Message, public_key_hex: &str) -> bool {
    let Ok(public_key) = hex::decode(public_key_hex) else {
        tracing::debug!("Verification of {} failed: public key is not hex", message.id);
        return false;
    };
    let Ok(signature) = hex::decode(&message.signature) else {
        tracing::debug!("Verification of {} failed: signature is not hex", message.id);
        return false;
    };
    let Ok(digest) = canonical_digest(message) else {
        return false;
    };
    IdentityKeys::verify(&digest, &signature, &public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ValidationResult;
    use proptest::prelude::*;
    use serde_json::json;

    fn unsigned(sender: &str) -> Message {
        Message {
            id: "k2j4h5g6f".into(),
            message_type: "ping".into(),
            data: json!({ "b": 2, "a": [1, 2, 3] }),
            sender: sender.into(),
            recipient: None,
            timestamp: 1_700_000_000_123,
            signature: String::new(),
            relay_path: vec![],
            validations: vec![],
            tags: vec!["demo".into()],
        }
    }

    fn signed(keys: &IdentityKeys) -> Message {
        let mut msg = unsigned("peer-a");
        msg.signature = sign_message(&msg, keys).unwrap();
        msg
    }

    #[test]
    fn test_sign_then_verify() {
        let keys = IdentityKeys::generate();
        let msg = signed(&keys);
        assert_eq!(msg.signature.len(), 128);
        assert!(verify_message(&msg, &keys.public_key_hex()));
    }

    #[test]
    fn test_relay_fields_do_not_affect_signature() {
        let keys = IdentityKeys::generate();
        let mut msg = signed(&keys);

        msg.relay_path.push("peer-b".into());
        msg.validations.push(ValidationResult {
            relay_id: "peer-b".into(),
            is_valid: true,
            timestamp: 1,
        });
        msg.tags.push("extra".into());

        assert!(verify_message(&msg, &keys.public_key_hex()));
    }

    #[test]
    fn test_signed_fields_are_covered() {
        let keys = IdentityKeys::generate();
        let public_key = keys.public_key_hex();
        let original = signed(&keys);

        let mut tampered = original.clone();
        tampered.data = json!({ "b": 3 });
        assert!(!verify_message(&tampered, &public_key));

        let mut tampered = original.clone();
        tampered.recipient = Some("peer-z".into());
        assert!(!verify_message(&tampered, &public_key));

        let mut tampered = original.clone();
        tampered.sender = "peer-x".into();
        assert!(!verify_message(&tampered, &public_key));

        let mut tampered = original;
        tampered.timestamp += 1;
        assert!(!verify_message(&tampered, &public_key));
    }

    #[test]
    fn test_data_key_order_is_irrelevant() {
        let keys = IdentityKeys::generate();
        let msg = signed(&keys);

        let reordered: Value = serde_json::from_str(r#"{"a":[1,2,3],"b":2}"#).unwrap();
        let mut copy = msg.clone();
        copy.data = reordered;
        assert!(verify_message(&copy, &keys.public_key_hex()));
    }

    #[test]
    fn test_wrong_or_malformed_key_is_invalid() {
        let keys = IdentityKeys::generate();
        let msg = signed(&keys);

        assert!(!verify_message(&msg, &IdentityKeys::generate().public_key_hex()));
        assert!(!verify_message(&msg, ""));
        assert!(!verify_message(&msg, "zz-not-hex"));

        let mut garbled = msg;
        garbled.signature = "nothex".into();
        assert!(!verify_message(&garbled, &keys.public_key_hex()));
    }

    proptest! {
        #[test]
        fn prop_verify_is_deterministic(
            text in ".{0,64}",
            timestamp in any::<u64>(),
            flip in any::<bool>(),
        ) {
            let keys = IdentityKeys::generate();
            let mut msg = unsigned("peer-a");
            msg.data = json!({ "text": text });
            msg.timestamp = timestamp;
            msg.signature = sign_message(&msg, &keys).unwrap();
            if flip {
                msg.timestamp = msg.timestamp.wrapping_add(1);
            }

            let public_key = keys.public_key_hex();
            let first = verify_message(&msg, &public_key);
            let second = verify_message(&msg, &public_key);
            prop_assert_eq!(first, second);
            prop_assert_eq!(first, !flip);
        }
    }
}
