// Cryptographic key management

use super::IdentityError;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::{Zeroize, Zeroizing};

/// The node's Ed25519 signing identity.
///
/// The same secret drives the libp2p transport identity, so the peer id a
/// node gossips under is the peer id it signs messages as.
#[derive(Clone)]
pub struct IdentityKeys {
    pub signing_key: SigningKey,
}

impl IdentityKeys {
    /// Generate new identity keys
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut secret_key_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);
        secret_key_bytes.zeroize();
        Self { signing_key }
    }

    /// Load keys from a hex-encoded 32-byte secret
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex.trim()).map_err(|_| IdentityError::InvalidKeyMaterial)?,
        );
        Self::from_bytes(&bytes)
    }

    /// Hex-encoded secret, for the operator to carry the identity across restarts.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Get public key as hex
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// libp2p keypair derived from the same secret
    pub fn libp2p_keypair(&self) -> Result<libp2p::identity::Keypair, IdentityError> {
        let mut secret = self.signing_key.to_bytes();
        let keypair = libp2p::identity::Keypair::ed25519_from_bytes(&mut secret)
            .map_err(|_| IdentityError::InvalidKeyMaterial);
        secret.zeroize();
        keypair
    }

    /// Peer id this node relays and signs as
    pub fn peer_id(&self) -> Result<String, IdentityError> {
        Ok(self.libp2p_keypair()?.public().to_peer_id().to_string())
    }

    /// Peer id a hex-encoded Ed25519 public key derives to.
    pub fn peer_id_for_public_key(public_key_hex: &str) -> Option<String> {
        let bytes = hex::decode(public_key_hex).ok()?;
        let key = libp2p::identity::ed25519::PublicKey::try_from_bytes(&bytes).ok()?;
        Some(libp2p::identity::PublicKey::from(key).to_peer_id().to_string())
    }

    /// Sign data
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Verify a signature; malformed keys or signatures are simply invalid.
    pub fn verify(data: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(public_key) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
            return false;
        };
        let Ok(signature) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        let sig = Ed25519Signature::from_bytes(&signature);
        verifying_key.verify(data, &sig).is_ok()
    }

    /// Serialize keys to bytes.
    /// Returns a `Zeroizing<Vec<u8>>` that automatically wipes secret key material on drop.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signing_key.to_bytes().to_vec())
    }

    /// Deserialize keys from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyMaterial)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keys = IdentityKeys::generate();
        assert_eq!(keys.public_key_hex().len(), 64); // 32 bytes = 64 hex chars
        assert_eq!(keys.secret_hex().len(), 64);
    }

    #[test]
    fn test_signing_and_verification() {
        let keys = IdentityKeys::generate();
        let data = b"test message";

        let signature = keys.sign(data);
        assert_eq!(signature.len(), 64); // Ed25519 signature = 64 bytes

        let public_key = keys.signing_key.verifying_key().to_bytes();
        assert!(IdentityKeys::verify(data, &signature, &public_key));
        assert!(!IdentityKeys::verify(b"wrong data", &signature, &public_key));
    }

    #[test]
    fn test_verify_rejects_malformed_inputs() {
        let keys = IdentityKeys::generate();
        let signature = keys.sign(b"x");
        let public_key = keys.signing_key.verifying_key().to_bytes();

        assert!(!IdentityKeys::verify(b"x", &signature[..10], &public_key));
        assert!(!IdentityKeys::verify(b"x", &signature, &public_key[..31]));
        assert!(!IdentityKeys::verify(b"x", &[], &[]));
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let keys = IdentityKeys::generate();
        let restored = IdentityKeys::from_secret_hex(keys.secret_hex().as_str()).unwrap();
        assert_eq!(keys.public_key_hex(), restored.public_key_hex());

        assert!(IdentityKeys::from_secret_hex("not hex").is_err());
        assert!(IdentityKeys::from_secret_hex("abcd").is_err());
    }

    #[test]
    fn test_peer_id_is_stable_for_same_secret() {
        let keys = IdentityKeys::generate();
        let restored = IdentityKeys::from_bytes(&keys.to_bytes()).unwrap();
        let peer_id = keys.peer_id().unwrap();
        assert_eq!(peer_id, restored.peer_id().unwrap());
        assert!(peer_id.starts_with("12D3KooW"));
        assert_ne!(peer_id, IdentityKeys::generate().peer_id().unwrap());
    }

    #[test]
    fn test_peer_id_for_public_key() {
        let keys = IdentityKeys::generate();
        assert_eq!(
            IdentityKeys::peer_id_for_public_key(&keys.public_key_hex()),
            Some(keys.peer_id().unwrap())
        );
        assert_eq!(IdentityKeys::peer_id_for_public_key("zz"), None);
        assert_eq!(IdentityKeys::peer_id_for_public_key("abcd"), None);
    }
}
