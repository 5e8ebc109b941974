// Identity & Signer: node keypair provisioning and message signatures

mod keys;
pub mod signer;
mod store;

pub use keys::IdentityKeys;
pub use signer::{canonical_digest, sign_message, verify_message};
pub use store::IdentityStore;

use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid key material")]
    InvalidKeyMaterial,
    #[error("identity not initialized")]
    NotInitialized,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("identity storage: {0}")]
    Store(#[from] StoreError),
}

/// Where the active identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    /// Secret supplied by the operator (config or environment)
    Provided,
    /// Secret found in the identity store
    Stored,
    /// Fresh keypair generated on this start
    Generated,
}

/// Manages node identity and cryptographic keys
pub struct IdentityManager {
    store: IdentityStore,
    keys: Option<IdentityKeys>,
}

impl IdentityManager {
    pub fn with_store(store: IdentityStore) -> Self {
        Self {
            store,
            keys: None,
        }
    }

    /// Load the provided secret, else the stored one, else generate and persist.
    ///
    /// A malformed provided secret is an error rather than a silent
    /// regeneration: the operator asked for a specific identity.
    pub fn initialize(&mut self, provided_secret_hex: Option<&str>) -> Result<IdentityOrigin, IdentityError> {
        let (keys, origin) = match provided_secret_hex.filter(|s| !s.trim().is_empty()) {
            Some(secret) => {
                let keys = IdentityKeys::from_secret_hex(secret)?;
                self.store.save_keys(&keys)?;
                (keys, IdentityOrigin::Provided)
            }
            None => match self.store.load_keys()? {
                Some(keys) => {
                    tracing::info!("🔑 Loaded existing identity");
                    (keys, IdentityOrigin::Stored)
                }
                None => {
                    tracing::info!("🔑 Generating new identity");
                    let keys = IdentityKeys::generate();
                    self.store.save_keys(&keys)?;
                    (keys, IdentityOrigin::Generated)
                }
            },
        };

        self.keys = Some(keys);
        Ok(origin)
    }

    /// Hand the keys to the engine
    pub fn into_keys(self) -> Result<IdentityKeys, IdentityError> {
        self.keys.ok_or(IdentityError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{MemoryStorage, SledStorage};
    use std::sync::Arc;

    fn manager() -> IdentityManager {
        IdentityManager::with_store(IdentityStore::new(Arc::new(MemoryStorage::new())))
    }

    #[test]
    fn test_uninitialized_manager_has_no_keys() {
        assert!(matches!(manager().into_keys(), Err(IdentityError::NotInitialized)));
    }

    #[test]
    fn test_generates_when_nothing_provided() {
        let mut manager = manager();
        let origin = manager.initialize(None).unwrap();

        assert_eq!(origin, IdentityOrigin::Generated);
        assert!(manager.into_keys().unwrap().peer_id().is_ok());
    }

    #[test]
    fn test_provided_secret_wins() {
        let keys = IdentityKeys::generate();
        let mut manager = manager();
        let origin = manager.initialize(Some(keys.secret_hex().as_str())).unwrap();

        assert_eq!(origin, IdentityOrigin::Provided);
        assert_eq!(manager.into_keys().unwrap().public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn test_blank_secret_is_treated_as_absent() {
        let mut manager = manager();
        assert_eq!(manager.initialize(Some("  ")).unwrap(), IdentityOrigin::Generated);
    }

    #[test]
    fn test_malformed_secret_is_fatal() {
        let mut manager = manager();
        assert!(matches!(
            manager.initialize(Some("deadbeef")),
            Err(IdentityError::InvalidKeyMaterial)
        ));
        assert!(manager.into_keys().is_err());
    }

    #[test]
    fn test_identity_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");

        let first = {
            let backend = Arc::new(SledStorage::open(&path).unwrap());
            let mut manager = IdentityManager::with_store(IdentityStore::new(backend));
            assert_eq!(manager.initialize(None).unwrap(), IdentityOrigin::Generated);
            manager.into_keys().unwrap().peer_id().unwrap()
        };

        let backend = Arc::new(SledStorage::open(&path).unwrap());
        let mut manager = IdentityManager::with_store(IdentityStore::new(backend));
        assert_eq!(manager.initialize(None).unwrap(), IdentityOrigin::Stored);
        assert_eq!(manager.into_keys().unwrap().peer_id().unwrap(), first);
    }
}
