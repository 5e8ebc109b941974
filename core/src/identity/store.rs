// Identity storage on top of the node's storage backend

use super::{IdentityError, IdentityKeys};
use crate::store::backend::StorageBackend;
use std::sync::Arc;

const IDENTITY_KEY: &[u8] = b"identity:keys";

/// Identity keys kept in the node's storage backend
pub struct IdentityStore {
    backend: Arc<dyn StorageBackend>,
}

impl IdentityStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Save keys and flush, so a crash right after start keeps the identity
    pub fn save_keys(&self, keys: &IdentityKeys) -> Result<(), IdentityError> {
        let bytes = keys.to_bytes();
        self.backend.put(IDENTITY_KEY, &bytes)?;
        self.backend.flush()?;
        Ok(())
    }

    pub fn load_keys(&self) -> Result<Option<IdentityKeys>, IdentityError> {
        match self.backend.get(IDENTITY_KEY)? {
            Some(bytes) => Ok(Some(IdentityKeys::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }
}
