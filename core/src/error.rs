// Crate-wide error type for administrative operations and startup

use crate::identity::IdentityError;
use crate::message::CodecError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("configuration: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
