//! Relay core: dedup, peer directory, policy, and the relay engine
//!
//! Every node relays directed messages on behalf of others and keeps its
//! own opinion of each signature in the message's validation chain.

mod admin;
pub mod dedup;
pub mod directory;
pub mod engine;
mod outbound;
pub mod policy;

pub use dedup::{DedupCache, DEFAULT_DEDUP_TTL};
pub use directory::{PeerDirectory, PeerInfo};
pub use engine::{EngineConfig, ForwardDecision, InboundOutcome, RelayEngine, RelayEvent};
pub use policy::PolicyStore;
