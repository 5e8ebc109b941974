// relaynet core: signed gossip relay
//
// Messages carry their originator's signature and collect one validation
// opinion per relay. Trust is local: each node filters what it stores and
// emits by its own tag and peer policy, and never vetoes on behalf of others.

pub mod bridge;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod relay;
pub mod store;
pub mod transport;

pub use error::RelayError;
pub use identity::{IdentityKeys, IdentityManager};
pub use message::{Message, MessageDraft, PeerAnnouncement, ValidationResult};
pub use node::{provision_identity, NodeConfig, RelayNode};
pub use relay::{InboundOutcome, PeerInfo, RelayEngine, RelayEvent};
pub use store::{KvRelayStore, MemoryStorage, MessageQuery, RelayStore, SledStorage};
pub use transport::{GossipPublisher, LoopbackNetwork, Topic};
