// Transport module: gossip channel adapters
//
// The relay engine only depends on `GossipPublisher` for output and consumes
// `TransportEvent`s for input. `swarm` is the libp2p adapter; `loopback` is an
// in-process fabric for tests and single-host demos.

pub mod behaviour;
pub mod loopback;
pub mod swarm;

pub use loopback::{LoopbackNetwork, LoopbackPublisher};
pub use swarm::{start_swarm, SwarmCommand, SwarmHandle};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Topic carrying JSON-encoded `Message`s
pub const MESSAGES_TOPIC: &str = "network-messages";
/// Topic carrying `{peerId, publicKey}` announcements
pub const ANNOUNCEMENTS_TOPIC: &str = "peer-announcements";

/// The two gossip topics a relay node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Messages,
    Announcements,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Messages, Topic::Announcements];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Messages => MESSAGES_TOPIC,
            Topic::Announcements => ANNOUNCEMENTS_TOPIC,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            MESSAGES_TOPIC => Some(Topic::Messages),
            ANNOUNCEMENTS_TOPIC => Some(Topic::Announcements),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport task not running")]
    NotRunning,
    #[error("no reply from transport task")]
    NoReply,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// Input from the transport layer to the node runtime.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A frame arrived on a subscribed topic
    GossipMessage {
        topic: Topic,
        /// Peer that handed us the frame (not necessarily its author)
        source: Option<String>,
        data: Vec<u8>,
    },
    PeerDiscovered {
        peer_id: String,
        addresses: Vec<String>,
    },
    PeerDisconnected { peer_id: String },
    /// A remote peer subscribed to one of our topics
    PeerSubscribed { peer_id: String, topic: Topic },
    ListeningOn(String),
}

/// Outbound half of the gossip channel.
#[async_trait]
pub trait GossipPublisher: Send + Sync {
    async fn publish(&self, topic: Topic, data: Vec<u8>) -> Result<(), TransportError>;
}
