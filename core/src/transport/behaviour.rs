// Combined NetworkBehaviour for a relay node
//
// - gossipsub: the two relay topics
// - kademlia: DHT for peer discovery on WAN, seeded from bootstrap nodes
// - mdns: peer discovery on LAN
// - identify: exchange listen addresses

use crate::message::MAX_MESSAGE_SIZE;
use libp2p::{gossipsub, identify, kad, mdns, swarm::NetworkBehaviour};
use std::time::Duration;

use super::TransportError;

/// Protocol string announced through identify
const IDENTIFY_PROTOCOL: &str = "/relaynet/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Disabled nodes still carry the toggle so the event type stays uniform
    pub mdns: libp2p::swarm::behaviour::toggle::Toggle<mdns::tokio::Behaviour>,
    pub identify: identify::Behaviour,
}

impl RelayBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair, enable_mdns: bool) -> Result<Self, TransportError> {
        let peer_id = keypair.public().to_peer_id();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(10))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(MAX_MESSAGE_SIZE)
            .build()
            .map_err(|e| TransportError::Setup(format!("gossipsub config: {}", e)))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| TransportError::Setup(format!("gossipsub: {}", e)))?;

        let kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));

        let mdns = if enable_mdns {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                    .map_err(|e| TransportError::Setup(format!("mdns: {}", e)))?,
            )
        } else {
            None
        };

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_push_listen_addr_updates(true)
                .with_interval(Duration::from_secs(60)),
        );

        Ok(Self {
            gossipsub,
            kademlia,
            mdns: mdns.into(),
            identify,
        })
    }
}
