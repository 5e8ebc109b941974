// libp2p swarm setup: the running gossip node
//
// TCP + Noise + Yamux (with DNS resolution), the behaviours from
// behaviour.rs, and a command channel so the rest of the node never touches
// the swarm directly.

use super::behaviour::{RelayBehaviour, RelayBehaviourEvent};
use super::{GossipPublisher, Topic, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity::Keypair, kad, mdns, multiaddr::Protocol, swarm::SwarmEvent,
    Multiaddr, PeerId,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Commands that can be sent to the swarm task
#[derive(Debug)]
pub enum SwarmCommand {
    /// Publish a frame on a gossip topic
    Publish {
        topic: Topic,
        data: Vec<u8>,
        reply: mpsc::Sender<Result<(), TransportError>>,
    },
    /// Shutdown the swarm
    Shutdown,
}

/// Handle to communicate with the running swarm task
#[derive(Clone)]
pub struct SwarmHandle {
    command_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    async fn request<T>(
        &self,
        command: SwarmCommand,
        mut reply_rx: mpsc::Receiver<T>,
    ) -> Result<T, TransportError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| TransportError::NotRunning)?;
        reply_rx.recv().await.ok_or(TransportError::NoReply)
    }

    /// Shut down the swarm
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.command_tx
            .send(SwarmCommand::Shutdown)
            .await
            .map_err(|_| TransportError::NotRunning)
    }
}

#[async_trait]
impl GossipPublisher for SwarmHandle {
    async fn publish(&self, topic: Topic, data: Vec<u8>) -> Result<(), TransportError> {
        let (reply, reply_rx) = mpsc::channel(1);
        self.request(SwarmCommand::Publish { topic, data, reply }, reply_rx)
            .await?
    }
}

/// Hand an event to the node without waiting. The swarm task also serves
/// publish commands, so it must never block on a node that is itself waiting
/// for a publish reply; a full queue drops the event.
fn forward_event(event_tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("Node event queue full, dropping transport event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!("Node event queue closed");
        }
    }
}

/// Peer id embedded in a `/p2p/<id>` suffix, if any
fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// Build and start the libp2p swarm, returning a handle for communication.
///
/// This spawns a tokio task that runs the swarm event loop and subscribes to
/// both relay topics. Bootstrap addresses carrying a `/p2p/` suffix seed
/// Kademlia; every bootstrap address is dialed once.
pub async fn start_swarm(
    keypair: Keypair,
    listen_addr: Multiaddr,
    bootstrap: Vec<Multiaddr>,
    enable_mdns: bool,
    event_tx: mpsc::Sender<TransportEvent>,
) -> Result<SwarmHandle, TransportError> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| TransportError::Setup(e.to_string()))?
        .with_dns()
        .map_err(|e| TransportError::Setup(e.to_string()))?
        .with_behaviour(|key| {
            RelayBehaviour::new(key, enable_mdns)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
        .map_err(|e| TransportError::Setup(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(300)))
        .build();

    for topic in Topic::ALL {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic.as_str()))
            .map_err(|e| TransportError::Setup(format!("subscribe {}: {}", topic, e)))?;
    }

    swarm
        .listen_on(listen_addr)
        .map_err(|e| TransportError::Listen(e.to_string()))?;

    // Set Kademlia to server mode (so we can be found)
    swarm
        .behaviour_mut()
        .kademlia
        .set_mode(Some(kad::Mode::Server));

    let mut seeded = false;
    for addr in bootstrap {
        if let Some(peer_id) = peer_id_of(&addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
            seeded = true;
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            tracing::warn!("Bootstrap dial to {} failed: {}", addr, e);
        }
    }
    if seeded {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            tracing::debug!("Kademlia bootstrap not started: {}", e);
        }
    }

    let (command_tx, mut command_rx) = mpsc::channel::<SwarmCommand>(256);
    let handle = SwarmHandle { command_tx };

    let messages_hash = gossipsub::IdentTopic::new(Topic::Messages.as_str()).hash();
    let announcements_hash = gossipsub::IdentTopic::new(Topic::Announcements.as_str()).hash();
    let topic_of = move |hash: &gossipsub::TopicHash| {
        if *hash == messages_hash {
            Some(Topic::Messages)
        } else if *hash == announcements_hash {
            Some(Topic::Announcements)
        } else {
            None
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { propagation_source, message, .. }
                        )) => {
                            let Some(topic) = topic_of(&message.topic) else {
                                continue;
                            };
                            forward_event(&event_tx, TransportEvent::GossipMessage {
                                topic,
                                source: Some(propagation_source.to_string()),
                                data: message.data,
                            });
                        }

                        SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(
                            gossipsub::Event::Subscribed { peer_id, topic }
                        )) => {
                            if let Some(topic) = topic_of(&topic) {
                                tracing::debug!("{} subscribed to {}", peer_id, topic);
                                forward_event(&event_tx, TransportEvent::PeerSubscribed {
                                    peer_id: peer_id.to_string(),
                                    topic,
                                });
                            }
                        }

                        SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(
                            mdns::Event::Discovered(peers)
                        )) => {
                            for (peer_id, addr) in peers {
                                tracing::info!("mDNS discovered peer: {} at {}", peer_id, addr);
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                                if !swarm.is_connected(&peer_id) {
                                    if let Err(e) = swarm.dial(addr) {
                                        tracing::debug!("Dial to mDNS peer {} failed: {}", peer_id, e);
                                    }
                                }
                            }
                        }

                        SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(
                            mdns::Event::Expired(peers)
                        )) => {
                            for (peer_id, _addr) in peers {
                                tracing::debug!("mDNS peer expired: {}", peer_id);
                            }
                        }

                        SwarmEvent::Behaviour(RelayBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. }
                        )) => {
                            tracing::debug!("Identified peer {} with {} addresses", peer_id, info.listen_addrs.len());
                            for addr in info.listen_addrs {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            tracing::info!("Listening on {}", address);
                            forward_event(&event_tx, TransportEvent::ListeningOn(address.to_string()));
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let remote = endpoint.get_remote_address().clone();
                            tracing::info!("Connected to {} via {}", peer_id, remote);
                            forward_event(&event_tx, TransportEvent::PeerDiscovered {
                                peer_id: peer_id.to_string(),
                                addresses: vec![remote.to_string()],
                            });
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                tracing::info!("Disconnected from {}", peer_id);
                                forward_event(&event_tx, TransportEvent::PeerDisconnected {
                                    peer_id: peer_id.to_string(),
                                });
                            }
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            tracing::debug!("Outgoing connection to {:?} failed: {}", peer_id, error);
                        }

                        _ => {}
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SwarmCommand::Publish { topic, data, reply } => {
                            let result = swarm
                                .behaviour_mut()
                                .gossipsub
                                .publish(gossipsub::IdentTopic::new(topic.as_str()), data)
                                .map(|_| ())
                                .map_err(|e| TransportError::Publish(e.to_string()));
                            let _ = reply.send(result).await;
                        }

                        SwarmCommand::Shutdown => {
                            tracing::info!("Swarm shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_of_bootstrap_addr() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/6000/p2p/{}", peer_id)
            .parse()
            .unwrap();
        assert_eq!(peer_id_of(&addr), Some(peer_id));

        let bare: Multiaddr = "/ip4/10.0.0.1/tcp/6000".parse().unwrap();
        assert_eq!(peer_id_of(&bare), None);
    }

    #[tokio::test]
    async fn test_swarm_starts_and_shuts_down() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let handle = start_swarm(
            Keypair::generate_ed25519(),
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            vec![],
            false,
            event_tx,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::ListeningOn(_)));

        handle.shutdown().await.unwrap();
    }
}
