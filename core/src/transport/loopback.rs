// Loopback transport: in-process gossip fabric
//
// Nodes join with their peer id and receive `TransportEvent`s on a bounded
// channel. Frames are delivered along explicit links only and never back to
// the publisher. Linking the same pair twice models redundant paths: each
// link delivers its own copy of every frame.

use super::{GossipPublisher, Topic, TransportError, TransportEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Fabric {
    nodes: HashMap<String, mpsc::Sender<TransportEvent>>,
    links: Vec<(String, String)>,
}

impl Fabric {
    /// One entry per link, so redundant links yield duplicate deliveries.
    fn neighbours(&self, peer_id: &str) -> Vec<mpsc::Sender<TransportEvent>> {
        self.links
            .iter()
            .filter_map(|(a, b)| {
                if a == peer_id {
                    Some(b)
                } else if b == peer_id {
                    Some(a)
                } else {
                    None
                }
            })
            .filter_map(|other| self.nodes.get(other).cloned())
            .collect()
    }

    fn linked(&self, a: &str, b: &str) -> bool {
        self.links
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    fabric: Arc<Mutex<Fabric>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node; returns its publisher and inbound event stream.
    pub fn join(
        &self,
        peer_id: &str,
        capacity: usize,
    ) -> (LoopbackPublisher, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.fabric.lock().nodes.insert(peer_id.to_string(), tx);
        let publisher = LoopbackPublisher {
            network: self.clone(),
            peer_id: peer_id.to_string(),
        };
        (publisher, rx)
    }

    /// Connect two joined nodes. The first link between a pair raises
    /// discovery and announcement-subscription events on both sides.
    pub fn link(&self, a: &str, b: &str) {
        let mut fabric = self.fabric.lock();
        let first = !fabric.linked(a, b);
        fabric.links.push((a.to_string(), b.to_string()));
        if !first {
            return;
        }

        for (local, remote) in [(a, b), (b, a)] {
            let Some(tx) = fabric.nodes.get(local) else {
                continue;
            };
            let events = [
                TransportEvent::PeerDiscovered {
                    peer_id: remote.to_string(),
                    addresses: vec![format!("/memory/{}", remote)],
                },
                TransportEvent::PeerSubscribed {
                    peer_id: remote.to_string(),
                    topic: Topic::Announcements,
                },
            ];
            for event in events {
                if tx.try_send(event).is_err() {
                    tracing::warn!("Loopback: event queue for {} full", local);
                }
            }
        }
    }

    /// Remove every link between `a` and `b`.
    pub fn unlink(&self, a: &str, b: &str) {
        let mut fabric = self.fabric.lock();
        fabric
            .links
            .retain(|(x, y)| !((x == a && y == b) || (x == b && y == a)));
        for (local, remote) in [(a, b), (b, a)] {
            if let Some(tx) = fabric.nodes.get(local) {
                let _ = tx.try_send(TransportEvent::PeerDisconnected {
                    peer_id: remote.to_string(),
                });
            }
        }
    }

    /// Detach a node; frames addressed to it are dropped from now on.
    pub fn leave(&self, peer_id: &str) {
        self.fabric.lock().nodes.remove(peer_id);
    }
}

/// `GossipPublisher` for one node on a `LoopbackNetwork`.
#[derive(Clone)]
pub struct LoopbackPublisher {
    network: LoopbackNetwork,
    peer_id: String,
}

impl LoopbackPublisher {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl GossipPublisher for LoopbackPublisher {
    async fn publish(&self, topic: Topic, data: Vec<u8>) -> Result<(), TransportError> {
        let targets = {
            let fabric = self.network.fabric.lock();
            if !fabric.nodes.contains_key(&self.peer_id) {
                return Err(TransportError::NotRunning);
            }
            fabric.neighbours(&self.peer_id)
        };

        for tx in targets {
            let event = TransportEvent::GossipMessage {
                topic,
                source: Some(self.peer_id.clone()),
                data: data.clone(),
            };
            // a receiver that went away just misses the frame
            let _ = tx.send(event).await;
        }
        Ok(())
    }
}
