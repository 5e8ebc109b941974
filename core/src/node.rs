// Node runtime: wires identity, store, policy, engine and transport
//
// One dispatch loop reads transport events and feeds two bounded per-topic
// queues. The message loop processes frames concurrently under a semaphore;
// the announcement loop is sequential. Everything stops on one watch signal.

use crate::bridge::start_bridge;
use crate::error::RelayError;
use crate::identity::{IdentityKeys, IdentityManager, IdentityOrigin, IdentityStore};
use crate::relay::{EngineConfig, PolicyStore, RelayEngine, DEFAULT_DEDUP_TTL};
use crate::store::{KvRelayStore, RelayStore, StorageBackend};
use crate::transport::{start_swarm, GossipPublisher, SwarmHandle, Topic, TransportEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runtime configuration for a relay node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP port for the gossip swarm (0 picks a free port)
    pub listen_port: u16,
    /// Local WebSocket bridge port; `None` disables the bridge
    pub bridge_port: Option<u16>,
    /// Multiaddrs dialed at start and used to seed the DHT
    pub bootstrap_nodes: Vec<String>,
    pub base_tags: Vec<String>,
    /// Peers blocked in addition to the persisted set
    pub blocked_peers: Vec<String>,
    /// Hex Ed25519 secret; wins over any stored identity
    pub private_key: Option<String>,
    pub dedup_ttl: Duration,
    /// Capacity of the local event channel and per-topic queues
    pub event_capacity: usize,
    /// Inbound frames processed concurrently
    pub max_in_flight: usize,
    pub enable_mdns: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 6000,
            bridge_port: Some(6001),
            bootstrap_nodes: Vec::new(),
            base_tags: Vec::new(),
            blocked_peers: Vec::new(),
            private_key: None,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            event_capacity: 256,
            max_in_flight: 64,
            enable_mdns: true,
        }
    }
}

/// Sweep expired dedup entries this often
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Provide, load, or generate the node identity. A generated key is surfaced
/// so the operator can pin it for the next start.
pub fn provision_identity(
    config: &NodeConfig,
    backend: Arc<dyn StorageBackend>,
) -> Result<IdentityKeys, RelayError> {
    let mut manager = IdentityManager::with_store(IdentityStore::new(backend));
    let origin = manager.initialize(config.private_key.as_deref())?;
    let keys = manager.into_keys()?;

    if origin == IdentityOrigin::Generated {
        warn!(
            "Generated a new identity. Set RELAY_PRIVATE_KEY={} to keep peer id {} across restarts",
            keys.secret_hex().as_str(),
            keys.peer_id()?
        );
    }
    Ok(keys)
}

pub struct RelayNode {
    engine: RelayEngine,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    swarm: Option<SwarmHandle>,
    bridge_addr: Option<SocketAddr>,
}

impl RelayNode {
    /// Start a node on the libp2p transport.
    pub async fn start(config: NodeConfig, backend: Arc<dyn StorageBackend>) -> Result<Self, RelayError> {
        let keys = provision_identity(&config, backend.clone())?;

        let listen_addr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e| RelayError::Config(format!("listen address: {}", e)))?;
        let mut bootstrap = Vec::new();
        for addr in &config.bootstrap_nodes {
            match addr.parse() {
                Ok(addr) => bootstrap.push(addr),
                Err(e) => return Err(RelayError::Config(format!("bootstrap node {}: {}", addr, e))),
            }
        }

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let swarm = start_swarm(
            keys.libp2p_keypair()?,
            listen_addr,
            bootstrap,
            config.enable_mdns,
            event_tx,
        )
        .await?;

        let mut node = Self::launch(config, keys, backend, Arc::new(swarm.clone()), event_rx).await?;
        node.swarm = Some(swarm);
        Ok(node)
    }

    /// Start a node on any transport: `publisher` for output, `transport_events` for input.
    pub async fn launch(
        config: NodeConfig,
        keys: IdentityKeys,
        backend: Arc<dyn StorageBackend>,
        publisher: Arc<dyn GossipPublisher>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<Self, RelayError> {
        let store: Arc<dyn RelayStore> = Arc::new(KvRelayStore::new(backend));
        let policy = Arc::new(
            PolicyStore::load(store.clone(), &config.base_tags, &config.blocked_peers).await?,
        );
        let engine = RelayEngine::new(
            keys,
            store,
            policy,
            publisher,
            EngineConfig {
                dedup_ttl: config.dedup_ttl,
                event_capacity: config.event_capacity,
                bootstrap_nodes: config.bootstrap_nodes.clone(),
            },
        )?;
        info!("Relay node {} starting", engine.local_peer_id());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let capacity = config.event_capacity.max(1);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let (announce_tx, announce_rx) = mpsc::channel(capacity);

        let mut tasks = vec![
            tokio::spawn(dispatch_loop(
                engine.clone(),
                transport_events,
                frames_tx,
                announce_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(message_loop(
                engine.clone(),
                frames_rx,
                config.max_in_flight.max(1),
                shutdown_rx.clone(),
            )),
            tokio::spawn(announcement_loop(engine.clone(), announce_rx, shutdown_rx.clone())),
            engine
                .dedup()
                .spawn_sweeper(DEDUP_SWEEP_INTERVAL, shutdown_rx.clone()),
        ];

        let bridge_addr = match config.bridge_port {
            Some(port) => {
                let addr = SocketAddr::from(([127, 0, 0, 1], port));
                let (bound, handle) = start_bridge(engine.clone(), addr, shutdown_rx).await?;
                tasks.push(handle);
                Some(bound)
            }
            None => None,
        };

        if let Err(e) = engine.announce().await {
            debug!("Initial announcement not sent: {}", e);
        }

        Ok(Self {
            engine,
            shutdown_tx,
            tasks,
            swarm: None,
            bridge_addr,
        })
    }

    pub fn engine(&self) -> &RelayEngine {
        &self.engine
    }

    pub fn peer_id(&self) -> &str {
        self.engine.local_peer_id()
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge_addr
    }

    /// Stop loops, sweeper, bridge and swarm. In-flight frame tasks are
    /// detached and may finish or be dropped.
    pub async fn stop(self) {
        info!("Relay node {} stopping", self.engine.local_peer_id());
        let _ = self.shutdown_tx.send(true);

        if let Some(swarm) = &self.swarm {
            if let Err(e) = swarm.shutdown().await {
                debug!("Swarm already stopped: {}", e);
            }
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        info!("Relay node stopped");
    }
}

async fn dispatch_loop(
    engine: RelayEngine,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    frames_tx: mpsc::Sender<(Vec<u8>, Option<String>)>,
    announce_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Never awaits a queue or a publish: frame tasks wait on the transport,
    // so the transport must always find this loop draining.
    loop {
        tokio::select! {
            event = transport_events.recv() => {
                let Some(event) = event else {
                    debug!("Transport event stream closed");
                    break;
                };
                match event {
                    TransportEvent::GossipMessage { topic: Topic::Messages, source, data } => {
                        if !enqueue(&frames_tx, (data, source), Topic::Messages) {
                            break;
                        }
                    }
                    TransportEvent::GossipMessage { topic: Topic::Announcements, data, .. } => {
                        if !enqueue(&announce_tx, data, Topic::Announcements) {
                            break;
                        }
                    }
                    TransportEvent::PeerDiscovered { peer_id, addresses } => {
                        engine.on_peer_discovered(&peer_id, addresses).await;
                    }
                    TransportEvent::PeerDisconnected { peer_id } => {
                        engine.on_peer_disconnected(&peer_id);
                    }
                    TransportEvent::PeerSubscribed { peer_id, topic } => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.on_peer_subscribed(&peer_id, topic).await;
                        });
                    }
                    TransportEvent::ListeningOn(addr) => {
                        info!("Node {} listening on {}", engine.local_peer_id(), addr);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Queue without waiting; a full queue drops the frame. Returns false once
/// the consumer is gone.
fn enqueue<T>(tx: &mpsc::Sender<T>, item: T, topic: Topic) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{} queue full, dropping frame", topic);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn message_loop(
    engine: RelayEngine,
    mut frames_rx: mpsc::Receiver<(Vec<u8>, Option<String>)>,
    max_in_flight: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    loop {
        // take a permit first so a saturated node leaves frames queued, and
        // keep both waits interruptible by shutdown
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let (data, source) = tokio::select! {
            frame = frames_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            let outcome = engine.handle_network_frame(&data, source.as_deref()).await;
            debug!("Frame processed: {:?}", outcome);
            drop(permit);
        });
    }
}

async fn announcement_loop(
    engine: RelayEngine,
    mut announce_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            data = announce_rx.recv() => {
                let Some(data) = data else {
                    break;
                };
                engine.handle_announcement(&data).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::sign_message;
    use crate::message::{encode_message, now_millis, Message};
    use crate::store::MemoryStorage;
    use crate::transport::{LoopbackNetwork, TransportError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    type Reply = mpsc::Sender<Result<(), TransportError>>;

    /// Publisher built like the swarm task: publish requests are answered by
    /// the same loop that pushes inbound frames with a waiting send.
    struct SingleTaskPublisher {
        commands: mpsc::Sender<Reply>,
    }

    #[async_trait]
    impl GossipPublisher for SingleTaskPublisher {
        async fn publish(&self, _topic: Topic, _data: Vec<u8>) -> Result<(), TransportError> {
            let (reply, mut reply_rx) = mpsc::channel(1);
            self.commands
                .send(reply)
                .await
                .map_err(|_| TransportError::NotRunning)?;
            reply_rx.recv().await.ok_or(TransportError::NoReply)?
        }
    }

    fn directed_frame(keys: &IdentityKeys, id: &str) -> TransportEvent {
        let mut message = Message {
            id: id.to_string(),
            message_type: "chat".into(),
            data: serde_json::json!({}),
            sender: keys.peer_id().unwrap(),
            recipient: Some("elsewhere".into()),
            timestamp: now_millis(),
            signature: String::new(),
            relay_path: vec![],
            validations: vec![],
            tags: vec![],
        };
        message.signature = sign_message(&message, keys).unwrap();
        TransportEvent::GossipMessage {
            topic: Topic::Messages,
            source: Some("upstream".into()),
            data: encode_message(&message).unwrap(),
        }
    }

    fn loopback_config() -> NodeConfig {
        NodeConfig {
            bridge_port: None,
            enable_mdns: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_provision_identity_prefers_provided_key() {
        let keys = IdentityKeys::generate();
        let config = NodeConfig {
            private_key: Some(keys.secret_hex().to_string()),
            ..loopback_config()
        };
        let provisioned = provision_identity(&config, Arc::new(MemoryStorage::new())).unwrap();
        assert_eq!(provisioned.public_key_hex(), keys.public_key_hex());
    }

    #[test]
    fn test_provision_identity_rejects_bad_key() {
        let config = NodeConfig {
            private_key: Some("xyz".into()),
            ..loopback_config()
        };
        assert!(matches!(
            provision_identity(&config, Arc::new(MemoryStorage::new())),
            Err(RelayError::Identity(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_and_stop_on_loopback() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let config = loopback_config();
        let keys = provision_identity(&config, backend.clone()).unwrap();
        let peer_id = keys.peer_id().unwrap();

        let net = LoopbackNetwork::new();
        let (publisher, events) = net.join(&peer_id, 16);
        let node = RelayNode::launch(config, keys, backend, Arc::new(publisher), events)
            .await
            .unwrap();
        assert_eq!(node.peer_id(), peer_id);
        assert!(node.bridge_addr().is_none());

        tokio::time::timeout(Duration::from_secs(5), node.stop())
            .await
            .expect("node did not stop");
    }

    #[tokio::test]
    async fn test_bridge_bound_when_configured() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let config = NodeConfig {
            bridge_port: Some(0),
            ..loopback_config()
        };
        let keys = provision_identity(&config, backend.clone()).unwrap();
        let net = LoopbackNetwork::new();
        let (publisher, events) = net.join("solo", 4);

        let node = RelayNode::launch(config, keys, backend, Arc::new(publisher), events)
            .await
            .unwrap();
        assert!(node.bridge_addr().is_some());
        node.stop().await;
    }

    #[tokio::test]
    async fn test_directed_flood_does_not_stall_relay() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
        let config = loopback_config();
        let keys = provision_identity(&config, backend.clone()).unwrap();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (command_tx, mut command_rx) = mpsc::channel::<Reply>(256);
        let (done_tx, done_rx) = oneshot::channel();
        let published = Arc::new(AtomicUsize::new(0));

        let sender = IdentityKeys::generate();
        let frames: Vec<TransportEvent> = (0..3000)
            .map(|i| directed_frame(&sender, &format!("flood{:05}", i)))
            .collect();

        let counter = published.clone();
        let inbound = event_tx.clone();
        let transport = tokio::spawn(async move {
            let mut frames = frames.into_iter();
            let mut done_tx = Some(done_tx);
            loop {
                while let Ok(reply) = command_rx.try_recv() {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = reply.send(Ok(())).await;
                }
                match frames.next() {
                    Some(event) => {
                        if inbound.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if let Some(done) = done_tx.take() {
                            let _ = done.send(());
                        }
                        match command_rx.recv().await {
                            Some(reply) => {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let _ = reply.send(Ok(())).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        let publisher = SingleTaskPublisher {
            commands: command_tx,
        };
        let node = RelayNode::launch(config, keys, backend, Arc::new(publisher), event_rx)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(30), done_rx)
            .await
            .expect("transport stuck pushing frames")
            .unwrap();

        // the relay loop is still alive after the flood; a full queue may
        // drop a copy, so offer it again until it is processed
        let dedup = node.engine().dedup();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !dedup.seen("after-flood") {
            assert!(
                tokio::time::Instant::now() < deadline,
                "frame after flood never processed"
            );
            event_tx
                .send(directed_frame(&sender, "after-flood"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(published.load(Ordering::SeqCst) > 1);

        tokio::time::timeout(Duration::from_secs(5), node.stop())
            .await
            .expect("node did not stop");
        transport.abort();
    }
}
