// Shared helpers for multi-node tests on the loopback fabric

#![allow(dead_code)]

use relaynet_core::identity::IdentityKeys;
use relaynet_core::store::StorageBackend;
use relaynet_core::transport::LoopbackPublisher;
use relaynet_core::{provision_identity, LoopbackNetwork, MemoryStorage, NodeConfig, RelayEvent, RelayNode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct TestNode {
    pub node: RelayNode,
    /// Raw access to this node's link, for injecting hand-built frames
    pub publisher: LoopbackPublisher,
    pub keys: IdentityKeys,
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.peer_id().to_string()
    }
}

pub fn test_config() -> NodeConfig {
    NodeConfig {
        bridge_port: None,
        enable_mdns: false,
        ..Default::default()
    }
}

pub async fn spawn_node(net: &LoopbackNetwork) -> TestNode {
    spawn_node_with(net, test_config(), Arc::new(MemoryStorage::new())).await
}

pub async fn spawn_node_with(
    net: &LoopbackNetwork,
    config: NodeConfig,
    backend: Arc<dyn StorageBackend>,
) -> TestNode {
    let keys = provision_identity(&config, backend.clone()).unwrap();
    let peer_id = keys.peer_id().unwrap();
    let (publisher, events) = net.join(&peer_id, 256);
    let node = RelayNode::launch(config, keys.clone(), backend, Arc::new(publisher.clone()), events)
        .await
        .unwrap();
    TestNode {
        node,
        publisher,
        keys,
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Wait until `observer` has `subject`'s announced key on file.
pub async fn await_key(observer: &TestNode, subject: &TestNode) {
    let directory = observer.node.engine().directory();
    let subject_id = subject.id();
    eventually("announced key", || {
        let directory = directory.clone();
        let subject_id = subject_id.clone();
        async move { directory.resolve_public_key(&subject_id).await.is_some() }
    })
    .await;
}

/// Drain every `MessageReceived` that arrives within `window`.
pub async fn received_within(
    events: &mut broadcast::Receiver<RelayEvent>,
    window: Duration,
) -> Vec<relaynet_core::Message> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(RelayEvent::MessageReceived(message))) => messages.push(message),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }
    messages
}
