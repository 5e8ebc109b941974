mod common;

use common::{spawn_node_with, test_config};
use relaynet_core::store::StorageBackend;
use relaynet_core::{LoopbackNetwork, MessageDraft, NodeConfig, SledStorage};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_identity_policy_and_messages_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    // First run: generate identity, set policy, store a message
    let (peer_id, message_id) = {
        let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::open(&path).unwrap());
        let config = NodeConfig {
            base_tags: vec!["seed".into()],
            ..test_config()
        };
        let node = spawn_node_with(&LoopbackNetwork::new(), config, backend).await;
        let engine = node.node.engine().clone();

        engine.update_base_tags(vec!["news".into()]).await.unwrap();
        engine.update_blocked_tags(vec!["spam".into()]).await.unwrap();
        engine.block_peer("bad-peer", true).await.unwrap();
        let message_id = engine
            .broadcast(MessageDraft::new("ping", json!({"n": 1})).with_tags(vec!["demo".into()]))
            .await
            .unwrap();

        let peer_id = node.id();
        drop(engine);
        node.node.stop().await;
        (peer_id, message_id)
    };
    // everything holding the sled db is dropped here

    // Second run: same directory, different config seed
    {
        let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::open(&path).unwrap());
        let config = NodeConfig {
            base_tags: vec!["seed".into()],
            ..test_config()
        };
        let node = spawn_node_with(&LoopbackNetwork::new(), config, backend).await;
        let engine = node.node.engine().clone();

        assert_eq!(node.id(), peer_id, "stored identity must be reused");
        assert_eq!(engine.get_base_tags(), vec!["news".to_string()]);
        assert_eq!(engine.get_blocked_tags(), vec!["spam".to_string()]);
        assert_eq!(engine.get_blocked_peers(), vec!["bad-peer".to_string()]);
        assert!(engine
            .get_peers()
            .await
            .iter()
            .any(|p| p.id == "bad-peer" && p.blocked));

        let messages = engine.query_messages(0, u64::MAX, None, None).await.unwrap();
        // the first run's base-tags announcement is stored alongside the ping
        assert!(messages.iter().any(|m| m.id == message_id));
        assert!(messages.iter().all(|m| m.sender == peer_id));

        drop(engine);
        node.node.stop().await;
    }
}

#[tokio::test]
async fn test_provided_key_overrides_stored_identity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let first_id = {
        let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::open(&path).unwrap());
        let node = spawn_node_with(&LoopbackNetwork::new(), test_config(), backend).await;
        let id = node.id();
        node.node.stop().await;
        id
    };

    let pinned = relaynet_core::IdentityKeys::generate();
    let backend: Arc<dyn StorageBackend> = Arc::new(SledStorage::open(&path).unwrap());
    let config = NodeConfig {
        private_key: Some(pinned.secret_hex().to_string()),
        ..test_config()
    };
    let node = spawn_node_with(&LoopbackNetwork::new(), config, backend).await;
    assert_ne!(node.id(), first_id);
    assert_eq!(node.id(), pinned.peer_id().unwrap());
    node.node.stop().await;
}
