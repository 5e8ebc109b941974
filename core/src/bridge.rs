// Local bridge: WebSocket access for local clients
//
// On connect a client gets `{"type":"peers","data":[...]}`. Each text frame
// it sends is a draft `{type, data, recipient?, tags?}` fed to `broadcast`
// and acknowledged with `{"type":"sent","data":{"id":...}}`. Received
// messages are pushed as `{"type":"message","data":{...}}`.

use crate::error::RelayError;
use crate::message::{Message, MessageDraft};
use crate::relay::{PeerInfo, RelayEngine, RelayEvent};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum BridgeFrame {
    Peers(Vec<PeerInfo>),
    Message(Message),
    Sent { id: String },
    Error(String),
}

impl BridgeFrame {
    fn to_ws(&self) -> Option<WsMessage> {
        serde_json::to_string(self).ok().map(WsMessage::Text)
    }
}

/// Bind the bridge and serve until `shutdown` flips to `true`.
/// Returns the bound address (useful with port 0) and the accept task.
pub async fn start_bridge(
    engine: RelayEngine,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, JoinHandle<()>), RelayError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("Local bridge listening on ws://{}", local_addr);

    let handle = tokio::spawn(accept_loop(listener, engine, shutdown));
    Ok((local_addr, handle))
}

async fn accept_loop(listener: TcpListener, engine: RelayEngine, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_client(stream, peer, engine.clone(), shutdown.clone()));
                }
                Err(e) => warn!("Bridge accept failed: {}", e),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Local bridge stopped");
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    engine: RelayEngine,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Bridge handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut events = engine.subscribe();
    debug!("Bridge client {} connected", peer);

    if let Some(frame) = BridgeFrame::Peers(engine.get_peers().await).to_ws() {
        if ws_tx.send(frame).await.is_err() {
            return;
        }
    }

    loop {
        let reply = tokio::select! {
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => Some(submit(&engine, &text).await),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!("Bridge client {} error: {}", peer, e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(RelayEvent::MessageReceived(message)) => Some(BridgeFrame::Message(message)),
                Ok(RelayEvent::PeerDiscovered(_)) => Some(BridgeFrame::Peers(engine.get_peers().await)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Bridge client {} lagged by {} events", peer, n);
                    None
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                None
            }
        };

        if let Some(frame) = reply.as_ref().and_then(BridgeFrame::to_ws) {
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    }
    debug!("Bridge client {} disconnected", peer);
}

async fn submit(engine: &RelayEngine, text: &str) -> BridgeFrame {
    let draft: MessageDraft = match serde_json::from_str(text) {
        Ok(draft) => draft,
        Err(e) => return BridgeFrame::Error(format!("invalid draft: {}", e)),
    };
    match engine.broadcast(draft).await {
        Ok(id) => BridgeFrame::Sent { id },
        Err(e) => BridgeFrame::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::relay::{EngineConfig, PolicyStore};
    use crate::store::{KvRelayStore, MemoryStorage, RelayStore};
    use crate::transport::{GossipPublisher, Topic, TransportError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    struct NullPublisher;

    #[async_trait]
    impl GossipPublisher for NullPublisher {
        async fn publish(&self, _: Topic, _: Vec<u8>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn engine() -> RelayEngine {
        let store: Arc<dyn RelayStore> =
            Arc::new(KvRelayStore::new(Arc::new(MemoryStorage::new())));
        let policy = Arc::new(PolicyStore::load(store.clone(), &[], &[]).await.unwrap());
        RelayEngine::new(
            IdentityKeys::generate(),
            store,
            policy,
            Arc::new(NullPublisher),
            EngineConfig::default(),
        )
        .unwrap()
    }

    async fn next_json<S>(rx: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.next())
                .await
                .expect("bridge timed out")
                .expect("stream ended")
                .expect("ws error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_frame_shapes() {
        let peers = serde_json::to_value(BridgeFrame::Peers(vec![])).unwrap();
        assert_eq!(peers, serde_json::json!({"type": "peers", "data": []}));

        let sent = serde_json::to_value(BridgeFrame::Sent { id: "abc".into() }).unwrap();
        assert_eq!(sent, serde_json::json!({"type": "sent", "data": {"id": "abc"}}));
    }

    #[tokio::test]
    async fn test_bridge_pushes_peers_and_broadcasts_drafts() {
        let engine = engine().await;
        engine.on_peer_discovered("peer-x", vec![]).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, handle) = start_bridge(engine.clone(), "127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        let (mut tx, mut rx) = ws.split();

        let hello = next_json(&mut rx).await;
        assert_eq!(hello["type"], "peers");
        assert_eq!(hello["data"][0]["id"], "peer-x");

        tx.send(WsMessage::Text(r#"{"type":"ping","data":{},"tags":["demo"]}"#.into()))
            .await
            .unwrap();
        let ack = next_json(&mut rx).await;
        assert_eq!(ack["type"], "sent");
        let id = ack["data"]["id"].as_str().unwrap().to_string();

        let stored = engine.query_messages(0, u64::MAX, None, None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);

        tx.send(WsMessage::Text("nonsense".into())).await.unwrap();
        assert_eq!(next_json(&mut rx).await["type"], "error");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
