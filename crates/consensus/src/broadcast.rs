//! Websocket peer network
//!
//! Every node listens for peers and also dials the peers it was configured
//! with. Both kinds of connection end up in one table keyed by address, so a
//! message can go to a chosen set of peers or to everyone. Whatever a peer
//! sends is decoded and handed to the node through a single inbound channel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};

use pchain_types::{BlockPayload, Receipt, SignedTransaction};

use crate::types::PeerMessage;

/// Outgoing side of the peer network as the scheduler sees it
#[async_trait]
pub trait PeerBroadcaster: Send + Sync {
    /// Send `message` to `targets`, or to every peer when `targets` is empty.
    /// Returns how many peers it was queued for.
    async fn send(&self, message: PeerMessage, targets: &[String]) -> usize;

    /// Addresses of the peers currently reachable
    fn peers(&self) -> Vec<String>;

    async fn broadcast_block(&self, payload: &BlockPayload, targets: &[String]) -> usize {
        self.send(PeerMessage::Block(payload.clone()), targets).await
    }

    async fn broadcast_receipt(&self, receipt: &Receipt, targets: &[String]) -> usize {
        self.send(PeerMessage::Receipt(receipt.clone()), targets).await
    }

    async fn broadcast_transaction(&self, tx: &SignedTransaction) -> usize {
        self.send(PeerMessage::Transaction(tx.clone()), &[]).await
    }
}

/// A decoded message and the connection it came in on
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: String,
    pub message: PeerMessage,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
}

struct Shared {
    peers: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    inbound: mpsc::Sender<Inbound>,
    stats: RwLock<NetworkStats>,
}

#[derive(Clone)]
pub struct PeerNetwork {
    shared: Arc<Shared>,
}

impl PeerNetwork {
    /// Create the network and the receiver for everything peers send
    pub fn new() -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound, rx) = mpsc::channel(1000);
        let network = Self {
            shared: Arc::new(Shared {
                peers: RwLock::new(HashMap::new()),
                inbound,
                stats: RwLock::new(NetworkStats::default()),
            }),
        };
        (network, rx)
    }

    /// Start accepting peer connections. Returns the bound address.
    pub async fn start(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Peer network listening on {}", local);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => {
                                    tracing::info!("Peer connected from {}", peer_addr);
                                    attach(shared, ws, peer_addr.to_string());
                                }
                                Err(e) => tracing::warn!("Handshake with {} failed: {}", peer_addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(local)
    }

    /// Dial a peer. The connection is registered under `peer_addr`.
    pub async fn connect(&self, peer_addr: &str) -> anyhow::Result<()> {
        if self.shared.peers.read().contains_key(peer_addr) {
            return Ok(());
        }
        let url = format!("ws://{}", peer_addr);
        let (ws, _) = connect_async(&url).await?;
        tracing::info!("Connected to peer {}", peer_addr);
        attach(self.shared.clone(), ws, peer_addr.to_string());
        Ok(())
    }

    /// Queue `message` for `targets`. Targets that are not connected are
    /// skipped; if none of them is, the message goes to every peer.
    pub fn send_to(&self, targets: &[String], message: &PeerMessage) -> usize {
        let data = match message.to_bytes() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("Failed to encode peer message: {}", e);
                return 0;
            }
        };

        let peers = self.shared.peers.read();
        let mut chosen: Vec<&mpsc::Sender<Vec<u8>>> = targets.iter().filter_map(|t| peers.get(t)).collect();
        if chosen.is_empty() {
            if !targets.is_empty() {
                tracing::debug!("None of {} targets connected, sending to all peers", targets.len());
            }
            chosen = peers.values().collect();
        }

        let mut queued = 0;
        for sender in chosen {
            match sender.try_send(data.clone()) {
                Ok(()) => queued += 1,
                Err(e) => tracing::warn!("Peer send queue rejected message: {}", e),
            }
        }
        self.shared.stats.write().messages_sent += queued as u64;
        queued
    }

    pub fn connected_peers(&self) -> usize {
        self.shared.peers.read().len()
    }

    pub fn stats(&self) -> NetworkStats {
        self.shared.stats.read().clone()
    }
}

#[async_trait]
impl PeerBroadcaster for PeerNetwork {
    async fn send(&self, message: PeerMessage, targets: &[String]) -> usize {
        self.send_to(targets, &message)
    }

    fn peers(&self) -> Vec<String> {
        self.shared.peers.read().keys().cloned().collect()
    }
}

/// Register a connection and spawn its reader and writer
fn attach<S>(shared: Arc<Shared>, ws: WebSocketStream<S>, peer: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(1000);
    shared.peers.write().insert(peer.clone(), out_tx);

    let send_task = tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            let data = match msg {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!("WebSocket error from {}: {}", peer, e);
                    break;
                }
                _ => continue,
            };
            match PeerMessage::from_bytes(&data) {
                Ok(message) => {
                    shared.stats.write().messages_received += 1;
                    let inbound = Inbound {
                        from: peer.clone(),
                        message,
                    };
                    if shared.inbound.send(inbound).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    shared.stats.write().decode_failures += 1;
                    tracing::warn!("Undecodable message from {}: {}", peer, e);
                }
            }
        }

        send_task.abort();
        shared.peers.write().remove(&peer);
        tracing::info!("Peer {} disconnected", peer);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::Receiver<Inbound>) -> Inbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for peer message")
            .expect("inbound channel closed")
    }

    #[tokio::test]
    async fn test_request_and_reply_over_loopback() {
        let (server, mut server_rx) = PeerNetwork::new();
        let addr = server.start("127.0.0.1:0").await.unwrap();

        let (client, mut client_rx) = PeerNetwork::new();
        client.connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.peers(), vec![addr.to_string()]);

        let sent = client.send_to(&[addr.to_string()], &PeerMessage::SyncRequest { from_index: 4 });
        assert_eq!(sent, 1);

        let request = next(&mut server_rx).await;
        assert_eq!(request.message, PeerMessage::SyncRequest { from_index: 4 });

        let reply = PeerMessage::SyncResponse { blocks: vec![] };
        assert_eq!(server.send_to(&[request.from.clone()], &reply), 1);

        let response = next(&mut client_rx).await;
        assert_eq!(response.from, addr.to_string());
        assert_eq!(response.message, reply);
        assert_eq!(server.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_unknown_targets_fall_back_to_all_peers() {
        let (server, mut server_rx) = PeerNetwork::new();
        let addr = server.start("127.0.0.1:0").await.unwrap();
        let (client, _client_rx) = PeerNetwork::new();
        client.connect(&addr.to_string()).await.unwrap();

        let queued = client
            .send(PeerMessage::SyncRequest { from_index: 1 }, &["10.9.9.9:1".to_string()])
            .await;
        assert_eq!(queued, 1);
        assert_eq!(next(&mut server_rx).await.message, PeerMessage::SyncRequest { from_index: 1 });
    }

    #[test]
    fn test_send_without_peers_queues_nothing() {
        let (network, _rx) = PeerNetwork::new();
        assert_eq!(network.send_to(&[], &PeerMessage::SyncRequest { from_index: 1 }), 0);
        assert_eq!(network.connected_peers(), 0);
    }
}
