//! Packet endpoints, RPC pairing and incoming-packet routing.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{Result, ServerError};
use crate::manager::proto::{Packet, PacketEnvelope, PacketKind};

/// One direction-pair transport endpoint. FIFO per direction.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn send(&self, envelope: PacketEnvelope) -> Result<()>;
    /// Next incoming envelope; `None` when the peer is gone.
    async fn recv(&self) -> Option<PacketEnvelope>;
}

/// In-process endpoint built from a pair of FIFO queues.
pub struct InMemoryEndpoint {
    incoming: Mutex<mpsc::UnboundedReceiver<PacketEnvelope>>,
    outgoing: mpsc::UnboundedSender<PacketEnvelope>,
}

impl InMemoryEndpoint {
    /// Create both sides of a connection.
    pub fn pair() -> (Arc<InMemoryEndpoint>, Arc<InMemoryEndpoint>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Arc::new(InMemoryEndpoint {
                incoming: Mutex::new(a_rx),
                outgoing: b_tx,
            }),
            Arc::new(InMemoryEndpoint {
                incoming: Mutex::new(b_rx),
                outgoing: a_tx,
            }),
        )
    }
}

#[async_trait]
impl Endpoint for InMemoryEndpoint {
    async fn send(&self, envelope: PacketEnvelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .map_err(|_| ServerError::Http("endpoint peer closed".into()))
    }

    async fn recv(&self) -> Option<PacketEnvelope> {
        self.incoming.lock().await.recv().await
    }
}

/// Pairs replies to requests over an endpoint.
pub struct RpcHelper {
    endpoint: Arc<dyn Endpoint>,
    name: String,
    msg_id: AtomicU64,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<PacketEnvelope>>>,
}

impl RpcHelper {
    pub fn new(endpoint: Arc<dyn Endpoint>, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            name: name.into(),
            msg_id: AtomicU64::new(0),
            pending: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn next_msg_id(&self) -> u64 {
        self.msg_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send a request and wait for the paired reply.
    pub async fn call(&self, payload: Packet, timeout: Duration) -> Result<Option<Packet>> {
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id, tx);

        let envelope = PacketEnvelope {
            msg_id,
            source_msg_id: None,
            payload,
        };
        self.endpoint.send(envelope).await?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().remove(&msg_id);
        match result {
            Ok(Ok(envelope)) => match envelope.payload {
                Packet::Ack => Ok(None),
                payload => Ok(Some(payload)),
            },
            Ok(Err(_)) => Err(ServerError::Http(format!(
                "{}: request {msg_id} canceled",
                self.name
            ))),
            Err(_) => Err(ServerError::Http(format!(
                "{}: request {msg_id} timed out",
                self.name
            ))),
        }
    }

    /// Send a reply to a received request.
    pub async fn reply(&self, payload: Packet, source_msg_id: u64) -> Result<()> {
        let envelope = PacketEnvelope {
            msg_id: self.next_msg_id(),
            source_msg_id: Some(source_msg_id),
            payload,
        };
        self.endpoint.send(envelope).await
    }

    /// Resolve a pending request from an incoming reply envelope.
    pub fn handle_response(&self, envelope: PacketEnvelope) -> bool {
        let Some(source) = envelope.source_msg_id else {
            return false;
        };
        match self.pending.lock().remove(&source) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}

pub type PacketHandler =
    Arc<dyn Fn(PacketEnvelope) -> BoxFuture<'static, Option<Packet>> + Send + Sync>;

/// Dispatches incoming envelopes: replies resolve pending RPCs, requests
/// go to the handler registered for their kind, and a handler's return
/// value is sent back as the reply.
pub struct IncomingPacketRouter {
    rpc: Arc<RpcHelper>,
    name: String,
    handlers: parking_lot::Mutex<HashMap<PacketKind, PacketHandler>>,
}

impl IncomingPacketRouter {
    pub fn new(rpc: Arc<RpcHelper>, name: impl Into<String>) -> Self {
        Self {
            rpc,
            name: name.into(),
            handlers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: PacketKind, handler: PacketHandler) {
        self.handlers.lock().insert(kind, handler);
    }

    pub async fn handle(&self, envelope: PacketEnvelope) -> Result<bool> {
        if envelope.source_msg_id.is_some() {
            let matched = self.rpc.handle_response(envelope);
            if !matched {
                tracing::debug!(name = %self.name, "unmatched response envelope");
            }
            return Ok(true);
        }

        let kind = envelope.payload.kind();
        let handler = self.handlers.lock().get(&kind).cloned();
        let Some(handler) = handler else {
            tracing::error!(name = %self.name, ?kind, "no handler for request kind");
            return Ok(false);
        };
        let msg_id = envelope.msg_id;
        if let Some(reply) = handler(envelope).await {
            self.rpc.reply(reply, msg_id).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_pair_delivers_fifo() {
        let (a, b) = InMemoryEndpoint::pair();
        for i in 0..3u64 {
            a.send(PacketEnvelope {
                msg_id: i,
                source_msg_id: None,
                payload: Packet::Ack,
            })
            .await
            .unwrap();
        }
        for i in 0..3u64 {
            let envelope = b.recv().await.unwrap();
            assert_eq!(envelope.msg_id, i);
        }
    }

    #[tokio::test]
    async fn rpc_pairs_reply_to_request() {
        let (server, client) = InMemoryEndpoint::pair();
        let rpc = RpcHelper::new(server.clone(), "test-rpc");

        let call = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                rpc.call(
                    Packet::TextMessage {
                        text: "ping".into(),
                        format: Default::default(),
                    },
                    Duration::from_secs(1),
                )
                .await
            })
        };

        let request = client.recv().await.unwrap();
        client
            .send(PacketEnvelope {
                msg_id: 99,
                source_msg_id: Some(request.msg_id),
                payload: Packet::TextMessage {
                    text: "pong".into(),
                    format: Default::default(),
                },
            })
            .await
            .unwrap();

        // The server side routes incoming envelopes through the RPC.
        let reply = server.recv().await.unwrap();
        assert!(rpc.handle_response(reply));

        let result = call.await.unwrap().unwrap();
        match result {
            Some(Packet::TextMessage { text, .. }) => assert_eq!(text, "pong"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_replies_resolve_to_none() {
        let (server, client) = InMemoryEndpoint::pair();
        let rpc = RpcHelper::new(server.clone(), "test-rpc");

        let call = {
            let rpc = rpc.clone();
            tokio::spawn(async move { rpc.call(Packet::StopReq, Duration::from_secs(1)).await })
        };
        let request = client.recv().await.unwrap();
        client
            .send(PacketEnvelope {
                msg_id: 1,
                source_msg_id: Some(request.msg_id),
                payload: Packet::Ack,
            })
            .await
            .unwrap();
        let reply = server.recv().await.unwrap();
        rpc.handle_response(reply);
        assert!(call.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn router_dispatches_by_kind_and_replies() {
        let (server, client) = InMemoryEndpoint::pair();
        let rpc = RpcHelper::new(server.clone(), "router");
        let router = IncomingPacketRouter::new(rpc, "router");

        router.register(
            PacketKind::LogReq,
            Arc::new(|_envelope| {
                Box::pin(async move {
                    Some(Packet::LogResp {
                        offset: 0,
                        total: 0,
                        entries: vec![],
                    })
                })
            }),
        );

        client
            .send(PacketEnvelope {
                msg_id: 5,
                source_msg_id: None,
                payload: Packet::LogReq {
                    offset: 0,
                    limit: None,
                },
            })
            .await
            .unwrap();
        let incoming = server.recv().await.unwrap();
        assert!(router.handle(incoming).await.unwrap());

        let reply = client.recv().await.unwrap();
        assert_eq!(reply.source_msg_id, Some(5));
        assert!(matches!(reply.payload, Packet::LogResp { .. }));

        // Unknown kinds are reported unhandled.
        client
            .send(PacketEnvelope {
                msg_id: 6,
                source_msg_id: None,
                payload: Packet::StopReq,
            })
            .await
            .unwrap();
        let incoming = server.recv().await.unwrap();
        assert!(!router.handle(incoming).await.unwrap());
    }
}
