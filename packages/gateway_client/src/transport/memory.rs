//! In-process transport: the engine on one side, a scripted gateway on the
//! other. Each `connect` call yields a fresh [`GatewaySide`] on the accept
//! queue, so tests can observe reconnect attempts as new accepts.

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Connection, Connector, TransportEvent};
use crate::error::GatewayError;
use crate::protocol::Frame;

const CHANNEL_DEPTH: usize = 64;

/// The gateway end of one in-memory connection.
pub struct GatewaySide {
    from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<TransportEvent>,
}

impl GatewaySide {
    /// Next raw frame from the client, or `None` once the client hung up.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next parsed frame from the client.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Push a frame to the client.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        let text = serde_json::to_string(frame)?;
        self.send_raw(text).await
    }

    /// Push raw text to the client (for malformed-frame tests).
    pub async fn send_raw(&self, text: String) -> Result<(), GatewayError> {
        self.to_client
            .send(TransportEvent::Frame(text))
            .await
            .map_err(|_| GatewayError::ConnectionLost)
    }

    /// Close the connection from the gateway side.
    pub async fn close(self, reason: Option<String>) {
        let _ = self.to_client.send(TransportEvent::Closed { reason }).await;
    }
}

/// Connector whose dials land on an in-process accept queue.
pub struct MemoryConnector {
    accept_tx: mpsc::Sender<GatewaySide>,
}

impl MemoryConnector {
    /// Returns the connector plus the accept queue of gateway-side handles.
    pub fn new() -> (Self, mpsc::Receiver<GatewaySide>) {
        let (accept_tx, accept_rx) = mpsc::channel(16);
        (Self { accept_tx }, accept_rx)
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Connection, GatewayError>> {
        Box::pin(async move {
            let (outbound_tx, outbound_rx) = mpsc::channel::<String>(CHANNEL_DEPTH);
            let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);

            let side = GatewaySide {
                from_client: outbound_rx,
                to_client: inbound_tx,
            };
            self.accept_tx
                .send(side)
                .await
                .map_err(|_| GatewayError::Transport("no acceptor".to_string()))?;

            Ok(Connection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
