//! In-process transport over a tokio channel.
//!
//! [`ChannelTransport::pair`] returns the client half and a [`ChannelPeer`]
//! that plays the server. Useful for embedding a server in the same process
//! and for exercising the client without a network.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, trace};

use super::{Transport, TransportKind, TransportState, until_cancelled};
use crate::error::McpError;
use crate::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Default capacity of the message channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// A message delivered to the [`ChannelPeer`].
#[derive(Debug)]
pub enum ChannelMessage {
    /// A request and the slot its response goes into.
    Request(JsonRpcRequest, oneshot::Sender<JsonRpcResponse>),
    /// A notification; nothing is sent back.
    Notification(JsonRpcNotification),
}

/// Client half of an in-process channel.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ChannelMessage>,
    state: TransportState,
}

/// Server half of an in-process channel.
#[derive(Debug)]
pub struct ChannelPeer {
    rx: mpsc::Receiver<ChannelMessage>,
}

impl ChannelTransport {
    /// Creates a connected transport and peer.
    #[must_use]
    pub fn pair() -> (Self, ChannelPeer) {
        Self::pair_with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a connected transport and peer with the given channel capacity.
    #[must_use]
    pub fn pair_with_capacity(capacity: usize) -> (Self, ChannelPeer) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                state: TransportState::default(),
            },
            ChannelPeer { rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    async fn start(&self) -> Result<(), McpError> {
        if self.tx.is_closed() {
            return Err(McpError::closed());
        }
        self.state.mark_started()
    }

    fn is_started(&self) -> bool {
        self.state.is_started()
    }

    #[instrument(name = "paymcp.channel.request", skip_all, fields(method = %request.method))]
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        self.state.ensure_started()?;
        let token = self.state.token();
        let (reply_tx, reply_rx) = oneshot::channel();
        until_cancelled(&token, async {
            self.tx
                .send(ChannelMessage::Request(request, reply_tx))
                .await
                .map_err(|_| McpError::closed())?;
            reply_rx.await.map_err(|_| McpError::closed())
        })
        .await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.state.ensure_started()?;
        self.tx
            .send(ChannelMessage::Notification(notification))
            .await
            .map_err(|_| McpError::closed())
    }

    async fn close(&self) -> Result<(), McpError> {
        self.state.cancel();
        Ok(())
    }

    fn reset(&self) {
        self.state.reset();
    }
}

impl ChannelPeer {
    /// Receives the next message, or `None` once every transport handle is dropped.
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    /// Answers requests with `handler` until the transport is dropped.
    ///
    /// Notifications are consumed and ignored.
    pub async fn serve<F, Fut>(mut self, handler: F)
    where
        F: Fn(String, Option<Value>) -> Fut,
        Fut: Future<Output = Result<Value, JsonRpcError>>,
    {
        while let Some(message) = self.next().await {
            match message {
                ChannelMessage::Request(request, reply) => {
                    let response = match handler(request.method, request.params).await {
                        Ok(result) => JsonRpcResponse::success(request.id, result),
                        Err(error) => JsonRpcResponse::failure(request.id, error),
                    };
                    let _ = reply.send(response);
                }
                ChannelMessage::Notification(notification) => {
                    trace!(method = %notification.method, "channel notification");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_round_trip_through_peer() {
        let (transport, peer) = ChannelTransport::pair();
        tokio::spawn(peer.serve(|method, _params| async move {
            if method == "ping" {
                Ok(json!({}))
            } else {
                Err(JsonRpcError {
                    code: -32601,
                    message: format!("unknown method {method}"),
                    data: None,
                })
            }
        }));

        transport.start().await.unwrap();
        let ok = transport.request(JsonRpcRequest::new(1, "ping", None)).await.unwrap();
        assert_eq!(ok.result, Some(json!({})));
        let missing = transport.request(JsonRpcRequest::new(2, "nope", None)).await.unwrap();
        assert_eq!(missing.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_requests() {
        let (transport, peer) = ChannelTransport::pair();
        transport.start().await.unwrap();
        drop(peer);
        let err = transport
            .request(JsonRpcRequest::new(1, "ping", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_requires_start_and_restarts_after_reset() {
        let (transport, mut peer) = ChannelTransport::pair();
        let err = transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotStarted);

        transport.start().await.unwrap();
        transport.close().await.unwrap();
        transport.reset();
        transport.start().await.unwrap();
        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();
        assert!(matches!(peer.next().await, Some(ChannelMessage::Notification(_))));
    }
}
