//! Outbound RPC client.
//!
//! Every call opens a fresh WebSocket connection, sends one request frame,
//! waits for one reply frame and closes. The whole exchange is bounded by
//! the configured timeout.

use futures::{SinkExt, StreamExt};
use ring_core::{ElectionMessage, MAX_MESSAGE_SIZE, Operation, RejectReason, RpcReply, RpcRequest};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::debug;

/// Errors from an outbound call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{address} is unreachable: {source}")]
    Unreachable { address: String, source: WsError },

    #[error("call to {address} timed out after {after:?}")]
    Timeout { address: String, after: Duration },

    #[error("transport error talking to {address}: {source}")]
    Transport { address: String, source: WsError },

    #[error("request rejected: {0}")]
    Rejected(RejectReason),

    #[error("malformed reply from {address}")]
    MalformedReply { address: String },
}

impl RpcError {
    /// Whether the peer should be treated as failed and pruned.
    ///
    /// A rejection or an undecodable reply means the peer is alive.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            RpcError::Unreachable { .. } | RpcError::Timeout { .. } | RpcError::Transport { .. }
        )
    }
}

/// Makes one-shot RPC calls to other nodes.
#[derive(Debug, Clone)]
pub struct RpcClient {
    timeout: Duration,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Invoke `op` on the node at `address` (`host:port`).
    ///
    /// Returns the acknowledgement envelope.
    pub async fn call(
        &self,
        address: &str,
        op: Operation,
        message: ElectionMessage,
    ) -> Result<ElectionMessage, RpcError> {
        let request = RpcRequest::new(op, message);
        match tokio::time::timeout(self.timeout, Self::exchange(address, &request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                address: address.to_string(),
                after: self.timeout,
            }),
        }
    }

    async fn exchange(address: &str, request: &RpcRequest) -> Result<ElectionMessage, RpcError> {
        let url = format!("ws://{}", address);
        let (mut ws, _) = connect_async(&url)
            .await
            .map_err(|source| RpcError::Unreachable {
                address: address.to_string(),
                source,
            })?;

        debug!("Calling {} on {}", request.op, address);
        ws.send(Message::Binary(request.to_json()))
            .await
            .map_err(|source| RpcError::Transport {
                address: address.to_string(),
                source,
            })?;

        let data = Self::read_reply(address, &mut ws).await?;
        let _ = ws.close(None).await;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(RpcError::MalformedReply {
                address: address.to_string(),
            });
        }
        match RpcReply::from_json(&data) {
            Some(RpcReply::Ack { message }) => Ok(message),
            Some(RpcReply::Rejected { reason }) => Err(RpcError::Rejected(reason)),
            None => Err(RpcError::MalformedReply {
                address: address.to_string(),
            }),
        }
    }

    async fn read_reply(
        address: &str,
        ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<Vec<u8>, RpcError> {
        let transport = |source| RpcError::Transport {
            address: address.to_string(),
            source,
        };
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(transport(WsError::ConnectionClosed));
                }
                Some(Err(e)) => return Err(transport(e)),
            }
        }
    }
}
