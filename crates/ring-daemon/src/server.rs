//! WebSocket listener for inbound RPCs.
//!
//! Each accepted connection gets its own task. A connection carries exactly
//! one request frame and one reply frame.

use crate::node::Node;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use ring_core::{MAX_MESSAGE_SIZE, RpcReply, RpcRequest};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

/// Accept loop serving one node.
pub struct RpcServer {
    node: Node,
}

impl RpcServer {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("RPC server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept connections until the node shuts down.
    ///
    /// Dropping the listener on exit makes this node unreachable to its peers.
    pub async fn run(self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let node = self.node.clone();
                            tokio::spawn(async move {
                                serve_connection(node, stream, addr).await;
                            });
                        }
                        Err(e) => {
                            error!(node = %self.node.id(), "Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.node.stopped() => {
                    debug!(node = %self.node.id(), "RPC server stopping");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(node: Node, stream: TcpStream, addr: SocketAddr) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Connection from {} closed before handshake: {}", addr, e);
            return;
        }
    };

    let Some(data) = read_request(&mut ws, addr).await else {
        return;
    };

    let reply = if data.len() > MAX_MESSAGE_SIZE {
        warn!(
            "Request from {} exceeds max size ({} > {}), rejecting",
            addr,
            data.len(),
            MAX_MESSAGE_SIZE
        );
        RpcReply::malformed("request exceeds maximum frame size")
    } else {
        match RpcRequest::from_json(&data) {
            Some(request) => node.dispatch(request).await,
            None => {
                warn!("Undecodable request from {}", addr);
                RpcReply::malformed("undecodable request")
            }
        }
    };

    if let Err(e) = ws.send(Message::Binary(reply.to_json())).await {
        debug!("Failed to send reply to {}: {}", addr, e);
    }
    let _ = ws.close(None).await;
}

async fn read_request(ws: &mut WebSocketStream<TcpStream>, addr: SocketAddr) -> Option<Vec<u8>> {
    loop {
        match ws.next().await {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => return Some(data),
                Message::Text(text) => return Some(text.into_bytes()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => {
                    debug!("Received close frame from {}", addr);
                    return None;
                }
            },
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", addr);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", addr, e);
                    }
                }
                return None;
            }
            None => {
                debug!("Connection {} stream ended", addr);
                return None;
            }
        }
    }
}
