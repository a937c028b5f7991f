//! A running ring node.
//!
//! `Node` owns the single lock around [`NodeState`], the RPC listener task,
//! and whichever periodic loop the current role needs. Handlers run under the
//! lock and never make outbound calls while holding it: propagation is
//! spawned onto its own task after the handler has acknowledged.

use crate::config::NodeConfig;
use crate::events::{EVENT_CHANNEL_CAPACITY, NodeEvent};
use crate::rpc::{RpcClient, RpcError};
use crate::server::RpcServer;
use crate::{coordinator, follower};
use ring_core::{
    Completion, ElectionMessage, Hop, MembershipDirectory, MessageKind, NodeId, NodeIdentity,
    NodeState, Operation, RejectReason, Role, RpcReply, RpcRequest,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tracing::{debug, error, info, warn};

/// How a node enters the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bootstrap {
    /// First node: coordinator of a ring of one
    Coordinator,
    /// Join the ring described by `directory`, led by `coordinator`
    Join {
        directory: MembershipDirectory,
        coordinator: NodeId,
    },
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

struct Shared {
    identity: NodeIdentity,
    config: NodeConfig,
    state: Mutex<NodeState>,
    client: RpcClient,
    events: broadcast::Sender<NodeEvent>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Start serving on `listener` as `identity`.
    ///
    /// A coordinator starts its Synchronize loop. A joining follower
    /// registers with the coordinator and starts its election watchdog.
    pub fn start(
        identity: NodeIdentity,
        listener: TcpListener,
        bootstrap: Bootstrap,
        config: NodeConfig,
    ) -> Node {
        let now = Instant::now();
        let state = match bootstrap {
            Bootstrap::Coordinator => {
                NodeState::coordinator(identity.clone(), &config.watchdog, now)
            }
            Bootstrap::Join {
                directory,
                coordinator,
            } => NodeState::follower(
                identity.clone(),
                directory,
                coordinator,
                &config.watchdog,
                now,
            ),
        };
        let role = state.role();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let node = Node {
            shared: Arc::new(Shared {
                client: RpcClient::new(config.rpc_timeout),
                identity,
                config,
                state: Mutex::new(state),
                events,
                shutdown,
            }),
        };

        tokio::spawn(RpcServer::new(node.clone()).run(listener));
        match role {
            Role::Coordinator => {
                info!(node = %node.id(), "Started as coordinator at {}", node.identity().address);
                tokio::spawn(coordinator::run_sync_loop(node.clone()));
            }
            Role::Follower => {
                info!(node = %node.id(), "Started as follower at {}", node.identity().address);
                tokio::spawn(follower::join(node.clone()));
            }
        }
        node
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.shared.identity
    }

    pub fn id(&self) -> NodeId {
        self.shared.identity.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Subscribe to this node's events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> NodeState {
        self.shared.state.lock().await.clone()
    }

    /// Stop accepting connections and end the periodic loops.
    pub fn shutdown(&self) {
        info!(node = %self.id(), "Shutting down node");
        self.shared.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Resolves once [`Node::shutdown`] has been called.
    pub async fn stopped(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub(crate) fn client(&self) -> &RpcClient {
        &self.shared.client
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.shared.state.lock().await
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    pub(crate) fn emit_ring(&self, state: &NodeState) {
        self.emit(NodeEvent::RingAdopted {
            ring: state.ring().clone(),
            coordinator: state.coordinator_id(),
        });
    }

    /// Route an inbound request to the active role's handler set.
    ///
    /// The role is read under the same lock the handler runs under, so a
    /// promotion swaps handler sets atomically.
    pub(crate) async fn dispatch(&self, request: RpcRequest) -> RpcReply {
        let RpcRequest { op, message } = request;
        let mut state = self.lock().await;
        let role = state.role();
        if !op.served_by(role) {
            debug!(node = %self.id(), "Rejecting {} while {}", op, role);
            return RpcReply::wrong_role(role, op);
        }

        let result = match role {
            Role::Follower => follower::handle(self, &mut state, op, message),
            Role::Coordinator => coordinator::handle(self, &mut state, op, message),
        };
        match result {
            Ok(ack) => RpcReply::ack(ack),
            Err(e) => {
                error!(node = %self.id(), "Protocol violation in {}: {}", op, e);
                RpcReply::malformed(e.to_string())
            }
        }
    }

    /// Swap to the coordinator role and start the Synchronize loop.
    ///
    /// Idempotent. The watchdog notices the new role on its next tick and
    /// exits.
    pub(crate) fn promote(&self, state: &mut NodeState) {
        if state.promote() {
            info!(node = %self.id(), "Promoted to coordinator, ring {}", state.ring());
            self.emit(NodeEvent::Promoted);
            tokio::spawn(coordinator::run_sync_loop(self.clone()));
        }
    }

    /// Run a Discovery or Announce pass from this node on its own task.
    pub(crate) fn spawn_pass(&self, msg: ElectionMessage, hop: Hop) {
        let node = self.clone();
        tokio::spawn(async move {
            node.run_pass(msg, hop).await;
        });
    }

    /// Drive a pass until it leaves this node for good.
    ///
    /// A pass that ends here may start another one (the Announce after an
    /// election or membership pass, or a fresh election when the winner is
    /// gone), which is driven by the same loop.
    async fn run_pass(&self, msg: ElectionMessage, hop: Hop) {
        let mut next = Some((msg, hop));
        while let Some((msg, hop)) = next.take() {
            next = match self.forward(msg, hop).await {
                Some(done) => self.complete(done).await,
                None => None,
            };
        }
    }

    /// Hand `msg` to the next reachable successor.
    ///
    /// Unreachable successors are pruned locally and from the message, and
    /// the next one is tried. Returns the message if the pass ends here.
    async fn forward(&self, mut msg: ElectionMessage, mut hop: Hop) -> Option<ElectionMessage> {
        let op = match msg.kind {
            MessageKind::Announce => Operation::UpdateRing,
            _ => Operation::DiscoverRing,
        };
        let max_attempts = self.lock().await.ring().len().max(1);
        let mut attempts = 0;

        loop {
            if self.is_stopped() {
                return None;
            }
            let peer = match hop {
                Hop::Complete => return Some(msg),
                Hop::Forward(peer) => peer,
            };
            attempts += 1;

            match self.client().call(&peer.address, op, msg.clone()).await {
                Ok(_) => {
                    debug!(node = %self.id(), "{:?} forwarded to {}", msg.kind, peer);
                    return None;
                }
                Err(RpcError::Rejected(reason)) => {
                    info!(node = %self.id(), "{} stopped the {:?} pass: {}", peer, msg.kind, reason);
                    return None;
                }
                Err(e) if e.is_peer_failure() => {
                    warn!(node = %self.id(), "Successor {} failed, removing it: {}", peer, e);
                    let mut state = self.lock().await;
                    hop = state.route_around(&mut msg, peer.id);
                    drop(state);
                    self.emit(NodeEvent::PeerPruned { peer: peer.id });

                    if attempts >= max_attempts {
                        warn!(node = %self.id(), "Giving up after {} unreachable successors", attempts);
                        return None;
                    }
                }
                Err(e) => {
                    warn!(node = %self.id(), "{:?} to {} failed: {}", msg.kind, peer, e);
                    return None;
                }
            }
        }
    }

    /// Act on a pass that ended at this node.
    async fn complete(&self, msg: ElectionMessage) -> Option<(ElectionMessage, Hop)> {
        let mut state = self.lock().await;
        match state.complete_pass(&msg, Instant::now()) {
            Completion::PromoteSelf(announce) => {
                info!(node = %self.id(), "Won election with ring {}", state.ring());
                self.promote(&mut state);
                self.emit_ring(&state);
                let hop = state.next_hop(&announce);
                Some((announce, hop))
            }
            Completion::Announce(announce) => {
                info!(node = %self.id(), "Announcing ring {}", state.ring());
                self.emit_ring(&state);
                let hop = state.next_hop(&announce);
                Some((announce, hop))
            }
            Completion::HandOff { winner, announce } => {
                drop(state);
                self.hand_off(winner, announce).await
            }
            Completion::ReturnToCoordinator {
                coordinator,
                message,
            } => {
                drop(state);
                self.return_to_coordinator(coordinator, message).await;
                None
            }
            Completion::Finished => {
                debug!(node = %self.id(), "Announce pass finished");
                None
            }
            Completion::Abandoned => {
                warn!(node = %self.id(), "{:?} pass ended without a reachable target", msg.kind);
                None
            }
        }
    }

    /// Deliver the election result to the winner and promote it.
    ///
    /// If the winner is gone, prune it and start over.
    async fn hand_off(
        &self,
        winner: NodeIdentity,
        announce: ElectionMessage,
    ) -> Option<(ElectionMessage, Hop)> {
        info!(node = %self.id(), "Election won by {}, handing over the ring", winner);
        let client = self.client();
        let result = match client
            .call(&winner.address, Operation::UpdateRing, announce.clone())
            .await
        {
            Ok(_) | Err(RpcError::Rejected(RejectReason::WrongRole { .. })) => client
                .call(&winner.address, Operation::BecomeCoordinator, announce)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(node = %self.id(), "Node {} is now coordinator", winner.id);
                None
            }
            Err(e) if e.is_peer_failure() => {
                warn!(node = %self.id(), "Elected node {} unreachable ({}), re-electing", winner, e);
                let mut state = self.lock().await;
                state.prune(winner.id);
                self.emit(NodeEvent::PeerPruned { peer: winner.id });
                let msg = state.start_election(Instant::now());
                self.emit(NodeEvent::ElectionStarted);
                let hop = state.next_hop(&msg);
                Some((msg, hop))
            }
            Err(e) => {
                warn!(node = %self.id(), "Could not promote {}: {}", winner, e);
                None
            }
        }
    }

    /// Give a finished membership snapshot back to the coordinator.
    ///
    /// An unreachable coordinator is pruned; the watchdog will elect a new one.
    async fn return_to_coordinator(&self, coordinator: NodeIdentity, message: ElectionMessage) {
        match self
            .client()
            .call(&coordinator.address, Operation::InitiateRingUpdate, message)
            .await
        {
            Ok(_) => {
                debug!(node = %self.id(), "Membership snapshot returned to {}", coordinator);
            }
            Err(e) if e.is_peer_failure() => {
                warn!(node = %self.id(), "Coordinator {} unreachable: {}", coordinator, e);
                self.lock().await.prune(coordinator.id);
                self.emit(NodeEvent::PeerPruned {
                    peer: coordinator.id,
                });
            }
            Err(e) => {
                warn!(node = %self.id(), "Coordinator {} refused the ring update: {}", coordinator, e);
            }
        }
    }
}
