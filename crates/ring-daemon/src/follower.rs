//! Follower role: handlers, registration and the election watchdog.

use crate::events::NodeEvent;
use crate::node::Node;
use crate::rpc::RpcError;
use ring_core::{
    ElectionMessage, Hop, NodeIdentity, NodeState, Operation, ProtocolError, WatchdogAction,
};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle one follower operation under the node lock.
///
/// Forwarding happens on a spawned task after this returns, so the caller
/// gets its acknowledgement before the next hop is attempted.
pub(crate) fn handle(
    node: &Node,
    state: &mut NodeState,
    op: Operation,
    mut msg: ElectionMessage,
) -> Result<ElectionMessage, ProtocolError> {
    let now = Instant::now();
    match op {
        Operation::DiscoverRing => {
            let hop = state.accept_discover(&mut msg, now)?;
            debug!(
                node = %state.id(),
                "{:?} hop, candidate {}, snapshot {:?}",
                msg.kind,
                msg.coordinator_id,
                msg.ring.as_ref().map(|ring| ring.members().to_vec())
            );
            node.spawn_pass(msg, hop);
        }
        Operation::UpdateRing => {
            let adoption = state.adopt_announce(&msg, now)?;
            info!(
                node = %state.id(),
                "Adopted ring {} with coordinator {}",
                state.ring(),
                state.coordinator_id()
            );
            node.emit_ring(state);
            if adoption.promote {
                node.promote(state);
            }
            if let Hop::Forward(_) = adoption.hop {
                node.spawn_pass(msg, adoption.hop);
            }
        }
        Operation::Synchronize => {
            state.apply_sync(&msg, now)?;
            debug!(node = %state.id(), "Replica synchronized: {:?}", state.replica().values());
            node.emit(NodeEvent::ReplicaSynced {
                replica: state.replica().clone(),
            });
            if let Some(delay) = node.config().drift_after {
                spawn_drift(node.clone(), delay);
            }
        }
        Operation::BecomeCoordinator => node.promote(state),
        other => return Err(ProtocolError::Unhandled(other)),
    }
    Ok(ElectionMessage::ack(state.id(), state.coordinator_id()))
}

/// Scramble one replica slot after `delay`, to show the next Sync repairing it.
fn spawn_drift(node: Node, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = node.lock().await;
        if let Some((index, value)) = state.drift_replica() {
            info!(
                node = %state.id(),
                "Replica modified: slot {} = {}, now {:?}",
                index,
                value,
                state.replica().values()
            );
        }
    });
}

/// Register with the coordinator, then watch for its silence.
pub(crate) async fn join(node: Node) {
    let registration = node.lock().await.registration_request();
    if let Some((coordinator, request)) = registration {
        if let Err(e) = register(&node, coordinator, request).await {
            warn!(node = %node.id(), "Registration failed, watchdog will retry: {}", e);
        }
    }
    run_watchdog(node).await;
}

/// Send RegisterNode to `coordinator` and take the replica it returns.
pub(crate) async fn register(
    node: &Node,
    coordinator: NodeIdentity,
    request: ElectionMessage,
) -> Result<(), RpcError> {
    info!(node = %node.id(), "Registering with coordinator {}", coordinator);
    let reply = node
        .client()
        .call(&coordinator.address, Operation::RegisterNode, request)
        .await?;
    node.lock()
        .await
        .apply_registration_reply(&reply, Instant::now());
    info!(node = %node.id(), "Registered with coordinator {}", coordinator.id);
    node.emit(NodeEvent::Registered {
        coordinator: coordinator.id,
    });
    Ok(())
}

/// Check for coordinator silence until promoted or stopped.
pub(crate) async fn run_watchdog(node: Node) {
    let check_interval = node.config().watchdog.check_interval;
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = node.stopped() => break,
        }

        let action = node.lock().await.watchdog_tick(Instant::now());
        match action {
            WatchdogAction::Stop => {
                debug!(node = %node.id(), "Coordinator now, watchdog exiting");
                break;
            }
            WatchdogAction::Wait => {}
            WatchdogAction::RetryRegistration {
                coordinator,
                request,
            } => {
                let announced = node.lock().await.is_announced();
                if announced {
                    warn!(node = %node.id(), "Election stalled, registering with {} again", coordinator);
                } else {
                    warn!(node = %node.id(), "Not admitted yet, retrying registration");
                }
                match register(&node, coordinator, request).await {
                    Ok(()) => {}
                    Err(e) if e.is_peer_failure() => {
                        warn!(node = %node.id(), "Coordinator unreachable ({}), starting election", e);
                        let msg = node.lock().await.start_election(Instant::now());
                        start_election(&node, msg).await;
                    }
                    Err(e) => {
                        warn!(node = %node.id(), "Registration refused: {}", e);
                    }
                }
            }
            WatchdogAction::StartElection(msg) => {
                warn!(
                    node = %node.id(),
                    "No sync within {:?}, starting election",
                    node.config().watchdog.threshold(node.id())
                );
                start_election(&node, msg).await;
            }
        }
    }
}

async fn start_election(node: &Node, msg: ElectionMessage) {
    let hop = node.lock().await.next_hop(&msg);
    node.emit(NodeEvent::ElectionStarted);
    node.spawn_pass(msg, hop);
}
