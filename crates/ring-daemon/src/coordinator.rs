//! Coordinator role: admission handlers and the Synchronize loop.

use crate::events::NodeEvent;
use crate::node::Node;
use crate::rpc::RpcError;
use futures::future::join_all;
use ring_core::{ElectionMessage, NodeState, Operation, ProtocolError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle one coordinator operation under the node lock.
pub(crate) fn handle(
    node: &Node,
    state: &mut NodeState,
    op: Operation,
    msg: ElectionMessage,
) -> Result<ElectionMessage, ProtocolError> {
    match op {
        Operation::RegisterNode => {
            let joining = msg.require_joining()?.clone();
            info!(node = %state.id(), "Registering new node {}", joining);
            let reply = state.registration_reply();
            launch_membership_discovery(node, state, msg)?;
            Ok(reply)
        }
        Operation::InitiateRingDiscovery => {
            launch_membership_discovery(node, state, msg)?;
            Ok(ElectionMessage::ack(state.id(), state.id()))
        }
        Operation::InitiateRingUpdate => {
            let announce = state.adopt_final_ring(&msg)?;
            info!(node = %state.id(), "Membership pass returned, announcing ring {}", state.ring());
            node.emit_ring(state);
            let hop = state.next_hop(&announce);
            node.spawn_pass(announce, hop);
            Ok(ElectionMessage::ack(state.id(), state.id()))
        }
        Operation::BecomeCoordinator => {
            debug!(node = %state.id(), "Already coordinator");
            Ok(ElectionMessage::ack(state.id(), state.id()))
        }
        other => Err(ProtocolError::Unhandled(other)),
    }
}

/// Insert the newcomer locally and send a NewNodeDiscover pass around the ring.
fn launch_membership_discovery(
    node: &Node,
    state: &mut NodeState,
    msg: ElectionMessage,
) -> Result<(), ProtocolError> {
    let joining = msg.require_joining()?;
    let pass = state.begin_membership_discovery(joining);
    node.emit_ring(state);
    let hop = state.next_hop(&pass);
    node.spawn_pass(pass, hop);
    Ok(())
}

/// Push the replica to every member on a fixed interval until stopped.
pub(crate) async fn run_sync_loop(node: Node) {
    let mut interval = tokio::time::interval(node.config().sync_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = node.stopped() => {
                debug!(node = %node.id(), "Synchronize loop stopping");
                break;
            }
        }
        sync_round(&node).await;
    }
}

/// One Synchronize broadcast.
///
/// Calls run concurrently. A member that fails enough consecutive rounds is
/// pruned, and the shrunken ring is announced.
pub(crate) async fn sync_round(node: &Node) {
    let (targets, message) = {
        let state = node.lock().await;
        debug!(
            node = %node.id(),
            "Replica synchronization begun, replica {:?}, ring {}",
            state.replica().values(),
            state.ring()
        );
        (state.sync_targets(), state.sync_message())
    };
    if targets.is_empty() {
        return;
    }

    let client = node.client();
    let calls = targets.into_iter().map(|peer| {
        let message = message.clone();
        async move {
            let result = client
                .call(&peer.address, Operation::Synchronize, message)
                .await;
            (peer, result)
        }
    });
    let results = join_all(calls).await;

    let limit = node.config().prune_after_failures;
    let mut state = node.lock().await;
    let mut pruned = Vec::new();
    for (peer, result) in results {
        match result {
            Ok(_) => {
                debug!(node = %node.id(), "Replica synchronized with {}", peer);
                state.record_sync_success(peer.id);
            }
            Err(RpcError::Rejected(reason)) => {
                warn!(node = %node.id(), "{} refused sync: {}", peer, reason);
            }
            Err(e) => {
                warn!(
                    node = %node.id(),
                    "Sync with {} failed ({} in a row): {}",
                    peer,
                    state.sync_failures(peer.id) + 1,
                    e
                );
                if state.record_sync_failure(peer.id, limit) {
                    pruned.push(peer.id);
                }
            }
        }
    }
    if pruned.is_empty() {
        return;
    }

    for peer in pruned {
        info!(node = %node.id(), "Pruned unresponsive node {}", peer);
        node.emit(NodeEvent::PeerPruned { peer });
    }
    node.emit_ring(&state);
    let announce = state.announce_message();
    let hop = state.next_hop(&announce);
    drop(state);
    node.spawn_pass(announce, hop);
}
