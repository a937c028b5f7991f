//! Per-node protocol state machine.
//!
//! `NodeState` holds everything a node guards with its lock and implements
//! every protocol step as a synchronous transition. It never performs I/O:
//! transitions return what must be sent next ([`Hop`], [`Completion`],
//! [`WatchdogAction`]) and the runtime does the sending, calling back in on
//! failure.

use crate::protocol::{ElectionMessage, MessageKind, ProtocolError};
use crate::watchdog::{ElectionWatchdog, WatchdogConfig};
use crate::{FollowerPhase, MembershipDirectory, NodeId, NodeIdentity, ReplicaState, RingTopology, Role};
use std::collections::HashMap;
use std::time::Instant;

/// Where a propagating message goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hop {
    /// Send to this peer
    Forward(NodeIdentity),
    /// The pass ends at this node
    Complete,
}

/// What to do once a pass ends at this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// This node won the election: promote, then announce
    PromoteSelf(ElectionMessage),
    /// This node is the coordinator: announce the final ring
    Announce(ElectionMessage),
    /// Deliver the announce to the elected winner, then promote it
    HandOff {
        winner: NodeIdentity,
        announce: ElectionMessage,
    },
    /// Hand a finished membership snapshot back to the coordinator
    ReturnToCoordinator {
        coordinator: NodeIdentity,
        message: ElectionMessage,
    },
    /// An Announce pass reached its last member
    Finished,
    /// The pass names a target this node cannot address
    Abandoned,
}

/// Result of adopting an Announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adoption {
    /// The announce names this node as coordinator
    pub promote: bool,
    /// Next hop for the announce
    pub hop: Hop,
}

/// Decision taken on a watchdog tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// This node is coordinator; the watchdog should exit
    Stop,
    /// The coordinator was heard from recently
    Wait,
    /// Not yet admitted: ask the coordinator again
    RetryRegistration {
        coordinator: NodeIdentity,
        request: ElectionMessage,
    },
    /// Coordinator presumed dead: run this election
    StartElection(ElectionMessage),
}

/// Everything one node guards with its lock.
#[derive(Debug, Clone)]
pub struct NodeState {
    identity: NodeIdentity,
    role: Role,
    phase: FollowerPhase,
    ring: RingTopology,
    directory: MembershipDirectory,
    replica: ReplicaState,
    coordinator: NodeId,
    /// Received an Announce (or bootstrapped as coordinator)
    announced: bool,
    watchdog: ElectionWatchdog,
    /// Consecutive Sync failures per member (coordinator only)
    sync_failures: HashMap<NodeId, u32>,
}

impl NodeState {
    /// First node of a fresh ring: coordinator of a ring of one.
    pub fn coordinator(identity: NodeIdentity, config: &WatchdogConfig, now: Instant) -> Self {
        let mut directory = MembershipDirectory::new();
        directory.insert_identity(&identity);
        Self {
            role: Role::Coordinator,
            phase: FollowerPhase::Idle,
            ring: RingTopology::single(identity.id),
            directory,
            replica: ReplicaState::initial(),
            coordinator: identity.id,
            announced: true,
            watchdog: ElectionWatchdog::new(config, identity.id, now),
            sync_failures: HashMap::new(),
            identity,
        }
    }

    /// Newcomer joining a ring described by `directory`.
    ///
    /// The local ring lists the known members in ascending id order with this
    /// node inserted immediately before `coordinator`. The node is
    /// non-authoritative until its first Announce.
    pub fn follower(
        identity: NodeIdentity,
        mut directory: MembershipDirectory,
        coordinator: NodeId,
        config: &WatchdogConfig,
        now: Instant,
    ) -> Self {
        let mut ring: RingTopology = directory.ids().filter(|id| *id != identity.id).collect();
        ring.insert_before(identity.id, coordinator);
        directory.insert_identity(&identity);
        Self {
            role: Role::Follower,
            phase: FollowerPhase::Idle,
            ring,
            directory,
            replica: ReplicaState::default(),
            coordinator,
            announced: false,
            watchdog: ElectionWatchdog::new(config, identity.id, now),
            sync_failures: HashMap::new(),
            identity,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }

    pub fn phase(&self) -> FollowerPhase {
        self.phase
    }

    pub fn ring(&self) -> &RingTopology {
        &self.ring
    }

    pub fn directory(&self) -> &MembershipDirectory {
        &self.directory
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    /// Believed coordinator id.
    pub fn coordinator_id(&self) -> NodeId {
        self.coordinator
    }

    pub fn is_announced(&self) -> bool {
        self.announced
    }

    pub fn watchdog(&self) -> &ElectionWatchdog {
        &self.watchdog
    }

    // ==================== Propagation ====================

    /// Next hop for a Discovery or Announce message leaving this node.
    ///
    /// Discovery ends once the successor is already in the snapshot (a full
    /// lap). Announce ends one hop before the coordinator.
    pub fn next_hop(&self, msg: &ElectionMessage) -> Hop {
        let Some(successor) = self.ring.successor(self.id()) else {
            return Hop::Complete;
        };

        let lap_done = match msg.kind {
            MessageKind::Announce => successor == msg.coordinator_id,
            _ => msg.ring.as_ref().is_some_and(|ring| ring.contains(successor)),
        };
        if lap_done {
            return Hop::Complete;
        }

        match self.directory.identity(successor) {
            Some(peer) => Hop::Forward(peer),
            None => Hop::Complete,
        }
    }

    /// Remove a member from the local ring and directory. Idempotent.
    pub fn prune(&mut self, id: NodeId) -> bool {
        self.sync_failures.remove(&id);
        let in_ring = self.ring.remove(id);
        let in_directory = self.directory.remove(id).is_some();
        in_ring || in_directory
    }

    /// `failed` did not answer: drop it here and from the message, then pick
    /// the next hop.
    pub fn route_around(&mut self, msg: &mut ElectionMessage, failed: NodeId) -> Hop {
        self.prune(failed);
        msg.forget(failed);
        self.next_hop(msg)
    }

    // ==================== Follower ====================

    /// Start an election with this node as the first candidate.
    pub fn start_election(&mut self, now: Instant) -> ElectionMessage {
        self.phase = FollowerPhase::DiscoveryInProgress;
        self.watchdog.refresh(now);
        ElectionMessage::discover(&self.identity)
    }

    /// Take part in a Discovery pass (election or membership).
    ///
    /// Updates `msg` in place and returns where it goes next. A message that
    /// already lists this node has lapped the ring and completes here.
    pub fn accept_discover(
        &mut self,
        msg: &mut ElectionMessage,
        now: Instant,
    ) -> Result<Hop, ProtocolError> {
        msg.validate()?;
        if msg.kind != MessageKind::NewNodeDiscover {
            msg.expect_kind(MessageKind::Discover)?;
        }
        let (snapshot, _) = msg.require_snapshot()?;
        let lapped = snapshot.contains(self.id());

        if msg.kind == MessageKind::NewNodeDiscover {
            let joining = msg.require_joining()?.clone();
            self.ring.insert_before(joining.id, msg.coordinator_id);
            self.directory.insert_identity(&joining);
            self.coordinator = msg.coordinator_id;
        }

        self.phase = FollowerPhase::DiscoveryInProgress;
        self.watchdog.refresh(now);

        if lapped {
            return Ok(Hop::Complete);
        }
        let claims = msg.kind == MessageKind::Discover && self.id() > msg.coordinator_id;
        msg.claim_or_append(&self.identity)?;
        if claims {
            tracing::debug!("Node {} claimed candidacy from {}", self.id(), msg.node_id);
        }
        Ok(self.next_hop(msg))
    }

    /// Decide what happens when a pass ends here.
    pub fn complete_pass(&mut self, msg: &ElectionMessage, now: Instant) -> Completion {
        let Ok((ring, directory)) = msg.require_snapshot() else {
            return Completion::Abandoned;
        };

        match msg.kind {
            MessageKind::Discover => {
                let winner = msg.coordinator_id;
                let announce =
                    ElectionMessage::announce(self.id(), winner, ring.clone(), directory.clone());
                if winner == self.id() {
                    self.install(ring.clone(), directory.clone(), winner, now);
                    self.phase = FollowerPhase::PromotingToCoordinator;
                    return Completion::PromoteSelf(announce);
                }
                match directory.identity(winner) {
                    Some(winner) => {
                        self.phase = FollowerPhase::AnnouncePending;
                        Completion::HandOff { winner, announce }
                    }
                    None => Completion::Abandoned,
                }
            }
            MessageKind::NewNodeDiscover => {
                if msg.coordinator_id == self.id() {
                    return match self.adopt_final_ring(msg) {
                        Ok(announce) => Completion::Announce(announce),
                        Err(_) => Completion::Abandoned,
                    };
                }
                match directory.identity(msg.coordinator_id) {
                    Some(coordinator) => {
                        self.phase = FollowerPhase::AnnouncePending;
                        Completion::ReturnToCoordinator {
                            coordinator,
                            message: msg.clone(),
                        }
                    }
                    None => Completion::Abandoned,
                }
            }
            _ => Completion::Finished,
        }
    }

    /// Adopt an announced ring, directory and coordinator wholesale.
    ///
    /// A node missing from the announced ring keeps itself in its local view
    /// (ahead of the coordinator) and drops back to non-authoritative so its
    /// watchdog re-registers it.
    pub fn adopt_announce(
        &mut self,
        msg: &ElectionMessage,
        now: Instant,
    ) -> Result<Adoption, ProtocolError> {
        msg.validate()?;
        msg.expect_kind(MessageKind::Announce)?;
        let (ring, directory) = msg.require_snapshot()?;
        if !ring.contains(msg.coordinator_id) {
            return Err(ProtocolError::CoordinatorNotInRing(msg.coordinator_id));
        }

        self.install(ring.clone(), directory.clone(), msg.coordinator_id, now);
        if !self.ring.contains(self.id()) {
            tracing::warn!(
                "Node {} missing from announced ring {}, will re-register",
                self.id(),
                self.ring
            );
            self.ring.insert_before(self.id(), msg.coordinator_id);
            self.directory.insert_identity(&self.identity);
            self.announced = false;
        }

        let promote = msg.coordinator_id == self.id();
        self.phase = if promote {
            FollowerPhase::PromotingToCoordinator
        } else {
            FollowerPhase::Idle
        };
        Ok(Adoption {
            promote,
            hop: self.next_hop(msg),
        })
    }

    fn install(
        &mut self,
        ring: RingTopology,
        directory: MembershipDirectory,
        coordinator: NodeId,
        now: Instant,
    ) {
        self.ring = ring;
        self.directory = directory;
        self.coordinator = coordinator;
        self.announced = true;
        self.sync_failures
            .retain(|id, _| self.directory.contains(*id));
        self.watchdog.refresh(now);
    }

    /// Overwrite the local replica from a coordinator push.
    pub fn apply_sync(&mut self, msg: &ElectionMessage, now: Instant) -> Result<(), ProtocolError> {
        msg.expect_kind(MessageKind::Sync)?;
        let payload = msg.require_payload()?;
        self.replica.overwrite(payload.to_vec());
        self.coordinator = msg.coordinator_id;
        self.phase = FollowerPhase::Idle;
        self.watchdog.refresh(now);
        Ok(())
    }

    /// Randomly change one replica slot (divergence demo).
    ///
    /// Only followers drift; the coordinator's copy is authoritative.
    pub fn drift_replica(&mut self) -> Option<(usize, i64)> {
        if self.is_coordinator() {
            return None;
        }
        self.replica.drift()
    }

    /// Swap to the coordinator role. Returns false if already coordinator.
    pub fn promote(&mut self) -> bool {
        if self.is_coordinator() {
            return false;
        }
        self.role = Role::Coordinator;
        self.phase = FollowerPhase::Idle;
        self.coordinator = self.id();
        self.announced = true;
        self.sync_failures.clear();
        if !self.ring.contains(self.id()) {
            self.ring.push(self.id());
            self.directory.insert_identity(&self.identity);
        }
        true
    }

    // ==================== Registration ====================

    /// RegisterNode request for the believed coordinator, if it is addressable.
    pub fn registration_request(&self) -> Option<(NodeIdentity, ElectionMessage)> {
        if self.coordinator == self.id() {
            return None;
        }
        let coordinator = self.directory.identity(self.coordinator)?;
        let request = ElectionMessage::register(self.identity.clone(), self.coordinator);
        Some((coordinator, request))
    }

    /// Take the authoritative replica from a RegisterNode acknowledgement.
    pub fn apply_registration_reply(&mut self, reply: &ElectionMessage, now: Instant) {
        if let Some(payload) = &reply.payload {
            self.replica.overwrite(payload.to_vec());
        }
        self.watchdog.refresh(now);
    }

    /// One watchdog check.
    ///
    /// An expired follower registers again instead of electing when it has
    /// not been announced yet, or when the last election it took part in
    /// never produced an Announce. The latter happens when a live coordinator
    /// refused the pass: this node was dropped from the ring while still
    /// running, and only re-registration readmits it.
    pub fn watchdog_tick(&mut self, now: Instant) -> WatchdogAction {
        if self.is_coordinator() {
            return WatchdogAction::Stop;
        }
        if !self.watchdog.is_expired(now) {
            return WatchdogAction::Wait;
        }
        if !self.announced || self.election_stalled() {
            if let Some((coordinator, request)) = self.registration_request() {
                self.phase = FollowerPhase::Idle;
                self.watchdog.refresh(now);
                return WatchdogAction::RetryRegistration {
                    coordinator,
                    request,
                };
            }
        }
        WatchdogAction::StartElection(self.start_election(now))
    }

    /// An election this node joined has not been resolved by an Announce or
    /// a Sync since.
    pub fn election_stalled(&self) -> bool {
        matches!(
            self.phase,
            FollowerPhase::DiscoveryInProgress | FollowerPhase::AnnouncePending
        )
    }

    // ==================== Coordinator ====================

    /// Admit `joining` locally and build the membership pass that tells the
    /// rest of the ring.
    pub fn begin_membership_discovery(&mut self, joining: &NodeIdentity) -> ElectionMessage {
        self.ring.insert_before(joining.id, self.id());
        self.directory.insert_identity(joining);
        self.sync_failures.remove(&joining.id);
        ElectionMessage::new_node_discover(&self.identity, joining.clone())
    }

    /// RegisterNode acknowledgement carrying the authoritative replica.
    pub fn registration_reply(&self) -> ElectionMessage {
        ElectionMessage::ack_with_replica(self.id(), self.replica.clone())
    }

    /// Adopt the ring a membership pass brought back and build the Announce.
    pub fn adopt_final_ring(&mut self, msg: &ElectionMessage) -> Result<ElectionMessage, ProtocolError> {
        msg.validate()?;
        let (ring, directory) = msg.require_snapshot()?;
        if !ring.contains(self.id()) {
            return Err(ProtocolError::CoordinatorNotInRing(self.id()));
        }
        self.ring = ring.clone();
        self.directory = directory.clone();
        self.coordinator = self.id();
        self.sync_failures
            .retain(|id, _| self.directory.contains(*id));
        Ok(self.announce_message())
    }

    /// Announce of the current ring with this node as coordinator.
    pub fn announce_message(&self) -> ElectionMessage {
        ElectionMessage::announce(
            self.id(),
            self.id(),
            self.ring.clone(),
            self.directory.clone(),
        )
    }

    /// Every member except this node.
    pub fn sync_targets(&self) -> Vec<NodeIdentity> {
        self.directory
            .identities()
            .filter(|peer| peer.id != self.id())
            .collect()
    }

    pub fn sync_message(&self) -> ElectionMessage {
        ElectionMessage::sync(self.id(), self.replica.clone())
    }

    pub fn record_sync_success(&mut self, peer: NodeId) {
        self.sync_failures.remove(&peer);
    }

    /// Count a failed Sync. Prunes `peer` and returns true once it has
    /// failed `limit` times in a row.
    pub fn record_sync_failure(&mut self, peer: NodeId, limit: u32) -> bool {
        let failures = self.sync_failures.entry(peer).or_insert(0);
        *failures += 1;
        if *failures >= limit.max(1) {
            self.prune(peer);
            true
        } else {
            false
        }
    }

    pub fn sync_failures(&self, peer: NodeId) -> u32 {
        self.sync_failures.get(&peer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Operation;
    use std::collections::{BTreeMap, HashSet, VecDeque};
    use std::time::Duration;

    fn identity(id: u32) -> NodeIdentity {
        NodeIdentity::new(NodeId::new(id), format!("127.0.0.1:{}", 8000 + id))
    }

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId::new).collect()
    }

    fn ring(raw: &[u32]) -> RingTopology {
        RingTopology::from_members(ids(raw))
    }

    fn directory(raw: &[u32]) -> MembershipDirectory {
        raw.iter()
            .map(|id| (NodeId::new(*id), identity(*id).address))
            .collect()
    }

    /// One message in flight: `msg` sitting at node `at`, about to take `hop`.
    struct Step {
        at: NodeId,
        msg: ElectionMessage,
        hop: Hop,
    }

    /// In-memory ring: delivers messages between `NodeState`s the way the
    /// daemon does over sockets, with killed members acting unreachable and
    /// coordinators rejecting follower operations.
    struct Cluster {
        nodes: BTreeMap<NodeId, NodeState>,
        dead: HashSet<NodeId>,
        queue: VecDeque<Step>,
        now: Instant,
        config: WatchdogConfig,
    }

    impl Cluster {
        /// Established ring in the given traversal order with `coordinator`
        /// already announced everywhere.
        fn established(order: &[u32], coordinator: u32) -> Self {
            let config = WatchdogConfig::default();
            let now = Instant::now();
            let dir = directory(order);
            let topology = ring(order);
            let coord = NodeId::new(coordinator);

            let mut nodes = BTreeMap::new();
            for id in order {
                let id = NodeId::new(*id);
                let state = if id == coord {
                    let mut state = NodeState::coordinator(identity(coordinator), &config, now);
                    let mut seed = ElectionMessage::announce(id, id, topology.clone(), dir.clone());
                    seed.kind = MessageKind::NewNodeDiscover;
                    state.adopt_final_ring(&seed).unwrap();
                    state
                } else {
                    let mut state =
                        NodeState::follower(identity(id.as_u32()), dir.clone(), coord, &config, now);
                    let announce =
                        ElectionMessage::announce(coord, coord, topology.clone(), dir.clone());
                    state.adopt_announce(&announce, now).unwrap();
                    state
                };
                nodes.insert(id, state);
            }

            Self {
                nodes,
                dead: HashSet::new(),
                queue: VecDeque::new(),
                now,
                config,
            }
        }

        fn node(&self, id: u32) -> &NodeState {
            &self.nodes[&NodeId::new(id)]
        }

        fn node_mut(&mut self, id: NodeId) -> &mut NodeState {
            self.nodes.get_mut(&id).unwrap()
        }

        fn kill(&mut self, id: u32) {
            self.dead.insert(NodeId::new(id));
        }

        /// Make a killed node reachable again with the state it had.
        fn revive(&mut self, id: u32) {
            self.dead.remove(&NodeId::new(id));
        }

        fn alive(&self) -> Vec<&NodeState> {
            self.nodes
                .values()
                .filter(|n| !self.dead.contains(&n.id()))
                .collect()
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
        }

        /// Whether `to` would serve `op` (false means unreachable or rejected).
        fn serves(&self, to: NodeId, op: Operation) -> bool {
            !self.dead.contains(&to) && op.served_by(self.nodes[&to].role())
        }

        fn start_election(&mut self, at: u32) {
            let at = NodeId::new(at);
            let now = self.now;
            let node = self.node_mut(at);
            let msg = node.start_election(now);
            let hop = node.next_hop(&msg);
            self.queue.push_back(Step { at, msg, hop });
        }

        fn register(&mut self, newcomer: u32) {
            let now = self.now;
            let joining = identity(newcomer);
            let coordinator = self
                .alive()
                .into_iter()
                .find(|n| n.is_coordinator())
                .map(|n| n.id())
                .unwrap();
            let dir = self.nodes[&coordinator].directory().clone();
            let state = NodeState::follower(joining.clone(), dir, coordinator, &self.config, now);

            let (target, request) = state.registration_request().unwrap();
            assert_eq!(target.id, coordinator);
            self.nodes.insert(joining.id, state);
            assert!(self.send_registration(joining.id, coordinator, &request));
        }

        /// Deliver a RegisterNode from `at`. False if `coordinator` would not
        /// serve it.
        fn send_registration(
            &mut self,
            at: NodeId,
            coordinator: NodeId,
            request: &ElectionMessage,
        ) -> bool {
            if !self.serves(coordinator, Operation::RegisterNode) {
                return false;
            }
            let now = self.now;
            let coord = self.node_mut(coordinator);
            let reply = coord.registration_reply();
            let msg = coord.begin_membership_discovery(request.require_joining().unwrap());
            let hop = coord.next_hop(&msg);
            self.node_mut(at).apply_registration_reply(&reply, now);
            self.queue.push_back(Step {
                at: coordinator,
                msg,
                hop,
            });
            true
        }

        /// Tick the watchdog at `at` and act on it the way the daemon's
        /// watchdog loop does.
        fn watchdog_tick(&mut self, at: u32) -> WatchdogAction {
            let at = NodeId::new(at);
            let now = self.now;
            let action = self.node_mut(at).watchdog_tick(now);
            match &action {
                WatchdogAction::StartElection(msg) => {
                    let hop = self.nodes[&at].next_hop(msg);
                    self.queue.push_back(Step {
                        at,
                        msg: msg.clone(),
                        hop,
                    });
                }
                WatchdogAction::RetryRegistration {
                    coordinator,
                    request,
                } => {
                    let delivered = self.send_registration(at, coordinator.id, request);
                    if !delivered && self.dead.contains(&coordinator.id) {
                        let node = self.node_mut(at);
                        let msg = node.start_election(now);
                        let hop = node.next_hop(&msg);
                        self.queue.push_back(Step { at, msg, hop });
                    }
                }
                WatchdogAction::Stop | WatchdogAction::Wait => {}
            }
            action
        }

        /// Deliver queued messages one hop at a time until nothing is in flight.
        fn run(&mut self) {
            let mut steps = 0;
            while let Some(step) = self.queue.pop_front() {
                steps += 1;
                assert!(steps < 200, "propagation did not terminate");
                self.step(step);
            }
        }

        fn run_until(&mut self, mut done: impl FnMut(&Cluster) -> bool) {
            let mut steps = 0;
            while !done(self) {
                let Some(step) = self.queue.pop_front() else {
                    panic!("queue drained before condition was met");
                };
                steps += 1;
                assert!(steps < 200, "propagation did not terminate");
                self.step(step);
            }
        }

        fn step(&mut self, Step { at, mut msg, hop }: Step) {
            // Messages held by a killed node die with it
            if self.dead.contains(&at) {
                return;
            }
            let now = self.now;
            match hop {
                Hop::Complete => self.complete(at, msg),
                Hop::Forward(peer) => {
                    let op = match msg.kind {
                        MessageKind::Announce => Operation::UpdateRing,
                        _ => Operation::DiscoverRing,
                    };
                    if self.dead.contains(&peer.id) {
                        let hop = self.node_mut(at).route_around(&mut msg, peer.id);
                        self.queue.push_back(Step { at, msg, hop });
                        return;
                    }
                    if !self.serves(peer.id, op) {
                        // A live coordinator stops the pass
                        return;
                    }
                    let node = self.node_mut(peer.id);
                    let hop = if op == Operation::UpdateRing {
                        let adoption = node.adopt_announce(&msg, now).unwrap();
                        if adoption.promote {
                            node.promote();
                        }
                        adoption.hop
                    } else {
                        node.accept_discover(&mut msg, now).unwrap()
                    };
                    self.queue.push_back(Step {
                        at: peer.id,
                        msg,
                        hop,
                    });
                }
            }
        }

        fn complete(&mut self, at: NodeId, msg: ElectionMessage) {
            let now = self.now;
            match self.node_mut(at).complete_pass(&msg, now) {
                Completion::PromoteSelf(announce) => {
                    let node = self.node_mut(at);
                    node.promote();
                    let hop = node.next_hop(&announce);
                    self.queue.push_back(Step { at, msg: announce, hop });
                }
                Completion::Announce(announce) => {
                    let hop = self.nodes[&at].next_hop(&announce);
                    self.queue.push_back(Step { at, msg: announce, hop });
                }
                Completion::HandOff { winner, announce } => {
                    if self.dead.contains(&winner.id) {
                        let node = self.node_mut(at);
                        node.prune(winner.id);
                        let msg = node.start_election(now);
                        let hop = node.next_hop(&msg);
                        self.queue.push_back(Step { at, msg, hop });
                        return;
                    }
                    if !self.serves(winner.id, Operation::UpdateRing) {
                        // Already promoted by an earlier pass
                        return;
                    }
                    let node = self.node_mut(winner.id);
                    let adoption = node.adopt_announce(&announce, now).unwrap();
                    node.promote();
                    self.queue.push_back(Step {
                        at: winner.id,
                        msg: announce,
                        hop: adoption.hop,
                    });
                }
                Completion::ReturnToCoordinator {
                    coordinator,
                    message,
                } => {
                    if !self.serves(coordinator.id, Operation::InitiateRingUpdate) {
                        self.node_mut(at).prune(coordinator.id);
                        return;
                    }
                    let node = self.node_mut(coordinator.id);
                    let announce = node.adopt_final_ring(&message).unwrap();
                    let hop = node.next_hop(&announce);
                    self.queue.push_back(Step {
                        at: coordinator.id,
                        msg: announce,
                        hop,
                    });
                }
                Completion::Finished | Completion::Abandoned => {}
            }
        }

        fn sync_round(&mut self) {
            let now = self.now;
            let coordinators: Vec<NodeId> = self
                .alive()
                .into_iter()
                .filter(|n| n.is_coordinator())
                .map(|n| n.id())
                .collect();
            for coord in coordinators {
                let targets = self.nodes[&coord].sync_targets();
                let msg = self.nodes[&coord].sync_message();
                for peer in targets {
                    if self.serves(peer.id, Operation::Synchronize) {
                        self.node_mut(peer.id).apply_sync(&msg, now).unwrap();
                        self.node_mut(coord).record_sync_success(peer.id);
                    } else if self.node_mut(coord).record_sync_failure(peer.id, 3) {
                        let announce = self.nodes[&coord].announce_message();
                        let hop = self.nodes[&coord].next_hop(&announce);
                        self.queue.push_back(Step {
                            at: coord,
                            msg: announce,
                            hop,
                        });
                    }
                }
            }
        }

        fn assert_converged(&self, members: &[u32], coordinator: u32) {
            let expected = ring(members);
            let coordinators: Vec<NodeId> = self
                .alive()
                .into_iter()
                .filter(|n| n.is_coordinator())
                .map(|n| n.id())
                .collect();
            assert_eq!(coordinators, vec![NodeId::new(coordinator)]);

            for node in self.alive() {
                assert!(
                    node.ring().same_cycle(&expected),
                    "node {} has ring {}, expected {}",
                    node.id(),
                    node.ring(),
                    expected
                );
                assert_eq!(node.coordinator_id(), NodeId::new(coordinator));
                assert_eq!(
                    node.directory().ids().collect::<HashSet<_>>(),
                    expected.iter().collect::<HashSet<_>>()
                );
            }
        }
    }

    // ==================== Construction ====================

    #[test]
    fn test_bootstrap_coordinator() {
        let state = NodeState::coordinator(identity(0), &WatchdogConfig::default(), Instant::now());
        assert!(state.is_coordinator());
        assert_eq!(state.ring().members(), ids(&[0]).as_slice());
        assert_eq!(state.replica(), &ReplicaState::initial());
        assert!(state.sync_targets().is_empty());
    }

    #[test]
    fn test_follower_inserts_self_before_coordinator() {
        let state = NodeState::follower(
            identity(3),
            directory(&[0, 1, 2]),
            NodeId::new(0),
            &WatchdogConfig::default(),
            Instant::now(),
        );
        assert_eq!(state.role(), Role::Follower);
        assert!(!state.is_announced());
        assert_eq!(state.ring().members(), ids(&[3, 0, 1, 2]).as_slice());
        assert_eq!(state.directory().address(NodeId::new(3)), Some("127.0.0.1:8003"));
        assert!(state.replica().is_empty());
    }

    // ==================== Discovery ====================

    #[test]
    fn test_accept_discover_rejects_malformed() {
        let now = Instant::now();
        let mut cluster = Cluster::established(&[0, 1], 1);
        let node = cluster.node_mut(NodeId::new(0));
        let before = node.ring().clone();

        let mut msg = ElectionMessage::sync(NodeId::new(1), ReplicaState::initial());
        assert!(matches!(
            node.accept_discover(&mut msg, now),
            Err(ProtocolError::UnexpectedKind { .. })
        ));

        let mut msg = ElectionMessage::discover(&identity(1));
        msg.ring = None;
        assert!(matches!(
            node.accept_discover(&mut msg, now),
            Err(ProtocolError::MissingRing { .. })
        ));
        assert_eq!(node.ring(), &before);
        assert_eq!(node.phase(), FollowerPhase::Idle);
    }

    #[test]
    fn test_lapped_discover_completes() {
        let now = Instant::now();
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        let node = cluster.node_mut(NodeId::new(1));

        let mut msg = ElectionMessage::discover(&identity(1));
        assert_eq!(node.accept_discover(&mut msg, now).unwrap(), Hop::Complete);
    }

    #[test]
    fn test_route_around_prunes_both_sides() {
        let mut cluster = Cluster::established(&[0, 1, 2, 3], 3);
        let node = cluster.node_mut(NodeId::new(0));
        let mut msg = node.start_election(Instant::now());
        msg.claim_or_append(&identity(2)).unwrap();

        let hop = node.route_around(&mut msg, NodeId::new(1));
        assert_eq!(hop, Hop::Complete);
        assert!(!node.ring().contains(NodeId::new(1)));
        assert!(!node.directory().contains(NodeId::new(1)));
        assert_eq!(node.ring().successor(NodeId::new(0)), Some(NodeId::new(2)));
    }

    #[test]
    fn test_route_around_exhausts_ring() {
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        let node = cluster.node_mut(NodeId::new(0));
        let mut msg = node.start_election(Instant::now());

        assert_eq!(node.next_hop(&msg), Hop::Forward(identity(1)));
        assert_eq!(node.route_around(&mut msg, NodeId::new(1)), Hop::Forward(identity(2)));
        assert_eq!(node.route_around(&mut msg, NodeId::new(2)), Hop::Complete);
        assert_eq!(node.ring().members(), ids(&[0]).as_slice());
    }

    // ==================== Elections ====================

    #[test]
    fn test_election_after_coordinator_failure() {
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        cluster.kill(2);

        // Node 0's 6s threshold expires first
        cluster.advance(Duration::from_millis(6500));
        let now = cluster.now;
        match cluster.node_mut(NodeId::new(0)).watchdog_tick(now) {
            WatchdogAction::StartElection(msg) => assert_eq!(msg.coordinator_id, NodeId::new(0)),
            other => panic!("expected an election, got {other:?}"),
        }
        assert_eq!(
            cluster.node_mut(NodeId::new(1)).watchdog_tick(now),
            WatchdogAction::Wait
        );

        cluster.start_election(0);
        cluster.run();

        cluster.assert_converged(&[0, 1], 1);
        assert!(cluster.node(1).is_coordinator());
        assert!(!cluster.node(0).is_coordinator());
    }

    #[test]
    fn test_highest_id_wins() {
        let mut cluster = Cluster::established(&[4, 0, 7, 2, 5], 7);
        cluster.kill(7);

        cluster.start_election(2);
        cluster.run();

        cluster.assert_converged(&[4, 0, 2, 5], 5);
    }

    #[test]
    fn test_concurrent_elections_agree() {
        let mut cluster = Cluster::established(&[0, 1, 2, 3, 4], 4);
        cluster.kill(4);

        cluster.start_election(0);
        cluster.start_election(1);
        cluster.start_election(2);
        cluster.run();

        cluster.assert_converged(&[0, 1, 2, 3], 3);
    }

    #[test]
    fn test_self_healing_excludes_killed_members() {
        let mut cluster = Cluster::established(&[0, 1, 2, 3, 4], 4);
        cluster.kill(2);
        cluster.kill(4);

        cluster.start_election(0);
        cluster.run();

        cluster.assert_converged(&[0, 1, 3], 3);
    }

    #[test]
    fn test_candidate_killed_mid_pass() {
        let mut cluster = Cluster::established(&[0, 1, 2, 3], 3);
        cluster.kill(3);

        cluster.start_election(0);
        // Kill node 2 once its candidacy has travelled past it
        cluster.run_until(|c| {
            c.queue
                .front()
                .is_some_and(|s| s.at == NodeId::new(0) && s.msg.coordinator_id == NodeId::new(2))
        });
        cluster.kill(2);
        cluster.run();

        cluster.assert_converged(&[0, 1], 1);
    }

    #[test]
    fn test_live_coordinator_stops_election() {
        let mut cluster = Cluster::established(&[0, 1, 2], 2);

        cluster.start_election(0);
        cluster.run();

        cluster.assert_converged(&[0, 1, 2], 2);
        assert!(!cluster.node(1).is_coordinator());
    }

    #[test]
    fn test_sole_survivor_promotes_itself() {
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        cluster.kill(1);
        cluster.kill(2);

        cluster.start_election(0);
        cluster.run();

        cluster.assert_converged(&[0], 0);
    }

    #[test]
    fn test_watchdog_exempts_coordinator() {
        let mut cluster = Cluster::established(&[0, 1], 1);
        cluster.advance(Duration::from_secs(60));
        let now = cluster.now;
        assert_eq!(
            cluster.node_mut(NodeId::new(1)).watchdog_tick(now),
            WatchdogAction::Stop
        );
    }

    // ==================== Membership ====================

    #[test]
    fn test_register_inserts_before_coordinator() {
        let mut cluster = Cluster::established(&[0, 1, 2], 0);

        cluster.register(3);
        cluster.run();

        cluster.assert_converged(&[3, 0, 1, 2], 0);
        assert_eq!(
            cluster.node(2).ring().successor(NodeId::new(2)),
            Some(NodeId::new(3))
        );
        assert_eq!(
            cluster.node(3).ring().successor(NodeId::new(3)),
            Some(NodeId::new(0))
        );
        assert!(cluster.node(3).is_announced());
        assert_eq!(cluster.node(3).replica(), &ReplicaState::initial());
    }

    #[test]
    fn test_register_into_single_node_ring() {
        let mut cluster = Cluster::established(&[0], 0);

        cluster.register(1);
        cluster.run();
        cluster.register(2);
        cluster.run();

        cluster.assert_converged(&[0, 1, 2], 0);
    }

    #[test]
    fn test_register_with_dead_member() {
        let mut cluster = Cluster::established(&[0, 1, 2], 0);
        cluster.kill(1);

        cluster.register(3);
        cluster.run();

        cluster.assert_converged(&[3, 0, 2], 0);
    }

    #[test]
    fn test_unannounced_follower_retries_registration() {
        let config = WatchdogConfig::default();
        let start = Instant::now();
        let mut state =
            NodeState::follower(identity(3), directory(&[0, 1]), NodeId::new(0), &config, start);

        let later = start + Duration::from_secs(10);
        match state.watchdog_tick(later) {
            WatchdogAction::RetryRegistration {
                coordinator,
                request,
            } => {
                assert_eq!(coordinator, identity(0));
                assert_eq!(request.require_joining().unwrap(), &identity(3));
            }
            other => panic!("expected registration retry, got {other:?}"),
        }
        // Refreshed: not due again yet
        assert_eq!(state.watchdog_tick(later), WatchdogAction::Wait);
    }

    #[test]
    fn test_announce_without_self_reverts_to_unannounced() {
        let now = Instant::now();
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        let node = cluster.node_mut(NodeId::new(0));

        let announce = ElectionMessage::announce(
            NodeId::new(2),
            NodeId::new(2),
            ring(&[1, 2]),
            directory(&[1, 2]),
        );
        node.adopt_announce(&announce, now).unwrap();

        assert!(!node.is_announced());
        assert_eq!(node.ring().members(), ids(&[1, 0, 2]).as_slice());
        assert!(node.directory().contains(NodeId::new(0)));
    }

    #[test]
    fn test_announce_rejects_absent_coordinator() {
        let now = Instant::now();
        let mut cluster = Cluster::established(&[0, 1], 1);
        let node = cluster.node_mut(NodeId::new(0));

        let announce = ElectionMessage::announce(
            NodeId::new(5),
            NodeId::new(5),
            ring(&[0, 1]),
            directory(&[0, 1]),
        );
        assert_eq!(
            node.adopt_announce(&announce, now),
            Err(ProtocolError::CoordinatorNotInRing(NodeId::new(5)))
        );
        assert_eq!(node.coordinator_id(), NodeId::new(1));
    }

    // ==================== Synchronize ====================

    #[test]
    fn test_replica_convergence() {
        let mut cluster = Cluster::established(&[0, 1, 2, 3], 0);
        cluster.node_mut(NodeId::new(2)).replica = ReplicaState::new(vec![9, 9]);
        for id in [1, 3] {
            cluster.node_mut(NodeId::new(id)).drift_replica();
        }
        let authoritative = cluster.node(0).replica().clone();

        cluster.sync_round();

        for node in cluster.alive() {
            assert_eq!(node.replica(), &authoritative, "node {}", node.id());
        }
    }

    #[test]
    fn test_sync_refreshes_watchdog() {
        let mut cluster = Cluster::established(&[0, 1], 0);
        cluster.advance(Duration::from_secs(30));
        cluster.sync_round();

        let node = cluster.node(1);
        assert_eq!(node.watchdog().silence(cluster.now), Duration::ZERO);
    }

    #[test]
    fn test_sync_prunes_after_repeated_failures() {
        let mut cluster = Cluster::established(&[0, 1, 2], 0);
        cluster.kill(1);

        cluster.sync_round();
        cluster.sync_round();
        assert!(cluster.node(0).ring().contains(NodeId::new(1)));
        assert_eq!(cluster.node(0).sync_failures(NodeId::new(1)), 2);

        cluster.sync_round();
        cluster.run();

        cluster.assert_converged(&[0, 2], 0);
    }

    #[test]
    fn test_pruned_follower_rejoins_after_partition() {
        let mut cluster = Cluster::established(&[0, 1, 2], 0);

        // Node 1 is cut off long enough to be pruned
        cluster.kill(1);
        for _ in 0..3 {
            cluster.sync_round();
        }
        cluster.run();
        assert_eq!(cluster.node(0).ring(), &ring(&[0, 2]));
        cluster.revive(1);

        // First expiry: its election is refused by the live coordinator
        cluster.advance(Duration::from_secs(8));
        assert!(matches!(
            cluster.watchdog_tick(1),
            WatchdogAction::StartElection(_)
        ));
        cluster.run();
        cluster.sync_round();
        cluster.run();
        assert!(!cluster.node(0).ring().contains(NodeId::new(1)));
        assert!(cluster.node(1).election_stalled());

        // Second expiry: re-register instead of electing again
        cluster.advance(Duration::from_secs(8));
        match cluster.watchdog_tick(1) {
            WatchdogAction::RetryRegistration { coordinator, .. } => {
                assert_eq!(coordinator.id, NodeId::new(0));
            }
            other => panic!("expected re-registration, got {other:?}"),
        }
        cluster.run();
        cluster.sync_round();
        cluster.run();

        cluster.assert_converged(&[0, 2, 1], 0);
        let node = cluster.node(1);
        assert!(node.is_announced());
        assert!(!node.election_stalled());
        assert_eq!(node.replica(), cluster.node(0).replica());
        assert_eq!(cluster.node(0).sync_failures(NodeId::new(1)), 0);
    }

    #[test]
    fn test_stalled_election_falls_back_to_registration() {
        let config = WatchdogConfig::default();
        let mut cluster = Cluster::established(&[0, 1], 0);
        let first = cluster.now + Duration::from_secs(10);
        let node = cluster.node_mut(NodeId::new(1));
        assert_eq!(node.phase(), FollowerPhase::Idle);

        assert!(matches!(
            node.watchdog_tick(first),
            WatchdogAction::StartElection(_)
        ));
        assert_eq!(node.phase(), FollowerPhase::DiscoveryInProgress);

        let second = first + config.threshold(NodeId::new(1)) + Duration::from_secs(1);
        assert!(matches!(
            node.watchdog_tick(second),
            WatchdogAction::RetryRegistration { .. }
        ));
        assert_eq!(node.phase(), FollowerPhase::Idle);

        // A Sync settles the node; the next expiry elects again
        let sync = ElectionMessage::sync(NodeId::new(0), ReplicaState::initial());
        node.start_election(second);
        node.apply_sync(&sync, second).unwrap();
        assert!(!node.election_stalled());
        let third = second + config.threshold(NodeId::new(1)) + Duration::from_secs(1);
        assert!(matches!(
            node.watchdog_tick(third),
            WatchdogAction::StartElection(_)
        ));
    }

    #[test]
    fn test_dead_coordinator_registration_falls_back_to_election() {
        let mut cluster = Cluster::established(&[0, 1, 2], 2);
        cluster.node_mut(NodeId::new(0)).phase = FollowerPhase::AnnouncePending;
        cluster.kill(2);

        cluster.advance(Duration::from_secs(7));
        assert!(matches!(
            cluster.watchdog_tick(0),
            WatchdogAction::RetryRegistration { .. }
        ));
        cluster.run();

        cluster.assert_converged(&[0, 1], 1);
    }

    #[test]
    fn test_sync_success_resets_failures() {
        let mut state = NodeState::coordinator(identity(0), &WatchdogConfig::default(), Instant::now());
        state.begin_membership_discovery(&identity(1));

        assert!(!state.record_sync_failure(NodeId::new(1), 3));
        assert!(!state.record_sync_failure(NodeId::new(1), 3));
        state.record_sync_success(NodeId::new(1));
        assert!(!state.record_sync_failure(NodeId::new(1), 3));
        assert!(state.ring().contains(NodeId::new(1)));
    }

    #[test]
    fn test_coordinator_does_not_drift() {
        let mut state = NodeState::coordinator(identity(0), &WatchdogConfig::default(), Instant::now());
        assert!(state.drift_replica().is_none());
        assert_eq!(state.replica(), &ReplicaState::initial());
    }

    #[test]
    fn test_sync_rejects_missing_payload() {
        let mut cluster = Cluster::established(&[0, 1], 0);
        let node = cluster.node_mut(NodeId::new(1));
        let mut msg = ElectionMessage::sync(NodeId::new(0), ReplicaState::initial());
        msg.payload = None;
        assert!(matches!(
            node.apply_sync(&msg, Instant::now()),
            Err(ProtocolError::MissingPayload { .. })
        ));
    }
}
