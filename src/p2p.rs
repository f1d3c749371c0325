//! # Overlay Service
//!
//! Maintains the node's overlay sessions: outbound peer connections through
//! the connection manager, the admission handshake, liveness, peer exchange
//! and the overlay signals the job dispatch service depends on.
//!
//! ## Handshake
//!
//! ```text
//!   A                                   B
//!   |--- Hello(rand_a, challenge_a) --->|
//!   |<-- Hello(rand_b, challenge_b) ----|
//!   |--- ResendRandVal(rand_b) -------->|     echo proves the session is live
//!   |<-- ResendRandVal(rand_a) ---------|
//!   |--- ChallengeSolution(s_b) ------->|     only when a challenge was issued
//!   |<-- ChallengeSolution(s_a) --------|
//! ```
//!
//! A session is verified once the peer's Hello was admitted, our nonce came
//! back and the peer solved our challenge. Until then only handshake messages
//! are processed, and the session is dropped when the handshake deadline
//! passes.
//!
//! | Check | Disconnect reason |
//! |-------|-------------------|
//! | signature does not match the claimed identity | `Unverified` |
//! | different protocol id | `ProtocolVersion` |
//! | our own identity | `SelfConnection` |
//! | peer already connected | `DuplicatePeers` |
//! | peer table full (peers are sent first) | `TooManyPeers` |
//! | wrong nonce echo or challenge solution | `Unverified` |
//! | undecodable frame | `BadProtocol` |
//!
//! Peers refused as `Unverified`, and peers that refused us with
//! `TooManyPeers`, are not contacted again until the ban expires.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::AddressCandidate;
use crate::challenge::{solve_challenge, ChallengeGate};
use crate::config::{NodeConfig, OverlayConfig};
use crate::identity::{distance_cmp, Identity, Keypair, NodeInfo};
use crate::messages::{DisconnectReason, Hello, Message, SignedHello, MAX_PEERS_PER_MESSAGE};
use crate::neighbors::{InsertionLimiter, NeighborTable, PeerToPing};
use crate::pending::{
    ConnectionHandler, ConnectionRequests, HandlerTable, ListenHandler, ListenKind, LocalEndpoints, RequestId,
    RequestKind,
};
use crate::rendezvous::RendezvousId;
use crate::transport::{Binder, Dialer, SessionId, SessionRef};

/// Hops a forwarded start-session request may travel.
pub const FORWARD_TTL: u8 = 3;

/// Challenges harder than this are refused instead of solved.
pub const MAX_SOLVE_DIFFICULTY: u32 = 24;

const MAX_FREE_PEERS: usize = 1_000;
const MAX_TRACKED_FORWARDS: usize = 4_096;
const EVENT_QUEUE: usize = 256;


// ============================================================================
// Public types
// ============================================================================

/// Context carried by overlay connection requests.
#[derive(Debug, Clone, Default)]
pub struct PeerContext {
    /// Unknown for seeds.
    pub identity: Option<Identity>,
}

/// Signals for the services built on top of the overlay.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    PeerVerified(NodeInfo),
    PeerDisconnected(Identity),
    /// A requestor that cannot reach us asks us to dial it.
    StartSessionRequested {
        requestor: NodeInfo,
        conn_id: RequestId,
        supernode: Option<NodeInfo>,
    },
    /// A supernode asks us to open a punch port and dial the asking node.
    WaitForNatTraverse {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        asking_addr: AddressCandidate,
        conn_id: RequestId,
        mediator: NodeInfo,
    },
    /// The destination of a punch we mediate opened its port.
    NatPunchListening {
        rendezvous: RendezvousId,
        from: Identity,
        endpoint: AddressCandidate,
        port: u16,
    },
    /// A supernode asks us to join a relay session.
    JoinMiddleman {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        conn_id: RequestId,
        mediator: NodeInfo,
    },
}


// ============================================================================
// Session state
// ============================================================================

struct PeerConn {
    session: SessionRef,
    outbound: bool,
    /// Identity the outbound request was meant for.
    expected: Option<Identity>,
    opened_at: Instant,
    last_message: Instant,
    last_ping: Instant,
    our_rand: u64,
    our_challenge: Option<String>,
    challenge_solved: bool,
    rand_echoed: bool,
    node: Option<NodeInfo>,
    endpoint: Option<AddressCandidate>,
    verified: bool,
    /// Peer count the peer last reported.
    degree: Option<u32>,
}

impl PeerConn {
    fn identity(&self) -> Option<Identity> {
        self.node.as_ref().map(|n| n.identity)
    }

    fn is_handshake_complete(&self) -> bool {
        self.node.is_some() && self.rand_echoed && self.challenge_solved
    }
}

struct OverlayTimers {
    last_peer_seen: Instant,
    last_get_peers: Instant,
    last_refresh: Instant,
}


// ============================================================================
// P2PService
// ============================================================================

pub struct P2PService {
    keypair: Keypair,
    config: OverlayConfig,
    challenge_enabled: bool,
    /// Neighbours a forwarded request is handed to.
    alpha: usize,
    local: LocalEndpoints,
    node: RwLock<NodeInfo>,
    requests: ConnectionRequests<PeerContext>,
    neighbors: RwLock<NeighborTable>,
    conns: RwLock<HashMap<SessionId, PeerConn>>,
    peers: RwLock<HashMap<Identity, SessionId>>,
    connecting: RwLock<HashMap<Identity, RequestId>>,
    free_peers: RwLock<HashMap<Identity, NodeInfo>>,
    gate: Mutex<ChallengeGate>,
    bans: Mutex<LruCache<Identity, Instant>>,
    limiter: Mutex<InsertionLimiter>,
    seen_forwards: Mutex<LruCache<RequestId, ()>>,
    suggested_host: RwLock<Option<String>>,
    timers: Mutex<OverlayTimers>,
    events: mpsc::Sender<OverlayEvent>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for P2PService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PService")
            .field("identity", &self.keypair.identity())
            .finish()
    }
}

struct OverlayHandler {
    service: Weak<P2PService>,
}

#[async_trait]
impl ConnectionHandler<PeerContext> for OverlayHandler {
    async fn established(&self, _request: RequestId, session: SessionRef, ctx: PeerContext) {
        match self.service.upgrade() {
            Some(service) => service.attach(session, true, ctx.identity).await,
            None => session.close().await,
        }
    }

    async fn final_failure(&self, _request: RequestId, ctx: PeerContext) {
        if let (Some(service), Some(identity)) = (self.service.upgrade(), ctx.identity) {
            service.connect_failed(identity).await;
        }
    }
}

#[async_trait]
impl ListenHandler<PeerContext> for OverlayHandler {
    async fn established(&self, port: u16, mut incoming: mpsc::Receiver<SessionRef>, _ctx: PeerContext) {
        if let Some(service) = self.service.upgrade() {
            service.listening(port).await;
        }
        let weak = self.service.clone();
        tokio::spawn(async move {
            while let Some(session) = incoming.recv().await {
                let Some(service) = weak.upgrade() else {
                    session.close().await;
                    break;
                };
                service.attach(session, false, None).await;
            }
        });
    }

    async fn failure(&self, _ctx: PeerContext) {
        warn!("overlay could not bind any port in its range");
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl P2PService {
    pub fn new(
        keypair: Keypair,
        config: &NodeConfig,
        dialer: Arc<dyn Dialer>,
        binder: Arc<dyn Binder>,
        local: LocalEndpoints,
        node: NodeInfo,
    ) -> (Arc<Self>, mpsc::Receiver<OverlayEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let identity = keypair.identity();
        let now = Instant::now();

        let service = Arc::new_cyclic(|weak: &Weak<P2PService>| {
            let handler = Arc::new(OverlayHandler { service: weak.clone() });
            let handlers = HandlerTable::new()
                .on_connect(RequestKind::PeerConnect, handler.clone())
                .on_listen(ListenKind::Overlay, handler);
            let requests = ConnectionRequests::spawn(
                config.connections.clone(),
                dialer,
                binder,
                local.clone(),
                handlers,
            );

            P2PService {
                keypair,
                config: config.overlay.clone(),
                challenge_enabled: config.challenge.enabled,
                alpha: config.neighbors.alpha.max(1),
                local,
                node: RwLock::new(node),
                requests,
                neighbors: RwLock::new(NeighborTable::new(identity, config.neighbors.clone())),
                conns: RwLock::new(HashMap::new()),
                peers: RwLock::new(HashMap::new()),
                connecting: RwLock::new(HashMap::new()),
                free_peers: RwLock::new(HashMap::new()),
                gate: Mutex::new(ChallengeGate::new(config.challenge.difficulty)),
                bans: Mutex::new(LruCache::new(nonzero(config.overlay.max_tracked_bans))),
                limiter: Mutex::new(InsertionLimiter::new()),
                seen_forwards: Mutex::new(LruCache::new(nonzero(MAX_TRACKED_FORWARDS))),
                suggested_host: RwLock::new(None),
                timers: Mutex::new(OverlayTimers {
                    last_peer_seen: now,
                    last_get_peers: now,
                    last_refresh: now,
                }),
                events,
                sync_task: Mutex::new(None),
            }
        });
        (service, events_rx)
    }

    /// Binds the overlay port, dials the seeds and starts maintenance.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.requests
            .listen(
                ListenKind::Overlay,
                self.config.port_start,
                self.config.port_end,
                None,
                PeerContext::default(),
            )
            .await
            .context("failed to request overlay listening port")?;
        self.connect_to_seeds().await?;

        let this = Arc::downgrade(self);
        let period = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(service) = this.upgrade() else { break };
                service.sync_network().await;
            }
        });
        *self.sync_task.lock().await = Some(handle);
        Ok(())
    }

    pub async fn quit(&self) {
        if let Some(handle) = self.sync_task.lock().await.take() {
            handle.abort();
        }
        let sessions: Vec<SessionId> = self.conns.read().await.keys().copied().collect();
        for sid in sessions {
            self.disconnect(sid, DisconnectReason::NoMoreMessages).await;
        }
        self.requests.quit().await;
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub async fn node_info(&self) -> NodeInfo {
        self.node.read().await.clone()
    }

    pub async fn update_node_info<F: FnOnce(&mut NodeInfo)>(&self, update: F) {
        update(&mut *self.node.write().await);
    }

    /// Host our peers see us connecting from, as last reported in a nonce echo.
    pub async fn suggested_host(&self) -> Option<String> {
        self.suggested_host.read().await.clone()
    }

    pub fn requests(&self) -> &ConnectionRequests<PeerContext> {
        &self.requests
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_connected(&self, id: &Identity) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// Verified peers.
    pub async fn peers(&self) -> Vec<NodeInfo> {
        let conns = self.conns.read().await;
        conns
            .values()
            .filter(|c| c.verified)
            .filter_map(|c| c.node.clone())
            .collect()
    }

    /// Peer counts our peers last reported, by peer.
    pub async fn peers_degree(&self) -> HashMap<Identity, u32> {
        let conns = self.conns.read().await;
        conns
            .values()
            .filter(|c| c.verified)
            .filter_map(|c| Some((c.identity()?, c.degree?)))
            .collect()
    }

    pub async fn peer_info(&self, id: &Identity) -> Option<NodeInfo> {
        let sid = *self.peers.read().await.get(id)?;
        self.conns.read().await.get(&sid).and_then(|c| c.node.clone())
    }

    /// Address the overlay session with `id` runs over.
    pub async fn peer_endpoint(&self, id: &Identity) -> Option<AddressCandidate> {
        let sid = *self.peers.read().await.get(id)?;
        self.conns.read().await.get(&sid).and_then(|c| c.endpoint.clone())
    }

    /// Known but unconnected peers.
    pub async fn free_peers(&self) -> Vec<NodeInfo> {
        self.free_peers.read().await.values().cloned().collect()
    }

    pub async fn neighbours(&self, target: &Identity, k: usize) -> Vec<NodeInfo> {
        self.neighbors
            .read()
            .await
            .neighbours(target, k)
            .into_iter()
            .map(|r| r.node)
            .collect()
    }

    pub async fn neighbor_count(&self) -> usize {
        self.neighbors.read().await.len()
    }

    /// Connected supernode nearest to `target`; a mediator it can reach us through.
    pub async fn connected_supernode_near(&self, target: &Identity) -> Option<NodeInfo> {
        self.peers()
            .await
            .into_iter()
            .filter(|n| n.is_supernode())
            .min_by(|a, b| distance_cmp(&a.identity.xor_distance(target), &b.identity.xor_distance(target)))
    }

    /// Last known supernode near `target` from the neighbor table.
    pub async fn supernode_near(&self, target: &Identity) -> Option<NodeInfo> {
        self.neighbors
            .read()
            .await
            .supernodes_near(target, 1)
            .into_iter()
            .next()
            .map(|r| r.node)
    }

    pub async fn is_banned(&self, id: &Identity) -> bool {
        let mut bans = self.bans.lock().await;
        match bans.get(id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                bans.pop(id);
                false
            }
            None => false,
        }
    }

    async fn ban(&self, id: Identity) {
        debug!(peer = %id.short(), "banning peer");
        self.bans
            .lock()
            .await
            .put(id, Instant::now() + self.config.ban_duration);
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    pub async fn connect_to_seeds(&self) -> Result<()> {
        for seed in &self.config.seeds {
            if self.local.is_self(seed) {
                continue;
            }
            debug!(seed = %seed, "connecting to seed");
            self.requests
                .connect(RequestKind::PeerConnect, vec![seed.clone()], PeerContext::default())
                .await?;
        }
        Ok(())
    }

    /// Opens an overlay session to a known node. Returns `None` when the node
    /// is ourselves, connected, being connected or banned.
    pub async fn connect(&self, node: &NodeInfo) -> Result<Option<RequestId>> {
        let id = node.identity;
        if id == self.identity()
            || self.is_connected(&id).await
            || self.connecting.read().await.contains_key(&id)
            || self.is_banned(&id).await
        {
            return Ok(None);
        }
        let candidates = node.p2p_candidates();
        if candidates.is_empty() {
            return Ok(None);
        }
        let request = self
            .requests
            .connect(RequestKind::PeerConnect, candidates, PeerContext { identity: Some(id) })
            .await?;
        self.connecting.write().await.insert(id, request);
        debug!(peer = %id.short(), request = %request, "connecting to peer");
        Ok(Some(request))
    }

    async fn connect_failed(&self, id: Identity) {
        self.connecting.write().await.remove(&id);
        self.free_peers.write().await.remove(&id);
        debug!(peer = %id.short(), "peer unreachable");
    }

    async fn listening(&self, port: u16) {
        let mut node = self.node.write().await;
        node.p2p_prv_port = Some(port);
        if node.pub_addr.is_some() && node.p2p_pub_port.is_none() {
            node.p2p_pub_port = Some(port);
        }
        info!(port, peer = %node.identity.short(), "overlay listening");
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    async fn attach(self: &Arc<Self>, session: SessionRef, outbound: bool, expected: Option<Identity>) {
        let sid = session.id();
        let now = Instant::now();
        let our_rand: u64 = rand::random();
        let (challenge, difficulty) = if self.challenge_enabled {
            let mut gate = self.gate.lock().await;
            (Some(gate.issue()), gate.difficulty())
        } else {
            (None, 0)
        };

        self.conns.write().await.insert(
            sid,
            PeerConn {
                session: session.clone(),
                outbound,
                expected,
                opened_at: now,
                last_message: now,
                last_ping: now,
                our_rand,
                challenge_solved: challenge.is_none(),
                our_challenge: challenge.clone(),
                rand_echoed: false,
                node: None,
                endpoint: None,
                verified: false,
                degree: None,
            },
        );
        trace!(session = sid, outbound, "overlay session attached");

        let node = self.node_info().await;
        let hello = Hello {
            protocol_id: self.config.protocol_id,
            port: node.p2p_prv_port.unwrap_or(0),
            node_info: node,
            rand_val: our_rand,
            challenge,
            difficulty,
        };
        match hello.sign(&self.keypair) {
            Ok(signed) => self.send(&session, &Message::Hello(signed)).await,
            Err(e) => {
                warn!(error = %e, "failed to sign Hello");
                session.close().await;
                self.forget(sid).await;
                return;
            }
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(frame) = session.recv().await {
                let Some(service) = weak.upgrade() else { break };
                match Message::decode(&frame) {
                    Ok(message) => service.handle_message(sid, message).await,
                    Err(e) => {
                        debug!(session = sid, error = %e, "undecodable overlay frame");
                        service.disconnect(sid, DisconnectReason::BadProtocol).await;
                        break;
                    }
                }
            }
            if let Some(service) = weak.upgrade() {
                service.forget(sid).await;
            }
        });
    }

    async fn send(&self, session: &SessionRef, message: &Message) {
        match message.encode() {
            Ok(frame) => {
                if let Err(e) = session.send(frame).await {
                    trace!(session = session.id(), message = message.name(), error = %e, "overlay send failed");
                }
            }
            Err(e) => warn!(message = message.name(), error = %e, "failed to encode message"),
        }
    }

    async fn session_of(&self, sid: SessionId) -> Option<SessionRef> {
        self.conns.read().await.get(&sid).map(|c| c.session.clone())
    }

    async fn send_on(&self, sid: SessionId, message: &Message) {
        if let Some(session) = self.session_of(sid).await {
            self.send(&session, message).await;
        }
    }

    /// Sends to a verified peer.
    pub async fn send_to(&self, id: &Identity, message: &Message) -> Result<()> {
        let sid = *self
            .peers
            .read()
            .await
            .get(id)
            .ok_or_else(|| anyhow!("peer {} is not connected", id.short()))?;
        let session = self
            .session_of(sid)
            .await
            .ok_or_else(|| anyhow!("peer {} is not connected", id.short()))?;
        let frame = message.encode()?;
        session
            .send(frame)
            .await
            .with_context(|| format!("failed to send {} to {}", message.name(), id.short()))
    }

    pub async fn disconnect_peer(&self, id: &Identity, reason: DisconnectReason) {
        let sid = self.peers.read().await.get(id).copied();
        if let Some(sid) = sid {
            self.disconnect(sid, reason).await;
        }
    }

    async fn disconnect(&self, sid: SessionId, reason: DisconnectReason) {
        let Some((session, peer)) = self
            .conns
            .read()
            .await
            .get(&sid)
            .map(|c| (c.session.clone(), c.identity()))
        else {
            return;
        };
        debug!(
            session = sid,
            peer = %peer.map(|p| p.short()).unwrap_or_default(),
            reason = ?reason,
            "disconnecting"
        );
        if reason == DisconnectReason::Unverified {
            if let Some(peer) = peer {
                self.ban(peer).await;
            }
        }
        self.send(&session, &Message::Disconnect { reason }).await;
        session.close().await;
        self.forget(sid).await;
    }

    async fn forget(&self, sid: SessionId) {
        let Some(conn) = self.conns.write().await.remove(&sid) else {
            return;
        };
        if !conn.session.is_closed() {
            conn.session.close().await;
        }
        if let Some(expected) = conn.expected {
            self.connecting.write().await.remove(&expected);
        }
        if !conn.verified {
            return;
        }
        let Some(id) = conn.identity() else { return };
        {
            let mut peers = self.peers.write().await;
            if peers.get(&id) != Some(&sid) {
                return;
            }
            peers.remove(&id);
        }
        info!(peer = %id.short(), "peer disconnected");
        self.emit(OverlayEvent::PeerDisconnected(id));
        self.send_degree().await;
    }

    fn emit(&self, event: OverlayEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "overlay event dropped");
        }
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    async fn handle_message(self: &Arc<Self>, sid: SessionId, message: Message) {
        let verified_peer = {
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&sid) else { return };
            conn.last_message = Instant::now();
            if conn.verified {
                conn.node.clone()
            } else {
                None
            }
        };
        if let Some(peer) = &verified_peer {
            self.neighbors.write().await.set_last_message_time(&peer.identity);
        }
        trace!(session = sid, message = message.name(), "overlay message");

        match message {
            Message::Hello(signed) => self.on_hello(sid, signed).await,
            Message::ChallengeSolution { solution } => self.on_challenge_solution(sid, solution).await,
            Message::ResendRandVal { rand_val, observed_host } => {
                self.on_rand_val(sid, rand_val, observed_host).await
            }
            Message::Disconnect { reason } => self.on_disconnect(sid, reason).await,
            other => match verified_peer {
                Some(peer) => self.on_peer_message(sid, peer, other).await,
                None => trace!(session = sid, message = other.name(), "ignoring message before verification"),
            },
        }
    }

    async fn on_peer_message(self: &Arc<Self>, sid: SessionId, peer: NodeInfo, message: Message) {
        match message {
            Message::Ping => self.send_on(sid, &Message::Pong).await,
            Message::Pong => {
                self.neighbors.write().await.pong_received(&peer.identity);
            }
            Message::GetPeers => {
                let peers = self.peers_for(&peer.identity).await;
                self.send_on(sid, &Message::Peers { peers }).await;
            }
            Message::Peers { peers } => self.on_peers(peer.identity, peers).await,
            Message::Degree { degree } => {
                if let Some(conn) = self.conns.write().await.get_mut(&sid) {
                    conn.degree = Some(degree);
                }
            }
            Message::FindNode { target } => {
                let peers: Vec<NodeInfo> = self
                    .neighbours(&target, MAX_PEERS_PER_MESSAGE)
                    .await
                    .into_iter()
                    .filter(|n| n.identity != peer.identity)
                    .collect();
                self.send_on(sid, &Message::Peers { peers }).await;
            }
            Message::WantToStartTaskSession {
                target,
                requestor,
                conn_id,
                supernode,
                ttl,
            } => {
                self.on_want_to_start(peer.identity, target, requestor, conn_id, supernode, ttl)
                    .await
            }
            Message::WaitForNatTraverse {
                rendezvous,
                asking,
                asking_addr,
                conn_id,
            } => self.emit(OverlayEvent::WaitForNatTraverse {
                rendezvous,
                asking,
                asking_addr,
                conn_id,
                mediator: peer,
            }),
            Message::NatPunchListening { rendezvous, port } => {
                let endpoint = self.conns.read().await.get(&sid).and_then(|c| c.endpoint.clone());
                match endpoint {
                    Some(endpoint) => self.emit(OverlayEvent::NatPunchListening {
                        rendezvous,
                        from: peer.identity,
                        endpoint,
                        port,
                    }),
                    None => debug!(rendezvous = %rendezvous, "punch port reported by peer without endpoint"),
                }
            }
            Message::JoinMiddleman {
                rendezvous,
                asking,
                conn_id,
            } => self.emit(OverlayEvent::JoinMiddleman {
                rendezvous,
                asking,
                conn_id,
                mediator: peer,
            }),
            other => debug!(
                peer = %peer.identity.short(),
                message = other.name(),
                "unexpected message on overlay session"
            ),
        }
    }

    async fn on_hello(&self, sid: SessionId, signed: SignedHello) {
        let Some(session) = self.session_of(sid).await else { return };
        if self
            .conns
            .read()
            .await
            .get(&sid)
            .map(|c| c.node.is_some())
            .unwrap_or(true)
        {
            trace!(session = sid, "repeated Hello ignored");
            return;
        }

        if let Err(e) = signed.verify() {
            debug!(session = sid, error = %e, "Hello signature rejected");
            self.disconnect(sid, DisconnectReason::Unverified).await;
            return;
        }
        let hello = signed.hello;
        let id = hello.node_info.identity;

        if hello.protocol_id != self.config.protocol_id {
            debug!(peer = %id.short(), theirs = hello.protocol_id, ours = self.config.protocol_id, "protocol mismatch");
            self.disconnect(sid, DisconnectReason::ProtocolVersion).await;
            return;
        }
        if id == self.identity() {
            self.disconnect(sid, DisconnectReason::SelfConnection).await;
            return;
        }
        if self.is_banned(&id).await {
            self.disconnect(sid, DisconnectReason::Unverified).await;
            return;
        }
        let connected = self.is_connected(&id).await;
        if connected && !self.supersedes(sid, &id).await {
            self.disconnect(sid, DisconnectReason::DuplicatePeers).await;
            return;
        }
        if !connected && self.peer_count().await >= self.config.optimal_peer_count {
            let peers = self.peers_for(&id).await;
            self.send(&session, &Message::Peers { peers }).await;
            self.disconnect(sid, DisconnectReason::TooManyPeers).await;
            return;
        }
        if hello.challenge.is_some() && hello.difficulty > MAX_SOLVE_DIFFICULTY {
            debug!(peer = %id.short(), difficulty = hello.difficulty, "challenge too hard");
            self.disconnect(sid, DisconnectReason::BadProtocol).await;
            return;
        }

        let observed = session.peer_addr();
        let endpoint = match &observed {
            Some(addr) if hello.port != 0 => addr.with_port(hello.port).ok().or_else(|| observed.clone()),
            _ => observed.clone(),
        };
        {
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&sid) else { return };
            conn.node = Some(hello.node_info.clone());
            conn.endpoint = endpoint;
        }
        debug!(peer = %id.short(), session = sid, "Hello accepted");

        self.send(
            &session,
            &Message::ResendRandVal {
                rand_val: hello.rand_val,
                observed_host: observed.map(|a| a.host().to_string()),
            },
        )
        .await;

        if let Some(challenge) = hello.challenge {
            let difficulty = hello.difficulty;
            let solved = tokio::task::spawn_blocking(move || solve_challenge(&challenge, difficulty)).await;
            match solved {
                Ok((solution, elapsed)) => {
                    trace!(peer = %id.short(), difficulty, elapsed_ms = elapsed.as_millis() as u64, "challenge solved");
                    self.send(&session, &Message::ChallengeSolution { solution }).await;
                }
                Err(e) => warn!(peer = %id.short(), error = %e, "challenge solver failed"),
            }
        }

        self.try_verify(sid).await;
    }

    async fn on_rand_val(&self, sid: SessionId, rand_val: u64, observed_host: Option<String>) {
        let matches = {
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&sid) else { return };
            let matches = conn.our_rand == rand_val;
            if matches {
                conn.rand_echoed = true;
            }
            matches
        };
        if !matches {
            self.disconnect(sid, DisconnectReason::Unverified).await;
            return;
        }
        if let Some(host) = observed_host {
            let mut suggested = self.suggested_host.write().await;
            if suggested.as_deref() != Some(host.as_str()) {
                debug!(host = %host, "peer suggested our address");
                *suggested = Some(host);
            }
        }
        self.try_verify(sid).await;
    }

    async fn on_challenge_solution(&self, sid: SessionId, solution: u64) {
        let challenge = {
            let conns = self.conns.read().await;
            let Some(conn) = conns.get(&sid) else { return };
            if conn.challenge_solved {
                return;
            }
            conn.our_challenge.clone()
        };
        let Some(challenge) = challenge else { return };

        if !self.gate.lock().await.verify(&challenge, solution) {
            debug!(session = sid, "wrong challenge solution");
            self.disconnect(sid, DisconnectReason::Unverified).await;
            return;
        }
        if let Some(conn) = self.conns.write().await.get_mut(&sid) {
            conn.challenge_solved = true;
        }
        self.try_verify(sid).await;
    }

    async fn on_disconnect(&self, sid: SessionId, reason: DisconnectReason) {
        let peer = self.conns.read().await.get(&sid).and_then(|c| c.identity().or(c.expected));
        debug!(session = sid, reason = ?reason, "peer disconnected us");
        if reason == DisconnectReason::TooManyPeers {
            if let Some(peer) = peer {
                self.ban(peer).await;
            }
        }
        if let Some(session) = self.session_of(sid).await {
            session.close().await;
        }
        self.forget(sid).await;
    }

    async fn try_verify(&self, sid: SessionId) {
        let (node, endpoint, session, outbound) = {
            let mut conns = self.conns.write().await;
            let Some(conn) = conns.get_mut(&sid) else { return };
            if conn.verified || !conn.is_handshake_complete() {
                return;
            }
            let (Some(node), Some(endpoint)) = (conn.node.clone(), conn.endpoint.clone()) else {
                return;
            };
            conn.verified = true;
            (node, endpoint, conn.session.clone(), conn.outbound)
        };
        let id = node.identity;

        let current = self.peers.read().await.get(&id).copied();
        if current.is_some() && !self.supersedes(sid, &id).await {
            if let Some(conn) = self.conns.write().await.get_mut(&sid) {
                conn.verified = false;
            }
            self.disconnect(sid, DisconnectReason::DuplicatePeers).await;
            return;
        }
        self.peers.write().await.insert(id, sid);
        if let Some(old) = current {
            debug!(peer = %id.short(), old, new = sid, "session replaces duplicate");
            self.disconnect(old, DisconnectReason::DuplicatePeers).await;
        }

        let pending = self.connecting.write().await.remove(&id);
        if let (Some(request), false) = (pending, outbound) {
            self.settle_by_inbound(request, endpoint.clone()).await;
        }
        self.free_peers.write().await.remove(&id);
        self.timers.lock().await.last_peer_seen = Instant::now();

        let to_ping = self.neighbors.write().await.add_peer(node.clone(), endpoint.clone());
        if let Some(PeerToPing { identity, .. }) = to_ping {
            if let Some(psid) = self.peers.read().await.get(&identity).copied() {
                self.send_on(psid, &Message::Ping).await;
            }
        }

        info!(
            peer = %id.short(),
            endpoint = %endpoint,
            session = session.id(),
            outbound,
            supernode = node.is_supernode(),
            "peer verified"
        );
        self.emit(OverlayEvent::PeerVerified(node));
        self.send_degree().await;
    }

    /// Tells every peer how many peers we have.
    async fn send_degree(&self) {
        let sids: Vec<SessionId> = self.peers.read().await.values().copied().collect();
        let degree = Message::Degree {
            degree: u32::try_from(sids.len()).unwrap_or(u32::MAX),
        };
        for sid in sids {
            self.send_on(sid, &degree).await;
        }
    }

    /// Whether `sid` should take the place of the current session to `id`.
    /// Of two sessions between the same pair, both ends keep the one dialed
    /// by the lower identity.
    async fn supersedes(&self, sid: SessionId, id: &Identity) -> bool {
        let Some(current) = self.peers.read().await.get(id).copied() else {
            return true;
        };
        if current == sid {
            return false;
        }
        let lower = self.identity().min(*id);
        let me = self.identity();
        let conns = self.conns.read().await;
        let dialed_by_lower = |s: SessionId| {
            conns
                .get(&s)
                .map(|c| if c.outbound { me == lower } else { *id == lower })
                .unwrap_or(false)
        };
        dialed_by_lower(sid) && !dialed_by_lower(current)
    }

    /// The peer reached us while our own request to it was still pending.
    async fn settle_by_inbound(&self, request: RequestId, endpoint: AddressCandidate) {
        match self.requests.mark_connected(request, endpoint).await {
            Ok(true) => debug!(request = %request, "outbound request satisfied by inbound session"),
            Ok(false) => {}
            Err(e) => {
                debug!(request = %request, error = %e, "failed to mark request connected");
                return;
            }
        }
        if let Err(e) = self.requests.verified(request).await {
            debug!(request = %request, error = %e, "failed to release request");
        }
    }

    async fn peers_for(&self, exclude: &Identity) -> Vec<NodeInfo> {
        let mut peers: Vec<NodeInfo> = self
            .peers()
            .await
            .into_iter()
            .filter(|n| &n.identity != exclude)
            .collect();
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(MAX_PEERS_PER_MESSAGE);
        peers
    }

    async fn on_peers(&self, from: Identity, peers: Vec<NodeInfo>) {
        let me = self.identity();
        for node in peers {
            let id = node.identity;
            if id == me || self.is_connected(&id).await {
                continue;
            }
            if !self.limiter.lock().await.allow_insertion(&from) {
                trace!(from = %from.short(), "peer insertion rate limited");
                break;
            }
            let mut free = self.free_peers.write().await;
            if free.len() < MAX_FREE_PEERS || free.contains_key(&id) {
                free.insert(id, node);
            }
        }
    }

    /// Asks the overlay to deliver a start-session request to `target`.
    /// Returns the number of peers the request was handed to.
    pub async fn want_to_start_task_session(
        &self,
        target: Identity,
        requestor: NodeInfo,
        conn_id: RequestId,
        supernode: Option<NodeInfo>,
    ) -> Result<usize> {
        self.seen_forwards.lock().await.put(conn_id, ());
        let message = Message::WantToStartTaskSession {
            target,
            requestor,
            conn_id,
            supernode,
            ttl: FORWARD_TTL,
        };
        let sent = self.route(&target, &message, None).await;
        if sent == 0 {
            bail!("no overlay route towards {}", target.short());
        }
        Ok(sent)
    }

    async fn on_want_to_start(
        &self,
        from: Identity,
        target: Identity,
        requestor: NodeInfo,
        conn_id: RequestId,
        supernode: Option<NodeInfo>,
        ttl: u8,
    ) {
        if self.seen_forwards.lock().await.put(conn_id, ()).is_some() {
            trace!(request = %conn_id, "start-session request already seen");
            return;
        }
        if target == self.identity() {
            debug!(requestor = %requestor.identity.short(), request = %conn_id, "start-session requested");
            self.emit(OverlayEvent::StartSessionRequested {
                requestor,
                conn_id,
                supernode,
            });
            return;
        }
        if ttl == 0 {
            return;
        }
        let message = Message::WantToStartTaskSession {
            target,
            requestor,
            conn_id,
            supernode,
            ttl: ttl - 1,
        };
        let sent = self.route(&target, &message, Some(from)).await;
        trace!(request = %conn_id, sent, "forwarded start-session request");
    }

    /// Sends directly when `target` is a peer, otherwise to the connected
    /// neighbours nearest to it.
    async fn route(&self, target: &Identity, message: &Message, exclude: Option<Identity>) -> usize {
        if self.is_connected(target).await {
            return usize::from(self.send_to(target, message).await.is_ok());
        }
        let alpha = self.alpha;
        let mut sent = 0;
        for node in self.neighbours(target, alpha * 2).await {
            if Some(node.identity) == exclude || !self.is_connected(&node.identity).await {
                continue;
            }
            if self.send_to(&node.identity, message).await.is_ok() {
                sent += 1;
            }
            if sent >= alpha {
                break;
            }
        }
        sent
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One maintenance round; runs every `sync_interval` once started.
    pub async fn sync_network(self: &Arc<Self>) {
        let now = Instant::now();

        let (stale_handshakes, silent, to_ping) = {
            let mut conns = self.conns.write().await;
            let mut stale = Vec::new();
            let mut silent = Vec::new();
            let mut to_ping = Vec::new();
            let keepalive = self.config.session_timeout / 4;
            for (sid, conn) in conns.iter_mut() {
                if !conn.verified {
                    if now.saturating_duration_since(conn.opened_at) > self.config.handshake_timeout {
                        stale.push(*sid);
                    }
                } else if now.saturating_duration_since(conn.last_message) > self.config.session_timeout {
                    silent.push(*sid);
                } else if now.saturating_duration_since(conn.last_message) > keepalive
                    && now.saturating_duration_since(conn.last_ping) > keepalive
                {
                    conn.last_ping = now;
                    to_ping.push(*sid);
                }
            }
            (stale, silent, to_ping)
        };
        for sid in stale_handshakes {
            debug!(session = sid, "handshake deadline passed");
            self.disconnect(sid, DisconnectReason::Timeout).await;
        }
        for sid in silent {
            self.disconnect(sid, DisconnectReason::Timeout).await;
        }
        for sid in to_ping {
            self.send_on(sid, &Message::Ping).await;
        }

        let outcome = self.neighbors.write().await.sync();
        for (target, records) in outcome.peers_to_find {
            for record in records {
                let id = record.node.identity;
                if self.is_connected(&id).await {
                    if let Err(e) = self.send_to(&id, &Message::FindNode { target }).await {
                        debug!(peer = %id.short(), error = %e, "failed to send FindNode");
                    }
                }
            }
        }
        for id in outcome.sessions_to_end {
            self.disconnect_peer(&id, DisconnectReason::Timeout).await;
        }

        self.connect_to_free_peers().await;

        let (ask_peers, reconnect_seeds, refresh) = {
            let mut timers = self.timers.lock().await;
            let ask = now.saturating_duration_since(timers.last_get_peers) > self.config.get_peers_interval;
            if ask {
                timers.last_get_peers = now;
            }
            let refresh = now.saturating_duration_since(timers.last_refresh) > self.config.refresh_interval;
            if refresh {
                timers.last_refresh = now;
            }
            let connected = !self.peers.read().await.is_empty();
            if connected {
                timers.last_peer_seen = now;
            }
            let reconnect = !connected
                && now.saturating_duration_since(timers.last_peer_seen) > self.config.seed_reconnect_threshold;
            if reconnect {
                timers.last_peer_seen = now;
            }
            (ask, reconnect, refresh)
        };
        if ask_peers {
            let ids: Vec<Identity> = self.peers.read().await.keys().copied().collect();
            for id in ids {
                if let Err(e) = self.send_to(&id, &Message::GetPeers).await {
                    debug!(peer = %id.short(), error = %e, "failed to ask for peers");
                }
            }
        }
        if refresh {
            self.refresh_peer(now).await;
        }
        if reconnect_seeds {
            info!("no peers for a while, reconnecting to seeds");
            if let Err(e) = self.connect_to_seeds().await {
                warn!(error = %e, "seed reconnect failed");
            }
        }
    }

    /// With a full peer set, drops one random peer that has been connected
    /// for a whole refresh interval. Its record goes back to the free peers.
    async fn refresh_peer(&self, now: Instant) {
        let count = self.peer_count().await;
        if count < self.config.optimal_peer_count || count < 2 {
            return;
        }
        let sids: Vec<SessionId> = self.peers.read().await.values().copied().collect();
        let old: Vec<(SessionId, NodeInfo)> = {
            let conns = self.conns.read().await;
            sids.into_iter()
                .filter_map(|sid| {
                    let conn = conns.get(&sid)?;
                    if now.saturating_duration_since(conn.opened_at) < self.config.refresh_interval {
                        return None;
                    }
                    Some((sid, conn.node.clone()?))
                })
                .collect()
        };
        let Some((sid, node)) = old.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        info!(peer = %node.identity.short(), "refreshing peer");
        self.disconnect(sid, DisconnectReason::Refresh).await;
        self.free_peers.write().await.insert(node.identity, node);
    }

    async fn connect_to_free_peers(&self) {
        let active = self.peer_count().await + self.connecting.read().await.len();
        if active >= self.config.optimal_peer_count {
            return;
        }
        let mut candidates = self.free_peers().await;
        candidates.shuffle(&mut rand::thread_rng());
        let mut budget = self.config.optimal_peer_count - active;
        for node in candidates {
            if budget == 0 {
                break;
            }
            match self.connect(&node).await {
                Ok(Some(_)) => budget -= 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to start peer connection");
                    break;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PROTOCOL_ID;
    use crate::transport::{Dialer, MemoryNetwork, Session};
    use std::time::Duration;

    fn config(port: u16) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.overlay.port_start = port;
        config.overlay.port_end = port + 5;
        config.connections.tick_interval = Duration::from_millis(20);
        config.connections.dial_timeout = Duration::from_millis(200);
        config.challenge.difficulty = 4;
        config
    }

    struct Peer {
        service: Arc<P2PService>,
        events: mpsc::Receiver<OverlayEvent>,
    }

    async fn spawn_peer(network: &MemoryNetwork, host: &str, config: NodeConfig) -> Peer {
        let keypair = Keypair::generate();
        let transport = Arc::new(network.host(host));
        let local = LocalEndpoints::new();
        local.add_host(host);
        let mut node = NodeInfo::new(keypair.identity(), host);
        node.prv_addr = Some(host.to_string());
        let (service, events) = P2PService::new(keypair, &config, transport.clone(), transport, local, node);
        service.start().await.unwrap();
        Peer { service, events }
    }

    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn listening_port(service: &Arc<P2PService>) -> u16 {
        wait_for("overlay port", || async { service.node_info().await.p2p_prv_port.is_some() }).await;
        service.node_info().await.p2p_prv_port.unwrap_or_default()
    }

    #[tokio::test]
    async fn two_nodes_complete_the_handshake() {
        let network = MemoryNetwork::new();
        let mut a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let b = spawn_peer(&network, "198.51.100.2", config(42000)).await;
        listening_port(&a.service).await;
        listening_port(&b.service).await;

        let a_info = a.service.node_info().await;
        b.service.connect(&a_info).await.unwrap();

        let (sa, sb) = (a.service.clone(), b.service.clone());
        wait_for("verification", || {
            let (sa, sb) = (sa.clone(), sb.clone());
            async move { sa.peer_count().await == 1 && sb.peer_count().await == 1 }
        })
        .await;

        assert!(a.service.is_connected(&b.service.identity()).await);
        assert_eq!(b.service.suggested_host().await.as_deref(), Some("198.51.100.2"));
        assert_eq!(
            b.service.peer_endpoint(&a.service.identity()).await.unwrap().port(),
            a_info.p2p_prv_port.unwrap()
        );
        assert_eq!(a.service.neighbor_count().await, 1);

        let event = tokio::time::timeout(Duration::from_secs(2), a.events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, OverlayEvent::PeerVerified(n) if n.identity == b.service.identity()));
    }

    #[tokio::test]
    async fn simultaneous_dials_keep_one_session() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let b = spawn_peer(&network, "198.51.100.2", config(42000)).await;
        listening_port(&a.service).await;
        listening_port(&b.service).await;

        let (a_info, b_info) = (a.service.node_info().await, b.service.node_info().await);
        let (to_b, to_a) = tokio::join!(a.service.connect(&b_info), b.service.connect(&a_info));
        assert!(to_b.unwrap().is_some());
        assert!(to_a.unwrap().is_some());

        let (sa, sb) = (a.service.clone(), b.service.clone());
        wait_for("both sides settle on one session", || {
            let (sa, sb) = (sa.clone(), sb.clone());
            async move {
                sa.peer_count().await == 1
                    && sb.peer_count().await == 1
                    && sa.conns.read().await.len() == 1
                    && sb.conns.read().await.len() == 1
                    && sa.connecting.read().await.is_empty()
                    && sb.connecting.read().await.is_empty()
            }
        })
        .await;

        // Both ends agree on the survivor and it stays up.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.service.is_connected(&b.service.identity()).await);
        assert!(b.service.is_connected(&a.service.identity()).await);
        assert_eq!(a.service.conns.read().await.len(), 1);
        assert_eq!(b.service.conns.read().await.len(), 1);
        assert_eq!(a.service.requests().pending_count().await.unwrap(), 0);
        assert_eq!(b.service.requests().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn peers_report_their_degree() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let b = spawn_peer(&network, "198.51.100.2", config(42000)).await;
        let c = spawn_peer(&network, "198.51.100.3", config(43000)).await;
        listening_port(&a.service).await;
        let a_info = a.service.node_info().await;
        b.service.connect(&a_info).await.unwrap();
        c.service.connect(&a_info).await.unwrap();

        let (sa, sb, sc) = (a.service.clone(), b.service.clone(), c.service.clone());
        wait_for("degrees exchanged", || {
            let (sa, sb, sc) = (sa.clone(), sb.clone(), sc.clone());
            async move {
                let hub = sa.peers_degree().await;
                sb.peers_degree().await.get(&sa.identity()) == Some(&2)
                    && sc.peers_degree().await.get(&sa.identity()) == Some(&2)
                    && hub.get(&sb.identity()) == Some(&1)
                    && hub.get(&sc.identity()) == Some(&1)
            }
        })
        .await;
        assert_eq!(b.service.peers_degree().await.len(), 1);
    }

    #[tokio::test]
    async fn full_peer_set_is_refreshed() {
        let network = MemoryNetwork::new();
        let mut hub = config(41000);
        hub.overlay.optimal_peer_count = 2;
        hub.overlay.sync_interval = Duration::from_millis(20);
        hub.overlay.refresh_interval = Duration::from_millis(300);
        let mut a = spawn_peer(&network, "198.51.100.1", hub).await;
        let b = spawn_peer(&network, "198.51.100.2", config(42000)).await;
        let c = spawn_peer(&network, "198.51.100.3", config(43000)).await;
        for peer in [&a, &b, &c] {
            listening_port(&peer.service).await;
        }
        let a_info = a.service.node_info().await;
        b.service.connect(&a_info).await.unwrap();
        c.service.connect(&a_info).await.unwrap();

        let sa = a.service.clone();
        wait_for("full peer set", || {
            let sa = sa.clone();
            async move { sa.peer_count().await == 2 }
        })
        .await;

        let dropped = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), a.events.recv())
                .await
                .expect("no peer was refreshed")
                .unwrap();
            if let OverlayEvent::PeerDisconnected(id) = event {
                break id;
            }
        };
        assert!(dropped == b.service.identity() || dropped == c.service.identity());
        assert!(!a.service.is_banned(&dropped).await, "a refreshed peer is not banned");

        // The refreshed peer stays known and is dialed again.
        wait_for("refreshed peer reconnects", || {
            let sa = sa.clone();
            async move { sa.is_connected(&dropped).await }
        })
        .await;
    }

    /// Speaks the handshake by hand against a running service.
    async fn raw_session(network: &MemoryNetwork, target: &Arc<P2PService>) -> Arc<dyn Session> {
        let port = listening_port(target).await;
        let host = target.node_info().await.prv_addr.unwrap();
        let client = network.host("198.51.100.99");
        client
            .dial(&AddressCandidate::new(&host, port).unwrap(), Duration::from_secs(1))
            .await
            .unwrap()
    }

    async fn next_message(session: &Arc<dyn Session>) -> Option<Message> {
        let frame = tokio::time::timeout(Duration::from_secs(5), session.recv()).await.ok()??;
        Message::decode(&frame).ok()
    }

    async fn expect_disconnect(session: &Arc<dyn Session>) -> DisconnectReason {
        loop {
            match next_message(session).await {
                Some(Message::Disconnect { reason }) => return reason,
                Some(_) => continue,
                None => panic!("session ended without Disconnect"),
            }
        }
    }

    fn hello_from(keypair: &Keypair, protocol_id: u32) -> Message {
        let hello = Hello {
            protocol_id,
            node_info: NodeInfo::new(keypair.identity(), "raw"),
            port: 40000,
            rand_val: 1,
            challenge: None,
            difficulty: 0,
        };
        Message::Hello(hello.sign(keypair).unwrap())
    }

    #[tokio::test]
    async fn protocol_mismatch_is_refused() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let session = raw_session(&network, &a.service).await;

        let keypair = Keypair::generate();
        session
            .send(hello_from(&keypair, PROTOCOL_ID + 1).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(expect_disconnect(&session).await, DisconnectReason::ProtocolVersion);
    }

    #[tokio::test]
    async fn forged_hello_is_unverified() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let session = raw_session(&network, &a.service).await;

        let claimed = Keypair::generate();
        let mut forged = match hello_from(&claimed, PROTOCOL_ID) {
            Message::Hello(signed) => signed,
            _ => unreachable!(),
        };
        forged.hello.rand_val = 2;
        session.send(Message::Hello(forged).encode().unwrap()).await.unwrap();
        assert_eq!(expect_disconnect(&session).await, DisconnectReason::Unverified);
        // Unproven identities are not banned.
        assert!(!a.service.is_banned(&claimed.identity()).await);
    }

    #[tokio::test]
    async fn own_identity_is_refused() {
        let network = MemoryNetwork::new();
        let keypair = Keypair::generate();
        let transport = Arc::new(network.host("198.51.100.1"));
        let mut node = NodeInfo::new(keypair.identity(), "self");
        node.prv_addr = Some("198.51.100.1".into());
        let (service, _events) = P2PService::new(
            keypair.clone(),
            &config(41000),
            transport.clone(),
            transport,
            LocalEndpoints::new(),
            node,
        );
        service.start().await.unwrap();

        let session = raw_session(&network, &service).await;
        session
            .send(hello_from(&keypair, PROTOCOL_ID).encode().unwrap())
            .await
            .unwrap();
        assert_eq!(expect_disconnect(&session).await, DisconnectReason::SelfConnection);
    }

    #[tokio::test]
    async fn wrong_challenge_solution_bans_peer() {
        let network = MemoryNetwork::new();
        let mut cfg = config(41000);
        cfg.challenge.difficulty = 16;
        let a = spawn_peer(&network, "198.51.100.1", cfg).await;
        let session = raw_session(&network, &a.service).await;

        let challenge = match next_message(&session).await {
            Some(Message::Hello(signed)) => signed.hello.challenge.unwrap(),
            other => panic!("expected Hello, got {other:?}"),
        };
        let keypair = Keypair::generate();
        session
            .send(hello_from(&keypair, PROTOCOL_ID).encode().unwrap())
            .await
            .unwrap();

        let wrong = (0u64..)
            .find(|s| !crate::challenge::accept_challenge(&challenge, *s, 16))
            .unwrap();
        session
            .send(Message::ChallengeSolution { solution: wrong }.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(expect_disconnect(&session).await, DisconnectReason::Unverified);
        assert!(a.service.is_banned(&keypair.identity()).await);
        assert_eq!(a.service.peer_count().await, 0);
    }

    #[tokio::test]
    async fn full_table_sends_peers_then_refuses() {
        let network = MemoryNetwork::new();
        let mut cfg = config(41000);
        cfg.overlay.optimal_peer_count = 0;
        let a = spawn_peer(&network, "198.51.100.1", cfg).await;
        let session = raw_session(&network, &a.service).await;

        session
            .send(hello_from(&Keypair::generate(), PROTOCOL_ID).encode().unwrap())
            .await
            .unwrap();

        let mut saw_peers = false;
        loop {
            match next_message(&session).await {
                Some(Message::Peers { .. }) => saw_peers = true,
                Some(Message::Disconnect { reason }) => {
                    assert_eq!(reason, DisconnectReason::TooManyPeers);
                    break;
                }
                Some(_) => {}
                None => panic!("session ended without Disconnect"),
            }
        }
        assert!(saw_peers);
    }

    #[tokio::test]
    async fn stale_handshake_times_out() {
        let network = MemoryNetwork::new();
        let mut cfg = config(41000);
        cfg.overlay.handshake_timeout = Duration::from_millis(50);
        cfg.overlay.sync_interval = Duration::from_millis(20);
        let a = spawn_peer(&network, "198.51.100.1", cfg).await;
        let session = raw_session(&network, &a.service).await;

        // Never answer the Hello.
        assert_eq!(expect_disconnect(&session).await, DisconnectReason::Timeout);
    }

    #[tokio::test]
    async fn garbage_frame_is_bad_protocol() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let session = raw_session(&network, &a.service).await;

        session.send(vec![0xde, 0xad, 0xbe, 0xef, 0xff]).await.unwrap();
        assert_eq!(expect_disconnect(&session).await, DisconnectReason::BadProtocol);
    }

    #[tokio::test]
    async fn peers_from_unverified_sessions_are_ignored() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let session = raw_session(&network, &a.service).await;

        let stranger = NodeInfo::new(Keypair::generate().identity(), "x");
        session
            .send(Message::Peers { peers: vec![stranger] }.encode().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.service.free_peers().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let a = spawn_peer(&network, "198.51.100.1", config(41000)).await;
        let ghost = Keypair::generate().identity();
        assert!(a.service.send_to(&ghost, &Message::Ping).await.is_err());
        assert!(a
            .service
            .want_to_start_task_session(ghost, a.service.node_info().await, RequestId::random(), None)
            .await
            .is_err());
    }
}
