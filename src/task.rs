//! # Job Dispatch Sessions
//!
//! Opens the sessions that job dispatch runs over (task requests, results,
//! failure notices, resource transfers) and finds a route to nodes that
//! cannot be dialed directly.
//!
//! ## Routes
//!
//! | Order | Route | Used when |
//! |-------|-------|-----------|
//! | 1 | direct dial of every task candidate | always |
//! | 2 | rendezvous through the destination's supernode | the caller named one |
//! | 3 | reverse connection: the overlay forwards `WantToStartTaskSession` and the destination dials us | we have overlay peers |
//! | 4 | rendezvous through a supernode near the destination | one is known |
//!
//! A destination that cannot dial back escalates its start-session request
//! to a rendezvous through the supernode the requestor named.
//!
//! ## Session Opening
//!
//! The node that asked for the session always sends
//! `SessionHello { kind, conn_id }` as the first frame once its session is up,
//! whichever route produced it. The other side reads that frame and reports
//! a [`TaskEvent::IncomingSession`]. A node answering a start-session request
//! first sends `SessionHello { kind: StartSession, conn_id }` so the requestor
//! can hand the session to its parked request.
//!
//! ## Supernode Role
//!
//! The first frame of an inbound session may also be a mediation request:
//!
//! - `NatPunch`: ask the target over the overlay to open a punch port, then
//!   report the hole back with `NatHole`
//! - `Middleman`: register the session as the asking leg of a relay and ask
//!   the target to join
//! - `JoinMiddlemanConn`: the target's leg, which completes the relay

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::AddressCandidate;
use crate::config::{NodeConfig, RendezvousConfig, TaskConfig};
use crate::identity::{Identity, NodeInfo};
use crate::messages::Message;
use crate::p2p::{OverlayEvent, P2PService};
use crate::pending::{
    ConnectionHandler, ConnectionRequests, FailureAction, HandlerTable, ListenHandler, ListenKind, LocalEndpoints,
    RequestId, RequestKind,
};
use crate::relay::RelayHub;
use crate::rendezvous::{
    RendezvousAction, RendezvousCoordinator, RendezvousId, RendezvousMode, RendezvousSnapshot,
};
use crate::transport::{Binder, Dialer, SessionId, SessionRef};

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Time an inbound task session has to send its first frame.
pub const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `start` waits for the task port before announcing the node anyway.
const PORT_WAIT: Duration = Duration::from_secs(5);

const EVENT_QUEUE: usize = 256;

const SESSION_KINDS: [RequestKind; 5] = [
    RequestKind::TaskRequest,
    RequestKind::TaskResult,
    RequestKind::TaskFailure,
    RequestKind::ResourcePull,
    RequestKind::ResourcePush,
];


// ============================================================================
// Trust
// ============================================================================

/// Trust the marketplace assigns to other nodes, in `[-1.0, 1.0]`.
pub trait TrustSource: Send + Sync {
    fn provider_trust(&self, node: &Identity) -> f64;
    fn requestor_trust(&self, node: &Identity) -> f64;
}

/// Trusts everybody equally.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralTrust;

impl TrustSource for NeutralTrust {
    fn provider_trust(&self, _node: &Identity) -> f64 {
        0.0
    }

    fn requestor_trust(&self, _node: &Identity) -> f64 {
        0.0
    }
}

pub fn is_resource_kind(kind: RequestKind) -> bool {
    matches!(kind, RequestKind::ResourcePull | RequestKind::ResourcePush)
}

/// Kinds an application may open with [`TaskServer::connect`].
pub fn is_session_kind(kind: RequestKind) -> bool {
    SESSION_KINDS.contains(&kind)
}


// ============================================================================
// Contexts and events
// ============================================================================

/// What a task connection request is for.
#[derive(Debug, Clone)]
pub enum Job {
    /// Application session to `dest`.
    Session {
        kind: RequestKind,
        dest: NodeInfo,
        /// Supernode the destination is known to be connected to.
        supernode: Option<NodeInfo>,
    },
    /// Dialing back a requestor that could not reach us.
    StartSession {
        requestor: NodeInfo,
        conn_id: RequestId,
        supernode: Option<NodeInfo>,
    },
    /// Session to the supernode mediating a rendezvous we asked for.
    Mediator {
        rendezvous: RendezvousId,
        supernode: NodeInfo,
    },
    /// Dial of the hole a supernode reported.
    Traverse { rendezvous: RendezvousId },
    /// Our leg of a relay the supernode asked us to join.
    JoinRelay {
        rendezvous: RendezvousId,
        mediator: NodeInfo,
    },
    /// The main task port.
    Listen,
    /// Short-lived port opened for a punch.
    PunchListen {
        rendezvous: RendezvousId,
        mediator: Identity,
    },
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job: Job,
    /// Frames sent right after the session hello.
    pub respond_to: Vec<Vec<u8>>,
}

impl TaskContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            respond_to: Vec::new(),
        }
    }
}

pub enum TaskEvent {
    /// A session we asked for is up, by whichever route.
    SessionReady {
        request: RequestId,
        kind: RequestKind,
        peer: Identity,
        session: SessionRef,
    },
    /// A node opened a task session to us.
    IncomingSession {
        peer: Identity,
        kind: RequestKind,
        request: RequestId,
        session: SessionRef,
    },
    /// Every route to the destination failed.
    RequestFailed {
        request: RequestId,
        kind: RequestKind,
        peer: Identity,
    },
}

impl TaskEvent {
    fn session(&self) -> Option<&SessionRef> {
        match self {
            TaskEvent::SessionReady { session, .. } | TaskEvent::IncomingSession { session, .. } => Some(session),
            TaskEvent::RequestFailed { .. } => None,
        }
    }
}

impl fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskEvent::SessionReady {
                request,
                kind,
                peer,
                session,
            } => f
                .debug_struct("SessionReady")
                .field("request", request)
                .field("kind", kind)
                .field("peer", &peer.short())
                .field("session", &session.id())
                .finish(),
            TaskEvent::IncomingSession {
                peer,
                kind,
                request,
                session,
            } => f
                .debug_struct("IncomingSession")
                .field("peer", &peer.short())
                .field("kind", kind)
                .field("request", request)
                .field("session", &session.id())
                .finish(),
            TaskEvent::RequestFailed { request, kind, peer } => f
                .debug_struct("RequestFailed")
                .field("request", request)
                .field("kind", kind)
                .field("peer", &peer.short())
                .finish(),
        }
    }
}

/// A request waiting for the destination to dial back.
struct Forwarded {
    deadline: Instant,
    dest: Identity,
}

/// A punch this node mediates as supernode.
struct Mediation {
    asking: SessionRef,
    target: Identity,
    deadline: Instant,
}

async fn send_message(session: &SessionRef, message: &Message) -> Result<()> {
    let frame = message.encode()?;
    session
        .send(frame)
        .await
        .with_context(|| format!("failed to send {}", message.name()))
}

async fn refuse(session: &SessionRef, rendezvous: RendezvousId) {
    if let Err(e) = send_message(session, &Message::NatTraverseFailure { rendezvous }).await {
        debug!(rendezvous = %rendezvous, error = %e, "failed to refuse punch");
    }
    session.close().await;
}


// ============================================================================
// TaskServer
// ============================================================================

pub struct TaskServer {
    config: TaskConfig,
    rendezvous_config: RendezvousConfig,
    p2p: Arc<P2PService>,
    requests: ConnectionRequests<TaskContext>,
    coordinator: Mutex<RendezvousCoordinator<SessionRef>>,
    relay: RelayHub,
    trust: Arc<dyn TrustSource>,
    forwarded: Mutex<HashMap<RequestId, Forwarded>>,
    mediations: Mutex<HashMap<RendezvousId, Mediation>>,
    /// Mediator sessions closed on purpose; their watchers stay quiet.
    retired: Mutex<HashSet<SessionId>>,
    task_port: watch::Sender<Option<u16>>,
    events: mpsc::Sender<TaskEvent>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for TaskServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskServer")
            .field("identity", &self.p2p.identity().short())
            .field("task_port", &*self.task_port.borrow())
            .finish()
    }
}

struct TaskHandler {
    server: Weak<TaskServer>,
}

#[async_trait]
impl ConnectionHandler<TaskContext> for TaskHandler {
    async fn established(&self, request: RequestId, session: SessionRef, ctx: TaskContext) {
        match self.server.upgrade() {
            Some(server) => server.on_established(request, session, ctx).await,
            None => session.close().await,
        }
    }

    async fn failure(&self, request: RequestId, ctx: TaskContext) -> FailureAction {
        match self.server.upgrade() {
            Some(server) => server.on_failure(request, ctx).await,
            None => FailureAction::GiveUp,
        }
    }

    async fn final_failure(&self, request: RequestId, ctx: TaskContext) {
        if let Some(server) = self.server.upgrade() {
            server.on_final_failure(request, ctx).await;
        }
    }
}

#[async_trait]
impl ListenHandler<TaskContext> for TaskHandler {
    async fn established(&self, port: u16, incoming: mpsc::Receiver<SessionRef>, ctx: TaskContext) {
        if let Some(server) = self.server.upgrade() {
            server.on_listening(port, incoming, ctx).await;
        }
    }

    async fn failure(&self, ctx: TaskContext) {
        match ctx.job {
            Job::PunchListen { rendezvous, .. } => {
                debug!(rendezvous = %rendezvous, "no port free for the punch")
            }
            _ => warn!("task server could not bind any port in its range"),
        }
    }
}

impl TaskServer {
    pub fn new(
        config: &NodeConfig,
        p2p: Arc<P2PService>,
        dialer: Arc<dyn Dialer>,
        binder: Arc<dyn Binder>,
        local: LocalEndpoints,
        relay: RelayHub,
        trust: Arc<dyn TrustSource>,
    ) -> (Arc<Self>, mpsc::Receiver<TaskEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (task_port, _) = watch::channel(None);
        let placeholder = NodeInfo::new(p2p.identity(), config.name.clone());

        let server = Arc::new_cyclic(|weak: &Weak<TaskServer>| {
            let handler = Arc::new(TaskHandler { server: weak.clone() });
            let mut handlers = HandlerTable::new();
            for kind in SESSION_KINDS.into_iter().chain([
                RequestKind::StartSession,
                RequestKind::NatPunch,
                RequestKind::Middleman,
                RequestKind::NatTraverse,
            ]) {
                handlers = handlers.on_connect(kind, handler.clone());
            }
            let handlers = handlers
                .on_listen(ListenKind::Task, handler.clone())
                .on_listen(ListenKind::NatPunch, handler);

            TaskServer {
                config: config.task.clone(),
                rendezvous_config: config.rendezvous.clone(),
                requests: ConnectionRequests::spawn(config.connections.clone(), dialer, binder, local, handlers),
                coordinator: Mutex::new(RendezvousCoordinator::new(placeholder, &config.rendezvous)),
                p2p,
                relay,
                trust,
                forwarded: Mutex::new(HashMap::new()),
                mediations: Mutex::new(HashMap::new()),
                retired: Mutex::new(HashSet::new()),
                task_port,
                events,
                loops: Mutex::new(Vec::new()),
            }
        });
        (server, events_rx)
    }

    /// Binds the task port and starts serving overlay signals and timeouts.
    pub async fn start(self: &Arc<Self>, mut overlay: mpsc::Receiver<OverlayEvent>) -> Result<()> {
        self.requests
            .listen(
                ListenKind::Task,
                self.config.port_start,
                self.config.port_end,
                None,
                TaskContext::new(Job::Listen),
            )
            .await
            .context("failed to request task listening port")?;

        let mut port_rx = self.task_port.subscribe();
        let bound = tokio::time::timeout(PORT_WAIT, port_rx.wait_for(|port| port.is_some()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !bound {
            warn!("task port not bound yet, announcing the node without it");
        }

        let weak = Arc::downgrade(self);
        let events = tokio::spawn(async move {
            while let Some(event) = overlay.recv().await {
                let Some(server) = weak.upgrade() else { break };
                server.on_overlay_event(event).await;
            }
        });

        let weak = Arc::downgrade(self);
        let maintenance = tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = weak.upgrade() else { break };
                server.maintain().await;
            }
        });

        self.loops.lock().await.extend([events, maintenance]);
        Ok(())
    }

    pub async fn quit(&self) {
        for handle in self.loops.lock().await.drain(..) {
            handle.abort();
        }
        self.requests.quit().await;
    }

    pub fn task_port(&self) -> Option<u16> {
        *self.task_port.borrow()
    }

    pub fn requests(&self) -> &ConnectionRequests<TaskContext> {
        &self.requests
    }

    pub fn relay(&self) -> &RelayHub {
        &self.relay
    }

    pub async fn forwarded_count(&self) -> usize {
        self.forwarded.lock().await.len()
    }

    pub async fn mediation_count(&self) -> usize {
        self.mediations.lock().await.len()
    }

    pub async fn rendezvous_for(&self, request: RequestId) -> Option<RendezvousSnapshot> {
        let coordinator = self.coordinator.lock().await;
        let id = coordinator.find_by_request(request)?;
        coordinator.snapshot(id)
    }

    fn is_trusted(&self, kind: RequestKind, peer: &Identity) -> bool {
        if is_resource_kind(kind) {
            self.trust.provider_trust(peer) >= self.config.min_provider_trust
        } else {
            self.trust.requestor_trust(peer) >= self.config.min_requestor_trust
        }
    }

    /// Opens a task session to `dest`. `supernode` is the supernode `dest`
    /// is known to be connected to, if any; `respond_to` frames follow the
    /// session hello.
    pub async fn connect(
        &self,
        kind: RequestKind,
        dest: NodeInfo,
        supernode: Option<NodeInfo>,
        respond_to: Vec<Vec<u8>>,
    ) -> Result<RequestId> {
        if !is_session_kind(kind) {
            bail!("{kind:?} is not a task session kind");
        }
        if !self.is_trusted(kind, &dest.identity) {
            bail!("{} is below the trust threshold for {kind:?}", dest.identity.short());
        }
        let candidates = dest.task_candidates();
        let peer = dest.identity;
        let ctx = TaskContext {
            job: Job::Session { kind, dest, supernode },
            respond_to,
        };
        let request = self.requests.connect(kind, candidates, ctx).await?;
        debug!(request = %request, kind = ?kind, peer = %peer.short(), "task session requested");
        Ok(request)
    }

    pub async fn cancel(&self, request: RequestId) -> Result<bool> {
        self.forwarded.lock().await.remove(&request);
        let actions = self.coordinator.lock().await.abandon(request, Instant::now());
        self.execute(actions).await;
        self.requests.cancel(request).await
    }

    async fn emit(&self, event: TaskEvent) {
        if let Err(mpsc::error::SendError(event)) = self.events.send(event).await {
            trace!(event = ?event, "task event dropped");
            if let Some(session) = event.session() {
                session.close().await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection handlers
    // ------------------------------------------------------------------------

    async fn on_established(self: &Arc<Self>, request: RequestId, session: SessionRef, ctx: TaskContext) {
        let me = self.p2p.identity();
        match ctx.job {
            Job::Session { kind, dest, .. } => {
                self.forwarded.lock().await.remove(&request);
                let hello = Message::SessionHello {
                    identity: me,
                    conn_id: request,
                    kind,
                };
                let mut sent = send_message(&session, &hello).await;
                for frame in ctx.respond_to {
                    if sent.is_err() {
                        break;
                    }
                    sent = session.send(frame).await.context("failed to send queued frame");
                }
                if let Err(e) = sent {
                    warn!(request = %request, error = %e, "task session broke while opening");
                    session.close().await;
                    self.emit(TaskEvent::RequestFailed {
                        request,
                        kind,
                        peer: dest.identity,
                    })
                    .await;
                    return;
                }
                info!(request = %request, kind = ?kind, peer = %dest.identity.short(), "task session ready");
                self.emit(TaskEvent::SessionReady {
                    request,
                    kind,
                    peer: dest.identity,
                    session,
                })
                .await;
            }
            Job::StartSession { requestor, conn_id, .. } => {
                let hello = Message::SessionHello {
                    identity: me,
                    conn_id,
                    kind: RequestKind::StartSession,
                };
                if let Err(e) = send_message(&session, &hello).await {
                    debug!(request = %conn_id, error = %e, "start-session answer failed");
                    session.close().await;
                    return;
                }
                debug!(request = %conn_id, requestor = %requestor.identity.short(), "dialed back requestor");
                self.spawn_route_inbound(session);
            }
            Job::Mediator { rendezvous, .. } => {
                let actions = self
                    .coordinator
                    .lock()
                    .await
                    .mediator_connected(rendezvous, session.clone(), Instant::now());
                self.execute(actions).await;
                self.spawn_mediator_watch(rendezvous, session);
            }
            Job::Traverse { rendezvous } => {
                let actions = self
                    .coordinator
                    .lock()
                    .await
                    .punch_succeeded(rendezvous, session, Instant::now());
                self.execute(actions).await;
            }
            Job::JoinRelay { rendezvous, mediator } => {
                let join = Message::JoinMiddlemanConn { rendezvous, identity: me };
                if let Err(e) = send_message(&session, &join).await {
                    debug!(rendezvous = %rendezvous, error = %e, "could not join relay");
                    session.close().await;
                    return;
                }
                debug!(rendezvous = %rendezvous, mediator = %mediator.identity.short(), "joined relay");
                self.spawn_relay_wait(rendezvous, session);
            }
            Job::Listen | Job::PunchListen { .. } => session.close().await,
        }
    }

    async fn on_failure(&self, request: RequestId, ctx: TaskContext) -> FailureAction {
        match ctx.job {
            Job::Session { kind, dest, supernode } => {
                if supernode.is_some() && self.start_rendezvous(request, dest.clone(), supernode).await {
                    return FailureAction::WaitAlternative;
                }
                if self.request_reverse(request, &dest).await {
                    return FailureAction::WaitAlternative;
                }
                let known = self
                    .p2p
                    .supernode_near(&dest.identity)
                    .await
                    .filter(|s| s.identity != dest.identity);
                if self.start_rendezvous(request, dest, known).await {
                    return FailureAction::WaitAlternative;
                }
                debug!(request = %request, kind = ?kind, "no route left");
                FailureAction::GiveUp
            }
            Job::StartSession { requestor, supernode, .. } => {
                if self.start_rendezvous(request, requestor, supernode).await {
                    FailureAction::WaitAlternative
                } else {
                    FailureAction::GiveUp
                }
            }
            _ => FailureAction::GiveUp,
        }
    }

    async fn on_final_failure(&self, request: RequestId, ctx: TaskContext) {
        let now = Instant::now();
        match ctx.job {
            Job::Session { kind, dest, .. } => {
                self.forwarded.lock().await.remove(&request);
                let actions = self.coordinator.lock().await.abandon(request, now);
                self.execute(actions).await;
                info!(request = %request, kind = ?kind, peer = %dest.identity.short(), "task session failed");
                self.emit(TaskEvent::RequestFailed {
                    request,
                    kind,
                    peer: dest.identity,
                })
                .await;
            }
            Job::StartSession { requestor, conn_id, .. } => {
                let actions = self.coordinator.lock().await.abandon(request, now);
                self.execute(actions).await;
                debug!(request = %conn_id, requestor = %requestor.identity.short(), "could not dial back requestor");
            }
            Job::Mediator { rendezvous, supernode } => {
                debug!(rendezvous = %rendezvous, supernode = %supernode.identity.short(), "supernode unreachable");
                let actions = self.coordinator.lock().await.mediator_failed(rendezvous, now);
                self.execute(actions).await;
            }
            Job::Traverse { rendezvous } => {
                let actions = self.coordinator.lock().await.punch_failed(rendezvous, now);
                self.execute(actions).await;
            }
            Job::JoinRelay { rendezvous, mediator } => {
                warn!(rendezvous = %rendezvous, mediator = %mediator.identity.short(), "relay unreachable");
            }
            Job::Listen | Job::PunchListen { .. } => {}
        }
    }

    async fn on_listening(self: &Arc<Self>, port: u16, mut incoming: mpsc::Receiver<SessionRef>, ctx: TaskContext) {
        match ctx.job {
            Job::PunchListen { rendezvous, mediator } => {
                let report = Message::NatPunchListening { rendezvous, port };
                if let Err(e) = self.p2p.send_to(&mediator, &report).await {
                    debug!(rendezvous = %rendezvous, error = %e, "could not report punch port");
                }
                debug!(rendezvous = %rendezvous, port, "punch port open");
            }
            _ => {
                self.p2p
                    .update_node_info(|node| {
                        node.task_prv_port = Some(port);
                        if node.pub_addr.is_some() && node.task_pub_port.is_none() {
                            node.task_pub_port = Some(port);
                        }
                    })
                    .await;
                self.task_port.send_replace(Some(port));
                info!(port, "task server listening");
            }
        }

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(session) = incoming.recv().await {
                let Some(server) = weak.upgrade() else {
                    session.close().await;
                    break;
                };
                server.spawn_route_inbound(session);
            }
        });
    }

    // ------------------------------------------------------------------------
    // Alternative routes
    // ------------------------------------------------------------------------

    async fn start_rendezvous(&self, request: RequestId, dest: NodeInfo, supernode: Option<NodeInfo>) -> bool {
        let Some(supernode) = supernode else {
            return false;
        };
        if supernode.identity == self.p2p.identity() {
            return false;
        }
        let local = self.p2p.node_info().await;
        let actions = {
            let mut coordinator = self.coordinator.lock().await;
            coordinator.set_local(local);
            let (_, actions) = coordinator.start(request, dest, Some(supernode), Instant::now());
            actions
        };
        self.execute(actions).await;
        true
    }

    async fn request_reverse(&self, request: RequestId, dest: &NodeInfo) -> bool {
        if self.p2p.peer_count().await == 0 {
            return false;
        }
        let me = self.p2p.node_info().await;
        let supernode = self.p2p.connected_supernode_near(&me.identity).await;
        // Tracked before sending so an early dial-back finds the entry to clear.
        self.forwarded.lock().await.insert(
            request,
            Forwarded {
                deadline: Instant::now() + self.config.forwarded_request_timeout,
                dest: dest.identity,
            },
        );
        match self
            .p2p
            .want_to_start_task_session(dest.identity, me, request, supernode)
            .await
        {
            Ok(sent) => {
                debug!(request = %request, dest = %dest.identity.short(), sent, "asked destination to dial back");
                true
            }
            Err(e) => {
                self.forwarded.lock().await.remove(&request);
                debug!(request = %request, error = %e, "reverse connection not possible");
                false
            }
        }
    }

    async fn execute(&self, actions: Vec<RendezvousAction<SessionRef>>) {
        let mut queue: VecDeque<_> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                RendezvousAction::ContactMediator {
                    rendezvous,
                    mode,
                    supernode,
                } => {
                    let kind = match mode {
                        RendezvousMode::NatPunch => RequestKind::NatPunch,
                        RendezvousMode::Middleman => RequestKind::Middleman,
                    };
                    let candidates = supernode.task_candidates();
                    let ctx = TaskContext::new(Job::Mediator { rendezvous, supernode });
                    if let Err(e) = self.requests.connect(kind, candidates, ctx).await {
                        warn!(rendezvous = %rendezvous, error = %e, "could not contact supernode");
                        queue.extend(
                            self.coordinator
                                .lock()
                                .await
                                .mediator_failed(rendezvous, Instant::now()),
                        );
                    }
                }
                RendezvousAction::SendToMediator {
                    rendezvous,
                    session,
                    message,
                } => {
                    if let Err(e) = send_message(&session, &message).await {
                        debug!(rendezvous = %rendezvous, error = %e, "mediator session broke");
                        queue.extend(
                            self.coordinator
                                .lock()
                                .await
                                .mediator_failed(rendezvous, Instant::now()),
                        );
                    }
                }
                RendezvousAction::DialPunch { rendezvous, addr } => {
                    let ctx = TaskContext::new(Job::Traverse { rendezvous });
                    if let Err(e) = self.requests.connect(RequestKind::NatTraverse, vec![addr], ctx).await {
                        debug!(rendezvous = %rendezvous, error = %e, "could not dial punched address");
                        queue.extend(self.coordinator.lock().await.punch_failed(rendezvous, Instant::now()));
                    }
                }
                RendezvousAction::Deliver { request, session } => {
                    match self.requests.deliver(request, session.clone()).await {
                        Ok(true) => {}
                        _ => {
                            debug!(request = %request, "rendezvous finished after its request");
                            session.close().await;
                        }
                    }
                }
                RendezvousAction::FinalFailure { request, error } => {
                    debug!(request = %request, error = %error, "rendezvous gave up");
                    if let Err(e) = self.requests.final_failure(request).await {
                        debug!(request = %request, error = %e, "failed to report final failure");
                    }
                }
                RendezvousAction::CloseSession(session) => {
                    self.retired.lock().await.insert(session.id());
                    session.close().await;
                }
            }
        }
    }

    /// Reads the supernode's answers on a mediator session until the
    /// rendezvous no longer needs it.
    fn spawn_mediator_watch(self: &Arc<Self>, rendezvous: RendezvousId, session: SessionRef) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let frame = session.recv().await;
                let Some(server) = weak.upgrade() else { break };
                let now = Instant::now();
                let Some(frame) = frame else {
                    if !server.retired.lock().await.remove(&session.id()) {
                        let actions = server.coordinator.lock().await.mediator_failed(rendezvous, now);
                        server.execute(actions).await;
                    }
                    break;
                };
                let actions = match Message::decode(&frame) {
                    Ok(Message::NatHole { rendezvous: rid, addr }) if rid == rendezvous => {
                        server.coordinator.lock().await.nat_hole(rendezvous, addr, now)
                    }
                    Ok(Message::NatTraverseFailure { rendezvous: rid }) if rid == rendezvous => {
                        server.retired.lock().await.insert(session.id());
                        let actions = server.coordinator.lock().await.refused(rendezvous, now);
                        server.execute(actions).await;
                        session.close().await;
                        break;
                    }
                    Ok(Message::MiddlemanReady { rendezvous: rid }) if rid == rendezvous => {
                        // From here on the session carries the destination's frames.
                        let actions = server.coordinator.lock().await.relay_ready(rendezvous, now);
                        server.execute(actions).await;
                        break;
                    }
                    Ok(other) => {
                        debug!(rendezvous = %rendezvous, message = other.name(), "unexpected mediator message");
                        continue;
                    }
                    Err(e) => {
                        debug!(rendezvous = %rendezvous, error = %e, "undecodable mediator frame");
                        continue;
                    }
                };
                server.execute(actions).await;
            }
        });
    }

    /// Waits for the relay to pair our leg, then treats it like an inbound
    /// session.
    fn spawn_relay_wait(self: &Arc<Self>, rendezvous: RendezvousId, session: SessionRef) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let ready = match tokio::time::timeout(FIRST_FRAME_TIMEOUT, session.recv()).await {
                Ok(Some(frame)) => matches!(
                    Message::decode(&frame),
                    Ok(Message::MiddlemanReady { rendezvous: rid }) if rid == rendezvous
                ),
                _ => false,
            };
            match (ready, weak.upgrade()) {
                (true, Some(server)) => {
                    debug!(rendezvous = %rendezvous, "relay ready");
                    server.spawn_route_inbound(session);
                }
                _ => {
                    debug!(rendezvous = %rendezvous, "relay never became ready");
                    session.close().await;
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Inbound sessions
    // ------------------------------------------------------------------------

    fn spawn_route_inbound(self: &Arc<Self>, session: SessionRef) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let first = tokio::time::timeout(FIRST_FRAME_TIMEOUT, session.recv()).await;
            let Some(server) = weak.upgrade() else {
                session.close().await;
                return;
            };
            match first {
                Ok(Some(frame)) => server.route_first_frame(session, frame).await,
                Ok(None) => trace!(session = session.id(), "task session closed before its first frame"),
                Err(_) => {
                    debug!(session = session.id(), "task session sent nothing");
                    session.close().await;
                }
            }
        });
    }

    async fn route_first_frame(&self, session: SessionRef, frame: Vec<u8>) {
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(session = session.id(), error = %e, "undecodable first frame");
                session.close().await;
                return;
            }
        };
        match message {
            Message::SessionHello {
                identity,
                conn_id,
                kind: RequestKind::StartSession,
            } => self.on_dialed_back(identity, conn_id, session).await,
            Message::SessionHello { identity, conn_id, kind } => {
                info!(peer = %identity.short(), kind = ?kind, request = %conn_id, "incoming task session");
                self.emit(TaskEvent::IncomingSession {
                    peer: identity,
                    kind,
                    request: conn_id,
                    session,
                })
                .await;
            }
            Message::NatPunch {
                rendezvous,
                asking,
                target,
                conn_id,
            } => self.mediate_punch(session, rendezvous, asking, target, conn_id).await,
            Message::Middleman {
                rendezvous,
                asking,
                target,
                conn_id,
            } => self.mediate_relay(session, rendezvous, asking, target, conn_id).await,
            Message::JoinMiddlemanConn { rendezvous, identity } => {
                if let Err(e) = self.relay.complete(rendezvous, identity, session.clone()).await {
                    debug!(rendezvous = %rendezvous, error = %e, "relay leg refused");
                    session.close().await;
                }
            }
            other => {
                debug!(message = other.name(), "unexpected first frame on task session");
                session.close().await;
            }
        }
    }

    async fn on_dialed_back(&self, peer: Identity, conn_id: RequestId, session: SessionRef) {
        match self.requests.deliver(conn_id, session.clone()).await {
            Ok(true) => {
                debug!(request = %conn_id, peer = %peer.short(), "destination dialed back");
                self.forwarded.lock().await.remove(&conn_id);
                let actions = self.coordinator.lock().await.resolved_elsewhere(conn_id, Instant::now());
                self.execute(actions).await;
            }
            _ => {
                debug!(request = %conn_id, peer = %peer.short(), "dial-back for a request no longer waiting");
                session.close().await;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Supernode role
    // ------------------------------------------------------------------------

    async fn mediate_punch(
        &self,
        session: SessionRef,
        rendezvous: RendezvousId,
        asking: NodeInfo,
        target: Identity,
        conn_id: RequestId,
    ) {
        if !self.p2p.is_connected(&target).await {
            debug!(rendezvous = %rendezvous, target = %target.short(), "punch target not connected");
            refuse(&session, rendezvous).await;
            return;
        }
        let port = asking.task_pub_port.or(asking.task_prv_port);
        let asking_addr = match (session.peer_addr(), port) {
            (Some(observed), Some(port)) => observed.with_port(port).ok(),
            _ => None,
        };
        let Some(asking_addr) = asking_addr else {
            debug!(rendezvous = %rendezvous, "asking node has no reachable task port");
            refuse(&session, rendezvous).await;
            return;
        };

        let wait = Message::WaitForNatTraverse {
            rendezvous,
            asking: asking.clone(),
            asking_addr,
            conn_id,
        };
        if let Err(e) = self.p2p.send_to(&target, &wait).await {
            debug!(rendezvous = %rendezvous, error = %e, "could not reach punch target");
            refuse(&session, rendezvous).await;
            return;
        }
        info!(
            rendezvous = %rendezvous,
            asking = %asking.identity.short(),
            target = %target.short(),
            "mediating hole punch"
        );
        self.mediations.lock().await.insert(
            rendezvous,
            Mediation {
                asking: session,
                target,
                deadline: Instant::now() + self.rendezvous_config.punch_listen_ttl,
            },
        );
    }

    async fn on_punch_listening(&self, rendezvous: RendezvousId, from: Identity, endpoint: AddressCandidate, port: u16) {
        let mediation = {
            let mut mediations = self.mediations.lock().await;
            match mediations.get(&rendezvous) {
                Some(m) if m.target == from => mediations.remove(&rendezvous),
                Some(_) => {
                    warn!(rendezvous = %rendezvous, from = %from.short(), "punch port reported by wrong node");
                    None
                }
                None => None,
            }
        };
        let Some(mediation) = mediation else { return };

        match endpoint.with_port(port) {
            Ok(addr) => {
                debug!(rendezvous = %rendezvous, hole = %addr, "reporting hole");
                let hole = Message::NatHole { rendezvous, addr };
                if let Err(e) = send_message(&mediation.asking, &hole).await {
                    debug!(rendezvous = %rendezvous, error = %e, "asking node gone");
                }
            }
            Err(e) => {
                debug!(rendezvous = %rendezvous, error = %e, "invalid punch port");
                refuse(&mediation.asking, rendezvous).await;
            }
        }
    }

    async fn mediate_relay(
        &self,
        session: SessionRef,
        rendezvous: RendezvousId,
        asking: NodeInfo,
        target: Identity,
        conn_id: RequestId,
    ) {
        if !self.p2p.is_connected(&target).await {
            debug!(rendezvous = %rendezvous, target = %target.short(), "relay target not connected");
            refuse(&session, rendezvous).await;
            return;
        }
        if let Err(e) = self
            .relay
            .register(rendezvous, asking.identity, target, session.clone())
            .await
        {
            debug!(rendezvous = %rendezvous, error = %e, "relay refused");
            refuse(&session, rendezvous).await;
            return;
        }
        info!(
            rendezvous = %rendezvous,
            asking = %asking.identity.short(),
            target = %target.short(),
            "relaying"
        );
        let join = Message::JoinMiddleman {
            rendezvous,
            asking,
            conn_id,
        };
        if let Err(e) = self.p2p.send_to(&target, &join).await {
            // The pending leg expires in the hub.
            debug!(rendezvous = %rendezvous, error = %e, "could not ask target to join relay");
        }
    }

    // ------------------------------------------------------------------------
    // Overlay signals
    // ------------------------------------------------------------------------

    async fn on_overlay_event(&self, event: OverlayEvent) {
        match event {
            OverlayEvent::StartSessionRequested {
                requestor,
                conn_id,
                supernode,
            } => {
                let candidates = requestor.task_candidates();
                debug!(request = %conn_id, requestor = %requestor.identity.short(), "dialing back requestor");
                let ctx = TaskContext::new(Job::StartSession {
                    requestor,
                    conn_id,
                    supernode,
                });
                if let Err(e) = self.requests.connect(RequestKind::StartSession, candidates, ctx).await {
                    warn!(request = %conn_id, error = %e, "could not dial back requestor");
                }
            }
            OverlayEvent::WaitForNatTraverse {
                rendezvous,
                asking,
                asking_addr,
                conn_id,
                mediator,
            } => {
                let ctx = TaskContext::new(Job::PunchListen {
                    rendezvous,
                    mediator: mediator.identity,
                });
                if let Err(e) = self
                    .requests
                    .listen(
                        ListenKind::NatPunch,
                        self.config.port_start,
                        self.config.port_end,
                        Some(self.rendezvous_config.punch_listen_ttl),
                        ctx,
                    )
                    .await
                {
                    warn!(rendezvous = %rendezvous, error = %e, "could not open punch port");
                }

                // Dial the asking node at the same time; whichever path
                // opens first wins.
                let mut candidates = vec![asking_addr];
                candidates.extend(asking.task_candidates());
                let ctx = TaskContext::new(Job::StartSession {
                    requestor: asking,
                    conn_id,
                    supernode: None,
                });
                if let Err(e) = self.requests.connect(RequestKind::StartSession, candidates, ctx).await {
                    warn!(rendezvous = %rendezvous, error = %e, "could not dial asking node");
                }
            }
            OverlayEvent::NatPunchListening {
                rendezvous,
                from,
                endpoint,
                port,
            } => self.on_punch_listening(rendezvous, from, endpoint, port).await,
            OverlayEvent::JoinMiddleman {
                rendezvous,
                asking,
                conn_id,
                mediator,
            } => {
                debug!(
                    rendezvous = %rendezvous,
                    asking = %asking.identity.short(),
                    request = %conn_id,
                    "asked to join relay"
                );
                let candidates = mediator.task_candidates();
                let ctx = TaskContext::new(Job::JoinRelay { rendezvous, mediator });
                if let Err(e) = self.requests.connect(RequestKind::Middleman, candidates, ctx).await {
                    warn!(rendezvous = %rendezvous, error = %e, "could not dial relay");
                }
            }
            OverlayEvent::PeerVerified(node) => trace!(peer = %node.identity.short(), "overlay peer up"),
            OverlayEvent::PeerDisconnected(id) => trace!(peer = %id.short(), "overlay peer down"),
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// One timeout pass; runs every [`MAINTENANCE_INTERVAL`] once started.
    pub async fn maintain(&self) {
        let now = Instant::now();

        let actions = self.coordinator.lock().await.poll(now);
        self.execute(actions).await;

        let expired: Vec<(RequestId, Identity)> = {
            let mut forwarded = self.forwarded.lock().await;
            let expired = forwarded
                .iter()
                .filter(|(_, f)| f.deadline <= now)
                .map(|(id, f)| (*id, f.dest))
                .collect::<Vec<_>>();
            for (id, _) in &expired {
                forwarded.remove(id);
            }
            expired
        };
        for (request, dest) in expired {
            debug!(request = %request, dest = %dest.short(), "destination never dialed back");
            if let Err(e) = self.requests.final_failure(request).await {
                debug!(request = %request, error = %e, "failed to report final failure");
            }
        }

        let stale: Vec<(RendezvousId, Mediation)> = {
            let mut mediations = self.mediations.lock().await;
            let ids: Vec<RendezvousId> = mediations
                .iter()
                .filter(|(_, m)| m.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| mediations.remove(&id).map(|m| (id, m)))
                .collect()
        };
        for (rendezvous, mediation) in stale {
            debug!(rendezvous = %rendezvous, target = %mediation.target.short(), "punch target never opened a port");
            refuse(&mediation.asking, rendezvous).await;
        }
    }
}
