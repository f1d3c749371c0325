//! # Connection Request Manager
//!
//! Tracks outbound dial attempts and listen requests for one service and
//! reports outcomes through a per-kind handler table.
//!
//! ## Architecture
//!
//! - [`ConnectionRequests`]: public handle, cheap to clone, sends commands
//! - `ManagerActor`: owns the request and listen maps, processes commands
//!   one at a time and runs the periodic tick
//!
//! Dials and binds run in spawned tasks and report back as commands, so the
//! actor never awaits network I/O. Handlers run in their own tasks as well;
//! a panicking handler is logged and leaves the maps untouched.
//!
//! ## Request Lifecycle
//!
//! ```text
//!            connect
//!               |
//!           Inactive --tick--> Waiting --dial ok--> established(), removed
//!               ^                 |
//!               |            dial failed
//!               |                 v
//!               +---- Failure <---+---- all candidates failed
//!                                              |
//!                                     failure() decides
//!                                   /                  \
//!                             GiveUp                  WaitAlternative
//!                        final_failure(), removed       WaitingAlt
//!                                                 deliver() | timeout -> final_failure()
//! ```
//!
//! Within one request candidates are dialed strictly one after another;
//! different requests dial concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::{AccessPolicy, AddressCandidate};
use crate::config::ConnectionConfig;
use crate::transport::{Binder, DialError, Dialer, ListeningHandle, SessionRef};

/// Slack on top of the dial timeout before the manager gives up on a dialer
/// that ignores its own timeout.
const DIAL_GRACE: Duration = Duration::from_secs(1);

const COMMAND_QUEUE: usize = 256;


// ============================================================================
// Identifiers and kinds
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; 16]);

impl RequestId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        if getrandom::getrandom(&mut id).is_err() {
            rand::thread_rng().fill(&mut id);
        }
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", &hex::encode(self.0)[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Overlay session to a peer.
    PeerConnect,
    TaskRequest,
    TaskResult,
    TaskFailure,
    /// Reverse connection answering a forwarded start-session request.
    StartSession,
    /// Session to a supernode carrying a punch mediation request.
    NatPunch,
    /// Session to a supernode that becomes one relay leg.
    Middleman,
    /// Dial into the hole opened by a punch.
    NatTraverse,
    ResourcePull,
    ResourcePush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListenKind {
    Overlay,
    Task,
    /// Short-lived port opened for a hole punch.
    NatPunch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Inactive,
    Waiting,
    Connected,
    Failure,
    WaitingAlt,
}

/// What to do once every direct candidate has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Report the final failure now.
    GiveUp,
    /// Park the request until another route delivers a session.
    WaitAlternative,
}


// ============================================================================
// Handlers
// ============================================================================

#[async_trait]
pub trait ConnectionHandler<C>: Send + Sync
where
    C: Send + 'static,
{
    async fn established(&self, request: RequestId, session: SessionRef, ctx: C);

    /// Every candidate failed, or there was none to begin with.
    async fn failure(&self, request: RequestId, ctx: C) -> FailureAction {
        let _ = (request, ctx);
        FailureAction::GiveUp
    }

    async fn final_failure(&self, request: RequestId, ctx: C);
}

#[async_trait]
pub trait ListenHandler<C>: Send + Sync
where
    C: Send + 'static,
{
    async fn established(&self, port: u16, incoming: mpsc::Receiver<SessionRef>, ctx: C);

    async fn failure(&self, ctx: C);
}

/// Handlers per request kind, fixed when the manager is spawned.
pub struct HandlerTable<C> {
    connect: HashMap<RequestKind, Arc<dyn ConnectionHandler<C>>>,
    listen: HashMap<ListenKind, Arc<dyn ListenHandler<C>>>,
}

impl<C> Default for HandlerTable<C> {
    fn default() -> Self {
        Self {
            connect: HashMap::new(),
            listen: HashMap::new(),
        }
    }
}

impl<C: Send + 'static> HandlerTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, kind: RequestKind, handler: Arc<dyn ConnectionHandler<C>>) -> Self {
        self.connect.insert(kind, handler);
        self
    }

    pub fn on_listen(mut self, kind: ListenKind, handler: Arc<dyn ListenHandler<C>>) -> Self {
        self.listen.insert(kind, handler);
        self
    }
}


// ============================================================================
// Local endpoints (self-connect guard)
// ============================================================================

#[derive(Default)]
struct LocalEndpointsState {
    hosts: HashSet<String>,
    ports: HashSet<u16>,
}

/// Hosts and listening ports of this node, shared by every manager of the
/// node so no service dials another service of the same process.
#[derive(Clone, Default)]
pub struct LocalEndpoints {
    inner: Arc<RwLock<LocalEndpointsState>>,
}

impl LocalEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: impl Into<String>) {
        if let Ok(mut state) = self.inner.write() {
            state.hosts.insert(host.into());
        }
    }

    pub fn add_port(&self, port: u16) {
        if let Ok(mut state) = self.inner.write() {
            state.ports.insert(port);
        }
    }

    pub fn remove_port(&self, port: u16) {
        if let Ok(mut state) = self.inner.write() {
            state.ports.remove(&port);
        }
    }

    pub fn is_self(&self, addr: &AddressCandidate) -> bool {
        self.inner
            .read()
            .map(|s| s.ports.contains(&addr.port()) && s.hosts.contains(addr.host()))
            .unwrap_or(false)
    }
}

impl fmt::Debug for LocalEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.read() {
            Ok(state) => f
                .debug_struct("LocalEndpoints")
                .field("hosts", &state.hosts)
                .field("ports", &state.ports)
                .finish(),
            Err(_) => f.write_str("LocalEndpoints(poisoned)"),
        }
    }
}


// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub kind: RequestKind,
    pub status: RequestStatus,
    pub attempts: usize,
    pub failures: usize,
    pub candidates: Vec<AddressCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSnapshot {
    pub port: u16,
    pub kind: ListenKind,
    /// Ports tried and found unusable before this one.
    pub retries: usize,
}


// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command<C> {
    Connect {
        kind: RequestKind,
        candidates: Vec<AddressCandidate>,
        ctx: C,
        reply: oneshot::Sender<RequestId>,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    Verified {
        id: RequestId,
    },
    MarkConnected {
        id: RequestId,
        addr: AddressCandidate,
        reply: oneshot::Sender<bool>,
    },
    Deliver {
        id: RequestId,
        session: SessionRef,
        reply: oneshot::Sender<bool>,
    },
    FinalFailure {
        id: RequestId,
    },
    Listen {
        kind: ListenKind,
        port_start: u16,
        port_end: u16,
        ttl: Option<Duration>,
        ctx: C,
        reply: oneshot::Sender<RequestId>,
    },
    StopListening {
        port: u16,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        id: RequestId,
        reply: oneshot::Sender<Option<RequestSnapshot>>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Listening {
        reply: oneshot::Sender<Vec<ListeningSnapshot>>,
    },
    Tick {
        reply: oneshot::Sender<()>,
    },
    DialFinished {
        id: RequestId,
        addr: AddressCandidate,
        result: Result<SessionRef, DialError>,
    },
    FailureResolved {
        id: RequestId,
        action: FailureAction,
    },
    ListenFinished {
        id: RequestId,
        outcome: Result<(ListeningHandle, usize), usize>,
    },
    Quit,
}


// ============================================================================
// ConnectionRequests Handle (public API - cheap to clone)
// ============================================================================

pub struct ConnectionRequests<C> {
    cmd_tx: mpsc::Sender<Command<C>>,
}

impl<C> Clone for ConnectionRequests<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<C> fmt::Debug for ConnectionRequests<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequests")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

fn closed() -> anyhow::Error {
    anyhow!("connection manager closed")
}

impl<C> ConnectionRequests<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn spawn(
        config: ConnectionConfig,
        dialer: Arc<dyn Dialer>,
        binder: Arc<dyn Binder>,
        local: LocalEndpoints,
        handlers: HandlerTable<C>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = ManagerActor {
            access: config.access_policy(),
            config,
            dialer,
            binder,
            local,
            handlers,
            weak_tx: cmd_tx.downgrade(),
            requests: HashMap::new(),
            listens: HashMap::new(),
            open: HashMap::new(),
            in_flight: HashSet::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<C>) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(make(reply_tx)).await.map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())
    }

    /// Registers a request; dialing starts on the next tick.
    pub async fn connect(
        &self,
        kind: RequestKind,
        candidates: Vec<AddressCandidate>,
        ctx: C,
    ) -> Result<RequestId> {
        self.request(|reply| Command::Connect {
            kind,
            candidates,
            ctx,
            reply,
        })
        .await
    }

    /// Drops a request that is not yet connected. Returns whether it was removed.
    pub async fn cancel(&self, id: RequestId) -> Result<bool> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// The caller has taken over the connection; forget the request.
    pub async fn verified(&self, id: RequestId) -> Result<()> {
        self.cmd_tx
            .send(Command::Verified { id })
            .await
            .map_err(|_| closed())
    }

    /// An inbound connection from `addr` satisfied this request.
    pub async fn mark_connected(&self, id: RequestId, addr: AddressCandidate) -> Result<bool> {
        self.request(|reply| Command::MarkConnected { id, addr, reply }).await
    }

    /// Hands a session obtained through another route to the established
    /// handler. Returns `false` when the request is gone.
    pub async fn deliver(&self, id: RequestId, session: SessionRef) -> Result<bool> {
        self.request(|reply| Command::Deliver { id, session, reply }).await
    }

    /// Ends a request with its final failure.
    pub async fn final_failure(&self, id: RequestId) -> Result<()> {
        self.cmd_tx
            .send(Command::FinalFailure { id })
            .await
            .map_err(|_| closed())
    }

    /// Binds the first free port in `port_start..=port_end`.
    pub async fn listen(
        &self,
        kind: ListenKind,
        port_start: u16,
        port_end: u16,
        ttl: Option<Duration>,
        ctx: C,
    ) -> Result<RequestId> {
        self.request(|reply| Command::Listen {
            kind,
            port_start,
            port_end,
            ttl,
            ctx,
            reply,
        })
        .await
    }

    pub async fn stop_listening(&self, port: u16) -> Result<bool> {
        self.request(|reply| Command::StopListening { port, reply }).await
    }

    pub async fn snapshot(&self, id: RequestId) -> Result<Option<RequestSnapshot>> {
        self.request(|reply| Command::Snapshot { id, reply }).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.request(|reply| Command::PendingCount { reply }).await
    }

    pub async fn listening(&self) -> Result<Vec<ListeningSnapshot>> {
        self.request(|reply| Command::Listening { reply }).await
    }

    /// Runs one tick immediately, in addition to the periodic ones.
    pub async fn tick(&self) -> Result<()> {
        self.request(|reply| Command::Tick { reply }).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}


// ============================================================================
// Actor
// ============================================================================

struct Request<C> {
    id: RequestId,
    kind: RequestKind,
    candidates: Vec<AddressCandidate>,
    attempts: usize,
    failures: usize,
    status: RequestStatus,
    ctx: C,
    created_at: Instant,
    parked_at: Option<Instant>,
}

impl<C> Request<C> {
    fn is_exhausted(&self) -> bool {
        !self.candidates.is_empty()
            && self.attempts == self.candidates.len()
            && self.failures == self.attempts
    }

    fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            id: self.id,
            kind: self.kind,
            status: self.status,
            attempts: self.attempts,
            failures: self.failures,
            candidates: self.candidates.clone(),
        }
    }
}

struct ListenRequest<C> {
    kind: ListenKind,
    ttl: Option<Duration>,
    ctx: C,
}

struct OpenListening {
    kind: ListenKind,
    opened_at: Instant,
    ttl: Option<Duration>,
    retries: usize,
    handle: ListeningHandle,
}

struct ManagerActor<C> {
    config: ConnectionConfig,
    access: AccessPolicy,
    dialer: Arc<dyn Dialer>,
    binder: Arc<dyn Binder>,
    local: LocalEndpoints,
    handlers: HandlerTable<C>,
    weak_tx: mpsc::WeakSender<Command<C>>,
    requests: HashMap<RequestId, Request<C>>,
    listens: HashMap<RequestId, ListenRequest<C>>,
    open: HashMap<u16, OpenListening>,
    /// Addresses with a dial in progress, across all requests.
    in_flight: HashSet<AddressCandidate>,
}

/// Runs a handler future in its own task and logs a panic instead of
/// propagating it.
fn dispatch<F>(handler: &'static str, request: RequestId, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(fut).await {
            if e.is_panic() {
                warn!(request = %request, handler, "connection handler panicked");
            }
        }
    });
}

impl<C> ManagerActor<C>
where
    C: Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command<C>>) {
        let mut tick_interval = tokio::time::interval(self.config.tick_interval);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick_interval.tick().await;

        debug!("connection manager actor started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => {
                            debug!("connection manager actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = tick_interval.tick() => {
                    self.tick();
                }
            }
        }

        for (port, open) in self.open.drain() {
            self.local.remove_port(port);
            open.handle.close();
        }
    }

    fn handle(&mut self, cmd: Command<C>) {
        match cmd {
            Command::Connect { kind, candidates, ctx, reply } => {
                let id = self.connect(kind, candidates, ctx);
                let _ = reply.send(id);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Verified { id } => {
                if self.requests.remove(&id).is_some() {
                    trace!(request = %id, "request verified");
                }
            }
            Command::MarkConnected { id, addr, reply } => {
                let _ = reply.send(self.mark_connected(id, addr));
            }
            Command::Deliver { id, session, reply } => {
                let _ = reply.send(self.deliver(id, session));
            }
            Command::FinalFailure { id } => {
                if let Some(request) = self.requests.remove(&id) {
                    self.dispatch_final_failure(request);
                }
            }
            Command::Listen { kind, port_start, port_end, ttl, ctx, reply } => {
                let id = self.listen(kind, port_start, port_end, ttl, ctx);
                let _ = reply.send(id);
            }
            Command::StopListening { port, reply } => {
                let _ = reply.send(self.close_listening(port));
            }
            Command::Snapshot { id, reply } => {
                let _ = reply.send(self.requests.get(&id).map(Request::snapshot));
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.requests.len());
            }
            Command::Listening { reply } => {
                let mut listening: Vec<ListeningSnapshot> = self
                    .open
                    .iter()
                    .map(|(port, open)| ListeningSnapshot {
                        port: *port,
                        kind: open.kind,
                        retries: open.retries,
                    })
                    .collect();
                listening.sort_by_key(|l| l.port);
                let _ = reply.send(listening);
            }
            Command::Tick { reply } => {
                self.tick();
                let _ = reply.send(());
            }
            Command::DialFinished { id, addr, result } => {
                self.dial_finished(id, addr, result);
            }
            Command::FailureResolved { id, action } => {
                self.failure_resolved(id, action);
            }
            Command::ListenFinished { id, outcome } => {
                self.listen_finished(id, outcome);
            }
            Command::Quit => {}
        }
    }

    fn connect(&mut self, kind: RequestKind, candidates: Vec<AddressCandidate>, ctx: C) -> RequestId {
        let id = RequestId::random();
        let total = candidates.len();

        let mut usable: Vec<AddressCandidate> = Vec::with_capacity(total);
        for candidate in candidates {
            if self.local.is_self(&candidate) {
                debug!(request = %id, addr = %candidate, "skipping own listening address");
                continue;
            }
            if !self.access.is_accessible(&candidate) {
                trace!(request = %id, addr = %candidate, "skipping inaccessible address");
                continue;
            }
            if !usable.contains(&candidate) {
                usable.push(candidate);
            }
        }

        let request = Request {
            id,
            kind,
            candidates: usable,
            attempts: 0,
            failures: 0,
            status: RequestStatus::Inactive,
            ctx,
            created_at: Instant::now(),
            parked_at: None,
        };

        if request.candidates.is_empty() {
            debug!(request = %id, kind = ?kind, offered = total, "no usable candidates");
            self.requests.insert(id, request);
            self.park(id);
        } else {
            debug!(
                request = %id,
                kind = ?kind,
                candidates = request.candidates.len(),
                "connection request registered"
            );
            self.requests.insert(id, request);
        }
        id
    }

    fn cancel(&mut self, id: RequestId) -> bool {
        match self.requests.get(&id) {
            Some(request) if request.status != RequestStatus::Connected => {
                self.requests.remove(&id);
                debug!(request = %id, "request cancelled");
                true
            }
            _ => false,
        }
    }

    fn mark_connected(&mut self, id: RequestId, addr: AddressCandidate) -> bool {
        let Some(request) = self.requests.get_mut(&id) else {
            return false;
        };
        match request.candidates.iter().position(|c| c == &addr) {
            Some(pos) => {
                let matched = request.candidates.remove(pos);
                request.candidates.insert(0, matched);
            }
            None => {
                request.candidates.insert(0, addr);
                request.attempts = (request.attempts + 1).min(request.candidates.len());
            }
        }
        request.status = RequestStatus::Connected;
        debug!(request = %id, "request satisfied by inbound connection");
        true
    }

    fn deliver(&mut self, id: RequestId, session: SessionRef) -> bool {
        let Some(mut request) = self.requests.remove(&id) else {
            return false;
        };
        request.status = RequestStatus::Connected;
        debug!(request = %id, kind = ?request.kind, "session delivered through alternative route");
        self.dispatch_established(request, session);
        true
    }

    fn tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| {
                r.status == RequestStatus::WaitingAlt
                    && r.parked_at
                        .map(|t| now.saturating_duration_since(t) > self.config.alternative_timeout)
                        .unwrap_or(false)
            })
            .map(|r| r.id)
            .collect();
        for id in expired {
            if let Some(request) = self.requests.remove(&id) {
                debug!(
                    request = %id,
                    age_ms = now.saturating_duration_since(request.created_at).as_millis() as u64,
                    "alternative route timed out"
                );
                self.dispatch_final_failure(request);
            }
        }

        let ready: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| matches!(r.status, RequestStatus::Inactive | RequestStatus::Failure))
            .map(|r| r.id)
            .collect();
        for id in ready {
            self.dial_next(id);
        }

        self.sweep_listenings(now);
    }

    fn dial_next(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };

        while request.attempts < request.candidates.len() {
            let addr = request.candidates[request.attempts].clone();
            if self.local.is_self(&addr) {
                request.attempts += 1;
                request.failures += 1;
                debug!(request = %id, addr = %addr, "refusing to dial own listening address");
                continue;
            }
            if self.in_flight.contains(&addr) {
                trace!(request = %id, addr = %addr, "address already being dialed, deferring");
                return;
            }

            request.attempts += 1;
            request.status = RequestStatus::Waiting;
            self.in_flight.insert(addr.clone());
            debug!(
                request = %id,
                kind = ?request.kind,
                addr = %addr,
                attempt = request.attempts,
                "dialing candidate"
            );

            let dialer = self.dialer.clone();
            let weak_tx = self.weak_tx.clone();
            let timeout = self.config.dial_timeout;
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout + DIAL_GRACE, dialer.dial(&addr, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(DialError::Timeout),
                };
                match weak_tx.upgrade() {
                    Some(tx) => {
                        let _ = tx.send(Command::DialFinished { id, addr, result }).await;
                    }
                    None => {
                        if let Ok(session) = result {
                            session.close().await;
                        }
                    }
                }
            });
            return;
        }

        if request.is_exhausted() {
            self.park(id);
        }
    }

    fn dial_finished(&mut self, id: RequestId, addr: AddressCandidate, result: Result<SessionRef, DialError>) {
        self.in_flight.remove(&addr);

        let Some(request) = self.requests.get_mut(&id) else {
            trace!(request = %id, addr = %addr, "dial finished for a request that is gone");
            if let Ok(session) = result {
                tokio::spawn(async move { session.close().await });
            }
            return;
        };

        if request.status != RequestStatus::Waiting {
            trace!(request = %id, status = ?request.status, "dial finished after request moved on");
            if let Ok(session) = result {
                tokio::spawn(async move { session.close().await });
            }
            return;
        }

        match result {
            Ok(session) => {
                request.status = RequestStatus::Connected;
                debug!(request = %id, addr = %addr, "candidate connected");
                if let Some(request) = self.requests.remove(&id) {
                    self.dispatch_established(request, session);
                }
            }
            Err(err) => {
                request.failures += 1;
                debug!(
                    request = %id,
                    addr = %addr,
                    error = %err,
                    failures = request.failures,
                    remaining = request.candidates.len() - request.attempts,
                    "candidate failed"
                );
                if request.is_exhausted() {
                    self.park(id);
                } else {
                    request.status = RequestStatus::Failure;
                }
            }
        }
    }

    /// Moves a request to `WaitingAlt` and asks its failure handler what next.
    fn park(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.status = RequestStatus::WaitingAlt;
        request.parked_at = Some(Instant::now());

        let Some(handler) = self.handlers.connect.get(&request.kind).cloned() else {
            warn!(request = %id, kind = ?request.kind, "no handler registered for request kind");
            self.requests.remove(&id);
            return;
        };

        let ctx = request.ctx.clone();
        let weak_tx = self.weak_tx.clone();
        tokio::spawn(async move {
            let call = tokio::spawn(async move { handler.failure(id, ctx).await });
            let action = match call.await {
                Ok(action) => action,
                Err(e) => {
                    if e.is_panic() {
                        warn!(request = %id, handler = "failure", "connection handler panicked");
                    }
                    FailureAction::GiveUp
                }
            };
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(Command::FailureResolved { id, action }).await;
            }
        });
    }

    fn failure_resolved(&mut self, id: RequestId, action: FailureAction) {
        let waiting = self
            .requests
            .get(&id)
            .map(|r| r.status == RequestStatus::WaitingAlt)
            .unwrap_or(false);
        if !waiting {
            return;
        }

        match action {
            FailureAction::WaitAlternative => {
                debug!(request = %id, "waiting for alternative route");
            }
            FailureAction::GiveUp => {
                if let Some(request) = self.requests.remove(&id) {
                    if request.is_exhausted() {
                        self.dispatch_final_failure(request);
                    } else {
                        debug!(request = %id, "request without usable candidates dropped");
                    }
                }
            }
        }
    }

    fn dispatch_established(&self, request: Request<C>, session: SessionRef) {
        let Some(handler) = self.handlers.connect.get(&request.kind).cloned() else {
            warn!(request = %request.id, kind = ?request.kind, "no handler registered for request kind");
            return;
        };
        let Request { id, ctx, .. } = request;
        dispatch("established", id, async move {
            handler.established(id, session, ctx).await;
        });
    }

    fn dispatch_final_failure(&self, request: Request<C>) {
        info!(
            request = %request.id,
            kind = ?request.kind,
            attempts = request.attempts,
            failures = request.failures,
            "connection request failed"
        );
        let Some(handler) = self.handlers.connect.get(&request.kind).cloned() else {
            return;
        };
        let Request { id, ctx, .. } = request;
        dispatch("final_failure", id, async move {
            handler.final_failure(id, ctx).await;
        });
    }

    fn listen(
        &mut self,
        kind: ListenKind,
        port_start: u16,
        port_end: u16,
        ttl: Option<Duration>,
        ctx: C,
    ) -> RequestId {
        let id = RequestId::random();
        self.listens.insert(id, ListenRequest { kind, ttl, ctx });

        let binder = self.binder.clone();
        let weak_tx = self.weak_tx.clone();
        tokio::spawn(async move {
            let mut retries = 0usize;
            let mut outcome = Err(0);
            if port_start <= port_end {
                for port in port_start..=port_end {
                    match binder.bind(port).await {
                        Ok(handle) => {
                            outcome = Ok((handle, retries));
                            break;
                        }
                        Err(e) => {
                            trace!(port, error = %e, "bind failed, trying next port");
                            retries += 1;
                        }
                    }
                }
            }
            if let Err(tried) = &mut outcome {
                *tried = retries;
            }
            if let Some(tx) = weak_tx.upgrade() {
                let _ = tx.send(Command::ListenFinished { id, outcome }).await;
            }
        });
        id
    }

    fn listen_finished(&mut self, id: RequestId, outcome: Result<(ListeningHandle, usize), usize>) {
        let Some(listen) = self.listens.remove(&id) else {
            return;
        };
        let handler = self.handlers.listen.get(&listen.kind).cloned();

        match outcome {
            Ok((mut handle, retries)) => {
                let port = handle.port();
                let incoming = handle.take_incoming();
                info!(port, kind = ?listen.kind, retries, "listening");
                self.local.add_port(port);
                self.open.insert(
                    port,
                    OpenListening {
                        kind: listen.kind,
                        opened_at: Instant::now(),
                        ttl: listen.ttl,
                        retries,
                        handle,
                    },
                );
                match (handler, incoming) {
                    (Some(handler), Some(incoming)) => {
                        let ctx = listen.ctx;
                        dispatch("listen_established", id, async move {
                            handler.established(port, incoming, ctx).await;
                        });
                    }
                    _ => warn!(port, kind = ?listen.kind, "no listen handler registered"),
                }
            }
            Err(tried) => {
                warn!(kind = ?listen.kind, tried, "no port in range could be bound");
                if let Some(handler) = handler {
                    let ctx = listen.ctx;
                    dispatch("listen_failure", id, async move {
                        handler.failure(ctx).await;
                    });
                }
            }
        }
    }

    fn sweep_listenings(&mut self, now: Instant) {
        let expired: Vec<u16> = self
            .open
            .iter()
            .filter(|(_, open)| {
                open.ttl
                    .map(|ttl| now.saturating_duration_since(open.opened_at) > ttl)
                    .unwrap_or(false)
            })
            .map(|(port, _)| *port)
            .collect();
        for port in expired {
            debug!(port, "closing expired listening port");
            self.close_listening(port);
        }
    }

    fn close_listening(&mut self, port: u16) -> bool {
        match self.open.remove(&port) {
            Some(open) => {
                self.local.remove_port(port);
                open.handle.close();
                true
            }
            None => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DialFault, MemoryNetwork, MemorySession};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Established(RequestId, Option<AddressCandidate>),
        Failure(RequestId),
        FinalFailure(RequestId),
        Listening(u16),
        ListenFailed,
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
        action: FailureAction,
        panic_on_established: bool,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler<u32> for Recorder {
        async fn established(&self, request: RequestId, session: SessionRef, _ctx: u32) {
            if self.panic_on_established {
                panic!("handler bug");
            }
            let _ = self.events.send(Event::Established(request, session.peer_addr()));
        }

        async fn failure(&self, request: RequestId, _ctx: u32) -> FailureAction {
            self.failures.fetch_add(1, Ordering::SeqCst);
            let _ = self.events.send(Event::Failure(request));
            self.action
        }

        async fn final_failure(&self, request: RequestId, _ctx: u32) {
            let _ = self.events.send(Event::FinalFailure(request));
        }
    }

    #[async_trait]
    impl ListenHandler<u32> for Recorder {
        async fn established(&self, port: u16, _incoming: mpsc::Receiver<SessionRef>, _ctx: u32) {
            let _ = self.events.send(Event::Listening(port));
        }

        async fn failure(&self, _ctx: u32) {
            let _ = self.events.send(Event::ListenFailed);
        }
    }

    struct Harness {
        network: MemoryNetwork,
        manager: ConnectionRequests<u32>,
        events: mpsc::UnboundedReceiver<Event>,
        local: LocalEndpoints,
    }

    fn addr(s: &str) -> AddressCandidate {
        AddressCandidate::parse(s).unwrap()
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            // Ticks are driven by hand.
            tick_interval: Duration::from_secs(3600),
            dial_timeout: Duration::from_millis(50),
            alternative_timeout: Duration::from_secs(3600),
            use_ipv6: false,
            local_networks: vec!["10.0.0.0/8".parse().unwrap()],
            detect_local_networks: false,
        }
    }

    fn harness_with(config: ConnectionConfig, action: FailureAction, panic_on_established: bool) -> Harness {
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.host("10.0.0.1"));
        let (tx, events) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            events: tx,
            action,
            panic_on_established,
            failures: AtomicUsize::new(0),
        });
        let local = LocalEndpoints::new();
        local.add_host("10.0.0.1");
        let handlers = HandlerTable::new()
            .on_connect(RequestKind::TaskRequest, recorder.clone())
            .on_listen(ListenKind::Task, recorder);
        let manager = ConnectionRequests::spawn(config, transport.clone(), transport, local.clone(), handlers);
        Harness {
            network,
            manager,
            events,
            local,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), FailureAction::GiveUp, false)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    /// Waits until the request has no dial in flight.
    async fn settle(manager: &ConnectionRequests<u32>, id: RequestId) -> Option<RequestSnapshot> {
        for _ in 0..200 {
            match manager.snapshot(id).await.unwrap() {
                Some(s) if s.status == RequestStatus::Waiting => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                other => return other,
            }
        }
        panic!("request stayed in Waiting");
    }

    async fn serve(network: &MemoryNetwork, host: &str, port: u16) -> ListeningHandle {
        network.host(host).bind(port).await.unwrap()
    }

    #[tokio::test]
    async fn two_failures_then_success() {
        let mut h = harness();
        let (a, b, c) = (addr("10.0.0.2:1"), addr("10.0.0.3:1"), addr("10.0.0.4:1"));
        h.network.set_fault(&a, DialFault::Hang);
        h.network.set_fault(&b, DialFault::Fail(DialError::Timeout));
        let _server = serve(&h.network, "10.0.0.4", 1).await;

        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![a.clone(), b.clone(), c.clone()], 7)
            .await
            .unwrap();

        h.manager.tick().await.unwrap();
        let s = settle(&h.manager, id).await.unwrap();
        assert_eq!((s.status, s.attempts, s.failures), (RequestStatus::Failure, 1, 1));

        h.manager.tick().await.unwrap();
        let s = settle(&h.manager, id).await.unwrap();
        assert_eq!((s.status, s.attempts, s.failures), (RequestStatus::Failure, 2, 2));

        h.manager.tick().await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::Established(id, Some(c.clone())));
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
        assert_eq!(h.network.dials(), vec![a, b, c]);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn exhaustion_reports_final_failure_once() {
        let mut h = harness();
        let candidates = vec![addr("10.0.0.2:1"), addr("10.0.0.3:1"), addr("10.0.0.4:1")];
        let id = h
            .manager
            .connect(RequestKind::TaskRequest, candidates.clone(), 1)
            .await
            .unwrap();

        for _ in 0..candidates.len() {
            h.manager.tick().await.unwrap();
            settle(&h.manager, id).await;
        }

        assert_eq!(next_event(&mut h.events).await, Event::Failure(id));
        assert_eq!(next_event(&mut h.events).await, Event::FinalFailure(id));
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);

        // Further ticks change nothing.
        h.manager.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.network.dials().len(), candidates.len());
    }

    fn slow_dial_config() -> ConnectionConfig {
        ConnectionConfig {
            dial_timeout: Duration::from_secs(30),
            ..config()
        }
    }

    #[tokio::test]
    async fn at_most_one_dial_in_flight_per_request() {
        let h = harness_with(slow_dial_config(), FailureAction::GiveUp, false);
        let (a, b) = (addr("10.0.0.2:1"), addr("10.0.0.3:1"));
        h.network.set_fault(&a, DialFault::Hang);
        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![a.clone(), b.clone()], 1)
            .await
            .unwrap();

        h.manager.tick().await.unwrap();
        h.manager.tick().await.unwrap();
        h.manager.tick().await.unwrap();

        let s = h.manager.snapshot(id).await.unwrap().unwrap();
        assert_eq!(s.status, RequestStatus::Waiting);
        assert_eq!(s.attempts, 1);
        assert_eq!(h.network.dial_count(&b), 0);
    }

    #[tokio::test]
    async fn own_listening_address_is_never_dialed() {
        let mut h = harness();
        h.local.add_port(4000);
        let own = addr("10.0.0.1:4000");

        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![own.clone()], 1)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();

        assert_eq!(next_event(&mut h.events).await, Event::Failure(id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.network.dial_count(&own), 0);
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
        // Not exhausted: there was nothing to try.
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn inaccessible_candidates_are_dropped() {
        let h = harness();
        let id = h
            .manager
            .connect(
                RequestKind::TaskRequest,
                vec![addr("[2001:db8::1]:1"), addr("192.168.5.5:1"), addr("8.8.8.8:1")],
                1,
            )
            .await
            .unwrap();
        let s = h.manager.snapshot(id).await.unwrap().unwrap();
        assert_eq!(s.candidates, vec![addr("8.8.8.8:1")]);
    }

    #[tokio::test]
    async fn cancelled_request_absorbs_late_dial() {
        let mut h = harness();
        let target = addr("10.0.0.2:1");
        h.network.set_fault(&target, DialFault::Hang);

        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![target.clone()], 1)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();
        assert!(h.manager.cancel(id).await.unwrap());

        // The hanging dial reports back after its timeout and is ignored.
        tokio::time::sleep(Duration::from_millis(120)).await;
        h.manager.tick().await.unwrap();
        assert!(h.events.try_recv().is_err());
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
        assert_eq!(h.network.dial_count(&target), 1);
    }

    #[tokio::test]
    async fn inbound_connection_marks_request_connected() {
        let h = harness();
        let (a, b) = (addr("10.0.0.2:1"), addr("10.0.0.3:1"));
        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![a.clone(), b.clone()], 1)
            .await
            .unwrap();

        assert!(h.manager.mark_connected(id, b.clone()).await.unwrap());
        let s = h.manager.snapshot(id).await.unwrap().unwrap();
        assert_eq!(s.status, RequestStatus::Connected);
        assert_eq!(s.candidates, vec![b, a]);

        h.manager.tick().await.unwrap();
        assert!(h.network.dials().is_empty());
        assert!(!h.manager.cancel(id).await.unwrap());

        h.manager.verified(id).await.unwrap();
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn parked_request_accepts_delivered_session() {
        let mut h = harness_with(config(), FailureAction::WaitAlternative, false);
        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![addr("10.0.0.2:1")], 1)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::Failure(id));

        let s = h.manager.snapshot(id).await.unwrap().unwrap();
        assert_eq!(s.status, RequestStatus::WaitingAlt);

        let (session, _other) = MemorySession::pair(addr("10.0.0.9:9"), addr("10.0.0.1:9"));
        assert!(h.manager.deliver(id, session as SessionRef).await.unwrap());
        assert_eq!(
            next_event(&mut h.events).await,
            Event::Established(id, Some(addr("10.0.0.9:9")))
        );
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn parked_request_times_out_into_final_failure() {
        let mut cfg = config();
        cfg.alternative_timeout = Duration::from_millis(10);
        let mut h = harness_with(cfg, FailureAction::WaitAlternative, false);
        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![addr("10.0.0.2:1")], 1)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::Failure(id));

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.manager.tick().await.unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::FinalFailure(id));
    }

    #[tokio::test]
    async fn duplicate_address_waits_for_first_dial() {
        let h = harness_with(slow_dial_config(), FailureAction::GiveUp, false);
        let shared = addr("10.0.0.2:1");
        h.network.set_fault(&shared, DialFault::Hang);

        let first = h
            .manager
            .connect(RequestKind::TaskRequest, vec![shared.clone()], 1)
            .await
            .unwrap();
        let second = h
            .manager
            .connect(RequestKind::TaskRequest, vec![shared.clone()], 2)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();

        let a = h.manager.snapshot(first).await.unwrap().unwrap();
        let b = h.manager.snapshot(second).await.unwrap().unwrap();
        assert_eq!(a.attempts + b.attempts, 1);
        assert_eq!(h.network.dial_count(&shared), 1);
    }

    #[tokio::test]
    async fn listen_skips_ports_in_use() {
        let mut h = harness();
        let host = h.network.host("10.0.0.1");
        let _a = host.bind(8000).await.unwrap();
        let _b = host.bind(8001).await.unwrap();

        h.manager
            .listen(ListenKind::Task, 8000, 8002, None, 1)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::Listening(8002));

        let listening = h.manager.listening().await.unwrap();
        assert_eq!(
            listening,
            vec![ListeningSnapshot {
                port: 8002,
                kind: ListenKind::Task,
                retries: 2
            }]
        );
        assert!(h.local.is_self(&addr("10.0.0.1:8002")));
    }

    #[tokio::test]
    async fn listen_range_exhaustion_reports_failure() {
        let mut h = harness();
        let host = h.network.host("10.0.0.1");
        let _a = host.bind(8000).await.unwrap();

        h.manager
            .listen(ListenKind::Task, 8000, 8000, None, 1)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::ListenFailed);
        assert!(h.manager.listening().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_listening_ports_are_swept() {
        let mut h = harness();
        h.manager
            .listen(ListenKind::Task, 9000, 9000, Some(Duration::from_millis(10)), 1)
            .await
            .unwrap();
        assert_eq!(next_event(&mut h.events).await, Event::Listening(9000));
        assert!(h.network.is_bound("10.0.0.1", 9000));

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.manager.tick().await.unwrap();
        assert!(!h.network.is_bound("10.0.0.1", 9000));
        assert!(h.manager.listening().await.unwrap().is_empty());
        assert!(!h.local.is_self(&addr("10.0.0.1:9000")));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_break_manager() {
        let h = harness_with(config(), FailureAction::GiveUp, true);
        let _server = serve(&h.network, "10.0.0.2", 1).await;

        h.manager
            .connect(RequestKind::TaskRequest, vec![addr("10.0.0.2:1")], 1)
            .await
            .unwrap();
        h.manager.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let id = h
            .manager
            .connect(RequestKind::TaskRequest, vec![addr("10.0.0.3:1")], 1)
            .await
            .unwrap();
        assert!(h.manager.snapshot(id).await.unwrap().is_some());
        assert_eq!(h.manager.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let h = harness();
        let ghost = RequestId::random();
        assert!(!h.manager.cancel(ghost).await.unwrap());
        assert!(!h.manager.mark_connected(ghost, addr("10.0.0.2:1")).await.unwrap());
        h.manager.final_failure(ghost).await.unwrap();
        h.manager.verified(ghost).await.unwrap();
        assert_eq!(h.manager.pending_count().await.unwrap(), 0);
    }
}
