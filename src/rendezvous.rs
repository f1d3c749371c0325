//! # Rendezvous Coordinator
//!
//! State machine for the asking side of a mediated connection: the asking
//! node could not dial the destination directly and asks a supernode that
//! is connected to the destination for help.
//!
//! ```text
//!  Requested --mediator connected--> AwaitingMediator
//!                                     |            |
//!                         NatHole (punch mode)   MiddlemanReady (relay mode)
//!                                     v            v
//!                             PunchInProgress   RelayEstablished
//!                                     |            |
//!                       punched session         relay leg delivered
//!                                     v            v
//!                                   Resolved <-----+
//!
//!  punch dial failed / punch timeout / punch refused  ->  Requested (relay mode)
//!  mediator unreachable / relay refused / expiry      ->  Failed
//! ```
//!
//! The coordinator performs no I/O. Every input returns the
//! [`RendezvousAction`]s the caller must execute; `poll` drives timeouts.
//! It is generic over the session handle so it can be exercised without a
//! transport.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::AddressCandidate;
use crate::config::RendezvousConfig;
use crate::identity::{NatType, NodeInfo};
use crate::messages::Message;
use crate::pending::RequestId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RendezvousId([u8; 16]);

impl RendezvousId {
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        if getrandom::getrandom(&mut id).is_err() {
            rand::thread_rng().fill(&mut id);
        }
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RendezvousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RendezvousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RendezvousId({})", &hex::encode(self.0)[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RendezvousMode {
    NatPunch,
    Middleman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Requested,
    AwaitingMediator,
    PunchInProgress,
    RelayEstablished,
    Resolved,
    Failed,
}

impl RendezvousState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RendezvousState::Resolved | RendezvousState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("no supernode known for the destination")]
    NoSupernode,
    #[error("supernode is unreachable")]
    MediatorUnreachable,
    #[error("supernode refused to mediate")]
    Refused,
    #[error("rendezvous expired")]
    Expired,
}

/// NAT classes for which a hole punch is worth attempting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchPolicy {
    allowlist: Vec<NatType>,
}

impl Default for PunchPolicy {
    fn default() -> Self {
        Self::new(vec![NatType::OpenInternet, NatType::FullCone])
    }
}

impl PunchPolicy {
    pub fn new(allowlist: Vec<NatType>) -> Self {
        Self { allowlist }
    }

    /// Never punch; always relay.
    pub fn relay_only() -> Self {
        Self::new(Vec::new())
    }

    pub fn allows(&self, nat: NatType) -> bool {
        self.allowlist.contains(&nat)
    }

    pub fn mode_for(&self, nat: NatType) -> RendezvousMode {
        if self.allows(nat) {
            RendezvousMode::NatPunch
        } else {
            RendezvousMode::Middleman
        }
    }
}

/// Work the caller must carry out on behalf of the coordinator.
#[derive(Debug, Clone)]
pub enum RendezvousAction<S> {
    /// Open a session to the supernode for the given mode.
    ContactMediator {
        rendezvous: RendezvousId,
        mode: RendezvousMode,
        supernode: NodeInfo,
    },
    /// Send a message on an open mediator session.
    SendToMediator {
        rendezvous: RendezvousId,
        session: S,
        message: Message,
    },
    /// Dial the hole the supernode reported.
    DialPunch {
        rendezvous: RendezvousId,
        addr: AddressCandidate,
    },
    /// Hand a working session to the original request.
    Deliver { request: RequestId, session: S },
    /// The original request cannot be satisfied.
    FinalFailure {
        request: RequestId,
        error: RendezvousError,
    },
    CloseSession(S),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousSnapshot {
    pub id: RendezvousId,
    pub request: RequestId,
    pub mode: RendezvousMode,
    pub state: RendezvousState,
    pub fell_back: bool,
}

struct Rendezvous<S> {
    id: RendezvousId,
    request: RequestId,
    dest: NodeInfo,
    supernode: NodeInfo,
    mode: RendezvousMode,
    state: RendezvousState,
    created_at: Instant,
    state_since: Instant,
    mediator: Option<S>,
    fell_back: bool,
}

impl<S> Rendezvous<S> {
    fn enter(&mut self, state: RendezvousState, now: Instant) {
        trace!(
            rendezvous = %self.id,
            from = ?self.state,
            to = ?state,
            "rendezvous transition"
        );
        self.state = state;
        self.state_since = now;
    }
}

pub struct RendezvousCoordinator<S> {
    local: NodeInfo,
    policy: PunchPolicy,
    punch_timeout: Duration,
    expiry: Duration,
    sessions: HashMap<RendezvousId, Rendezvous<S>>,
}

impl<S> fmt::Debug for RendezvousCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousCoordinator")
            .field("policy", &self.policy)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl<S: Clone> RendezvousCoordinator<S> {
    pub fn new(local: NodeInfo, config: &RendezvousConfig) -> Self {
        Self {
            local,
            policy: PunchPolicy::new(config.punch_allowlist.clone()),
            punch_timeout: config.punch_timeout,
            expiry: config.session_expiry,
            sessions: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: PunchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Our own record as announced to mediators.
    pub fn set_local(&mut self, local: NodeInfo) {
        self.local = local;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self, id: RendezvousId) -> Option<RendezvousSnapshot> {
        self.sessions.get(&id).map(|r| RendezvousSnapshot {
            id: r.id,
            request: r.request,
            mode: r.mode,
            state: r.state,
            fell_back: r.fell_back,
        })
    }

    /// Rendezvous currently serving `request`.
    pub fn find_by_request(&self, request: RequestId) -> Option<RendezvousId> {
        self.sessions
            .values()
            .find(|r| r.request == request && !r.state.is_terminal())
            .map(|r| r.id)
    }

    /// Starts mediation for a request whose direct candidates are exhausted.
    pub fn start(
        &mut self,
        request: RequestId,
        dest: NodeInfo,
        supernode: Option<NodeInfo>,
        now: Instant,
    ) -> (RendezvousId, Vec<RendezvousAction<S>>) {
        let id = RendezvousId::random();
        let Some(supernode) = supernode else {
            debug!(request = %request, "no supernode for rendezvous");
            return (
                id,
                vec![RendezvousAction::FinalFailure {
                    request,
                    error: RendezvousError::NoSupernode,
                }],
            );
        };

        let mode = self.policy.mode_for(dest.nat_type);
        info!(
            rendezvous = %id,
            request = %request,
            dest = %dest.identity.short(),
            supernode = %supernode.identity.short(),
            nat = ?dest.nat_type,
            mode = ?mode,
            "starting rendezvous"
        );
        let actions = vec![RendezvousAction::ContactMediator {
            rendezvous: id,
            mode,
            supernode: supernode.clone(),
        }];
        self.sessions.insert(
            id,
            Rendezvous {
                id,
                request,
                dest,
                supernode,
                mode,
                state: RendezvousState::Requested,
                created_at: now,
                state_since: now,
                mediator: None,
                fell_back: false,
            },
        );
        (id, actions)
    }

    /// A session to the supernode is open; tell it what we need.
    pub fn mediator_connected(&mut self, id: RendezvousId, session: S, now: Instant) -> Vec<RendezvousAction<S>> {
        let local = self.local.clone();
        let Some(r) = self.sessions.get_mut(&id) else {
            return vec![RendezvousAction::CloseSession(session)];
        };
        if r.state != RendezvousState::Requested {
            return vec![RendezvousAction::CloseSession(session)];
        }

        let message = match r.mode {
            RendezvousMode::NatPunch => Message::NatPunch {
                rendezvous: id,
                asking: local,
                target: r.dest.identity,
                conn_id: r.request,
            },
            RendezvousMode::Middleman => Message::Middleman {
                rendezvous: id,
                asking: local,
                target: r.dest.identity,
                conn_id: r.request,
            },
        };
        r.mediator = Some(session.clone());
        r.enter(RendezvousState::AwaitingMediator, now);
        vec![RendezvousAction::SendToMediator {
            rendezvous: id,
            session,
            message,
        }]
    }

    /// The supernode could not be reached or dropped the mediator session.
    pub fn mediator_failed(&mut self, id: RendezvousId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some((mode, state)) = self.sessions.get(&id).map(|r| (r.mode, r.state)) else {
            return Vec::new();
        };
        match (mode, state) {
            (_, state) if state.is_terminal() => Vec::new(),
            // The relay may still work through the same supernode after a
            // refused punch.
            (RendezvousMode::NatPunch, RendezvousState::AwaitingMediator) => self.fall_back(id, now),
            _ => self.fail(id, RendezvousError::MediatorUnreachable, now),
        }
    }

    /// The supernode refused (destination not connected to it, or relay full).
    pub fn refused(&mut self, id: RendezvousId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some((mode, state)) = self.sessions.get(&id).map(|r| (r.mode, r.state)) else {
            return Vec::new();
        };
        match mode {
            RendezvousMode::NatPunch if !state.is_terminal() => self.fall_back(id, now),
            _ => self.fail(id, RendezvousError::Refused, now),
        }
    }

    /// The supernode reported the destination's punched address.
    pub fn nat_hole(&mut self, id: RendezvousId, addr: AddressCandidate, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if r.mode != RendezvousMode::NatPunch || r.state != RendezvousState::AwaitingMediator {
            warn!(rendezvous = %id, state = ?r.state, "unexpected NatHole");
            return Vec::new();
        }
        debug!(rendezvous = %id, addr = %addr, "dialing punched address");
        r.enter(RendezvousState::PunchInProgress, now);
        vec![RendezvousAction::DialPunch { rendezvous: id, addr }]
    }

    /// The punched dial produced a session.
    pub fn punch_succeeded(&mut self, id: RendezvousId, session: S, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(r) = self.sessions.get_mut(&id) else {
            return vec![RendezvousAction::CloseSession(session)];
        };
        if r.state != RendezvousState::PunchInProgress {
            return vec![RendezvousAction::CloseSession(session)];
        }
        info!(rendezvous = %id, request = %r.request, "hole punch succeeded");
        r.enter(RendezvousState::Resolved, now);
        let mut actions = vec![RendezvousAction::Deliver {
            request: r.request,
            session,
        }];
        if let Some(mediator) = r.mediator.take() {
            actions.push(RendezvousAction::CloseSession(mediator));
        }
        actions
    }

    pub fn punch_failed(&mut self, id: RendezvousId, now: Instant) -> Vec<RendezvousAction<S>> {
        let punching = self
            .sessions
            .get(&id)
            .map(|r| r.state == RendezvousState::PunchInProgress)
            .unwrap_or(false);
        if punching {
            self.fall_back(id, now)
        } else {
            Vec::new()
        }
    }

    /// The supernode paired both relay legs; the mediator session now
    /// carries the destination's traffic.
    pub fn relay_ready(&mut self, id: RendezvousId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if r.mode != RendezvousMode::Middleman || r.state != RendezvousState::AwaitingMediator {
            warn!(rendezvous = %id, state = ?r.state, "unexpected MiddlemanReady");
            return Vec::new();
        }
        let Some(session) = r.mediator.take() else {
            return Vec::new();
        };
        r.enter(RendezvousState::RelayEstablished, now);
        info!(rendezvous = %id, request = %r.request, "relay established");
        let request = r.request;
        r.enter(RendezvousState::Resolved, now);
        vec![RendezvousAction::Deliver { request, session }]
    }

    /// The request was satisfied by another route (the destination dialed
    /// us back). Tears down whatever the rendezvous still holds.
    pub fn resolved_elsewhere(&mut self, request: RequestId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(id) = self.find_by_request(request) else {
            return Vec::new();
        };
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        debug!(rendezvous = %id, request = %request, "request satisfied by another route");
        r.enter(RendezvousState::Resolved, now);
        r.mediator
            .take()
            .map(RendezvousAction::CloseSession)
            .into_iter()
            .collect()
    }

    /// The original request ended on its own (cancelled or timed out);
    /// drops the rendezvous without reporting another failure.
    pub fn abandon(&mut self, request: RequestId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(id) = self.find_by_request(request) else {
            return Vec::new();
        };
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        debug!(rendezvous = %id, request = %request, "rendezvous abandoned");
        r.enter(RendezvousState::Failed, now);
        r.mediator
            .take()
            .map(RendezvousAction::CloseSession)
            .into_iter()
            .collect()
    }

    /// Drives timeouts and drops finished sessions.
    pub fn poll(&mut self, now: Instant) -> Vec<RendezvousAction<S>> {
        let mut actions = Vec::new();

        let expired: Vec<RendezvousId> = self
            .sessions
            .values()
            .filter(|r| !r.state.is_terminal() && now.saturating_duration_since(r.created_at) > self.expiry)
            .map(|r| r.id)
            .collect();
        for id in expired {
            actions.extend(self.fail(id, RendezvousError::Expired, now));
        }

        let punch_timed_out: Vec<RendezvousId> = self
            .sessions
            .values()
            .filter(|r| {
                r.mode == RendezvousMode::NatPunch
                    && matches!(
                        r.state,
                        RendezvousState::AwaitingMediator | RendezvousState::PunchInProgress
                    )
                    && now.saturating_duration_since(r.state_since) > self.punch_timeout
            })
            .map(|r| r.id)
            .collect();
        for id in punch_timed_out {
            debug!(rendezvous = %id, "hole punch timed out");
            actions.extend(self.fall_back(id, now));
        }

        self.sessions.retain(|_, r| !r.state.is_terminal());
        actions
    }

    fn fall_back(&mut self, id: RendezvousId, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if r.fell_back || r.mode == RendezvousMode::Middleman {
            return self.fail(id, RendezvousError::Refused, now);
        }
        info!(rendezvous = %id, request = %r.request, "falling back to relay");
        let mut actions: Vec<RendezvousAction<S>> = r
            .mediator
            .take()
            .map(RendezvousAction::CloseSession)
            .into_iter()
            .collect();
        r.mode = RendezvousMode::Middleman;
        r.fell_back = true;
        r.enter(RendezvousState::Requested, now);
        actions.push(RendezvousAction::ContactMediator {
            rendezvous: id,
            mode: RendezvousMode::Middleman,
            supernode: r.supernode.clone(),
        });
        actions
    }

    fn fail(&mut self, id: RendezvousId, error: RendezvousError, now: Instant) -> Vec<RendezvousAction<S>> {
        let Some(r) = self.sessions.get_mut(&id) else {
            return Vec::new();
        };
        if r.state.is_terminal() {
            return Vec::new();
        }
        info!(rendezvous = %id, request = %r.request, error = %error, "rendezvous failed");
        r.enter(RendezvousState::Failed, now);
        let mut actions: Vec<RendezvousAction<S>> = r
            .mediator
            .take()
            .map(RendezvousAction::CloseSession)
            .into_iter()
            .collect();
        actions.push(RendezvousAction::FinalFailure {
            request: r.request,
            error,
        });
        actions
    }
}
