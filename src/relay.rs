//! Middleman relay hub with an actor-based architecture.
//!
//! Runs on supernodes. When two peers cannot reach each other directly, both
//! open a session to the supernode and the hub forwards frames between them.
//!
//! # Architecture
//!
//! - `RelayHub`: the public handle (cheap to clone, sends commands to the actor)
//! - `RelayHubActor`: owns all relay sessions, processes commands sequentially
//! - one pump task per complete session copies frames in both directions
//!
//! # Session lifecycle
//!
//! ```text
//! asking node --Middleman--> register()  -> pending (leg A only)
//! destination --JoinMiddlemanConn--> complete() -> identity check -> MiddlemanReady on both legs
//!                                                                   -> pump until either leg ends
//! ```
//!
//! Either leg ending closes the other one. Pending sessions expire after
//! `relay_pending_timeout`, complete ones after `relay_idle_timeout` without
//! traffic.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RendezvousConfig;
use crate::identity::Identity;
use crate::messages::Message;
use crate::rendezvous::RendezvousId;
use crate::transport::SessionRef;


// ============================================================================
// Constants
// ============================================================================

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

const COMMAND_QUEUE: usize = 256;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("relay is at capacity")]
    Capacity,
    #[error("relay session already exists")]
    Duplicate,
    #[error("relay session not found")]
    NotFound,
    #[error("peer identity does not match the relay session")]
    IdentityMismatch,
    #[error("relay session already complete")]
    AlreadyComplete,
    #[error("relay hub closed")]
    Closed,
}


// ============================================================================
// Session Types
// ============================================================================

struct RelaySession {
    rendezvous: RendezvousId,
    asking: Identity,
    target: Identity,
    leg_a: SessionRef,
    leg_b: Option<SessionRef>,
    created_at: Instant,
    last_activity: Instant,
    bytes_relayed: u64,
    frames_relayed: u64,
}

impl RelaySession {
    fn new_pending(rendezvous: RendezvousId, asking: Identity, target: Identity, leg_a: SessionRef) -> Self {
        let now = Instant::now();
        Self {
            rendezvous,
            asking,
            target,
            leg_a,
            leg_b: None,
            created_at: now,
            last_activity: now,
            bytes_relayed: 0,
            frames_relayed: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.leg_b.is_some()
    }

    fn is_expired(&self, now: Instant, pending_timeout: Duration, idle_timeout: Duration) -> bool {
        let idle = now.saturating_duration_since(self.last_activity);
        if self.is_complete() {
            idle > idle_timeout
        } else {
            idle > pending_timeout
        }
    }

    /// A leg ended; the session cannot carry traffic anymore.
    fn is_broken(&self) -> bool {
        self.leg_a.is_closed() || self.leg_b.as_ref().map(|b| b.is_closed()).unwrap_or(false)
    }

    fn record_activity(&mut self, bytes: usize) {
        self.last_activity = Instant::now();
        self.bytes_relayed += bytes as u64;
        self.frames_relayed += 1;
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            asking: self.asking,
            target: self.target,
            complete: self.is_complete(),
            age: self.created_at.elapsed(),
            bytes_relayed: self.bytes_relayed,
            frames_relayed: self.frames_relayed,
        }
    }

    fn legs(&self) -> Vec<SessionRef> {
        let mut legs = vec![self.leg_a.clone()];
        legs.extend(self.leg_b.clone());
        legs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub asking: Identity,
    pub target: Identity,
    pub complete: bool,
    pub age: Duration,
    pub bytes_relayed: u64,
    pub frames_relayed: u64,
}


// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum RelayCommand {
    Register {
        rendezvous: RendezvousId,
        asking: Identity,
        target: Identity,
        leg: SessionRef,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Complete {
        rendezvous: RendezvousId,
        from: Identity,
        leg: SessionRef,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Activity {
        rendezvous: RendezvousId,
        bytes: usize,
    },
    PumpFinished {
        rendezvous: RendezvousId,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        rendezvous: RendezvousId,
        reply: oneshot::Sender<Option<RelayStats>>,
    },
    Sweep {
        reply: oneshot::Sender<()>,
    },
    Quit,
}


// ============================================================================
// RelayHub Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct RelayHub {
    cmd_tx: mpsc::Sender<RelayCommand>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl RelayHub {
    pub fn spawn(config: &RendezvousConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = RelayHubActor {
            sessions: HashMap::new(),
            max_sessions: config.max_relay_sessions,
            pending_timeout: config.relay_pending_timeout,
            idle_timeout: config.relay_idle_timeout,
            weak_tx: cmd_tx.downgrade(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Registers the asking node's leg; the session waits for `target`.
    pub async fn register(
        &self,
        rendezvous: RendezvousId,
        asking: Identity,
        target: Identity,
        leg: SessionRef,
    ) -> Result<(), RelayError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Register {
                rendezvous,
                asking,
                target,
                leg,
                reply,
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        reply_rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Attaches the destination's leg and starts forwarding.
    pub async fn complete(&self, rendezvous: RendezvousId, from: Identity, leg: SessionRef) -> Result<(), RelayError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Complete {
                rendezvous,
                from,
                leg,
                reply,
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        reply_rx.await.map_err(|_| RelayError::Closed)?
    }

    pub async fn session_count(&self) -> usize {
        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::SessionCount { reply }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn stats(&self, rendezvous: RendezvousId) -> Option<RelayStats> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RelayCommand::Stats { rendezvous, reply })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Runs the cleanup pass now instead of waiting for the interval.
    pub async fn sweep(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::Sweep { reply }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }
}


// ============================================================================
// Actor
// ============================================================================

struct RelayHubActor {
    sessions: HashMap<RendezvousId, RelaySession>,
    max_sessions: usize,
    pending_timeout: Duration,
    idle_timeout: Duration,
    weak_tx: mpsc::WeakSender<RelayCommand>,
}

fn close_all(legs: Vec<SessionRef>) {
    if legs.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for leg in legs {
            leg.close().await;
        }
    });
}

impl RelayHubActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await;

        info!("relay hub started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Register { rendezvous, asking, target, leg, reply }) => {
                            let _ = reply.send(self.register(rendezvous, asking, target, leg));
                        }
                        Some(RelayCommand::Complete { rendezvous, from, leg, reply }) => {
                            let _ = reply.send(self.complete(rendezvous, from, leg));
                        }
                        Some(RelayCommand::Activity { rendezvous, bytes }) => {
                            if let Some(session) = self.sessions.get_mut(&rendezvous) {
                                session.record_activity(bytes);
                            }
                        }
                        Some(RelayCommand::PumpFinished { rendezvous }) => {
                            self.teardown(&rendezvous, "leg closed");
                        }
                        Some(RelayCommand::SessionCount { reply }) => {
                            let _ = reply.send(self.sessions.len());
                        }
                        Some(RelayCommand::Stats { rendezvous, reply }) => {
                            let _ = reply.send(self.sessions.get(&rendezvous).map(RelaySession::stats));
                        }
                        Some(RelayCommand::Sweep { reply }) => {
                            self.cleanup_expired();
                            let _ = reply.send(());
                        }
                        Some(RelayCommand::Quit) | None => {
                            debug!("relay hub shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_expired();
                }
            }
        }

        for (_, session) in self.sessions.drain() {
            close_all(session.legs());
        }
    }

    fn register(
        &mut self,
        rendezvous: RendezvousId,
        asking: Identity,
        target: Identity,
        leg: SessionRef,
    ) -> Result<(), RelayError> {
        if self.sessions.len() >= self.max_sessions {
            warn!(rendezvous = %rendezvous, "relay at capacity, rejecting session");
            return Err(RelayError::Capacity);
        }
        if self.sessions.contains_key(&rendezvous) {
            return Err(RelayError::Duplicate);
        }

        self.sessions
            .insert(rendezvous, RelaySession::new_pending(rendezvous, asking, target, leg));
        debug!(
            rendezvous = %rendezvous,
            asking = %asking.short(),
            target = %target.short(),
            "registered relay session (waiting for target)"
        );
        Ok(())
    }

    fn complete(&mut self, rendezvous: RendezvousId, from: Identity, leg: SessionRef) -> Result<(), RelayError> {
        let session = self.sessions.get(&rendezvous).ok_or(RelayError::NotFound)?;

        if session.target != from {
            warn!(
                rendezvous = %rendezvous,
                expected = %session.target.short(),
                got = %from.short(),
                "identity mismatch on relay join, removing session"
            );
            self.teardown(&rendezvous, "identity mismatch");
            return Err(RelayError::IdentityMismatch);
        }

        let session = self.sessions.get_mut(&rendezvous).ok_or(RelayError::NotFound)?;
        if session.is_complete() {
            return Err(RelayError::AlreadyComplete);
        }

        session.leg_b = Some(leg.clone());
        session.last_activity = Instant::now();
        info!(
            rendezvous = %rendezvous,
            asking = %session.asking.short(),
            target = %session.target.short(),
            "relay session complete"
        );

        tokio::spawn(pump(rendezvous, session.leg_a.clone(), leg, self.weak_tx.clone()));
        Ok(())
    }

    fn teardown(&mut self, rendezvous: &RendezvousId, why: &'static str) {
        if let Some(session) = self.sessions.remove(rendezvous) {
            debug!(
                rendezvous = %rendezvous,
                bytes = session.bytes_relayed,
                frames = session.frames_relayed,
                why,
                "relay session closed"
            );
            close_all(session.legs());
        }
    }

    fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let pending_timeout = self.pending_timeout;
        let idle_timeout = self.idle_timeout;

        let broken: Vec<RendezvousId> = self
            .sessions
            .values()
            .filter(|s| s.is_broken())
            .map(|s| s.rendezvous)
            .collect();
        for id in broken {
            self.teardown(&id, "leg closed");
        }

        let expired: Vec<RendezvousId> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now, pending_timeout, idle_timeout))
            .map(|s| s.rendezvous)
            .collect();
        for id in expired {
            self.teardown(&id, "expired");
        }
    }
}

/// Announces readiness on both legs, then copies frames until either leg ends.
async fn pump(rendezvous: RendezvousId, a: SessionRef, b: SessionRef, weak_tx: mpsc::WeakSender<RelayCommand>) {
    let ready = match (Message::MiddlemanReady { rendezvous }).encode() {
        Ok(ready) => ready,
        Err(e) => {
            warn!(rendezvous = %rendezvous, error = %e, "failed to encode MiddlemanReady");
            a.close().await;
            b.close().await;
            return;
        }
    };

    if a.send(ready.clone()).await.is_ok() && b.send(ready).await.is_ok() {
        tokio::select! {
            _ = forward(rendezvous, a.clone(), b.clone(), weak_tx.clone()) => {}
            _ = forward(rendezvous, b.clone(), a.clone(), weak_tx.clone()) => {}
        }
    }

    a.close().await;
    b.close().await;
    if let Some(tx) = weak_tx.upgrade() {
        let _ = tx.send(RelayCommand::PumpFinished { rendezvous }).await;
    }
}

async fn forward(rendezvous: RendezvousId, from: SessionRef, to: SessionRef, weak_tx: mpsc::WeakSender<RelayCommand>) {
    while let Some(frame) = from.recv().await {
        let bytes = frame.len();
        if to.send(frame).await.is_err() {
            break;
        }
        trace!(rendezvous = %rendezvous, bytes, "relayed frame");
        if let Some(tx) = weak_tx.upgrade() {
            let _ = tx.try_send(RelayCommand::Activity { rendezvous, bytes });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::address::AddressCandidate;
    use crate::identity::Keypair;
    use crate::transport::{MemorySession, Session};

    fn addr(s: &str) -> AddressCandidate {
        AddressCandidate::parse(s).unwrap()
    }

    /// Returns `(client side, hub side)`.
    fn leg(n: u8) -> (Arc<MemorySession>, SessionRef) {
        let (client, hub) = MemorySession::pair(addr("10.0.0.1:40103"), addr(&format!("10.0.0.{}:5000", n + 10)));
        (client, hub as SessionRef)
    }

    async fn recv_message(session: &Arc<MemorySession>) -> Message {
        let frame = tokio::time::timeout(Duration::from_secs(2), session.recv())
            .await
            .expect("recv timeout")
            .expect("session closed");
        Message::decode(&frame).unwrap()
    }

    async fn wait_closed(session: &Arc<MemorySession>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session stayed open");
    }

    fn ids() -> (Identity, Identity) {
        (Keypair::generate().identity(), Keypair::generate().identity())
    }

    #[tokio::test]
    async fn pairs_legs_and_forwards_both_ways() {
        let hub = RelayHub::spawn(&RendezvousConfig::default());
        let (asking, target) = ids();
        let rendezvous = RendezvousId::random();
        let (a_client, a_hub) = leg(1);
        let (b_client, b_hub) = leg(2);

        hub.register(rendezvous, asking, target, a_hub).await.unwrap();
        assert_eq!(hub.session_count().await, 1);
        assert!(!hub.stats(rendezvous).await.unwrap().complete);

        hub.complete(rendezvous, target, b_hub).await.unwrap();
        assert_eq!(recv_message(&a_client).await, Message::MiddlemanReady { rendezvous });
        assert_eq!(recv_message(&b_client).await, Message::MiddlemanReady { rendezvous });

        a_client.send(b"to b".to_vec()).await.unwrap();
        b_client.send(b"to a".to_vec()).await.unwrap();
        let at_b = tokio::time::timeout(Duration::from_secs(2), b_client.recv()).await.unwrap();
        let at_a = tokio::time::timeout(Duration::from_secs(2), a_client.recv()).await.unwrap();
        assert_eq!(at_b.unwrap(), b"to b".to_vec());
        assert_eq!(at_a.unwrap(), b"to a".to_vec());

        let stats = hub.stats(rendezvous).await.unwrap();
        assert!(stats.complete);
        assert_eq!(stats.asking, asking);
    }

    #[tokio::test]
    async fn closing_one_leg_closes_the_other() {
        let hub = RelayHub::spawn(&RendezvousConfig::default());
        let (asking, target) = ids();
        let rendezvous = RendezvousId::random();
        let (a_client, a_hub) = leg(1);
        let (b_client, b_hub) = leg(2);

        hub.register(rendezvous, asking, target, a_hub).await.unwrap();
        hub.complete(rendezvous, target, b_hub).await.unwrap();
        recv_message(&a_client).await;
        recv_message(&b_client).await;

        a_client.close().await;
        wait_closed(&b_client).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.session_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn wrong_identity_removes_session() {
        let hub = RelayHub::spawn(&RendezvousConfig::default());
        let (asking, target) = ids();
        let intruder = Keypair::generate().identity();
        let rendezvous = RendezvousId::random();
        let (a_client, a_hub) = leg(1);
        let (b_client, b_hub) = leg(2);

        hub.register(rendezvous, asking, target, a_hub).await.unwrap();
        assert_eq!(
            hub.complete(rendezvous, intruder, b_hub).await,
            Err(RelayError::IdentityMismatch)
        );
        assert_eq!(hub.session_count().await, 0);
        wait_closed(&a_client).await;
        assert!(!b_client.is_closed());

        // The rightful target arrives too late.
        let (_c_client, c_hub) = leg(3);
        assert_eq!(hub.complete(rendezvous, target, c_hub).await, Err(RelayError::NotFound));
    }

    #[tokio::test]
    async fn duplicate_and_capacity_are_rejected() {
        let config = RendezvousConfig {
            max_relay_sessions: 1,
            ..RendezvousConfig::default()
        };
        let hub = RelayHub::spawn(&config);
        let (asking, target) = ids();
        let rendezvous = RendezvousId::random();

        hub.register(rendezvous, asking, target, leg(1).1).await.unwrap();
        assert_eq!(
            hub.register(RendezvousId::random(), asking, target, leg(2).1).await,
            Err(RelayError::Capacity)
        );

        let roomy = RelayHub::spawn(&RendezvousConfig::default());
        roomy.register(rendezvous, asking, target, leg(3).1).await.unwrap();
        assert_eq!(
            roomy.register(rendezvous, asking, target, leg(4).1).await,
            Err(RelayError::Duplicate)
        );
    }

    #[tokio::test]
    async fn pending_sessions_expire() {
        let config = RendezvousConfig {
            relay_pending_timeout: Duration::from_millis(10),
            ..RendezvousConfig::default()
        };
        let hub = RelayHub::spawn(&config);
        let (asking, target) = ids();
        let (a_client, a_hub) = leg(1);

        hub.register(RendezvousId::random(), asking, target, a_hub).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.sweep().await;

        assert_eq!(hub.session_count().await, 0);
        wait_closed(&a_client).await;
    }

    #[tokio::test]
    async fn pending_session_with_dead_leg_is_swept() {
        let hub = RelayHub::spawn(&RendezvousConfig::default());
        let (asking, target) = ids();
        let (a_client, a_hub) = leg(1);

        hub.register(RendezvousId::random(), asking, target, a_hub).await.unwrap();
        a_client.close().await;
        hub.sweep().await;
        assert_eq!(hub.session_count().await, 0);
    }
}
