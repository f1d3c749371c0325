//! # Transport Primitives
//!
//! The connectivity core consumes three boundary contracts:
//!
//! | Trait | Contract |
//! |-------|----------|
//! | [`Dialer`] | `dial(address, timeout) -> Session` or [`DialError`] |
//! | [`Binder`] | `bind(port) -> ListeningHandle` or [`BindError`] |
//! | [`Session`] | ordered, reliable exchange of opaque frames |
//!
//! Two implementations ship with the crate:
//!
//! - [`TcpTransport`]: TCP with a 4-byte big-endian length prefix per frame
//! - [`MemoryNetwork`]: in-process network of named hosts, with scriptable
//!   dial faults, for simulations and tests
//!
//! Frames are opaque here; what they contain is decided by the services.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, trace};

use crate::address::AddressCandidate;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const INCOMING_QUEUE: usize = 64;
const MEMORY_SESSION_QUEUE: usize = 256;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DialError {
    #[error("dial timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("address could not be resolved")]
    Unresolvable,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("port {0} already in use")]
    AddrInUse(u16),
    #[error("permission denied binding port {0}")]
    PermissionDenied(u16),
    #[error("bind failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("session I/O error: {0}")]
    Io(String),
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    /// Remote endpoint as observed from this side.
    fn peer_addr(&self) -> Option<AddressCandidate>;

    async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError>;

    /// Next frame, or `None` once the session is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

pub type SessionRef = Arc<dyn Session>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &AddressCandidate, timeout: Duration) -> Result<SessionRef, DialError>;
}

#[async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, port: u16) -> Result<ListeningHandle, BindError>;
}

/// A bound port. Accepted sessions arrive on the incoming channel; dropping
/// or closing the handle releases the port.
pub struct ListeningHandle {
    port: u16,
    incoming: Option<mpsc::Receiver<SessionRef>>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl ListeningHandle {
    pub fn new(
        port: u16,
        incoming: mpsc::Receiver<SessionRef>,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            port,
            incoming: Some(incoming),
            closer: Some(Box::new(closer)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<SessionRef>> {
        self.incoming.take()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for ListeningHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ListeningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListeningHandle")
            .field("port", &self.port)
            .field("open", &self.closer.is_some())
            .finish()
    }
}


// ============================================================================
// TCP
// ============================================================================

#[derive(Debug, Clone)]
pub struct TcpTransport {
    bind_ip: IpAddr,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl TcpTransport {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

#[async_trait]
impl Dialer for TcpTransport {
    async fn dial(&self, addr: &AddressCandidate, timeout: Duration) -> Result<SessionRef, DialError> {
        let target = match addr.socket_addr() {
            Some(target) => target,
            None => tokio::net::lookup_host((addr.host(), addr.port()))
                .await
                .map_err(|_| DialError::Unresolvable)?
                .next()
                .ok_or(DialError::Unresolvable)?,
        };

        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| DialError::Timeout)?
            .map_err(|e| {
                trace!(addr = %addr, error = %e, "tcp connect failed");
                DialError::Refused
            })?;
        let _ = stream.set_nodelay(true);

        Ok(Arc::new(TcpSession::new(stream)) as SessionRef)
    }
}

#[async_trait]
impl Binder for TcpTransport {
    async fn bind(&self, port: u16) -> Result<ListeningHandle, BindError> {
        let listener = TcpListener::bind((self.bind_ip, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => BindError::AddrInUse(port),
                std::io::ErrorKind::PermissionDenied => BindError::PermissionDenied(port),
                _ => BindError::Io(e.to_string()),
            })?;
        let bound_port = listener
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| BindError::Io(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        trace!(remote = %remote, port = bound_port, "accepted tcp session");
                        let _ = stream.set_nodelay(true);
                        let session: SessionRef = Arc::new(TcpSession::new(stream));
                        if tx.send(session).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(port = bound_port, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });
        let abort = task.abort_handle();

        info!(port = bound_port, "tcp listener bound");
        Ok(ListeningHandle::new(bound_port, rx, move || abort.abort()))
    }
}

pub struct TcpSession {
    id: SessionId,
    peer: Option<AddressCandidate>,
    reader: AsyncMutex<OwnedReadHalf>,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl TcpSession {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .ok()
            .and_then(|a| AddressCandidate::from_socket_addr(a).ok());
        let (reader, writer) = stream.into_split();
        let (closed, _) = watch::channel(false);
        Self {
            id: next_session_id(),
            peer,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed,
        }
    }

    async fn read_frame(reader: &mut OwnedReadHalf) -> Option<Vec<u8>> {
        let len = reader.read_u32().await.ok()? as usize;
        if len > MAX_FRAME_SIZE {
            return None;
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await.ok()?;
        Some(frame)
    }
}

#[async_trait]
impl Session for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer_addr(&self) -> Option<AddressCandidate> {
        self.peer.clone()
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(SessionError::FrameTooLarge(frame.len()));
        }
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_u32(frame.len() as u32).await?;
            writer.write_all(&frame).await
        }
        .await;
        if let Err(e) = result {
            self.closed.send_replace(true);
            return Err(SessionError::Io(e.to_string()));
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return None;
        }
        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            frame = Self::read_frame(&mut reader) => frame,
            _ = closed_rx.wait_for(|closed| *closed) => None,
        };
        if frame.is_none() {
            self.closed.send_replace(true);
        }
        frame
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}


// ============================================================================
// In-memory network
// ============================================================================

/// Scripted outcome for dials to one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFault {
    /// Fail immediately with the given error.
    Fail(DialError),
    /// Never answer; the dial runs into its timeout.
    Hang,
}

#[derive(Default)]
struct MemoryNetworkState {
    listeners: HashMap<(String, u16), mpsc::Sender<SessionRef>>,
    faults: HashMap<AddressCandidate, DialFault>,
    dials: Vec<AddressCandidate>,
}

/// An in-process network. Every host gets a [`MemoryTransport`] that dials
/// and binds within the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryNetworkState>>,
    ephemeral: Arc<AtomicU16>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            ephemeral: Arc::new(AtomicU16::new(50_000)),
        }
    }

    pub fn host(&self, host: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            host: host.into(),
        }
    }

    pub fn set_fault(&self, addr: &AddressCandidate, fault: DialFault) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(addr.clone(), fault);
        }
    }

    pub fn clear_fault(&self, addr: &AddressCandidate) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.remove(addr);
        }
    }

    /// Every address dialed so far, in order.
    pub fn dials(&self) -> Vec<AddressCandidate> {
        self.state.lock().map(|s| s.dials.clone()).unwrap_or_default()
    }

    pub fn dial_count(&self, addr: &AddressCandidate) -> usize {
        self.dials().iter().filter(|a| *a == addr).count()
    }

    pub fn is_bound(&self, host: &str, port: u16) -> bool {
        self.state
            .lock()
            .map(|s| s.listeners.contains_key(&(host.to_string(), port)))
            .unwrap_or(false)
    }

    fn next_ephemeral_port(&self) -> u16 {
        let port = self.ephemeral.fetch_add(1, Ordering::Relaxed);
        port.max(1)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    host: String,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport").field("host", &self.host).finish()
    }
}

impl MemoryTransport {
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Dialer for MemoryTransport {
    async fn dial(&self, addr: &AddressCandidate, timeout: Duration) -> Result<SessionRef, DialError> {
        let (fault, listener) = {
            let mut state = self.network.state.lock().map_err(|_| DialError::Refused)?;
            state.dials.push(addr.clone());
            let fault = state.faults.get(addr).copied();
            let listener = state
                .listeners
                .get(&(addr.host().to_string(), addr.port()))
                .cloned();
            (fault, listener)
        };

        match fault {
            Some(DialFault::Fail(err)) => return Err(err),
            Some(DialFault::Hang) => {
                tokio::time::sleep(timeout).await;
                return Err(DialError::Timeout);
            }
            None => {}
        }

        let Some(listener) = listener else {
            return Err(if addr.is_hostname() {
                DialError::Unresolvable
            } else {
                DialError::Refused
            });
        };

        let local = AddressCandidate::new(&self.host, self.network.next_ephemeral_port())
            .map_err(|_| DialError::Refused)?;
        let (client, server) = MemorySession::pair(addr.clone(), local);
        listener
            .send(server as SessionRef)
            .await
            .map_err(|_| DialError::Refused)?;
        Ok(client as SessionRef)
    }
}

#[async_trait]
impl Binder for MemoryTransport {
    async fn bind(&self, port: u16) -> Result<ListeningHandle, BindError> {
        let key = (self.host.clone(), port);
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        {
            let mut state = self
                .network
                .state
                .lock()
                .map_err(|e| BindError::Io(e.to_string()))?;
            if state.listeners.contains_key(&key) {
                return Err(BindError::AddrInUse(port));
            }
            state.listeners.insert(key.clone(), tx);
        }

        let state = self.network.state.clone();
        Ok(ListeningHandle::new(port, rx, move || {
            if let Ok(mut state) = state.lock() {
                state.listeners.remove(&key);
            }
        }))
    }
}

/// One end of an in-memory connection. Closing either end closes both.
pub struct MemorySession {
    id: SessionId,
    peer: AddressCandidate,
    tx: mpsc::Sender<Vec<u8>>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemorySession {
    /// Returns `(a, b)` where `a` sees `b_addr` as its peer and vice versa.
    pub fn pair(b_addr: AddressCandidate, a_addr: AddressCandidate) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_SESSION_QUEUE);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_SESSION_QUEUE);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let a = Arc::new(Self {
            id: next_session_id(),
            peer: b_addr,
            tx: a_tx,
            rx: AsyncMutex::new(a_rx),
            closed: closed.clone(),
        });
        let b = Arc::new(Self {
            id: next_session_id(),
            peer: a_addr,
            tx: b_tx,
            rx: AsyncMutex::new(b_rx),
            closed,
        });
        (a, b)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer_addr(&self) -> Option<AddressCandidate> {
        Some(self.peer.clone())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(SessionError::FrameTooLarge(frame.len()));
        }
        self.tx.send(frame).await.map_err(|_| SessionError::Closed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed_rx = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        // Frames sent before the close are still delivered, like a TCP FIN.
        if let Ok(frame) = rx.try_recv() {
            return Some(frame);
        }
        if *closed_rx.borrow() {
            return None;
        }
        tokio::select! {
            frame = rx.recv() => frame,
            _ = closed_rx.wait_for(|closed| *closed) => rx.try_recv().ok(),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> AddressCandidate {
        AddressCandidate::parse(s).unwrap()
    }

    #[tokio::test]
    async fn memory_dial_reaches_listener() {
        let network = MemoryNetwork::new();
        let server = network.host("10.0.0.2");
        let client = network.host("10.0.0.1");

        let mut handle = server.bind(4000).await.unwrap();
        let mut incoming = handle.take_incoming().unwrap();

        let session = client
            .dial(&addr("10.0.0.2:4000"), Duration::from_secs(1))
            .await
            .unwrap();
        let accepted = incoming.recv().await.unwrap();

        assert_eq!(session.peer_addr().unwrap(), addr("10.0.0.2:4000"));
        assert_eq!(accepted.peer_addr().unwrap().host(), "10.0.0.1");

        session.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), b"ping".to_vec());

        accepted.close().await;
        assert!(session.is_closed());
        assert!(session.recv().await.is_none());
        assert_eq!(session.send(vec![1]).await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn memory_bind_conflicts_and_release() {
        let network = MemoryNetwork::new();
        let host = network.host("10.0.0.2");

        let handle = host.bind(4000).await.unwrap();
        assert_eq!(host.bind(4000).await.unwrap_err(), BindError::AddrInUse(4000));
        handle.close();
        assert!(!network.is_bound("10.0.0.2", 4000));
        assert!(host.bind(4000).await.is_ok());
    }

    #[tokio::test]
    async fn memory_faults_and_refusals() {
        let network = MemoryNetwork::new();
        let client = network.host("10.0.0.1");
        let target = addr("10.0.0.9:1");

        assert_eq!(
            client.dial(&target, Duration::from_millis(10)).await.err(),
            Some(DialError::Refused)
        );
        assert_eq!(
            client.dial(&addr("nowhere.example:1"), Duration::from_millis(10)).await.err(),
            Some(DialError::Unresolvable)
        );

        network.set_fault(&target, DialFault::Hang);
        assert_eq!(
            client.dial(&target, Duration::from_millis(10)).await.err(),
            Some(DialError::Timeout)
        );
        assert_eq!(network.dial_count(&target), 2);
    }

    #[tokio::test]
    async fn tcp_frames_roundtrip_over_loopback() {
        let transport = TcpTransport::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let mut handle = transport.bind(0).await.unwrap();
        let port = handle.port();
        let mut incoming = handle.take_incoming().unwrap();

        let target = AddressCandidate::new("127.0.0.1", port).unwrap();
        let client = transport.dial(&target, Duration::from_secs(2)).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
            .await
            .unwrap()
            .unwrap();

        client.send(vec![7u8; 1000]).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), vec![7u8; 1000]);

        server.send(Vec::new()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Vec::<u8>::new());

        client.close().await;
        let eof = tokio::time::timeout(Duration::from_secs(2), server.recv()).await.unwrap();
        assert!(eof.is_none());
        assert!(server.is_closed());
    }
}
