//! # High-Level Node API
//!
//! A [`Node`] owns one overlay service, one task server and one relay hub,
//! all sharing the same transport and the same set of local endpoints.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = NodeConfig::default();
//! config.overlay.seeds = vec![AddressCandidate::parse("203.0.113.7:40102")?];
//! let node = Node::bind(config, "0.0.0.0").await?;
//!
//! let mut events = node.task_events().await?;
//! node.connect_task(RequestKind::TaskRequest, provider, None, vec![request]).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Start Order
//!
//! The task server binds first so the node record every Hello carries
//! already contains the task port. The overlay starts after it.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::address::AddressCandidate;
use crate::config::NodeConfig;
use crate::identity::{Identity, Keypair, NodeInfo};
use crate::messages::DisconnectReason;
use crate::p2p::{P2PService, PeerContext};
use crate::pending::{LocalEndpoints, RequestId, RequestKind};
use crate::relay::RelayHub;
use crate::task::{NeutralTrust, TaskEvent, TaskServer, TrustSource};
use crate::transport::{Binder, Dialer, TcpTransport};

/// A receiver that can be taken exactly once.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    keypair: Keypair,
    p2p: Arc<P2PService>,
    tasks: Arc<TaskServer>,
    relay: RelayHub,
    task_events: TakeOnce<TaskEvent>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identity", &self.keypair.identity().short())
            .finish()
    }
}

impl Node {
    /// Starts a node on TCP, listening on `bind_ip`, with a fresh keypair.
    pub async fn bind(config: NodeConfig, bind_ip: &str) -> Result<Self> {
        Self::bind_with_keypair(config, bind_ip, Keypair::generate()).await
    }

    pub async fn bind_with_keypair(config: NodeConfig, bind_ip: &str, keypair: Keypair) -> Result<Self> {
        let ip: IpAddr = bind_ip.parse().context("invalid bind address")?;
        let transport = Arc::new(TcpTransport::new(ip));
        let host = if ip.is_unspecified() {
            config.public_addr.clone().unwrap_or_else(|| ip.to_string())
        } else {
            ip.to_string()
        };
        Self::with_transport(
            keypair,
            config,
            transport.clone(),
            transport,
            &host,
            Arc::new(NeutralTrust),
        )
        .await
    }

    /// Starts a node on any transport. `host` is the address the node
    /// listens on, announced as its private address.
    pub async fn with_transport(
        keypair: Keypair,
        mut config: NodeConfig,
        dialer: Arc<dyn Dialer>,
        binder: Arc<dyn Binder>,
        host: &str,
        trust: Arc<dyn TrustSource>,
    ) -> Result<Self> {
        let identity = keypair.identity();

        let local = LocalEndpoints::new();
        local.add_host(host);
        if let Some(public) = &config.public_addr {
            local.add_host(public.as_str());
        }
        config.connections.learn_local_networks(host);
        debug!(networks = ?config.connections.local_networks, "reachable local networks");

        let name = if config.name.is_empty() {
            identity.short()
        } else {
            config.name.clone()
        };
        let mut node = NodeInfo::new(identity, name);
        node.prv_addr = Some(host.to_string());
        node.pub_addr = config.public_addr.clone();
        node.nat_type = config.nat_type;

        let relay = RelayHub::spawn(&config.rendezvous);
        let (p2p, overlay_events) = P2PService::new(
            keypair.clone(),
            &config,
            dialer.clone(),
            binder.clone(),
            local.clone(),
            node,
        );
        let (tasks, task_events) = TaskServer::new(&config, p2p.clone(), dialer, binder, local, relay.clone(), trust);

        tasks
            .start(overlay_events)
            .await
            .context("failed to start task server")?;
        p2p.start().await.context("failed to start overlay")?;

        let record = p2p.node_info().await;
        info!(
            identity = %identity.short(),
            host,
            p2p_port = ?record.p2p_prv_port,
            task_port = ?record.task_prv_port,
            supernode = record.is_supernode(),
            "node started"
        );

        Ok(Self {
            keypair,
            p2p,
            tasks,
            relay,
            task_events: Mutex::new(Some(task_events)),
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Our node record as announced to peers.
    pub async fn node_info(&self) -> NodeInfo {
        self.p2p.node_info().await
    }

    pub fn overlay(&self) -> &Arc<P2PService> {
        &self.p2p
    }

    pub fn tasks(&self) -> &Arc<TaskServer> {
        &self.tasks
    }

    pub fn relay(&self) -> &RelayHub {
        &self.relay
    }

    /// Sessions opened by or to this node. Can be taken once.
    pub async fn task_events(&self) -> Result<mpsc::Receiver<TaskEvent>> {
        self.task_events
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("task events already taken"))
    }

    /// Dials a peer known only by its overlay address.
    pub async fn add_seed(&self, addr: AddressCandidate) -> Result<RequestId> {
        self.p2p
            .requests()
            .connect(RequestKind::PeerConnect, vec![addr], PeerContext::default())
            .await
    }

    pub async fn connect_peer(&self, node: &NodeInfo) -> Result<Option<RequestId>> {
        self.p2p.connect(node).await
    }

    pub async fn peers(&self) -> Vec<NodeInfo> {
        self.p2p.peers().await
    }

    pub async fn peer_count(&self) -> usize {
        self.p2p.peer_count().await
    }

    pub async fn is_connected(&self, id: &Identity) -> bool {
        self.p2p.is_connected(id).await
    }

    pub async fn disconnect(&self, id: &Identity) {
        self.p2p.disconnect_peer(id, DisconnectReason::NoMoreMessages).await;
    }

    /// Opens a task session to `dest`; the outcome arrives on
    /// [`Node::task_events`].
    pub async fn connect_task(
        &self,
        kind: RequestKind,
        dest: NodeInfo,
        supernode: Option<NodeInfo>,
        respond_to: Vec<Vec<u8>>,
    ) -> Result<RequestId> {
        self.tasks.connect(kind, dest, supernode, respond_to).await
    }

    pub async fn cancel_task(&self, request: RequestId) -> Result<bool> {
        self.tasks.cancel(request).await
    }

    pub async fn quit(&self) {
        info!(identity = %self.identity().short(), "node stopping");
        self.tasks.quit().await;
        self.p2p.quit().await;
        self.relay.quit().await;
    }
}
