//! Node configuration.
//!
//! Every section has a `Default` matching the values the network runs with;
//! all sections deserialize with `#[serde(default)]` so a partial config file
//! only overrides what it names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{interface_networks, AccessPolicy, AddressCandidate, Ipv4Network};
use crate::challenge::BASE_DIFFICULTY;
use crate::identity::NatType;

pub const DEFAULT_P2P_PORT_START: u16 = 40102;
pub const DEFAULT_P2P_PORT_END: u16 = 60102;
pub const DEFAULT_TASK_PORT_START: u16 = 40103;
pub const DEFAULT_TASK_PORT_END: u16 = 60103;

/// Protocol id announced in every Hello; peers with a different id are refused.
pub const PROTOCOL_ID: u32 = 18;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Address the node is reachable at without translation. Nodes that
    /// listen on their public address act as supernodes.
    pub public_addr: Option<String>,
    /// Reported to peers; decides whether a punch is tried before relaying.
    pub nat_type: NatType,
    pub overlay: OverlayConfig,
    pub neighbors: NeighborConfig,
    pub connections: ConnectionConfig,
    pub challenge: ChallengeConfig,
    pub task: TaskConfig,
    pub rendezvous: RendezvousConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub protocol_id: u32,
    /// Connected peers the node tries to keep.
    pub optimal_peer_count: usize,
    pub port_start: u16,
    pub port_end: u16,
    pub seeds: Vec<AddressCandidate>,
    /// Peers silent for longer than this are disconnected.
    pub session_timeout: Duration,
    /// Time a new session has to complete the Hello / RandVal exchange.
    pub handshake_timeout: Duration,
    pub sync_interval: Duration,
    pub get_peers_interval: Duration,
    /// Without any peer for this long, the node dials its seeds again.
    pub seed_reconnect_threshold: Duration,
    /// Peers refused at admission are not accepted again for this long.
    pub ban_duration: Duration,
    pub max_tracked_bans: usize,
    /// With a full peer set, one peer connected for at least this long is
    /// dropped per interval to make room for others.
    pub refresh_interval: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            protocol_id: PROTOCOL_ID,
            optimal_peer_count: 10,
            port_start: DEFAULT_P2P_PORT_START,
            port_end: DEFAULT_P2P_PORT_END,
            seeds: Vec::new(),
            session_timeout: Duration::from_secs(240),
            handshake_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(1),
            get_peers_interval: Duration::from_secs(30),
            seed_reconnect_threshold: Duration::from_secs(30),
            ban_duration: Duration::from_secs(300),
            max_tracked_bans: 1_000,
            refresh_interval: Duration::from_secs(1200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborConfig {
    /// Peers per k-bucket.
    pub k: usize,
    /// Upper bound on peers across all buckets.
    pub capacity: usize,
    /// Neighbours asked per "find node" probe.
    pub alpha: usize,
    pub pong_timeout: Duration,
    pub find_request_timeout: Duration,
    /// A bucket without activity for this long is probed.
    pub idle_refresh: Duration,
    pub session_timeout: Duration,
}

impl Default for NeighborConfig {
    fn default() -> Self {
        Self {
            k: 16,
            capacity: 256,
            alpha: 3,
            pong_timeout: Duration::from_secs(5),
            find_request_timeout: Duration::from_secs(10),
            idle_refresh: Duration::from_secs(3),
            session_timeout: Duration::from_secs(240),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub tick_interval: Duration,
    pub dial_timeout: Duration,
    /// How long a request parked in `WaitingAlt` waits before its final failure.
    pub alternative_timeout: Duration,
    pub use_ipv6: bool,
    pub local_networks: Vec<Ipv4Network>,
    /// Add the networks of this host's interfaces to `local_networks` at start.
    pub detect_local_networks: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let access = AccessPolicy::default();
        Self {
            tick_interval: Duration::from_millis(500),
            dial_timeout: Duration::from_secs(5),
            alternative_timeout: Duration::from_secs(60),
            use_ipv6: access.use_ipv6,
            local_networks: access.local_networks,
            detect_local_networks: true,
        }
    }
}

impl ConnectionConfig {
    /// Extends `local_networks` with the network of our own `host` and,
    /// when enabled, the networks of every interface.
    pub fn learn_local_networks(&mut self, host: &str) {
        let mut policy = self.access_policy();
        if self.detect_local_networks {
            for network in interface_networks() {
                policy.add_local_network(network);
            }
        }
        policy.add_host_network(host);
        self.local_networks = policy.local_networks;
    }

    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy {
            use_ipv6: self.use_ipv6,
            local_networks: self.local_networks.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Require new peers to solve a proof-of-work challenge.
    pub enabled: bool,
    pub difficulty: u32,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            difficulty: BASE_DIFFICULTY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub port_start: u16,
    pub port_end: u16,
    /// A start-session request forwarded through the overlay fails after this long.
    pub forwarded_request_timeout: Duration,
    /// Providers with lower trust are never dialed.
    pub min_provider_trust: f64,
    /// Requestors with lower trust are never dialed.
    pub min_requestor_trust: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            port_start: DEFAULT_TASK_PORT_START,
            port_end: DEFAULT_TASK_PORT_END,
            forwarded_request_timeout: Duration::from_secs(30),
            min_provider_trust: -1.0,
            min_requestor_trust: -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// NAT classes for which a hole punch is attempted before relaying.
    pub punch_allowlist: Vec<NatType>,
    pub punch_timeout: Duration,
    /// Hard limit on the lifetime of a mediation attempt.
    pub session_expiry: Duration,
    /// Lifetime of the listening port opened for a punch.
    pub punch_listen_ttl: Duration,
    pub relay_pending_timeout: Duration,
    pub relay_idle_timeout: Duration,
    pub max_relay_sessions: usize,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            punch_allowlist: vec![NatType::OpenInternet, NatType::FullCone],
            punch_timeout: Duration::from_secs(10),
            session_expiry: Duration::from_secs(60),
            punch_listen_ttl: Duration::from_secs(15),
            relay_pending_timeout: Duration::from_secs(30),
            relay_idle_timeout: Duration::from_secs(300),
            max_relay_sessions: 1_000,
        }
    }
}
