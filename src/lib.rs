//! Peer connectivity and rendezvous for a decentralized compute marketplace.
//!
//! Nodes keep an overlay of verified peers ([`p2p`]), open job-dispatch
//! sessions to each other ([`task`]) and, when a node cannot be dialed,
//! fall back to a reverse connection, a supernode-mediated hole punch or a
//! supernode relay ([`rendezvous`], [`relay`]). [`Node`] wires it all up.

pub mod address;
pub mod challenge;
pub mod config;
pub mod identity;
pub mod messages;
pub mod neighbors;
pub mod node;
pub mod p2p;
pub mod pending;
pub mod relay;
pub mod rendezvous;
pub mod task;
pub mod transport;

pub use address::{AccessPolicy, AddressCandidate, AddressError, MAX_CONNECT_CANDIDATES};
pub use config::NodeConfig;
pub use identity::{Identity, Keypair, NatType, NodeInfo};
pub use node::Node;
pub use pending::{RequestId, RequestKind};
pub use task::{NeutralTrust, TaskEvent, TrustSource};
pub use transport::{MemoryNetwork, TcpTransport};
