//! # Wire Messages
//!
//! Every frame on a session is one bincode-encoded [`Message`].
//!
//! | Session | First frame | Then |
//! |---------|-------------|------|
//! | Overlay | `Hello` (both sides) | handshake, liveness, peer exchange, mediation signals |
//! | Task | `SessionHello` from the dialer | application frames |
//! | Punch mediation | `NatPunch` from the asking node | `NatHole` or `NatTraverseFailure` |
//! | Relay leg | `Middleman` / `JoinMiddlemanConn` | `MiddlemanReady`, then raw forwarded frames |
//!
//! ## Security Limits
//!
//! - `MAX_MESSAGE_SIZE`: upper bound for a decoded message
//! - All decoding goes through [`deserialize_bounded`]

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::address::AddressCandidate;
use crate::identity::{Identity, Keypair, NodeInfo, SignatureError};
use crate::pending::{RequestId, RequestKind};
use crate::rendezvous::RendezvousId;

pub const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

/// Domain separator for Hello signatures.
pub const HELLO_SIGNATURE_DOMAIN: &[u8] = b"peerlink-hello-v1:";

/// Peers returned per `Peers` answer.
pub const MAX_PEERS_PER_MESSAGE: usize = 32;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    ProtocolVersion,
    BadProtocol,
    Timeout,
    NoMoreMessages,
    Unverified,
    DuplicatePeers,
    TooManyPeers,
    Refresh,
    SelfConnection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_id: u32,
    pub node_info: NodeInfo,
    /// Overlay listening port of the sender.
    pub port: u16,
    /// Nonce the receiver must echo with `ResendRandVal`.
    pub rand_val: u64,
    pub challenge: Option<String>,
    pub difficulty: u32,
}

impl Hello {
    pub fn sign(self, keypair: &Keypair) -> Result<SignedHello, bincode::Error> {
        let payload = serialize(&self)?;
        let signature = keypair.sign_with_domain(HELLO_SIGNATURE_DOMAIN, &payload);
        Ok(SignedHello {
            hello: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHello {
    pub hello: Hello,
    pub signature: Vec<u8>,
}

impl SignedHello {
    /// Checks the signature against the identity the Hello claims.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = serialize(&self.hello).map_err(|_| SignatureError::Malformed)?;
        self.hello.node_info.identity.verify_with_domain(
            HELLO_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    pub fn identity(&self) -> Identity {
        self.hello.node_info.identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // Handshake
    Hello(SignedHello),
    ChallengeSolution {
        solution: u64,
    },
    ResendRandVal {
        rand_val: u64,
        /// Host the sender sees this connection coming from.
        observed_host: Option<String>,
    },
    Disconnect {
        reason: DisconnectReason,
    },

    // Liveness and peer exchange
    Ping,
    Pong,
    GetPeers,
    Peers {
        peers: Vec<NodeInfo>,
    },
    FindNode {
        target: Identity,
    },
    /// Number of peers the sender is connected to.
    Degree {
        degree: u32,
    },

    // Reverse connection, forwarded through the overlay
    WantToStartTaskSession {
        target: Identity,
        requestor: NodeInfo,
        conn_id: RequestId,
        /// Supernode the requestor is connected to.
        supernode: Option<NodeInfo>,
        ttl: u8,
    },

    /// First frame of every task session, sent by the dialer.
    SessionHello {
        identity: Identity,
        conn_id: RequestId,
        kind: RequestKind,
    },

    // Hole punch, mediated by a supernode
    NatPunch {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        target: Identity,
        conn_id: RequestId,
    },
    WaitForNatTraverse {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        asking_addr: AddressCandidate,
        conn_id: RequestId,
    },
    NatPunchListening {
        rendezvous: RendezvousId,
        port: u16,
    },
    NatHole {
        rendezvous: RendezvousId,
        addr: AddressCandidate,
    },
    NatTraverseFailure {
        rendezvous: RendezvousId,
    },

    // Middleman relay
    Middleman {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        target: Identity,
        conn_id: RequestId,
    },
    JoinMiddleman {
        rendezvous: RendezvousId,
        asking: NodeInfo,
        conn_id: RequestId,
    },
    JoinMiddlemanConn {
        rendezvous: RendezvousId,
        identity: Identity,
    },
    MiddlemanReady {
        rendezvous: RendezvousId,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::ChallengeSolution { .. } => "ChallengeSolution",
            Message::ResendRandVal { .. } => "ResendRandVal",
            Message::Disconnect { .. } => "Disconnect",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::GetPeers => "GetPeers",
            Message::Peers { .. } => "Peers",
            Message::FindNode { .. } => "FindNode",
            Message::Degree { .. } => "Degree",
            Message::WantToStartTaskSession { .. } => "WantToStartTaskSession",
            Message::SessionHello { .. } => "SessionHello",
            Message::NatPunch { .. } => "NatPunch",
            Message::WaitForNatTraverse { .. } => "WaitForNatTraverse",
            Message::NatPunchListening { .. } => "NatPunchListening",
            Message::NatHole { .. } => "NatHole",
            Message::NatTraverseFailure { .. } => "NatTraverseFailure",
            Message::Middleman { .. } => "Middleman",
            Message::JoinMiddleman { .. } => "JoinMiddleman",
            Message::JoinMiddlemanConn { .. } => "JoinMiddlemanConn",
            Message::MiddlemanReady { .. } => "MiddlemanReady",
        }
    }
}
