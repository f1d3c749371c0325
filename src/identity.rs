//! # Node Identity
//!
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`Identity`]: 32-byte public key, the node id of the overlay
//! - [`NodeInfo`]: what a node announces about itself in a Hello
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** Possession of the secret key proves the
//! identity, and the same 32 bytes are used directly as the Kademlia key of
//! the neighbor table, so `distance(a, b) = a XOR b`.
//!
//! ## Reachability
//!
//! A [`NodeInfo`] carries both the address the node sees locally (`prv_*`)
//! and the address its peers observed (`pub_*`), plus the NAT class it
//! detected. [`NodeInfo::p2p_candidates`] and [`NodeInfo::task_candidates`]
//! turn those into the ordered candidate lists the connection manager dials.

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::address::{AddressCandidate, MAX_CONNECT_CANDIDATES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature missing")]
    Missing,
    #[error("signature malformed")]
    Malformed,
    #[error("identity is not a valid public key")]
    InvalidKey,
    #[error("signature does not match")]
    Mismatch,
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `domain || payload`.
    pub fn sign_with_domain(&self, domain: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::with_capacity(domain.len() + payload.len());
        message.extend_from_slice(domain);
        message.extend_from_slice(payload);
        self.signing_key.sign(&message).to_bytes().to_vec()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identity) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Verifies an Ed25519 signature over `domain || payload` made by this identity.
    pub fn verify_with_domain(
        &self,
        domain: &[u8],
        payload: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let signature =
            Signature::from_slice(signature).map_err(|_| SignatureError::Malformed)?;
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidKey)?;

        let mut message = Vec::with_capacity(domain.len() + payload.len());
        message.extend_from_slice(domain);
        message.extend_from_slice(payload);
        key.verify(&message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Lexicographic comparison of two XOR distances (big-endian integers).
#[inline]
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// NAT class as reported by the node's own STUN-style detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NatType {
    OpenInternet,
    FullCone,
    RestrictedCone,
    PortRestrictedCone,
    Symmetric,
    SymmetricUdpFirewall,
    Blocked,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub identity: Identity,
    pub name: String,
    pub prv_addr: Option<String>,
    pub pub_addr: Option<String>,
    /// Every other local interface address.
    pub prv_addresses: Vec<String>,
    pub p2p_prv_port: Option<u16>,
    pub p2p_pub_port: Option<u16>,
    pub task_prv_port: Option<u16>,
    pub task_pub_port: Option<u16>,
    pub nat_type: NatType,
}

impl NodeInfo {
    pub fn new(identity: Identity, name: impl Into<String>) -> Self {
        Self {
            identity,
            name: name.into(),
            prv_addr: None,
            pub_addr: None,
            prv_addresses: Vec::new(),
            p2p_prv_port: None,
            p2p_pub_port: None,
            task_prv_port: None,
            task_pub_port: None,
            nat_type: NatType::Unknown,
        }
    }

    /// A node is a supernode when the address its peers see is the one it
    /// listens on, i.e. nothing translates its traffic.
    pub fn is_supernode(&self) -> bool {
        match (&self.pub_addr, &self.prv_addr) {
            (Some(public), Some(private)) => {
                public == private
                    && self.p2p_pub_port.is_some()
                    && self.p2p_pub_port == self.p2p_prv_port
            }
            _ => false,
        }
    }

    pub fn p2p_candidates(&self) -> Vec<AddressCandidate> {
        self.candidates(self.p2p_prv_port, self.p2p_pub_port)
    }

    pub fn task_candidates(&self) -> Vec<AddressCandidate> {
        self.candidates(self.task_prv_port, self.task_pub_port)
    }

    /// Public endpoint first, then the primary private one, then the rest of
    /// the private addresses. Duplicates and invalid entries are skipped.
    pub fn candidates(&self, prv_port: Option<u16>, pub_port: Option<u16>) -> Vec<AddressCandidate> {
        let mut raw: Vec<(&str, Option<u16>)> = Vec::new();
        if let Some(addr) = &self.pub_addr {
            raw.push((addr.as_str(), pub_port.or(prv_port)));
        }
        if let Some(addr) = &self.prv_addr {
            raw.push((addr.as_str(), prv_port));
        }
        for addr in &self.prv_addresses {
            raw.push((addr.as_str(), prv_port));
        }

        let mut out: Vec<AddressCandidate> = Vec::new();
        for (host, port) in raw {
            let Some(port) = port else { continue };
            match AddressCandidate::new(host, port) {
                Ok(candidate) => {
                    if !out.contains(&candidate) {
                        out.push(candidate);
                    }
                }
                Err(e) => {
                    trace!(node = %self.identity.short(), host, error = %e, "skipping invalid address");
                }
            }
            if out.len() >= MAX_CONNECT_CANDIDATES {
                break;
            }
        }
        out
    }
}
