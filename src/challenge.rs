//! # Proof-of-Work Admission Challenge
//!
//! A responder hands a new peer a challenge string during the handshake; the
//! peer must find an integer `s` such that
//!
//! ```text
//! sha256(challenge || decimal(s))  <=  2^(256 - difficulty)
//! ```
//!
//! when the digest is read as a big-endian integer. Checking a solution costs
//! one hash. Finding one costs about `2^difficulty` hashes.
//!
//! Challenges are derived from a bounded history of previously solved
//! challenges, the previous challenge, and a fresh random salt, so they cannot
//! be precomputed before the handshake starts.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Solved challenges kept as input for new ones.
pub const HISTORY_LEN: usize = 5;

pub const BASE_DIFFICULTY: u32 = 5;

pub const MAX_DIFFICULTY: u32 = 256;

/// Builds a new challenge from the recent history and the previous challenge.
pub fn create_challenge<'a, I>(history: I, previous: Option<&str>) -> String
where
    I: IntoIterator<Item = &'a (String, u64)>,
{
    let mut hasher = Sha256::new();
    for (challenge, solution) in history {
        hasher.update(challenge.as_bytes());
        hasher.update(solution.to_string().as_bytes());
    }
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

/// Searches solutions `0, 1, 2, ...` until one is accepted.
pub fn solve_challenge(challenge: &str, difficulty: u32) -> (u64, Duration) {
    let started = Instant::now();
    let mut solution = 0u64;
    while !accept_challenge(challenge, solution, difficulty) {
        solution += 1;
    }
    (solution, started.elapsed())
}

pub fn accept_challenge(challenge: &str, solution: u64, difficulty: u32) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(solution.to_string().as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    meets_difficulty(&digest, difficulty)
}

fn meets_difficulty(digest: &[u8; 32], difficulty: u32) -> bool {
    match threshold(difficulty) {
        Some(threshold) => digest <= &threshold,
        None => true,
    }
}

/// `2^(256 - difficulty)` as big-endian bytes; `None` means unbounded.
fn threshold(difficulty: u32) -> Option<[u8; 32]> {
    if difficulty == 0 {
        return None;
    }
    let mut out = [0u8; 32];
    if difficulty > MAX_DIFFICULTY {
        return Some(out);
    }
    let bit = (256 - difficulty) as usize;
    out[31 - bit / 8] = 1u8 << (bit % 8);
    Some(out)
}

/// Per-node challenge state.
#[derive(Debug, Clone)]
pub struct ChallengeGate {
    history: VecDeque<(String, u64)>,
    last_challenge: Option<String>,
    difficulty: u32,
}

impl Default for ChallengeGate {
    fn default() -> Self {
        Self::new(BASE_DIFFICULTY)
    }
}

impl ChallengeGate {
    pub fn new(difficulty: u32) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY_LEN),
            last_challenge: None,
            difficulty: difficulty.min(MAX_DIFFICULTY),
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Creates the challenge to hand to the next peer.
    pub fn issue(&mut self) -> String {
        let challenge = create_challenge(&self.history, self.last_challenge.as_deref());
        self.last_challenge = Some(challenge.clone());
        challenge
    }

    /// Checks a peer's answer; accepted answers feed the history.
    pub fn verify(&mut self, challenge: &str, solution: u64) -> bool {
        if !accept_challenge(challenge, solution, self.difficulty) {
            return false;
        }
        self.record(challenge.to_string(), solution);
        true
    }

    pub fn record(&mut self, challenge: String, solution: u64) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back((challenge, solution));
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
