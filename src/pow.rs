//! Proof-of-work challenge/verify (spec §4.2).
//!
//! `SHA-256(challenge || nonce || listening_port)` must have at least
//! `difficulty` leading hex-zero nibbles. Search is sequential from 0.

use sha2::{Digest, Sha256};

pub fn digest(challenge: u64, nonce: u64, listening_port: u16) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(listening_port.to_be_bytes());
    hasher.finalize().into()
}

/// True iff `hash`'s first `difficulty` hex nibbles are all zero.
/// `difficulty` is expected to be in [0, 64]; values above 64 can never
/// be satisfied by a 32-byte digest (64 nibbles).
pub fn meets_difficulty(hash: &[u8; 32], difficulty: u8) -> bool {
    let full_bytes = (difficulty / 2) as usize;
    if hash[..full_bytes].iter().any(|&b| b != 0) {
        return false;
    }
    if difficulty % 2 == 1 {
        // One more nibble to check: the high nibble of the next byte.
        match hash.get(full_bytes) {
            Some(b) => (b >> 4) == 0,
            None => false,
        }
    } else {
        true
    }
}

/// Sequential brute-force search for a nonce satisfying `difficulty`.
/// Exhaustive over `u64`; in practice `difficulty` is small enough
/// that this returns promptly.
pub fn find_nonce(challenge: u64, listening_port: u16, difficulty: u8) -> u64 {
    for nonce in 0..=u64::MAX {
        if meets_difficulty(&digest(challenge, nonce, listening_port), difficulty) {
            return nonce;
        }
    }
    unreachable!("no u64 nonce satisfies difficulty {difficulty}")
}
