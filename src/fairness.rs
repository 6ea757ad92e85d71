//! Provably-fair commit/reveal protocol
//!
//! Each round commits to a secret seed by publishing its hash before betting
//! opens; the seed is revealed at crash time so players can recompute the
//! crash point themselves. Everything except seed generation is pure.

use crate::types::round2;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Tolerance used when verifying a claimed crash point
pub const CRASH_TOLERANCE: f64 = 0.01;

/// House-edge factor in the crash-point derivation
const EDGE: f64 = 0.99;

/// Generate a fresh 256-bit seed, hex-encoded
pub fn generate_seed() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Commitment hash over the seed and the round number
///
/// SHA-256 of the seed bytes concatenated with the decimal round number.
pub fn commitment(seed: &str, round_number: u64) -> String {
    hex::encode(digest(seed, round_number))
}

/// Derive the crash point for a round
///
/// The first 32 bits of the commitment digest map uniformly onto [0, 1);
/// `1/(1 - 0.99r)` turns that into a heavy-tailed multiplier concentrated
/// just above 1.00, clamped to `[1.00, max_crash]` and rounded to 2 dp.
pub fn derive_crash_point(seed: &str, round_number: u64, max_crash: f64) -> f64 {
    let d = digest(seed, round_number);
    let u = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
    let r = u as f64 / (u32::MAX as f64 + 1.0);

    let raw = 1.0 / (1.0 - EDGE * r);
    round2(raw.clamp(1.0, max_crash))
}

/// Recompute and compare a claimed crash point for a revealed seed
pub fn verify_crash_point(seed: &str, round_number: u64, claimed: f64, max_crash: f64) -> bool {
    let recomputed = derive_crash_point(seed, round_number, max_crash);
    (recomputed - claimed).abs() <= CRASH_TOLERANCE
}

fn digest(seed: &str, round_number: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(round_number.to_string().as_bytes());
    hasher.finalize().into()
}
