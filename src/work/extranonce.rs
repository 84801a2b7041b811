//! Per-session extranonce1 derivation.
//!
//! The server never tracks claimed nonce ranges. Instead, extranonce1 is a
//! pure function of a 32-byte session secret and (when the miner has
//! subscribed to `mining.set_extranonce`) the job identifier, so every job
//! re-homes a subscribed miner into a fresh search space for free.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use rand::RngCore;

/// Server-chosen extranonce1 length in bytes.
pub const EXTRANONCE1_SIZE: usize = 8;

/// Miner-chosen extranonce2 length in bytes.
pub const EXTRANONCE2_SIZE: usize = 4;

/// Length of the combined nonce embedded in the coinbase scriptSig.
pub const COMBINED_NONCE_SIZE: usize = EXTRANONCE1_SIZE + EXTRANONCE2_SIZE;

/// Random per-session value from which extranonce1 values are derived.
///
/// The secret itself never leaves the process; miners only ever see the
/// derived 8-byte prefixes.
#[derive(Clone)]
pub struct SessionSecret([u8; 32]);

impl SessionSecret {
    /// Generate a fresh secret from OS randomness.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self(secret)
    }

    #[cfg(test)]
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    /// Derive extranonce1: the first 8 bytes of SHA256(secret ∥ job_id?).
    ///
    /// `job_id` is `None` when the session has not subscribed to
    /// extranonce updates, making the result stable across jobs.
    pub fn extranonce1(&self, job_id: Option<&[u8; 32]>) -> [u8; EXTRANONCE1_SIZE] {
        let mut engine = sha256::Hash::engine();
        engine.input(&self.0);
        if let Some(job_id) = job_id {
            engine.input(job_id);
        }
        let digest = sha256::Hash::from_engine(engine);
        let mut out = [0u8; EXTRANONCE1_SIZE];
        out.copy_from_slice(&digest.to_byte_array()[..EXTRANONCE1_SIZE]);
        out
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't leak the secret into logs.
        f.write_str("SessionSecret(..)")
    }
}
