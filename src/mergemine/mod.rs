//! Merge-mining (auxiliary proof-of-work) types and the upstream client
//! interface.
//!
//! The stratum server does not speak to auxiliary chains itself; a
//! [`MergeMineClient`] implementation does. The server's side of the
//! contract is: gather [`AuxWork`] for the chains a miner authorized,
//! commit to it in the block-final transaction, and on a winning share
//! hand back an [`AuxProof`] that lets each auxiliary chain verify the
//! parent work independently.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash as _};
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, TxMerkleNode};

use crate::error::Error;
use crate::work::merkle;

/// Identifier of an auxiliary chain (its aux-pow path), carried in
/// internal byte order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainId(pub [u8; 32]);

impl ChainId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.as_slice().try_into().ok()?))
    }

    /// Whether the upper 24 bytes are all zero. Keys like this are almost
    /// certainly small integers rather than hex-encoded aux-pow paths,
    /// and are rejected during authorization.
    pub fn looks_truncated(&self) -> bool {
        self.0[8..].iter().all(|b| *b == 0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", hex::encode(self.0))
    }
}

/// Per-session registrations: chain id → (upstream username, password).
pub type MmAuth = BTreeMap<ChainId, (String, String)>;

/// One bundle of aux work: chain id → work, as returned by
/// [`MergeMineClient::get_merge_mine_work`].
pub type MmWork = BTreeMap<ChainId, AuxWork>;

/// Work from an upstream auxiliary chain: the commitment it wants parent
/// miners to embed, plus its difficulty parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxWork {
    /// Upstream-assigned timestamp (milliseconds).
    pub timestamp: u64,
    /// Upstream job identifier, echoed on submission.
    pub job_id: String,
    /// Merkle-map path for multi-entry commitments. Unused while only
    /// single-entry trees are constructed.
    pub path: Vec<(u8, sha256d::Hash)>,
    /// Commitment hash to embed under the aux root.
    pub commit: sha256d::Hash,
    /// Compact difficulty target of the auxiliary chain.
    pub bits: CompactTarget,
    /// Target bias applied on top of `bits` (each bias bit doubles the
    /// target).
    pub bias: u8,
}

impl Default for AuxWork {
    fn default() -> Self {
        Self {
            timestamp: 0,
            job_id: String::new(),
            path: Vec::new(),
            commit: sha256d::Hash::from_byte_array([0u8; 32]),
            bits: CompactTarget::from_consensus(0x1dffffff),
            bias: 0,
        }
    }
}

/// Proof handed to an auxiliary chain when a share satisfies its target.
///
/// The midstate fields compress the block-final transaction: its
/// serialization minus the last 40 bytes is absorbed into a SHA-256
/// engine, and the auxiliary chain finishes the hash with its own data.
#[derive(Debug, Clone)]
pub struct AuxProof {
    /// SHA-256 internal state after absorbing all complete 64-byte blocks
    /// of the truncated serialization.
    pub midstate_hash: [u8; 32],
    /// Unabsorbed tail (serialization length mod 64).
    pub midstate_buffer: Vec<u8>,
    /// Number of bytes absorbed into the midstate.
    pub midstate_length: u32,
    /// nLockTime of the block-final transaction.
    pub lock_time: u32,
    /// Stable Merkle branch authenticating the block-final transaction at
    /// position `num_txns - 1`.
    pub aux_branch: Vec<sha256d::Hash>,
    pub num_txns: u32,
    pub n_version: i32,
    pub hash_prev_block: BlockHash,
    pub n_time: u32,
    pub n_bits: CompactTarget,
    pub n_nonce: u32,
}

/// Prefabricated work from an upstream endpoint: identical in shape to
/// `mining.notify` parameters, needing only extranonce/time/nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondStageWork {
    pub timestamp: u64,
    pub diff: f64,
    pub job_id: String,
    pub hash_prev_block: BlockHash,
    pub cb1: Vec<u8>,
    pub cb2: Vec<u8>,
    pub cb_branch: Vec<TxMerkleNode>,
    pub n_version: i32,
    pub n_bits: CompactTarget,
    pub n_time: u32,
}

/// Solution to a second-stage work unit.
#[derive(Debug, Clone)]
pub struct SecondStageProof {
    pub extranonce1: Vec<u8>,
    pub extranonce2: Vec<u8>,
    pub n_version: i32,
    pub n_time: u32,
    pub n_nonce: u32,
}

/// Interface to the subsystem that talks to upstream auxiliary chain
/// endpoints.
#[async_trait]
pub trait MergeMineClient: Send + Sync {
    /// Register a miner with an auxiliary chain so its notifications are
    /// fetched on that miner's behalf.
    async fn register_client(&self, chain_id: ChainId, username: &str, password: &str);

    /// Current aux work for every registered chain in `auth`.
    async fn get_merge_mine_work(&self, auth: &MmAuth) -> MmWork;

    /// A second-stage work unit, if one is available. `hint` names the
    /// chain the caller is already working on, so unchanged work can be
    /// returned as-is.
    async fn get_second_stage_work(
        &self,
        hint: Option<ChainId>,
    ) -> Option<(ChainId, SecondStageWork)>;

    /// Submit a share satisfying an auxiliary chain's target.
    async fn submit_aux_chain_share(
        &self,
        chain_id: ChainId,
        username: &str,
        work: &AuxWork,
        proof: &AuxProof,
    );

    /// Submit a solved second-stage work unit.
    async fn submit_second_stage_share(
        &self,
        chain_id: ChainId,
        username: &str,
        work: &SecondStageWork,
        proof: &SecondStageProof,
    );

    /// Re-establish any dropped upstream connections.
    async fn reconnect_endpoints(&self);
}

/// Merge-mine client for deployments with no auxiliary chains.
pub struct NullMergeMine;

#[async_trait]
impl MergeMineClient for NullMergeMine {
    async fn register_client(&self, _chain_id: ChainId, _username: &str, _password: &str) {}

    async fn get_merge_mine_work(&self, _auth: &MmAuth) -> MmWork {
        MmWork::new()
    }

    async fn get_second_stage_work(
        &self,
        _hint: Option<ChainId>,
    ) -> Option<(ChainId, SecondStageWork)> {
        None
    }

    async fn submit_aux_chain_share(
        &self,
        _chain_id: ChainId,
        _username: &str,
        _work: &AuxWork,
        _proof: &AuxProof,
    ) {
    }

    async fn submit_second_stage_share(
        &self,
        _chain_id: ChainId,
        _username: &str,
        _work: &SecondStageWork,
        _proof: &SecondStageProof,
    ) {
    }

    async fn reconnect_endpoints(&self) {}
}

/// Root of the Merkle map committing to a bundle of aux work.
///
/// The empty bundle commits to the zero hash. Only single-entry trees can
/// be built today; larger bundles must fail loudly rather than commit to
/// a wrong tree.
pub fn aux_work_merkle_root(mmwork: &MmWork) -> Result<sha256d::Hash, Error> {
    match mmwork.len() {
        0 => Ok(sha256d::Hash::all_zeros()),
        1 => {
            let (chain_id, work) = mmwork.iter().next().expect("len checked");
            Ok(merkle::merkle_map_root(&chain_id.0, &work.commit))
        }
        n => Err(Error::MergeMine(format!(
            "aux work merkle root: {} commitments requested, only one supported",
            n
        ))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn empty_bundle_commits_to_zero() {
        let root = aux_work_merkle_root(&MmWork::new()).unwrap();
        assert_eq!(root, sha256d::Hash::all_zeros());
    }

    #[test]
    fn single_entry_root_is_keyed() {
        let mut work = MmWork::new();
        let chain = ChainId([0xaa; 32]);
        work.insert(
            chain,
            AuxWork { commit: sha256d::Hash::hash(b"commit"), ..Default::default() },
        );
        let root = aux_work_merkle_root(&work).unwrap();
        assert_ne!(root, sha256d::Hash::all_zeros());

        let mut other = MmWork::new();
        other.insert(
            ChainId([0xbb; 32]),
            AuxWork { commit: sha256d::Hash::hash(b"commit"), ..Default::default() },
        );
        assert_ne!(aux_work_merkle_root(&other).unwrap(), root);
    }

    #[test]
    fn multi_entry_bundles_fail_loudly() {
        let mut work = MmWork::new();
        work.insert(ChainId([1; 32]), AuxWork::default());
        work.insert(ChainId([2; 32]), AuxWork::default());
        assert!(aux_work_merkle_root(&work).is_err());
    }

    #[test]
    fn truncated_chain_id_detection() {
        let mut id = [0u8; 32];
        id[0] = 42;
        assert!(ChainId(id).looks_truncated());
        assert!(!ChainId([42u8; 32]).looks_truncated());
    }
}
