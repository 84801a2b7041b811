//! Interface to the backing node.
//!
//! The stratum server is a guest inside a full node: block assembly,
//! consensus validation, and chain state live on the other side of the
//! [`NodeHandle`] trait. [`RegtestNode`] is a self-contained in-memory
//! implementation used by the bundled binary for bring-up and by the unit
//! tests; embedding the server in a real node means implementing this
//! trait against its chainstate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bitcoin::absolute::LockTime;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::pow::{CompactTarget, Target};
use bitcoin::transaction::{self, OutPoint, Sequence, TxIn, TxOut};
use bitcoin::{block, Amount, Block, BlockHash, ScriptBuf, Transaction, TxMerkleNode, Witness};
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::mergemine::ChainId;
use crate::work::unix_time;

/// A candidate block as produced by the node's block assembler.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// Coinbase at index 0; block-final transaction (if any) last.
    pub block: Block,
    /// Height of the candidate block.
    pub height: u32,
    /// Whether the last transaction is a block-final transaction able to
    /// carry merge-mining commitments.
    pub has_block_final_tx: bool,
}

/// The narrow contract the stratum server needs from its host node.
pub trait NodeHandle: Send + Sync {
    /// Hash of the current chain tip.
    fn best_block_hash(&self) -> BlockHash;

    /// Monotonic counter of mempool transaction updates.
    fn transactions_updated(&self) -> u64;

    fn is_initial_block_download(&self) -> bool;

    fn has_peers(&self) -> bool;

    /// Whether this chain mines blocks on demand (regtest-style), making
    /// peerlessness acceptable.
    fn mine_blocks_on_demand(&self) -> bool;

    /// Build a fresh candidate block. The coinbase's first output must
    /// carry the `OP_FALSE` placeholder script, to be replaced by each
    /// miner's payout script.
    fn create_new_block(&self) -> Result<BlockTemplate>;

    /// Whether segwit rules apply to a block built on `prev`.
    fn is_witness_enabled(&self, prev: &BlockHash) -> bool;

    /// Append the witness commitment output to the block's coinbase.
    fn generate_coinbase_commitment(&self, block: &mut Block, prev: &BlockHash);

    /// Rewrite the block-final transaction's commitment to `root`.
    /// Returns whether the transaction was modified.
    fn update_block_final_transaction(&self, bf: &mut Transaction, root: sha256d::Hash) -> bool;

    /// Refresh a header's timestamp against median-time rules. Returns
    /// the applied delta in seconds.
    fn update_time(&self, header: &mut block::Header, prev: &BlockHash) -> i64;

    /// Proof-of-work check at target granularity.
    fn check_proof_of_work(&self, hash: &BlockHash, bits: CompactTarget, bias: u8) -> bool {
        check_proof_of_work(hash, bits, bias)
    }

    /// Hand a reconstructed block to consensus. Returns acceptance.
    fn process_new_block(&self, block: &Block) -> bool;

    /// Receiver signalled on every tip change.
    fn tip_changes(&self) -> watch::Receiver<BlockHash>;

    /// The chain's default aux-pow path, if it has one.
    fn default_aux_pow_path(&self) -> Option<ChainId> {
        None
    }
}

/// Check whether `hash` satisfies the target encoded in `bits`, widened
/// by `bias` doublings. Auxiliary chains use the bias to ask for easier
/// targets than their compact bits alone can express.
pub fn check_proof_of_work(hash: &BlockHash, bits: CompactTarget, bias: u8) -> bool {
    let mut target = Target::from_compact(bits).to_le_bytes();
    for _ in 0..bias {
        let mut carry = 0u8;
        for byte in target.iter_mut() {
            let next = *byte >> 7;
            *byte = (*byte << 1) | carry;
            carry = next;
        }
        if carry != 0 {
            // Bias pushed the target past 2^256; everything passes.
            target = [0xff; 32];
            break;
        }
    }
    Target::from_le_bytes(hash.to_byte_array()) <= Target::from_le_bytes(target)
}

/// The script placeholder the assembler expects in a template coinbase's
/// first output.
pub fn payout_placeholder() -> ScriptBuf {
    Builder::new().push_opcode(bitcoin::opcodes::OP_FALSE).into_script()
}

struct ChainState {
    tip: BlockHash,
    height: u32,
    txns_updated: u64,
    accepted: Vec<BlockHash>,
}

/// In-memory regtest-style node.
///
/// Templates carry the regtest difficulty (`0x207fffff`), a couple of
/// synthetic mempool transactions for non-trivial Merkle branches, and a
/// block-final transaction pre-seeded with the zero commitment so that
/// commitment rewrites are idempotent when no merge-mining is active.
pub struct RegtestNode {
    state: Mutex<ChainState>,
    tip_tx: watch::Sender<BlockHash>,
    witness_enabled: bool,
    block_final_enabled: bool,
    mine_on_demand: bool,
    ibd: AtomicBool,
    default_aux_pow_path: Option<ChainId>,
}

impl RegtestNode {
    pub fn new() -> Self {
        let genesis = BlockHash::from_byte_array(
            sha256d::Hash::hash(b"stratumd regtest genesis").to_byte_array(),
        );
        let (tip_tx, _) = watch::channel(genesis);
        Self {
            state: Mutex::new(ChainState {
                tip: genesis,
                height: 100,
                txns_updated: 0,
                accepted: Vec::new(),
            }),
            tip_tx,
            witness_enabled: true,
            block_final_enabled: true,
            mine_on_demand: true,
            ibd: AtomicBool::new(false),
            default_aux_pow_path: None,
        }
    }

    pub fn with_witness(mut self, enabled: bool) -> Self {
        self.witness_enabled = enabled;
        self
    }

    pub fn with_block_final(mut self, enabled: bool) -> Self {
        self.block_final_enabled = enabled;
        self
    }

    pub fn with_mine_on_demand(mut self, enabled: bool) -> Self {
        self.mine_on_demand = enabled;
        self
    }

    pub fn with_default_aux_pow_path(mut self, chain_id: ChainId) -> Self {
        self.default_aux_pow_path = Some(chain_id);
        self
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::SeqCst);
    }

    /// Simulate a tip advance from elsewhere on the network.
    pub fn advance_tip(&self) {
        let mut state = self.state.lock().unwrap();
        let mut engine = sha256d::Hash::engine();
        engine.input(state.tip.as_byte_array());
        engine.input(&state.height.to_le_bytes());
        state.tip = BlockHash::from_byte_array(sha256d::Hash::from_engine(engine).to_byte_array());
        state.height += 1;
        let _ = self.tip_tx.send(state.tip);
    }

    /// Simulate mempool churn.
    pub fn bump_mempool(&self) {
        self.state.lock().unwrap().txns_updated += 1;
    }

    /// Blocks accepted through `process_new_block`, in order.
    pub fn accepted_blocks(&self) -> Vec<BlockHash> {
        self.state.lock().unwrap().accepted.clone()
    }

    fn synthetic_tx(height: u32, index: u8) -> Transaction {
        let mut engine = sha256d::Hash::engine();
        engine.input(&height.to_le_bytes());
        engine.input(&[index]);
        let txid = bitcoin::Txid::from_byte_array(sha256d::Hash::from_engine(engine).to_byte_array());
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid, vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1_000),
                script_pubkey: Builder::new().push_opcode(OP_RETURN).push_slice([index]).into_script(),
            }],
        }
    }

    fn block_final_tx(height: u32) -> Transaction {
        let mut engine = sha256d::Hash::engine();
        engine.input(b"block-final");
        engine.input(&height.to_le_bytes());
        let txid = bitcoin::Txid::from_byte_array(sha256d::Hash::from_engine(engine).to_byte_array());
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::from_height(height).unwrap_or(LockTime::ZERO),
            input: vec![TxIn {
                previous_output: OutPoint { txid, vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::ZERO,
                script_pubkey: commitment_script(&sha256d::Hash::all_zeros()),
            }],
        }
    }
}

impl Default for RegtestNode {
    fn default() -> Self {
        Self::new()
    }
}

fn commitment_script(root: &sha256d::Hash) -> ScriptBuf {
    Builder::new().push_opcode(OP_RETURN).push_slice(root.to_byte_array()).into_script()
}

impl NodeHandle for RegtestNode {
    fn best_block_hash(&self) -> BlockHash {
        self.state.lock().unwrap().tip
    }

    fn transactions_updated(&self) -> u64 {
        self.state.lock().unwrap().txns_updated
    }

    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::SeqCst)
    }

    fn has_peers(&self) -> bool {
        false
    }

    fn mine_blocks_on_demand(&self) -> bool {
        self.mine_on_demand
    }

    fn create_new_block(&self) -> Result<BlockTemplate> {
        let state = self.state.lock().unwrap();
        let height = state.height + 1;

        let mut cb_witness = Witness::new();
        if self.witness_enabled {
            // Witness reserved value.
            cb_witness.push([0u8; 32]);
        }
        let coinbase = Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Builder::new().push_int(i64::from(height)).into_script(),
                sequence: Sequence::MAX,
                witness: cb_witness,
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50 * 100_000_000),
                script_pubkey: payout_placeholder(),
            }],
        };

        let mut txdata = vec![coinbase];
        txdata.push(Self::synthetic_tx(height, 0));
        txdata.push(Self::synthetic_tx(height, 1));
        if self.block_final_enabled {
            txdata.push(Self::block_final_tx(height));
        }

        let header = block::Header {
            version: block::Version::from_consensus(0x2000_0000),
            prev_blockhash: state.tip,
            merkle_root: TxMerkleNode::all_zeros(),
            time: unix_time() as u32,
            bits: CompactTarget::from_consensus(0x207f_ffff),
            nonce: 0,
        };

        Ok(BlockTemplate {
            block: Block { header, txdata },
            height,
            has_block_final_tx: self.block_final_enabled,
        })
    }

    fn is_witness_enabled(&self, _prev: &BlockHash) -> bool {
        self.witness_enabled
    }

    fn generate_coinbase_commitment(&self, block: &mut Block, _prev: &BlockHash) {
        let Some(witness_root) = block.witness_root() else {
            return;
        };
        let mut engine = sha256d::Hash::engine();
        engine.input(witness_root.as_byte_array());
        engine.input(&[0u8; 32]);
        let commitment = sha256d::Hash::from_engine(engine);

        let mut payload = [0u8; 36];
        payload[..4].copy_from_slice(&[0xaa, 0x21, 0xa9, 0xed]);
        payload[4..].copy_from_slice(&commitment.to_byte_array());
        block.txdata[0].output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: Builder::new().push_opcode(OP_RETURN).push_slice(payload).into_script(),
        });
    }

    fn update_block_final_transaction(&self, bf: &mut Transaction, root: sha256d::Hash) -> bool {
        if bf.output.is_empty() {
            return false;
        }
        let script = commitment_script(&root);
        let changed = bf.output[0].script_pubkey != script;
        bf.output[0].script_pubkey = script;
        changed
    }

    fn update_time(&self, header: &mut block::Header, _prev: &BlockHash) -> i64 {
        let old = header.time;
        header.time = header.time.max(unix_time() as u32);
        i64::from(header.time) - i64::from(old)
    }

    fn process_new_block(&self, block: &Block) -> bool {
        let Some(root) = block.compute_merkle_root() else {
            return false;
        };
        if root != block.header.merkle_root {
            return false;
        }
        let hash = block.block_hash();
        if !check_proof_of_work(&hash, block.header.bits, 0) {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.tip = hash;
        state.height += 1;
        state.accepted.push(hash);
        info!(height = state.height, hash = %hash, "Connected new block");
        let _ = self.tip_tx.send(hash);
        true
    }

    fn tip_changes(&self) -> watch::Receiver<BlockHash> {
        self.tip_tx.subscribe()
    }

    fn default_aux_pow_path(&self) -> Option<ChainId> {
        self.default_aux_pow_path
    }
}
