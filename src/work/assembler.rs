//! Per-miner work-unit assembly.
//!
//! Turns the current work template into the `mining.set_extranonce` /
//! `mining.set_difficulty` / `mining.notify` frames for one session. All
//! customization happens on ephemeral copies of the template's coinbase
//! and block-final transactions; the cached template never changes.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::blockdata::script::Builder;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::{ScriptBuf, Transaction, TxMerkleNode, Witness};
use serde_json::json;
use tracing::debug;

use crate::error::RpcError;
use crate::mergemine::{aux_work_merkle_root, ChainId, MergeMineClient, SecondStageWork};
use crate::node::{payout_placeholder, NodeHandle};
use crate::rpc;
use crate::server::session::ClientSession;
use crate::types::{clamp_difficulty, Difficulty};
use crate::work::extranonce::{COMBINED_NONCE_SIZE, EXTRANONCE2_SIZE};
use crate::work::{merkle, unix_time, unix_time_millis, WorkCache, WorkTemplate};

/// Process-wide work state: the template cache plus outstanding
/// second-stage work, both guarded by the server's global lock.
#[derive(Default)]
pub struct WorkBook {
    pub cache: WorkCache,
    /// Upstream job id → (chain, work) for second-stage deliveries.
    pub second_stages: HashMap<String, (ChainId, SecondStageWork)>,
}

impl WorkBook {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Assemble and serialize a full work delivery for one session.
///
/// Second-stage work from an upstream endpoint takes priority over the
/// primary-chain template. The returned string is ready to append to the
/// session's outgoing buffer.
pub async fn get_work_unit(
    book: &mut WorkBook,
    session: &mut ClientSession,
    node: &Arc<dyn NodeHandle>,
    mm: &Arc<dyn MergeMineClient>,
) -> Result<String, RpcError> {
    if !node.has_peers() && !node.mine_blocks_on_demand() {
        return Err(RpcError::client_not_connected("Node is not connected!"));
    }
    if node.is_initial_block_download() {
        return Err(RpcError::in_initial_download("Node is downloading blocks..."));
    }
    if !session.authorized {
        return Err(RpcError::invalid_request(
            "Stratum client not authorized.  Use mining.authorize first, with a payout address as the username.",
        ));
    }

    let hint = session.last_second_stage.map(|(chain_id, _)| chain_id);
    if let Some((chain_id, work)) = mm.get_second_stage_work(hint).await {
        return Ok(second_stage_work_unit(book, session, chain_id, work));
    }
    session.last_second_stage = None;
    book.second_stages.clear();

    let tip = node.best_block_hash();
    let txns_updated = node.transactions_updated();
    let now = unix_time();
    if book.cache.needs_rebuild(&tip, txns_updated, now) {
        let mut template = node
            .create_new_block()
            .map_err(|e| RpcError::internal(e.to_string()))?;
        // Fix up the merkle root so the template hash (our job id) is the
        // hash of the block as assembled.
        template.block.header.merkle_root = template
            .block
            .compute_merkle_root()
            .ok_or_else(|| RpcError::internal("Block template has no transactions"))?;
        let job_id = template.block.block_hash();
        let work = WorkTemplate::new(tip, node.is_witness_enabled(&tip), template);
        book.cache.insert(job_id, work, tip, txns_updated, now);
        session.evict_aux_work(unix_time_millis());
    }

    let job_id = book
        .cache
        .current_job()
        .ok_or_else(|| RpcError::internal("No current work template"))?;
    let work = book
        .cache
        .get(&job_id)
        .ok_or_else(|| RpcError::internal("No current work template"))?
        .clone();

    let mut cb = work.block.txdata.first().cloned().ok_or_else(|| {
        RpcError::internal("Block template has no coinbase transaction")
    })?;
    let mut bf = work.block.txdata.last().cloned().expect("txdata checked non-empty");

    // First customization: insert the merge-mining commitment, which is
    // only possible when the template carries a block-final transaction.
    let mut has_merge_mining = false;
    let mut mmroot = bitcoin::hashes::sha256d::Hash::all_zeros();
    if work.has_block_final_tx {
        let mmwork = mm.get_merge_mine_work(&session.mmauth).await;
        if mmwork.is_empty() {
            debug!(peer = %session.peer, "No auxiliary work commitments to add to block template");
        } else {
            mmroot = aux_work_merkle_root(&mmwork)
                .map_err(|e| RpcError::internal(e.to_string()))?;
            session
                .mmwork
                .entry(mmroot)
                .or_insert_with(|| (unix_time_millis(), mmwork));
            if node.update_block_final_transaction(&mut bf, mmroot) {
                debug!("Updated merge-mining commitment in block-final transaction");
                has_merge_mining = true;
            }
        }
    } else if !session.mmauth.is_empty() {
        debug!(
            peer = %session.peer,
            "Cannot add merge-mining commitments to block template because there is no block-final transaction"
        );
    }

    let mut cb_branch = work.cb_branch().to_vec();
    if work.is_witness_enabled {
        update_segwit_commitment(node.as_ref(), &work, &mut cb, &mut bf, &mut cb_branch);
        debug!("Updated segwit commitment in coinbase");
    }

    let diff = clamp_difficulty(session.mindiff, Difficulty::from_bits(work.block.header.bits).as_f64());

    // Embed the combined nonce (with a zeroed extranonce2 placeholder)
    // and the miner's payout script.
    let mut nonce = [0u8; COMBINED_NONCE_SIZE];
    nonce[..8].copy_from_slice(&session.extranonce1(&job_id.to_byte_array()));
    cb.input[0].script_sig = coinbase_script_sig(work.height, nonce);
    if cb.output[0].script_pubkey == payout_placeholder() {
        if let Some(address) = &session.address {
            cb.output[0].script_pubkey = address.script_pubkey();
        }
    }

    let (cb1, cb2) = split_coinbase(&cb)?;

    let mut header = work.block.header;
    let delta = node.update_time(&mut header, &work.prev_tip);
    debug!(delta, "Updated the timestamp of block template");

    let mut job_param = rpc::hex_uint256(&job_id.to_byte_array());
    if has_merge_mining {
        job_param.push(':');
        job_param.push_str(&rpc::hex_uint256(&mmroot.to_byte_array()));
    }
    let clean_jobs = session.last_tip != Some(tip);
    session.last_tip = Some(tip);

    let notify_params = json!([
        job_param,
        rpc::hex_uint256_bswap32(&work.block.header.prev_blockhash.to_byte_array()),
        hex::encode(&cb1),
        hex::encode(&cb2),
        branch_hex(&cb_branch),
        rpc::hex_int4(header.version.to_consensus() as u32),
        rpc::hex_int4(header.bits.to_consensus()),
        rpc::hex_int4(header.time),
        clean_jobs,
    ]);

    let mut out = extranonce_request(session, &job_id.to_byte_array());
    out.push_str(&rpc::notification(session.next_id(), "mining.set_difficulty", json!([diff])));
    out.push_str(&rpc::notification(session.next_id(), "mining.notify", notify_params));
    Ok(out)
}

/// Deliver a prefabricated second-stage work unit in place of the primary
/// notify. Its wire job id is the upstream identifier prefixed with ":".
fn second_stage_work_unit(
    book: &mut WorkBook,
    session: &mut ClientSession,
    chain_id: ChainId,
    work: SecondStageWork,
) -> String {
    let diff = clamp_difficulty(session.mindiff, work.diff);

    let clean_jobs = session.last_second_stage != Some((chain_id, work.hash_prev_block));
    let notify_params = json!([
        format!(":{}", work.job_id),
        rpc::hex_uint256_bswap32(&work.hash_prev_block.to_byte_array()),
        hex::encode(&work.cb1),
        hex::encode(&work.cb2),
        branch_hex(&work.cb_branch),
        rpc::hex_int4(work.n_version as u32),
        rpc::hex_int4(work.n_bits.to_consensus()),
        rpc::hex_int4(work.n_time),
        clean_jobs,
    ]);

    // Extranonce derivation for second-stage work is keyed by the chain,
    // not the upstream job id.
    let mut out = extranonce_request(session, &chain_id.0);
    out.push_str(&rpc::notification(session.next_id(), "mining.set_difficulty", json!([diff])));
    out.push_str(&rpc::notification(session.next_id(), "mining.notify", notify_params));

    session.last_second_stage = Some((chain_id, work.hash_prev_block));
    book.second_stages.insert(work.job_id.clone(), (chain_id, work));
    out
}

/// The preceding `mining.set_extranonce` frame, for sessions that
/// subscribed to it. Empty otherwise.
fn extranonce_request(session: &mut ClientSession, job_key: &[u8; 32]) -> String {
    if !session.supports_extranonce {
        return String::new();
    }
    let extranonce1 = session.extranonce1(job_key);
    rpc::notification(
        session.next_id(),
        "mining.set_extranonce",
        json!([hex::encode(extranonce1), EXTRANONCE2_SIZE]),
    )
}

fn branch_hex(branch: &[TxMerkleNode]) -> serde_json::Value {
    json!(branch.iter().map(|node| hex::encode(node.to_byte_array())).collect::<Vec<_>>())
}

/// scriptSig of a customized coinbase: the height push followed by the
/// pushed 12-byte combined nonce.
pub(crate) fn coinbase_script_sig(height: u32, nonce: [u8; COMBINED_NONCE_SIZE]) -> ScriptBuf {
    Builder::new().push_int(i64::from(height)).push_slice(nonce).into_script()
}

/// Split a customized coinbase's no-witness serialization around the
/// 12-byte combined nonce at the end of the scriptSig: `cb1` runs through
/// the push opcode, `cb2` starts after the nonce. The miner reassembles
/// `cb1 ∥ extranonce1 ∥ extranonce2 ∥ cb2`.
///
/// Requires the scriptSig below 253 bytes so its length serializes as a
/// single byte; the height-plus-nonce scripts built here are always far
/// under that.
pub(crate) fn split_coinbase(cb: &Transaction) -> Result<(Vec<u8>, Vec<u8>), RpcError> {
    let mut stripped = cb.clone();
    for input in &mut stripped.input {
        input.witness = Witness::new();
    }
    let ds = encode::serialize(&stripped);

    // version (4) ∥ vin count (1) ∥ prevout (32+4) ∥ scriptSig length (1)
    if ds.len() < 4 + 1 + 32 + 4 + 1 {
        return Err(RpcError::internal(
            "Serialized transaction is too small to be parsed.  Is this even a coinbase?",
        ));
    }
    let script_len = ds[4 + 1 + 32 + 4] as usize;
    let pos = 4 + 1 + 32 + 4 + 1 + script_len;
    if ds.len() < pos || pos < COMBINED_NONCE_SIZE {
        return Err(RpcError::internal(
            "Customized coinbase transaction does not contain extranonce field at expected location.",
        ));
    }
    Ok((ds[..pos - COMBINED_NONCE_SIZE].to_vec(), ds[pos..].to_vec()))
}

/// Rebuild the witness commitment after coinbase/block-final edits and
/// recompute the coinbase branch over the resulting transaction list.
pub(crate) fn update_segwit_commitment(
    node: &dyn NodeHandle,
    work: &WorkTemplate,
    cb: &mut Transaction,
    bf: &mut Transaction,
    cb_branch: &mut Vec<TxMerkleNode>,
) {
    let mut block = work.block.clone();
    *block.txdata.last_mut().expect("template has a coinbase") = bf.clone();
    block.txdata[0] = cb.clone();

    // Erase any existing commitments before regenerating.
    while let Some(pos) = witness_commitment_index(&block.txdata[0]) {
        block.txdata[0].output.remove(pos);
    }
    node.generate_coinbase_commitment(&mut block, &work.prev_tip);

    *cb = block.txdata[0].clone();
    *bf = block.txdata.last().expect("template has a coinbase").clone();
    *cb_branch = merkle::block_merkle_branch(&block);
}

fn witness_commitment_index(cb: &Transaction) -> Option<usize> {
    const MAGIC: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];
    cb.output.iter().rposition(|out| out.script_pubkey.as_bytes().starts_with(&MAGIC))
}
