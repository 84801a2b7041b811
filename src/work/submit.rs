//! Share reconstruction, proof-of-work validation, and auxiliary proof
//! emission.
//!
//! A submitted share arrives as (extranonce2, nTime, nNonce, nVersion)
//! against a cached template. The coinbase and block-final transactions
//! are re-derived exactly as they were at assembly time, so the header
//! rebuilt here hashes to the same value the miner searched over.

use std::sync::Arc;

use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use bitcoin::{block, BlockHash};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::mergemine::{AuxProof, ChainId, MergeMineClient, SecondStageProof, SecondStageWork};
use crate::node::{payout_placeholder, NodeHandle};
use crate::rpc;
use crate::server::session::ClientSession;
use crate::work::assembler::{coinbase_script_sig, update_segwit_commitment};
use crate::work::extranonce::COMBINED_NONCE_SIZE;
use crate::work::{merkle, JobId, WorkTemplate};

/// Validate a share against a primary-chain work template, forwarding a
/// winning block to consensus and emitting auxiliary proofs for every
/// subscribed chain.
///
/// Returns consensus acceptance of the reconstructed block; shares below
/// the block target still return `Ok(false)` without being errors.
#[allow(clippy::too_many_arguments)]
pub async fn submit_block(
    session: &mut ClientSession,
    node: &Arc<dyn NodeHandle>,
    mm: &Arc<dyn MergeMineClient>,
    job_id: JobId,
    mmroot: sha256d::Hash,
    work: &WorkTemplate,
    extranonce2: &[u8],
    n_time: u32,
    n_nonce: u32,
    n_version: i32,
) -> Result<bool, RpcError> {
    if work.block.txdata.is_empty() {
        warn!("submit_block: no transactions in block template; unable to submit work");
        return Err(RpcError::internal("No transactions in block template"));
    }
    let mut cb = work.block.txdata[0].clone();
    if cb.input.len() != 1 {
        warn!("submit_block: unexpected number of inputs; is this even a coinbase transaction?");
        return Err(RpcError::internal("Unexpected number of coinbase inputs"));
    }
    let extranonce1 = session.extranonce1(&job_id.to_byte_array());
    if extranonce1.len() + extranonce2.len() != COMBINED_NONCE_SIZE {
        return Err(RpcError::invalid_parameter(format!(
            "unexpected combined nonce length: extranonce1({}) + extranonce2({}) != {}",
            extranonce1.len(),
            extranonce2.len(),
            COMBINED_NONCE_SIZE,
        )));
    }
    let mut nonce = [0u8; COMBINED_NONCE_SIZE];
    nonce[..extranonce1.len()].copy_from_slice(&extranonce1);
    nonce[extranonce1.len()..].copy_from_slice(extranonce2);

    cb.input[0].script_sig = coinbase_script_sig(work.height, nonce);
    if cb.output.is_empty() {
        warn!("submit_block: coinbase transaction is missing outputs; unable to customize work");
        return Err(RpcError::internal("Coinbase transaction is missing outputs"));
    }
    if cb.output[0].script_pubkey == payout_placeholder() {
        if let Some(address) = &session.address {
            cb.output[0].script_pubkey = address.script_pubkey();
        }
    }

    let mut bf = work.block.txdata.last().expect("txdata checked non-empty").clone();
    if work.has_block_final_tx && node.update_block_final_transaction(&mut bf, mmroot) {
        debug!("Updated merge-mining commitment in block-final transaction");
    }

    let mut cb_branch = work.cb_branch().to_vec();
    if work.is_witness_enabled {
        update_segwit_commitment(node.as_ref(), work, &mut cb, &mut bf, &mut cb_branch);
        debug!("Updated segwit commitment in coinbase");
    }

    let mut header = work.block.header;
    header.merkle_root =
        merkle::merkle_root_from_branch(cb.compute_txid().to_raw_hash(), &cb_branch, 0);
    header.time = n_time;
    header.nonce = n_nonce;
    header.version = block::Version::from_consensus(n_version);

    let hash = header.block_hash();
    let mut res = false;
    if node.check_proof_of_work(&hash, header.bits, 0) {
        info!(
            miner = %session.peer,
            hash = %hash,
            "GOT BLOCK!!!"
        );
        let mut block = work.block.clone();
        block.txdata[0] = cb.clone();
        if work.is_witness_enabled {
            *block.txdata.last_mut().expect("txdata checked non-empty") = bf.clone();
        }
        block.header.merkle_root = block
            .compute_merkle_root()
            .ok_or_else(|| RpcError::internal("Unable to compute merkle root"))?;
        block.header.time = n_time;
        block.header.nonce = n_nonce;
        block.header.version = block::Version::from_consensus(n_version);
        res = node.process_new_block(&block);
    } else {
        info!(
            miner = %session.peer,
            hash = %hash,
            "NEW SHARE!!!"
        );
    }

    // Check whether the work satisfies any of the subscribed auxiliary
    // chains, and hand each of them a proof if so.
    if work.is_witness_enabled && work.has_block_final_tx {
        if let Some((_, bundle)) = session.mmwork.get(&mmroot) {
            if let Some(proof) = build_aux_proof(work, &cb, &bf, &header, n_nonce) {
                for (chain_id, auxwork) in bundle {
                    let Some((username, _)) = session.mmauth.get(chain_id) else {
                        debug!(
                            chain = %chain_id,
                            "Got share for chain we aren't authorized for; unable to submit work"
                        );
                        continue;
                    };
                    mm.submit_aux_chain_share(*chain_id, username, auxwork, &proof).await;
                    if node.check_proof_of_work(&hash, auxwork.bits, auxwork.bias) {
                        info!(
                            chain = %chain_id,
                            user = %username,
                            commit = %auxwork.commit,
                            hash = %hash,
                            "GOT AUX CHAIN BLOCK!!!"
                        );
                    } else {
                        info!(
                            chain = %chain_id,
                            user = %username,
                            commit = %auxwork.commit,
                            hash = %hash,
                            "NEW AUX CHAIN SHARE!!!"
                        );
                    }
                }
            }
        }
    }

    if res {
        session.send_work = true;
    }
    Ok(res)
}

/// Build the per-auxiliary proof for a customized block.
///
/// The midstate compresses the block-final transaction: every complete
/// 64-byte block of its serialization minus the trailing 40 bytes is
/// absorbed into the state, the remainder rides along in the buffer, and
/// each auxiliary chain fills in the trailing bytes with its own data to
/// finish the hash.
fn build_aux_proof(
    work: &WorkTemplate,
    cb: &bitcoin::Transaction,
    bf: &bitcoin::Transaction,
    header: &block::Header,
    n_nonce: u32,
) -> Option<AuxProof> {
    let ds = encode::serialize(bf);
    if ds.len() <= 40 {
        warn!("Block-final transaction too small to midstate-compress; skipping aux proofs");
        return None;
    }
    let truncated = &ds[..ds.len() - 40];
    let absorbed = truncated.len() - (truncated.len() % 64);

    let mut engine = sha256::HashEngine::default();
    engine.input(&truncated[..absorbed]);
    let midstate = engine.midstate();

    let mut leaves = merkle::block_leaves(&work.block);
    *leaves.first_mut()? = cb.compute_txid().to_raw_hash();
    *leaves.last_mut()? = bf.compute_txid().to_raw_hash();
    let (aux_branch, _) = merkle::stable_merkle_branch(&leaves, leaves.len() - 1);

    Some(AuxProof {
        midstate_hash: midstate.to_byte_array(),
        midstate_buffer: truncated[absorbed..].to_vec(),
        midstate_length: truncated.len() as u32,
        lock_time: bf.lock_time.to_consensus_u32(),
        aux_branch,
        num_txns: leaves.len() as u32,
        n_version: header.version.to_consensus(),
        hash_prev_block: header.prev_blockhash,
        n_time: header.time,
        n_bits: header.bits,
        n_nonce,
    })
}

/// Validate and forward a solved second-stage work unit.
///
/// The header is rebuilt from the prefabricated coinbase halves: the leaf
/// is sha256d(cb1 ∥ extranonce1 ∥ extranonce2 ∥ cb2) and the branch was
/// supplied by the upstream endpoint.
#[allow(clippy::too_many_arguments)]
pub async fn submit_second_stage(
    session: &mut ClientSession,
    node: &Arc<dyn NodeHandle>,
    mm: &Arc<dyn MergeMineClient>,
    chain_id: ChainId,
    work: &SecondStageWork,
    extranonce2: &[u8],
    n_time: u32,
    n_nonce: u32,
    n_version: i32,
) -> bool {
    let Some((username, _)) = session.mmauth.get(&chain_id) else {
        debug!(
            chain = %chain_id,
            "Got second stage share for chain we aren't authorized for; unable to submit work"
        );
        return false;
    };
    let username = username.clone();

    let extranonce1 = session.extranonce1(&chain_id.0);
    let proof = SecondStageProof {
        extranonce1: extranonce1.to_vec(),
        extranonce2: extranonce2.to_vec(),
        n_version,
        n_time,
        n_nonce,
    };
    mm.submit_second_stage_share(chain_id, &username, work, &proof).await;

    let mut engine = sha256d::Hash::engine();
    engine.input(&work.cb1);
    engine.input(&extranonce1);
    engine.input(extranonce2);
    engine.input(&work.cb2);
    let leaf = sha256d::Hash::from_engine(engine);

    let header = block::Header {
        version: block::Version::from_consensus(n_version),
        prev_blockhash: work.hash_prev_block,
        merkle_root: merkle::merkle_root_from_branch(leaf, &work.cb_branch, 0),
        time: n_time,
        bits: work.n_bits,
        nonce: n_nonce,
    };
    let hash = header.block_hash();

    let res = node.check_proof_of_work(&hash, work.n_bits, 0);
    if res {
        info!(
            chain = %chain_id,
            user = %username,
            hash = %hash,
            "GOT AUX CHAIN SECOND STAGE BLOCK!!!"
        );
        session.send_work = true;
    } else {
        info!(
            chain = %chain_id,
            user = %username,
            hash = %hash,
            "NEW AUX CHAIN SECOND STAGE SHARE!!!"
        );
    }
    res
}

/// Parse the `job_id` parameter of a primary-chain submission:
/// `<job hex>[:<aux root hex>]`.
pub fn parse_submit_job_id(id: &str) -> Result<(JobId, Option<sha256d::Hash>), RpcError> {
    let (job_part, mmroot_part) = match id.split_once(':') {
        Some((job, root)) => (job, Some(root)),
        None => (id, None),
    };
    let job_id = BlockHash::from_byte_array(rpc::parse_uint256_str(job_part, "job_id")?);
    let mmroot = mmroot_part
        .map(|root| rpc::parse_uint256_str(root, "mmroot"))
        .transpose()?
        .map(sha256d::Hash::from_byte_array);
    Ok((job_id, mmroot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeHandle as _;

    #[test]
    fn parse_job_id_with_and_without_root() {
        let job = "11".repeat(32);
        let root = "22".repeat(32);

        let (job_id, mmroot) = parse_submit_job_id(&job).unwrap();
        assert_eq!(job_id.to_byte_array(), [0x11; 32]);
        assert!(mmroot.is_none());

        let (job_id, mmroot) = parse_submit_job_id(&format!("{}:{}", job, root)).unwrap();
        assert_eq!(job_id.to_byte_array(), [0x11; 32]);
        assert_eq!(mmroot.unwrap().to_byte_array(), [0x22; 32]);

        assert!(parse_submit_job_id("abcd").is_err());
        assert!(parse_submit_job_id(&format!("{}:zz", job)).is_err());
    }

    #[test]
    fn midstate_covers_all_but_forty_bytes() {
        // Resuming SHA-256 from (state, buffer) and feeding the withheld
        // tail must reproduce the digest of the full serialization.
        let node = crate::node::RegtestNode::new();
        let tpl = node.create_new_block().unwrap();
        let tip = tpl.block.header.prev_blockhash;
        let work = WorkTemplate::new(tip, true, tpl);

        let cb = work.block.txdata[0].clone();
        let bf = work.block.txdata.last().unwrap().clone();
        let header = work.block.header;
        let proof = build_aux_proof(&work, &cb, &bf, &header, 0).unwrap();

        let ds = encode::serialize(&bf);
        assert_eq!(
            proof.midstate_length as usize,
            ds.len() - 40,
            "midstate length counts every truncated byte"
        );
        assert_eq!(proof.midstate_buffer.len(), (ds.len() - 40) % 64);

        // The absorbed prefix plus buffer is exactly the truncation.
        let absorbed = proof.midstate_length as usize - proof.midstate_buffer.len();
        assert_eq!(absorbed % 64, 0);
        let mut engine = sha256::HashEngine::default();
        engine.input(&ds[..absorbed]);
        assert_eq!(engine.midstate().to_byte_array(), proof.midstate_hash);
    }

    #[test]
    fn aux_branch_authenticates_the_block_final_position() {
        let node = crate::node::RegtestNode::new();
        let tpl = node.create_new_block().unwrap();
        let tip = tpl.block.header.prev_blockhash;
        let work = WorkTemplate::new(tip, true, tpl);

        let cb = work.block.txdata[0].clone();
        let mut bf = work.block.txdata.last().unwrap().clone();
        node.update_block_final_transaction(&mut bf, sha256d::Hash::hash(b"root"));
        let header = work.block.header;
        let proof = build_aux_proof(&work, &cb, &bf, &header, 0).unwrap();

        assert_eq!(proof.num_txns as usize, work.block.txdata.len());

        // Climbing the stable branch from the customized block-final hash
        // reaches the same root as building the whole stable tree.
        let mut leaves = merkle::block_leaves(&work.block);
        *leaves.first_mut().unwrap() = cb.compute_txid().to_raw_hash();
        *leaves.last_mut().unwrap() = bf.compute_txid().to_raw_hash();
        let (_, root) = merkle::stable_merkle_branch(&leaves, leaves.len() - 1);
        let climbed = merkle::stable_merkle_root_from_branch(
            bf.compute_txid().to_raw_hash(),
            &proof.aux_branch,
            leaves.len() - 1,
            leaves.len(),
        );
        assert_eq!(climbed, root);
    }
}
