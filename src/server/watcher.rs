//! The block watcher: pushes refreshed work when the chain moves.
//!
//! A single task waits on tip-change notifications with a 15-second
//! deadline. On timeout it checks for mempool churn; on wake (or churn)
//! it walks every authorized session and pushes an updated work unit,
//! skipping sessions already working on equivalent work so redundant
//! notifies coalesce.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::mergemine::{aux_work_merkle_root, MergeMineClient as _};
use crate::node::NodeHandle as _;
use crate::rpc;
use crate::server::handlers::StratumContext;
use crate::server::ServerState;
use crate::work::assembler::get_work_unit;

/// Deadline on the tip-change wait.
pub const BLOCK_WATCH_INTERVAL: Duration = Duration::from_secs(15);

pub(crate) async fn block_watcher(
    ctx: Arc<StratumContext>,
    state: Arc<Mutex<ServerState>>,
    shutdown: CancellationToken,
) {
    let mut tip_rx = ctx.node.tip_changes();
    let mut txns_updated_last = 0u64;
    loop {
        let wake = tokio::select! {
            _ = shutdown.cancelled() => break,
            wake = tokio::time::timeout(BLOCK_WATCH_INTERVAL, tip_rx.changed()) => wake,
        };
        match wake {
            Err(_elapsed) => {
                // Timeout: re-establish any dropped aux connections, and
                // only proceed if the mempool actually changed.
                ctx.mergemine.reconnect_endpoints().await;
                let txns_updated = ctx.node.transactions_updated();
                if txns_updated == txns_updated_last {
                    continue;
                }
                txns_updated_last = txns_updated;
            }
            Ok(Err(_closed)) => break,
            Ok(Ok(())) => {}
        }

        ctx.mergemine.reconnect_endpoints().await;

        if shutdown.is_cancelled() {
            break;
        }

        // New block, updated transactions, or updated merge-mining
        // commitments. Either way, send updated work to miners.
        push_updated_work(&ctx, &state).await;
    }
}

/// Push a fresh work unit to every authorized session that is not
/// already working on the current state. Returns how many sessions were
/// notified.
pub(crate) async fn push_updated_work(
    ctx: &StratumContext,
    state: &Mutex<ServerState>,
) -> usize {
    let mut locked = state.lock().await;
    let ServerState { sessions, book } = &mut *locked;
    let current_tip = ctx.node.best_block_hash();
    let mut pushed = 0;

    for entry in sessions.values_mut() {
        let session = &mut entry.session;
        if !session.authorized {
            continue;
        }

        // Skip sessions already on the current second-stage work unit.
        let hint = session.last_second_stage.map(|(chain_id, _)| chain_id);
        let second_stage = ctx.mergemine.get_second_stage_work(hint).await;
        if let Some((chain_id, work)) = &second_stage {
            if session.last_second_stage == Some((*chain_id, work.hash_prev_block)) {
                continue;
            }
        } else {
            // Skip sessions already on the current block and commitment
            // set. Typically the miner that just found a block and was
            // handed fresh work on submission.
            let mmwork = ctx.mergemine.get_merge_mine_work(&session.mmauth).await;
            if let Ok(mmroot) = aux_work_merkle_root(&mmwork) {
                if session.last_tip == Some(current_tip) && session.mmwork.contains_key(&mmroot) {
                    continue;
                }
            }
        }

        let data = match get_work_unit(book, session, &ctx.node, &ctx.mergemine).await {
            Ok(data) => data,
            Err(err) => {
                debug!(peer = %session.peer, error = %err, "Error generating updated work for stratum client");
                rpc::error_reply(&err, &Value::Null)
            }
        };
        debug!(peer = %entry.session.peer, "Sending updated stratum work unit");
        let _ = entry.outgoing.send(data);
        pushed += 1;
    }
    pushed
}
