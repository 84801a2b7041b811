//! Work templates and the process-wide template cache.
//!
//! A [`WorkTemplate`] is an immutable snapshot of a candidate block plus
//! the derived data needed to customize it per miner. Templates are keyed
//! by the pre-customization block hash, which doubles as the stratum
//! job identifier. All per-miner customization (extranonce, payout
//! script, commitments, timestamp) happens on ephemeral copies; a cached
//! template is never mutated.

pub mod assembler;
pub mod extranonce;
pub mod merkle;
pub mod submit;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{Block, BlockHash, TxMerkleNode};
use tracing::debug;

use crate::node::BlockTemplate;

/// Stratum job identifier: the block-assembly hash before extranonce
/// customization.
pub type JobId = BlockHash;

/// Maximum number of cached templates (and, separately, of outstanding
/// aux-work bundles per session).
pub const MAX_WORK_TEMPLATES: usize = 30;

/// Templates older than this are evicted, except the current job.
pub const WORK_TEMPLATE_EXPIRY_SECS: u64 = 900;

/// Seconds of mempool-churn quiet time before a rebuild is considered.
pub const MEMPOOL_REBUILD_INTERVAL_SECS: u64 = 5;

pub(crate) fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub(crate) fn unix_time_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Immutable snapshot of a block template and its derived coinbase
/// branch.
#[derive(Debug, Clone)]
pub struct WorkTemplate {
    /// The candidate block: coinbase at index 0, block-final transaction
    /// (if any) at the last index.
    pub block: Block,
    /// Tip under which the template was built. Needed to regenerate the
    /// witness commitment after per-miner coinbase edits.
    pub prev_tip: BlockHash,
    /// Height serialized into the coinbase scriptSig.
    pub height: u32,
    /// Whether segwit applies at this height.
    pub is_witness_enabled: bool,
    /// Whether the last transaction can carry merge-mining commitments.
    pub has_block_final_tx: bool,
    /// Coinbase Merkle branch, cached only when witness is disabled.
    /// With witness enabled the commitment rewrite invalidates it, so it
    /// is recomputed per customization instead.
    cb_branch: Vec<TxMerkleNode>,
}

impl WorkTemplate {
    pub fn new(prev_tip: BlockHash, is_witness_enabled: bool, template: BlockTemplate) -> Self {
        let cb_branch = if is_witness_enabled {
            Vec::new()
        } else {
            merkle::block_merkle_branch(&template.block)
        };
        Self {
            block: template.block,
            prev_tip,
            height: template.height,
            is_witness_enabled,
            has_block_final_tx: template.has_block_final_tx,
            cb_branch,
        }
    }

    /// The cached coinbase branch. Only meaningful when witness is
    /// disabled.
    pub fn cb_branch(&self) -> &[TxMerkleNode] {
        &self.cb_branch
    }
}

/// Process-wide map of job id → template, bounded by age and count.
#[derive(Default)]
pub struct WorkCache {
    templates: HashMap<JobId, WorkTemplate>,
    current: Option<JobId>,
    tip: Option<BlockHash>,
    txns_updated_last: u64,
    last_update_time: u64,
}

impl WorkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the next work request must build a fresh template: the tip
    /// moved, the mempool churned and the last rebuild is stale, or the
    /// current job fell out of the cache.
    pub fn needs_rebuild(&self, tip: &BlockHash, txns_updated: u64, now: u64) -> bool {
        if self.tip.as_ref() != Some(tip) {
            return true;
        }
        if txns_updated != self.txns_updated_last
            && now.saturating_sub(self.last_update_time) > MEMPOOL_REBUILD_INTERVAL_SECS
        {
            return true;
        }
        match self.current {
            Some(job_id) => !self.templates.contains_key(&job_id),
            None => true,
        }
    }

    /// Insert a freshly built template, make it current, and run the
    /// eviction pass.
    pub fn insert(
        &mut self,
        job_id: JobId,
        template: WorkTemplate,
        tip: BlockHash,
        txns_updated: u64,
        now: u64,
    ) {
        self.templates.insert(job_id, template);
        self.current = Some(job_id);
        self.tip = Some(tip);
        self.txns_updated_last = txns_updated;
        self.last_update_time = now;
        debug!(
            total = self.templates.len(),
            job_id = %job_id,
            "New stratum block template"
        );
        self.evict(now);
    }

    fn evict(&mut self, now: u64) {
        let current = self.current;
        let mut expired = Vec::new();
        let mut oldest: Option<JobId> = None;
        let mut oldest_time = now as u32;
        for (job_id, template) in &self.templates {
            // The current job is never evicted, even if it was built with
            // an old nTime.
            if Some(*job_id) == current {
                continue;
            }
            if u64::from(template.block.header.time) < now.saturating_sub(WORK_TEMPLATE_EXPIRY_SECS)
            {
                expired.push(*job_id);
            }
            if template.block.header.time <= oldest_time {
                oldest = Some(*job_id);
                oldest_time = template.block.header.time;
            }
        }
        for job_id in expired {
            self.templates.remove(&job_id);
            debug!(
                total = self.templates.len(),
                job_id = %job_id,
                "Removed outdated stratum block template"
            );
        }
        if self.templates.len() > MAX_WORK_TEMPLATES {
            if let Some(job_id) = oldest {
                self.templates.remove(&job_id);
                debug!(
                    total = self.templates.len(),
                    job_id = %job_id,
                    "Removed oldest stratum block template"
                );
            }
        }
    }

    pub fn get(&self, job_id: &JobId) -> Option<&WorkTemplate> {
        self.templates.get(job_id)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.templates.contains_key(job_id)
    }

    /// The job id of the template the assembler is currently handing out.
    pub fn current_job(&self) -> Option<JobId> {
        self.current
    }

    /// Tip under which the current job was built.
    pub fn tip(&self) -> Option<BlockHash> {
        self.tip
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn clear(&mut self) {
        self.templates.clear();
        self.current = None;
        self.tip = None;
    }
}
