//! Per-connection miner state.

use std::collections::HashMap;
use std::net::SocketAddr;

use bitcoin::hashes::sha256d;
use bitcoin::{Address, BlockHash};
use tracing::debug;

use crate::mergemine::{ChainId, MmAuth, MmWork};
use crate::work::extranonce::SessionSecret;
use crate::work::{MAX_WORK_TEMPLATES, WORK_TEMPLATE_EXPIRY_SECS};

/// State of one miner connection.
///
/// Created on accept, destroyed on EOF/error/shutdown. Everything here is
/// touched only under the server's global lock.
pub struct ClientSession {
    /// Peer address, for logging.
    pub peer: SocketAddr,
    /// Counter for ids on server-initiated frames.
    next_id: u64,
    /// Secret from which extranonce1 values are derived.
    secret: SessionSecret,
    /// Client software name from `mining.subscribe`, if given.
    pub client_name: String,
    /// Payout address set by `mining.authorize`.
    pub address: Option<Address>,
    /// Merge-mining registrations: chain id → (username, password).
    /// Authoritative list of auxiliary chains for this session.
    pub mmauth: MmAuth,
    /// Outstanding aux-work bundles keyed by aux root:
    /// root → (creation time ms, bundle). Shares may still arrive for any
    /// bundle held here.
    pub mmwork: HashMap<sha256d::Hash, (u64, MmWork)>,
    /// If positive, the difficulty delivered to this miner is exactly
    /// this value.
    pub mindiff: f64,
    /// Header version bits the miner may mutate.
    pub version_rolling_mask: u32,
    /// Tip under which the last job was issued; drives `clean_jobs`.
    pub last_tip: Option<BlockHash>,
    /// Last (chain, prev-hash) delivered via the second-stage path.
    pub last_second_stage: Option<(ChainId, BlockHash)>,
    pub authorized: bool,
    /// Set when fresh work should be pushed after the current batch of
    /// requests is handled.
    pub send_work: bool,
    /// Whether the miner subscribed to `mining.set_extranonce`.
    pub supports_extranonce: bool,
}

impl ClientSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            next_id: 0,
            secret: SessionSecret::generate(),
            client_name: String::new(),
            address: None,
            mmauth: MmAuth::new(),
            mmwork: HashMap::new(),
            mindiff: 0.0,
            version_rolling_mask: 0,
            last_tip: None,
            last_second_stage: None,
            authorized: false,
            send_work: false,
            supports_extranonce: false,
        }
    }

    #[cfg(test)]
    pub fn with_secret(peer: SocketAddr, secret: [u8; 32]) -> Self {
        let mut session = Self::new(peer);
        session.secret = SessionSecret::from_bytes(secret);
        session
    }

    /// Next id for a server-initiated frame.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Extranonce1 for a job key (job id or second-stage chain id).
    ///
    /// Stable across jobs unless the miner subscribed to extranonce
    /// updates.
    pub fn extranonce1(&self, job_key: &[u8; 32]) -> [u8; 8] {
        self.secret.extranonce1(self.supports_extranonce.then_some(job_key))
    }

    /// Drop aux-work bundles past the age bound, then the oldest while
    /// over the count bound. Same shape as the work-template eviction.
    pub fn evict_aux_work(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(WORK_TEMPLATE_EXPIRY_SECS * 1000);
        let mut expired = Vec::new();
        let mut oldest: Option<sha256d::Hash> = None;
        let mut oldest_ms = now_ms;
        for (root, (created_ms, _)) in &self.mmwork {
            if *created_ms < cutoff {
                expired.push(*root);
            }
            if *created_ms <= oldest_ms {
                oldest = Some(*root);
                oldest_ms = *created_ms;
            }
        }
        for root in expired {
            self.mmwork.remove(&root);
            debug!(
                peer = %self.peer,
                total = self.mmwork.len(),
                root = %root,
                "Removed outdated merge-mining work unit"
            );
        }
        if self.mmwork.len() > MAX_WORK_TEMPLATES {
            if let Some(root) = oldest {
                self.mmwork.remove(&root);
                debug!(
                    peer = %self.peer,
                    total = self.mmwork.len(),
                    root = %root,
                    "Removed oldest merge-mining work unit"
                );
            }
        }
    }
}
