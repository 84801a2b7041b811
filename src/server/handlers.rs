//! Stratum method handlers and the dispatch table.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::address::NetworkUnchecked;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Address, Network};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::RpcError;
use crate::mergemine::{ChainId, MergeMineClient, MmAuth};
use crate::node::NodeHandle;
use crate::rpc::{self, Request};
use crate::server::session::ClientSession;
use crate::work::assembler::WorkBook;
use crate::work::extranonce::EXTRANONCE2_SIZE;
use crate::work::submit::{parse_submit_job_id, submit_block, submit_second_stage};

/// Version bits a miner may ever be allowed to roll (BIP320 range).
pub const VERSION_ROLLING_ALLOWED_MASK: u32 = 0x1fff_e000;

/// Constant subscription id placeholder; session resume is not
/// supported.
const SUBSCRIPTION_ID: &str = "ae6812eb4cd7735a302a8a9dd95cf71f";

/// Shared collaborators the handlers run against.
pub struct StratumContext {
    pub node: Arc<dyn NodeHandle>,
    pub mergemine: Arc<dyn MergeMineClient>,
    /// Network whose addresses are accepted as payout usernames.
    pub network: Network,
    /// Alternative names for auxiliary chains, from configuration.
    pub chain_names: BTreeMap<String, ChainId>,
}

/// Route a request to its handler, enforcing parameter arity.
pub async fn dispatch(
    ctx: &StratumContext,
    book: &mut WorkBook,
    session: &mut ClientSession,
    request: &Request,
) -> Result<Value, RpcError> {
    match request.method.as_str() {
        "mining.subscribe" => subscribe(session, &request.params),
        "mining.authorize" => authorize(ctx, session, &request.params).await,
        "mining.configure" => configure(session, &request.params),
        "mining.submit" => submit(ctx, book, session, &request.params).await,
        "mining.extranonce.subscribe" => extranonce_subscribe(session, &request.params),
        method => Err(RpcError::method_not_found(method)),
    }
}

fn bound_params(method: &str, params: &[Value], min: usize, max: usize) -> Result<(), RpcError> {
    if params.len() < min {
        return Err(RpcError::invalid_parameter(format!(
            "{} expects at least {} parameters; received {}",
            method,
            min,
            params.len()
        )));
    }
    if params.len() > max {
        return Err(RpcError::invalid_parameter(format!(
            "{} receives no more than {} parameters; got {}",
            method,
            max,
            params.len()
        )));
    }
    Ok(())
}

fn subscribe(session: &mut ClientSession, params: &[Value]) -> Result<Value, RpcError> {
    bound_params("mining.subscribe", params, 0, 2)?;

    if let Some(name) = params.first() {
        let name = name
            .as_str()
            .ok_or_else(|| RpcError::invalid_parameter("client name must be a string"))?;
        session.client_name = name.to_string();
        debug!(client = %session.client_name, "Received subscription from client");
    }
    // params[1] is the subscription id for reconnect, which we do not
    // support.

    // Some mining proxies (e.g. Nicehash) reject connections that don't
    // see a reasonable difficulty on first connection, and expect it in
    // serialized-float form of all things. The real value follows with
    // the first work delivery.
    let extranonce1 = session.extranonce1(&[0u8; 32]);
    Ok(json!([
        [
            ["mining.set_difficulty", "1e+06"],
            ["mining.notify", SUBSCRIPTION_ID],
        ],
        hex::encode(extranonce1),
        EXTRANONCE2_SIZE,
    ]))
}

/// `mining.authorize` carries a payout address as the username (with an
/// optional `+<mindiff>` suffix) and merge-mining registrations as
/// comma-separated password options.
async fn authorize(
    ctx: &StratumContext,
    session: &mut ClientSession,
    params: &[Value],
) -> Result<Value, RpcError> {
    bound_params("mining.authorize", params, 1, 2)?;

    let mut username = params[0]
        .as_str()
        .ok_or_else(|| RpcError::invalid_parameter("username must be a string"))?
        .trim()
        .to_string();
    let password = params.get(1).and_then(Value::as_str).unwrap_or("").trim();

    let mut mmauth = MmAuth::new();
    for opt in password.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
        if let Some((key, value)) = opt.split_once('=') {
            let key = key.trim_end();
            let value = value.trim_start();
            let (user, pass) = match value.split_once(':') {
                Some((user, pass)) => (user.to_string(), pass.to_string()),
                None => (value.to_string(), String::new()),
            };
            if let Some(chain_id) = ctx.chain_names.get(key) {
                if mmauth.contains_key(chain_id) {
                    debug!(chain = %chain_id, "Duplicate chain; skipping");
                    continue;
                }
                debug!(name = %key, chain = %chain_id, user = %user, "Merge-mine chain registered");
                mmauth.insert(*chain_id, (user, pass));
            } else if let Some(chain_id) = ChainId::from_hex(key) {
                if chain_id.looks_truncated() {
                    // Mostly-zero keys are small integers, not hex-encoded
                    // aux-pow paths.
                    debug!(option = %opt, "Skipping unrecognized stratum password keyword option");
                } else if mmauth.contains_key(&chain_id) {
                    debug!(chain = %chain_id, "Duplicate chain; skipping");
                } else {
                    debug!(chain = %chain_id, user = %user, "Merge-mine chain registered");
                    mmauth.insert(chain_id, (user, pass));
                }
            } else {
                debug!(option = %opt, "Skipping unrecognized stratum password keyword option");
            }
        } else if let Some(addr) = parse_address(opt, ctx.network) {
            // A bare address registers the chain's default aux-pow path.
            match ctx.node.default_aux_pow_path() {
                Some(chain_id) if mmauth.contains_key(&chain_id) => {
                    debug!(chain = %chain_id, "Duplicate chain (default); skipping");
                }
                Some(chain_id) => {
                    debug!(chain = %chain_id, user = %addr, "Merge-mine default aux-pow path registered");
                    mmauth.insert(chain_id, (addr.to_string(), "x".to_string()));
                }
                None => {
                    debug!(option = %opt, "No default aux-pow path on this chain; skipping");
                }
            }
        } else {
            debug!(option = %opt, "Skipping unrecognized stratum password option");
        }
    }

    let mut mindiff = 0.0;
    if let Some(pos) = username.find('+') {
        let suffix = username[pos + 1..].trim_start().to_string();
        mindiff = suffix.parse::<f64>().map_err(|_| {
            RpcError::invalid_parameter(format!("Invalid minimum difficulty suffix: {}", suffix))
        })?;
        username.truncate(pos);
        username.truncate(username.trim_end().len());
    }

    let address = parse_address(&username, ctx.network)
        .ok_or_else(|| RpcError::invalid_parameter(format!("Invalid payout address: {}", username)))?;

    session.address = Some(address.clone());
    session.mmauth = mmauth;
    for (chain_id, (user, pass)) in &session.mmauth {
        ctx.mergemine.register_client(*chain_id, user, pass).await;
    }
    session.mindiff = mindiff;
    session.authorized = true;
    session.send_work = true;

    info!(miner = %address, peer = %session.peer, mindiff, "Authorized stratum miner");
    Ok(json!(true))
}

fn parse_address(s: &str, network: Network) -> Option<Address> {
    s.parse::<Address<NetworkUnchecked>>().ok()?.require_network(network).ok()
}

fn configure(session: &mut ClientSession, params: &[Value]) -> Result<Value, RpcError> {
    bound_params("mining.configure", params, 2, 2)?;

    let extensions = params[0]
        .as_array()
        .ok_or_else(|| RpcError::invalid_parameter("extension list must be an array"))?;
    let config = params[1]
        .as_object()
        .ok_or_else(|| RpcError::invalid_parameter("extension parameters must be an object"))?;

    let mut res = serde_json::Map::new();
    for extension in extensions {
        let name = extension
            .as_str()
            .ok_or_else(|| RpcError::invalid_parameter("extension name must be a string"))?;
        if name == "version-rolling" {
            let mask = rpc::parse_hex_int4(
                config.get("version-rolling.mask").unwrap_or(&Value::Null),
                "version-rolling.mask",
            )?;
            config
                .get("version-rolling.min-bit-count")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    RpcError::invalid_parameter("version-rolling.min-bit-count must be an integer")
                })?;
            session.version_rolling_mask = mask & VERSION_ROLLING_ALLOWED_MASK;
            res.insert("version-rolling".to_string(), json!(true));
            res.insert(
                "version-rolling.mask".to_string(),
                json!(rpc::hex_int4(session.version_rolling_mask)),
            );
            debug!(peer = %session.peer, "Received version rolling request");
        } else {
            debug!(extension = %name, peer = %session.peer, "Unrecognized stratum extension");
        }
    }

    Ok(Value::Object(res))
}

async fn submit(
    ctx: &StratumContext,
    book: &mut WorkBook,
    session: &mut ClientSession,
    params: &[Value],
) -> Result<Value, RpcError> {
    bound_params("mining.submit", params, 5, 6)?;
    // First parameter is the client username, which is ignored.

    let id = params[1]
        .as_str()
        .ok_or_else(|| RpcError::invalid_parameter("job_id must be a string"))?;
    let extranonce2 = rpc::parse_hex(&params[2], "extranonce2")?;
    if extranonce2.len() != EXTRANONCE2_SIZE {
        return Err(RpcError::invalid_parameter(format!(
            "extranonce2 is wrong length (received {} bytes; expected {} bytes)",
            extranonce2.len(),
            EXTRANONCE2_SIZE,
        )));
    }
    let n_time = rpc::parse_hex_int4(&params[3], "nTime")?;
    let n_nonce = rpc::parse_hex_int4(&params[4], "nNonce")?;

    if let Some(upstream_id) = id.strip_prefix(':') {
        // Second stage work unit.
        let Some((chain_id, work)) = book.second_stages.get(upstream_id).cloned() else {
            debug!(job_id = %id, "Received completed share for unknown second stage work");
            session.send_work = true;
            return Ok(json!(false));
        };
        let n_version = rolled_version(session, work.n_version, params.get(5))?;
        submit_second_stage(
            session,
            &ctx.node,
            &ctx.mergemine,
            chain_id,
            &work,
            &extranonce2,
            n_time,
            n_nonce,
            n_version,
        )
        .await;
        Ok(json!(true))
    } else {
        let (job_id, mmroot) = parse_submit_job_id(id)?;
        let Some(work) = book.cache.get(&job_id).cloned() else {
            debug!(job_id = %job_id, "Received completed share for unknown job_id");
            session.send_work = true;
            return Ok(json!(false));
        };
        let n_version =
            rolled_version(session, work.block.header.version.to_consensus(), params.get(5))?;
        submit_block(
            session,
            &ctx.node,
            &ctx.mergemine,
            job_id,
            mmroot.unwrap_or_else(sha256d::Hash::all_zeros),
            &work,
            &extranonce2,
            n_time,
            n_nonce,
            n_version,
        )
        .await?;
        Ok(json!(true))
    }
}

/// Apply the session's version-rolling mask to an optional submitted
/// version-bits parameter.
fn rolled_version(
    session: &ClientSession,
    base_version: i32,
    bits: Option<&Value>,
) -> Result<i32, RpcError> {
    let Some(bits) = bits else {
        return Ok(base_version);
    };
    let bits = rpc::parse_hex_int4(bits, "nVersion")?;
    let mask = session.version_rolling_mask;
    Ok(((base_version as u32 & !mask) | (bits & mask)) as i32)
}

fn extranonce_subscribe(session: &mut ClientSession, params: &[Value]) -> Result<Value, RpcError> {
    bound_params("mining.extranonce.subscribe", params, 0, 0)?;
    session.supports_extranonce = true;
    Ok(json!(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block;
    use bitcoin::hashes::{sha256d, HashEngine};
    use bitcoin::pow::CompactTarget;
    use bitcoin::{BlockHash, PubkeyHash, TxMerkleNode};

    use crate::mergemine::testing::RecordingMergeMine;
    use crate::mergemine::{AuxWork, MmWork, SecondStageWork};
    use crate::node::RegtestNode;
    use crate::work::assembler::get_work_unit;

    struct Rig {
        ctx: StratumContext,
        node: Arc<RegtestNode>,
        mm: Arc<RecordingMergeMine>,
        book: WorkBook,
        session: ClientSession,
    }

    fn rig_with(node: RegtestNode) -> Rig {
        let node = Arc::new(node);
        let mm = Arc::new(RecordingMergeMine::new());
        let ctx = StratumContext {
            node: node.clone(),
            mergemine: mm.clone(),
            network: Network::Regtest,
            chain_names: BTreeMap::new(),
        };
        Rig {
            ctx,
            node,
            mm,
            book: WorkBook::new(),
            session: ClientSession::with_secret("127.0.0.1:9999".parse().unwrap(), [5u8; 32]),
        }
    }

    fn rig() -> Rig {
        rig_with(RegtestNode::new())
    }

    fn payout_address() -> String {
        Address::p2pkh(PubkeyHash::from_byte_array([0x42; 20]), Network::Regtest).to_string()
    }

    async fn call(rig: &mut Rig, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let request = Request { id: json!(1), method: method.to_string(), params };
        dispatch(&rig.ctx, &mut rig.book, &mut rig.session, &request).await
    }

    async fn authorize_rig(rig: &mut Rig, password: &str) {
        let result = call(
            rig,
            "mining.authorize",
            vec![json!(payout_address()), json!(password)],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(true));
    }

    async fn work_frames(rig: &mut Rig) -> Vec<Value> {
        let data = get_work_unit(&mut rig.book, &mut rig.session, &rig.ctx.node, &rig.ctx.mergemine)
            .await
            .unwrap();
        data.lines().map(|line| serde_json::from_str(line).unwrap()).collect()
    }

    /// Reconstruct the header the miner would build from a notify frame,
    /// then grind nonces until it satisfies the template's target.
    fn mine_notify(
        notify: &Value,
        extranonce1: &[u8; 8],
        extranonce2: &[u8; 4],
        version_override: Option<u32>,
    ) -> (String, u32, u32, BlockHash) {
        let params = notify["params"].as_array().unwrap();
        let job_param = params[0].as_str().unwrap().to_string();

        let prev_swapped: [u8; 32] =
            hex::decode(params[1].as_str().unwrap()).unwrap().try_into().unwrap();
        let mut prev = prev_swapped;
        for chunk in prev.chunks_exact_mut(4) {
            chunk.reverse();
        }

        let mut coinbase = hex::decode(params[2].as_str().unwrap()).unwrap();
        coinbase.extend_from_slice(extranonce1);
        coinbase.extend_from_slice(extranonce2);
        coinbase.extend_from_slice(&hex::decode(params[3].as_str().unwrap()).unwrap());
        let mut leaf = sha256d::Hash::hash(&coinbase);
        for node in params[4].as_array().unwrap() {
            let node: [u8; 32] =
                hex::decode(node.as_str().unwrap()).unwrap().try_into().unwrap();
            let mut engine = sha256d::Hash::engine();
            engine.input(leaf.as_byte_array());
            engine.input(&node);
            leaf = sha256d::Hash::from_engine(engine);
        }

        let version = version_override
            .unwrap_or_else(|| u32::from_str_radix(params[5].as_str().unwrap(), 16).unwrap());
        let bits = u32::from_str_radix(params[6].as_str().unwrap(), 16).unwrap();
        let time = u32::from_str_radix(params[7].as_str().unwrap(), 16).unwrap();

        let mut header = block::Header {
            version: block::Version::from_consensus(version as i32),
            prev_blockhash: BlockHash::from_byte_array(prev),
            merkle_root: TxMerkleNode::from_byte_array(leaf.to_byte_array()),
            time,
            bits: CompactTarget::from_consensus(bits),
            nonce: 0,
        };
        for nonce in 0..10_000u32 {
            header.nonce = nonce;
            let hash = header.block_hash();
            if crate::node::check_proof_of_work(&hash, header.bits, 0) {
                return (job_param, time, nonce, hash);
            }
        }
        panic!("no nonce satisfied the regtest target in 10000 tries");
    }

    #[tokio::test]
    async fn subscribe_then_authorize_delivers_clean_work() {
        let mut rig = rig();

        let result =
            call(&mut rig, "mining.subscribe", vec![json!("cpuminer/2.5")]).await.unwrap();
        let reply = result.as_array().unwrap();
        assert_eq!(
            reply[0],
            json!([
                ["mining.set_difficulty", "1e+06"],
                ["mining.notify", SUBSCRIPTION_ID],
            ])
        );
        assert_eq!(reply[1].as_str().unwrap().len(), 16);
        assert_eq!(reply[2], json!(4));
        assert_eq!(rig.session.client_name, "cpuminer/2.5");

        authorize_rig(&mut rig, "x").await;
        assert!(rig.session.authorized);
        assert!(rig.session.send_work);

        let frames = work_frames(&mut rig).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["method"], json!("mining.set_difficulty"));
        assert_eq!(frames[1]["method"], json!("mining.notify"));
        // First notify after authorization is always a clean start.
        assert_eq!(frames[1]["params"][8], json!(true));
    }

    #[tokio::test]
    async fn work_before_authorization_is_rejected() {
        let mut rig = rig();
        let err =
            get_work_unit(&mut rig.book, &mut rig.session, &rig.ctx.node, &rig.ctx.mergemine)
                .await
                .unwrap_err();
        assert_eq!(err.code, -32600);
    }

    #[tokio::test]
    async fn node_state_errors() {
        {
            let mut rig = rig_with(RegtestNode::new().with_mine_on_demand(false));
            rig.session.authorized = true;
            let err =
                get_work_unit(&mut rig.book, &mut rig.session, &rig.ctx.node, &rig.ctx.mergemine)
                    .await
                    .unwrap_err();
            assert_eq!(err.code, -9);
        }

        let mut rig = rig();
        rig.session.authorized = true;
        rig.node.set_initial_block_download(true);
        let err =
            get_work_unit(&mut rig.book, &mut rig.session, &rig.ctx.node, &rig.ctx.mergemine)
                .await
                .unwrap_err();
        assert_eq!(err.code, -10);
    }

    #[tokio::test]
    async fn clean_jobs_tracks_tip_changes() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;

        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[1]["params"][8], json!(true));

        // Same tip: not clean.
        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[1]["params"][8], json!(false));

        // New tip: clean again.
        rig.node.advance_tip();
        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[1]["params"][8], json!(true));
    }

    #[tokio::test]
    async fn extranonce_subscription_prefixes_work() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;

        let result =
            call(&mut rig, "mining.extranonce.subscribe", vec![]).await.unwrap();
        assert_eq!(result, json!(true));

        let frames = work_frames(&mut rig).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["method"], json!("mining.set_extranonce"));
        assert_eq!(frames[0]["params"][1], json!(4));
        // The announced extranonce1 matches the per-job derivation.
        let job_id = rig.book.cache.current_job().unwrap();
        let expected = hex::encode(rig.session.extranonce1(&job_id.to_byte_array()));
        assert_eq!(frames[0]["params"][0], json!(expected));
    }

    #[tokio::test]
    async fn configure_version_rolling_masks_to_allowed_bits() {
        let mut rig = rig();
        let result = call(
            &mut rig,
            "mining.configure",
            vec![
                json!(["version-rolling"]),
                json!({"version-rolling.mask": "1fffe000", "version-rolling.min-bit-count": 2}),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            result,
            json!({"version-rolling": true, "version-rolling.mask": "1fffe000"})
        );

        // An over-broad request is masked down.
        let result = call(
            &mut rig,
            "mining.configure",
            vec![
                json!(["version-rolling"]),
                json!({"version-rolling.mask": "ffffffff", "version-rolling.min-bit-count": 2}),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result["version-rolling.mask"], json!("1fffe000"));
        assert_eq!(rig.session.version_rolling_mask, VERSION_ROLLING_ALLOWED_MASK);
    }

    #[tokio::test]
    async fn unknown_extensions_are_ignored() {
        let mut rig = rig();
        let result = call(
            &mut rig,
            "mining.configure",
            vec![json!(["minimum-difficulty"]), json!({"minimum-difficulty.value": 2048})],
        )
        .await
        .unwrap();
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn unknown_method_and_arity_errors() {
        let mut rig = rig();
        let err = call(&mut rig, "mining.frobnicate", vec![]).await.unwrap_err();
        assert_eq!(err.code, -32601);

        let err = call(
            &mut rig,
            "mining.subscribe",
            vec![json!("a"), json!("b"), json!("c")],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, -8);

        let err = call(&mut rig, "mining.submit", vec![json!("user")]).await.unwrap_err();
        assert_eq!(err.code, -8);
    }

    #[tokio::test]
    async fn authorize_parses_mindiff_suffix() {
        let mut rig = rig();
        let username = format!("{}+512", payout_address());
        let result =
            call(&mut rig, "mining.authorize", vec![json!(username), json!("x")]).await.unwrap();
        assert_eq!(result, json!(true));
        assert_eq!(rig.session.mindiff, 512.0);

        // The session minimum overrides the delivered difficulty exactly.
        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[0]["params"][0], json!(512.0));
    }

    #[tokio::test]
    async fn authorize_rejects_bad_address() {
        let mut rig = rig();
        let err = call(&mut rig, "mining.authorize", vec![json!("notanaddress"), json!("x")])
            .await
            .unwrap_err();
        assert_eq!(err.code, -8);
        assert!(!rig.session.authorized);
    }

    #[tokio::test]
    async fn authorize_registers_merge_mining_chains() {
        let mut rig = rig();
        let chain = ChainId([0xab; 32]);
        let password = format!("{}=bob:secret, bogus-option", chain);
        authorize_rig(&mut rig, &password).await;

        assert_eq!(rig.session.mmauth.len(), 1);
        assert_eq!(
            rig.session.mmauth.get(&chain),
            Some(&("bob".to_string(), "secret".to_string()))
        );
        let registered = rig.mm.registered.lock().unwrap().clone();
        assert_eq!(registered, vec![(chain, "bob".to_string(), "secret".to_string())]);
    }

    #[tokio::test]
    async fn authorize_resolves_chain_names_and_default_path() {
        let default_chain = ChainId([0xcd; 32]);
        let named_chain = ChainId([0xef; 32]);
        let mut rig = rig_with(RegtestNode::new().with_default_aux_pow_path(default_chain));
        rig.ctx.chain_names.insert("sidechain".to_string(), named_chain);

        let password = format!("sidechain=alice:pw, {}", payout_address());
        authorize_rig(&mut rig, &password).await;

        assert_eq!(rig.session.mmauth.len(), 2);
        assert_eq!(
            rig.session.mmauth.get(&named_chain),
            Some(&("alice".to_string(), "pw".to_string()))
        );
        let (user, pass) = rig.session.mmauth.get(&default_chain).unwrap();
        assert_eq!(user, &payout_address());
        assert_eq!(pass, "x");
    }

    #[tokio::test]
    async fn authorize_skips_truncated_chain_ids() {
        let mut rig = rig();
        // 32 bytes of hex whose upper 24 bytes are zero: treated as a
        // stray integer, not a chain id.
        let mut bytes = [0u8; 32];
        bytes[0] = 7;
        let password = format!("{}=bob", hex::encode(bytes));
        authorize_rig(&mut rig, &password).await;
        assert!(rig.session.mmauth.is_empty());
    }

    #[tokio::test]
    async fn submit_unknown_job_returns_false_and_requeues_work() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;
        let _ = work_frames(&mut rig).await;
        rig.session.send_work = false;

        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!("33".repeat(32)),
                json!("00000000"),
                json!("5f5e1000"),
                json!("00000001"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(false));
        assert!(rig.session.send_work, "unknown job must trigger fresh work");
    }

    #[tokio::test]
    async fn submit_rejects_malformed_extranonce2() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;
        let err = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!("33".repeat(32)),
                json!("0000"),
                json!("5f5e1000"),
                json!("00000001"),
            ],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, -8);
    }

    #[tokio::test]
    async fn valid_share_processes_exactly_one_block() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;
        let frames = work_frames(&mut rig).await;
        let notify = &frames[1];

        let job_id = rig.book.cache.current_job().unwrap();
        let extranonce1 = rig.session.extranonce1(&job_id.to_byte_array());
        let extranonce2 = [0u8; 4];
        let (job_param, time, nonce, hash) = mine_notify(notify, &extranonce1, &extranonce2, None);

        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!(job_param),
                json!(hex::encode(extranonce2)),
                json!(rpc::hex_int4(time)),
                json!(rpc::hex_int4(nonce)),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(true));
        // The block the server reconstructed hashes to exactly what the
        // miner searched over.
        assert_eq!(rig.node.accepted_blocks(), vec![hash], "exactly one ProcessNewBlock call");
        assert!(rig.session.send_work, "block finder is sent fresh work");
    }

    #[tokio::test]
    async fn valid_share_with_version_rolling() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;
        let _ = call(
            &mut rig,
            "mining.configure",
            vec![
                json!(["version-rolling"]),
                json!({"version-rolling.mask": "1fffe000", "version-rolling.min-bit-count": 2}),
            ],
        )
        .await
        .unwrap();

        let frames = work_frames(&mut rig).await;
        let notify = &frames[frames.len() - 1];

        let job_id = rig.book.cache.current_job().unwrap();
        let base = rig.book.cache.get(&job_id).unwrap().block.header.version.to_consensus() as u32;
        let bits = 0x0004_2000u32;
        let rolled = (base & !rig.session.version_rolling_mask)
            | (bits & rig.session.version_rolling_mask);

        let extranonce1 = rig.session.extranonce1(&job_id.to_byte_array());
        let extranonce2 = [1u8, 2, 3, 4];
        let (job_param, time, nonce, hash) =
            mine_notify(notify, &extranonce1, &extranonce2, Some(rolled));

        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!(job_param),
                json!(hex::encode(extranonce2)),
                json!(rpc::hex_int4(time)),
                json!(rpc::hex_int4(nonce)),
                json!(rpc::hex_int4(bits)),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(true));
        assert_eq!(rig.node.accepted_blocks(), vec![hash]);
    }

    #[tokio::test]
    async fn merge_mining_commitment_and_aux_share_flow() {
        let mut rig = rig();
        let chain = ChainId([0xab; 32]);
        let mut work = MmWork::new();
        work.insert(
            chain,
            AuxWork {
                commit: sha256d::Hash::hash(b"aux commitment"),
                bits: CompactTarget::from_consensus(0x207f_ffff),
                ..Default::default()
            },
        );
        rig.mm.set_work(work);

        authorize_rig(&mut rig, &format!("{}=bob:p", chain)).await;
        let frames = work_frames(&mut rig).await;
        let notify = &frames[1];

        // The job id carries the aux root, and the session cached the
        // bundle under it.
        let job_param = notify["params"][0].as_str().unwrap().to_string();
        let (job_hex, root_hex) = job_param.split_once(':').expect("job id carries aux root");
        assert_eq!(job_hex.len(), 64);
        let root = sha256d::Hash::from_byte_array(
            hex::decode(root_hex).unwrap().try_into().unwrap(),
        );
        assert!(rig.session.mmwork.contains_key(&root));

        let job_id = rig.book.cache.current_job().unwrap();
        let extranonce1 = rig.session.extranonce1(&job_id.to_byte_array());
        let extranonce2 = [0u8; 4];
        let (job_param, time, nonce, _hash) = mine_notify(notify, &extranonce1, &extranonce2, None);

        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!(job_param),
                json!(hex::encode(extranonce2)),
                json!(rpc::hex_int4(time)),
                json!(rpc::hex_int4(nonce)),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(true));

        let aux_shares = rig.mm.aux_shares.lock().unwrap();
        assert_eq!(aux_shares.len(), 1);
        let (share_chain, username, auxwork, proof) = &aux_shares[0];
        assert_eq!(*share_chain, chain);
        assert_eq!(username, "bob");
        assert_eq!(auxwork.commit, sha256d::Hash::hash(b"aux commitment"));
        // The proof authenticates the block-final transaction's position.
        let work = rig.book.cache.get(&job_id).unwrap();
        assert_eq!(proof.num_txns as usize, work.block.txdata.len());
        assert!(!proof.aux_branch.is_empty());
        assert!(proof.midstate_length > 0);
    }

    #[tokio::test]
    async fn second_stage_delivery_and_submission() {
        let mut rig = rig();
        let chain = ChainId([0xee; 32]);
        let ssw = SecondStageWork {
            timestamp: 1,
            diff: 1000.0,
            job_id: "abcd".to_string(),
            hash_prev_block: BlockHash::from_byte_array([0x77; 32]),
            cb1: vec![0x01, 0x02, 0x03],
            cb2: vec![0x04, 0x05],
            cb_branch: vec![TxMerkleNode::from_byte_array([0x99; 32])],
            n_version: 0x2000_0000,
            n_bits: CompactTarget::from_consensus(0x207f_ffff),
            n_time: 0x5f5e_1000,
        };
        rig.mm.set_second_stage(Some((chain, ssw.clone())));

        authorize_rig(&mut rig, &format!("{}=carol", chain)).await;
        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[0]["params"][0], json!(1000.0));
        let notify = &frames[1];
        assert_eq!(notify["params"][0], json!(":abcd"));
        assert_eq!(notify["params"][8], json!(true));
        assert_eq!(rig.session.last_second_stage, Some((chain, ssw.hash_prev_block)));

        // Redelivery of the same work is not clean.
        let frames = work_frames(&mut rig).await;
        assert_eq!(frames[1]["params"][8], json!(false));

        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!(":abcd"),
                json!("deadbeef"),
                json!(rpc::hex_int4(ssw.n_time)),
                json!("00000007"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(true));

        let shares = rig.mm.second_stage_shares.lock().unwrap();
        assert_eq!(shares.len(), 1);
        let (share_chain, username, proof) = &shares[0];
        assert_eq!(*share_chain, chain);
        assert_eq!(username, "carol");
        assert_eq!(proof.extranonce1, rig.session.extranonce1(&chain.0).to_vec());
        assert_eq!(proof.extranonce2, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(proof.n_time, ssw.n_time);
        assert_eq!(proof.n_nonce, 7);
    }

    #[tokio::test]
    async fn second_stage_for_unknown_job_returns_false() {
        let mut rig = rig();
        authorize_rig(&mut rig, "").await;
        let result = call(
            &mut rig,
            "mining.submit",
            vec![
                json!("user"),
                json!(":nosuchjob"),
                json!("00000000"),
                json!("5f5e1000"),
                json!("00000001"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(result, json!(false));
        assert!(rig.session.send_work);
    }
}
