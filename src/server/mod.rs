//! The stratum TCP server: listeners, connection handling, lifecycle.
//!
//! One accept task per bound endpoint and one read/write task per
//! connection, all sharing a single coarse lock over the server state
//! (sessions, work templates, second-stage work). Traffic is low-rate
//! control traffic, so the coarse lock is never contended in practice.
//! Outgoing frames go through an unbounded per-connection channel, so
//! writes never block the reader.

pub mod handlers;
pub mod session;
pub mod watcher;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::mergemine::MergeMineClient;
use crate::node::NodeHandle;
use crate::rpc;
use crate::server::handlers::{dispatch, StratumContext};
use crate::server::session::ClientSession;
use crate::work::assembler::{get_work_unit, WorkBook};

pub(crate) struct SessionEntry {
    pub session: ClientSession,
    pub outgoing: mpsc::UnboundedSender<String>,
}

/// Everything behind the server's coarse lock.
#[derive(Default)]
pub(crate) struct ServerState {
    pub sessions: HashMap<u64, SessionEntry>,
    pub book: WorkBook,
}

/// The stratum server singleton. Create with [`StratumServer::new`],
/// start with [`StratumServer::init`], tear down with
/// [`StratumServer::interrupt`] followed by [`StratumServer::stop`].
pub struct StratumServer {
    ctx: Arc<StratumContext>,
    state: Arc<Mutex<ServerState>>,
    endpoints: Vec<SocketAddr>,
    allow_subnets: Vec<IpNet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    next_conn_id: Arc<AtomicU64>,
}

impl StratumServer {
    pub fn new(
        config: &Config,
        node: Arc<dyn NodeHandle>,
        mergemine: Arc<dyn MergeMineClient>,
    ) -> Result<Self> {
        let endpoints = config.stratum_endpoints()?;
        let allow_subnets = config.allow_subnets()?;
        let ctx = StratumContext {
            node,
            mergemine,
            network: config.network()?,
            chain_names: config.chain_names()?,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            state: Arc::new(Mutex::new(ServerState::default())),
            endpoints,
            allow_subnets,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Bind all configured endpoints and start the accept loops and the
    /// block watcher.
    pub async fn init(&self) -> Result<()> {
        let allowed: String =
            self.allow_subnets.iter().map(|net| format!("{} ", net)).collect();
        debug!(subnets = %allowed, "Allowing stratum connections from");

        let mut bound = 0usize;
        for endpoint in &self.endpoints {
            match TcpListener::bind(endpoint).await {
                Ok(listener) => {
                    info!(%endpoint, "Binding stratum on address");
                    bound += 1;
                    self.tracker.spawn(accept_loop(
                        listener,
                        self.ctx.clone(),
                        self.state.clone(),
                        self.allow_subnets.clone(),
                        self.shutdown.clone(),
                        self.tracker.clone(),
                        self.next_conn_id.clone(),
                    ));
                }
                Err(err) => {
                    warn!(%endpoint, %err, "Binding stratum endpoint failed");
                }
            }
        }
        if bound == 0 && !self.endpoints.is_empty() {
            warn!("Unable to bind any endpoint for stratum server");
        } else {
            debug!("Initialized stratum server");
        }

        self.tracker.spawn(watcher::block_watcher(
            self.ctx.clone(),
            self.state.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }

    /// Stop accepting connections and wake the watcher for exit.
    pub fn interrupt(&self) {
        for endpoint in &self.endpoints {
            debug!(%endpoint, "Interrupting stratum service");
        }
        self.shutdown.cancel();
    }

    /// Tear down connections, free listeners, and clear cached work.
    pub async fn stop(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        let mut state = self.state.lock().await;
        for entry in state.sessions.values() {
            debug!(peer = %entry.session.peer, "Closing stratum server connection due to process termination");
        }
        state.sessions.clear();
        state.book.cache.clear();
        state.book.second_stages.clear();
    }
}

fn peer_allowed(subnets: &[IpNet], ip: IpAddr) -> bool {
    subnets.iter().any(|net| net.contains(&ip))
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<StratumContext>,
    state: Arc<Mutex<ServerState>>,
    allow_subnets: Vec<IpNet>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    conn_ids: Arc<AtomicU64>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                if !peer_allowed(&allow_subnets, peer.ip()) {
                    // Reject-in-accept frees the whole listener.
                    warn!(%peer, "Rejected connection from disallowed subnet");
                    break;
                }
                if let Err(err) = socket.set_nodelay(true) {
                    debug!(%peer, %err, "Failed to disable Nagle's algorithm");
                }
                let conn_id = conn_ids.fetch_add(1, Ordering::SeqCst);
                tracker.spawn(connection_task(
                    socket,
                    peer,
                    conn_id,
                    ctx.clone(),
                    state.clone(),
                    shutdown.clone(),
                ));
            }
            Err(err) => {
                warn!(%err, "Stratum accept failed");
            }
        }
    }
}

async fn connection_task(
    socket: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
    ctx: Arc<StratumContext>,
    state: Arc<Mutex<ServerState>>,
    shutdown: CancellationToken,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

    state
        .lock()
        .await
        .sessions
        .insert(conn_id, SessionEntry { session: ClientSession::new(peer), outgoing });
    info!(%peer, "Accepted stratum connection");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = write_half.write_all(frame.as_bytes()).await {
                    debug!(%peer, %err, "Error writing to stratum connection");
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&ctx, &state, conn_id, line.trim_end()).await,
                    Ok(None) => {
                        debug!(%peer, "Remote disconnect received on stratum connection");
                        break;
                    }
                    Err(err) => {
                        debug!(%peer, %err, "Error detected on stratum connection");
                        break;
                    }
                }
            }
        }
    }

    state.lock().await.sessions.remove(&conn_id);
    debug!(%peer, "Closing stratum connection");
}

/// Handle one received line under the global lock: parse, dispatch,
/// reply, then deliver any newly requested work in the same batch.
async fn handle_line(
    ctx: &StratumContext,
    state: &Mutex<ServerState>,
    conn_id: u64,
    line: &str,
) {
    let mut locked = state.lock().await;
    let ServerState { sessions, book } = &mut *locked;
    let Some(entry) = sessions.get_mut(&conn_id) else {
        debug!(conn_id, "Received line for unknown stratum connection");
        return;
    };
    debug!(peer = %entry.session.peer, %line, "Received stratum request");

    let reply = match rpc::parse_line(line) {
        Ok(None) => {
            debug!("Ignoring JSON-RPC response");
            None
        }
        Ok(Some(request)) => {
            let result = dispatch(ctx, book, &mut entry.session, &request).await;
            Some(match result {
                Ok(value) => rpc::reply(value, &request.id),
                Err(err) => rpc::error_reply(&err, &request.id),
            })
        }
        Err(err) => Some(rpc::error_reply(&err, &Value::Null)),
    };
    if let Some(reply) = reply {
        debug!(peer = %entry.session.peer, reply = %reply.trim_end(), "Sending stratum response");
        let _ = entry.outgoing.send(reply);
    }

    if entry.session.send_work {
        let data = match get_work_unit(book, &mut entry.session, &ctx.node, &ctx.mergemine).await
        {
            Ok(data) => data,
            Err(err) => rpc::error_reply(&err, &Value::Null),
        };
        debug!(peer = %entry.session.peer, "Sending requested stratum work unit");
        let _ = entry.outgoing.send(data);
        entry.session.send_work = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use bitcoin::hashes::Hash;
    use bitcoin::Network;
    use serde_json::json;

    use crate::mergemine::testing::RecordingMergeMine;
    use crate::node::RegtestNode;

    fn test_state() -> (Mutex<ServerState>, u64, mpsc::UnboundedReceiver<String>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let mut state = ServerState::default();
        state.sessions.insert(
            7,
            SessionEntry {
                session: ClientSession::new("127.0.0.1:1000".parse().unwrap()),
                outgoing,
            },
        );
        (Mutex::new(state), 7, rx)
    }

    fn test_ctx() -> StratumContext {
        StratumContext {
            node: Arc::new(RegtestNode::new()),
            mergemine: Arc::new(RecordingMergeMine::new()),
            network: Network::Regtest,
            chain_names: BTreeMap::new(),
        }
    }

    #[test]
    fn allow_list_matching() {
        let subnets: Vec<IpNet> =
            vec!["127.0.0.0/8".parse().unwrap(), "10.1.0.0/16".parse().unwrap()];
        assert!(peer_allowed(&subnets, "127.0.0.1".parse().unwrap()));
        assert!(peer_allowed(&subnets, "10.1.2.3".parse().unwrap()));
        assert!(!peer_allowed(&subnets, "10.2.0.1".parse().unwrap()));
        assert!(!peer_allowed(&subnets, "8.8.8.8".parse().unwrap()));
        // An empty allow-list admits nobody.
        assert!(!peer_allowed(&[], "127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn malformed_line_yields_parse_error_reply() {
        let ctx = test_ctx();
        let (state, conn_id, mut rx) = test_state();
        handle_line(&ctx, &state, conn_id, "this is not json").await;
        let reply: serde_json::Value =
            serde_json::from_str(rx.try_recv().unwrap().trim_end()).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn response_lines_are_silently_ignored() {
        let ctx = test_ctx();
        let (state, conn_id, mut rx) = test_state();
        handle_line(&ctx, &state, conn_id, r#"{"id":1,"result":true,"error":null}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_job_submit_is_followed_by_fresh_notify() {
        let ctx = test_ctx();
        let (state, conn_id, mut rx) = test_state();

        // Authorize through the wire path.
        let addr = bitcoin::Address::p2pkh(
            bitcoin::PubkeyHash::from_byte_array([0x42; 20]),
            Network::Regtest,
        );
        let line = json!({
            "id": 1,
            "method": "mining.authorize",
            "params": [addr.to_string(), "x"],
        })
        .to_string();
        handle_line(&ctx, &state, conn_id, &line).await;
        let _auth_reply = rx.try_recv().unwrap();
        let _first_work = rx.try_recv().unwrap();

        // Submit against a job id that is not in the cache.
        let line = json!({
            "id": 2,
            "method": "mining.submit",
            "params": ["user", "44".repeat(32), "00000000", "5f5e1000", "00000001"],
        })
        .to_string();
        handle_line(&ctx, &state, conn_id, &line).await;

        let reply: serde_json::Value =
            serde_json::from_str(rx.try_recv().unwrap().trim_end()).unwrap();
        assert_eq!(reply["result"], json!(false));

        // The very next frames are an unsolicited difficulty + notify.
        let followup = rx.try_recv().unwrap();
        let frames: Vec<serde_json::Value> =
            followup.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(frames[0]["method"], json!("mining.set_difficulty"));
        assert_eq!(frames[1]["method"], json!("mining.notify"));
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let node: Arc<dyn crate::node::NodeHandle> = Arc::new(RegtestNode::new());
        let mm: Arc<dyn crate::mergemine::MergeMineClient> = Arc::new(RecordingMergeMine::new());
        let config = crate::config::Config {
            stratum: crate::config::StratumConfig {
                listen: vec!["127.0.0.1:0".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let server = StratumServer::new(&config, node, mm).unwrap();

        // Bind on an ephemeral port by hand so the test can learn it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        server.tracker.spawn(accept_loop(
            listener,
            server.ctx.clone(),
            server.state.clone(),
            server.allow_subnets.clone(),
            server.shutdown.clone(),
            server.tracker.clone(),
            server.next_conn_id.clone(),
        ));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test/1.0\"]}\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(stream).lines();
        let reply = reader.next_line().await.unwrap().unwrap();
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"][2], json!(4));

        server.interrupt();
        server.stop().await;
    }
}
