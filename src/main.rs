use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{self, SignalKind};
use tracing::{info, trace};

use stratumd::logging;
use stratumd::mergemine::NullMergeMine;
use stratumd::node::RegtestNode;
use stratumd::{Config, StratumServer};

/// Stratum mining server with merge-mining support.
///
/// Runs against a self-contained regtest chain, which is useful for
/// bring-up and protocol testing; production deployments embed the
/// server in a full node instead.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind endpoint(s) for the stratum service, host[:port].
    #[arg(long = "stratum")]
    stratum: Vec<String>,

    /// Default port for endpoints without one.
    #[arg(long = "stratumport")]
    stratum_port: Option<u16>,

    /// Subnet(s) allowed to connect.
    #[arg(long = "stratumallowip")]
    stratum_allow_ip: Vec<String>,

    /// Share chain selection (solo or main).
    #[arg(long)]
    sharechain: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if !cli.stratum.is_empty() {
        config.stratum.listen = cli.stratum.clone();
    }
    if config.stratum.listen.is_empty() {
        config.stratum.listen = vec!["127.0.0.1".to_string()];
    }
    if let Some(port) = cli.stratum_port {
        config.stratum.port = port;
    }
    if !cli.stratum_allow_ip.is_empty() {
        config.stratum.allow = cli.stratum_allow_ip.clone();
    }
    if let Some(sharechain) = &cli.sharechain {
        config.sharechain = sharechain.clone();
    }
    info!(sharechain = %config.sharechain, "Selected share chain");

    let node = Arc::new(RegtestNode::new());
    let server = StratumServer::new(&config, node, Arc::new(NullMergeMine))?;
    server.init().await?;
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    server.interrupt();
    server.stop().await;
    info!("Exiting.");
    Ok(())
}
