//! Configuration management for stratumd.
//!
//! Settings load from a TOML file and may be overridden from the command
//! line. Every section has serde defaults, so an empty file (or none at
//! all) yields a runnable configuration.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mergemine::ChainId;

/// Main configuration structure for the server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Network whose addresses are accepted as payout usernames.
    pub network: String,

    /// Share chain selection (`solo` or `main`). Recorded for the share
    /// chain module; the stratum server itself does not interpret it.
    pub sharechain: String,

    /// Stratum service configuration.
    pub stratum: StratumConfig,

    /// Merge-mining configuration.
    pub mergemine: MergeMineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "regtest".to_string(),
            sharechain: "solo".to_string(),
            stratum: StratumConfig::default(),
            mergemine: MergeMineConfig::default(),
        }
    }
}

/// Stratum service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StratumConfig {
    /// Endpoints to listen on, as `host` or `host:port`.
    pub listen: Vec<String>,

    /// Port used by `listen` entries that don't name one.
    pub port: u16,

    /// Subnets allowed to connect. When empty, only localhost is
    /// admitted.
    pub allow: Vec<String>,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self { listen: Vec::new(), port: 9638, allow: Vec::new() }
    }
}

/// Merge-mining configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeMineConfig {
    /// Alternative names for auxiliary chains: name → 32-byte hex id.
    /// Names become usable as `name=user:pass` authorization options.
    pub chains: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn network(&self) -> Result<bitcoin::Network> {
        self.network
            .parse()
            .map_err(|_| Error::Config(format!("unknown network: {}", self.network)))
    }

    /// Resolved listen endpoints, applying the default port to entries
    /// without one.
    pub fn stratum_endpoints(&self) -> Result<Vec<SocketAddr>> {
        let mut endpoints = Vec::new();
        for entry in &self.stratum.listen {
            if let Ok(addr) = entry.parse::<SocketAddr>() {
                endpoints.push(addr);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                endpoints.push(SocketAddr::new(ip, self.stratum.port));
            } else {
                return Err(Error::Config(format!("invalid stratum endpoint: {}", entry)));
            }
        }
        Ok(endpoints)
    }

    /// The subnet allow-list; localhost only when nothing is configured.
    pub fn allow_subnets(&self) -> Result<Vec<IpNet>> {
        if self.stratum.allow.is_empty() {
            return Ok(vec![
                "127.0.0.0/8".parse().expect("constant subnet"),
                "::1/128".parse().expect("constant subnet"),
            ]);
        }
        let mut subnets = Vec::new();
        for entry in &self.stratum.allow {
            if let Ok(net) = entry.parse::<IpNet>() {
                subnets.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                subnets.push(IpNet::from(ip));
            } else {
                return Err(Error::Config(format!("invalid allow subnet: {}", entry)));
            }
        }
        Ok(subnets)
    }

    /// Chain-name registrations parsed into chain ids.
    pub fn chain_names(&self) -> Result<BTreeMap<String, ChainId>> {
        let mut names = BTreeMap::new();
        for (name, hex) in &self.mergemine.chains {
            let chain_id = ChainId::from_hex(hex)
                .ok_or_else(|| Error::Config(format!("invalid chain id for {}: {}", name, hex)))?;
            names.insert(name.clone(), chain_id);
        }
        Ok(names)
    }
}
