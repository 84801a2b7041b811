//! stratumd - stratum mining server with merge-mining support.
//!
//! Accepts TCP connections from mining devices, delivers customized
//! block-assembly work units for the host chain, and validates returned
//! shares against both the primary chain's proof-of-work target and any
//! subscribed auxiliary chains'. Designed to live inside a full node:
//! block assembly and consensus validation are reached through the
//! [`node::NodeHandle`] trait, auxiliary chains through
//! [`mergemine::MergeMineClient`].

pub mod config;
pub mod error;
pub mod logging;
pub mod mergemine;
pub mod node;
pub mod rpc;
pub mod server;
pub mod types;
pub mod work;

pub use config::Config;
pub use error::{Error, Result};
pub use server::StratumServer;
