//! meshagent common library
//!
//! Wire types, key material, route filtering, tunnel rendering and the mesh
//! DNS table shared by the agent and its test harness.

pub mod crypto;
pub mod dns;
pub mod error;
pub mod keystore;
pub mod names;
pub mod render;
pub mod subnet;
pub mod types;

pub use crypto::WgKeyPair;
pub use dns::{DnsHandle, DnsSnapshot, DnsTable, ServerTable};
pub use error::{Error, Result};
pub use keystore::KeyStore;
pub use render::{TunnelRenderer, WgQuickRenderer};
pub use types::*;

/// meshagent version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default directory for agent state: desired state, key store, config file
pub fn default_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/meshagent")
}

/// Default directory for rendered tunnel configurations
pub fn default_tunnel_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/etc/wireguard")
}

/// Desired state file name inside the data directory
pub const STATE_FILE: &str = "desired-state.json";

/// Key store file name inside the data directory
pub const KEYS_FILE: &str = "keys.json";

/// Agent configuration file name inside the data directory
pub const CONFIG_FILE: &str = "agent.toml";
