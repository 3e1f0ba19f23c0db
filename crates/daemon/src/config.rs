//! Agent configuration
//!
//! Layered as defaults < `agent.toml` < environment < command line. The
//! identity part (server, host group, API key) is published as an
//! `Arc<AgentIdentity>` snapshot that the 401 recovery path can swap.

use meshagent_common::keystore::write_private;
use meshagent_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding `server_url`
pub const ENV_SERVER: &str = "MESHAGENT_SERVER";
/// Environment variable overriding `host_id`
pub const ENV_HOST_ID: &str = "MESHAGENT_HOST_ID";
/// Environment variable overriding `api_key`
pub const ENV_API_KEY: &str = "MESHAGENT_API_KEY";

/// Agent configuration file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control server base URL
    pub server_url: String,

    /// Host group identifying this node in every mesh
    pub host_id: String,

    /// API key sent with every poll
    pub api_key: String,

    /// Seconds between polls
    pub check_interval_secs: u64,

    /// Seconds between full resyncs
    pub resync_interval_secs: u64,

    /// Local address for outgoing https connections
    pub source_address: String,

    /// Directory holding desired state, key store and this file
    pub data_dir: PathBuf,

    /// Directory holding rendered tunnel configurations
    pub tunnel_dir: PathBuf,

    /// UDP port of the mesh DNS service
    pub dns_port: u16,

    /// Multicast group receiving DNS query reports
    pub dns_report_group: String,

    pub quiet: bool,
    pub debug: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "https://my.meshify.app".to_string(),
            host_id: String::new(),
            api_key: String::new(),
            check_interval_secs: 10,
            resync_interval_secs: 3600,
            source_address: "0.0.0.0".to_string(),
            data_dir: meshagent_common::default_data_dir(),
            tunnel_dir: meshagent_common::default_tunnel_dir(),
            dns_port: 53,
            dns_report_group: "239.255.77.77:25353".to_string(),
            quiet: false,
            debug: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save configuration to file, owner-only since it carries the API key
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));
        write_private(&tmp, content.as_bytes())?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Overlay the identity environment variables
    pub fn with_env(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(v) = var(ENV_SERVER) {
            self.server_url = v;
        }
        if let Some(v) = var(ENV_HOST_ID) {
            self.host_id = v;
        }
        if let Some(v) = var(ENV_API_KEY) {
            self.api_key = v;
        }
        self
    }

    /// Fail unless an identity is present
    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(Error::InvalidConfig("server_url is empty".to_string()));
        }
        if self.host_id.trim().is_empty() {
            return Err(Error::InvalidConfig("host_id is empty".to_string()));
        }
        if self.check_interval_secs == 0 {
            return Err(Error::InvalidConfig("check_interval_secs must be positive".to_string()));
        }
        self.source_ip()?;
        self.report_group()?;
        Ok(())
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            server_url: self.server_url.trim_end_matches('/').to_string(),
            host_id: self.host_id.clone(),
            api_key: self.api_key.clone(),
        }
    }

    pub fn source_ip(&self) -> Result<IpAddr> {
        self.source_address
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("source_address {:?}: {}", self.source_address, e)))
    }

    pub fn report_group(&self) -> Result<SocketAddr> {
        self.dns_report_group
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("dns_report_group {:?}: {}", self.dns_report_group, e)))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }

    /// Persisted desired state
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(meshagent_common::STATE_FILE)
    }

    /// Key store file
    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(meshagent_common::KEYS_FILE)
    }

    /// Default location of this file
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(meshagent_common::CONFIG_FILE)
    }
}

/// Who this agent is and where it reports
#[derive(Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub server_url: String,
    pub host_id: String,
    pub api_key: String,
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("server_url", &self.server_url)
            .field("host_id", &self.host_id)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// Identity values given on the command line; they win over file and env
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    pub server_url: Option<String>,
    pub host_id: Option<String>,
    pub api_key: Option<String>,
}

impl IdentityOverrides {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(v) = &self.server_url {
            config.server_url = v.clone();
        }
        if let Some(v) = &self.host_id {
            config.host_id = v.clone();
        }
        if let Some(v) = &self.api_key {
            config.api_key = v.clone();
        }
    }
}

/// Shared configuration handed to every task
#[derive(Debug)]
pub struct ConfigContext {
    config: AgentConfig,
    config_path: PathBuf,
    overrides: Mutex<IdentityOverrides>,
    identity: RwLock<Arc<AgentIdentity>>,
    stale: AtomicBool,
}

impl ConfigContext {
    /// Resolve the layered configuration and build the context
    pub fn load(config_path: &Path, overrides: IdentityOverrides) -> Result<Self> {
        let mut config = AgentConfig::load(config_path)?.with_env();
        overrides.apply(&mut config);
        config.validate()?;
        Ok(Self::with_overrides(config, config_path.to_path_buf(), overrides))
    }

    /// Context over an already resolved configuration
    pub fn new(config: AgentConfig, config_path: PathBuf) -> Self {
        Self::with_overrides(config, config_path, IdentityOverrides::default())
    }

    fn with_overrides(config: AgentConfig, config_path: PathBuf, overrides: IdentityOverrides) -> Self {
        let identity = Arc::new(config.identity());
        Self {
            config,
            config_path,
            overrides: Mutex::new(overrides),
            identity: RwLock::new(identity),
            stale: AtomicBool::new(false),
        }
    }

    /// Static settings as resolved at startup
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Current identity snapshot
    pub fn identity(&self) -> Arc<AgentIdentity> {
        self.identity.read().clone()
    }

    /// Switch to a different API key and write it back to the config file
    pub fn switch_api_key(&self, api_key: &str) {
        let current = self.identity();
        let next = AgentIdentity {
            api_key: api_key.to_string(),
            ..(*current).clone()
        };
        *self.identity.write() = Arc::new(next);
        // A stale command-line key would otherwise come back on reload
        self.overrides.lock().api_key = None;

        let mut on_disk = match AgentConfig::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Not saving new API key, cannot read {:?}: {}", self.config_path, e);
                return;
            }
        };
        on_disk.api_key = api_key.to_string();
        if on_disk.host_id.is_empty() {
            on_disk.host_id = current.host_id.clone();
        }
        if let Err(e) = on_disk.save(&self.config_path) {
            warn!("Failed to save {:?}: {}", self.config_path, e);
        }
    }

    /// Flag the identity for reload before the next poll
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Reload identity from file and environment if it was marked stale.
    ///
    /// Returns true when a reload happened. On failure the old identity stays
    /// and the flag remains set.
    pub fn reload_if_stale(&self) -> Result<bool> {
        if !self.is_stale() {
            return Ok(false);
        }

        let mut config = AgentConfig::load(&self.config_path)?.with_env();
        self.overrides.lock().apply(&mut config);
        if config.host_id.is_empty() {
            config.host_id = self.identity().host_id.clone();
        }
        config.validate()?;

        *self.identity.write() = Arc::new(config.identity());
        self.stale.store(false, Ordering::SeqCst);
        info!("Configuration reloaded for host group {}", config.host_id);
        Ok(true)
    }
}
