//! On-disk state: the last accepted desired state and the rendered tunnels

use crate::config::AgentConfig;
use meshagent_common::names::{validate_tunnel_name, CONFIG_SUFFIX};
use meshagent_common::{DesiredState, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// File-backed state store
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    tunnel_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>, tunnel_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            tunnel_dir: tunnel_dir.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.state_path(), &config.tunnel_dir)
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn tunnel_dir(&self) -> &Path {
        &self.tunnel_dir
    }

    /// Raw bytes of the persisted desired state, `None` if never written
    pub async fn read_state(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.state_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Decoded persisted desired state.
    ///
    /// An undecodable file is reported and treated as absent.
    pub async fn load_state(&self) -> Result<Option<DesiredState>> {
        let Some(data) = self.read_state().await? else {
            return Ok(None);
        };
        match DesiredState::from_slice(&data) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Ignoring undecodable {:?}: {}", self.state_path, e);
                Ok(None)
            }
        }
    }

    /// Replace the persisted desired state
    pub async fn persist_state(&self, body: &[u8]) -> Result<()> {
        write_atomic(&self.state_path, body).await
    }

    /// Delete the persisted desired state. Returns true if it existed.
    pub async fn remove_state(&self) -> Result<bool> {
        remove_if_exists(&self.state_path).await
    }

    /// Path of a mesh's tunnel configuration
    pub fn tunnel_path(&self, mesh: &str) -> Result<PathBuf> {
        let name = validate_tunnel_name(mesh)?;
        Ok(self.tunnel_dir.join(format!("{}{}", name, CONFIG_SUFFIX)))
    }

    /// Last applied tunnel configuration
    pub async fn read_tunnel(&self, mesh: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.tunnel_path(mesh)?).await?)
    }

    pub async fn write_tunnel(&self, mesh: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.tunnel_path(mesh)?, data).await
    }

    pub async fn remove_tunnel(&self, mesh: &str) -> Result<bool> {
        remove_if_exists(&self.tunnel_path(mesh)?).await
    }
}

/// Write to a sibling temp file and rename over the target, owner-only
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("Wrote {} bytes to {:?}", data.len(), path);
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
