//! Tunnel lifecycle
//!
//! The agent never touches WireGuard itself; it drives the platform tools.

use async_trait::async_trait;
use meshagent_common::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Starts, stops and probes mesh tunnels
#[async_trait]
pub trait TunnelController: Send + Sync {
    /// Bring up the tunnel described by `config_path`
    async fn start(&self, mesh: &str, config_path: &Path) -> Result<()>;

    /// Bring the tunnel down. Stopping a tunnel that is not running succeeds.
    async fn stop(&self, mesh: &str, config_path: &Path) -> Result<()>;

    /// True if the tunnel interface exists
    async fn is_up(&self, mesh: &str) -> Result<bool>;
}

/// `wg-quick` / `wg` driver
#[derive(Debug, Clone)]
pub struct WgQuick {
    wg_quick: PathBuf,
    wg: PathBuf,
}

impl Default for WgQuick {
    fn default() -> Self {
        Self {
            wg_quick: PathBuf::from("wg-quick"),
            wg: PathBuf::from("wg"),
        }
    }
}

impl WgQuick {
    pub fn new(wg_quick: impl Into<PathBuf>, wg: impl Into<PathBuf>) -> Self {
        Self {
            wg_quick: wg_quick.into(),
            wg: wg.into(),
        }
    }

    async fn run(&self, mesh: &str, program: &Path, args: &[&OsStr]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Tunnel {
                mesh: mesh.to_string(),
                message: format!("failed to run {}: {}", program.display(), e),
            })?;

        if !output.status.success() {
            return Err(Error::Tunnel {
                mesh: mesh.to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        debug!(
            "{} for {}: {}",
            program.display(),
            mesh,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }
}

#[async_trait]
impl TunnelController for WgQuick {
    async fn start(&self, mesh: &str, config_path: &Path) -> Result<()> {
        self.run(mesh, &self.wg_quick, &[OsStr::new("up"), config_path.as_os_str()])
            .await?;
        info!("Tunnel {} started", mesh);
        Ok(())
    }

    async fn stop(&self, mesh: &str, config_path: &Path) -> Result<()> {
        if !self.is_up(mesh).await? {
            debug!("Tunnel {} not running", mesh);
            return Ok(());
        }
        self.run(mesh, &self.wg_quick, &[OsStr::new("down"), config_path.as_os_str()])
            .await?;
        info!("Tunnel {} stopped", mesh);
        Ok(())
    }

    async fn is_up(&self, mesh: &str) -> Result<bool> {
        let status = Command::new(&self.wg)
            .args(["show", mesh])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Tunnel {
                mesh: mesh.to_string(),
                message: format!("failed to run {}: {}", self.wg.display(), e),
            })?;
        Ok(status.success())
    }
}
