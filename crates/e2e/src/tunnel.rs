//! Recording tunnel controller

use async_trait::async_trait;
use meshagent_common::Result;
use meshagent_daemon::TunnelController;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One lifecycle call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCall {
    Start { mesh: String, config_path: PathBuf },
    Stop { mesh: String },
}

impl TunnelCall {
    pub fn mesh(&self) -> &str {
        match self {
            TunnelCall::Start { mesh, .. } | TunnelCall::Stop { mesh } => mesh,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, TunnelCall::Start { .. })
    }
}

/// Tunnel controller that only remembers what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingTunnels {
    calls: Mutex<Vec<TunnelCall>>,
    up: Mutex<BTreeSet<String>>,
}

impl RecordingTunnels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TunnelCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of start calls for a mesh
    pub fn starts(&self, mesh: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.is_start() && c.mesh() == mesh)
            .count()
    }

    pub fn is_running(&self, mesh: &str) -> bool {
        self.up.lock().contains(mesh)
    }

    /// Simulate a tunnel dying outside the agent's control
    pub fn kill(&self, mesh: &str) {
        self.up.lock().remove(mesh);
    }
}

#[async_trait]
impl TunnelController for RecordingTunnels {
    async fn start(&self, mesh: &str, config_path: &Path) -> Result<()> {
        self.calls.lock().push(TunnelCall::Start {
            mesh: mesh.to_string(),
            config_path: config_path.to_path_buf(),
        });
        self.up.lock().insert(mesh.to_string());
        Ok(())
    }

    async fn stop(&self, mesh: &str, _config_path: &Path) -> Result<()> {
        self.calls.lock().push(TunnelCall::Stop {
            mesh: mesh.to_string(),
        });
        self.up.lock().remove(mesh);
        Ok(())
    }

    async fn is_up(&self, mesh: &str) -> Result<bool> {
        Ok(self.is_running(mesh))
    }
}
