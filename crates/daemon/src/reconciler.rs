//! Reconciliation engine
//!
//! Converges local tunnels, keys and the DNS table to the desired state sent
//! by the control server. Every pass, whether triggered by a poll or by the
//! periodic resync, runs under one global lock.

use crate::config::{AgentIdentity, ConfigContext};
use crate::control::ControlPlane;
use crate::dns::DnsServer;
use crate::store::StateStore;
use crate::tunnel::TunnelController;
use crate::upnp::{spawn_port_mapping, DisabledPortMapper, PortMapper};
use ipnetwork::IpNetwork;
use meshagent_common::crypto::fingerprint;
use meshagent_common::names::validate_tunnel_name;
use meshagent_common::subnet::{filter_allowed_ips, local_subnets};
use meshagent_common::{
    dns, DesiredState, DnsHandle, Host, KeyStore, MeshConfig, MeshView, Result, TunnelRenderer,
    WgKeyPair, WgQuickRenderer,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of local interface subnets, given interfaces to ignore
pub type SubnetSource = fn(&[String]) -> Result<Vec<IpNetwork>>;

/// What happened to one mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshOutcome {
    /// Rendered configuration matched the file on disk
    Unchanged,
    /// New configuration written; `started` is false for disabled hosts
    Applied { started: bool },
    /// Configuration unchanged but the tunnel was down and got started
    Healed,
    /// Mesh left alone because of an error
    Skipped(String),
    /// Mesh disappeared from the desired state and was torn down
    Removed,
}

/// Per-mesh outcomes of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The payload matched the persisted state byte for byte
    pub payload_unchanged: bool,
    pub meshes: Vec<(String, MeshOutcome)>,
}

impl ReconcileReport {
    fn unchanged_payload() -> Self {
        Self {
            payload_unchanged: true,
            meshes: Vec::new(),
        }
    }

    fn push(&mut self, mesh: &str, outcome: MeshOutcome) {
        self.meshes.push((mesh.to_string(), outcome));
    }

    /// Outcome for a mesh, if it was visited
    pub fn outcome(&self, mesh: &str) -> Option<&MeshOutcome> {
        self.meshes.iter().find(|(m, _)| m == mesh).map(|(_, o)| o)
    }

    /// Number of tunnels that were rewritten
    pub fn applied(&self) -> usize {
        self.meshes
            .iter()
            .filter(|(_, o)| matches!(o, MeshOutcome::Applied { .. }))
            .count()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload_unchanged {
            return write!(f, "no changes");
        }
        let parts: Vec<String> = self
            .meshes
            .iter()
            .map(|(mesh, outcome)| match outcome {
                MeshOutcome::Unchanged => format!("{}: unchanged", mesh),
                MeshOutcome::Applied { started: true } => format!("{}: applied", mesh),
                MeshOutcome::Applied { started: false } => format!("{}: applied (disabled)", mesh),
                MeshOutcome::Healed => format!("{}: healed", mesh),
                MeshOutcome::Skipped(reason) => format!("{}: skipped ({})", mesh, reason),
                MeshOutcome::Removed => format!("{}: removed", mesh),
            })
            .collect();
        if parts.is_empty() {
            write!(f, "no meshes")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Reconciliation engine
pub struct Reconciler {
    ctx: Arc<ConfigContext>,
    store: StateStore,
    keys: Arc<KeyStore>,
    dns: Arc<DnsHandle>,
    dns_server: Option<Arc<DnsServer>>,
    control: Arc<dyn ControlPlane>,
    tunnels: Arc<dyn TunnelController>,
    renderer: Arc<dyn TunnelRenderer>,
    ports: Arc<dyn PortMapper>,
    subnets: SubnetSource,
    lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Reconciler {
    /// Engine with the default renderer, no UPnP and live interface subnets
    pub fn new(
        ctx: Arc<ConfigContext>,
        keys: Arc<KeyStore>,
        control: Arc<dyn ControlPlane>,
        tunnels: Arc<dyn TunnelController>,
        cancel: CancellationToken,
    ) -> Self {
        let store = StateStore::from_config(ctx.config());
        Self {
            ctx,
            store,
            keys,
            dns: Arc::new(DnsHandle::new()),
            dns_server: None,
            control,
            tunnels,
            renderer: Arc::new(WgQuickRenderer),
            ports: Arc::new(DisabledPortMapper),
            subnets: local_subnets,
            lock: Mutex::new(()),
            cancel,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_dns(mut self, dns: Arc<DnsHandle>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_dns_server(mut self, server: Arc<DnsServer>) -> Self {
        self.dns_server = Some(server);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TunnelRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_port_mapper(mut self, ports: Arc<dyn PortMapper>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_subnet_source(mut self, subnets: SubnetSource) -> Self {
        self.subnets = subnets;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn dns(&self) -> &Arc<DnsHandle> {
        &self.dns
    }

    /// Apply a desired state fetched from the control server.
    ///
    /// A payload that does not decode is rejected before anything is
    /// persisted. A payload identical to the persisted one is a no-op.
    pub async fn apply_update(&self, body: &[u8]) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;

        let next = DesiredState::from_slice(body).map_err(|e| {
            error!("Discarding malformed desired state: {}", e);
            e
        })?;

        let previous_raw = match self.store.read_state().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot read persisted desired state: {}", e);
                None
            }
        };
        if previous_raw.as_deref() == Some(body) {
            debug!("Desired state unchanged");
            return Ok(ReconcileReport::unchanged_payload());
        }
        let previous = previous_raw
            .and_then(|raw| DesiredState::from_slice(&raw).ok())
            .unwrap_or_default();

        let identity = self.ctx.identity();
        let mut report = ReconcileReport::default();

        for mesh in previous.removed_meshes(&next) {
            match self.teardown(mesh, &identity.host_id).await {
                Ok(()) => report.push(&mesh.mesh_name, MeshOutcome::Removed),
                Err(e) => {
                    error!("Failed to remove mesh {}: {}", mesh.mesh_name, e);
                    report.push(&mesh.mesh_name, MeshOutcome::Skipped(e.to_string()));
                }
            }
        }

        self.store.persist_state(body).await?;
        info!(
            "Applying desired state {} ({} meshes)",
            fingerprint(body),
            next.config.len()
        );
        debug!("Desired state: {:?}", next.config.iter().map(|m| &m.mesh_name).collect::<Vec<_>>());

        self.apply_state(&next, &identity, false, &mut report).await;
        info!("Reconciliation complete: {}", report);
        Ok(report)
    }

    /// Re-run reconciliation against the persisted desired state.
    ///
    /// Unchanged meshes are not restarted; an enabled tunnel found down is
    /// started.
    pub async fn resync(&self) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;

        let Some(state) = self.store.load_state().await? else {
            debug!("No persisted desired state to resync");
            return Ok(ReconcileReport::default());
        };

        let identity = self.ctx.identity();
        let mut report = ReconcileReport::default();
        self.apply_state(&state, &identity, true, &mut report).await;
        Ok(report)
    }

    /// Forget the persisted desired state. Returns true if a file was removed.
    pub async fn clear_state(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.store.remove_state().await
    }

    /// Periodic resync until shutdown, starting immediately
    pub async fn run_resync_loop(&self, interval: Duration) {
        info!("Resync loop started, every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.resync().await {
                Ok(report) => info!("Resync complete: {}", report),
                Err(e) => error!("Resync failed: {}", e),
            }
        }
    }

    async fn apply_state(
        &self,
        state: &DesiredState,
        identity: &AgentIdentity,
        heal: bool,
        report: &mut ReconcileReport,
    ) {
        self.dns.rebuild(state, &identity.host_id);
        if let Some(server) = &self.dns_server {
            server.ensure_listeners(&dns::listen_addresses(state, &identity.host_id));
        }

        // Our own tunnel interfaces carry mesh routes; they are not local LANs
        let own_interfaces: Vec<String> = state.config.iter().map(|m| m.mesh_name.clone()).collect();
        let subnets = match (self.subnets)(&own_interfaces) {
            Ok(subnets) => subnets,
            Err(e) => {
                error!("Cannot enumerate local subnets, routes left unfiltered: {}", e);
                Vec::new()
            }
        };

        for mesh in &state.config {
            let outcome = match self.reconcile_mesh(mesh, identity, &subnets, heal).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Mesh {}: {}", mesh.mesh_name, e);
                    MeshOutcome::Skipped(e.to_string())
                }
            };
            report.push(&mesh.mesh_name, outcome);
        }
    }

    async fn reconcile_mesh(
        &self,
        mesh: &MeshConfig,
        identity: &AgentIdentity,
        subnets: &[IpNetwork],
        heal: bool,
    ) -> Result<MeshOutcome> {
        let name = validate_tunnel_name(&mesh.mesh_name)?;
        let MeshView {
            mut self_host,
            mut peers,
            ..
        } = mesh.split(&identity.host_id)?;

        for peer in &mut peers {
            filter_allowed_ips(peer, subnets);
        }

        self.resolve_keys(identity, &mut self_host).await?;

        let rendered = self.renderer.render(&self_host, &peers)?;
        let path = self.store.tunnel_path(name)?;

        let on_disk = match self.store.read_tunnel(name).await {
            Ok(data) => Some(data),
            Err(e) => {
                debug!("No readable tunnel file for {}, forcing update: {}", name, e);
                None
            }
        };

        let outcome = if on_disk.as_deref() == Some(rendered.as_slice()) {
            info!("Mesh {} unchanged", name);
            if heal && self_host.enable && !self.tunnel_is_up(name).await {
                warn!("Tunnel {} is down, starting it", name);
                self.tunnels.start(name, &path).await?;
                MeshOutcome::Healed
            } else {
                MeshOutcome::Unchanged
            }
        } else {
            if let Err(e) = self.tunnels.stop(name, &path).await {
                warn!("Stopping tunnel {}: {}", name, e);
            }
            self.store.write_tunnel(name, &rendered).await?;

            if self_host.enable {
                self.tunnels.start(name, &path).await?;
                info!("Mesh {} reloaded", name);
                MeshOutcome::Applied { started: true }
            } else {
                info!("Mesh {} is disabled, tunnel stopped", name);
                if let Err(e) = self.tunnels.stop(name, &path).await {
                    warn!("Stopping disabled tunnel {}: {}", name, e);
                }
                MeshOutcome::Applied { started: false }
            }
        };

        spawn_port_mapping(self.ports.clone(), &self_host, self.cancel.clone());
        Ok(outcome)
    }

    async fn tunnel_is_up(&self, name: &str) -> bool {
        match self.tunnels.is_up(name).await {
            Ok(up) => up,
            Err(e) => {
                warn!("Cannot probe tunnel {}: {}", name, e);
                true
            }
        }
    }

    /// Fill in the private key for the self host, rotating if none is known
    async fn resolve_keys(&self, identity: &AgentIdentity, self_host: &mut Host) -> Result<()> {
        let public_key = self_host.current.public_key.clone();

        let private_key = match self.keys.lookup(&public_key) {
            Some(key) => key,
            None => {
                self.keys.add(&public_key, &self_host.current.private_key);
                if let Err(e) = self.keys.save() {
                    error!("Failed to save key for host {}: {}", self_host.name, e);
                }
                self.keys.lookup(&public_key).unwrap_or_default()
            }
        };

        if private_key.is_empty() {
            self.rotate_key(identity, self_host).await;
        } else {
            self_host.current.private_key = private_key;
        }
        Ok(())
    }

    async fn rotate_key(&self, identity: &AgentIdentity, self_host: &mut Host) {
        self.keys.delete(&self_host.current.public_key);

        let pair = WgKeyPair::generate();
        self.keys.add(&pair.public_key, &pair.private_key);
        if let Err(e) = self.keys.save() {
            error!("Failed to save rotated key for host {}: {}", self_host.name, e);
        }

        self_host.current.public_key = pair.public_key.clone();
        self_host.current.private_key = pair.private_key;

        let mut update = self_host.clone();
        update.current.private_key.clear();
        match self.control.update_host(identity, &update).await {
            Ok(()) => info!(
                "Rotated key for host {} in mesh {}, new public key {}",
                self_host.name, self_host.mesh_name, pair.public_key
            ),
            Err(e) => warn!(
                "Rotated key for host {} but the server was not updated: {}",
                self_host.name, e
            ),
        }
    }

    async fn teardown(&self, mesh: &MeshConfig, host_id: &str) -> Result<()> {
        let name = validate_tunnel_name(&mesh.mesh_name)?;
        let path = self.store.tunnel_path(name)?;

        info!("Mesh {} removed from desired state, tearing down", name);
        if let Err(e) = self.tunnels.stop(name, &path).await {
            warn!("Stopping tunnel {}: {}", name, e);
        }
        self.store.remove_tunnel(name).await?;

        if let Some(me) = mesh.self_host(host_id) {
            if self.keys.delete(&me.current.public_key) {
                if let Err(e) = self.keys.save() {
                    error!("Failed to save key store after removing {}: {}", name, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::control::FetchOutcome;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        calls: SyncMutex<Vec<String>>,
        up: SyncMutex<Vec<String>>,
        patches: SyncMutex<Vec<Host>>,
    }

    #[async_trait]
    impl TunnelController for Recorder {
        async fn start(&self, mesh: &str, _config_path: &Path) -> Result<()> {
            self.calls.lock().push(format!("start {}", mesh));
            self.up.lock().push(mesh.to_string());
            Ok(())
        }

        async fn stop(&self, mesh: &str, _config_path: &Path) -> Result<()> {
            self.calls.lock().push(format!("stop {}", mesh));
            self.up.lock().retain(|m| m != mesh);
            Ok(())
        }

        async fn is_up(&self, mesh: &str) -> Result<bool> {
            Ok(self.up.lock().iter().any(|m| m == mesh))
        }
    }

    #[async_trait]
    impl ControlPlane for Recorder {
        async fn fetch_state(&self, _: &AgentIdentity, _: Option<&str>) -> Result<FetchOutcome> {
            Ok(FetchOutcome::NotModified)
        }

        async fn update_host(&self, _: &AgentIdentity, host: &Host) -> Result<()> {
            self.patches.lock().push(host.clone());
            Ok(())
        }
    }

    fn no_subnets(_: &[String]) -> Result<Vec<IpNetwork>> {
        Ok(vec!["192.168.1.0/24".parse().unwrap()])
    }

    fn setup(dir: &TempDir) -> (Reconciler, Arc<Recorder>) {
        let config = AgentConfig {
            host_id: "local".to_string(),
            data_dir: dir.path().join("data"),
            tunnel_dir: dir.path().join("wg"),
            ..Default::default()
        };
        let ctx = Arc::new(ConfigContext::new(config.clone(), config.config_path()));
        let keys = Arc::new(KeyStore::new(config.keys_path()));
        let recorder = Arc::new(Recorder::default());
        let reconciler = Reconciler::new(
            ctx,
            keys,
            recorder.clone(),
            recorder.clone(),
            CancellationToken::new(),
        )
        .with_subnet_source(no_subnets);
        (reconciler, recorder)
    }

    fn state_json(meshes: &[(&str, bool)], private_key: &str) -> Vec<u8> {
        let config: Vec<serde_json::Value> = meshes
            .iter()
            .map(|(name, enable)| {
                serde_json::json!({
                    "meshName": name,
                    "hosts": [
                        {
                            "id": format!("{}-me", name), "hostGroup": "local", "name": "me",
                            "apiKey": "k1", "meshName": name, "enable": enable,
                            "current": {
                                "address": ["10.0.0.1/24"], "publicKey": format!("PUB-{}", name),
                                "privateKey": private_key, "listenPort": 51820
                            }
                        },
                        {
                            "id": format!("{}-peer", name), "hostGroup": "other", "name": "peer",
                            "enable": true,
                            "current": {
                                "address": ["10.0.0.2/24"], "publicKey": "PUB-PEER",
                                "allowedIPs": ["10.0.0.2/32", "192.168.1.0/24"],
                                "endpoint": "203.0.113.9:51820"
                            }
                        }
                    ]
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({ "id": "s", "config": config })).unwrap()
    }

    #[tokio::test]
    async fn test_apply_then_identical_payload_is_noop() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);
        let body = state_json(&[("office", true)], "PRIV");

        let report = reconciler.apply_update(&body).await.unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
        assert_eq!(*recorder.calls.lock(), vec!["stop office", "start office"]);

        let text = std::fs::read_to_string(dir.path().join("wg/office.conf")).unwrap();
        assert!(text.contains("PrivateKey = PRIV"));
        assert!(text.contains("AllowedIPs = 10.0.0.2/32\n"));
        assert!(!text.contains("192.168.1.0/24"));

        let again = reconciler.apply_update(&body).await.unwrap();
        assert!(again.payload_unchanged);
        assert_eq!(recorder.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent_and_heals() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);
        reconciler
            .apply_update(&state_json(&[("office", true)], "PRIV"))
            .await
            .unwrap();

        let report = reconciler.resync().await.unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Unchanged));
        assert_eq!(report.applied(), 0);
        assert_eq!(recorder.calls.lock().len(), 2);

        // Killed out of band
        recorder.up.lock().clear();
        let report = reconciler.resync().await.unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Healed));
        assert_eq!(recorder.calls.lock().last().unwrap(), "start office");
        assert!(!recorder.calls.lock()[2..].iter().any(|c| c.starts_with("stop")));
    }

    #[tokio::test]
    async fn test_malformed_payload_not_persisted() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);

        assert!(reconciler.apply_update(b"{\"config\": [").await.is_err());
        assert!(reconciler.store().read_state().await.unwrap().is_none());
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_host_is_stopped_not_started() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);

        let report = reconciler
            .apply_update(&state_json(&[("office", false)], "PRIV"))
            .await
            .unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: false }));
        assert_eq!(*recorder.calls.lock(), vec!["stop office", "stop office"]);
    }

    #[tokio::test]
    async fn test_missing_self_host_skips_only_that_mesh() {
        let dir = TempDir::new().unwrap();
        let (reconciler, _recorder) = setup(&dir);

        let mut state: DesiredState =
            serde_json::from_slice(&state_json(&[("office", true), ("lab", true)], "PRIV")).unwrap();
        state.config[1].hosts.remove(0);
        let body = serde_json::to_vec(&state).unwrap();

        let report = reconciler.apply_update(&body).await.unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
        assert!(matches!(report.outcome("lab"), Some(MeshOutcome::Skipped(_))));
    }

    #[tokio::test]
    async fn test_invalid_mesh_name_skipped() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);

        let report = reconciler
            .apply_update(&state_json(&[("../evil", true)], "PRIV"))
            .await
            .unwrap();
        assert!(matches!(report.outcome("../evil"), Some(MeshOutcome::Skipped(_))));
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_key_rotation_on_blank_private_key() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);

        reconciler
            .apply_update(&state_json(&[("office", true)], ""))
            .await
            .unwrap();

        let patches = recorder.patches.lock().clone();
        assert_eq!(patches.len(), 1);
        let sent = &patches[0];
        assert!(sent.current.private_key.is_empty());
        assert_ne!(sent.current.public_key, "PUB-office");

        let keys = reconciler.keys();
        assert!(keys.lookup("PUB-office").is_none());
        let private = keys.lookup(&sent.current.public_key).unwrap();
        assert_eq!(
            WgKeyPair::from_private_key(&private).unwrap().public_key,
            sent.current.public_key
        );

        let text = std::fs::read_to_string(dir.path().join("wg/office.conf")).unwrap();
        assert!(text.contains(&format!("PrivateKey = {}", private)));
    }

    #[tokio::test]
    async fn test_known_key_reused() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);
        reconciler.keys().add("PUB-office", "STORED");

        reconciler
            .apply_update(&state_json(&[("office", true)], ""))
            .await
            .unwrap();
        assert!(recorder.patches.lock().is_empty());
        let text = std::fs::read_to_string(dir.path().join("wg/office.conf")).unwrap();
        assert!(text.contains("PrivateKey = STORED"));
    }

    #[tokio::test]
    async fn test_mesh_deletion() {
        let dir = TempDir::new().unwrap();
        let (reconciler, recorder) = setup(&dir);
        reconciler
            .apply_update(&state_json(&[("office", true), ("lab", true)], "PRIV"))
            .await
            .unwrap();
        assert!(reconciler.keys().lookup("PUB-lab").is_some());

        let report = reconciler
            .apply_update(&state_json(&[("office", true)], "PRIV"))
            .await
            .unwrap();

        assert_eq!(report.meshes[0], ("lab".to_string(), MeshOutcome::Removed));
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Unchanged));
        assert!(!dir.path().join("wg/lab.conf").exists());
        assert!(reconciler.keys().lookup("PUB-lab").is_none());
        assert!(recorder.calls.lock().contains(&"stop lab".to_string()));
        assert!(reconciler.dns().table().lookup("me").is_some());
    }

    #[tokio::test]
    async fn test_dns_rebuilt_from_state() {
        let dir = TempDir::new().unwrap();
        let (reconciler, _) = setup(&dir);
        reconciler
            .apply_update(&state_json(&[("office", true)], "PRIV"))
            .await
            .unwrap();

        let table = reconciler.dns().table();
        assert_eq!(table.lookup("peer").unwrap(), ["10.0.0.2/24"]);
        assert!(reconciler.dns().servers().contains("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_failed_key_save_keeps_server_key() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            host_id: "local".to_string(),
            data_dir: dir.path().join("data"),
            tunnel_dir: dir.path().join("wg"),
            ..Default::default()
        };
        // A directory where the key file should be makes every save fail
        let keys_path = dir.path().join("keys-as-dir");
        std::fs::create_dir_all(&keys_path).unwrap();
        let keys = Arc::new(KeyStore::new(&keys_path));
        assert!(keys.save().is_err());

        let recorder = Arc::new(Recorder::default());
        let reconciler = Reconciler::new(
            Arc::new(ConfigContext::new(config.clone(), config.config_path())),
            keys,
            recorder.clone(),
            recorder.clone(),
            CancellationToken::new(),
        )
        .with_subnet_source(no_subnets);

        let report = reconciler
            .apply_update(&state_json(&[("office", true)], "PRIV"))
            .await
            .unwrap();
        assert_eq!(report.outcome("office"), Some(&MeshOutcome::Applied { started: true }));
        assert!(recorder.patches.lock().is_empty(), "no rotation expected");
        assert_eq!(reconciler.keys().lookup("PUB-office").as_deref(), Some("PRIV"));

        let text = std::fs::read_to_string(dir.path().join("wg/office.conf")).unwrap();
        assert!(text.contains("PrivateKey = PRIV"));
    }

    /// Tunnel controller whose calls take a while and which tracks overlap
    #[derive(Default)]
    struct SlowTunnels {
        active: std::sync::atomic::AtomicUsize,
        max_active: std::sync::atomic::AtomicUsize,
        up: SyncMutex<Vec<String>>,
    }

    impl SlowTunnels {
        async fn step(&self) {
            use std::sync::atomic::Ordering::SeqCst;
            let now = self.active.fetch_add(1, SeqCst) + 1;
            self.max_active.fetch_max(now, SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, SeqCst);
        }
    }

    #[async_trait]
    impl TunnelController for SlowTunnels {
        async fn start(&self, mesh: &str, _config_path: &Path) -> Result<()> {
            self.step().await;
            self.up.lock().push(mesh.to_string());
            Ok(())
        }

        async fn stop(&self, mesh: &str, _config_path: &Path) -> Result<()> {
            self.step().await;
            self.up.lock().retain(|m| m != mesh);
            Ok(())
        }

        async fn is_up(&self, mesh: &str) -> Result<bool> {
            Ok(self.up.lock().iter().any(|m| m == mesh))
        }
    }

    #[tokio::test]
    async fn test_update_and_resync_never_interleave() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig {
            host_id: "local".to_string(),
            data_dir: dir.path().join("data"),
            tunnel_dir: dir.path().join("wg"),
            ..Default::default()
        };
        let tunnels = Arc::new(SlowTunnels::default());
        let reconciler = Reconciler::new(
            Arc::new(ConfigContext::new(config.clone(), config.config_path())),
            Arc::new(KeyStore::new(config.keys_path())),
            Arc::new(Recorder::default()),
            tunnels.clone(),
            CancellationToken::new(),
        )
        .with_subnet_source(no_subnets);

        reconciler
            .apply_update(&state_json(&[("office", true), ("lab", true)], "PRIV"))
            .await
            .unwrap();
        // Both tunnels down, so a resync has starts to issue
        tunnels.up.lock().clear();

        let next_state = state_json(&[("office", false), ("lab", false)], "PRIV");
        let (update, resync) = tokio::join!(
            reconciler.apply_update(&next_state),
            reconciler.resync(),
        );
        update.unwrap();
        resync.unwrap();

        assert_eq!(
            tunnels.max_active.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "tunnel operations overlapped"
        );
    }

    #[tokio::test]
    async fn test_resync_without_state() {
        let dir = TempDir::new().unwrap();
        let (reconciler, _) = setup(&dir);
        assert_eq!(reconciler.resync().await.unwrap(), ReconcileReport::default());
    }
}
