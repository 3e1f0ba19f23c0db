//! Agent under test, wired to the fake control server

use crate::control_server::FakeControlServer;
use crate::error::E2eResult;
use crate::fixtures::{LOCAL_API_KEY, LOCAL_GROUP};
use crate::tunnel::RecordingTunnels;
use ipnetwork::IpNetwork;
use meshagent_common::{DnsHandle, KeyStore};
use meshagent_daemon::dns::DnsServer;
use meshagent_daemon::{
    AgentConfig, ConfigContext, HttpControlPlane, PollOutcome, Poller, Reconciler,
};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// LAN the harness pretends to sit on
pub const LAN_SUBNET: &str = "192.168.77.0/24";

fn lan_subnets(_exclude: &[String]) -> meshagent_common::Result<Vec<IpNetwork>> {
    Ok(vec![LAN_SUBNET.parse::<IpNetwork>()?])
}

/// Route harness logs through the test writer once per process
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A full agent minus real tunnels
pub struct Harness {
    pub dir: TempDir,
    pub server: FakeControlServer,
    pub tunnels: Arc<RecordingTunnels>,
    pub ctx: Arc<ConfigContext>,
    pub dns: Arc<DnsHandle>,
    pub dns_server: Arc<DnsServer>,
    pub reconciler: Arc<Reconciler>,
    pub poller: Poller,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn start() -> E2eResult<Self> {
        init_tracing();

        let dir = TempDir::new()?;
        let server = FakeControlServer::start().await?;
        server.accept_keys(&[LOCAL_API_KEY]);

        let config = AgentConfig {
            server_url: server.base_url().to_string(),
            host_id: LOCAL_GROUP.to_string(),
            api_key: LOCAL_API_KEY.to_string(),
            data_dir: dir.path().join("data"),
            tunnel_dir: dir.path().join("wireguard"),
            dns_port: 0,
            ..Default::default()
        };
        config.save(&config.config_path())?;
        let ctx = Arc::new(ConfigContext::new(config.clone(), config.config_path()));

        let cancel = CancellationToken::new();
        let tunnels = Arc::new(RecordingTunnels::new());
        let control = Arc::new(HttpControlPlane::new(&config)?);
        let keys = Arc::new(KeyStore::open(config.keys_path())?);
        let dns = Arc::new(DnsHandle::new());
        let dns_server = Arc::new(DnsServer::new(dns.clone(), 0, None, cancel.clone()));

        let reconciler = Arc::new(
            Reconciler::new(ctx.clone(), keys, control.clone(), tunnels.clone(), cancel.clone())
                .with_dns(dns.clone())
                .with_dns_server(dns_server.clone())
                .with_subnet_source(lan_subnets),
        );
        let poller = Poller::new(ctx.clone(), control, reconciler.clone(), cancel.clone())
            .with_backoff(Duration::from_millis(10));

        Ok(Self {
            dir,
            server,
            tunnels,
            ctx,
            dns,
            dns_server,
            reconciler,
            poller,
            cancel,
        })
    }

    /// Publish a desired state on the server and run one poll
    pub async fn push(&self, body: &[u8]) -> PollOutcome {
        self.server.set_state(body);
        self.poller.poll_once().await
    }

    pub fn tunnel_path(&self, mesh: &str) -> PathBuf {
        self.dir.path().join("wireguard").join(format!("{}.conf", mesh))
    }

    /// Contents of a rendered tunnel file, if present
    pub fn tunnel_file(&self, mesh: &str) -> Option<String> {
        std::fs::read_to_string(self.tunnel_path(mesh)).ok()
    }

    pub fn state_path(&self) -> PathBuf {
        self.ctx.config().state_path()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.dns_server.shutdown();
    }
}
