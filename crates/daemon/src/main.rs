//! meshagent daemon
//!
//! Follows the control server's desired state for this node: keeps WireGuard
//! tunnels in line with it and serves the mesh's names over DNS.

use clap::Parser;
use meshagent_common::{DnsHandle, KeyStore};
use meshagent_daemon::dns::{DnsServer, QueryReporter};
use meshagent_daemon::{
    AgentConfig, ConfigContext, ControlPlane, HttpControlPlane, IdentityOverrides, Poller,
    Reconciler, Supervisor, WgQuick,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

#[derive(Parser)]
#[command(name = "meshagentd")]
#[command(about = "meshagent daemon - WireGuard mesh fleet agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESHAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Control server URL
    #[arg(long, env = "MESHAGENT_SERVER")]
    server: Option<String>,

    /// Host group of this node
    #[arg(long, env = "MESHAGENT_HOST_ID")]
    host_id: Option<String>,

    /// API key for the control server
    #[arg(long, env = "MESHAGENT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn log_filter(debug: bool, quiet: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the subscriber; the returned handle lets the config file adjust
/// the level once it has been read
fn init_logging(debug: bool, quiet: bool) -> FilterHandle {
    let (filter, handle) = reload::Layer::new(log_filter(debug, quiet));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    handle
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot watch SIGTERM: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_handle = init_logging(cli.debug, cli.quiet);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AgentConfig::default().config_path());
    let overrides = IdentityOverrides {
        server_url: cli.server.clone(),
        host_id: cli.host_id.clone(),
        api_key: cli.api_key.clone(),
    };
    let ctx = Arc::new(ConfigContext::load(&config_path, overrides)?);
    let config = ctx.config().clone();

    if (config.debug && !cli.debug) || (config.quiet && !cli.quiet) {
        let filter = log_filter(cli.debug || config.debug, cli.quiet || config.quiet);
        if let Err(e) = log_handle.reload(filter) {
            warn!("Cannot apply log level from {:?}: {}", config_path, e);
        }
    }
    info!("meshagent daemon v{}", meshagent_common::VERSION);
    info!(
        "Host group {} polling {}",
        config.host_id,
        ctx.identity().server_url
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let keys = match KeyStore::open(config.keys_path()) {
        Ok(keys) => keys,
        Err(e) => {
            error!("Key store {:?} unreadable, starting empty: {}", config.keys_path(), e);
            KeyStore::new(config.keys_path())
        }
    };
    info!("Loaded {} keys", keys.len());

    let cancel = CancellationToken::new();

    let dns = Arc::new(DnsHandle::new());
    let (reporter, reporter_task) = QueryReporter::spawn(config.report_group()?, cancel.clone());
    let dns_server = Arc::new(DnsServer::new(
        dns.clone(),
        config.dns_port,
        Some(reporter),
        cancel.clone(),
    ));

    let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(&config)?);
    let reconciler = Arc::new(
        Reconciler::new(
            ctx.clone(),
            Arc::new(keys),
            control.clone(),
            Arc::new(WgQuick::default()),
            cancel.clone(),
        )
        .with_dns(dns)
        .with_dns_server(dns_server.clone()),
    );
    let poller = Arc::new(Poller::new(ctx.clone(), control, reconciler.clone(), cancel.clone()));

    let supervisor = Supervisor::new(cancel.clone());

    let check_interval = config.check_interval();
    let poll_handle = supervisor.spawn("poller", move || {
        let poller = poller.clone();
        async move { poller.run(check_interval).await }
    });

    let resync_interval = config.resync_interval();
    let resync_handle = supervisor.spawn("resync", move || {
        let reconciler = reconciler.clone();
        async move { reconciler.run_resync_loop(resync_interval).await }
    });

    info!("Agent started");

    shutdown_signal().await;
    info!("Received shutdown signal");
    cancel.cancel();

    for (name, handle) in [("poller", poll_handle), ("resync", resync_handle)] {
        if let Err(e) = handle.await {
            error!("Task {} did not stop cleanly: {}", name, e);
        }
    }
    if let Err(e) = reporter_task.await {
        error!("Query reporter did not stop cleanly: {}", e);
    }
    dns_server.shutdown();

    for (name, health) in supervisor.health().snapshot() {
        info!("Task {}: {:?}", name, health);
    }
    info!("Agent shutdown complete");
    Ok(())
}
