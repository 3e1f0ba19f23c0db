//! UPnP port forwarding for the local listen port
//!
//! Best effort only. Jobs are detached, retried a bounded number of times and
//! log under their own target.

use async_trait::async_trait;
use meshagent_common::{Host, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts per mapping job
pub const UPNP_ATTEMPTS: u32 = 3;

/// Delay between attempts
pub const UPNP_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Gateway port mapping
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// False if this mapper never maps anything
    fn is_enabled(&self) -> bool {
        true
    }

    /// Replace any mapping of `port` with one pointing at this node
    async fn forward(&self, port: u16, description: &str) -> Result<()>;
}

/// Mapper used when no gateway support is available
#[derive(Debug, Clone, Default)]
pub struct DisabledPortMapper;

#[async_trait]
impl PortMapper for DisabledPortMapper {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn forward(&self, port: u16, _description: &str) -> Result<()> {
        debug!(target: "meshagent::upnp", "UPnP unavailable, not forwarding port {}", port);
        Ok(())
    }
}

/// Spawn a detached mapping job for the self host of a mesh.
///
/// Returns `None` when the host does not ask for UPnP, has no listen port or
/// the mapper is disabled.
pub fn spawn_port_mapping(
    mapper: Arc<dyn PortMapper>,
    host: &Host,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !host.current.upnp || host.current.listen_port == 0 {
        return None;
    }
    if !mapper.is_enabled() {
        info!(target: "meshagent::upnp", "UPnP requested for {} but no gateway support", host.name);
        return None;
    }

    let port = host.current.listen_port;
    let description = format!("{} {}", host.name, host.mesh_name);

    Some(tokio::spawn(async move {
        for attempt in 1..=UPNP_ATTEMPTS {
            match mapper.forward(port, &description).await {
                Ok(()) => {
                    info!(target: "meshagent::upnp", "Forwarded port {} ({})", port, description);
                    return;
                }
                Err(e) => {
                    warn!(
                        target: "meshagent::upnp",
                        "Port {} mapping attempt {}/{} failed: {}", port, attempt, UPNP_ATTEMPTS, e
                    );
                }
            }
            if attempt < UPNP_ATTEMPTS {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(UPNP_RETRY_DELAY) => {}
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshagent_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl PortMapper for Flaky {
        async fn forward(&self, _port: u16, _description: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::Internal("no gateway".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn host(upnp: bool, port: u16) -> Host {
        let mut h = Host {
            name: "me".to_string(),
            mesh_name: "office".to_string(),
            ..Default::default()
        };
        h.current.upnp = upnp;
        h.current.listen_port = port;
        h
    }

    #[tokio::test]
    async fn test_not_requested() {
        let mapper = Arc::new(Flaky::default());
        assert!(spawn_port_mapping(mapper.clone(), &host(false, 51820), CancellationToken::new()).is_none());
        assert!(spawn_port_mapping(mapper.clone(), &host(true, 0), CancellationToken::new()).is_none());
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_mapper_skips() {
        let mapper = Arc::new(DisabledPortMapper);
        assert!(spawn_port_mapping(mapper, &host(true, 51820), CancellationToken::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries() {
        let mapper = Arc::new(Flaky {
            fail_first: 10,
            ..Default::default()
        });
        spawn_port_mapping(mapper.clone(), &host(true, 51820), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(mapper.calls.load(Ordering::SeqCst), UPNP_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retry() {
        let mapper = Arc::new(Flaky {
            fail_first: 1,
            ..Default::default()
        });
        spawn_port_mapping(mapper.clone(), &host(true, 51820), CancellationToken::new())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(mapper.calls.load(Ordering::SeqCst), 2);
    }
}
