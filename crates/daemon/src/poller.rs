//! Control server polling
//!
//! A ticker hands out one poll slot per interval and waits for the poll loop
//! to finish its cycle before scheduling the next. The loop takes a slot, does
//! a conditional GET and feeds changes to the reconciler.

use crate::config::{AgentIdentity, ConfigContext};
use crate::control::{ControlPlane, FetchOutcome};
use crate::reconciler::{ReconcileReport, Reconciler};
use meshagent_common::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed poll
pub const POLL_BACKOFF: Duration = Duration::from_secs(10);

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 304
    NotModified,
    /// 200 handed to the reconciler
    Applied(ReconcileReport),
    /// 200 with a body that did not decode
    Discarded,
    /// 401 and another key from the persisted state was adopted
    KeySwitched,
    /// 401 and the single-mesh persisted state was dropped for a reload
    StateCleared,
    /// 401 with no way to recover
    Unauthorized,
    /// Transport error, unexpected status or failed reconciliation
    Failed,
}

impl PollOutcome {
    /// True if the loop should pause before the next poll
    pub fn needs_backoff(&self) -> bool {
        matches!(self, PollOutcome::Failed | PollOutcome::Unauthorized)
    }
}

/// Conditional GET poller
pub struct Poller {
    ctx: Arc<ConfigContext>,
    control: Arc<dyn ControlPlane>,
    reconciler: Arc<Reconciler>,
    etag: Mutex<Option<String>>,
    backoff: Duration,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(
        ctx: Arc<ConfigContext>,
        control: Arc<dyn ControlPlane>,
        reconciler: Arc<Reconciler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            control,
            reconciler,
            etag: Mutex::new(None),
            backoff: POLL_BACKOFF,
            cancel,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cached ETag
    pub fn etag(&self) -> Option<String> {
        self.etag.lock().clone()
    }

    /// One poll cycle
    pub async fn poll_once(&self) -> PollOutcome {
        if let Err(e) = self.ctx.reload_if_stale() {
            warn!("Configuration reload failed, keeping current identity: {}", e);
        }
        let identity = self.ctx.identity();
        let etag = self.etag();

        let fetched = self.control.fetch_state(&identity, etag.as_deref()).await;
        match fetched {
            Ok(FetchOutcome::NotModified) => {
                debug!("Desired state not modified");
                PollOutcome::NotModified
            }
            Ok(FetchOutcome::Updated { body, etag }) => {
                *self.etag.lock() = etag;
                match self.reconciler.apply_update(&body).await {
                    Ok(report) => PollOutcome::Applied(report),
                    Err(Error::Serialization(_)) => PollOutcome::Discarded,
                    Err(e) => {
                        error!("Applying desired state failed: {}", e);
                        // Fetch the full state again next time
                        *self.etag.lock() = None;
                        PollOutcome::Failed
                    }
                }
            }
            Ok(FetchOutcome::Unauthorized) => self.recover_unauthorized(&identity).await,
            Ok(FetchOutcome::Unexpected(status)) => {
                warn!("Control server returned {}", status);
                PollOutcome::Failed
            }
            Err(e) => {
                warn!("Polling {} failed: {}", identity.server_url, e);
                PollOutcome::Failed
            }
        }
    }

    /// 401 handling: adopt another key of this host group from the persisted
    /// state, or drop a single-mesh state so identity is reloaded
    async fn recover_unauthorized(&self, identity: &AgentIdentity) -> PollOutcome {
        *self.etag.lock() = None;

        let state = match self.reconciler.store().load_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Cannot read persisted state during key recovery: {}", e);
                None
            }
        };
        let Some(state) = state else {
            warn!("API key rejected for host group {}", identity.host_id);
            return PollOutcome::Unauthorized;
        };

        let replacement = state
            .hosts_in_group(&identity.host_id)
            .find(|h| !h.api_key.is_empty() && h.api_key != identity.api_key);
        if let Some(host) = replacement {
            info!("API key rejected, switching to the key of host {}", host.name);
            self.ctx.switch_api_key(&host.api_key);
            return PollOutcome::KeySwitched;
        }

        if state.config.len() == 1 {
            match self.reconciler.clear_state().await {
                Ok(_) => {
                    info!("API key rejected, cleared persisted state for reload");
                    self.ctx.mark_stale();
                    return PollOutcome::StateCleared;
                }
                Err(e) => error!("Failed to clear persisted state: {}", e),
            }
        }

        warn!("API key rejected for host group {}", identity.host_id);
        PollOutcome::Unauthorized
    }

    /// Poll until shutdown, one cycle per interval
    pub async fn run(&self, interval: Duration) {
        info!("Polling {} every {:?}", self.ctx.identity().server_url, interval);
        let (tx, mut rx) = mpsc::channel(1);
        let ticker = tokio::spawn(run_ticker(interval, tx, self.cancel.clone()));

        loop {
            let done = tokio::select! {
                _ = self.cancel.cancelled() => break,
                tick = rx.recv() => match tick {
                    Some(done) => done,
                    None => break,
                },
            };

            let outcome = self.poll_once().await;
            if outcome.needs_backoff() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
            let _ = done.send(());
        }

        ticker.abort();
    }
}

/// Handed to the poll loop with each tick; the loop answers when its cycle,
/// backoff included, has finished
pub type Tick = oneshot::Sender<()>;

/// Hand out one tick per `interval`, never more than one in flight.
///
/// The next tick is only scheduled once the previous cycle reports back, so a
/// slow cycle delays the next poll instead of queueing extra ones.
pub async fn run_ticker(interval: Duration, tx: mpsc::Sender<Tick>, cancel: CancellationToken) {
    let mut next_due = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(next_due) => {}
        }

        let (done_tx, done_rx) = oneshot::channel();
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(done_tx) => if sent.is_err() { break },
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            // A dropped sender also ends the cycle
            _ = done_rx => {}
        }

        next_due += interval;
        let now = Instant::now();
        if next_due < now {
            next_due = now + interval;
        }
    }
}
