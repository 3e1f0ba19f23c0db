//! Task supervision
//!
//! Long-running loops are respawned with exponential backoff whenever they
//! panic or return before shutdown.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Health of a supervised task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskHealth {
    Running,
    Restarting { failures: u32 },
    Stopped,
}

/// Shared view of every supervised task
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    tasks: Arc<RwLock<BTreeMap<String, TaskHealth>>>,
}

impl HealthRegistry {
    pub fn get(&self, name: &str) -> Option<TaskHealth> {
        self.tasks.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TaskHealth> {
        self.tasks.read().clone()
    }

    fn set(&self, name: &str, health: TaskHealth) {
        self.tasks.write().insert(name.to_string(), health);
    }
}

/// Respawns tasks until shutdown
#[derive(Debug, Clone)]
pub struct Supervisor {
    health: HealthRegistry,
    cancel: CancellationToken,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            health: HealthRegistry::default(),
            cancel,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    pub fn health(&self) -> HealthRegistry {
        self.health.clone()
    }

    /// Run `factory()` under supervision.
    ///
    /// The factory is called again for every restart. A run that lasted longer
    /// than the maximum backoff resets the backoff.
    pub fn spawn<F, Fut>(&self, name: &str, factory: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        let health = self.health.clone();
        let cancel = self.cancel.clone();
        let (min_backoff, max_backoff) = (self.min_backoff, self.max_backoff);

        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut backoff = min_backoff;

            loop {
                health.set(&name, TaskHealth::Running);
                let started = Instant::now();
                let mut task = tokio::spawn(factory());

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        task.abort();
                        break;
                    }
                    result = &mut task => result,
                };
                if cancel.is_cancelled() {
                    break;
                }

                if started.elapsed() > max_backoff {
                    backoff = min_backoff;
                }
                failures += 1;
                match result {
                    Err(e) if e.is_panic() => error!("Task {} panicked, restarting in {:?}", name, backoff),
                    _ => warn!("Task {} exited, restarting in {:?}", name, backoff),
                }
                health.set(&name, TaskHealth::Restarting { failures });

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }

            debug!("Task {} stopped", name);
            health.set(&name, TaskHealth::Stopped);
        })
    }
}
