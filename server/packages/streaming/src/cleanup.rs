//! Periodic best-effort sweeps, independent of any single job or
//! connection. Each sweep is defense in depth: the entities it reclaims
//! should normally have been cleaned up by their own timers.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::broker::JobBroker;
use crate::registry::ConnectionRegistry;

const DEFAULT_CONNECTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CONNECTION_HARD_CEILING: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_STUCK_JOB_CEILING: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_RATE_SWEEP_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub connection_sweep_interval: Duration,
    pub connection_hard_ceiling: Duration,
    pub job_sweep_interval: Duration,
    pub stuck_job_ceiling: Duration,
    pub rate_sweep_interval: Duration,
    pub rate_sweep_grace: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            connection_sweep_interval: DEFAULT_CONNECTION_SWEEP_INTERVAL,
            connection_hard_ceiling: DEFAULT_CONNECTION_HARD_CEILING,
            job_sweep_interval: DEFAULT_JOB_SWEEP_INTERVAL,
            stuck_job_ceiling: DEFAULT_STUCK_JOB_CEILING,
            rate_sweep_interval: DEFAULT_RATE_SWEEP_INTERVAL,
            rate_sweep_grace: DEFAULT_RATE_SWEEP_GRACE,
        }
    }
}

pub struct CleanupScheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Spawn the three sweep loops. Each iteration is independent: nothing a
    /// sweep encounters stops the next scheduled run.
    pub fn start(config: CleanupConfig, registry: ConnectionRegistry, broker: JobBroker) -> Self {
        let connection_sweep = {
            let registry = registry.clone();
            let interval = config.connection_sweep_interval;
            let ceiling = config.connection_hard_ceiling;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let evicted = registry.sweep_inactive(ceiling).await;
                    if evicted > 0 {
                        tracing::info!(evicted = evicted, "connection sweep evicted stale connections");
                    }
                }
            })
        };

        let job_sweep = {
            let broker = broker.clone();
            let interval = config.job_sweep_interval;
            let ceiling = config.stuck_job_ceiling;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = broker.sweep_stale(ceiling).await;
                    if removed > 0 {
                        tracing::info!(removed = removed, "job sweep reclaimed stuck jobs");
                    }
                }
            })
        };

        let rate_sweep = {
            let registry = registry.clone();
            let interval = config.rate_sweep_interval;
            let grace = config.rate_sweep_grace;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let removed = registry.admission_limiter().sweep(grace)
                        + registry.event_limiter().sweep(grace);
                    if removed > 0 {
                        tracing::debug!(removed = removed, "rate limiter sweep evicted expired windows");
                    }
                }
            })
        };

        Self {
            tasks: Mutex::new(vec![connection_sweep, job_sweep, rate_sweep]),
        }
    }

    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
