//! Supervisor: restarts failed tasks and reports a health snapshot
//! (spec.md §4.8), generalizing the indexer's per-instance restart loop
//! into a reusable `JoinSet`-backed wrapper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const RESTART_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const RESTART_MAX_BACKOFF: Duration = Duration::from_secs(5);

type TaskFactory = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskHealth {
    pub name: String,
    pub restarts: u64,
    pub last_error: Option<String>,
    pub last_restart_at: Option<Instant>,
}

/// Per-chain liveness and throughput counters (spec.md §4.8): `healthy`'s
/// criterion differs by chain kind — a subscription chain needs at least
/// one active subscription plus a recent liveness tick, a polling chain
/// only needs its last successful poll within the staleness bound — but
/// both report through this one shape.
#[derive(Debug, Clone, Default)]
pub struct ChainHealth {
    pub healthy: bool,
    pub active_subscriptions: u32,
    pub events_processed: u64,
    pub events_skipped: u64,
    pub processing_errors: u64,
    pub reconnections: u64,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub last_health_check_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub tasks: Vec<TaskHealth>,
    pub chains: HashMap<u64, ChainHealth>,
}

#[derive(Default)]
struct ChainHealthEntry {
    health: ChainHealth,
    subscription_based: bool,
    staleness_bound: Duration,
}

/// Per-chain counters feeding [`HealthSnapshot::chains`], kept separately
/// from [`crate::Telemetry`]'s `opentelemetry` counters: this is read back
/// synchronously by [`Supervisor::health_snapshot`], which a push-oriented
/// `opentelemetry::Counter` doesn't support. `subscriber`/`polling` record
/// into this as events flow; [`ChainHealthRegistry::snapshot`] computes
/// `healthy` at read time so the "within the staleness bound" check always
/// uses the current time.
#[derive(Clone)]
pub struct ChainHealthRegistry {
    chains: Arc<Mutex<HashMap<u64, ChainHealthEntry>>>,
}

impl ChainHealthRegistry {
    pub fn new() -> Self {
        Self {
            chains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Must be called once per chain before any `record_*` call, so
    /// `snapshot()` knows which `healthy` criterion to apply and how stale
    /// is too stale for this chain.
    pub fn register_chain(&self, chain_id: u64, subscription_based: bool, staleness_bound: Duration) {
        let mut guard = self.chains.lock().unwrap();
        let entry = guard.entry(chain_id).or_default();
        entry.subscription_based = subscription_based;
        entry.staleness_bound = staleness_bound;
    }

    fn update(&self, chain_id: u64, f: impl FnOnce(&mut ChainHealth)) {
        let mut guard = self.chains.lock().unwrap();
        f(&mut guard.entry(chain_id).or_default().health);
    }

    pub fn record_subscribed(&self, chain_id: u64) {
        self.update(chain_id, |h| h.active_subscriptions = 1);
    }

    pub fn record_unsubscribed(&self, chain_id: u64) {
        self.update(chain_id, |h| h.active_subscriptions = 0);
    }

    /// A proof of life independent of event traffic — a subscribed chain
    /// with no events in a while is still healthy as long as it keeps
    /// ticking.
    pub fn record_liveness_tick(&self, chain_id: u64) {
        self.update(chain_id, |h| h.last_health_check_ts = Some(Utc::now()));
    }

    /// For the polling chain, a tick means the last poll round completed
    /// successfully — the staleness bound is keyed to the poll interval,
    /// not a fixed liveness cadence.
    pub fn record_successful_poll(&self, chain_id: u64) {
        self.record_liveness_tick(chain_id);
    }

    pub fn record_event_processed(&self, chain_id: u64) {
        self.update(chain_id, |h| {
            h.events_processed += 1;
            h.last_event_ts = Some(Utc::now());
        });
    }

    pub fn record_event_skipped(&self, chain_id: u64) {
        self.update(chain_id, |h| h.events_skipped += 1);
    }

    pub fn record_processing_error(&self, chain_id: u64) {
        self.update(chain_id, |h| h.processing_errors += 1);
    }

    pub fn record_reconnect(&self, chain_id: u64) {
        self.update(chain_id, |h| h.reconnections += 1);
    }

    pub fn snapshot(&self) -> HashMap<u64, ChainHealth> {
        let now = Utc::now();
        self.chains
            .lock()
            .unwrap()
            .iter()
            .map(|(chain_id, entry)| {
                let mut health = entry.health.clone();
                let fresh = health
                    .last_health_check_ts
                    .map(|tick| {
                        now.signed_duration_since(tick)
                            .to_std()
                            .map(|age| age <= entry.staleness_bound)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                health.healthy = if entry.subscription_based {
                    health.active_subscriptions >= 1 && fresh
                } else {
                    fresh
                };
                (*chain_id, health)
            })
            .collect()
    }
}

impl Default for ChainHealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns a `JoinSet` of supervised tasks. Each task is wrapped so that a
/// clean exit (a bug: these are meant to run forever) or an error
/// restarts it with a capped exponential backoff, rather than tearing
/// down the whole process (spec.md §4.8).
pub struct Supervisor {
    shutdown: CancellationToken,
    join_set: JoinSet<()>,
    health: Arc<Mutex<HashMap<String, TaskHealth>>>,
    chain_health: ChainHealthRegistry,
}

impl Supervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            join_set: JoinSet::new(),
            health: Arc::new(Mutex::new(HashMap::new())),
            chain_health: ChainHealthRegistry::new(),
        }
    }

    /// A clone of the registry that per-chain tasks record liveness and
    /// throughput counters into; see [`ChainHealthRegistry`].
    pub fn chain_health(&self) -> ChainHealthRegistry {
        self.chain_health.clone()
    }

    /// Register a task under `name`. `factory` is called once per
    /// (re)start, since a `Future` can't be polled twice after exiting.
    pub fn spawn<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: TaskFactory = Box::new(factory);
        let shutdown = self.shutdown.clone();
        let health = self.health.clone();

        health.lock().unwrap().insert(
            name.clone(),
            TaskHealth {
                name: name.clone(),
                restarts: 0,
                last_error: None,
                last_restart_at: None,
            },
        );

        self.join_set.spawn(async move {
            let mut backoff = RESTART_INITIAL_BACKOFF;
            loop {
                if shutdown.is_cancelled() {
                    return;
                }

                let result = factory().await;

                if shutdown.is_cancelled() {
                    return;
                }

                match result {
                    Ok(()) => warn!(task = %name, "task exited; restarting"),
                    Err(e) => {
                        error!(task = %name, err = %e, "task failed; restarting");
                        let mut guard = health.lock().unwrap();
                        if let Some(entry) = guard.get_mut(&name) {
                            entry.last_error = Some(e.to_string());
                        }
                    }
                }

                {
                    let mut guard = health.lock().unwrap();
                    if let Some(entry) = guard.get_mut(&name) {
                        entry.restarts += 1;
                        entry.last_restart_at = Some(Instant::now());
                    }
                }

                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(RESTART_MAX_BACKOFF);
            }
        });
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            tasks: self.health.lock().unwrap().values().cloned().collect(),
            chains: self.chain_health.snapshot(),
        }
    }

    /// Blocks until every supervised task has returned, which only
    /// happens once `shutdown` is cancelled (supervised tasks never exit
    /// this loop on their own; this waits out the wind-down).
    pub async fn join_all(&mut self) {
        while self.join_set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn failed_task_is_restarted_until_shutdown() {
        let shutdown = CancellationToken::new();
        let mut sup = Supervisor::new(shutdown.clone());
        let attempts = Arc::new(AtomicU32::new(0));

        {
            let attempts = attempts.clone();
            sup.spawn("flaky", move || {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                })
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        sup.join_all().await;

        assert!(attempts.load(Ordering::SeqCst) >= 1);
        let snapshot = sup.health_snapshot();
        assert_eq!(snapshot.tasks.len(), 1);
        assert!(snapshot.tasks[0].restarts >= 1);
        assert_eq!(snapshot.tasks[0].last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn subscription_chain_is_unhealthy_without_an_active_subscription() {
        let registry = ChainHealthRegistry::new();
        registry.register_chain(1, true, Duration::from_secs(60));
        registry.record_liveness_tick(1);

        let snapshot = registry.snapshot();
        assert!(!snapshot[&1].healthy, "no active subscription yet");

        registry.record_subscribed(1);
        registry.record_liveness_tick(1);
        assert!(registry.snapshot()[&1].healthy);
    }

    #[test]
    fn subscription_chain_is_unhealthy_once_the_liveness_tick_goes_stale() {
        let registry = ChainHealthRegistry::new();
        registry.register_chain(1, true, Duration::from_secs(0));
        registry.record_subscribed(1);
        registry.record_liveness_tick(1);

        std::thread::sleep(Duration::from_millis(5));
        assert!(!registry.snapshot()[&1].healthy, "tick is older than the zero staleness bound");
    }

    #[test]
    fn polling_chain_ignores_active_subscriptions() {
        let registry = ChainHealthRegistry::new();
        registry.register_chain(7000, false, Duration::from_secs(60));
        registry.record_successful_poll(7000);

        assert!(registry.snapshot()[&7000].healthy);
    }

    #[test]
    fn event_counters_accumulate_per_chain() {
        let registry = ChainHealthRegistry::new();
        registry.register_chain(1, true, Duration::from_secs(60));
        registry.record_event_processed(1);
        registry.record_event_processed(1);
        registry.record_event_skipped(1);
        registry.record_processing_error(1);
        registry.record_reconnect(1);

        let health = registry.snapshot().remove(&1).unwrap();
        assert_eq!(health.events_processed, 2);
        assert_eq!(health.events_skipped, 1);
        assert_eq!(health.processing_errors, 1);
        assert_eq!(health.reconnections, 1);
        assert!(health.last_event_ts.is_some());
    }
}
