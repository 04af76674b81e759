//! Per-key limiter registry with idle eviction.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::window::{Decision, WindowCounter};
use crate::error::{Result, TurnstileError};

/// Keeps one [`WindowCounter`] per key, created on first use.
///
/// Concurrent first requests for an unseen key all end up on the same counter:
/// the losing candidates of the registration race are discarded. Requests for
/// different keys only share the map's shard locks, never a counter lock.
pub struct KeyedLimiter<K = String>
where
    K: Eq + Hash,
{
    /// Window counters indexed by key
    limiters: DashMap<K, Arc<WindowCounter>>,
    /// Limit given to every new counter
    limit: u64,
    /// Window given to every new counter
    window: Duration,
}

impl<K> KeyedLimiter<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create an empty registry whose counters admit `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limiters: DashMap::new(),
            limit,
            window,
        }
    }

    /// Check the rate limit for `key`.
    pub fn allow<Q>(&self, key: &Q) -> Decision
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
    {
        self.allow_at(key, Instant::now())
    }

    /// Same as [`allow`](Self::allow), evaluated at `now`.
    pub fn allow_at<Q>(&self, key: &Q, now: Instant) -> Decision
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
    {
        let limiter = self.limiter(key);
        let decision = limiter.allow_at(now);

        trace!(
            key = ?key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked keyed rate limit"
        );
        if !decision.allowed {
            debug!(key = ?key, "Rate limit exceeded");
        }

        decision
    }

    /// Get the counter registered for `key`, creating it if needed.
    pub fn limiter<Q>(&self, key: &Q) -> Arc<WindowCounter>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + fmt::Debug + ?Sized,
    {
        if let Some(existing) = self.limiters.get(key) {
            return Arc::clone(existing.value());
        }

        let candidate = Arc::new(WindowCounter::new(self.limit, self.window));
        let entry = self.limiters.entry(key.to_owned()).or_insert_with(|| {
            debug!(
                key = ?key,
                limit = self.limit,
                window = ?self.window,
                "Creating new rate limit counter"
            );
            candidate
        });
        Arc::clone(entry.value())
    }

    /// Evict every counter idle for longer than `ttl`.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        self.sweep_at(Instant::now(), ttl)
    }

    /// Same as [`sweep`](Self::sweep), evaluated at `now`.
    pub fn sweep_at(&self, now: Instant, ttl: Duration) -> usize {
        let stale: Vec<K> = self
            .limiters
            .iter()
            .filter(|entry| entry.value().idle_for(now) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        // Re-check under the shard lock: a key may have seen traffic since.
        stale
            .into_iter()
            .filter(|key| {
                self.limiters
                    .remove_if(key, |_, limiter| limiter.idle_for(now) > ttl)
                    .is_some()
            })
            .count()
    }

    /// Spawn a task that sweeps idle counters every `sweep_interval`.
    ///
    /// The task runs until the returned handle is stopped or dropped.
    /// Fails with [`TurnstileError::Config`] outside a tokio runtime.
    pub fn start_cleanup(
        self: &Arc<Self>,
        sweep_interval: Duration,
        ttl: Duration,
    ) -> Result<CleanupHandle> {
        if sweep_interval.is_zero() {
            return Err(TurnstileError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            TurnstileError::Config("idle sweep requires a tokio runtime".to_string())
        })?;

        let registry = Arc::clone(self);
        let (shutdown, mut stop_rx) = watch::channel(false);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + sweep_interval,
                sweep_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                sweep_interval = ?sweep_interval,
                ttl = ?ttl,
                "Started idle limiter sweep"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.sweep(ttl);
                        if evicted > 0 {
                            info!(evicted, remaining = registry.len(), "Evicted idle rate limiters");
                        } else {
                            trace!(tracked = registry.len(), "Idle sweep found nothing to evict");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }

            info!("Stopped idle limiter sweep");
        });

        Ok(CleanupHandle {
            shutdown,
            task: Some(task),
        })
    }

    /// Whether a counter is registered for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.limiters.contains_key(key)
    }

    /// Get the number of registered counters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no counters are registered.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.limiters.clear();
    }

    /// Get the limit given to new counters.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Get the window given to new counters.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl<K: Eq + Hash> fmt::Debug for KeyedLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("tracked", &self.limiters.len())
            .finish()
    }
}

/// Stop handle for a registry's background sweep.
///
/// Dropping the handle aborts the task; [`stop`](Self::stop) ends it cleanly.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl CleanupHandle {
    /// Signal the sweep task to finish and wait for it.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.take() {
            Some(task) => task.await.map_err(|e| {
                warn!(error = %e, "Idle sweep task did not finish cleanly");
                TurnstileError::Task(e.to_string())
            }),
            None => Ok(()),
        }
    }

    /// Whether the sweep task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn test_registry_creation() {
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_cleanup_outside_runtime_is_config_error() {
        let registry: Arc<KeyedLimiter> = Arc::new(KeyedLimiter::new(5, WINDOW));

        let result = registry.start_cleanup(Duration::from_secs(1), WINDOW);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_allow_creates_counter() {
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);

        let decision = registry.allow("10.0.0.1");

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_key("10.0.0.1"));
    }

    #[test]
    fn test_same_key_shares_counter() {
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);

        let first = registry.limiter("client");
        let second = registry.limiter("client");

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_keys_are_isolated() {
        let start = Instant::now();
        let registry: KeyedLimiter = KeyedLimiter::new(3, WINDOW);

        for _ in 0..3 {
            assert!(registry.allow_at("A", start).allowed);
        }
        assert!(!registry.allow_at("A", start).allowed);

        let decision = registry.allow_at("B", start);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn test_concurrent_first_touch_registers_one_counter() {
        const CALLERS: usize = 32;
        let registry: KeyedLimiter = KeyedLimiter::new(5, Duration::from_secs(60));
        let barrier = Barrier::new(CALLERS);

        let (admitted, counters): (usize, Vec<Arc<WindowCounter>>) = std::thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let allowed = registry.allow("unseen").allowed;
                        (allowed, registry.limiter("unseen"))
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let admitted = results.iter().filter(|(allowed, _)| *allowed).count();
            (admitted, results.into_iter().map(|(_, c)| c).collect())
        });

        assert_eq!(admitted, 5);
        assert_eq!(registry.len(), 1);
        assert!(counters.iter().all(|c| Arc::ptr_eq(c, &counters[0])));
    }

    #[test]
    fn test_sweep_evicts_idle_keys_only() {
        let start = Instant::now();
        let ttl = Duration::from_secs(300);
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);

        registry.allow_at("idle", start);
        registry.allow_at("busy", start);
        registry.allow_at("busy", start + Duration::from_secs(200));

        let evicted = registry.sweep_at(start + Duration::from_secs(301), ttl);

        assert_eq!(evicted, 1);
        assert!(!registry.contains_key("idle"));
        assert!(registry.contains_key("busy"));
    }

    #[test]
    fn test_sweep_keeps_key_idle_for_exactly_ttl() {
        let start = Instant::now();
        let ttl = Duration::from_secs(60);
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);

        registry.allow_at("edge", start);

        assert_eq!(registry.sweep_at(start + ttl, ttl), 0);
        assert_eq!(registry.sweep_at(start + ttl + Duration::from_millis(1), ttl), 1);
    }

    #[test]
    fn test_evicted_key_gets_fresh_quota() {
        let start = Instant::now();
        let ttl = Duration::from_secs(10);
        // Window longer than the TTL so only eviction can restore the quota
        let registry: KeyedLimiter = KeyedLimiter::new(2, Duration::from_secs(3600));

        assert!(registry.allow_at("client", start).allowed);
        assert!(registry.allow_at("client", start).allowed);
        assert!(!registry.allow_at("client", start).allowed);

        let later = start + Duration::from_secs(11);
        assert_eq!(registry.sweep_at(later, ttl), 1);

        let decision = registry.allow_at("client", later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_clear_counters() {
        let registry: KeyedLimiter = KeyedLimiter::new(5, WINDOW);

        registry.allow("a");
        registry.allow("b");
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_background_sweep_evicts_and_stops() {
        let registry: Arc<KeyedLimiter> = Arc::new(KeyedLimiter::new(1, Duration::from_secs(3600)));
        assert!(registry.allow("client").allowed);
        assert!(!registry.allow("client").allowed);

        let handle = registry
            .start_cleanup(Duration::from_millis(10), Duration::from_millis(30))
            .unwrap();

        let evicted = tokio::time::timeout(Duration::from_secs(5), async {
            while registry.contains_key("client") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(evicted.is_ok(), "idle key should be evicted by the sweep");

        assert!(registry.allow("client").allowed);

        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_sweep_interval_rejected() {
        let registry: Arc<KeyedLimiter> = Arc::new(KeyedLimiter::new(1, WINDOW));
        let result = registry.start_cleanup(Duration::ZERO, Duration::from_secs(1));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
