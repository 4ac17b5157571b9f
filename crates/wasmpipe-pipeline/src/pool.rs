//! Bounded instance pool with borrow/return discipline.
//!
//! The pool caps how many instances exist at once (borrowed plus idle),
//! hands them out LIFO or FIFO, and optionally validates them at each
//! lifecycle point. Return is unconditional: a guard returns its entry on
//! drop even when the borrower errored, so repeated failures cannot leak
//! capacity. An optional background evictor retires stale idle entries
//! and refills to the configured idle floor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use wasmpipe_common::{PipelineError, PoolConfig};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Validator<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// A bounded pool of instances of `T`.
pub struct InstancePool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for InstancePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<T> {
    config: PoolConfig,
    factory: Factory<T>,
    validator: Option<Validator<T>>,
    state: Mutex<PoolState<T>>,
    returned: Notify,
}

struct PoolState<T> {
    /// Idle entries, oldest return at the front.
    idle: VecDeque<PoolEntry<T>>,
    /// Instances alive: idle plus borrowed.
    total: usize,
}

struct PoolEntry<T> {
    value: T,
    idle_since: Instant,
}

impl<T: Send + 'static> InstancePool<T> {
    /// Create a pool over `factory`, prefilling to the configured idle
    /// floor.
    pub fn new(config: PoolConfig, factory: Factory<T>) -> Self {
        Self::with_validator(config, factory, None)
    }

    /// Create a pool with an instance validator applied at the configured
    /// lifecycle points.
    pub fn with_validator(
        config: PoolConfig,
        factory: Factory<T>,
        validator: Option<Validator<T>>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            factory,
            validator,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
            }),
            returned: Notify::new(),
        });

        {
            let mut state = inner.state.lock();
            inner.refill_locked(&mut state);
        }

        Self { inner }
    }

    /// Borrow an instance, waiting up to `deadline` when the pool is
    /// exhausted and blocking is enabled.
    ///
    /// # Errors
    ///
    /// Returns a pool-exhausted error immediately when blocking is
    /// disabled and no capacity is available, or after the deadline when
    /// it is. Borrow timeouts are never retried here; retry policy belongs
    /// to the caller.
    pub async fn borrow(&self, deadline: std::time::Duration) -> Result<PoolGuard<T>, PipelineError> {
        let deadline = tokio::time::Instant::now() + deadline;

        loop {
            let create = {
                let mut state = self.inner.state.lock();

                while let Some(entry) = self.pop_idle(&mut state) {
                    if self.inner.config.test_on_borrow && !self.inner.is_valid(&entry.value) {
                        debug!("Discarding idle instance that failed borrow validation");
                        state.total -= 1;
                        self.inner.returned.notify_one();
                        continue;
                    }
                    return Ok(self.guard(entry.value));
                }

                if state.total < self.inner.config.max_total {
                    // Reserve the slot before running the factory outside
                    // the lock.
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if create {
                let value = (self.inner.factory)();
                if self.inner.config.test_on_create && !self.inner.is_valid(&value) {
                    self.inner.state.lock().total -= 1;
                    // The reserved slot is free again; a parked borrower
                    // may take it.
                    self.inner.returned.notify_one();
                    return Err(PipelineError::pool_exhausted(
                        "newly created instance failed validation",
                    ));
                }
                trace!("Created pool instance");
                return Ok(self.guard(value));
            }

            if !self.inner.config.block_when_exhausted {
                return Err(PipelineError::pool_exhausted(
                    "pool is exhausted and blocking is disabled",
                ));
            }

            tokio::select! {
                () = self.inner.returned.notified() => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(PipelineError::pool_exhausted(
                        "timed out waiting for an instance",
                    ));
                }
            }
        }
    }

    fn pop_idle(&self, state: &mut PoolState<T>) -> Option<PoolEntry<T>> {
        if self.inner.config.lifo {
            state.idle.pop_back()
        } else {
            state.idle.pop_front()
        }
    }

    fn guard(&self, value: T) -> PoolGuard<T> {
        PoolGuard {
            inner: Arc::clone(&self.inner),
            value: Some(value),
        }
    }

    /// Spawn the background evictor, if an eviction interval is
    /// configured. Aborting the returned handle stops it.
    pub fn spawn_evictor(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.inner.config.time_between_eviction_runs?;
        let inner = Arc::clone(&self.inner);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.run_eviction();
            }
        }))
    }

    /// Number of idle instances.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Number of instances currently borrowed.
    pub fn active_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.total - state.idle.len()
    }
}

impl<T> PoolInner<T> {
    fn is_valid(&self, value: &T) -> bool {
        self.validator.as_ref().is_none_or(|validate| validate(value))
    }

    fn return_value(&self, value: T) {
        {
            let mut state = self.state.lock();

            let keep = (!self.config.test_on_return || self.is_valid(&value))
                && state.idle.len() < self.config.max_idle;

            if keep {
                state.idle.push_back(PoolEntry {
                    value,
                    idle_since: Instant::now(),
                });
            } else {
                state.total -= 1;
            }
        }
        // Capacity changed either way; wake one waiter.
        self.returned.notify_one();
    }

    /// One eviction pass: examine the oldest idle entries, retire the
    /// stale or invalid ones without dipping below the idle floor, then
    /// refill to it.
    fn run_eviction(&self) {
        let now = Instant::now();
        let mut evicted = 0;
        {
            let mut state = self.state.lock();

            let examine = self.config.num_tests_per_eviction_run.min(state.idle.len());
            let mut index = 0;
            let mut examined = 0;

            while examined < examine && index < state.idle.len() {
                examined += 1;

                if state.idle.len() <= self.config.min_idle {
                    break;
                }

                let entry = &state.idle[index];
                let idle_for = now.duration_since(entry.idle_since);

                let stale = idle_for >= self.config.min_evictable_idle_time
                    || (!self.config.soft_min_evictable_idle_time.is_zero()
                        && idle_for >= self.config.soft_min_evictable_idle_time);
                let invalid = self.config.test_while_idle && !self.is_valid(&entry.value);

                if stale || invalid {
                    state.idle.remove(index);
                    state.total -= 1;
                    evicted += 1;
                    debug!(?idle_for, "Evicted idle instance");
                } else {
                    index += 1;
                }
            }

            self.refill_locked(&mut state);
        }

        // Each retired entry freed a slot a parked borrower may take.
        for _ in 0..evicted {
            self.returned.notify_one();
        }
    }

    /// Create instances until the idle floor is met, within the total cap.
    fn refill_locked(&self, state: &mut PoolState<T>) {
        while state.idle.len() < self.config.min_idle && state.total < self.config.max_total {
            let value = (self.factory)();
            if self.config.test_on_create && !self.is_valid(&value) {
                break;
            }
            state.total += 1;
            state.idle.push_back(PoolEntry {
                value,
                idle_since: Instant::now(),
            });
        }
    }
}

/// A borrowed pool entry. Dropping it returns the entry to the pool,
/// unconditionally.
pub struct PoolGuard<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    value: Option<T>,
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> std::ops::Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.inner.return_value(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_factory() -> (Factory<usize>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_in = Arc::clone(&counter);
        let factory: Factory<usize> =
            Box::new(move || counter_in.fetch_add(1, Ordering::SeqCst));
        (factory, counter)
    }

    #[tokio::test]
    async fn test_borrow_and_return_balance() {
        let (factory, created) = counting_factory();
        let pool = InstancePool::new(PoolConfig::default(), factory);

        {
            let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
            let b = pool.borrow(Duration::from_secs(1)).await.unwrap();
            assert_ne!(*a, *b);
            assert_eq!(pool.active_count(), 2);
        }

        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lifo_reuses_most_recent() {
        let (factory, _) = counting_factory();
        let pool = InstancePool::new(PoolConfig::default(), factory);

        let first = *pool.borrow(Duration::from_secs(1)).await.unwrap();
        let second = {
            let _held = pool.borrow(Duration::from_secs(1)).await.unwrap();
            *pool.borrow(Duration::from_secs(1)).await.unwrap()
        };
        // The held instance (0) was returned after the inner borrow (1),
        // so LIFO hands 0 back first.
        let third = *pool.borrow(Duration::from_secs(1)).await.unwrap();

        assert_eq!(first, 0);
        assert_ne!(first, second);
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn test_fifo_rotates_through_idle() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            lifo: false,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        // Seed two idle instances, returned in order 0 then 1.
        {
            let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
            let _b = pool.borrow(Duration::from_secs(1)).await.unwrap();
            drop(a);
        }

        assert_eq!(*pool.borrow(Duration::from_secs(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_without_blocking_fails_fast() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            max_total: 1,
            block_when_exhausted: false,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        let held = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let err = pool.borrow(Duration::from_secs(1)).await.unwrap_err();

        assert!(err.is_pool_exhausted());
        drop(held);

        // Capacity came back after the return.
        assert!(pool.borrow(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_borrow_times_out() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            max_total: 1,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        let _held = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let err = pool.borrow(Duration::from_millis(20)).await.unwrap_err();

        assert!(err.is_pool_exhausted());
    }

    #[tokio::test]
    async fn test_blocking_borrow_wakes_on_return() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            max_total: 1,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        let held = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_borrow_validation_discards_and_replaces() {
        let (factory, created) = counting_factory();
        let config = PoolConfig {
            test_on_borrow: true,
            ..Default::default()
        };
        // Instance 0 is invalid; everything later passes.
        let pool = InstancePool::with_validator(config, factory, Some(Box::new(|v| *v != 0)));

        drop(pool.borrow(Duration::from_secs(1)).await.unwrap());
        let replaced = pool.borrow(Duration::from_secs(1)).await.unwrap();

        assert_eq!(*replaced, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_return_validation_discards() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            test_on_return: true,
            ..Default::default()
        };
        let pool = InstancePool::with_validator(config, factory, Some(Box::new(|_| false)));

        drop(pool.borrow(Duration::from_secs(1)).await.unwrap());

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_max_idle_trims_on_return() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            max_idle: 1,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
        let b = pool.borrow(Duration::from_secs(1)).await.unwrap();
        drop(a);
        drop(b);

        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_min_idle_prefills() {
        let (factory, created) = counting_factory();
        let config = PoolConfig {
            min_idle: 3,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        assert_eq!(pool.idle_count(), 3);
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_create_wakes_parked_borrower() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_in = Arc::clone(&counter);
        // Instance 0 is created slowly and fails validation; instance 1
        // passes.
        let factory: Factory<usize> = Box::new(move || {
            let v = counter_in.fetch_add(1, Ordering::SeqCst);
            if v == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
            v
        });
        let config = PoolConfig {
            max_total: 1,
            test_on_create: true,
            ..Default::default()
        };
        let pool = InstancePool::with_validator(config, factory, Some(Box::new(|v| *v != 0)));

        let loser = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow(Duration::from_secs(5)).await })
        };
        // Let the first borrower reserve the only slot and enter its slow
        // create, then park behind it.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The discarded create must wake this borrower well before its
        // deadline instead of leaving it to time out.
        let woken = pool.borrow(Duration::from_millis(500)).await;

        assert!(loser.await.unwrap().unwrap_err().is_pool_exhausted());
        assert_eq!(*woken.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evictor_retires_stale_and_refills() {
        let (factory, _) = counting_factory();
        let config = PoolConfig {
            min_idle: 1,
            min_evictable_idle_time: Duration::from_millis(50),
            time_between_eviction_runs: Some(Duration::from_millis(100)),
            num_tests_per_eviction_run: 10,
            ..Default::default()
        };
        let pool = InstancePool::new(config, factory);

        // Grow the idle set beyond the floor.
        {
            let a = pool.borrow(Duration::from_secs(1)).await.unwrap();
            let _b = pool.borrow(Duration::from_secs(1)).await.unwrap();
            let _c = pool.borrow(Duration::from_secs(1)).await.unwrap();
            drop(a);
        }
        assert_eq!(pool.idle_count(), 3);

        let evictor = pool.spawn_evictor().unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Stale entries above the floor are gone; the floor remains.
        assert_eq!(pool.idle_count(), 1);
        evictor.abort();
    }
}
