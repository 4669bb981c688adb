//! A pool of exactly one object

use super::{
    Deadline, ObjectPool, Priority, PooledResource, ResourceFactory, creation_failed, next_wait,
    settle_loan, stamp_loan,
};
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionHandle, EvictionScheduler};
use crate::metrics::{MetricsTracker, PoolMetrics};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Holds one object, made with [`ResourceFactory::make_primary_object`]
///
/// Used on its own for databases with a single connection, and inside a
/// [`CommonObjectPool`](super::CommonObjectPool) as the holder of the writer.
/// Borrowers queue behind whoever holds the object; a return wakes one of them.
pub struct SingleObjectPool<K, T: PooledResource<K>> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T> {
    factory: Arc<dyn ResourceFactory<T>>,
    config: PoolConfiguration,
    owns_factory: bool,
    state: Mutex<State<T>>,
    // Loans currently out
    active: DashMap<u64, ()>,
    available: Condvar,
    drained: Condvar,
    metrics: MetricsTracker,
    _key: PhantomData<fn(&K)>,
}

struct State<T> {
    idle: Option<T>,
    // Lent out, or being made for a borrower
    lent: bool,
    idle_since: Instant,
    closed: bool,
    scheduler: Option<Arc<EvictionScheduler>>,
    eviction: Option<EvictionHandle>,
}

impl<K, T> SingleObjectPool<K, T>
where
    K: Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    pub fn new(factory: Arc<dyn ResourceFactory<T>>, config: PoolConfiguration) -> PoolResult<Self> {
        Self::build(factory, config, true)
    }

    /// The writer slot of a larger pool, which owns the factory and evicts nothing
    pub(crate) fn primary_of(
        factory: Arc<dyn ResourceFactory<T>>,
        config: &PoolConfiguration,
    ) -> PoolResult<Self> {
        Self::build(factory, config.clone().with_max_total(1).without_eviction(), false)
    }

    fn build(
        factory: Arc<dyn ResourceFactory<T>>,
        config: PoolConfiguration,
        owns_factory: bool,
    ) -> PoolResult<Self> {
        config.validate()?;
        tracing::debug!(?config, "single object pool created");
        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                config,
                owns_factory,
                state: Mutex::new(State {
                    idle: None,
                    lent: false,
                    idle_since: Instant::now(),
                    closed: false,
                    scheduler: None,
                    eviction: None,
                }),
                active: DashMap::new(),
                available: Condvar::new(),
                drained: Condvar::new(),
                metrics: MetricsTracker::new(),
                _key: PhantomData,
            }),
        })
    }

    /// Borrow the object unless someone else holds it
    pub(crate) fn try_borrow(&self) -> PoolResult<Option<T>> {
        self.inner.borrow(None, false)
    }

    /// Run one eviction pass, as the scheduler would
    #[cfg(test)]
    pub(crate) fn evict(&self) -> bool {
        self.inner.evict()
    }
}

impl<K, T> Inner<K, T>
where
    K: Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    fn borrow(self: &Arc<Self>, deadline: Option<Deadline>, block: bool) -> PoolResult<Option<T>> {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if !state.lent {
                state.lent = true;
                if let Some(mut object) = state.idle.take() {
                    stamp_loan(&self.active, &mut object);
                    self.metrics.record_borrow();
                    return Ok(Some(object));
                }
                drop(state);
                return self.create().map(Some);
            }
            if !block {
                return Ok(None);
            }
            if !waited {
                waited = true;
                self.metrics.record_wait();
            }
            let slice = next_wait(deadline.as_ref())?;
            self.available.wait_for(&mut state, slice);
        }
    }

    fn create(self: &Arc<Self>) -> PoolResult<T> {
        match self.factory.make_primary_object() {
            Ok(mut object) => {
                self.metrics.record_created();
                let mut state = self.state.lock();
                if state.closed {
                    state.lent = false;
                    drop(state);
                    self.destroy(object);
                    self.drained.notify_all();
                    return Err(PoolError::PoolClosed);
                }
                self.schedule_eviction(&mut state);
                stamp_loan(&self.active, &mut object);
                self.metrics.record_borrow();
                Ok(object)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to make primary object");
                let mut state = self.state.lock();
                state.lent = false;
                drop(state);
                self.available.notify_one();
                self.drained.notify_all();
                Err(creation_failed(e))
            }
        }
    }

    fn return_object(&self, mut object: T) -> PoolResult<()> {
        let mut state = self.state.lock();
        if !settle_loan(&self.active, &mut object) {
            return Err(PoolError::misuse("returned an object this pool did not lend out"));
        }
        state.lent = false;
        self.metrics.record_return();

        if state.closed {
            drop(state);
            self.destroy(object);
            self.drained.notify_all();
            return Ok(());
        }
        state.idle = Some(object);
        state.idle_since = Instant::now();
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn schedule_eviction(self: &Arc<Self>, state: &mut State<T>) {
        let Some(interval) = self.config.eviction_interval else {
            return;
        };
        if state.closed || state.eviction.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let scheduler = match &state.scheduler {
            Some(scheduler) => Arc::clone(scheduler),
            None => match EvictionScheduler::shared() {
                Ok(scheduler) => {
                    state.scheduler = Some(Arc::clone(&scheduler));
                    scheduler
                }
                Err(e) => {
                    tracing::warn!(error = %e, "idle eviction disabled");
                    return;
                }
            },
        };
        let pool = Arc::downgrade(self);
        let task = move || pool.upgrade().is_some_and(|inner| inner.evict());
        match scheduler.schedule_at_fixed_rate(self.config.eviction_delay, interval, task) {
            Ok(handle) => state.eviction = Some(handle),
            Err(e) => tracing::warn!(error = %e, "idle eviction disabled"),
        }
    }

    /// Returns whether eviction should keep running
    fn evict(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.lent {
            return true;
        }
        let expired = state.idle_since.elapsed() >= self.config.eviction_delay;
        let object = match state.idle.take() {
            Some(object) if expired => object,
            Some(object) => {
                state.idle = Some(object);
                return true;
            }
            None => {
                state.eviction = None;
                return false;
            }
        };
        state.eviction = None;
        drop(state);

        tracing::trace!("evicting idle primary object");
        self.metrics.record_evicted(1);
        self.destroy(object);
        false
    }

    fn clear(&self, priority: Priority) {
        let mut state = self.state.lock();
        if state.closed || state.lent {
            return;
        }
        let Some(mut object) = state.idle.take() else {
            return;
        };
        match priority {
            Priority::High => {
                if let Some(handle) = state.eviction.take() {
                    handle.cancel();
                }
                drop(state);
                self.destroy(object);
            }
            Priority::Low => {
                // Hold the slot so borrowers wait while the object shrinks.
                state.lent = true;
                drop(state);
                object.release_memory();

                let mut state = self.state.lock();
                state.lent = false;
                if state.closed {
                    drop(state);
                    self.destroy(object);
                    self.drained.notify_all();
                    return;
                }
                state.idle = Some(object);
                drop(state);
                self.available.notify_one();
            }
        }
    }


    fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        self.metrics
            .snapshot(state.lent as usize, state.idle.is_some() as usize, 1)
    }
}

impl<K, T: PooledResource<K>> SingleObjectPool<K, T> {
    /// Close, waiting up to `grace` for the object to come back
    pub(crate) fn close_within(&self, grace: Duration) {
        self.inner.close(grace);
    }
}

impl<K, T: PooledResource<K>> Inner<K, T> {
    fn close(&self, grace: Duration) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(handle) = state.eviction.take() {
            handle.cancel();
        }
        let scheduler = state.scheduler.take();
        let idle = state.idle.take();
        drop(state);
        self.available.notify_all();
        drop(scheduler);

        if let Some(object) = idle {
            self.destroy(object);
        }

        let deadline = Instant::now() + grace;
        let mut state = self.state.lock();
        while state.lent {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.lent {
            tracing::warn!("pool closed while its object is lent, it is destroyed on return");
        }
        drop(state);

        if self.owns_factory {
            self.factory.close();
        }
        tracing::debug!("single object pool closed");
    }

    fn destroy(&self, object: T) {
        if let Err(e) = self.factory.destroy_object(object) {
            tracing::warn!(error = %e, "failed to destroy pooled object");
        }
        self.metrics.record_destroyed(1);
    }
}

impl<K, T> ObjectPool<K, T> for SingleObjectPool<K, T>
where
    K: Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    fn borrow_object(&self, _key: &K) -> PoolResult<T> {
        self.borrow_primary_object()
    }

    fn borrow_object_timeout(&self, _key: &K, timeout: Duration) -> PoolResult<T> {
        self.borrow_primary_object_timeout(timeout)
    }

    fn borrow_primary_object(&self) -> PoolResult<T> {
        self.inner.borrow(None, true)?.ok_or(PoolError::PoolClosed)
    }

    fn borrow_primary_object_timeout(&self, timeout: Duration) -> PoolResult<T> {
        self.inner
            .borrow(Some(Deadline::after(timeout)), true)?
            .ok_or(PoolError::PoolExhausted(timeout))
    }

    fn return_object(&self, object: T) -> PoolResult<()> {
        self.inner.return_object(object)
    }

    fn clear(&self, priority: Priority) {
        self.inner.clear(priority);
    }

    fn close(&self) {
        self.inner.close(self.inner.config.close_grace);
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }
}

impl<K, T: PooledResource<K>> Drop for SingleObjectPool<K, T> {
    fn drop(&mut self) {
        self.inner.close(Duration::ZERO);
    }
}
