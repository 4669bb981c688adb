//! A bounded pool of reader objects beside one writer slot

use super::single::SingleObjectPool;
use super::{
    Deadline, ObjectPool, Priority, PooledResource, ResourceFactory, creation_failed, next_wait,
    settle_loan, stamp_loan,
};
use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::eviction::{EvictionHandle, EvictionScheduler};
use crate::metrics::{MetricsTracker, PoolMetrics};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A pool of up to `max_total` objects, one of which is the primary
///
/// Primary borrows go to an inner [`SingleObjectPool`] and never compete with
/// secondary borrows. Secondary borrows prefer an idle object matching their
/// key, then grow the pool, then take any idle object, and otherwise queue.
///
/// Queued borrowers are served in arrival order, except that a returned object
/// goes to the first queued borrower whose key it matches while the head of the
/// queue has waited less than [`PoolConfiguration::fairness_threshold`].
pub struct CommonObjectPool<K, T: PooledResource<K>> {
    inner: Arc<Inner<K, T>>,
}

struct Inner<K, T: PooledResource<K>> {
    factory: Arc<dyn ResourceFactory<T>>,
    config: PoolConfiguration,
    max_secondary: usize,
    primary: SingleObjectPool<K, T>,
    state: Mutex<State<K, T>>,
    // Secondary loans currently out
    active: DashMap<u64, ()>,
    drained: Condvar,
    metrics: MetricsTracker,
}

struct State<K, T> {
    // Most recently returned first
    idle: VecDeque<Idle<T>>,
    // Live secondaries: idle, lent, or being made
    count: usize,
    lent: usize,
    waiters: VecDeque<Waiter<K>>,
    grants: HashMap<u64, Grant<T>>,
    next_waiter: u64,
    last_borrow: Option<Instant>,
    closed: bool,
    scheduler: Option<Arc<EvictionScheduler>>,
    eviction: Option<EvictionHandle>,
}

struct Idle<T> {
    object: T,
    since: Instant,
}

struct Waiter<K> {
    id: u64,
    key: K,
    since: Instant,
    signal: Arc<Condvar>,
}

/// What a queued borrower is handed
enum Grant<T> {
    Object(T),
    /// A slot freed up and the borrower should make its own object
    Create,
}

impl<K, T> CommonObjectPool<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    pub fn new(factory: Arc<dyn ResourceFactory<T>>, config: PoolConfiguration) -> PoolResult<Self> {
        config.validate()?;
        if config.max_total < 2 {
            return Err(PoolError::misuse(
                "a common pool needs room for the primary and at least one secondary object",
            ));
        }
        let primary = SingleObjectPool::primary_of(Arc::clone(&factory), &config)?;
        tracing::debug!(?config, "common object pool created");
        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                max_secondary: config.max_total - 1,
                config,
                primary,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    count: 0,
                    lent: 0,
                    waiters: VecDeque::new(),
                    grants: HashMap::new(),
                    next_waiter: 0,
                    last_borrow: None,
                    closed: false,
                    scheduler: None,
                    eviction: None,
                }),
                active: DashMap::new(),
                drained: Condvar::new(),
                metrics: MetricsTracker::new(),
            }),
        })
    }

    /// Run one eviction pass, as the scheduler would
    #[cfg(test)]
    pub(crate) fn evict(&self) -> bool {
        self.inner.evict()
    }
}

impl<K, T> Inner<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    fn borrow(self: &Arc<Self>, key: &K, deadline: Option<Deadline>) -> PoolResult<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::PoolClosed);
        }

        if state.waiters.is_empty() {
            if let Some(position) = state.idle.iter().position(|idle| idle.object.matches(key)) {
                if let Some(idle) = state.idle.remove(position) {
                    return Ok(self.lend(&mut state, idle.object));
                }
            }
            if state.count < self.max_secondary {
                state.count += 1;
                state.lent += 1;
                state.last_borrow = Some(Instant::now());
                drop(state);
                return self.create();
            }
            if let Some(idle) = state.idle.pop_front() {
                return Ok(self.lend(&mut state, idle.object));
            }
        }

        self.metrics.record_wait();
        let id = state.next_waiter;
        state.next_waiter += 1;
        let signal = Arc::new(Condvar::new());
        state.waiters.push_back(Waiter {
            id,
            key: key.clone(),
            since: Instant::now(),
            signal: Arc::clone(&signal),
        });

        loop {
            match state.grants.remove(&id) {
                Some(Grant::Object(object)) => return Ok(object),
                Some(Grant::Create) => {
                    drop(state);
                    return self.create();
                }
                None => {}
            }
            if state.closed {
                state.waiters.retain(|waiter| waiter.id != id);
                return Err(PoolError::PoolClosed);
            }
            match next_wait(deadline.as_ref()) {
                Ok(slice) => {
                    signal.wait_for(&mut state, slice);
                }
                Err(e) => {
                    state.waiters.retain(|waiter| waiter.id != id);
                    return Err(e);
                }
            }
        }
    }

    fn lend(&self, state: &mut MutexGuard<'_, State<K, T>>, mut object: T) -> T {
        stamp_loan(&self.active, &mut object);
        state.lent += 1;
        state.last_borrow = Some(Instant::now());
        self.metrics.record_borrow();
        object
    }

    /// Make an object for a borrower holding a reserved slot
    fn create(self: &Arc<Self>) -> PoolResult<T> {
        match self.factory.make_object() {
            Ok(mut object) => {
                self.metrics.record_created();
                let mut state = self.state.lock();
                if state.closed {
                    state.count -= 1;
                    state.lent -= 1;
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
                tracing::warn!(error = %e, "failed to make pooled object");
                let mut state = self.state.lock();
                state.lent -= 1;
                self.release_slot(&mut state);
                drop(state);
                self.drained.notify_all();
                Err(creation_failed(e))
            }
        }
    }

    /// Give up a slot, letting the longest waiter make an object in its place
    fn release_slot(&self, state: &mut State<K, T>) {
        state.count -= 1;
        if state.closed {
            return;
        }
        if let Some(waiter) = state.waiters.pop_front() {
            state.count += 1;
            state.lent += 1;
            state.last_borrow = Some(Instant::now());
            state.grants.insert(waiter.id, Grant::Create);
            waiter.signal.notify_one();
        }
    }

    fn return_object(&self, mut object: T) -> PoolResult<()> {
        if object.is_primary() {
            return self.primary.return_object(object);
        }
        let mut state = self.state.lock();
        if !settle_loan(&self.active, &mut object) {
            return Err(PoolError::misuse("returned an object this pool did not lend out"));
        }
        state.lent -= 1;
        self.metrics.record_return();

        if state.closed {
            state.count -= 1;
            drop(state);
            self.destroy(object);
            self.drained.notify_all();
            return Ok(());
        }
        self.restore(&mut state, object);
        Ok(())
    }

    /// Hand an unlent object to a queued borrower, or park it as idle
    fn restore(&self, state: &mut MutexGuard<'_, State<K, T>>, object: T) {
        let Some(position) = self.select_waiter(state, &object) else {
            state.idle.push_front(Idle {
                object,
                since: Instant::now(),
            });
            return;
        };
        if let Some(waiter) = state.waiters.remove(position) {
            let object = self.lend(state, object);
            state.grants.insert(waiter.id, Grant::Object(object));
            waiter.signal.notify_one();
        }
    }

    fn select_waiter(&self, state: &State<K, T>, object: &T) -> Option<usize> {
        let head = state.waiters.front()?;
        if head.since.elapsed() >= self.config.fairness_threshold {
            return Some(0);
        }
        state
            .waiters
            .iter()
            .position(|waiter| object.matches(&waiter.key))
            .or(Some(0))
    }

    fn schedule_eviction(self: &Arc<Self>, state: &mut State<K, T>) {
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

    /// Destroy secondaries idle past the eviction delay; returns whether to keep running
    fn evict(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.count == 0 {
            state.eviction = None;
            return false;
        }

        let now = Instant::now();
        let interval = self.config.eviction_interval.unwrap_or(Duration::ZERO);
        let in_demand = state
            .last_borrow
            .is_some_and(|at| now.duration_since(at) < interval);
        let floor = usize::from(in_demand);

        let mut evicted = Vec::new();
        while state.count > floor {
            match state.idle.back() {
                Some(idle) if now.duration_since(idle.since) >= self.config.eviction_delay => {}
                _ => break,
            }
            if let Some(idle) = state.idle.pop_back() {
                evicted.push(idle.object);
                self.release_slot(&mut state);
            }
        }
        let keep_running = state.count > 0;
        if !keep_running {
            state.eviction = None;
        }
        drop(state);

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicting idle objects");
            self.metrics.record_evicted(evicted.len());
        }
        for object in evicted {
            self.destroy(object);
        }
        keep_running
    }

    fn clear(&self, priority: Priority) {
        self.primary.clear(priority);

        let mut state = self.state.lock();
        if state.closed || state.idle.is_empty() {
            return;
        }
        let idle: Vec<T> = state.idle.drain(..).map(|idle| idle.object).collect();
        match priority {
            Priority::High => {
                for _ in 0..idle.len() {
                    self.release_slot(&mut state);
                }
                drop(state);
                for object in idle {
                    self.destroy(object);
                }
            }
            Priority::Low => {
                // Counted as lent while shrinking so close waits for them.
                state.lent += idle.len();
                drop(state);
                let idle: Vec<T> = idle
                    .into_iter()
                    .map(|mut object| {
                        object.release_memory();
                        object
                    })
                    .collect();

                let mut state = self.state.lock();
                state.lent -= idle.len();
                if state.closed {
                    state.count -= idle.len();
                    drop(state);
                    for object in idle {
                        self.destroy(object);
                    }
                    self.drained.notify_all();
                    return;
                }
                // Restore the oldest first so the freshest ends up at the front.
                for object in idle.into_iter().rev() {
                    self.restore(&mut state, object);
                }
            }
        }
    }


    fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        let secondary = self
            .metrics
            .snapshot(state.lent, state.idle.len(), self.max_secondary);
        drop(state);
        secondary.combine(self.primary.metrics())
    }
}

impl<K, T: PooledResource<K>> Inner<K, T> {
    fn close(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(handle) = state.eviction.take() {
            handle.cancel();
        }
        let scheduler = state.scheduler.take();
        let idle: Vec<T> = state.idle.drain(..).map(|idle| idle.object).collect();
        state.count -= idle.len();
        for waiter in state.waiters.drain(..) {
            waiter.signal.notify_one();
        }
        drop(state);
        drop(scheduler);

        for object in idle {
            self.destroy(object);
        }
        self.primary
            .close_within(deadline.saturating_duration_since(Instant::now()));

        let mut state = self.state.lock();
        while state.lent > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.lent > 0 {
            tracing::warn!(
                lent = state.lent,
                "pool closed with objects still lent, they are destroyed on return"
            );
        }
        drop(state);

        self.factory.close();
        tracing::debug!("common object pool closed");
    }

    fn destroy(&self, object: T) {
        if let Err(e) = self.factory.destroy_object(object) {
            tracing::warn!(error = %e, "failed to destroy pooled object");
        }
        self.metrics.record_destroyed(1);
    }
}

impl<K, T> ObjectPool<K, T> for CommonObjectPool<K, T>
where
    K: Clone + Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    fn borrow_object(&self, key: &K) -> PoolResult<T> {
        self.inner.borrow(key, None)
    }

    fn borrow_object_timeout(&self, key: &K, timeout: Duration) -> PoolResult<T> {
        self.inner.borrow(key, Some(Deadline::after(timeout)))
    }

    fn borrow_primary_object(&self) -> PoolResult<T> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.inner.primary.borrow_primary_object()
    }

    fn borrow_primary_object_timeout(&self, timeout: Duration) -> PoolResult<T> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.inner.primary.borrow_primary_object_timeout(timeout)
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

impl<K, T: PooledResource<K>> Drop for CommonObjectPool<K, T> {
    fn drop(&mut self) {
        self.inner.close(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{TestFactory, TestObject};
    use super::*;
    use crossbeam::channel;
    use std::thread;

    fn pool(factory: &Arc<TestFactory>, max_total: usize) -> Arc<CommonObjectPool<u32, TestObject>> {
        Arc::new(
            CommonObjectPool::new(
                factory.clone(),
                PoolConfiguration::new()
                    .with_max_total(max_total)
                    .without_eviction(),
            )
            .unwrap(),
        )
    }

    fn give_back(pool: &CommonObjectPool<u32, TestObject>, mut object: TestObject, key: u32) {
        object.key = Some(key);
        pool.return_object(object).unwrap();
    }

    #[test]
    fn affinity_match_is_preferred() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);

        let a = pool.borrow_object(&1).unwrap();
        let b = pool.borrow_object(&2).unwrap();
        let (a_id, b_id) = (a.id, b.id);
        give_back(&pool, a, 1);
        give_back(&pool, b, 2);

        let again = pool.borrow_object(&1).unwrap();
        assert_eq!(again.id, a_id);
        let other = pool.borrow_object(&9).unwrap();
        assert_eq!(other.id, b_id);
        assert_eq!(factory.made(), 2);
        pool.return_object(again).unwrap();
        pool.return_object(other).unwrap();
    }

    #[test]
    fn pool_grows_before_reusing_a_mismatched_object() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);

        let a = pool.borrow_object(&1).unwrap();
        give_back(&pool, a, 1);
        let b = pool.borrow_object(&2).unwrap();
        assert_eq!(factory.made(), 2);
        pool.return_object(b).unwrap();
    }

    #[test]
    fn k_borrowers_never_block_and_the_next_one_does() {
        let factory = TestFactory::new();
        // Three secondaries beside the primary.
        let pool = pool(&factory, 4);
        let (tx, rx) = channel::unbounded();

        let holders: Vec<_> = (0..3u32)
            .map(|key| pool.borrow_object_timeout(&key, Duration::from_millis(50)).unwrap())
            .collect();
        assert_eq!(pool.metrics().total_waits, 0);

        let blocked = {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                let object = pool.borrow_object(&99).unwrap();
                tx.send(object.id).unwrap();
                pool.return_object(object).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        let mut holders = holders.into_iter();
        let first = holders.next().unwrap();
        let id = first.id;
        pool.return_object(first).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), id);
        blocked.join().unwrap();

        for object in holders {
            pool.return_object(object).unwrap();
        }
        assert_eq!(pool.metrics().total_waits, 1);
    }

    #[test]
    fn readers_never_wait_on_the_writer() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);

        let writer = pool.borrow_primary_object().unwrap();
        let reader = pool.borrow_object_timeout(&1, Duration::from_millis(50)).unwrap();
        assert!(!reader.is_primary());

        let second = pool.borrow_primary_object_timeout(Duration::from_millis(20));
        assert!(matches!(second, Err(PoolError::PoolExhausted(_))));
        let another_reader = pool.borrow_object_timeout(&2, Duration::from_millis(20));
        assert!(matches!(another_reader, Err(PoolError::PoolExhausted(_))));

        pool.return_object(writer).unwrap();
        pool.return_object(reader).unwrap();
    }

    #[test]
    fn primary_is_never_lent_to_a_reader() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);

        let writer = pool.borrow_primary_object().unwrap();
        pool.return_object(writer).unwrap();
        for key in 0..10 {
            let reader = pool.borrow_object(&key).unwrap();
            assert!(!reader.is_primary());
            give_back(&pool, reader, key);
        }
    }

    #[test]
    fn live_objects_stay_within_max_total() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);

        let workers: Vec<_> = (0..8u32)
            .map(|n| {
                let pool = Arc::clone(&pool);
                let factory = Arc::clone(&factory);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        let object = if i % 5 == 0 {
                            pool.borrow_primary_object().unwrap()
                        } else {
                            pool.borrow_object(&(n % 3)).unwrap()
                        };
                        assert!(factory.live() <= 3);
                        assert!(pool.metrics().live_objects() <= 3);
                        give_back(&pool, object, n % 3);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.borrowed_objects, 0);
        assert_eq!(metrics.total_borrowed, metrics.total_returned);
        assert!(factory.made() <= 3);
    }

    #[test]
    fn returned_object_goes_to_a_matching_waiter() {
        let factory = TestFactory::new();
        let pool = Arc::new(
            CommonObjectPool::new(
                factory.clone(),
                PoolConfiguration::new()
                    .with_max_total(2)
                    .with_fairness_threshold(Duration::from_secs(60))
                    .without_eviction(),
            )
            .unwrap(),
        );
        let held = pool.borrow_object(&1).unwrap();
        let (tx, rx) = channel::unbounded();

        let spawn_waiter = |key: u32| {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                let object = pool.borrow_object(&key).unwrap();
                tx.send(key).unwrap();
                give_back(&pool, object, key);
            })
        };
        let first = spawn_waiter(5);
        thread::sleep(Duration::from_millis(30));
        let second = spawn_waiter(7);
        thread::sleep(Duration::from_millis(30));

        give_back(&pool, held, 7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn starved_head_waiter_is_served_first() {
        let factory = TestFactory::new();
        let pool = Arc::new(
            CommonObjectPool::new(
                factory.clone(),
                PoolConfiguration::new()
                    .with_max_total(2)
                    .with_fairness_threshold(Duration::from_millis(1))
                    .without_eviction(),
            )
            .unwrap(),
        );
        let held = pool.borrow_object(&1).unwrap();
        let (tx, rx) = channel::unbounded();

        let spawn_waiter = |key: u32| {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                let object = pool.borrow_object(&key).unwrap();
                tx.send(key).unwrap();
                thread::sleep(Duration::from_millis(10));
                give_back(&pool, object, key);
            })
        };
        let first = spawn_waiter(5);
        thread::sleep(Duration::from_millis(30));
        let second = spawn_waiter(7);
        thread::sleep(Duration::from_millis(30));

        give_back(&pool, held, 7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn close_fails_blocked_borrowers() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);
        let held = pool.borrow_object(&1).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.borrow_object(&2))
        };
        thread::sleep(Duration::from_millis(20));

        let closer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.close())
        };
        assert_eq!(waiter.join().unwrap().unwrap_err(), PoolError::PoolClosed);

        pool.return_object(held).unwrap();
        closer.join().unwrap();
        assert_eq!(factory.live(), 0);
        assert_eq!(factory.closed(), 1);
        assert_eq!(pool.borrow_primary_object().unwrap_err(), PoolError::PoolClosed);
    }

    #[test]
    fn close_destroys_idle_objects_and_primary() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);
        let reader = pool.borrow_object(&1).unwrap();
        let writer = pool.borrow_primary_object().unwrap();
        pool.return_object(reader).unwrap();
        pool.return_object(writer).unwrap();

        pool.close();
        pool.close();
        assert_eq!(factory.made(), 2);
        assert_eq!(factory.destroyed(), 2);
        assert_eq!(factory.closed(), 1);
    }

    #[test]
    fn object_outliving_the_grace_is_destroyed_on_return() {
        let factory = TestFactory::new();
        let pool = CommonObjectPool::new(
            factory.clone(),
            PoolConfiguration::new()
                .with_max_total(2)
                .with_close_grace(Duration::from_millis(10))
                .without_eviction(),
        )
        .unwrap();
        let reader = pool.borrow_object(&1).unwrap();

        pool.close();
        assert_eq!(factory.destroyed(), 0);
        pool.return_object(reader).unwrap();
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn misuse_leaves_counts_untouched() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);

        let stranger = factory.make_object().unwrap();
        assert!(matches!(pool.return_object(stranger), Err(PoolError::Misuse(_))));

        let object = pool.borrow_object(&1).unwrap();
        let copy = object.clone();
        pool.return_object(object).unwrap();
        assert!(matches!(pool.return_object(copy), Err(PoolError::Misuse(_))));

        let writer = pool.borrow_primary_object().unwrap();
        let writer_copy = writer.clone();
        pool.return_object(writer).unwrap();
        assert!(matches!(pool.return_object(writer_copy), Err(PoolError::Misuse(_))));

        let metrics = pool.metrics();
        assert_eq!(metrics.idle_objects, 2);
        assert_eq!(metrics.borrowed_objects, 0);
        assert_eq!(metrics.total_returned, 2);
    }

    #[test]
    fn double_return_is_misuse_while_other_objects_are_lent() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);

        let a = pool.borrow_object(&1).unwrap();
        let b = pool.borrow_object(&2).unwrap();
        let copy = a.clone();
        pool.return_object(a).unwrap();
        assert!(matches!(pool.return_object(copy), Err(PoolError::Misuse(_))));
        pool.return_object(b).unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.idle_objects, 2);
        assert_eq!(metrics.borrowed_objects, 0);
        assert_eq!(metrics.total_returned, 2);
        pool.close();
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn tagged_stranger_is_misuse_while_the_own_object_is_lent() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);

        let own = pool.borrow_object(&1).unwrap();
        let mut stranger = factory.make_object().unwrap();
        stranger.tag = true;
        stranger.loan = own.loan + 1_000_000;
        assert!(matches!(pool.return_object(stranger), Err(PoolError::Misuse(_))));

        pool.return_object(own).unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.idle_objects, 1);
        assert_eq!(metrics.borrowed_objects, 0);
    }

    #[test]
    fn stale_copy_of_a_relent_object_is_misuse() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);

        let object = pool.borrow_object(&1).unwrap();
        let stale = object.clone();
        give_back(&pool, object, 1);
        let again = pool.borrow_object(&1).unwrap();
        assert_eq!(again.id, stale.id);
        assert_ne!(again.loan, stale.loan);

        assert!(matches!(pool.return_object(stale), Err(PoolError::Misuse(_))));
        pool.return_object(again).unwrap();
        assert_eq!(pool.metrics().idle_objects, 1);
    }

    #[test]
    fn drop_destroys_idle_objects_of_both_tiers() {
        let factory = TestFactory::new();
        {
            let pool = pool(&factory, 3);
            let writer = pool.borrow_primary_object().unwrap();
            let reader = pool.borrow_object(&1).unwrap();
            pool.return_object(reader).unwrap();
            pool.return_object(writer).unwrap();
            assert_eq!(factory.live(), 2);
        }
        assert_eq!(factory.live(), 0);
    }

    #[test]
    fn failed_creation_hands_the_slot_to_a_waiter() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 2);
        factory.fail(true);
        assert!(matches!(
            pool.borrow_object(&1),
            Err(PoolError::ResourceCreationFailed(_))
        ));
        factory.fail(false);

        let object = pool.borrow_object_timeout(&1, Duration::from_millis(50)).unwrap();
        pool.return_object(object).unwrap();
        assert_eq!(pool.metrics().live_objects(), 1);
    }

    #[test]
    fn eviction_respects_the_delay() {
        let factory = TestFactory::new();
        let pool = CommonObjectPool::new(
            factory.clone(),
            PoolConfiguration::new()
                .with_max_total(3)
                .with_eviction_delay(Duration::from_millis(50))
                .with_eviction_interval(Duration::from_millis(10)),
        )
        .unwrap();

        let object = pool.borrow_object(&1).unwrap();
        let id = object.id;
        give_back(&pool, object, 1);
        thread::sleep(Duration::from_millis(30));

        let again = pool.borrow_object(&1).unwrap();
        assert_eq!(again.id, id);
        assert_eq!(factory.destroyed(), 0);
        pool.return_object(again).unwrap();
        pool.close();
    }

    #[test]
    fn eviction_keeps_one_secondary_under_recent_demand() {
        let factory = TestFactory::new();
        let pool = CommonObjectPool::new(
            factory.clone(),
            PoolConfiguration::new()
                .with_max_total(4)
                .with_eviction_delay(Duration::ZERO)
                .with_eviction_interval(Duration::from_secs(60)),
        )
        .unwrap();

        let objects: Vec<_> = (0..3u32).map(|key| pool.borrow_object(&key).unwrap()).collect();
        for object in objects {
            pool.return_object(object).unwrap();
        }

        assert!(pool.evict());
        assert_eq!(factory.destroyed(), 2);
        assert_eq!(pool.metrics().idle_objects, 1);
        assert_eq!(pool.metrics().total_evicted, 2);
        pool.close();
    }

    #[test]
    fn scheduled_eviction_drains_an_unused_pool() {
        let factory = TestFactory::new();
        let pool = CommonObjectPool::new(
            factory.clone(),
            PoolConfiguration::new()
                .with_max_total(3)
                .with_eviction_delay(Duration::from_millis(20))
                .with_eviction_interval(Duration::from_millis(10)),
        )
        .unwrap();

        let a = pool.borrow_object(&1).unwrap();
        let b = pool.borrow_object(&2).unwrap();
        pool.return_object(a).unwrap();
        pool.return_object(b).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while factory.destroyed() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(factory.destroyed(), 2);
        assert_eq!(pool.metrics().idle_objects, 0);
    }

    #[test]
    fn clear_priorities() {
        let factory = TestFactory::new();
        let pool = pool(&factory, 3);
        let reader = pool.borrow_object(&1).unwrap();
        let writer = pool.borrow_primary_object().unwrap();
        give_back(&pool, reader, 1);
        pool.return_object(writer).unwrap();

        pool.clear(Priority::Low);
        let reader = pool.borrow_object(&1).unwrap();
        assert_eq!(reader.memory_releases, 1);
        give_back(&pool, reader, 1);
        assert_eq!(factory.destroyed(), 0);

        pool.clear(Priority::High);
        assert_eq!(factory.destroyed(), 2);
        let metrics = pool.metrics();
        assert_eq!(metrics.idle_objects, 0);
        assert_eq!(metrics.live_objects(), 0);
    }

    #[test]
    fn single_slot_common_pool_is_rejected() {
        let result: PoolResult<CommonObjectPool<u32, TestObject>> =
            CommonObjectPool::new(TestFactory::new(), PoolConfiguration::new().with_max_total(1));
        assert!(matches!(result, Err(PoolError::Misuse(_))));
    }
}
