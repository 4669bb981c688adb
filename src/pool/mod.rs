//! Keyed object pools with one primary (writer) slot

mod common;
mod single;

#[cfg(test)]
pub(crate) mod testing;

pub use common::CommonObjectPool;
pub use single::SingleObjectPool;

use crate::config::PoolConfiguration;
use crate::errors::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;

use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// Zero is never handed out, so a freshly made object is on no loan.
static NEXT_LOAN: AtomicU64 = AtomicU64::new(1);

/// Longest single sleep of a blocked borrower before it re-checks the pool
pub const BORROW_WAIT_SLICE: Duration = Duration::from_millis(100);

/// How hard [`ObjectPool::clear`] should try to give memory back
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Ask idle objects to shrink their caches
    Low,
    /// Also destroy every idle object
    High,
}

/// An object a pool can manage
pub trait PooledResource<K>: Send {
    /// Whether this is the single writer instance
    fn is_primary(&self) -> bool;

    /// Whether this object is a good fit for a borrow made with `key`
    fn matches(&self, key: &K) -> bool;

    /// True while the object is lent out
    fn tag(&self) -> bool;

    fn set_tag(&mut self, tag: bool);

    /// The loan this object is out on, as stamped by the lending pool
    fn loan(&self) -> u64;

    fn set_loan(&mut self, loan: u64);

    /// Shrink internal caches without destroying the object
    fn release_memory(&mut self);
}

/// Makes and destroys the objects of a pool
pub trait ResourceFactory<T>: Send + Sync {
    fn make_object(&self) -> PoolResult<T>;

    /// Make the one object that reports `is_primary() == true`
    fn make_primary_object(&self) -> PoolResult<T>;

    fn destroy_object(&self, object: T) -> PoolResult<()>;

    /// Release factory-wide resources, called once by the outermost pool
    fn close(&self) {}
}

/// The borrow/return surface shared by every pool
pub trait ObjectPool<K, T>: Send + Sync {
    /// Borrow a secondary object, blocking until one is available or the pool closes
    fn borrow_object(&self, key: &K) -> PoolResult<T>;

    /// Like [`borrow_object`](Self::borrow_object) but fail with
    /// [`PoolError::PoolExhausted`] after `timeout`
    fn borrow_object_timeout(&self, key: &K, timeout: Duration) -> PoolResult<T>;

    /// Borrow the primary object
    fn borrow_primary_object(&self) -> PoolResult<T>;

    fn borrow_primary_object_timeout(&self, timeout: Duration) -> PoolResult<T>;

    /// Hand a borrowed object back
    ///
    /// Every loan is stamped on the object and recorded by the pool. Returning
    /// an object whose loan the pool has no record of, because it was never
    /// lent here or was already returned, fails with [`PoolError::Misuse`] and
    /// leaves the pool's counts untouched.
    fn return_object(&self, object: T) -> PoolResult<()>;

    fn clear(&self, priority: Priority);

    /// Destroy idle objects, fail pending borrowers and refuse new borrows
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn metrics(&self) -> PoolMetrics;
}

/// Create the pool fitting `config`
///
/// A pool of one object routes every borrow to that object. Larger pools keep
/// the primary object aside for writer borrows and lend the rest to readers.
///
/// # Examples
///
/// ```
/// use esox_sqlpool::{create_object_pool, ObjectPool, PoolConfiguration, PooledResource, ResourceFactory, PoolResult};
/// use std::sync::Arc;
///
/// struct Buffer { primary: bool, tag: bool, loan: u64 }
///
/// impl PooledResource<u32> for Buffer {
///     fn is_primary(&self) -> bool { self.primary }
///     fn matches(&self, _key: &u32) -> bool { true }
///     fn tag(&self) -> bool { self.tag }
///     fn set_tag(&mut self, tag: bool) { self.tag = tag }
///     fn loan(&self) -> u64 { self.loan }
///     fn set_loan(&mut self, loan: u64) { self.loan = loan }
///     fn release_memory(&mut self) {}
/// }
///
/// struct Buffers;
///
/// impl ResourceFactory<Buffer> for Buffers {
///     fn make_object(&self) -> PoolResult<Buffer> { Ok(Buffer { primary: false, tag: false, loan: 0 }) }
///     fn make_primary_object(&self) -> PoolResult<Buffer> { Ok(Buffer { primary: true, tag: false, loan: 0 }) }
///     fn destroy_object(&self, _buffer: Buffer) -> PoolResult<()> { Ok(()) }
/// }
///
/// let pool = create_object_pool::<u32, Buffer>(Arc::new(Buffers), PoolConfiguration::new().without_eviction()).unwrap();
/// let reader = pool.borrow_object(&7).unwrap();
/// assert!(!reader.is_primary());
/// pool.return_object(reader).unwrap();
/// pool.close();
/// ```
pub fn create_object_pool<K, T>(
    factory: Arc<dyn ResourceFactory<T>>,
    config: PoolConfiguration,
) -> PoolResult<Box<dyn ObjectPool<K, T>>>
where
    K: Clone + Send + Sync + 'static,
    T: PooledResource<K> + 'static,
{
    config.validate()?;
    if config.max_total == 1 {
        Ok(Box::new(SingleObjectPool::new(factory, config)?))
    } else {
        Ok(Box::new(CommonObjectPool::new(factory, config)?))
    }
}

/// A borrowed object that goes back to its pool when dropped
pub struct Lease<'a, K, T: PooledResource<K>> {
    object: Option<T>,
    pool: &'a dyn ObjectPool<K, T>,
}

impl<'a, K, T: PooledResource<K>> Lease<'a, K, T> {
    pub fn new(pool: &'a dyn ObjectPool<K, T>, object: T) -> Self {
        Self {
            object: Some(object),
            pool,
        }
    }

    /// Return the object now, surfacing any error the pool reports
    pub fn release(mut self) -> PoolResult<()> {
        match self.object.take() {
            Some(object) => self.pool.return_object(object),
            None => Ok(()),
        }
    }
}

impl<K, T: PooledResource<K>> Deref for Lease<'_, K, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.object.as_ref().expect("lease already released")
    }
}

impl<K, T: PooledResource<K>> DerefMut for Lease<'_, K, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object.as_mut().expect("lease already released")
    }
}

impl<K, T: PooledResource<K>> Drop for Lease<'_, K, T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            if let Err(e) = self.pool.return_object(object) {
                tracing::warn!(error = %e, "failed to return leased object");
            }
        }
    }
}

/// The point a bounded borrow gives up
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }
}

/// How long a blocked borrower may sleep before looking at the pool again
pub(crate) fn next_wait(deadline: Option<&Deadline>) -> PoolResult<Duration> {
    match deadline {
        None => Ok(BORROW_WAIT_SLICE),
        Some(deadline) => {
            let remaining = deadline.at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                Err(PoolError::PoolExhausted(deadline.timeout))
            } else {
                Ok(remaining.min(BORROW_WAIT_SLICE))
            }
        }
    }
}

/// Stamp `object` with a fresh loan and record it in `active`
pub(crate) fn stamp_loan<K, T: PooledResource<K>>(active: &DashMap<u64, ()>, object: &mut T) {
    let loan = NEXT_LOAN.fetch_add(1, Ordering::Relaxed);
    object.set_loan(loan);
    object.set_tag(true);
    active.insert(loan, ());
}

/// Close the loan `object` is out on; false if `active` has no record of it
pub(crate) fn settle_loan<K, T: PooledResource<K>>(active: &DashMap<u64, ()>, object: &mut T) -> bool {
    if !object.tag() || active.remove(&object.loan()).is_none() {
        return false;
    }
    object.set_tag(false);
    object.set_loan(0);
    true
}

pub(crate) fn creation_failed(error: PoolError) -> PoolError {
    match error {
        PoolError::ResourceCreationFailed(_) => error,
        other => PoolError::ResourceCreationFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{TestFactory, TestObject};
    use super::*;

    #[test]
    fn pool_of_one_routes_readers_to_the_primary() {
        let factory = TestFactory::new();
        let pool = create_object_pool::<u32, TestObject>(
            factory.clone(),
            PoolConfiguration::new().with_max_total(1).without_eviction(),
        )
        .unwrap();

        let object = pool.borrow_object(&1).unwrap();
        assert!(object.is_primary());
        pool.return_object(object).unwrap();
        assert_eq!(factory.made(), 1);
    }

    #[test]
    fn larger_pools_keep_the_primary_aside() {
        let factory = TestFactory::new();
        let pool = create_object_pool::<u32, TestObject>(
            factory.clone(),
            PoolConfiguration::new().with_max_total(2).without_eviction(),
        )
        .unwrap();

        let reader = pool.borrow_object(&1).unwrap();
        let writer = pool.borrow_primary_object().unwrap();
        assert!(!reader.is_primary());
        assert!(writer.is_primary());
        pool.return_object(reader).unwrap();
        pool.return_object(writer).unwrap();
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let result = create_object_pool::<u32, TestObject>(
            TestFactory::new(),
            PoolConfiguration::new().with_max_total(0),
        );
        assert!(matches!(result, Err(PoolError::Misuse(_))));
    }

    #[test]
    fn lease_returns_on_drop() {
        let pool = create_object_pool::<u32, TestObject>(
            TestFactory::new(),
            PoolConfiguration::new().with_max_total(3).without_eviction(),
        )
        .unwrap();

        {
            let mut lease = Lease::new(pool.as_ref(), pool.borrow_object(&1).unwrap());
            lease.key = Some(1);
            assert_eq!(pool.metrics().borrowed_objects, 1);
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.borrowed_objects, 0);
        assert_eq!(metrics.idle_objects, 1);
    }

    #[test]
    fn bounded_wait_reports_its_timeout() {
        let deadline = Deadline::after(Duration::ZERO);
        assert_eq!(
            next_wait(Some(&deadline)),
            Err(PoolError::PoolExhausted(Duration::ZERO))
        );
        assert_eq!(next_wait(None), Ok(BORROW_WAIT_SLICE));
    }
}
