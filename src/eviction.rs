//! Shared background timer that drives idle eviction for every pool

use crate::errors::{PoolError, PoolResult};

use dashmap::DashMap;
use parking_lot::{const_mutex, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

static SHARED: Mutex<Weak<EvictionScheduler>> = const_mutex(Weak::new());

/// A process-wide owner of periodic eviction tasks
///
/// The scheduler starts when the first pool acquires it and shuts its runtime
/// down once the last pool holding it lets go, so nothing outlives the pools
/// it serves.
///
/// # Examples
///
/// ```
/// use esox_sqlpool::EvictionScheduler;
/// use std::sync::Arc;
///
/// let a = EvictionScheduler::shared().unwrap();
/// let b = EvictionScheduler::shared().unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct EvictionScheduler {
    runtime: Option<Runtime>,
    tasks: Arc<DashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl EvictionScheduler {
    /// Get the running scheduler, starting one if no pool holds it
    pub fn shared() -> PoolResult<Arc<Self>> {
        let mut shared = SHARED.lock();
        if let Some(scheduler) = shared.upgrade() {
            return Ok(scheduler);
        }
        let scheduler = Arc::new(Self::start()?);
        *shared = Arc::downgrade(&scheduler);
        Ok(scheduler)
    }

    fn start() -> PoolResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("esox-evictor")
            .enable_time()
            .build()
            .map_err(|e| PoolError::SchedulerUnavailable(e.to_string()))?;
        tracing::debug!("eviction scheduler started");
        Ok(Self {
            runtime: Some(runtime),
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Run `task` every `interval`, first after `delay`
    ///
    /// The task runs on a blocking thread since it may close native
    /// resources. It keeps being scheduled while it returns `true`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        delay: Duration,
        interval: Duration,
        task: F,
    ) -> PoolResult<EvictionHandle>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| PoolError::SchedulerUnavailable("scheduler is shut down".into()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(task);
        let tasks = Arc::clone(&self.tasks);

        let join = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let task = Arc::clone(&task);
                match tokio::task::spawn_blocking(move || task()).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "eviction task failed");
                        break;
                    }
                }
            }
            tasks.remove(&id);
        });

        let abort = join.abort_handle();
        self.tasks.insert(id, abort.clone());
        Ok(EvictionHandle {
            id,
            abort,
            tasks: Arc::downgrade(&self.tasks),
        })
    }

    /// Number of periodic tasks still scheduled
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.value().abort();
        }
        self.tasks.clear();
        if let Some(runtime) = self.runtime.take() {
            // The last holder may be a task running on this very runtime.
            runtime.shutdown_background();
        }
        tracing::debug!("eviction scheduler stopped");
    }
}

/// Cancels a scheduled eviction task
#[derive(Debug)]
pub struct EvictionHandle {
    id: u64,
    abort: AbortHandle,
    tasks: Weak<DashMap<u64, AbortHandle>>,
}

impl EvictionHandle {
    pub fn cancel(&self) {
        self.abort.abort();
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.remove(&self.id);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}
