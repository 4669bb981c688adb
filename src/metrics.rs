//! Metrics collection and export for object pools

use crossbeam::utils::CachePadded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A snapshot of a pool's counters and gauges
///
/// # Examples
///
/// ```
/// use esox_sqlpool::PoolMetrics;
///
/// let metrics = PoolMetrics::default();
/// assert_eq!(metrics.live_objects(), 0);
/// assert!(metrics.export().contains_key("total_borrowed"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Successful borrows
    pub total_borrowed: usize,

    /// Successful returns
    pub total_returned: usize,

    /// Objects made by the factory
    pub total_created: usize,

    /// Objects handed back to the factory for destruction
    pub total_destroyed: usize,

    /// Objects destroyed because they sat idle too long
    pub total_evicted: usize,

    /// Borrows that had to block
    pub total_waits: usize,

    /// Objects currently lent out
    pub borrowed_objects: usize,

    /// Objects currently idle in the pool
    pub idle_objects: usize,

    /// Maximum number of live objects
    pub max_capacity: usize,
}

impl PoolMetrics {
    /// Objects made and not yet destroyed
    pub fn live_objects(&self) -> usize {
        self.total_created.saturating_sub(self.total_destroyed)
    }

    /// Merge the counters of a pool and the pool it delegates to
    pub(crate) fn combine(mut self, other: PoolMetrics) -> Self {
        self.total_borrowed += other.total_borrowed;
        self.total_returned += other.total_returned;
        self.total_created += other.total_created;
        self.total_destroyed += other.total_destroyed;
        self.total_evicted += other.total_evicted;
        self.total_waits += other.total_waits;
        self.borrowed_objects += other.borrowed_objects;
        self.idle_objects += other.idle_objects;
        self.max_capacity += other.max_capacity;
        self
    }

    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_borrowed".to_string(), self.total_borrowed.to_string());
        metrics.insert("total_returned".to_string(), self.total_returned.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("total_evicted".to_string(), self.total_evicted.to_string());
        metrics.insert("total_waits".to_string(), self.total_waits.to_string());
        metrics.insert("borrowed_objects".to_string(), self.borrowed_objects.to_string());
        metrics.insert("idle_objects".to_string(), self.idle_objects.to_string());
        metrics.insert("max_capacity".to_string(), self.max_capacity.to_string());
        metrics
    }

    /// Export metrics in Prometheus exposition format
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sqlpool::PoolMetrics;
    /// use std::collections::HashMap;
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("db".to_string(), "main".to_string());
    ///
    /// let output = PoolMetrics::default().export_prometheus("connections", Some(&tags));
    /// assert!(output.contains("sqlpool_objects_borrowed"));
    /// assert!(output.contains("db=\"main\""));
    /// ```
    pub fn export_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let labels = format_labels(pool_name, tags);
        let mut output = String::new();

        let gauges = [
            ("sqlpool_objects_borrowed", "Objects currently lent out", self.borrowed_objects),
            ("sqlpool_objects_idle", "Objects currently idle", self.idle_objects),
            ("sqlpool_objects_live", "Objects made and not yet destroyed", self.live_objects()),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} gauge\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        let counters = [
            ("sqlpool_borrows_total", "Total successful borrows", self.total_borrowed),
            ("sqlpool_returns_total", "Total successful returns", self.total_returned),
            ("sqlpool_created_total", "Total objects created", self.total_created),
            ("sqlpool_destroyed_total", "Total objects destroyed", self.total_destroyed),
            ("sqlpool_evicted_total", "Total idle evictions", self.total_evicted),
            ("sqlpool_waits_total", "Total borrows that blocked", self.total_waits),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {name} {help}\n"));
            output.push_str(&format!("# TYPE {name} counter\n"));
            output.push_str(&format!("{name}{{{labels}}} {value}\n"));
        }

        output
    }
}

fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
    let mut labels = vec![format!("pool=\"{}\"", pool_name)];

    if let Some(tags) = tags {
        let mut sorted: Vec<_> = tags.iter().collect();
        sorted.sort();
        for (key, value) in sorted {
            labels.push(format!("{}=\"{}\"", key, value));
        }
    }

    labels.join(",")
}

/// Internal metrics tracker
///
/// Counters are hammered by every borrowing thread, so each sits on its own
/// cache line.
#[derive(Default)]
pub(crate) struct MetricsTracker {
    total_borrowed: CachePadded<AtomicUsize>,
    total_returned: CachePadded<AtomicUsize>,
    total_created: CachePadded<AtomicUsize>,
    total_destroyed: CachePadded<AtomicUsize>,
    total_evicted: CachePadded<AtomicUsize>,
    total_waits: CachePadded<AtomicUsize>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_borrow(&self) {
        self.total_borrowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_return(&self) {
        self.total_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self, count: usize) {
        self.total_destroyed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.total_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.total_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, borrowed: usize, idle: usize, capacity: usize) -> PoolMetrics {
        PoolMetrics {
            total_borrowed: self.total_borrowed.load(Ordering::Relaxed),
            total_returned: self.total_returned.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_destroyed: self.total_destroyed.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
            total_waits: self.total_waits.load(Ordering::Relaxed),
            borrowed_objects: borrowed,
            idle_objects: idle,
            max_capacity: capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_snapshot_reflects_counters() {
        let tracker = MetricsTracker::new();
        tracker.record_created();
        tracker.record_created();
        tracker.record_borrow();
        tracker.record_destroyed(1);
        tracker.record_evicted(1);

        let metrics = tracker.snapshot(1, 0, 3);
        assert_eq!(metrics.total_created, 2);
        assert_eq!(metrics.live_objects(), 1);
        assert_eq!(metrics.total_evicted, 1);
        assert_eq!(metrics.max_capacity, 3);
    }

    #[test]
    fn combine_adds_both_tiers() {
        let primary = PoolMetrics {
            total_created: 1,
            max_capacity: 1,
            ..Default::default()
        };
        let secondary = PoolMetrics {
            total_created: 2,
            borrowed_objects: 2,
            max_capacity: 3,
            ..Default::default()
        };

        let combined = secondary.combine(primary);
        assert_eq!(combined.total_created, 3);
        assert_eq!(combined.max_capacity, 4);
        assert_eq!(combined.borrowed_objects, 2);
    }

    #[test]
    fn prometheus_labels_are_sorted() {
        let mut tags = HashMap::new();
        tags.insert("b".to_string(), "2".to_string());
        tags.insert("a".to_string(), "1".to_string());

        let output = PoolMetrics::default().export_prometheus("p", Some(&tags));
        assert!(output.contains("sqlpool_waits_total{pool=\"p\",a=\"1\",b=\"2\"} 0"));
    }
}
