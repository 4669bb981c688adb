//! Pool and database configuration options

use crate::errors::{PoolError, PoolResult};
use std::time::Duration;

/// Configuration for object pool behavior
///
/// # Examples
///
/// ```
/// use esox_sqlpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_total(4)
///     .with_eviction_delay(Duration::from_millis(500))
///     .with_eviction_interval(Duration::from_secs(5));
///
/// assert_eq!(config.max_total, 4);
/// assert_eq!(config.eviction_interval, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfiguration {
    /// Minimum idle time before an object becomes eligible for eviction
    pub eviction_delay: Duration,

    /// Period of the eviction task, `None` to never evict idle objects
    pub eviction_interval: Option<Duration>,

    /// Upper bound on live objects, the primary included
    pub max_total: usize,

    /// How long the oldest blocked borrower may be passed over in favour of
    /// borrowers whose key matches a returned object
    pub fairness_threshold: Duration,

    /// How long `close` waits for lent objects to come back
    pub close_grace: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            eviction_delay: Duration::from_secs(1),
            eviction_interval: Some(Duration::from_secs(20)),
            max_total: 4,
            fairness_threshold: Duration::from_millis(10),
            close_grace: Duration::from_millis(250),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of live objects
    pub fn with_max_total(mut self, max_total: usize) -> Self {
        self.max_total = max_total;
        self
    }

    /// Set the idle time after which an object may be evicted
    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay = delay;
        self
    }

    /// Set the period of the eviction task
    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = Some(interval);
        self
    }

    /// Never evict idle objects
    pub fn without_eviction(mut self) -> Self {
        self.eviction_interval = None;
        self
    }

    pub fn with_fairness_threshold(mut self, threshold: Duration) -> Self {
        self.fairness_threshold = threshold;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Check the invariants a pool relies on
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_total == 0 {
            return Err(PoolError::misuse("pool configuration must allow at least one object"));
        }
        if self.eviction_interval == Some(Duration::ZERO) {
            return Err(PoolError::misuse("eviction interval must be positive"));
        }
        Ok(())
    }
}

/// Journal modes understood by the engine
///
/// Each mode implies a reader/writer policy: only the write-ahead log lets
/// readers run beside the writer, so it is the only mode with a multi-connection
/// default configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalMode {
    Delete,
    Memory,
    Off,
    Persist,
    Truncate,
    Wal,
}

impl JournalMode {
    /// The value understood by `PRAGMA journal_mode`
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Memory => "MEMORY",
            JournalMode::Off => "OFF",
            JournalMode::Persist => "PERSIST",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Wal => "WAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DELETE" => Some(JournalMode::Delete),
            "MEMORY" => Some(JournalMode::Memory),
            "OFF" => Some(JournalMode::Off),
            "PERSIST" => Some(JournalMode::Persist),
            "TRUNCATE" => Some(JournalMode::Truncate),
            "WAL" => Some(JournalMode::Wal),
            _ => None,
        }
    }

    /// The default database configuration for this mode
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_sqlpool::JournalMode;
    ///
    /// assert_eq!(JournalMode::Wal.database_configuration().max_connection_pool_size, 4);
    /// assert_eq!(JournalMode::Delete.database_configuration().max_connection_pool_size, 1);
    /// ```
    pub fn database_configuration(&self) -> DatabaseConfiguration {
        match self {
            JournalMode::Wal => DatabaseConfiguration::multiple_connections(),
            JournalMode::Memory => DatabaseConfiguration::single_connection().persistent(),
            _ => DatabaseConfiguration::single_connection(),
        }
    }
}

/// Values for `PRAGMA secure_delete`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureDelete {
    Off,
    On,
    Fast,
}

impl SecureDelete {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecureDelete::Off => "OFF",
            SecureDelete::On => "ON",
            SecureDelete::Fast => "FAST",
        }
    }
}

/// A busy timeout long enough to ride out a WAL auto-checkpoint on slow storage
pub const COMMON_BUSY_TIMEOUT: Duration = Duration::from_millis(2_500);

/// The classic compile-time bound on host parameters per statement
pub const DEFAULT_MAX_BOUND_PARAMETERS: usize = 999;

/// Configuration for a [`SqlDatabase`](crate::SqlDatabase)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfiguration {
    /// How long a connection waits on a locked database before giving up
    pub busy_timeout: Duration,

    pub eviction_delay: Duration,

    /// Period of idle connection eviction runs, `None` for never
    pub eviction_interval: Option<Duration>,

    /// Connections in the pool, the writer included
    pub max_connection_pool_size: usize,

    /// Prepared statements cached per connection
    pub max_sql_cache_size: usize,

    /// Upper bound on host parameters used when flattening multi-row inserts
    pub max_bound_parameters: usize,

    pub secure_delete: SecureDelete,

    /// Give up borrowing a connection after this long, `None` to wait until close
    pub borrow_wait_timeout: Option<Duration>,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self::multiple_connections()
    }
}

impl DatabaseConfiguration {
    fn multiple_connections() -> Self {
        Self {
            busy_timeout: COMMON_BUSY_TIMEOUT,
            eviction_delay: Duration::from_secs(1),
            eviction_interval: Some(Duration::from_secs(20)),
            max_connection_pool_size: 4,
            max_sql_cache_size: 8,
            max_bound_parameters: DEFAULT_MAX_BOUND_PARAMETERS,
            secure_delete: SecureDelete::Fast,
            borrow_wait_timeout: None,
        }
    }

    fn single_connection() -> Self {
        Self {
            busy_timeout: Duration::ZERO,
            max_connection_pool_size: 1,
            ..Self::multiple_connections()
        }
    }

    fn persistent(mut self) -> Self {
        self.eviction_interval = None;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_max_connection_pool_size(mut self, size: usize) -> Self {
        self.max_connection_pool_size = size;
        self
    }

    pub fn with_max_sql_cache_size(mut self, size: usize) -> Self {
        self.max_sql_cache_size = size;
        self
    }

    pub fn with_max_bound_parameters(mut self, max: usize) -> Self {
        self.max_bound_parameters = max;
        self
    }

    pub fn with_eviction(mut self, delay: Duration, interval: Duration) -> Self {
        self.eviction_delay = delay;
        self.eviction_interval = Some(interval);
        self
    }

    pub fn without_eviction(self) -> Self {
        self.persistent()
    }

    pub fn with_secure_delete(mut self, secure_delete: SecureDelete) -> Self {
        self.secure_delete = secure_delete;
        self
    }

    pub fn with_borrow_wait_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_wait_timeout = Some(timeout);
        self
    }

    /// The pool configuration backing the connection pool
    pub fn to_pool_configuration(&self) -> PoolConfiguration {
        PoolConfiguration {
            eviction_delay: self.eviction_delay,
            eviction_interval: self.eviction_interval,
            max_total: self.max_connection_pool_size,
            ..PoolConfiguration::default()
        }
    }
}
