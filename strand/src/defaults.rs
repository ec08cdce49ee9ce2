//! Default configuration values - single source of truth

/// Default MySQL port
pub const PORT: u16 = 3306;

/// Core connections per role entry
pub const NUM_CONNECTION: usize = 1;

/// Upper bound per role entry; 0 means "no bench connections"
pub const MAX_NUM_CONNECTION: usize = 0;

/// Waiters allowed before the backpressure gate closes
pub const CONNECTION_WAITING_LIST_SIZE: usize = 200;

/// Seconds a caller may wait for a free connection
pub const CONNECTION_WAITING_TIME: u64 = 15;

/// Seconds a query may run before it is timed out
pub const MAX_EXECUTION_TIME: u64 = 30;

/// Seconds between reaper passes
pub const REAPER_INTERVAL: u64 = 30;

/// Seconds after which an open core connection is recycled
pub const CORE_MAX_AGE: u64 = 1800;

/// Seconds of idleness after which a core connection is pinged
pub const CORE_PING_AFTER: u64 = 60;

/// Seconds of idleness after which a bench connection is closed
pub const BENCH_MAX_IDLE: u64 = 30;

/// Recycled coroutine objects kept beyond which trimming starts
pub const COROUTINE_MAX_POOL_SIZE: usize = 16;

/// Seconds a pooled coroutine may sit unused before it can be trimmed
pub const COROUTINE_MAX_TIME_IDLE: u64 = 30;

/// Seconds a coroutine may live before it is cancelled
pub const COROUTINE_TIMEOUT: u64 = 30;

/// Prefix for environment overrides (STRAND_*)
pub const ENV_PREFIX: &str = "STRAND";

/// Config file looked up when no path is given
pub const CONFIG_FILE: &str = "strand";
