//! Constants for rainbot storage
//!
//! Defaults for every env-configurable knob live here so `Default` impls and
//! `from_env()` readers agree.

// ============================================================================
// DATABASE
// ============================================================================

/// Default PostgreSQL host
pub const DEFAULT_DB_HOST: &str = "localhost";

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default database name
pub const DEFAULT_DB_NAME: &str = "rainbot";

/// Default database user
pub const DEFAULT_DB_USER: &str = "postgres";

/// Default maximum pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default time allowed to establish a connection (seconds)
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default table holding per-guild config documents
pub const DEFAULT_GUILDS_TABLE: &str = "guilds";

/// Default table holding per-user documents
pub const DEFAULT_USERS_TABLE: &str = "users";

// ============================================================================
// STORE OPERATIONS
// ============================================================================

/// Default deadline for a single remote store operation (milliseconds)
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5_000;

/// Bounded queue length in front of the cache actor
pub const DEFAULT_CACHE_CHANNEL_CAPACITY: usize = 1_024;

/// Buffered change events per in-memory subscriber before it lags
pub const DEFAULT_FEED_BUFFER: usize = 1_024;

// ============================================================================
// CHANGE FEED
// ============================================================================

/// First reconnect delay after a change feed failure (milliseconds)
pub const DEFAULT_FEED_INITIAL_BACKOFF_MS: u64 = 500;

/// Upper bound for the reconnect delay (milliseconds)
pub const DEFAULT_FEED_MAX_BACKOFF_MS: u64 = 30_000;

/// Growth factor applied to the reconnect delay after each failure
pub const DEFAULT_FEED_BACKOFF_MULTIPLIER: f64 = 2.0;
