use once_cell::sync::Lazy;

/// Specifies how often the load balancer looks for leases to acquire, in seconds.
pub static ACQUIRE_INTERVAL_SECS: Lazy<u64> = lazy_env_parse!("WEIR_ACQUIRE_INTERVAL_SECS", u64, 13);

/// Specifies the age in seconds above which a lease is considered abandoned by its owner.
pub static EXPIRATION_INTERVAL_SECS: Lazy<u64> =
	lazy_env_parse!("WEIR_EXPIRATION_INTERVAL_SECS", u64, 60);

/// Specifies how often an owned lease is renewed, in seconds.
pub static RENEW_INTERVAL_SECS: Lazy<u64> = lazy_env_parse!("WEIR_RENEW_INTERVAL_SECS", u64, 17);

/// Specifies how long a partition processor sleeps after an empty feed read, in milliseconds.
pub static POLL_INTERVAL_MILLIS: Lazy<u64> =
	lazy_env_parse!("WEIR_POLL_INTERVAL_MILLIS", u64, 5000);

/// Specifies the page size hint for change feed reads.
pub static MAX_ITEM_COUNT: Lazy<u32> = lazy_env_parse!("WEIR_MAX_ITEM_COUNT", u32, 100);

/// Specifies the TTL in seconds placed on the bootstrap lock item.
pub static INIT_LOCK_TTL_SECS: Lazy<u64> = lazy_env_parse!("WEIR_INIT_LOCK_TTL_SECS", u64, 60);

/// Specifies how long a contending host waits before re-polling the bootstrap marker, in milliseconds.
pub static INIT_RETRY_MILLIS: Lazy<u64> = lazy_env_parse!("WEIR_INIT_RETRY_MILLIS", u64, 5000);

/// Specifies how many leases the backlog estimator inspects concurrently.
pub static ESTIMATOR_PARALLELISM: Lazy<usize> = lazy_env_parse!("WEIR_ESTIMATOR_PARALLELISM", usize, 25);

/// The number of times a conditional lease write is retried when the stamp
/// moved but the lease is still owned by this instance.
pub const LEASE_CONFLICT_RETRIES: u32 = 5;

/// The default namespace prefix for lease, marker and lock item identifiers.
pub const DEFAULT_LEASE_PREFIX: &str = "weir";
