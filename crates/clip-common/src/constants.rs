//! Shared constants used across the clip crates.

/// Block size used by the remote backend and the content cache (1 MiB).
/// Ranged GETs are aligned to this boundary.
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Default ceiling for the on-disk content cache (8 GiB).
pub const DEFAULT_CACHE_CEILING: u64 = 8 * 1024 * 1024 * 1024;

/// Attribute and entry timeout handed to the kernel (seconds).
/// The mounted tree never changes, so long timeouts are safe.
pub const DEFAULT_KERNEL_TTL_SECS: u64 = 60;

/// Per-request timeout for remote block fetches (seconds).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
