//! Default values for every configuration option.

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// API host name (no scheme, no path).
pub const API_ENDPOINT: &str = "breadwinner.life";

/// API TCP port.
pub const API_PORT: u16 = 80;

/// Path prefix for data uploads; the category route is appended.
pub const API_PATH: &str = "/api/v1/";

/// Liveness endpoint path.
pub const HEALTH_ENDPOINT: &str = "/health";

/// Placeholder shipped in unprovisioned configs. Never a valid device id.
pub const DEVICE_ID_PLACEHOLDER: &str = "<YOUR DEVICE_ID>";

/// Header carrying the device id when placement is `header`.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

// ---------------------------------------------------------------------------
// Batching and quotas
// ---------------------------------------------------------------------------

/// Max events per upload batch.
pub const UPLOAD_BATCH_SIZE: usize = 25;

/// Upload attempts allowed per hour, across categories.
pub const UPLOADS_PER_HOUR: u32 = 4;

/// Vitals samples ingested per minute.
pub const SAMPLES_PER_MINUTE: u32 = 4;

/// Health pings per minute.
pub const PINGS_PER_MINUTE: u32 = 1;

/// Per-category backlog capacity.
pub const BUFFER_CAPACITY: usize = 500;

/// Consecutive failures before a path is reported degraded.
pub const DEGRADED_THRESHOLD: u32 = 3;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// HTTP connect timeout in seconds.
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout in seconds.
pub const HTTP_TIMEOUT_SECS: u64 = 15;

// ---------------------------------------------------------------------------
// State directory
// ---------------------------------------------------------------------------

/// Default state directory.
pub const STATE_DIR: &str = "/var/lib/vitals-agent";

/// Inbox file is compacted once fully consumed and larger than this.
pub const INBOX_COMPACT_BYTES: u64 = 64 * 1024;

/// Grace period for in-flight ticks after shutdown is requested.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;
