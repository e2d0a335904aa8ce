//! System-wide constants for the Escrowline settlement engine.

/// Default SLA after delivery before held funds auto-release (48 hours).
pub const DEFAULT_AUTO_RELEASE_SLA_SECS: u64 = 48 * 60 * 60;

/// Default interval between scheduled auto-release passes.
pub const DEFAULT_AUTO_RELEASE_INTERVAL_SECS: u64 = 300;

/// How long an uncommitted idempotency reservation blocks retries.
pub const DEFAULT_IDEMPOTENCY_RESERVATION_TTL_SECS: u64 = 30;

/// How long the idempotency store keeps a committed key before purging it.
/// Older keys are still matched against the orders that carry them.
pub const DEFAULT_IDEMPOTENCY_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Scheduled flushes a queued audit entry gets before it is dead-lettered.
pub const DEFAULT_AUDIT_RETRY_LIMIT: u32 = 5;

/// Maximum line items accepted on a single order.
pub const DEFAULT_MAX_ITEMS_PER_ORDER: usize = 100;

/// Maximum length of a caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Maximum length of dispute / refund reason text.
pub const MAX_REASON_LEN: usize = 2000;

/// Default page size for admin escrow listings.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

/// Upper bound on page size for admin escrow listings.
pub const MAX_PAGE_LIMIT: usize = 100;

/// Optimistic retries when a status write loses a race to a compatible writer.
pub const MAX_TRANSITION_RETRIES: usize = 3;

/// Default API listen port.
pub const DEFAULT_API_PORT: u16 = 8080;

/// Actor id used for scheduler-driven transitions.
pub const SYSTEM_ACTOR_LABEL: &str = "SYSTEM";

/// Version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine name.
pub const ENGINE_NAME: &str = "Escrowline";
