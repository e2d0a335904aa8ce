//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EscrowlineError, Result, constants};

/// Tunables for the settlement engine. Every field has a default, so a
/// partial config file only overrides what it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long after delivery an undisputed escrow auto-releases.
    pub auto_release_sla_secs: u64,
    /// Interval between scheduled auto-release passes.
    pub auto_release_interval_secs: u64,
    /// Lifetime of an uncommitted idempotency reservation.
    pub idempotency_reservation_ttl_secs: u64,
    /// How long the idempotency store keeps a committed key.
    pub idempotency_retention_secs: u64,
    /// Scheduled flushes before a queued audit entry is dead-lettered.
    pub audit_retry_limit: u32,
    /// Line item cap per order.
    pub max_items_per_order: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_release_sla_secs: constants::DEFAULT_AUTO_RELEASE_SLA_SECS,
            auto_release_interval_secs: constants::DEFAULT_AUTO_RELEASE_INTERVAL_SECS,
            idempotency_reservation_ttl_secs: constants::DEFAULT_IDEMPOTENCY_RESERVATION_TTL_SECS,
            idempotency_retention_secs: constants::DEFAULT_IDEMPOTENCY_RETENTION_SECS,
            audit_retry_limit: constants::DEFAULT_AUDIT_RETRY_LIMIT,
            max_items_per_order: constants::DEFAULT_MAX_ITEMS_PER_ORDER,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn auto_release_sla(&self) -> Duration {
        Duration::from_secs(self.auto_release_sla_secs)
    }

    #[must_use]
    pub fn auto_release_interval(&self) -> Duration {
        Duration::from_secs(self.auto_release_interval_secs)
    }

    #[must_use]
    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_reservation_ttl_secs)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.idempotency_retention_secs)
    }

    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    /// [`EscrowlineError::Configuration`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("auto_release_interval_secs", self.auto_release_interval_secs == 0),
            (
                "idempotency_reservation_ttl_secs",
                self.idempotency_reservation_ttl_secs == 0,
            ),
            ("audit_retry_limit", self.audit_retry_limit == 0),
            ("max_items_per_order", self.max_items_per_order == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(EscrowlineError::Configuration(format!(
                "{field} must be greater than zero"
            )));
        }
        if self.idempotency_retention_secs < self.idempotency_reservation_ttl_secs {
            return Err(EscrowlineError::Configuration(
                "idempotency_retention_secs must not be shorter than the reservation ttl".into(),
            ));
        }
        Ok(())
    }
}
