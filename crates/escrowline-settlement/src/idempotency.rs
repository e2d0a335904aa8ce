//! Idempotency store for order creation.
//!
//! A key moves through two states:
//!
//! - **Pending**: reserved by an in-flight request. Expires after the
//!   reservation TTL so a crashed request never burns the key for good.
//! - **Committed**: bound to the order it created. Retries get that order
//!   back instead of a new one. The entry is purged after the retention
//!   window; the order keeps the key, so the engine still recognises a
//!   late retry through [`crate::orders::OrderLifecycle::find_by_key`].
//!
//! Keys are scoped per actor: the same key from two users is two
//! independent reservations.

use chrono::{DateTime, Duration, Utc};
use escrowline_types::{EscrowlineError, IdempotencyKey, OrderId, Result, UserId};
use tracing::{debug, warn};

use crate::ttl_store::TtlStore;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Fresh key; the caller owns it until commit or revoke.
    Reserved,
    /// The key already produced this order.
    Existing(OrderId),
}

impl Reservation {
    #[must_use]
    pub fn existing_order_id(self) -> Option<OrderId> {
        match self {
            Self::Reserved => None,
            Self::Existing(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Pending,
    Committed(OrderId),
}

pub trait IdempotencyStore: Send + Sync {
    /// Atomic check-and-set on `(actor, key)`.
    ///
    /// # Errors
    /// [`EscrowlineError::IdempotencyInFlight`] while another reservation of
    /// the same key is pending.
    fn reserve(&self, key: &IdempotencyKey, actor: UserId, now: DateTime<Utc>) -> Result<Reservation>;

    /// Bind a pending reservation to the order it created.
    ///
    /// # Errors
    /// [`EscrowlineError::IdempotencyUnavailable`] if the reservation is
    /// gone (expired or revoked) or the backend failed.
    fn commit(
        &self,
        key: &IdempotencyKey,
        actor: UserId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Release a pending reservation so the key can be retried.
    fn revoke(&self, key: &IdempotencyKey, actor: UserId);

    /// Physically drop expired entries. Returns how many.
    fn purge_expired(&self, now: DateTime<Utc>) -> usize;
}

/// [`IdempotencyStore`] over an in-process [`TtlStore`].
pub struct InMemoryIdempotencyStore {
    entries: TtlStore<(UserId, IdempotencyKey), KeyState>,
    reservation_ttl: Duration,
    retention: Duration,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new(reservation_ttl: std::time::Duration, retention: std::time::Duration) -> Self {
        Self {
            entries: TtlStore::new(),
            reservation_ttl: to_chrono(reservation_ttl),
            retention: to_chrono(retention),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::weeks(52 * 100))
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn reserve(&self, key: &IdempotencyKey, actor: UserId, now: DateTime<Utc>) -> Result<Reservation> {
        let expires_at = now + self.reservation_ttl;
        let outcome = self
            .entries
            .check_and_set((actor, key.clone()), now, |current| match current {
                None => (Some((KeyState::Pending, expires_at)), Ok(Reservation::Reserved)),
                Some(KeyState::Committed(order_id)) => (None, Ok(Reservation::Existing(*order_id))),
                Some(KeyState::Pending) => (
                    None,
                    Err(EscrowlineError::IdempotencyInFlight {
                        key: key.to_string(),
                    }),
                ),
            });
        debug!(%key, %actor, ?outcome, "Idempotency reservation");
        outcome
    }

    fn commit(
        &self,
        key: &IdempotencyKey,
        actor: UserId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expires_at = now + self.retention;
        self.entries
            .check_and_set((actor, key.clone()), now, |current| match current {
                Some(KeyState::Pending) => {
                    (Some((KeyState::Committed(order_id), expires_at)), Ok(()))
                }
                // Already rebound to this order by a late retry.
                Some(KeyState::Committed(existing)) if *existing == order_id => (None, Ok(())),
                Some(KeyState::Committed(existing)) => (
                    None,
                    Err(EscrowlineError::IdempotencyUnavailable(format!(
                        "key '{key}' already committed to order {existing}"
                    ))),
                ),
                None => (
                    None,
                    Err(EscrowlineError::IdempotencyUnavailable(format!(
                        "reservation for key '{key}' expired before commit"
                    ))),
                ),
            })
    }

    fn revoke(&self, key: &IdempotencyKey, actor: UserId) {
        // Only pending reservations are revocable; committed keys stand.
        let removed = self
            .entries
            .remove_if(&(actor, key.clone()), |state| *state == KeyState::Pending);
        if removed {
            debug!(%key, %actor, "Idempotency reservation revoked");
        } else {
            warn!(%key, %actor, "Revoke ignored: key is not pending");
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.entries.purge_expired(now)
    }
}
