//! Order types and the order state machine.
//!
//! ## State Machine
//!
//! ```text
//!   PENDING ──▶ CONFIRMED ──▶ SHIPPED ──▶ DELIVERED ──▶ SETTLED
//!      │            │            │  │         │  │
//!      └──▶ CANCELLED ◀──────────┘  │         │  └──▶ RETURN_REQUESTED
//!                                   ▼         ▼            │
//!                                 DISPUTED ◀───────────────┘
//!                                   │
//!                                   └──▶ SETTLED | REFUNDED
//! ```
//!
//! SHIPPED, DELIVERED and RETURN_REQUESTED may also end in REFUNDED through
//! an administrative refund. SETTLED, CANCELLED and REFUNDED are terminal.
//!
//! Terminal targets imply fund movement, so each one is only committed when
//! the paired escrow already sits in the matching state
//! ([`OrderStatus::required_escrow`]).

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    Actor, AuditAction, AuditDraft, EntityRef, EscrowStatus, EscrowlineError, IdempotencyKey,
    OrderId, ProductRef, Result, UserId, constants,
};

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Settled,
    Cancelled,
    Disputed,
    ReturnRequested,
    Refunded,
}

impl OrderStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Confirmed,
        Self::Shipped,
        Self::Delivered,
        Self::Settled,
        Self::Cancelled,
        Self::Disputed,
        Self::ReturnRequested,
        Self::Refunded,
    ];

    /// The single transition table for orders.
    #[must_use]
    pub fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Shipped, Self::Cancelled],
            Self::Shipped => &[Self::Delivered, Self::Disputed, Self::Refunded],
            Self::Delivered => &[
                Self::Settled,
                Self::Disputed,
                Self::ReturnRequested,
                Self::Refunded,
            ],
            Self::ReturnRequested => &[Self::Delivered, Self::Disputed, Self::Refunded],
            Self::Disputed => &[Self::Settled, Self::Refunded],
            Self::Settled | Self::Cancelled | Self::Refunded => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Whether reaching this status moves held funds.
    #[must_use]
    pub fn implies_fund_movement(self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled | Self::Refunded)
    }

    /// The escrow state that must already hold before an order may enter
    /// this status, if any.
    #[must_use]
    pub fn required_escrow(self) -> Option<EscrowStatus> {
        match self {
            Self::Settled => Some(EscrowStatus::Released),
            Self::Cancelled | Self::Refunded => Some(EscrowStatus::Refunded),
            Self::Disputed => Some(EscrowStatus::Frozen),
            _ => None,
        }
    }

    /// Statuses a dispute may be raised from.
    #[must_use]
    pub fn is_disputable(self) -> bool {
        self.can_transition_to(Self::Disputed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Confirmed => write!(f, "CONFIRMED"),
            Self::Shipped => write!(f, "SHIPPED"),
            Self::Delivered => write!(f, "DELIVERED"),
            Self::Settled => write!(f, "SETTLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Disputed => write!(f, "DISPUTED"),
            Self::ReturnRequested => write!(f, "RETURN_REQUESTED"),
            Self::Refunded => write!(f, "REFUNDED"),
        }
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_ref: ProductRef,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl OrderItem {
    #[must_use]
    pub fn new(product_ref: impl Into<String>, quantity: u32, unit_price: Decimal) -> Self {
        Self {
            product_ref: ProductRef::new(product_ref),
            quantity,
            unit_price,
        }
    }

    /// `quantity × unit_price`, or `None` on overflow.
    #[must_use]
    pub fn line_total(&self) -> Option<Decimal> {
        self.unit_price.checked_mul(Decimal::from(self.quantity))
    }
}

/// Checkout payload: everything needed to create an order except the buyer,
/// who is the authenticated actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub seller_id: UserId,
    pub items: Vec<OrderItem>,
    pub shipping_address: String,
}

impl NewOrder {
    /// Structural validation. Returns the order total.
    ///
    /// # Errors
    /// [`EscrowlineError::Validation`] for empty or oversized item lists,
    /// zero quantities, non-positive prices, a blank address, or overflow.
    pub fn validate(&self, max_items: usize) -> Result<Decimal> {
        if self.items.is_empty() {
            return Err(EscrowlineError::validation("order must contain at least one item"));
        }
        if self.items.len() > max_items {
            return Err(EscrowlineError::validation(format!(
                "order has {} items, limit is {max_items}",
                self.items.len()
            )));
        }
        if self.shipping_address.trim().is_empty() {
            return Err(EscrowlineError::validation("shipping address is required"));
        }

        let mut total = Decimal::ZERO;
        for item in &self.items {
            if item.product_ref.as_str().trim().is_empty() {
                return Err(EscrowlineError::validation("product reference is required"));
            }
            if item.quantity == 0 {
                return Err(EscrowlineError::validation(format!(
                    "quantity for {} must be positive",
                    item.product_ref
                )));
            }
            if item.unit_price <= Decimal::ZERO {
                return Err(EscrowlineError::validation(format!(
                    "unit price for {} must be positive",
                    item.product_ref
                )));
            }
            total = item
                .line_total()
                .and_then(|line| total.checked_add(line))
                .ok_or_else(|| EscrowlineError::validation("order total overflows"))?;
        }
        Ok(total)
    }
}

/// One committed status change, kept on the order for SLA computation and
/// display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: Actor,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Core order record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub customer_id: UserId,
    pub seller_id: UserId,
    pub items: Vec<OrderItem>,
    pub shipping_address: String,
    pub idempotency_key: Option<IdempotencyKey>,
    /// Sum of `quantity × unit_price`; the escrowed amount.
    pub total: Decimal,
    pub status: OrderStatus,
    /// Bumped on every committed change; the compare-and-swap token.
    pub version: u64,
    pub timeline: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a fresh PENDING order from a validated checkout payload.
    #[must_use]
    pub fn create(
        customer_id: UserId,
        new_order: NewOrder,
        total: Decimal,
        idempotency_key: Option<IdempotencyKey>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            customer_id,
            seller_id: new_order.seller_id,
            items: new_order.items,
            shipping_address: new_order.shipping_address,
            idempotency_key,
            total,
            status: OrderStatus::Pending,
            version: 0,
            timeline: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_participant(&self, user: UserId) -> bool {
        self.customer_id == user || self.seller_id == user
    }

    /// When the order most recently entered DELIVERED.
    #[must_use]
    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.timeline
            .iter()
            .rev()
            .find(|change| change.to == OrderStatus::Delivered)
            .map(|change| change.at)
    }

    /// Compute the next version of this order after moving to `target`.
    ///
    /// Pure: validates the edge against the transition table and the paired
    /// escrow state, and returns the new record together with the audit
    /// entry that must accompany it.
    ///
    /// # Errors
    /// [`EscrowlineError::InvalidTransition`] if the edge does not exist or
    /// the escrow is not in the state the target requires.
    pub fn transition(
        &self,
        target: OrderStatus,
        escrow: EscrowStatus,
        actor: Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Self, AuditDraft)> {
        if !self.status.can_transition_to(target) {
            return Err(EscrowlineError::InvalidTransition {
                from: self.status,
                to: target,
                reason: "no such edge in the order state machine".into(),
            });
        }
        if let Some(required) = target.required_escrow() {
            if escrow != required {
                let reason = if escrow == EscrowStatus::Frozen {
                    "escrow is frozen pending dispute resolution".to_string()
                } else {
                    format!("requires escrow {required}, escrow is {escrow}")
                };
                return Err(EscrowlineError::InvalidTransition {
                    from: self.status,
                    to: target,
                    reason,
                });
            }
        }

        let mut next = self.clone();
        next.status = target;
        next.version += 1;
        next.updated_at = now;
        next.timeline.push(StatusChange {
            from: self.status,
            to: target,
            actor,
            reason: reason.clone(),
            at: now,
        });

        let draft = AuditDraft::new(
            actor,
            AuditAction::OrderStatusChanged,
            EntityRef::order(self.id),
            json!({
                "from": self.status,
                "to": target,
                "reason": reason,
                "version": next.version,
            }),
        );
        Ok((next, draft))
    }
}

/// Test helpers.
#[cfg(any(test, feature = "test-helpers"))]
impl Order {
    /// A PENDING single-item order between two fresh users.
    pub fn dummy(total: Decimal) -> Self {
        let new_order = NewOrder::dummy(UserId::new(), total);
        Self::create(UserId::new(), new_order, total, None, Utc::now())
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl NewOrder {
    /// A one-line checkout worth exactly `total`.
    pub fn dummy(seller_id: UserId, total: Decimal) -> Self {
        Self {
            seller_id,
            items: vec![OrderItem::new("SKU-1", 1, total)],
            shipping_address: "12 MG Road, Bengaluru".into(),
        }
    }

    /// A checkout with `lines` random items.
    pub fn random(seller_id: UserId, lines: usize) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let items = (0..lines)
            .map(|i| {
                OrderItem::new(
                    format!("SKU-{i}"),
                    rng.gen_range(1..=20),
                    Decimal::new(rng.gen_range(1..=1_000_000), 2),
                )
            })
            .collect();
        Self {
            seller_id,
            items,
            shipping_address: "42 Park Street, Kolkata".into(),
        }
    }
}

/// Filter for order listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
}

impl OrderFilter {
    #[must_use]
    pub fn admits(&self, order: &Order) -> bool {
        self.status.is_none_or(|status| order.status == status)
    }
}

/// Reason text limit shared by disputes, refunds, and status notes.
///
/// # Errors
/// [`EscrowlineError::Validation`] if blank (when `required`) or too long.
pub fn validate_reason(reason: &str, required: bool) -> Result<()> {
    if required && reason.trim().is_empty() {
        return Err(EscrowlineError::validation("a reason is required"));
    }
    if reason.len() > constants::MAX_REASON_LEN {
        return Err(EscrowlineError::validation(format!(
            "reason exceeds {} bytes",
            constants::MAX_REASON_LEN
        )));
    }
    Ok(())
}
