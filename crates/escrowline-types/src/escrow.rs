//! # Escrow — funds held against one order
//!
//! ## State Machine
//!
//! ```text
//!              confirm / admin / auto
//!   ┌──────┐ ─────────────────────────▶ ┌──────────┐
//!   │ HOLD │                            │ RELEASED │
//!   └──┬─┬─┘ ──────────┐                └──────────┘
//!      │ │  admin /    │                      ▲
//!      │ │  cancel     ▼                      │ dispute rejected
//!      │ │         ┌──────────┐               │
//!      │ │         │ REFUNDED │ ◀─────┐  ┌────┴───┐
//!      │ │         └──────────┘       └──┤ FROZEN │
//!      │ └──────── dispute raised ─────▶ └────────┘
//!      │                         dispute approved
//! ```
//!
//! RELEASED and REFUNDED are terminal. Every edge is named by an
//! [`EscrowTrigger`]; a trigger fixes both the source and the target, so
//! "who may move the money from where" is a property of the trigger and
//! not of the caller.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{Actor, AuditAction, AuditDraft, EntityRef, EscrowlineError, OrderId, Result};

/// The lifecycle state of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Funds captured and held for the seller pending delivery.
    Hold,
    /// Funds paid out to the seller. **Terminal.**
    Released,
    /// Funds returned to the buyer. **Terminal.**
    Refunded,
    /// Funds locked while a dispute is open.
    Frozen,
}

impl EscrowStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Can some trigger move the escrow from `self` to `target`?
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        EscrowTrigger::ALL
            .iter()
            .any(|t| t.from() == self && t.to() == target)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hold => write!(f, "HOLD"),
            Self::Released => write!(f, "RELEASED"),
            Self::Refunded => write!(f, "REFUNDED"),
            Self::Frozen => write!(f, "FROZEN"),
        }
    }
}

/// Why an escrow is moving. Each trigger is exactly one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowTrigger {
    /// Buyer confirmed delivery.
    BuyerConfirmation,
    /// Administrator forced a release.
    AdminRelease,
    /// Scheduler released after the post-delivery SLA.
    AutoRelease,
    /// Administrator refunded directly.
    AdminRefund,
    /// Order cancelled before shipment.
    OrderCancelled,
    /// A dispute was opened.
    DisputeRaised,
    /// Dispute closed in the seller's favour.
    DisputeRejected,
    /// Dispute closed in the buyer's favour.
    DisputeApproved,
}

impl EscrowTrigger {
    pub const ALL: [Self; 8] = [
        Self::BuyerConfirmation,
        Self::AdminRelease,
        Self::AutoRelease,
        Self::AdminRefund,
        Self::OrderCancelled,
        Self::DisputeRaised,
        Self::DisputeRejected,
        Self::DisputeApproved,
    ];

    /// The single transition table for escrows: source status per trigger.
    #[must_use]
    pub fn from(self) -> EscrowStatus {
        match self {
            Self::BuyerConfirmation
            | Self::AdminRelease
            | Self::AutoRelease
            | Self::AdminRefund
            | Self::OrderCancelled
            | Self::DisputeRaised => EscrowStatus::Hold,
            Self::DisputeRejected | Self::DisputeApproved => EscrowStatus::Frozen,
        }
    }

    /// Target status per trigger.
    #[must_use]
    pub fn to(self) -> EscrowStatus {
        match self {
            Self::BuyerConfirmation
            | Self::AdminRelease
            | Self::AutoRelease
            | Self::DisputeRejected => EscrowStatus::Released,
            Self::AdminRefund | Self::OrderCancelled | Self::DisputeApproved => {
                EscrowStatus::Refunded
            }
            Self::DisputeRaised => EscrowStatus::Frozen,
        }
    }

    fn audit_action(self) -> AuditAction {
        match self.to() {
            EscrowStatus::Released => AuditAction::EscrowReleased,
            EscrowStatus::Refunded => AuditAction::EscrowRefunded,
            EscrowStatus::Frozen | EscrowStatus::Hold => AuditAction::EscrowFrozen,
        }
    }
}

impl fmt::Display for EscrowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuyerConfirmation => "BUYER_CONFIRMATION",
            Self::AdminRelease => "ADMIN_RELEASE",
            Self::AutoRelease => "AUTO_RELEASE",
            Self::AdminRefund => "ADMIN_REFUND",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::DisputeRaised => "DISPUTE_RAISED",
            Self::DisputeRejected => "DISPUTE_REJECTED",
            Self::DisputeApproved => "DISPUTE_APPROVED",
        };
        f.write_str(s)
    }
}

/// Funds held against exactly one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escrow {
    pub order_id: OrderId,
    /// Immutable after creation.
    pub amount: Decimal,
    pub status: EscrowStatus,
    pub held_at: DateTime<Utc>,
    /// Set when the escrow reaches RELEASED or REFUNDED.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who moved the escrow into its terminal state.
    pub resolution_actor: Option<Actor>,
    pub refund_reason: Option<String>,
    /// The trigger behind the most recent transition.
    pub last_trigger: Option<EscrowTrigger>,
    /// Bumped on every committed change; the compare-and-swap token.
    pub version: u64,
}

impl Escrow {
    /// A fresh HOLD escrow for a newly created order.
    #[must_use]
    pub fn hold(order_id: OrderId, amount: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            amount,
            status: EscrowStatus::Hold,
            held_at: now,
            resolved_at: None,
            resolution_actor: None,
            refund_reason: None,
            last_trigger: None,
            version: 0,
        }
    }

    /// Check that `trigger` may fire from the current status.
    ///
    /// # Errors
    /// - [`EscrowlineError::EscrowTerminal`] if the escrow is closed
    /// - [`EscrowlineError::EscrowTransitionRejected`] if the status is not
    ///   the trigger's source
    pub fn check(&self, trigger: EscrowTrigger) -> Result<()> {
        if self.status.is_terminal() {
            return Err(EscrowlineError::EscrowTerminal {
                order_id: self.order_id,
                status: self.status,
            });
        }
        if self.status != trigger.from() {
            return Err(EscrowlineError::EscrowTransitionRejected {
                order_id: self.order_id,
                from: self.status,
                to: trigger.to(),
            });
        }
        Ok(())
    }

    /// Compute the next version of this escrow after `trigger` fires.
    ///
    /// Pure: returns the new record and the audit entry that must be
    /// persisted with it. `reason` is stored for refunds and included in
    /// the audit details for every edge.
    ///
    /// # Errors
    /// See [`Escrow::check`].
    pub fn apply(
        &self,
        trigger: EscrowTrigger,
        actor: Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Self, AuditDraft)> {
        self.check(trigger)?;

        let target = trigger.to();
        let mut next = self.clone();
        next.status = target;
        next.version += 1;
        next.last_trigger = Some(trigger);
        if target.is_terminal() {
            next.resolved_at = Some(now);
            next.resolution_actor = Some(actor);
        }
        if target == EscrowStatus::Refunded {
            next.refund_reason.clone_from(&reason);
        }

        let draft = AuditDraft::new(
            actor,
            trigger.audit_action(),
            EntityRef::escrow(self.order_id),
            json!({
                "from": self.status,
                "to": target,
                "trigger": trigger,
                "amount": self.amount,
                "reason": reason,
                "version": next.version,
            }),
        );
        Ok((next, draft))
    }
}
