//! Dispute types.
//!
//! A dispute is opened by a participant (or the platform) against one
//! order and closed by an administrator. At most one dispute per order may
//! be OPEN at any time; while it is open the paired escrow is FROZEN.
//! Disputes are never deleted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    Actor, AuditAction, AuditDraft, DisputeId, EntityRef, EscrowTrigger, EscrowlineError, OrderId,
    OrderStatus, Result, Role,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Which link of the supply chain the dispute runs along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisputeTrigger {
    /// A customer disputes a dealer's delivery.
    CustomerToDealer,
    /// A dealer disputes a manufacturer's delivery.
    DealerToManufacturer,
    /// Raised by the platform itself.
    System,
}

impl DisputeTrigger {
    /// Whether an actor of `role` may raise a dispute of this type.
    #[must_use]
    pub fn permits(self, role: Role) -> bool {
        match self {
            Self::CustomerToDealer => role == Role::Customer,
            Self::DealerToManufacturer => role == Role::Dealer,
            Self::System => matches!(role, Role::Admin | Role::System),
        }
    }

    /// The trigger a buyer of `role` uses by default.
    #[must_use]
    pub fn for_buyer(role: Role) -> Self {
        match role {
            Role::Dealer => Self::DealerToManufacturer,
            Role::Admin | Role::System => Self::System,
            Role::Customer | Role::Manufacturer => Self::CustomerToDealer,
        }
    }
}

impl fmt::Display for DisputeTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomerToDealer => write!(f, "CUSTOMER_TO_DEALER"),
            Self::DealerToManufacturer => write!(f, "DEALER_TO_MANUFACTURER"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

/// Administrative outcome of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Buyer wins: frozen funds go back to the buyer.
    ApproveReturn,
    /// Seller wins: frozen funds are released to the seller.
    RejectReturn,
}

impl Resolution {
    #[must_use]
    pub fn escrow_trigger(self) -> EscrowTrigger {
        match self {
            Self::ApproveReturn => EscrowTrigger::DisputeApproved,
            Self::RejectReturn => EscrowTrigger::DisputeRejected,
        }
    }

    /// Where the DISPUTED order ends up.
    #[must_use]
    pub fn order_target(self) -> OrderStatus {
        match self {
            Self::ApproveReturn => OrderStatus::Refunded,
            Self::RejectReturn => OrderStatus::Settled,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApproveReturn => write!(f, "APPROVE_RETURN"),
            Self::RejectReturn => write!(f, "REJECT_RETURN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub id: DisputeId,
    pub order_id: OrderId,
    pub raised_by: Actor,
    pub reason: String,
    pub trigger_type: DisputeTrigger,
    pub status: DisputeStatus,
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Actor>,
    pub admin_notes: Option<String>,
}

impl Dispute {
    /// Open a new dispute and the audit entry announcing it.
    #[must_use]
    pub fn open(
        order_id: OrderId,
        raised_by: Actor,
        reason: String,
        trigger_type: DisputeTrigger,
        now: DateTime<Utc>,
    ) -> (Self, AuditDraft) {
        let dispute = Self {
            id: DisputeId::new(),
            order_id,
            raised_by,
            reason,
            trigger_type,
            status: DisputeStatus::Open,
            resolution: None,
            created_at: now,
            resolved_at: None,
            resolved_by: None,
            admin_notes: None,
        };
        let draft = AuditDraft::new(
            raised_by,
            AuditAction::DisputeRaised,
            EntityRef::dispute(dispute.id),
            json!({
                "orderId": order_id,
                "reason": dispute.reason,
                "triggerType": trigger_type,
            }),
        );
        (dispute, draft)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == DisputeStatus::Open
    }

    /// Close the dispute with `resolution`.
    ///
    /// # Errors
    /// [`EscrowlineError::AlreadyResolved`] if the dispute is not OPEN.
    pub fn resolve(
        &self,
        resolution: Resolution,
        admin: Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Self, AuditDraft)> {
        if !self.is_open() {
            return Err(EscrowlineError::AlreadyResolved(self.id));
        }
        let mut next = self.clone();
        next.status = DisputeStatus::Resolved;
        next.resolution = Some(resolution);
        next.resolved_at = Some(now);
        next.resolved_by = Some(admin);
        next.admin_notes.clone_from(&notes);

        let draft = AuditDraft::new(
            admin,
            AuditAction::DisputeResolved,
            EntityRef::dispute(self.id),
            json!({
                "orderId": self.order_id,
                "resolution": resolution,
                "adminNotes": notes,
            }),
        );
        Ok((next, draft))
    }

    /// Put a resolved dispute back to OPEN when its fund movement failed.
    #[must_use]
    pub fn reopened(&self) -> Self {
        Self {
            status: DisputeStatus::Open,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
            admin_notes: None,
            ..self.clone()
        }
    }
}
