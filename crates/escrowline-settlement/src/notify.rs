//! Fire-and-forget notification of committed transitions.
//!
//! Notifiers run after the state change and its audit entry are written.
//! They must not block and cannot fail the caller.

use escrowline_types::{DisputeId, EscrowStatus, OrderId, OrderStatus, Resolution, UserId};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementEvent {
    OrderCreated {
        order_id: OrderId,
        customer_id: UserId,
        seller_id: UserId,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    EscrowReleased {
        order_id: OrderId,
        amount: Decimal,
    },
    EscrowRefunded {
        order_id: OrderId,
        amount: Decimal,
        reason: Option<String>,
    },
    EscrowFrozen {
        order_id: OrderId,
    },
    DisputeRaised {
        dispute_id: DisputeId,
        order_id: OrderId,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        order_id: OrderId,
        resolution: Resolution,
    },
}

impl SettlementEvent {
    #[must_use]
    pub fn order_id(&self) -> OrderId {
        match self {
            Self::OrderCreated { order_id, .. }
            | Self::OrderStatusChanged { order_id, .. }
            | Self::EscrowReleased { order_id, .. }
            | Self::EscrowRefunded { order_id, .. }
            | Self::EscrowFrozen { order_id }
            | Self::DisputeRaised { order_id, .. }
            | Self::DisputeResolved { order_id, .. } => *order_id,
        }
    }

    /// The event announcing an escrow reaching `status`.
    #[must_use]
    pub fn for_escrow(
        order_id: OrderId,
        status: EscrowStatus,
        amount: Decimal,
        reason: Option<String>,
    ) -> Option<Self> {
        match status {
            EscrowStatus::Released => Some(Self::EscrowReleased { order_id, amount }),
            EscrowStatus::Refunded => Some(Self::EscrowRefunded {
                order_id,
                amount,
                reason,
            }),
            EscrowStatus::Frozen => Some(Self::EscrowFrozen { order_id }),
            EscrowStatus::Hold => None,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &SettlementEvent);
}

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &SettlementEvent) {
        info!(order_id = %event.order_id(), ?event, "Settlement event");
    }
}

/// Forwards events to an unbounded channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<SettlementEvent>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SettlementEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: &SettlementEvent) {
        let _ = self.tx.send(event.clone());
    }
}
