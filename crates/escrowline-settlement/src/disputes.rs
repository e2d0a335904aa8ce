//! Dispute Resolution Engine.
//!
//! Raising a dispute:
//! 1. registers it as the one OPEN dispute of the order (atomic),
//! 2. freezes the escrow through the ledger's CAS (rolled back on failure),
//! 3. moves the order to DISPUTED.
//!
//! Resolving a dispute flips it to RESOLVED first (atomic, so a second
//! resolution sees `ALREADY_RESOLVED` and never moves funds again), then
//! moves the frozen funds, then closes the order. A failed fund movement
//! reopens the dispute.

use std::collections::HashMap;
use std::sync::Arc;

use escrowline_types::{
    Actor, Dispute, DisputeId, DisputeStatus, DisputeTrigger, EscrowTrigger, EscrowlineError,
    OrderId, OrderStatus, Resolution, Result, validate_reason,
};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::audit_trail::AuditTrail;
use crate::clock::Clock;
use crate::ledger::EscrowLedger;
use crate::notify::{Notifier, SettlementEvent};
use crate::orders::OrderLifecycle;
use crate::outcome::SettlementOutcome;

#[derive(Default)]
struct Book {
    by_id: HashMap<DisputeId, Dispute>,
    open_by_order: HashMap<OrderId, DisputeId>,
}

impl Book {
    fn open_for(&self, order_id: OrderId) -> Option<&Dispute> {
        self.open_by_order
            .get(&order_id)
            .and_then(|id| self.by_id.get(id))
    }

    fn put(&mut self, dispute: Dispute) {
        if dispute.is_open() {
            self.open_by_order.insert(dispute.order_id, dispute.id);
        } else if self.open_by_order.get(&dispute.order_id) == Some(&dispute.id) {
            self.open_by_order.remove(&dispute.order_id);
        }
        self.by_id.insert(dispute.id, dispute);
    }

    /// Forget a dispute that never took effect.
    fn withdraw(&mut self, dispute: &Dispute) {
        self.by_id.remove(&dispute.id);
        if self.open_by_order.get(&dispute.order_id) == Some(&dispute.id) {
            self.open_by_order.remove(&dispute.order_id);
        }
    }
}

pub struct DisputeDesk {
    book: Mutex<Book>,
    orders: Arc<OrderLifecycle>,
    ledger: Arc<EscrowLedger>,
    audit: Arc<AuditTrail>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl DisputeDesk {
    #[must_use]
    pub fn new(
        orders: Arc<OrderLifecycle>,
        ledger: Arc<EscrowLedger>,
        audit: Arc<AuditTrail>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            orders,
            ledger,
            audit,
            notifier,
            clock,
        }
    }

    /// The OPEN dispute of `order_id`, if any.
    pub fn open_for(&self, order_id: OrderId) -> Option<Dispute> {
        self.book.lock().open_for(order_id).cloned()
    }

    pub fn get(&self, id: DisputeId) -> Result<Dispute> {
        self.book
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(EscrowlineError::DisputeNotFound(id))
    }

    /// All disputes, optionally by status, newest first.
    pub fn list(&self, status: Option<DisputeStatus>) -> Vec<Dispute> {
        let mut disputes: Vec<Dispute> = self
            .book
            .lock()
            .by_id
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        disputes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        disputes
    }

    /// # Errors
    /// - `VALIDATION_ERROR` for a blank or oversized reason
    /// - `FORBIDDEN` if the trigger does not match the actor's role, or a
    ///   non-platform actor is not the order's buyer
    /// - `DISPUTE_EXISTS` if the order already has an OPEN dispute
    /// - `INVALID_TRANSITION` if the order cannot be disputed from its status
    /// - `ESCROW_TERMINAL` / `CONFLICT` if the escrow cannot be frozen
    pub fn raise(
        &self,
        actor: Actor,
        order_id: OrderId,
        reason: &str,
        trigger: DisputeTrigger,
    ) -> Result<SettlementOutcome> {
        validate_reason(reason, true)?;
        let order = self.orders.get(order_id)?;
        if !trigger.permits(actor.role) {
            return Err(EscrowlineError::forbidden(format!(
                "{} may not raise a {trigger} dispute",
                actor.role
            )));
        }
        if trigger != DisputeTrigger::System {
            actor.require_buyer(&order)?;
        }
        if let Some(open) = self.open_for(order_id) {
            return Err(EscrowlineError::DisputeExists {
                order_id,
                dispute_id: open.id,
            });
        }
        if !order.status.is_disputable() {
            return Err(EscrowlineError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Disputed,
                reason: "order cannot be disputed from this status".into(),
            });
        }
        let escrow = self.ledger.get(order_id)?;
        if escrow.status.is_terminal() {
            return Err(EscrowlineError::EscrowTerminal {
                order_id,
                status: escrow.status,
            });
        }
        self.open_and_freeze(actor, order_id, reason, trigger, escrow.version)
    }

    /// Register the dispute, then freeze the escrow at `escrow_version`.
    /// A failed freeze withdraws the dispute again.
    fn open_and_freeze(
        &self,
        actor: Actor,
        order_id: OrderId,
        reason: &str,
        trigger: DisputeTrigger,
        escrow_version: u64,
    ) -> Result<SettlementOutcome> {
        let now = self.clock.now();
        let (dispute, draft) =
            Dispute::open(order_id, actor, reason.trim().to_string(), trigger, now);
        {
            let mut book = self.book.lock();
            if let Some(open) = book.open_for(order_id) {
                return Err(EscrowlineError::DisputeExists {
                    order_id,
                    dispute_id: open.id,
                });
            }
            book.put(dispute.clone());
        }

        let escrow = match self.ledger.freeze(order_id, actor, escrow_version) {
            Ok(escrow) => escrow,
            Err(e) => {
                self.book.lock().withdraw(&dispute);
                warn!(%order_id, dispute_id = %dispute.id, error = %e, "Dispute withdrawn: escrow could not be frozen");
                return Err(e);
            }
        };
        self.audit.record(draft, now);
        info!(%order_id, dispute_id = %dispute.id, %trigger, %actor, "Dispute raised, escrow frozen");
        self.notifier.notify(&SettlementEvent::DisputeRaised {
            dispute_id: dispute.id,
            order_id,
        });

        let order = self
            .orders
            .advance(order_id, OrderStatus::Disputed, actor, Some(dispute.reason.clone()))
            .inspect_err(|e| {
                error!(%order_id, dispute_id = %dispute.id, error = %e, "Escrow frozen but order could not enter DISPUTED");
            })?;

        Ok(SettlementOutcome {
            order,
            escrow,
            dispute: Some(dispute),
        })
    }

    /// # Errors
    /// - `FORBIDDEN` unless the actor is an administrator
    /// - `NOT_FOUND` for unknown disputes
    /// - `ALREADY_RESOLVED` if the dispute is not OPEN
    /// - any ledger error from moving the frozen funds (the dispute is
    ///   reopened in that case)
    pub fn resolve(
        &self,
        actor: Actor,
        dispute_id: DisputeId,
        resolution: Resolution,
        notes: Option<String>,
    ) -> Result<SettlementOutcome> {
        actor.require_admin()?;
        if let Some(notes) = &notes {
            validate_reason(notes, false)?;
        }
        let now = self.clock.now();

        let (resolved, draft) = {
            let mut book = self.book.lock();
            let dispute = book
                .by_id
                .get(&dispute_id)
                .ok_or(EscrowlineError::DisputeNotFound(dispute_id))?;
            let (resolved, draft) = dispute.resolve(resolution, actor, notes.clone(), now)?;
            book.put(resolved.clone());
            (resolved, draft)
        };
        let order_id = resolved.order_id;

        let moved = self.ledger.get(order_id).and_then(|escrow| {
            match resolution.escrow_trigger() {
                trigger @ EscrowTrigger::DisputeApproved => self.ledger.refund(
                    order_id,
                    trigger,
                    actor,
                    format!("dispute approved: {}", resolved.reason),
                    escrow.version,
                ),
                trigger => self.ledger.release(order_id, trigger, actor, escrow.version),
            }
        });
        let escrow = match moved {
            Ok(escrow) => escrow,
            Err(e) => {
                self.book.lock().put(resolved.reopened());
                warn!(%order_id, %dispute_id, error = %e, "Dispute reopened: frozen funds could not move");
                return Err(e);
            }
        };
        self.audit.record(draft, now);
        info!(%order_id, %dispute_id, %resolution, %actor, "Dispute resolved");
        self.notifier.notify(&SettlementEvent::DisputeResolved {
            dispute_id,
            order_id,
            resolution,
        });

        // Funds have moved; a failure to close the order is logged, not
        // surfaced, since the escrow is the source of truth.
        let order = match self
            .orders
            .advance(order_id, resolution.order_target(), actor, notes)
        {
            Ok(order) => order,
            Err(e) => {
                error!(%order_id, %dispute_id, error = %e, "Escrow settled but order could not be closed");
                self.orders.get(order_id)?
            }
        };

        Ok(SettlementOutcome {
            order,
            escrow,
            dispute: Some(resolved),
        })
    }

    pub fn len(&self) -> usize {
        self.book.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.book.lock().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use escrowline_types::{EscrowStatus, Order, Role, UserId};
    use rust_decimal::Decimal;

    use super::*;
    use crate::audit_trail::MemoryAuditSink;
    use crate::clock::SystemClock;
    use crate::notify::TracingNotifier;

    struct Fixture {
        desk: DisputeDesk,
        orders: Arc<OrderLifecycle>,
        ledger: Arc<EscrowLedger>,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(AuditTrail::new(Arc::new(MemoryAuditSink::new()), 5));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
        let ledger = Arc::new(EscrowLedger::new(audit.clone(), notifier.clone(), clock.clone()));
        let orders = Arc::new(OrderLifecycle::new(
            ledger.clone(),
            audit.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let desk = DisputeDesk::new(orders.clone(), ledger.clone(), audit, notifier, clock);
        Fixture {
            desk,
            orders,
            ledger,
        }
    }

    /// A DELIVERED order with its escrow on hold; returns the order and
    /// its buyer.
    fn delivered(f: &Fixture) -> (Order, Actor) {
        let order = Order::dummy(Decimal::new(4_500, 0));
        f.orders.stage(order.clone()).unwrap();
        f.ledger.open(order.id, order.total).unwrap();
        let seller = Actor::new(order.seller_id, Role::Dealer);
        for target in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            f.orders.advance(order.id, target, seller, None).unwrap();
        }
        let order = f.orders.get(order.id).unwrap();
        let buyer = Actor::new(order.customer_id, Role::Customer);
        (order, buyer)
    }

    fn admin() -> Actor {
        Actor::new(UserId::new(), Role::Admin)
    }

    #[test]
    fn raise_freezes_and_disputes() {
        let f = fixture();
        let (order, buyer) = delivered(&f);
        let outcome = f
            .desk
            .raise(buyer, order.id, "damaged goods", DisputeTrigger::CustomerToDealer)
            .unwrap();
        assert_eq!(outcome.escrow.status, EscrowStatus::Frozen);
        assert_eq!(outcome.order.status, OrderStatus::Disputed);
        assert!(f.desk.open_for(order.id).is_some());
    }

    #[test]
    fn failed_freeze_withdraws_dispute() {
        let f = fixture();
        let (order, buyer) = delivered(&f);
        let escrow = f.ledger.get(order.id).unwrap();

        let err = f
            .desk
            .open_and_freeze(
                buyer,
                order.id,
                "damaged goods",
                DisputeTrigger::CustomerToDealer,
                escrow.version + 1,
            )
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(f.desk.open_for(order.id).is_none());
        assert!(f.desk.is_empty());
        assert_eq!(f.ledger.get(order.id).unwrap().status, EscrowStatus::Hold);
        assert_eq!(f.orders.get(order.id).unwrap().status, OrderStatus::Delivered);

        // Nothing left behind to block a fresh dispute.
        f.desk
            .raise(buyer, order.id, "damaged goods", DisputeTrigger::CustomerToDealer)
            .unwrap();
        assert_eq!(f.desk.len(), 1);
    }

    #[test]
    fn withdraw_keeps_other_open_dispute() {
        let f = fixture();
        let (order, buyer) = delivered(&f);
        let live = f
            .desk
            .raise(buyer, order.id, "damaged goods", DisputeTrigger::CustomerToDealer)
            .unwrap()
            .dispute
            .unwrap();

        let (stale, _) = Dispute::open(
            order.id,
            buyer,
            "late duplicate".into(),
            DisputeTrigger::CustomerToDealer,
            chrono::Utc::now(),
        );
        f.desk.book.lock().withdraw(&stale);
        assert_eq!(f.desk.open_for(order.id).map(|d| d.id), Some(live.id));
    }

    #[test]
    fn failed_fund_movement_reopens_dispute() {
        let f = fixture();
        let (order, buyer) = delivered(&f);
        let dispute = f
            .desk
            .raise(buyer, order.id, "damaged goods", DisputeTrigger::CustomerToDealer)
            .unwrap()
            .dispute
            .unwrap();

        // Funds leave the frozen escrow behind the desk's back.
        let escrow = f.ledger.get(order.id).unwrap();
        f.ledger
            .release(order.id, EscrowTrigger::DisputeRejected, admin(), escrow.version)
            .unwrap();

        let err = f
            .desk
            .resolve(admin(), dispute.id, Resolution::ApproveReturn, None)
            .unwrap_err();
        assert_eq!(err.code(), "ESCROW_TERMINAL");
        assert_eq!(f.desk.get(dispute.id).unwrap().status, DisputeStatus::Open);
        assert_eq!(f.desk.open_for(order.id).map(|d| d.id), Some(dispute.id));
    }

    #[test]
    fn second_resolution_moves_nothing() {
        let f = fixture();
        let (order, buyer) = delivered(&f);
        let dispute = f
            .desk
            .raise(buyer, order.id, "wrong colour", DisputeTrigger::CustomerToDealer)
            .unwrap()
            .dispute
            .unwrap();
        let outcome = f
            .desk
            .resolve(admin(), dispute.id, Resolution::RejectReturn, None)
            .unwrap();
        assert_eq!(outcome.escrow.status, EscrowStatus::Released);
        assert_eq!(outcome.order.status, OrderStatus::Settled);

        let err = f
            .desk
            .resolve(admin(), dispute.id, Resolution::ApproveReturn, None)
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_RESOLVED");
        assert_eq!(f.ledger.get(order.id).unwrap().status, EscrowStatus::Released);
    }
}
