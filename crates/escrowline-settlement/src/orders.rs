//! Order Lifecycle Manager: sole owner of order records.
//!
//! Status writes follow the same compare-and-swap discipline as the
//! ledger. Before committing, every transition reads the paired escrow so
//! an order can never claim a settlement state its funds are not in.

use std::collections::HashMap;
use std::sync::Arc;

use escrowline_types::{
    Actor, AuditAction, AuditDraft, EntityRef, Escrow, EscrowlineError, IdempotencyKey, Order,
    OrderFilter, OrderId, OrderScope, OrderStatus, Result, UserId, constants,
};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit_trail::AuditTrail;
use crate::clock::Clock;
use crate::ledger::EscrowLedger;
use crate::notify::{Notifier, SettlementEvent};

pub struct OrderLifecycle {
    orders: RwLock<HashMap<OrderId, Arc<Mutex<Order>>>>,
    /// Checkout keys of every order ever created, per buyer. Outlives the
    /// idempotency store's retention window.
    by_key: RwLock<HashMap<(UserId, IdempotencyKey), OrderId>>,
    ledger: Arc<EscrowLedger>,
    audit: Arc<AuditTrail>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl OrderLifecycle {
    #[must_use]
    pub fn new(
        ledger: Arc<EscrowLedger>,
        audit: Arc<AuditTrail>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            by_key: RwLock::new(HashMap::new()),
            ledger,
            audit,
            notifier,
            clock,
        }
    }

    fn slot(&self, id: OrderId) -> Result<Arc<Mutex<Order>>> {
        self.orders
            .read()
            .get(&id)
            .cloned()
            .ok_or(EscrowlineError::OrderNotFound(id))
    }

    pub(crate) fn stage(&self, order: Order) -> Result<()> {
        let mut orders = self.orders.write();
        if orders.contains_key(&order.id) {
            return Err(EscrowlineError::Internal(format!(
                "order {} already exists",
                order.id
            )));
        }
        debug!(order_id = %order.id, total = %order.total, "Order staged in PENDING");
        if let Some(key) = &order.idempotency_key {
            self.by_key
                .write()
                .insert((order.customer_id, key.clone()), order.id);
        }
        orders.insert(order.id, Arc::new(Mutex::new(order)));
        Ok(())
    }

    pub(crate) fn discard(&self, id: OrderId) {
        let Some(slot) = self.orders.write().remove(&id) else {
            return;
        };
        let order = slot.lock();
        if let Some(key) = &order.idempotency_key {
            let mut by_key = self.by_key.write();
            let index = (order.customer_id, key.clone());
            if by_key.get(&index) == Some(&id) {
                by_key.remove(&index);
            }
        }
        warn!(order_id = %id, "Staged order discarded");
    }

    /// The order `customer` created with checkout key `key`, if any.
    pub fn find_by_key(&self, customer: UserId, key: &IdempotencyKey) -> Option<OrderId> {
        self.by_key.read().get(&(customer, key.clone())).copied()
    }

    /// Write the single creation entry covering the order and its escrow.
    pub(crate) fn record_created(&self, order: &Order, escrow: &Escrow, actor: Actor) {
        let draft = AuditDraft::new(
            actor,
            AuditAction::OrderCreated,
            EntityRef::order(order.id),
            json!({
                "customerId": order.customer_id,
                "sellerId": order.seller_id,
                "items": order.items.len(),
                "total": order.total,
                "status": order.status,
                "escrow": {
                    "status": escrow.status,
                    "amount": escrow.amount,
                },
            }),
        );
        self.audit.record(draft, order.created_at);
        info!(
            order_id = %order.id,
            customer_id = %order.customer_id,
            seller_id = %order.seller_id,
            total = %order.total,
            "Order created with escrow on hold"
        );
        self.notifier.notify(&SettlementEvent::OrderCreated {
            order_id: order.id,
            customer_id: order.customer_id,
            seller_id: order.seller_id,
            total: order.total,
        });
    }

    pub fn get(&self, id: OrderId) -> Result<Order> {
        Ok(self.slot(id)?.lock().clone())
    }

    /// Orders visible under `scope` matching `filter`, newest first.
    pub fn list(&self, scope: OrderScope, filter: &OrderFilter) -> Vec<Order> {
        let slots: Vec<_> = self.orders.read().values().cloned().collect();
        let mut orders: Vec<Order> = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|o| scope.admits(o) && filter.admits(o))
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        orders
    }

    /// Move the order to `target` if it is still at `expected_version`.
    ///
    /// # Errors
    /// - [`EscrowlineError::OrderNotFound`]
    /// - [`EscrowlineError::Conflict`] if another writer got there first
    /// - [`EscrowlineError::InvalidTransition`] if the edge does not exist
    ///   or the escrow is not where the target needs it
    pub fn transition(
        &self,
        id: OrderId,
        target: OrderStatus,
        actor: Actor,
        reason: Option<String>,
        expected_version: u64,
    ) -> Result<Order> {
        let slot = self.slot(id)?;
        let mut order = slot.lock();
        if order.version != expected_version {
            return Err(EscrowlineError::Conflict {
                entity: format!("order {id}"),
                expected: expected_version,
                actual: order.version,
            });
        }
        let escrow = self.ledger.get(id)?;
        let now = self.clock.now();
        let (next, draft) = order
            .transition(target, escrow.status, actor, reason, now)
            .inspect_err(|e| {
                warn!(order_id = %id, from = %order.status, to = %target, error = %e, "Order transition rejected");
            })?;
        let from = order.status;
        *order = next.clone();
        self.audit.record(draft, now);
        drop(order);

        info!(order_id = %id, %from, to = %target, %actor, "Order transition committed");
        self.notifier.notify(&SettlementEvent::OrderStatusChanged {
            order_id: id,
            from,
            to: target,
        });
        Ok(next)
    }

    /// Re-read and retry [`OrderLifecycle::transition`] while it only loses
    /// version races.
    pub fn advance(
        &self,
        id: OrderId,
        target: OrderStatus,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Order> {
        let mut last = None;
        for _ in 0..constants::MAX_TRANSITION_RETRIES {
            let current = self.get(id)?;
            match self.transition(id, target, actor, reason.clone(), current.version) {
                Err(e @ EscrowlineError::Conflict { .. }) => last = Some(e),
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| EscrowlineError::Internal("no transition attempted".into())))
    }

    /// Bring an order whose escrow was just refunded to its closing status:
    /// CANCELLED while that edge exists, REFUNDED otherwise.
    pub fn close_after_refund(&self, id: OrderId, actor: Actor, reason: &str) -> Result<Order> {
        let mut last = None;
        for _ in 0..constants::MAX_TRANSITION_RETRIES {
            let current = self.get(id)?;
            let target = if current.status.can_transition_to(OrderStatus::Cancelled) {
                OrderStatus::Cancelled
            } else {
                OrderStatus::Refunded
            };
            match self.transition(id, target, actor, Some(reason.to_string()), current.version) {
                Err(e @ EscrowlineError::Conflict { .. }) => last = Some(e),
                other => return other,
            }
        }
        Err(last.unwrap_or_else(|| EscrowlineError::Internal("no transition attempted".into())))
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}
