//! Escrow Ledger: sole owner of escrow records.
//!
//! Every mutation is a guarded compare-and-swap: the caller passes the
//! version it read, the ledger locks that one escrow, and the write only
//! happens if nobody committed in between. Two callers racing on the same
//! escrow therefore see exactly one success and one
//! [`EscrowlineError::Conflict`]. Escrows of different orders never
//! contend.

use std::collections::HashMap;
use std::sync::Arc;

use escrowline_types::{
    Actor, Escrow, EscrowStatus, EscrowTrigger, EscrowlineError, OrderId, Result,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::audit_trail::AuditTrail;
use crate::clock::Clock;
use crate::notify::{Notifier, SettlementEvent};
use crate::outcome::{Page, PageRequest};

pub struct EscrowLedger {
    escrows: RwLock<HashMap<OrderId, Arc<Mutex<Escrow>>>>,
    audit: Arc<AuditTrail>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl EscrowLedger {
    #[must_use]
    pub fn new(audit: Arc<AuditTrail>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            escrows: RwLock::new(HashMap::new()),
            audit,
            notifier,
            clock,
        }
    }

    fn slot(&self, order_id: OrderId) -> Result<Arc<Mutex<Escrow>>> {
        self.escrows
            .read()
            .get(&order_id)
            .cloned()
            .ok_or(EscrowlineError::EscrowNotFound(order_id))
    }

    /// Place a new HOLD escrow for a freshly staged order.
    ///
    /// The creation audit entry is written by the order side, which covers
    /// both records in one entry.
    pub(crate) fn open(&self, order_id: OrderId, amount: Decimal) -> Result<Escrow> {
        let escrow = Escrow::hold(order_id, amount, self.clock.now());
        let mut escrows = self.escrows.write();
        if escrows.contains_key(&order_id) {
            return Err(EscrowlineError::Internal(format!(
                "escrow for order {order_id} already exists"
            )));
        }
        escrows.insert(order_id, Arc::new(Mutex::new(escrow.clone())));
        debug!(%order_id, %amount, "Escrow staged in HOLD");
        Ok(escrow)
    }

    /// Drop an escrow whose order creation was rolled back.
    pub(crate) fn discard(&self, order_id: OrderId) {
        if self.escrows.write().remove(&order_id).is_some() {
            warn!(%order_id, "Staged escrow discarded");
        }
    }

    pub fn get(&self, order_id: OrderId) -> Result<Escrow> {
        Ok(self.slot(order_id)?.lock().clone())
    }

    /// Fire `trigger` against the escrow of `order_id` if it is still at
    /// `expected_version`.
    ///
    /// # Errors
    /// - [`EscrowlineError::EscrowNotFound`] for unknown orders
    /// - [`EscrowlineError::Conflict`] if another writer got there first
    /// - [`EscrowlineError::EscrowTerminal`] /
    ///   [`EscrowlineError::EscrowTransitionRejected`] if the edge does not
    ///   start from the current status
    pub fn transition(
        &self,
        order_id: OrderId,
        trigger: EscrowTrigger,
        actor: Actor,
        reason: Option<String>,
        expected_version: u64,
    ) -> Result<Escrow> {
        let slot = self.slot(order_id)?;
        let mut escrow = slot.lock();
        if escrow.version != expected_version {
            warn!(%order_id, %trigger, expected_version, actual = escrow.version, "Escrow CAS lost");
            return Err(EscrowlineError::Conflict {
                entity: format!("escrow {order_id}"),
                expected: expected_version,
                actual: escrow.version,
            });
        }

        let now = self.clock.now();
        let (next, draft) = escrow.apply(trigger, actor, reason, now).inspect_err(|e| {
            warn!(%order_id, %trigger, status = %escrow.status, error = %e, "Escrow transition rejected");
        })?;
        *escrow = next.clone();
        self.audit.record(draft, now);
        drop(escrow);

        info!(
            %order_id,
            %trigger,
            from = %trigger.from(),
            to = %next.status,
            amount = %next.amount,
            %actor,
            "Escrow transition committed"
        );
        if let Some(event) =
            SettlementEvent::for_escrow(order_id, next.status, next.amount, next.refund_reason.clone())
        {
            self.notifier.notify(&event);
        }
        Ok(next)
    }

    /// HOLD → RELEASED (or FROZEN → RELEASED for a rejected dispute).
    pub fn release(
        &self,
        order_id: OrderId,
        trigger: EscrowTrigger,
        actor: Actor,
        expected_version: u64,
    ) -> Result<Escrow> {
        Self::expect_target(trigger, EscrowStatus::Released)?;
        self.transition(order_id, trigger, actor, None, expected_version)
    }

    /// HOLD → REFUNDED (or FROZEN → REFUNDED for an approved dispute).
    pub fn refund(
        &self,
        order_id: OrderId,
        trigger: EscrowTrigger,
        actor: Actor,
        reason: String,
        expected_version: u64,
    ) -> Result<Escrow> {
        Self::expect_target(trigger, EscrowStatus::Refunded)?;
        self.transition(order_id, trigger, actor, Some(reason), expected_version)
    }

    /// HOLD → FROZEN.
    pub fn freeze(&self, order_id: OrderId, actor: Actor, expected_version: u64) -> Result<Escrow> {
        self.transition(order_id, EscrowTrigger::DisputeRaised, actor, None, expected_version)
    }

    fn expect_target(trigger: EscrowTrigger, target: EscrowStatus) -> Result<()> {
        if trigger.to() == target {
            Ok(())
        } else {
            Err(EscrowlineError::Internal(format!(
                "trigger {trigger} does not lead to {target}"
            )))
        }
    }

    /// All escrows, optionally filtered by status, newest first.
    pub fn list(&self, status: Option<EscrowStatus>) -> Vec<Escrow> {
        let slots: Vec<_> = self.escrows.read().values().cloned().collect();
        let mut escrows: Vec<Escrow> = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect();
        escrows.sort_by(|a, b| {
            b.held_at
                .cmp(&a.held_at)
                .then_with(|| b.order_id.cmp(&a.order_id))
        });
        escrows
    }

    pub fn page(&self, status: Option<EscrowStatus>, request: PageRequest) -> Page<Escrow> {
        request.apply(self.list(status))
    }

    pub fn len(&self) -> usize {
        self.escrows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.escrows.read().is_empty()
    }
}
