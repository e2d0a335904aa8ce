//! `SettlementEngine`: the one entry point callers use.
//!
//! Each operation authorizes the actor, loads what it needs, and delegates
//! state changes to the component that owns the record. The engine itself
//! never writes an order, escrow or dispute field.

use std::sync::Arc;

use chrono::Duration;
use escrowline_types::{
    Actor, AuditAction, AuditDraft, AuditLogEntry, AuditQuery, Dispute, DisputeId, DisputeStatus,
    DisputeTrigger, EngineConfig, EntityRef, Escrow, EscrowStatus, EscrowTrigger, EscrowlineError,
    IdempotencyKey, NewOrder, Order, OrderFilter, OrderId, OrderStatus, Resolution, Result,
    validate_reason,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit_trail::{AuditSink, AuditTrail, MemoryAuditSink};
use crate::catalog::{CatalogResolver, OpenCatalog};
use crate::clock::{Clock, SystemClock};
use crate::disputes::DisputeDesk;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::ledger::EscrowLedger;
use crate::notify::{Notifier, TracingNotifier};
use crate::orders::OrderLifecycle;
use crate::outcome::{CreatedOrder, Page, PageRequest, SettlementOutcome};
use crate::scheduler::{AutoReleasePass, AutoReleaseReport};

const CANCEL_REASON: &str = "order cancelled";

/// Assembles a [`SettlementEngine`] from pluggable collaborators.
/// Anything not supplied gets the in-process default.
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    idempotency: Option<Arc<dyn IdempotencyStore>>,
    catalog: Option<Arc<dyn CatalogResolver>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn CatalogResolver>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// # Errors
    /// [`EscrowlineError::Configuration`] if the config is unusable.
    pub fn build(self) -> Result<SettlementEngine> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()));
        let idempotency = self.idempotency.unwrap_or_else(|| {
            Arc::new(InMemoryIdempotencyStore::new(
                config.reservation_ttl(),
                config.retention(),
            ))
        });
        let catalog = self.catalog.unwrap_or_else(|| Arc::new(OpenCatalog));

        let audit = Arc::new(AuditTrail::new(sink, config.audit_retry_limit));
        let ledger = Arc::new(EscrowLedger::new(
            audit.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let orders = Arc::new(OrderLifecycle::new(
            ledger.clone(),
            audit.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let disputes = DisputeDesk::new(
            orders.clone(),
            ledger.clone(),
            audit.clone(),
            notifier,
            clock.clone(),
        );

        info!(
            sla_secs = config.auto_release_sla_secs,
            reservation_ttl_secs = config.idempotency_reservation_ttl_secs,
            "Settlement engine ready"
        );
        Ok(SettlementEngine {
            config,
            clock,
            idempotency,
            catalog,
            audit,
            ledger,
            orders,
            disputes,
        })
    }
}

pub struct SettlementEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    idempotency: Arc<dyn IdempotencyStore>,
    catalog: Arc<dyn CatalogResolver>,
    audit: Arc<AuditTrail>,
    ledger: Arc<EscrowLedger>,
    orders: Arc<OrderLifecycle>,
    disputes: DisputeDesk,
}

impl SettlementEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            clock: None,
            audit_sink: None,
            idempotency: None,
            catalog: None,
            notifier: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------

    /// Create an order and its HOLD escrow.
    ///
    /// With a key, the sequence is reserve, validate, stage, commit. A
    /// repeat of a committed key returns the original order with
    /// `idempotent: true`. Validation failures revoke the key; a failed
    /// commit discards the staged order and escrow.
    pub fn create_order(
        &self,
        actor: Actor,
        new_order: NewOrder,
        key: Option<IdempotencyKey>,
    ) -> Result<CreatedOrder> {
        if !actor.capabilities().can_place_orders {
            return Err(EscrowlineError::forbidden(format!(
                "{} may not place orders",
                actor.role
            )));
        }

        if let Some(key) = &key {
            let reservation = self.idempotency.reserve(key, actor.user_id, self.clock.now())?;
            if let Some(order_id) = reservation.existing_order_id() {
                return self.replay(order_id, key);
            }
            if let Some(order_id) = self.orders.find_by_key(actor.user_id, key) {
                // The store already purged this committed key; bind it again.
                if let Err(e) =
                    self.idempotency
                        .commit(key, actor.user_id, order_id, self.clock.now())
                {
                    warn!(%order_id, %key, error = %e, "Could not rebind purged idempotency key");
                    self.idempotency.revoke(key, actor.user_id);
                }
                return self.replay(order_id, key);
            }
        }

        let total = match self.validate_new_order(actor, &new_order) {
            Ok(total) => total,
            Err(e) => {
                if let Some(key) = &key {
                    self.idempotency.revoke(key, actor.user_id);
                }
                return Err(e);
            }
        };

        let order = Order::create(actor.user_id, new_order, total, key.clone(), self.clock.now());
        let order_id = order.id;
        self.orders.stage(order.clone())?;
        let escrow = match self.ledger.open(order_id, total) {
            Ok(escrow) => escrow,
            Err(e) => {
                self.orders.discard(order_id);
                self.revoke_key(key.as_ref(), actor);
                return Err(e);
            }
        };

        if let Some(key) = &key {
            if let Err(e) = self
                .idempotency
                .commit(key, actor.user_id, order_id, self.clock.now())
            {
                warn!(%order_id, %key, error = %e, "Idempotency commit failed; rolling back order");
                self.ledger.discard(order_id);
                self.orders.discard(order_id);
                self.idempotency.revoke(key, actor.user_id);
                return Err(e);
            }
        }

        self.orders.record_created(&order, &escrow, actor);
        Ok(CreatedOrder {
            order,
            escrow,
            idempotent: false,
        })
    }

    fn replay(&self, order_id: OrderId, key: &IdempotencyKey) -> Result<CreatedOrder> {
        debug!(%order_id, %key, "Idempotent replay of order creation");
        Ok(CreatedOrder {
            order: self.orders.get(order_id)?,
            escrow: self.ledger.get(order_id)?,
            idempotent: true,
        })
    }

    fn revoke_key(&self, key: Option<&IdempotencyKey>, actor: Actor) {
        if let Some(key) = key {
            self.idempotency.revoke(key, actor.user_id);
        }
    }

    fn validate_new_order(&self, actor: Actor, new_order: &NewOrder) -> Result<rust_decimal::Decimal> {
        let total = new_order.validate(self.config.max_items_per_order)?;
        if new_order.seller_id == actor.user_id {
            return Err(EscrowlineError::validation("buyer and seller must differ"));
        }
        if !self.catalog.seller_exists(new_order.seller_id) {
            return Err(EscrowlineError::validation(format!(
                "unknown seller {}",
                new_order.seller_id
            )));
        }
        if let Some(item) = new_order
            .items
            .iter()
            .find(|item| !self.catalog.product_exists(new_order.seller_id, &item.product_ref))
        {
            return Err(EscrowlineError::validation(format!(
                "unknown product {} for seller {}",
                item.product_ref, new_order.seller_id
            )));
        }
        Ok(total)
    }

    /// Orders the actor may see, newest first.
    pub fn list_orders(&self, actor: Actor, filter: &OrderFilter) -> Vec<Order> {
        self.orders.list(actor.order_scope(), filter)
    }

    pub fn get_order(&self, actor: Actor, order_id: OrderId) -> Result<Order> {
        let order = self.orders.get(order_id)?;
        actor.require_visible(&order)?;
        Ok(order)
    }

    /// Seller or admin moves an order along its lifecycle.
    ///
    /// SETTLED, REFUNDED and DISPUTED are only reachable through escrow and
    /// dispute operations. CANCELLED refunds the HOLD escrow first.
    pub fn update_status(
        &self,
        actor: Actor,
        order_id: OrderId,
        target: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order> {
        let order = self.orders.get(order_id)?;
        actor.require_fulfiller_or_admin(&order)?;
        if let Some(reason) = &reason {
            validate_reason(reason, false)?;
        }

        match target {
            OrderStatus::Settled | OrderStatus::Refunded | OrderStatus::Disputed => {
                Err(EscrowlineError::InvalidTransition {
                    from: order.status,
                    to: target,
                    reason: self.settlement_only_reason(order_id, target),
                })
            }
            OrderStatus::Cancelled => self.cancel(actor, &order, reason),
            _ => self
                .orders
                .transition(order_id, target, actor, reason, order.version),
        }
    }

    fn settlement_only_reason(&self, order_id: OrderId, target: OrderStatus) -> String {
        if let Some(open) = self.disputes.open_for(order_id) {
            return format!("escrow is frozen pending dispute {}", open.id);
        }
        match target {
            OrderStatus::Disputed => "raise a dispute to enter DISPUTED".into(),
            _ => format!("{target} is reached only through escrow settlement"),
        }
    }

    fn cancel(&self, actor: Actor, order: &Order, reason: Option<String>) -> Result<Order> {
        if !order.status.can_transition_to(OrderStatus::Cancelled) {
            return Err(EscrowlineError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Cancelled,
                reason: "only PENDING or CONFIRMED orders can be cancelled".into(),
            });
        }
        let escrow = self.ledger.get(order.id)?;
        if escrow.status == EscrowStatus::Hold {
            self.ledger.refund(
                order.id,
                EscrowTrigger::OrderCancelled,
                actor,
                CANCEL_REASON.into(),
                escrow.version,
            )?;
        }
        let note = reason.unwrap_or_else(|| CANCEL_REASON.to_string());
        self.orders.close_after_refund(order.id, actor, &note)
    }

    /// Buyer asks to return a delivered order. Funds stay on hold and the
    /// order leaves auto-release eligibility.
    pub fn request_return(&self, actor: Actor, order_id: OrderId, reason: &str) -> Result<Order> {
        validate_reason(reason, true)?;
        let order = self.orders.get(order_id)?;
        actor.require_buyer(&order)?;
        if let Some(open) = self.disputes.open_for(order_id) {
            return Err(EscrowlineError::DisputeExists {
                order_id,
                dispute_id: open.id,
            });
        }
        self.orders.transition(
            order_id,
            OrderStatus::ReturnRequested,
            actor,
            Some(reason.trim().to_string()),
            order.version,
        )
    }

    // -----------------------------------------------------------------
    // Disputes
    // -----------------------------------------------------------------

    pub fn raise_dispute(
        &self,
        actor: Actor,
        order_id: OrderId,
        reason: &str,
        trigger: DisputeTrigger,
    ) -> Result<SettlementOutcome> {
        self.disputes.raise(actor, order_id, reason, trigger)
    }

    pub fn resolve_dispute(
        &self,
        actor: Actor,
        dispute_id: DisputeId,
        resolution: Resolution,
        notes: Option<String>,
    ) -> Result<SettlementOutcome> {
        self.disputes.resolve(actor, dispute_id, resolution, notes)
    }

    /// Admin review queue.
    pub fn list_disputes(&self, actor: Actor, status: Option<DisputeStatus>) -> Result<Vec<Dispute>> {
        actor.require_admin()?;
        Ok(self.disputes.list(status))
    }

    pub fn get_dispute(&self, actor: Actor, dispute_id: DisputeId) -> Result<Dispute> {
        let dispute = self.disputes.get(dispute_id)?;
        if !actor.is_admin() {
            let order = self.orders.get(dispute.order_id)?;
            actor.require_visible(&order)?;
        }
        Ok(dispute)
    }

    // -----------------------------------------------------------------
    // Escrow
    // -----------------------------------------------------------------

    pub fn get_escrow(&self, actor: Actor, order_id: OrderId) -> Result<Escrow> {
        let order = self.orders.get(order_id)?;
        actor.require_visible(&order)?;
        self.ledger.get(order_id)
    }

    /// Reject fund movement on a closed or frozen escrow.
    fn require_movable(&self, escrow: &Escrow) -> Result<()> {
        if escrow.status.is_terminal() {
            return Err(EscrowlineError::EscrowTerminal {
                order_id: escrow.order_id,
                status: escrow.status,
            });
        }
        if escrow.status == EscrowStatus::Frozen {
            return Err(self.dispute_exists(escrow.order_id));
        }
        Ok(())
    }

    fn dispute_exists(&self, order_id: OrderId) -> EscrowlineError {
        match self.disputes.open_for(order_id) {
            Some(open) => EscrowlineError::DisputeExists {
                order_id,
                dispute_id: open.id,
            },
            None => EscrowlineError::EscrowTransitionRejected {
                order_id,
                from: EscrowStatus::Frozen,
                to: EscrowStatus::Released,
            },
        }
    }

    /// Buyer confirms delivery: HOLD → RELEASED and the order settles.
    pub fn confirm_delivery(&self, actor: Actor, order_id: OrderId) -> Result<SettlementOutcome> {
        let order = self.orders.get(order_id)?;
        actor.require_buyer(&order)?;
        let escrow = self.ledger.get(order_id)?;
        self.require_movable(&escrow)?;
        if order.status != OrderStatus::Delivered {
            return Err(EscrowlineError::OrderStateRejected {
                order_id,
                status: order.status,
                reason: "delivery can only be confirmed on a DELIVERED order".into(),
            });
        }
        if self.disputes.open_for(order_id).is_some() {
            return Err(self.dispute_exists(order_id));
        }

        let escrow =
            self.ledger
                .release(order_id, EscrowTrigger::BuyerConfirmation, actor, escrow.version)?;
        let order = self.orders.advance(
            order_id,
            OrderStatus::Settled,
            actor,
            Some("delivery confirmed by buyer".into()),
        )?;
        Ok(SettlementOutcome {
            order,
            escrow,
            dispute: None,
        })
    }

    /// Buyer asks for their money back. Routed into the dispute queue so an
    /// administrator reviews it; funds freeze meanwhile.
    pub fn request_refund(
        &self,
        actor: Actor,
        order_id: OrderId,
        reason: &str,
    ) -> Result<SettlementOutcome> {
        validate_reason(reason, true)?;
        let order = self.orders.get(order_id)?;
        actor.require_buyer(&order)?;
        let escrow = self.ledger.get(order_id)?;
        self.require_movable(&escrow)?;
        self.disputes
            .raise(actor, order_id, reason, DisputeTrigger::for_buyer(actor.role))
    }

    /// Forced release. An open dispute is resolved in the seller's favour.
    pub fn admin_release(
        &self,
        actor: Actor,
        order_id: OrderId,
        notes: Option<String>,
    ) -> Result<SettlementOutcome> {
        actor.require_admin()?;
        if let Some(open) = self.disputes.open_for(order_id) {
            return self
                .disputes
                .resolve(actor, open.id, Resolution::RejectReturn, notes);
        }

        let order = self.orders.get(order_id)?;
        let escrow = self.ledger.get(order_id)?;
        self.require_movable(&escrow)?;
        if !matches!(
            order.status,
            OrderStatus::Delivered | OrderStatus::ReturnRequested
        ) {
            return Err(EscrowlineError::OrderStateRejected {
                order_id,
                status: order.status,
                reason: "funds can only be released on a delivered order".into(),
            });
        }

        // Funds move first: a lost release leaves a pending return untouched.
        let escrow = self
            .ledger
            .release(order_id, EscrowTrigger::AdminRelease, actor, escrow.version)?;
        if order.status == OrderStatus::ReturnRequested {
            self.orders.advance(
                order_id,
                OrderStatus::Delivered,
                actor,
                Some("return request withdrawn by admin release".into()),
            )?;
        }
        let order = self
            .orders
            .advance(order_id, OrderStatus::Settled, actor, notes)?;
        Ok(SettlementOutcome {
            order,
            escrow,
            dispute: None,
        })
    }

    /// Forced refund. An open dispute is resolved in the buyer's favour.
    pub fn admin_refund(
        &self,
        actor: Actor,
        order_id: OrderId,
        reason: &str,
    ) -> Result<SettlementOutcome> {
        actor.require_admin()?;
        validate_reason(reason, true)?;
        let reason = reason.trim().to_string();
        if let Some(open) = self.disputes.open_for(order_id) {
            return self
                .disputes
                .resolve(actor, open.id, Resolution::ApproveReturn, Some(reason));
        }

        self.orders.get(order_id)?;
        let escrow = self.ledger.get(order_id)?;
        self.require_movable(&escrow)?;
        let escrow = self.ledger.refund(
            order_id,
            EscrowTrigger::AdminRefund,
            actor,
            reason.clone(),
            escrow.version,
        )?;
        let order = self.orders.close_after_refund(order_id, actor, &reason)?;
        Ok(SettlementOutcome {
            order,
            escrow,
            dispute: None,
        })
    }

    /// Admin listing of every escrow, newest first.
    pub fn list_escrows(
        &self,
        actor: Actor,
        status: Option<EscrowStatus>,
        page: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Page<Escrow>> {
        actor.require_admin()?;
        let request = PageRequest::new(page, limit)?;
        Ok(self.ledger.page(status, request))
    }

    // -----------------------------------------------------------------
    // Scheduler & audit
    // -----------------------------------------------------------------

    /// One auto-release pass, plus housekeeping: expired idempotency keys
    /// are purged and the audit outbox is retried.
    pub fn run_auto_release(&self, actor: Actor) -> Result<AutoReleaseReport> {
        actor.require_admin()?;
        let now = self.clock.now();
        let sla = Duration::from_std(self.config.auto_release_sla())
            .map_err(|e| EscrowlineError::Configuration(format!("auto_release_sla_secs: {e}")))?;

        let report = AutoReleasePass {
            ledger: &self.ledger,
            orders: &self.orders,
            disputes: &self.disputes,
        }
        .run(now, sla);

        let purged = self.idempotency.purge_expired(now);
        let flushed = self.audit.flush_outbox();
        self.audit.record(
            AuditDraft::new(
                actor,
                AuditAction::AutoReleaseRun,
                EntityRef::scheduler(),
                json!({
                    "scanned": report.scanned,
                    "released": report.released,
                    "skipped": report.skipped,
                    "failed": report.failed,
                    "purgedKeys": purged,
                }),
            ),
            now,
        );
        info!(
            scanned = report.scanned,
            released = report.released.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            purged_keys = purged,
            audit_redelivered = flushed.delivered,
            audit_dead_lettered = flushed.dead_lettered,
            audit_pending = flushed.remaining,
            "Auto-release pass complete"
        );
        Ok(report)
    }

    /// Read-only view of the audit trail.
    pub fn audit_query(&self, actor: Actor, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        actor.require_admin()?;
        Ok(self.audit.query(query))
    }

    /// Audit entries still waiting for redelivery.
    pub fn audit_backlog(&self) -> usize {
        self.audit.pending()
    }

    /// Audit entries that exhausted their scheduled retries.
    pub fn audit_dead_letters(&self) -> usize {
        self.audit.dead_lettered()
    }
}

#[cfg(test)]
mod tests {
    use escrowline_types::{AuditAction, Role, UserId, verify_chain};
    use rust_decimal::Decimal;

    use super::*;
    use crate::audit_trail::FlakySink;
    use crate::catalog::InMemoryCatalog;
    use crate::clock::ManualClock;
    use crate::idempotency::Reservation;

    struct FailingCommit(InMemoryIdempotencyStore);

    impl IdempotencyStore for FailingCommit {
        fn reserve(
            &self,
            key: &IdempotencyKey,
            actor: UserId,
            now: chrono::DateTime<chrono::Utc>,
        ) -> Result<Reservation> {
            self.0.reserve(key, actor, now)
        }

        fn commit(
            &self,
            _key: &IdempotencyKey,
            _actor: UserId,
            _order_id: OrderId,
            _now: chrono::DateTime<chrono::Utc>,
        ) -> Result<()> {
            Err(EscrowlineError::IdempotencyUnavailable("cache offline".into()))
        }

        fn revoke(&self, key: &IdempotencyKey, actor: UserId) {
            self.0.revoke(key, actor);
        }

        fn purge_expired(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
            self.0.purge_expired(now)
        }
    }

    fn customer() -> Actor {
        Actor::new(UserId::new(), Role::Customer)
    }

    fn dealer() -> Actor {
        Actor::new(UserId::new(), Role::Dealer)
    }

    fn admin() -> Actor {
        Actor::new(UserId::new(), Role::Admin)
    }

    fn key(raw: &str) -> Option<IdempotencyKey> {
        Some(IdempotencyKey::parse(raw).unwrap())
    }

    #[test]
    fn commit_failure_rolls_back_order_and_escrow() {
        let engine = SettlementEngine::builder(EngineConfig::default())
            .idempotency_store(Arc::new(FailingCommit(InMemoryIdempotencyStore::new(
                std::time::Duration::from_secs(30),
                std::time::Duration::from_secs(60),
            ))))
            .build()
            .unwrap();
        let buyer = customer();
        let seller = dealer();

        let err = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::ONE), key("k"))
            .unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert!(engine.orders.is_empty());
        assert!(engine.ledger.is_empty());
        assert!(engine.audit.is_empty());

        // Key was revoked, so the retry gets a fresh reservation instead of CONFLICT.
        let retry = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::ONE), key("k"))
            .unwrap_err();
        assert_eq!(retry.code(), "INTERNAL");
    }

    #[test]
    fn validation_failure_revokes_key() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        let buyer = customer();
        let seller = dealer();
        let empty = NewOrder {
            items: vec![],
            ..NewOrder::dummy(seller.user_id, Decimal::ONE)
        };
        let err = engine.create_order(buyer, empty, key("k")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let ok = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::ONE), key("k"))
            .unwrap();
        assert!(!ok.idempotent);
    }

    #[test]
    fn unknown_catalog_entries_are_rejected() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let seller = dealer();
        catalog.add_product(seller.user_id, "SKU-1");
        let engine = SettlementEngine::builder(EngineConfig::default())
            .catalog(catalog)
            .build()
            .unwrap();

        let ok = engine.create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::ONE), None);
        assert!(ok.is_ok());

        let stranger = engine
            .create_order(customer(), NewOrder::dummy(UserId::new(), Decimal::ONE), None)
            .unwrap_err();
        assert_eq!(stranger.code(), "VALIDATION_ERROR");

        let mut unknown_sku = NewOrder::dummy(seller.user_id, Decimal::ONE);
        unknown_sku.items[0].product_ref = escrowline_types::ProductRef::new("SKU-404");
        let err = engine.create_order(customer(), unknown_sku, None).unwrap_err();
        assert!(err.to_string().contains("SKU-404"));
    }

    #[test]
    fn manufacturer_cannot_place_orders() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        let maker = Actor::new(UserId::new(), Role::Manufacturer);
        let err = engine
            .create_order(maker, NewOrder::dummy(UserId::new(), Decimal::ONE), None)
            .unwrap_err();
        assert_eq!(err.code(), "FORBIDDEN");
    }

    #[test]
    fn audit_outage_does_not_roll_back_release() {
        let sink = Arc::new(FlakySink::new(0));
        let engine = SettlementEngine::builder(EngineConfig::default())
            .audit_sink(sink.clone())
            .build()
            .unwrap();
        let buyer = customer();
        let seller = dealer();
        let created = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap();
        let id = created.order.id;
        for status in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            engine.update_status(seller, id, status, None).unwrap();
        }

        sink.fail_next(2);
        let outcome = engine.confirm_delivery(buyer, id).unwrap();
        assert_eq!(outcome.escrow.status, EscrowStatus::Released);
        assert_eq!(outcome.order.status, OrderStatus::Settled);
        assert_eq!(engine.audit_backlog(), 2);

        engine.run_auto_release(Actor::system()).unwrap();
        assert_eq!(engine.audit_backlog(), 0);
        let entries = sink.snapshot();
        assert!(verify_chain(&entries).is_ok());
        assert!(entries.iter().any(|e| e.action == AuditAction::EscrowReleased));
        assert_eq!(entries.last().unwrap().action, AuditAction::AutoReleaseRun);
    }

    #[test]
    fn cancel_refunds_hold_escrow() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        let seller = dealer();
        let created = engine
            .create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap();
        let order = engine
            .update_status(seller, created.order.id, OrderStatus::Cancelled, None)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        let escrow = engine.ledger.get(order.id).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Refunded);
        assert_eq!(escrow.refund_reason.as_deref(), Some(CANCEL_REASON));
    }

    #[test]
    fn cancel_after_shipment_is_rejected_without_refund() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        let seller = dealer();
        let created = engine
            .create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap();
        let id = created.order.id;
        engine.update_status(seller, id, OrderStatus::Confirmed, None).unwrap();
        engine.update_status(seller, id, OrderStatus::Shipped, None).unwrap();
        let err = engine
            .update_status(seller, id, OrderStatus::Cancelled, None)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(engine.ledger.get(id).unwrap().status, EscrowStatus::Hold);
    }

    #[test]
    fn auto_release_pass_honours_sla() {
        let clock = Arc::new(ManualClock::default());
        let engine = SettlementEngine::builder(EngineConfig::default())
            .clock(clock.clone())
            .build()
            .unwrap();
        let seller = dealer();
        let created = engine
            .create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap();
        let id = created.order.id;
        for status in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            engine.update_status(seller, id, status, None).unwrap();
        }

        clock.advance(Duration::hours(47));
        let early = engine.run_auto_release(admin()).unwrap();
        assert_eq!(early.scanned, 1);
        assert!(early.released.is_empty());
        assert_eq!(early.skipped[0].reason, "sla not elapsed");

        clock.advance(Duration::hours(2));
        let due = engine.run_auto_release(admin()).unwrap();
        assert_eq!(due.released, vec![id]);
        let escrow = engine.ledger.get(id).unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert_eq!(escrow.resolution_actor, Some(Actor::system()));
        assert_eq!(engine.orders.get(id).unwrap().status, OrderStatus::Settled);
    }

    #[test]
    fn key_still_replays_after_store_retention() {
        let clock = Arc::new(ManualClock::default());
        let engine = SettlementEngine::builder(EngineConfig::default())
            .clock(clock.clone())
            .build()
            .unwrap();
        let buyer = customer();
        let seller = dealer();
        let first = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), key("checkout-1"))
            .unwrap();

        clock.advance(Duration::hours(25));
        engine.run_auto_release(admin()).unwrap();

        let second = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), key("checkout-1"))
            .unwrap();
        assert!(second.idempotent);
        assert_eq!(second.order.id, first.order.id);
        assert_eq!(engine.orders.len(), 1);
        assert_eq!(engine.ledger.len(), 1);

        // The key is bound again, so the next replay comes from the store.
        let reservation = engine
            .idempotency
            .reserve(&IdempotencyKey::parse("checkout-1").unwrap(), buyer.user_id, clock.now())
            .unwrap();
        assert_eq!(reservation, Reservation::Existing(first.order.id));
    }

    fn returned_order(engine: &SettlementEngine) -> (OrderId, Actor) {
        let buyer = customer();
        let seller = dealer();
        let id = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap()
            .order
            .id;
        for status in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            engine.update_status(seller, id, status, None).unwrap();
        }
        engine.request_return(buyer, id, "does not fit").unwrap();
        (id, buyer)
    }

    #[test]
    fn admin_release_moves_funds_before_withdrawing_return() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        let (id, _) = returned_order(&engine);

        let outcome = engine.admin_release(admin(), id, None).unwrap();
        assert_eq!(outcome.order.status, OrderStatus::Settled);

        let trail = engine.audit.query(&AuditQuery::default());
        let released = trail
            .iter()
            .find(|e| e.action == AuditAction::EscrowReleased)
            .unwrap()
            .sequence;
        let withdrawn = trail
            .iter()
            .find(|e| {
                e.action == AuditAction::OrderStatusChanged
                    && e.details["from"] == "RETURN_REQUESTED"
                    && e.details["to"] == "DELIVERED"
            })
            .unwrap()
            .sequence;
        assert!(released < withdrawn);
    }

    #[test]
    fn lost_admin_release_keeps_return_request() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        for _ in 0..50 {
            let (id, _) = returned_order(&engine);
            let barrier = std::sync::Barrier::new(2);
            let (release, refund) = std::thread::scope(|scope| {
                let release = scope.spawn(|| {
                    barrier.wait();
                    engine.admin_release(admin(), id, None)
                });
                let refund = scope.spawn(|| {
                    barrier.wait();
                    engine.admin_refund(admin(), id, "item returned")
                });
                (release.join().unwrap(), refund.join().unwrap())
            });
            assert_ne!(release.is_ok(), refund.is_ok());

            let order = engine.orders.get(id).unwrap();
            if release.is_err() {
                assert_eq!(order.status, OrderStatus::Refunded);
                assert!(!order.timeline.iter().any(|c| c.from == OrderStatus::ReturnRequested
                    && c.to == OrderStatus::Delivered));
            } else {
                assert_eq!(order.status, OrderStatus::Settled);
            }
        }
    }

    #[test]
    fn long_audit_outage_dead_letters_but_keeps_release_entry() {
        let sink = Arc::new(FlakySink::new(0));
        let config = EngineConfig {
            audit_retry_limit: 1,
            ..EngineConfig::default()
        };
        let engine = SettlementEngine::builder(config)
            .audit_sink(sink.clone())
            .build()
            .unwrap();
        let buyer = customer();
        let seller = dealer();
        let id = engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), None)
            .unwrap()
            .order
            .id;
        for status in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            engine.update_status(seller, id, status, None).unwrap();
        }

        sink.fail_next(usize::MAX);
        engine.confirm_delivery(buyer, id).unwrap();
        engine.run_auto_release(admin()).unwrap();
        assert_eq!(engine.audit_dead_letters(), 2);
        assert_eq!(engine.audit_backlog(), 3);

        sink.fail_next(0);
        engine.run_auto_release(admin()).unwrap();
        assert_eq!(engine.audit_backlog(), 0);
        let entries = sink.snapshot();
        assert!(entries.iter().any(|e| e.action == AuditAction::EscrowReleased));
        assert!(verify_chain(&entries).is_ok());
    }

    #[test]
    fn auto_release_requires_admin() {
        let engine = SettlementEngine::builder(EngineConfig::default()).build().unwrap();
        assert_eq!(
            engine.run_auto_release(customer()).unwrap_err().code(),
            "FORBIDDEN"
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            audit_retry_limit: 0,
            ..EngineConfig::default()
        };
        assert!(SettlementEngine::builder(config).build().is_err());
    }
}
