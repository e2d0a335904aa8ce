//! End-to-end settlement scenarios.
//!
//! These drive the public `SettlementEngine` API the way a storefront
//! would: checkout, fulfilment, delivery confirmation, disputes, admin
//! overrides, and the auto-release pass, then check the audit chain that
//! all of it left behind.

use std::sync::Arc;
use std::thread;

use chrono::Duration;
use escrowline_settlement::{
    ChannelNotifier, ManualClock, MemoryAuditSink, SettlementEngine, SettlementEvent,
};
use escrowline_types::*;
use rust_decimal::Decimal;

/// Engine plus the handles tests inspect.
struct Harness {
    engine: SettlementEngine,
    clock: Arc<ManualClock>,
    audit: Arc<MemoryAuditSink>,
    admin: Actor,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = SettlementEngine::builder(EngineConfig::default())
            .clock(clock.clone())
            .audit_sink(audit.clone())
            .build()
            .expect("default config is valid");
        Self {
            engine,
            clock,
            audit,
            admin: Actor::new(UserId::new(), Role::Admin),
        }
    }

    /// Create an order and walk it to DELIVERED as the seller.
    fn delivered_order(&self, buyer: Actor, seller: Actor, total: Decimal) -> OrderId {
        let created = self
            .engine
            .create_order(buyer, NewOrder::dummy(seller.user_id, total), None)
            .expect("order creation should succeed");
        let id = created.order.id;
        for status in [OrderStatus::Confirmed, OrderStatus::Shipped, OrderStatus::Delivered] {
            self.engine
                .update_status(seller, id, status, None)
                .expect("fulfilment step should succeed");
        }
        id
    }
}

fn customer() -> Actor {
    Actor::new(UserId::new(), Role::Customer)
}

fn dealer() -> Actor {
    Actor::new(UserId::new(), Role::Dealer)
}

fn manufacturer() -> Actor {
    Actor::new(UserId::new(), Role::Manufacturer)
}

// =========================================================================
// Happy path
// =========================================================================

#[test]
fn confirmed_delivery_releases_funds_and_settles() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let total = Decimal::new(12_400, 0);

    let id = h.delivered_order(buyer, seller, total);
    let escrow = h.engine.get_escrow(buyer, id).unwrap();
    assert_eq!(escrow.status, EscrowStatus::Hold);
    assert_eq!(escrow.amount, total);

    let outcome = h.engine.confirm_delivery(buyer, id).unwrap();
    assert_eq!(outcome.escrow.status, EscrowStatus::Released);
    assert_eq!(outcome.escrow.last_trigger, Some(EscrowTrigger::BuyerConfirmation));
    assert_eq!(outcome.escrow.resolution_actor, Some(buyer));
    assert!(outcome.escrow.resolved_at.is_some());
    assert_eq!(outcome.order.status, OrderStatus::Settled);

    // Funds already moved: a late refund request is refused outright.
    let err = h
        .engine
        .request_refund(buyer, id, "changed my mind")
        .unwrap_err();
    assert_eq!(err.code(), "ESCROW_TERMINAL");
    assert!(h.engine.list_disputes(h.admin, None).unwrap().is_empty());
}

#[test]
fn confirm_before_delivery_is_rejected() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let created = h
        .engine
        .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), None)
        .unwrap();
    let err = h.engine.confirm_delivery(buyer, created.order.id).unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    assert_eq!(
        h.engine.get_escrow(buyer, created.order.id).unwrap().status,
        EscrowStatus::Hold
    );
}

#[test]
fn only_the_buyer_confirms_delivery() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    assert_eq!(h.engine.confirm_delivery(seller, id).unwrap_err().code(), "FORBIDDEN");
    assert_eq!(
        h.engine.confirm_delivery(customer(), id).unwrap_err().code(),
        "FORBIDDEN"
    );
}

#[test]
fn strangers_cannot_see_orders() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    assert!(h.engine.get_order(seller, id).is_ok());
    assert!(h.engine.get_order(h.admin, id).is_ok());
    assert_eq!(h.engine.get_order(customer(), id).unwrap_err().code(), "FORBIDDEN");
    assert!(h.engine.list_orders(customer(), &OrderFilter::default()).is_empty());
    assert_eq!(h.engine.list_orders(buyer, &OrderFilter::default()).len(), 1);
}

#[test]
fn settlement_statuses_cannot_be_set_directly() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    for target in [OrderStatus::Settled, OrderStatus::Refunded, OrderStatus::Disputed] {
        let err = h.engine.update_status(seller, id, target, None).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION", "{target}");
    }
    assert_eq!(h.engine.get_escrow(buyer, id).unwrap().status, EscrowStatus::Hold);
}

// =========================================================================
// Order totals and idempotency
// =========================================================================

#[test]
fn escrow_amount_equals_sum_of_lines() {
    let h = Harness::new();
    let seller = dealer();
    for lines in [1, 3, 17] {
        let new_order = NewOrder::random(seller.user_id, lines);
        let expected: Decimal = new_order
            .items
            .iter()
            .map(|item| item.unit_price * Decimal::from(item.quantity))
            .sum();
        let created = h.engine.create_order(customer(), new_order, None).unwrap();
        assert_eq!(created.order.total, expected);
        assert_eq!(created.escrow.amount, expected);
        assert_eq!(created.escrow.status, EscrowStatus::Hold);
    }
}

#[test]
fn repeated_key_returns_original_order() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let key = IdempotencyKey::parse("checkout-7781").unwrap();

    let first = h
        .engine
        .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), Some(key.clone()))
        .unwrap();
    let second = h
        .engine
        .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), Some(key.clone()))
        .unwrap();

    assert!(!first.idempotent);
    assert!(second.idempotent);
    assert_eq!(first.order.id, second.order.id);
    let escrows = h.engine.list_escrows(h.admin, None, None, None).unwrap();
    assert_eq!(escrows.total, 1);

    // Keys are scoped per buyer.
    let other = h
        .engine
        .create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::TEN), Some(key))
        .unwrap();
    assert_ne!(other.order.id, first.order.id);
    assert_eq!(h.engine.list_escrows(h.admin, None, None, None).unwrap().total, 2);
}

#[test]
fn concurrent_creates_with_one_key_make_one_order() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let key = IdempotencyKey::parse("double-click").unwrap();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let key = key.clone();
                let engine = &h.engine;
                s.spawn(move || {
                    engine.create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::ONE), Some(key))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert!(!created.is_empty());
    assert!(created.iter().all(|c| c.order.id == created[0].order.id));
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(err.code(), "CONFLICT");
    }
    assert_eq!(h.engine.list_escrows(h.admin, None, None, None).unwrap().total, 1);
}

// =========================================================================
// Disputes
// =========================================================================

#[test]
fn damaged_goods_dispute_refunds_buyer() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::new(5_000, 0));

    let raised = h
        .engine
        .raise_dispute(buyer, id, "screen arrived cracked", DisputeTrigger::CustomerToDealer)
        .unwrap();
    let dispute = raised.dispute.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);
    assert_eq!(raised.escrow.status, EscrowStatus::Frozen);
    assert_eq!(raised.order.status, OrderStatus::Disputed);

    // Frozen funds cannot be touched by the buyer.
    assert_eq!(h.engine.confirm_delivery(buyer, id).unwrap_err().code(), "DISPUTE_EXISTS");

    let resolved = h
        .engine
        .resolve_dispute(
            h.admin,
            dispute.id,
            Resolution::ApproveReturn,
            Some("photos confirm damage".into()),
        )
        .unwrap();
    assert_eq!(resolved.escrow.status, EscrowStatus::Refunded);
    assert!(resolved.escrow.refund_reason.unwrap().contains("screen arrived cracked"));
    assert_eq!(resolved.order.status, OrderStatus::Refunded);
    let closed = resolved.dispute.unwrap();
    assert_eq!(closed.status, DisputeStatus::Resolved);
    assert_eq!(closed.resolution, Some(Resolution::ApproveReturn));
    assert_eq!(closed.resolved_by, Some(h.admin));

    let again = h
        .engine
        .resolve_dispute(h.admin, dispute.id, Resolution::RejectReturn, None)
        .unwrap_err();
    assert_eq!(again.code(), "ALREADY_RESOLVED");
    assert_eq!(h.engine.get_escrow(buyer, id).unwrap().status, EscrowStatus::Refunded);
}

#[test]
fn rejected_dispute_releases_to_seller() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);
    let raised = h
        .engine
        .raise_dispute(buyer, id, "not as described", DisputeTrigger::CustomerToDealer)
        .unwrap();

    let resolved = h
        .engine
        .resolve_dispute(h.admin, raised.dispute.unwrap().id, Resolution::RejectReturn, None)
        .unwrap();
    assert_eq!(resolved.escrow.status, EscrowStatus::Released);
    assert_eq!(resolved.escrow.last_trigger, Some(EscrowTrigger::DisputeRejected));
    assert_eq!(resolved.order.status, OrderStatus::Settled);
}

#[test]
fn second_dispute_on_order_is_refused() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);
    let first = h
        .engine
        .raise_dispute(buyer, id, "missing parts", DisputeTrigger::CustomerToDealer)
        .unwrap()
        .dispute
        .unwrap();

    let err = h
        .engine
        .raise_dispute(buyer, id, "still missing parts", DisputeTrigger::CustomerToDealer)
        .unwrap_err();
    assert_eq!(err.code(), "DISPUTE_EXISTS");
    assert!(err.to_string().contains(&first.id.to_string()));
    assert_eq!(h.engine.list_disputes(h.admin, None).unwrap().len(), 1);
}

#[test]
fn dispute_trigger_must_match_role() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    let err = h
        .engine
        .raise_dispute(buyer, id, "wrong colour", DisputeTrigger::DealerToManufacturer)
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert_eq!(h.engine.get_escrow(buyer, id).unwrap().status, EscrowStatus::Hold);
}

#[test]
fn dealer_refund_request_goes_to_manufacturer_dispute() {
    let h = Harness::new();
    let dealer_buyer = dealer();
    let maker = manufacturer();
    let id = h.delivered_order(dealer_buyer, maker, Decimal::new(80_000, 0));

    let outcome = h
        .engine
        .request_refund(dealer_buyer, id, "batch failed inspection")
        .unwrap();
    let dispute = outcome.dispute.unwrap();
    assert_eq!(dispute.trigger_type, DisputeTrigger::DealerToManufacturer);
    assert_eq!(outcome.escrow.status, EscrowStatus::Frozen);
}

#[test]
fn refund_request_needs_reason() {
    let h = Harness::new();
    let buyer = customer();
    let id = h.delivered_order(buyer, dealer(), Decimal::TEN);
    assert_eq!(
        h.engine.request_refund(buyer, id, "   ").unwrap_err().code(),
        "VALIDATION_ERROR"
    );
}

// =========================================================================
// Admin overrides
// =========================================================================

#[test]
fn admin_release_resolves_open_dispute_for_seller() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);
    h.engine
        .raise_dispute(buyer, id, "late delivery", DisputeTrigger::CustomerToDealer)
        .unwrap();

    let outcome = h.engine.admin_release(h.admin, id, None).unwrap();
    assert_eq!(outcome.escrow.status, EscrowStatus::Released);
    assert_eq!(outcome.dispute.unwrap().resolution, Some(Resolution::RejectReturn));
    assert!(h.engine.list_disputes(h.admin, Some(DisputeStatus::Open)).unwrap().is_empty());
}

#[test]
fn admin_refund_requires_reason_and_admin() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    assert_eq!(
        h.engine.admin_refund(seller, id, "fraud").unwrap_err().code(),
        "FORBIDDEN"
    );
    assert_eq!(
        h.engine.admin_refund(h.admin, id, "").unwrap_err().code(),
        "VALIDATION_ERROR"
    );

    let outcome = h.engine.admin_refund(h.admin, id, "seller fraud").unwrap();
    assert_eq!(outcome.escrow.status, EscrowStatus::Refunded);
    assert_eq!(outcome.escrow.refund_reason.as_deref(), Some("seller fraud"));
    assert_eq!(outcome.order.status, OrderStatus::Refunded);

    assert_eq!(
        h.engine.admin_release(h.admin, id, None).unwrap_err().code(),
        "ESCROW_TERMINAL"
    );
}

#[test]
fn return_request_then_admin_release() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    let order = h.engine.request_return(buyer, id, "does not fit").unwrap();
    assert_eq!(order.status, OrderStatus::ReturnRequested);

    let outcome = h.engine.admin_release(h.admin, id, Some("return window closed".into())).unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Settled);
    assert_eq!(outcome.escrow.last_trigger, Some(EscrowTrigger::AdminRelease));
}

#[test]
fn escrow_listing_is_admin_only_and_paged() {
    let h = Harness::new();
    let seller = dealer();
    for _ in 0..5 {
        h.engine
            .create_order(customer(), NewOrder::dummy(seller.user_id, Decimal::ONE), None)
            .unwrap();
    }
    assert_eq!(
        h.engine.list_escrows(seller, None, None, None).unwrap_err().code(),
        "FORBIDDEN"
    );
    let page = h
        .engine
        .list_escrows(h.admin, Some(EscrowStatus::Hold), Some(2), Some(2))
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.items.len(), 2);
    assert!(h.engine.list_escrows(h.admin, None, None, Some(0)).is_err());
}

// =========================================================================
// Concurrency
// =========================================================================

#[test]
fn concurrent_confirmations_move_funds_once() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::new(999, 0));

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = &h.engine;
                s.spawn(move || engine.confirm_delivery(buyer, id))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(
            matches!(err.code(), "CONFLICT" | "ESCROW_TERMINAL"),
            "unexpected {err}"
        );
    }
    let released = h
        .audit
        .snapshot()
        .into_iter()
        .filter(|e| e.action == AuditAction::EscrowReleased)
        .count();
    assert_eq!(released, 1);
}

#[test]
fn release_and_dispute_race_has_one_winner() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);

    let (confirm, dispute) = thread::scope(|s| {
        let engine = &h.engine;
        let a = s.spawn(move || engine.confirm_delivery(buyer, id));
        let b = s.spawn(move || {
            engine.raise_dispute(buyer, id, "race", DisputeTrigger::CustomerToDealer)
        });
        (a.join().unwrap(), b.join().unwrap())
    });

    let escrow = h.engine.get_escrow(buyer, id).unwrap();
    let disputes = h.engine.list_disputes(h.admin, None).unwrap();
    match (confirm.is_ok(), dispute.is_ok()) {
        (true, false) => {
            assert_eq!(escrow.status, EscrowStatus::Released);
            // The losing raise leaves no dispute behind.
            assert!(disputes.is_empty());
        }
        (false, true) => {
            assert_eq!(escrow.status, EscrowStatus::Frozen);
            assert_eq!(disputes.len(), 1);
        }
        other => panic!("expected exactly one winner, got {other:?}"),
    }
}

// =========================================================================
// Auto-release
// =========================================================================

#[test]
fn auto_release_skips_disputed_and_returned_orders() {
    let h = Harness::new();
    let seller = dealer();
    let quiet_buyer = customer();
    let unhappy_buyer = customer();
    let returning_buyer = customer();

    let quiet = h.delivered_order(quiet_buyer, seller, Decimal::TEN);
    let disputed = h.delivered_order(unhappy_buyer, seller, Decimal::TEN);
    let returned = h.delivered_order(returning_buyer, seller, Decimal::TEN);
    h.engine
        .raise_dispute(unhappy_buyer, disputed, "never arrived", DisputeTrigger::CustomerToDealer)
        .unwrap();
    h.engine.request_return(returning_buyer, returned, "wrong size").unwrap();

    h.clock.advance(Duration::hours(49));
    let report = h.engine.run_auto_release(Actor::system()).unwrap();

    assert_eq!(report.released, vec![quiet]);
    assert!(report.failed.is_empty());
    assert_eq!(h.engine.get_escrow(quiet_buyer, quiet).unwrap().status, EscrowStatus::Released);
    assert_eq!(
        h.engine.get_escrow(unhappy_buyer, disputed).unwrap().status,
        EscrowStatus::Frozen
    );
    assert_eq!(
        h.engine.get_escrow(returning_buyer, returned).unwrap().status,
        EscrowStatus::Hold
    );

    // A second pass finds nothing left to do.
    let again = h.engine.run_auto_release(Actor::system()).unwrap();
    assert!(again.released.is_empty());
}

#[test]
fn auto_release_waits_for_sla() {
    let h = Harness::new();
    let buyer = customer();
    let id = h.delivered_order(buyer, dealer(), Decimal::TEN);

    h.clock.advance(Duration::hours(24));
    let report = h.engine.run_auto_release(h.admin).unwrap();
    assert!(report.released.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].order_id, id);
}

// =========================================================================
// Audit & notifications
// =========================================================================

#[test]
fn every_transition_lands_in_a_valid_chain() {
    let h = Harness::new();
    let buyer = customer();
    let seller = dealer();
    let id = h.delivered_order(buyer, seller, Decimal::TEN);
    h.engine.confirm_delivery(buyer, id).unwrap();

    let entries = h.audit.snapshot();
    assert!(verify_chain(&entries).is_ok());
    assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.sequence, i as u64 + 1);
    }
    let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
    assert_eq!(actions.first(), Some(&AuditAction::OrderCreated));
    assert!(actions.contains(&AuditAction::EscrowReleased));

    let escrow_trail = h
        .engine
        .audit_query(
            h.admin,
            &AuditQuery {
                entity_kind: Some(EntityKind::Escrow),
                entity_id: Some(id.to_string()),
                ..AuditQuery::default()
            },
        )
        .unwrap();
    assert_eq!(escrow_trail.len(), 1);
    assert_eq!(escrow_trail[0].actor_id, buyer.user_id);

    assert_eq!(
        h.engine.audit_query(buyer, &AuditQuery::default()).unwrap_err().code(),
        "FORBIDDEN"
    );
}

#[test]
fn tampering_breaks_the_chain() {
    let h = Harness::new();
    let buyer = customer();
    let id = h.delivered_order(buyer, dealer(), Decimal::TEN);
    h.engine.confirm_delivery(buyer, id).unwrap();

    let mut entries = h.audit.snapshot();
    entries[2].details = serde_json::json!({ "to": "SETTLED" });
    assert_eq!(verify_chain(&entries), Err(3));
}

#[test]
fn events_follow_fund_movement() {
    let (notifier, mut events) = ChannelNotifier::new();
    let engine = SettlementEngine::builder(EngineConfig::default())
        .notifier(Arc::new(notifier))
        .build()
        .unwrap();
    let buyer = customer();
    let seller = dealer();
    let created = engine
        .create_order(buyer, NewOrder::dummy(seller.user_id, Decimal::TEN), None)
        .unwrap();
    engine
        .update_status(seller, created.order.id, OrderStatus::Cancelled, None)
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(SettlementEvent::OrderCreated { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        SettlementEvent::EscrowRefunded { reason, .. } if reason.as_deref() == Some("order cancelled")
    )));
    assert!(seen.iter().all(|e| e.order_id() == created.order.id));
}
