//! # escrowline-settlement
//!
//! **Settlement plane**: order lifecycle, escrow ledger, disputes,
//! auto-release, idempotent order creation and the audit trail.
//!
//! ## Architecture
//!
//! [`SettlementEngine`] is the facade. Each call:
//! 1. Authorizes the actor against the order it touches
//! 2. Reads the current escrow and order versions
//! 3. Moves funds through [`EscrowLedger`] (compare-and-swap on version)
//! 4. Moves the order through [`OrderLifecycle`]
//! 5. Writes an audit entry per committed transition ([`AuditTrail`])
//! 6. Emits a [`SettlementEvent`] for downstream notification
//!
//! Locks are always taken in the order order → escrow → audit, and the
//! ledger never locks an order, so two operations cannot deadlock.
//!
//! ## Pluggable edges
//!
//! - [`Clock`]: wall time, or [`ManualClock`] for SLA tests
//! - [`IdempotencyStore`]: reservation cache for `create_order`
//! - [`AuditSink`]: append-only, hash-chained audit storage
//! - [`CatalogResolver`]: seller and product existence
//! - [`Notifier`]: fire-and-forget event delivery

pub mod audit_trail;
pub mod catalog;
pub mod clock;
pub mod disputes;
pub mod engine;
pub mod idempotency;
pub mod ledger;
pub mod notify;
pub mod orders;
pub mod outcome;
pub mod scheduler;
pub mod ttl_store;

#[cfg(any(test, feature = "test-helpers"))]
pub use audit_trail::FlakySink;
pub use audit_trail::{AuditSink, AuditTrail, FlushReport, MemoryAuditSink};
pub use catalog::{CatalogResolver, InMemoryCatalog, OpenCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use disputes::DisputeDesk;
pub use engine::{EngineBuilder, SettlementEngine};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, Reservation};
pub use ledger::EscrowLedger;
pub use notify::{ChannelNotifier, Notifier, SettlementEvent, TracingNotifier};
pub use orders::OrderLifecycle;
pub use outcome::{CreatedOrder, Page, PageRequest, SettlementOutcome};
pub use scheduler::{
    AutoReleaseReport, AutoReleaseScheduler, FailedRelease, SchedulerHandle, SkippedRelease,
};
pub use ttl_store::TtlStore;
