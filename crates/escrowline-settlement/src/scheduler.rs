//! Auto-Release Scheduler.
//!
//! A pass selects HOLD escrows whose order has sat in DELIVERED longer
//! than the SLA with no OPEN dispute, then releases each one as SYSTEM.
//! The dispute check is repeated right before each release, and the
//! release itself is a CAS against the escrow version read during
//! selection, so a dispute that lands in between wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use escrowline_types::{
    Actor, EscrowStatus, EscrowTrigger, EscrowlineError, OrderId, OrderStatus, Result,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::disputes::DisputeDesk;
use crate::engine::SettlementEngine;
use crate::ledger::EscrowLedger;
use crate::orders::OrderLifecycle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRelease {
    pub order_id: OrderId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRelease {
    pub order_id: OrderId,
    pub code: String,
}

/// What one pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoReleaseReport {
    pub ran_at: DateTime<Utc>,
    /// HOLD escrows whose order was DELIVERED when the pass started.
    pub scanned: usize,
    pub released: Vec<OrderId>,
    pub skipped: Vec<SkippedRelease>,
    pub failed: Vec<FailedRelease>,
}

impl AutoReleaseReport {
    fn new(ran_at: DateTime<Utc>) -> Self {
        Self {
            ran_at,
            scanned: 0,
            released: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn skip(&mut self, order_id: OrderId, reason: &str) {
        self.skipped.push(SkippedRelease {
            order_id,
            reason: reason.to_string(),
        });
    }
}

/// One scan-and-release pass over the ledger.
pub(crate) struct AutoReleasePass<'a> {
    pub ledger: &'a EscrowLedger,
    pub orders: &'a OrderLifecycle,
    pub disputes: &'a DisputeDesk,
}

impl AutoReleasePass<'_> {
    pub fn run(&self, now: DateTime<Utc>, sla: chrono::Duration) -> AutoReleaseReport {
        let mut report = AutoReleaseReport::new(now);
        let cutoff = now - sla;
        let system = Actor::system();

        for escrow in self.ledger.list(Some(EscrowStatus::Hold)) {
            let order_id = escrow.order_id;
            let Ok(order) = self.orders.get(order_id) else {
                report.failed.push(FailedRelease {
                    order_id,
                    code: "NOT_FOUND".into(),
                });
                continue;
            };
            if order.status != OrderStatus::Delivered {
                continue;
            }
            report.scanned += 1;

            if order.delivered_at().is_none_or(|at| at > cutoff) {
                report.skip(order_id, "sla not elapsed");
                continue;
            }
            if self.disputes.open_for(order_id).is_some() {
                report.skip(order_id, "open dispute");
                continue;
            }

            match self.release(order_id, escrow.version, system) {
                Ok(()) => report.released.push(order_id),
                Err(e) => {
                    warn!(%order_id, error = %e, "Auto-release failed");
                    report.failed.push(FailedRelease {
                        order_id,
                        code: e.code().to_string(),
                    });
                }
            }
        }
        report
    }

    fn release(&self, order_id: OrderId, expected_version: u64, system: Actor) -> Result<()> {
        // Last-moment check; the CAS below covers anything after it.
        if let Some(open) = self.disputes.open_for(order_id) {
            return Err(EscrowlineError::DisputeExists {
                order_id,
                dispute_id: open.id,
            });
        }
        self.ledger
            .release(order_id, EscrowTrigger::AutoRelease, system, expected_version)?;
        if let Err(e) = self.orders.advance(
            order_id,
            OrderStatus::Settled,
            system,
            Some("auto-release after delivery SLA".into()),
        ) {
            error!(%order_id, error = %e, "Escrow auto-released but order could not settle");
            return Err(e);
        }
        Ok(())
    }
}

/// Periodic background runner for auto-release passes.
pub struct AutoReleaseScheduler;

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the task to stop and wait for the in-progress pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Auto-release task ended abnormally");
        }
    }
}

impl AutoReleaseScheduler {
    /// Run a pass every `interval` until the returned handle is shut down.
    /// The first pass happens one interval after spawning.
    #[must_use]
    pub fn spawn(engine: Arc<SettlementEngine>, interval: Duration) -> SchedulerHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(interval_secs = interval.as_secs(), "Auto-release scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.run_auto_release(Actor::system()) {
                            Ok(report) => debug!(
                                scanned = report.scanned,
                                released = report.released.len(),
                                skipped = report.skipped.len(),
                                failed = report.failed.len(),
                                "Scheduled auto-release pass"
                            ),
                            Err(e) => error!(error = %e, "Scheduled auto-release pass failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Auto-release scheduler stopped");
        });
        SchedulerHandle { shutdown, task }
    }
}
