//! Append-only audit trail with an out-of-band retry outbox.
//!
//! A committed state transition is the source of truth. If the sink
//! refuses its audit entry, the transition is *not* rolled back: the draft
//! is queued and retried on later writes and on every scheduler pass. Only
//! scheduled flushes count as attempts. An entry that fails
//! `retry_limit` flushes moves to the dead-letter queue, which is reported
//! as backlog and still retried on every flush. No entry is ever dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use escrowline_types::audit::GENESIS_HASH;
use escrowline_types::{AuditDraft, AuditLogEntry, AuditQuery, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// Storage for sealed audit entries.
///
/// Implementations expose insert and read paths only. Nothing returned by
/// [`AuditSink::query`] can reach back into the store.
pub trait AuditSink: Send + Sync {
    /// Seal `draft` as the next entry of the chain and store it.
    fn append(&self, draft: AuditDraft, at: DateTime<Utc>) -> Result<AuditLogEntry>;

    /// Matching entries in sequence order.
    fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process sink. Sealing and insertion happen under one lock so the
/// hash chain has no gaps or forks.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the full trail, for chain verification.
    pub fn snapshot(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, draft: AuditDraft, at: DateTime<Utc>) -> Result<AuditLogEntry> {
        let mut entries = self.entries.lock();
        let prev_hash = entries
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
        let sequence = entries.len() as u64 + 1;
        let entry = AuditLogEntry::seal(draft, sequence, prev_hash, at);
        entries.push(entry.clone());
        Ok(entry)
    }

    fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct Queued {
    draft: AuditDraft,
    at: DateTime<Utc>,
    attempts: u32,
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<Queued>,
    dead: VecDeque<Queued>,
}

/// Result of one outbox flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    /// Entries moved to the dead-letter queue by this flush.
    pub dead_lettered: usize,
    /// Queued plus dead-lettered entries still undelivered.
    pub remaining: usize,
}

/// The only writer of audit entries.
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
    outbox: Mutex<Outbox>,
    retry_limit: u32,
}

impl AuditTrail {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>, retry_limit: u32) -> Self {
        Self {
            sink,
            outbox: Mutex::new(Outbox::default()),
            retry_limit: retry_limit.max(1),
        }
    }

    /// Persist the audit entry of a committed transition.
    ///
    /// Never fails: a sink error queues the draft for retry. Entries keep
    /// their original order; while older entries are queued, new ones
    /// queue behind them.
    pub fn record(&self, draft: AuditDraft, at: DateTime<Utc>) {
        let mut outbox = self.outbox.lock();
        Self::deliver_queued(&*self.sink, &mut outbox.queue);
        if !outbox.queue.is_empty() {
            debug!(action = %draft.action, queued = outbox.queue.len(), "Audit entry queued behind outbox");
            outbox.queue.push_back(Queued {
                draft,
                at,
                attempts: 0,
            });
            return;
        }
        let action = draft.action;
        let entity = draft.entity.clone();
        if let Err(e) = self.sink.append(draft.clone(), at) {
            warn!(%action, %entity, error = %e, "Audit write failed; entry queued for retry");
            outbox.queue.push_back(Queued {
                draft,
                at,
                attempts: 0,
            });
        }
    }

    /// Opportunistic redelivery from the write path. Stops at the first
    /// failure and charges no attempts.
    fn deliver_queued(sink: &dyn AuditSink, queue: &mut VecDeque<Queued>) {
        while let Some(queued) = queue.front() {
            if sink.append(queued.draft.clone(), queued.at).is_err() {
                break;
            }
            queue.pop_front();
        }
    }

    /// Scheduled retry: dead letters first, then the queue in order.
    ///
    /// Each failed queue entry is charged one attempt; at `retry_limit` it
    /// moves to the dead-letter queue with an `error!`.
    pub fn flush_outbox(&self) -> FlushReport {
        let mut outbox = self.outbox.lock();
        let mut report = FlushReport::default();

        let dead = std::mem::take(&mut outbox.dead);
        for mut queued in dead {
            match self.sink.append(queued.draft.clone(), queued.at) {
                Ok(_) => report.delivered += 1,
                Err(_) => {
                    queued.attempts = queued.attempts.saturating_add(1);
                    outbox.dead.push_back(queued);
                }
            }
        }

        while let Some(mut queued) = outbox.queue.pop_front() {
            match self.sink.append(queued.draft.clone(), queued.at) {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    queued.attempts += 1;
                    if queued.attempts < self.retry_limit {
                        outbox.queue.push_front(queued);
                        break;
                    }
                    error!(
                        action = %queued.draft.action,
                        entity = %queued.draft.entity,
                        attempts = queued.attempts,
                        error = %e,
                        "Audit entry dead-lettered after exhausting retries"
                    );
                    report.dead_lettered += 1;
                    outbox.dead.push_back(queued);
                }
            }
        }
        report.remaining = outbox.queue.len() + outbox.dead.len();
        report
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        self.sink.query(query)
    }

    pub fn len(&self) -> usize {
        self.sink.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sink.is_empty()
    }

    /// Entries waiting for redelivery, dead letters included.
    pub fn pending(&self) -> usize {
        let outbox = self.outbox.lock();
        outbox.queue.len() + outbox.dead.len()
    }

    /// Entries that exhausted their scheduled retries and await a
    /// recovered sink.
    pub fn dead_lettered(&self) -> usize {
        self.outbox.lock().dead.len()
    }
}

/// A sink that refuses the next `n` appends. Useful for exercising the
/// outbox from tests.
#[cfg(any(test, feature = "test-helpers"))]
pub struct FlakySink {
    inner: MemoryAuditSink,
    failures_left: Mutex<usize>,
}

#[cfg(any(test, feature = "test-helpers"))]
impl FlakySink {
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryAuditSink::new(),
            failures_left: Mutex::new(failures),
        }
    }

    pub fn fail_next(&self, n: usize) {
        *self.failures_left.lock() = n;
    }

    pub fn snapshot(&self) -> Vec<AuditLogEntry> {
        self.inner.snapshot()
    }
}

#[cfg(any(test, feature = "test-helpers"))]
impl AuditSink for FlakySink {
    fn append(&self, draft: AuditDraft, at: DateTime<Utc>) -> Result<AuditLogEntry> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(escrowline_types::EscrowlineError::AuditUnavailable("document store offline".into()));
        }
        drop(left);
        self.inner.append(draft, at)
    }

    fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        self.inner.query(query)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
