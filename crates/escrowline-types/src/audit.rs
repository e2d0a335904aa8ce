//! Audit trail types.
//!
//! Every financial or lifecycle state change produces exactly one
//! [`AuditLogEntry`]. Transition functions return an [`AuditDraft`] next to
//! the new record; the trail seals the draft with a sequence number and a
//! SHA-256 link to the previous entry, so tampering with or dropping any
//! committed entry breaks [`verify_chain`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Actor, DisputeId, OrderId, Role, UserId};

/// Hash used as `prev_hash` by the first entry of a trail.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// Order created in PENDING with its escrow in HOLD.
    OrderCreated,
    OrderStatusChanged,
    EscrowReleased,
    EscrowRefunded,
    EscrowFrozen,
    DisputeRaised,
    DisputeResolved,
    /// One scheduler pass, with its report as details.
    AutoReleaseRun,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderStatusChanged => "ORDER_STATUS_CHANGED",
            Self::EscrowReleased => "ESCROW_RELEASED",
            Self::EscrowRefunded => "ESCROW_REFUNDED",
            Self::EscrowFrozen => "ESCROW_FROZEN",
            Self::DisputeRaised => "DISPUTE_RAISED",
            Self::DisputeResolved => "DISPUTE_RESOLVED",
            Self::AutoReleaseRun => "AUTO_RELEASE_RUN",
        };
        f.write_str(s)
    }
}

/// Kind of entity an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Order,
    Escrow,
    Dispute,
    Scheduler,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order => write!(f, "ORDER"),
            Self::Escrow => write!(f, "ESCROW"),
            Self::Dispute => write!(f, "DISPUTE"),
            Self::Scheduler => write!(f, "SCHEDULER"),
        }
    }
}

/// `(kind, id)` of the entity an entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    #[must_use]
    pub fn order(id: OrderId) -> Self {
        Self {
            kind: EntityKind::Order,
            id: id.to_string(),
        }
    }

    /// Escrows are keyed by their order id.
    #[must_use]
    pub fn escrow(order_id: OrderId) -> Self {
        Self {
            kind: EntityKind::Escrow,
            id: order_id.to_string(),
        }
    }

    #[must_use]
    pub fn dispute(id: DisputeId) -> Self {
        Self {
            kind: EntityKind::Dispute,
            id: id.0.to_string(),
        }
    }

    #[must_use]
    pub fn scheduler() -> Self {
        Self {
            kind: EntityKind::Scheduler,
            id: "auto-release".into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// An audit entry as produced by a transition, before the trail assigns
/// its position in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    pub actor: Actor,
    pub action: AuditAction,
    pub entity: EntityRef,
    pub details: serde_json::Value,
}

impl AuditDraft {
    #[must_use]
    pub fn new(
        actor: Actor,
        action: AuditAction,
        entity: EntityRef,
        details: serde_json::Value,
    ) -> Self {
        Self {
            actor,
            action,
            entity,
            details,
        }
    }
}

/// One sealed, immutable audit record.
///
/// There is no API to modify or delete an entry once sealed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Position in the trail, starting at 1.
    pub sequence: u64,
    pub actor_id: UserId,
    pub role: Role,
    pub action: AuditAction,
    pub entity: EntityRef,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the previous entry, or [`GENESIS_HASH`].
    pub prev_hash: String,
    /// Hex SHA-256 over this entry's content and `prev_hash`.
    pub hash: String,
}

impl AuditLogEntry {
    /// Seal a draft at `sequence`, linking it to `prev_hash`.
    #[must_use]
    pub fn seal(
        draft: AuditDraft,
        sequence: u64,
        prev_hash: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self {
            sequence,
            actor_id: draft.actor.user_id,
            role: draft.actor.role,
            action: draft.action,
            entity: draft.entity,
            details: draft.details,
            timestamp,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// Recompute the content hash of this entry.
    ///
    /// Covers every field except `hash` itself.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"escrowline:audit:v1:");
        hasher.update(self.sequence.to_le_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.actor_id.0.as_bytes());
        hasher.update(self.role.to_string().as_bytes());
        hasher.update(self.action.to_string().as_bytes());
        hasher.update(self.entity.to_string().as_bytes());
        hasher.update(self.details.to_string().as_bytes());
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Check that `entries` form an unbroken chain starting at the genesis hash.
///
/// Returns the sequence number of the first bad entry on failure.
///
/// # Errors
/// `Err(sequence)` if an entry's hash does not match its content, its
/// `prev_hash` does not match its predecessor, or sequences are not
/// consecutive.
pub fn verify_chain(entries: &[AuditLogEntry]) -> Result<(), u64> {
    let mut prev = GENESIS_HASH;
    for (i, entry) in entries.iter().enumerate() {
        let expected_seq = i as u64 + 1;
        if entry.sequence != expected_seq
            || entry.prev_hash != prev
            || entry.hash != entry.compute_hash()
        {
            return Err(entry.sequence);
        }
        prev = &entry.hash;
    }
    Ok(())
}

/// Read-only filter over the trail. All bounds are optional and combine
/// with AND. `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub actor_id: Option<UserId>,
    pub entity_kind: Option<EntityKind>,
    pub entity_id: Option<String>,
}

impl AuditQuery {
    #[must_use]
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp < to)
            && self.actor_id.is_none_or(|actor| entry.actor_id == actor)
            && self.entity_kind.is_none_or(|kind| entry.entity.kind == kind)
            && self
                .entity_id
                .as_deref()
                .is_none_or(|id| entry.entity.id == id)
    }
}
