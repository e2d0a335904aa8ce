//! Error types for the Escrowline settlement engine.
//!
//! All errors use the `EL_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors
//! - 2xx: State transition errors
//! - 3xx: Escrow errors
//! - 4xx: Dispute errors
//! - 5xx: Idempotency errors
//! - 6xx: Audit errors
//! - 8xx: Access errors
//! - 9xx: General / internal errors
//!
//! Independently of the numeric prefix, every variant maps onto one stable
//! taxonomy code ([`EscrowlineError::code`]) that callers branch on.

use thiserror::Error;

use crate::{DisputeId, EscrowStatus, OrderId, OrderStatus};

/// Central error enum for all Escrowline operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EscrowlineError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// Malformed input: empty items, bad quantities, unknown product, etc.
    #[error("EL_ERR_100: Validation failed: {reason}")]
    Validation { reason: String },

    // =================================================================
    // State Transition Errors (2xx)
    // =================================================================
    /// The requested order status edge does not exist (or is not reachable
    /// through this operation).
    #[error("EL_ERR_200: Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: OrderStatus,
        to: OrderStatus,
        reason: String,
    },

    /// An order-level precondition failed (e.g. confirming delivery on an
    /// order that was never delivered).
    #[error("EL_ERR_201: Order {order_id} is {status}: {reason}")]
    OrderStateRejected {
        order_id: OrderId,
        status: OrderStatus,
        reason: String,
    },

    /// Lost an optimistic compare-and-swap race. Safe to retry after re-reading.
    #[error("EL_ERR_202: Concurrent modification of {entity}: expected version {expected}, found {actual}")]
    Conflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    // =================================================================
    // Escrow Errors (3xx)
    // =================================================================
    /// The escrow is RELEASED or REFUNDED and accepts no further transitions.
    #[error("EL_ERR_300: Escrow for order {order_id} is terminal ({status})")]
    EscrowTerminal {
        order_id: OrderId,
        status: EscrowStatus,
    },

    /// The escrow exists but is not in a state this edge starts from.
    #[error("EL_ERR_301: Escrow for order {order_id} cannot go {from} -> {to}")]
    EscrowTransitionRejected {
        order_id: OrderId,
        from: EscrowStatus,
        to: EscrowStatus,
    },

    // =================================================================
    // Dispute Errors (4xx)
    // =================================================================
    /// An OPEN dispute already exists for this order.
    #[error("EL_ERR_400: Order {order_id} already has open dispute {dispute_id}")]
    DisputeExists {
        order_id: OrderId,
        dispute_id: DisputeId,
    },

    /// The dispute is no longer OPEN.
    #[error("EL_ERR_401: Dispute {0} already resolved")]
    AlreadyResolved(DisputeId),

    // =================================================================
    // Idempotency Errors (5xx)
    // =================================================================
    /// A reservation for this key is still in flight.
    #[error("EL_ERR_500: Idempotency key '{key}' is reserved by an in-flight request")]
    IdempotencyInFlight { key: String },

    /// The idempotency backend failed; the creation was rolled back.
    #[error("EL_ERR_501: Idempotency store unavailable: {0}")]
    IdempotencyUnavailable(String),

    // =================================================================
    // Audit Errors (6xx)
    // =================================================================
    /// The audit sink refused an entry.
    #[error("EL_ERR_600: Audit sink unavailable: {0}")]
    AuditUnavailable(String),

    // =================================================================
    // Lookup / Access Errors (8xx)
    // =================================================================
    /// No order with this id.
    #[error("EL_ERR_800: Order not found: {0}")]
    OrderNotFound(OrderId),

    /// No escrow for this order.
    #[error("EL_ERR_801: Escrow not found for order {0}")]
    EscrowNotFound(OrderId),

    /// No dispute with this id.
    #[error("EL_ERR_802: Dispute not found: {0}")]
    DisputeNotFound(DisputeId),

    /// Role or ownership check failed.
    #[error("EL_ERR_803: Forbidden: {reason}")]
    Forbidden { reason: String },

    /// No valid session accompanies the request.
    #[error("EL_ERR_804: Unauthenticated: {reason}")]
    Unauthenticated { reason: String },

    // =================================================================
    // General / Internal (9xx)
    // =================================================================
    /// Unrecoverable internal error.
    #[error("EL_ERR_900: Internal error: {0}")]
    Internal(String),

    /// Configuration error (invalid config file, missing fields, etc.).
    #[error("EL_ERR_902: Configuration error: {0}")]
    Configuration(String),
}

impl EscrowlineError {
    /// Stable taxonomy code returned to API callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidTransition { .. } | Self::OrderStateRejected { .. } => {
                "INVALID_TRANSITION"
            }
            // A guarded escrow edge whose source status no longer matches is
            // a failed compare-and-swap on status, same as a version clash.
            Self::Conflict { .. }
            | Self::EscrowTransitionRejected { .. }
            | Self::IdempotencyInFlight { .. } => "CONFLICT",
            Self::EscrowTerminal { .. } => "ESCROW_TERMINAL",
            Self::DisputeExists { .. } => "DISPUTE_EXISTS",
            Self::AlreadyResolved(_) => "ALREADY_RESOLVED",
            Self::OrderNotFound(_) | Self::EscrowNotFound(_) | Self::DisputeNotFound(_) => {
                "NOT_FOUND"
            }
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Unauthenticated { .. } => "UNAUTHENTICATED",
            Self::IdempotencyUnavailable(_)
            | Self::AuditUnavailable(_)
            | Self::Internal(_)
            | Self::Configuration(_) => "INTERNAL",
        }
    }

    /// Whether re-reading state and retrying the same request can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code() == "CONFLICT"
    }

    #[must_use]
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, EscrowlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = EscrowlineError::OrderNotFound(OrderId::new());
        let msg = format!("{err}");
        assert!(msg.starts_with("EL_ERR_800"), "Got: {msg}");
    }

    #[test]
    fn invalid_transition_display() {
        let err = EscrowlineError::InvalidTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::Delivered,
            reason: "no such edge".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("PENDING"));
        assert!(msg.contains("DELIVERED"));
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[test]
    fn taxonomy_codes() {
        let oid = OrderId::new();
        let did = DisputeId::new();
        let cases = [
            (EscrowlineError::validation("x"), "VALIDATION_ERROR"),
            (
                EscrowlineError::Conflict {
                    entity: "escrow".into(),
                    expected: 1,
                    actual: 2,
                },
                "CONFLICT",
            ),
            (
                EscrowlineError::EscrowTerminal {
                    order_id: oid,
                    status: EscrowStatus::Released,
                },
                "ESCROW_TERMINAL",
            ),
            (
                EscrowlineError::DisputeExists {
                    order_id: oid,
                    dispute_id: did,
                },
                "DISPUTE_EXISTS",
            ),
            (EscrowlineError::AlreadyResolved(did), "ALREADY_RESOLVED"),
            (EscrowlineError::DisputeNotFound(did), "NOT_FOUND"),
            (EscrowlineError::forbidden("nope"), "FORBIDDEN"),
            (EscrowlineError::Internal("boom".into()), "INTERNAL"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(
            EscrowlineError::IdempotencyInFlight { key: "k".into() }.is_retryable()
        );
        assert!(!EscrowlineError::AlreadyResolved(DisputeId::new()).is_retryable());
        assert!(!EscrowlineError::validation("bad").is_retryable());
    }

    #[test]
    fn all_errors_have_el_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(EscrowlineError::AuditUnavailable("down".into())),
            Box::new(EscrowlineError::IdempotencyUnavailable("down".into())),
            Box::new(EscrowlineError::Configuration("bad".into())),
            Box::new(EscrowlineError::EscrowNotFound(OrderId::new())),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(msg.starts_with("EL_ERR_"), "Error missing EL_ERR_ prefix: {msg}");
        }
    }
}
