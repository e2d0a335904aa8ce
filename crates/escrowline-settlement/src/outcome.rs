//! Values returned by engine operations.

use escrowline_types::{Dispute, Escrow, EscrowlineError, Order, Result, constants};
use serde::Serialize;

/// Result of `create_order`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order: Order,
    pub escrow: Escrow,
    /// `true` when an earlier request with the same key produced this order.
    pub idempotent: bool,
}

/// The order and escrow after a settlement step, plus the dispute it
/// touched, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    pub order: Order,
    pub escrow: Escrow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute: Option<Dispute>,
}

/// One page of a listing. Pages start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

/// Validated pagination parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    /// # Errors
    /// [`EscrowlineError::Validation`] if `page` is zero or `limit` is
    /// outside `1..=MAX_PAGE_LIMIT`.
    pub fn new(page: Option<usize>, limit: Option<usize>) -> Result<Self> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(constants::DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(EscrowlineError::validation("page starts at 1"));
        }
        if !(1..=constants::MAX_PAGE_LIMIT).contains(&limit) {
            return Err(EscrowlineError::validation(format!(
                "limit must be between 1 and {}",
                constants::MAX_PAGE_LIMIT
            )));
        }
        Ok(Self { page, limit })
    }

    /// Slice `items` (already in display order) into this page.
    #[must_use]
    pub fn apply<T>(self, items: Vec<T>) -> Page<T> {
        let total = items.len();
        let items = items
            .into_iter()
            .skip((self.page - 1).saturating_mul(self.limit))
            .take(self.limit)
            .collect();
        Page {
            items,
            page: self.page,
            limit: self.limit,
            total,
        }
    }
}
