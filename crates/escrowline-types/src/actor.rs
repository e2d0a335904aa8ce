//! Actors, roles, and the capabilities each role carries.
//!
//! The session service hands the engine an `{user_id, role}` pair. Role
//! semantics are resolved once into [`Capabilities`] so handlers and engine
//! operations ask "may this actor fulfil orders?" instead of re-matching on
//! the role string everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{EscrowlineError, Order, Result, UserId};

/// Platform role attached to an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// End customer buying from a dealer.
    Customer,
    /// Reseller: sells to customers and sources from manufacturers.
    Dealer,
    /// Manufacturer supplying dealers.
    Manufacturer,
    /// Platform administrator.
    Admin,
    /// Internal automation (auto-release scheduler, cron triggers).
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer => write!(f, "CUSTOMER"),
            Self::Dealer => write!(f, "DEALER"),
            Self::Manufacturer => write!(f, "MANUFACTURER"),
            Self::Admin => write!(f, "ADMIN"),
            Self::System => write!(f, "SYSTEM"),
        }
    }
}

/// What a role is allowed to do, resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// May place orders as the buyer.
    pub can_place_orders: bool,
    /// May advance orders it sells (confirm, ship, deliver, cancel).
    pub can_fulfil_orders: bool,
    /// May override escrow, resolve disputes, and read everything.
    pub is_admin: bool,
}

impl Role {
    #[must_use]
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::Customer => Capabilities {
                can_place_orders: true,
                can_fulfil_orders: false,
                is_admin: false,
            },
            Self::Dealer => Capabilities {
                can_place_orders: true,
                can_fulfil_orders: true,
                is_admin: false,
            },
            Self::Manufacturer => Capabilities {
                can_place_orders: false,
                can_fulfil_orders: true,
                is_admin: false,
            },
            Self::Admin | Self::System => Capabilities {
                can_place_orders: false,
                can_fulfil_orders: false,
                is_admin: true,
            },
        }
    }
}

/// Which orders an actor may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    /// Every order on the platform.
    All,
    /// Only orders where this user is the buyer or the seller.
    Participant(UserId),
}

impl OrderScope {
    #[must_use]
    pub fn admits(&self, order: &Order) -> bool {
        match self {
            Self::All => true,
            Self::Participant(user) => order.is_participant(*user),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    /// The identity the auto-release scheduler acts under.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: UserId::system(),
            role: Role::System,
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.role.capabilities()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.capabilities().is_admin
    }

    #[must_use]
    pub fn order_scope(&self) -> OrderScope {
        if self.is_admin() {
            OrderScope::All
        } else {
            OrderScope::Participant(self.user_id)
        }
    }

    /// # Errors
    /// [`EscrowlineError::Forbidden`] unless the actor is admin or system.
    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EscrowlineError::forbidden(format!(
                "{} may not perform administrative actions",
                self.role
            )))
        }
    }

    /// # Errors
    /// [`EscrowlineError::Forbidden`] if the order is outside the actor's scope.
    pub fn require_visible(&self, order: &Order) -> Result<()> {
        if self.order_scope().admits(order) {
            Ok(())
        } else {
            Err(EscrowlineError::forbidden(format!(
                "user {} is not a participant of order {}",
                self.user_id, order.id
            )))
        }
    }

    /// # Errors
    /// [`EscrowlineError::Forbidden`] unless the actor placed this order.
    pub fn require_buyer(&self, order: &Order) -> Result<()> {
        if order.customer_id == self.user_id {
            Ok(())
        } else {
            Err(EscrowlineError::forbidden(format!(
                "only the buyer of order {} may do this",
                order.id
            )))
        }
    }

    /// # Errors
    /// [`EscrowlineError::Forbidden`] unless the actor is admin or the
    /// order's seller with a fulfilling role.
    pub fn require_fulfiller_or_admin(&self, order: &Order) -> Result<()> {
        if self.is_admin()
            || (self.capabilities().can_fulfil_orders && order.seller_id == self.user_id)
        {
            Ok(())
        } else {
            Err(EscrowlineError::forbidden(format!(
                "only the seller of order {} or an admin may update it",
                order.id
            )))
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.user_id)
    }
}
