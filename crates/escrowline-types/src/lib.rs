//! # escrowline-types
//!
//! Shared types, errors, and configuration for the **Escrowline**
//! order-escrow settlement engine.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`OrderId`], [`UserId`], [`DisputeId`], [`ProductRef`], [`IdempotencyKey`]
//! - **Actors**: [`Actor`], [`Role`], [`Capabilities`], [`OrderScope`]
//! - **Order model**: [`Order`], [`OrderItem`], [`OrderStatus`], [`StatusChange`], [`NewOrder`]
//! - **Escrow model**: [`Escrow`], [`EscrowStatus`], [`EscrowTrigger`]
//! - **Dispute model**: [`Dispute`], [`DisputeStatus`], [`DisputeTrigger`], [`Resolution`]
//! - **Audit model**: [`AuditLogEntry`], [`AuditDraft`], [`AuditAction`], [`EntityRef`], [`AuditQuery`]
//! - **Configuration**: [`EngineConfig`]
//! - **Errors**: [`EscrowlineError`] with `EL_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults
//!
//! The two state machines (order and escrow) live here as pure transition
//! tables. Every mutator in `escrowline-settlement` consults them; nothing
//! else decides whether an edge exists.

pub mod actor;
pub mod audit;
pub mod config;
pub mod constants;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod ids;
pub mod order;

pub use actor::*;
pub use audit::*;
pub use config::*;
pub use dispute::*;
pub use error::*;
pub use escrow::*;
pub use ids::*;
pub use order::*;

// Constants are accessed via `escrowline_types::constants::FOO`
// (not re-exported to avoid name collisions).
