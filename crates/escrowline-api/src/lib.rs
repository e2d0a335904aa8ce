//! # escrowline-api
//!
//! HTTP surface of the Escrowline settlement engine.
//!
//! - [`routes::create_router`] wires every endpoint onto an axum `Router`
//! - [`auth::Caller`] resolves the bearer token to an `Actor`
//! - [`error::ApiError`] maps engine error codes to HTTP statuses
//! - [`config::ServerConfig`] loads layered configuration for the binary
//!
//! Handlers hold no business logic; each one parses its input, calls a
//! single `SettlementEngine` operation and wraps the result in the
//! `{"success": true, "data": ...}` envelope.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use auth::{Caller, SessionResolver, StaticSessions};
pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
