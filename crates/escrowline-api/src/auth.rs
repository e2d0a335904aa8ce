//! Bearer-token session resolution.
//!
//! Every route except `/health` requires `Authorization: Bearer <token>`.
//! The token is resolved to an [`Actor`] by a [`SessionResolver`]; role and
//! ownership checks happen later, inside the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use escrowline_types::{Actor, EscrowlineError};

use crate::config::SessionEntry;
use crate::error::ApiError;
use crate::state::AppState;

/// Maps a bearer token to the caller it belongs to.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<Actor>;
}

/// A fixed token table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticSessions {
    tokens: HashMap<String, Actor>,
}

impl StaticSessions {
    pub fn new(entries: &[SessionEntry]) -> Self {
        Self {
            tokens: entries
                .iter()
                .map(|e| (e.token.clone(), Actor::new(e.user_id, e.role)))
                .collect(),
        }
    }

    pub fn insert(&mut self, token: impl Into<String>, actor: Actor) {
        self.tokens.insert(token.into(), actor);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token: &str) -> Option<Actor> {
        self.tokens.get(token).copied()
    }
}

fn extract_bearer_token(raw: &str) -> Option<&str> {
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Actor);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or_else(|| unauthenticated("missing bearer token"))?;

        state
            .sessions
            .resolve(token)
            .await
            .map(Caller)
            .ok_or_else(|| unauthenticated("unknown or expired session"))
    }
}

fn unauthenticated(reason: &str) -> ApiError {
    ApiError(EscrowlineError::Unauthenticated {
        reason: reason.to_string(),
    })
}
