//! Request authorization.
//!
//! The upload core only sees an allow/deny predicate over the request; how
//! a token is judged is up to the policy plugged in at startup.

use axum::http::{HeaderMap, Method, header};

/// What a policy gets to look at.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

pub trait AuthPolicy: Send + Sync {
    fn check(&self, ctx: &RequestContext) -> AuthDecision;
}

/// Lets every request through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthPolicy for AllowAll {
    fn check(&self, _ctx: &RequestContext) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Accepts `Authorization: Bearer <token>` carrying one shared token.
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken").finish_non_exhaustive()
    }
}

impl AuthPolicy for BearerToken {
    fn check(&self, ctx: &RequestContext) -> AuthDecision {
        let Some(value) = ctx.headers.get(header::AUTHORIZATION) else {
            return AuthDecision::Deny("missing Authorization header".into());
        };
        let Ok(value) = value.to_str() else {
            return AuthDecision::Deny("Authorization header is not valid text".into());
        };
        // Literal prefix only; "Bearer" followed by anything else is rejected.
        match value.strip_prefix("Bearer ") {
            Some(token) if token == self.token => AuthDecision::Allow,
            Some(_) => AuthDecision::Deny("access denied".into()),
            None => AuthDecision::Deny("expected a Bearer token".into()),
        }
    }
}
