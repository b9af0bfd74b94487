//! Request gates in front of the tus routes.
//!
//! - `auth_gate` asks the configured `AuthPolicy` before any handler runs.
//! - `tus_version_gate` rejects requests for another protocol version and
//!   stamps `Tus-Resumable` on every response.

use crate::{
    auth::{AuthDecision, RequestContext},
    errors::{AppError, UploadError},
    handlers::tus_headers::{PROTOCOL_VERSION, TUS_RESUMABLE, TUS_VERSION},
    state::AppState,
};
use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

pub async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    // Discovery carries no upload data.
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    let ctx = RequestContext {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
    };
    match state.auth.check(&ctx) {
        AuthDecision::Allow => next.run(request).await,
        AuthDecision::Deny(reason) => {
            tracing::debug!(method = %ctx.method, path = %ctx.path, "denied: {}", reason);
            AppError::from(UploadError::Unauthorized(reason)).into_response()
        }
    }
}

pub async fn tus_version_gate(request: Request, next: Next) -> Response {
    let exempt = matches!(*request.method(), Method::OPTIONS | Method::GET);
    let version_ok = request
        .headers()
        .get(TUS_RESUMABLE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == PROTOCOL_VERSION);

    let mut response = if exempt || version_ok {
        next.run(request).await
    } else {
        AppError::new(
            StatusCode::PRECONDITION_FAILED,
            format!("unsupported protocol version, expected Tus-Resumable {}", PROTOCOL_VERSION),
        )
        .with_header(TUS_VERSION, HeaderValue::from_static(PROTOCOL_VERSION))
        .into_response()
    };
    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(PROTOCOL_VERSION));
    response
}
