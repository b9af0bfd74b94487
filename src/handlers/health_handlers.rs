//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and payload storage

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe: always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Pings the metadata store (`SELECT 1` for SQLite).
/// 2. Probes the storage backend (write/read/delete of a temp file on disk).
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let service = &state.service;

    let metadata_check = match service.store.ping().await {
        Ok(()) => CheckStatus {
            backend: service.store.name(),
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            backend: service.store.name(),
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let storage_check = match service.storage.probe().await {
        Ok(()) => CheckStatus {
            backend: service.storage.name(),
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            backend: service.storage.name(),
            ok: false,
            error: Some(format!("error: {}", e)),
        },
    };

    let overall_ok = metadata_check.ok && storage_check.ok;

    let mut checks = HashMap::new();
    checks.insert("metadata", metadata_check);
    checks.insert("storage", storage_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    backend: &'static str,
    ok: bool,
    error: Option<String>,
}
