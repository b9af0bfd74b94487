//! Defines routes for the tus resumable upload protocol.
//!
//! ## Structure
//! - **Upload collection** (`{base}`, default `/files/`)
//!   - `OPTIONS {base}`: protocol discovery
//!   - `POST    {base}`: create upload
//!
//! - **Single upload** (`{base}{id}`)
//!   - `HEAD    {base}{id}`: current offset / length
//!   - `PATCH   {base}{id}`: append a chunk
//!   - `DELETE  {base}{id}`: terminate
//!   - `GET     {base}{id}`: download accepted bytes
//!
//! Upload routes sit behind the auth and protocol-version gates; the health
//! endpoints do not.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        tus_handlers::{
            create_upload, delete_upload, get_upload, head_upload, options_handler, patch_upload,
        },
    },
    routes::middleware::{auth_gate, tus_version_gate},
    state::AppState,
};
use axum::{
    Router, middleware,
    routing::{get, head, post},
};

/// Build the full application router around `state`.
pub fn routes(state: AppState) -> Router {
    let base = state.base_path.clone();

    let mut uploads = Router::new()
        .route(&base, post(create_upload).options(options_handler))
        .route(
            &format!("{}{{id}}", base),
            head(head_upload)
                .patch(patch_upload)
                .delete(delete_upload)
                .get(get_upload),
        );
    // Accept the collection without its trailing slash as well.
    let bare = base.trim_end_matches('/');
    if !bare.is_empty() {
        uploads = uploads.route(bare, post(create_upload).options(options_handler));
    }

    let uploads = uploads
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .route_layer(middleware::from_fn(tus_version_gate));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(uploads)
        .with_state(state)
}
