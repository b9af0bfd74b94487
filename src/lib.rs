//! Resumable upload server implementing the tus 1.0.0 protocol.
//!
//! The engine lives in [`services`]: storage backends, metadata stores, the
//! upload state machine and the per-upload coordinator. [`routes`] exposes it
//! over HTTP with axum.

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
