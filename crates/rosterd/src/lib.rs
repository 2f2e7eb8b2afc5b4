//! rosterd — HTTP API for face-matched attendance.
//!
//! | Route                             | Auth            |
//! |-----------------------------------|-----------------|
//! | `GET /health`                     | none            |
//! | `POST /mark-attendance`           | token, or none in kiosk mode |
//! | `POST /register`                  | token           |
//! | `/users`, `/users/{id}`           | token           |
//! | `/attendance-records[/manual]`    | token           |
//!
//! Encoding runs on a dedicated engine thread (see [`engine`]); registry
//! access goes through the blocking pool (see [`state::AppState::with_store`]).

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractors;
pub mod routes;
pub mod state;

use axum::extract::{DefaultBodyLimit, State};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::routes::{attendance, users};
use crate::state::AppState;

/// Assemble the router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    let check_in = Router::new().route("/mark-attendance", post(attendance::mark));
    let check_in = if state.config.kiosk_mode {
        check_in
    } else {
        check_in.route_layer(from_fn_with_state(state.clone(), auth::require_token))
    };

    let admin = Router::new()
        .route("/register", post(users::register))
        .route("/users", get(users::list))
        .route(
            "/users/{id}",
            get(users::get).put(users::update).delete(users::remove),
        )
        .route("/attendance-records", get(attendance::records))
        .route("/attendance-records/manual", post(attendance::manual))
        .route_layer(from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(health))
        .merge(check_in)
        .merge(admin)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "kiosk_mode": state.config.kiosk_mode,
    }))
}
