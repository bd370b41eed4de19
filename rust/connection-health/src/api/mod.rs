//! HTTP API endpoints.

pub mod health;
pub mod schedules;

use axum::Router;

use crate::AppState;

/// Create the API router.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(schedules::router())
}
