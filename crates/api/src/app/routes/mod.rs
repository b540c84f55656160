use axum::{routing::get, Router};

pub mod forecasts;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .merge(forecasts::router())
}
