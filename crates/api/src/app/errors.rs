use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use farmflow_infra::pipeline::{AccessError, ProduceError};

/// `{ "success": false, "error": message }` with the given status.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "success": false,
            "error": message.into(),
        })),
    )
        .into_response()
}

pub fn produce_error_to_response(err: ProduceError) -> axum::response::Response {
    match err {
        ProduceError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, msg),
        ProduceError::GroupNotFound => json_error(StatusCode::NOT_FOUND, "Group not found"),
        ProduceError::Forbidden => json_error(StatusCode::FORBIDDEN, "Forbidden"),
        ProduceError::FarmData(e) => internal("farm data", &e),
        ProduceError::Store(e) => internal("forecast store", &e),
        ProduceError::Queue(e) => internal("job queue", &e),
    }
}

pub fn access_error_to_response(err: AccessError) -> axum::response::Response {
    match err {
        AccessError::GroupNotFound => json_error(StatusCode::NOT_FOUND, "Group not found"),
        AccessError::ForecastNotFound => json_error(StatusCode::NOT_FOUND, "Forecast not found"),
        AccessError::Forbidden => json_error(StatusCode::FORBIDDEN, "Forbidden"),
        AccessError::FarmData(e) => internal("farm data", &e),
        AccessError::Store(e) => internal("forecast store", &e),
    }
}

// Details go to the log, not the client.
fn internal(source: &str, err: &dyn std::fmt::Display) -> axum::response::Response {
    tracing::error!(source, error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
