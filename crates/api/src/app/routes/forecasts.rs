//! Forecast endpoints.
//!
//! `POST` only records and queues the request; the forecast itself is
//! computed by the worker and observed through the `GET` routes.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;

use farmflow_core::{ForecastId, GroupId};

use crate::app::dto::RequestForecastBody;
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/groups/:group_id/forecast", get(list_forecasts).post(request_forecast))
        .route("/forecast/:id", get(get_forecast))
}

pub async fn request_forecast(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(group_id): Path<String>,
    body: Result<Json<RequestForecastBody>, JsonRejection>,
) -> axum::response::Response {
    let group_id: GroupId = match group_id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "Invalid group ID"),
    };

    let request = match body {
        Ok(Json(body)) => match body.into_request() {
            Ok(r) => r,
            Err(e) => return errors::produce_error_to_response(e),
        },
        Err(rejection) => return errors::json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match services.producer.request(user.user_id(), group_id, request).await {
        Ok(record) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "data": { "forecastId": record.id.to_string() },
            })),
        )
            .into_response(),
        Err(e) => errors::produce_error_to_response(e),
    }
}

pub async fn list_forecasts(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(group_id): Path<String>,
) -> axum::response::Response {
    let group_id: GroupId = match group_id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "Invalid group ID"),
    };

    match services.access.list(user.user_id(), group_id).await {
        Ok(records) => Json(json!({ "success": true, "data": records })).into_response(),
        Err(e) => errors::access_error_to_response(e),
    }
}

pub async fn get_forecast(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: ForecastId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "Invalid forecast ID"),
    };

    match services.access.get(user.user_id(), id).await {
        Ok(record) => Json(json!({ "success": true, "data": record })).into_response(),
        Err(e) => errors::access_error_to_response(e),
    }
}
