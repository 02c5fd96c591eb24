//! REST surface: liveness, config and device snapshots, and action calls.
//!
//! Handlers convert runtime errors into [`ApiError`] at the boundary, so every
//! failure leaves as a `{"error": <reason>}` body with the matching status.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::runtime::{ActionError, RegisteredAction};
use crate::server::coordinator::ApiCoordinator;
use crate::server::error::ApiError;

/// Build the REST router. The WebSocket route is merged in by the coordinator.
pub fn create_router(coordinator: Arc<ApiCoordinator>) -> Router {
    Router::new()
        .route("/api", get(liveness_handler))
        .route("/api/config", get(config_handler))
        .route("/api/device", get(device_handler))
        .route(
            "/api/device/battery",
            get(battery_handler).post(battery_refresh_handler),
        )
        .route(
            "/api/device/network",
            get(network_handler).post(network_refresh_handler),
        )
        .route("/api/device/backlight", get(backlight_handler))
        .route("/api/actions", get(actions_handler))
        .route("/api/actions/:action", post(shorthand_action_handler))
        .route("/api/actions/:group/:action", post(group_action_handler))
        .with_state(coordinator)
}

async fn liveness_handler() -> Json<Value> {
    Json(json!({ "message": "API running" }))
}

async fn config_handler(State(coordinator): State<Arc<ApiCoordinator>>) -> Json<Value> {
    Json(coordinator.get_rest_config())
}

async fn device_handler(State(coordinator): State<Arc<ApiCoordinator>>) -> Json<Value> {
    Json(coordinator.get_device_config())
}

async fn battery_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(coordinator.get_battery_config()?))
}

/// Re-measure the battery, then return the refreshed snapshot. Does not reply
/// until the probe finishes.
async fn battery_refresh_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
) -> Result<Json<Value>, ApiError> {
    coordinator.runtime().device().refresh_battery().await?;
    Ok(Json(coordinator.get_battery_config()?))
}

async fn network_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(coordinator.get_network_config()?))
}

async fn network_refresh_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
) -> Result<Json<Value>, ApiError> {
    coordinator.runtime().device().refresh_network().await?;
    Ok(Json(coordinator.get_network_config()?))
}

async fn backlight_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(coordinator.get_backlight_config()?))
}

async fn actions_handler(State(coordinator): State<Arc<ApiCoordinator>>) -> Json<Value> {
    Json(coordinator.get_actions_config())
}

/// `POST /api/actions/{action}`: the whole body is the keyword arguments.
async fn shorthand_action_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let kwargs = parse_body_object(&body)?;
    let registered = coordinator.parse_shorthand_action(&action)?;
    invoke_action(registered, &action, kwargs).await?;
    Ok(Json(json!({ "message": format!("action {} called", action) })))
}

/// `POST /api/actions/{group}/{action}`: the body's `data` key becomes the
/// keyword arguments; every other key is an option passed to the group's
/// resolver.
async fn group_action_handler(
    State(coordinator): State<Arc<ApiCoordinator>>,
    Path((group, action)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut options = parse_body_object(&body)?;
    let kwargs = match options.remove("data") {
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ApiError::Validation(
                "the data key must be a json object".to_string(),
            ))
        }
        None => Map::new(),
    };

    let registered = coordinator.parse_group_action(&group, &action, &options)?;
    invoke_action(registered, &action, kwargs).await?;
    Ok(Json(json!({
        "message": format!("action {}:{} called", group, action)
    })))
}

/// Parse an optional JSON object body. An absent body reads as `{}`.
fn parse_body_object(body: &Bytes) -> Result<Map<String, Value>, ApiError> {
    if body.is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|_| ApiError::Validation("request body must be valid json".to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ApiError::Validation(
            "request body must be a json object".to_string(),
        )),
    }
}

/// Validate and run a resolved action. Validation failures keep their own
/// text; anything the handler itself raises becomes a 500 naming the action.
async fn invoke_action(
    registered: RegisteredAction,
    name: &str,
    kwargs: Map<String, Value>,
) -> Result<Value, ApiError> {
    match registered.call(kwargs).await {
        Ok(value) => Ok(value),
        Err(ActionError::Validation(message)) => Err(ApiError::Validation(message)),
        Err(err) => Err(ApiError::Unhandled(format!(
            "Could not call action {}: {}",
            name, err
        ))),
    }
}
