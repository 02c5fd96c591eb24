//! REST error taxonomy.
//!
//! Runtime errors convert into [`ApiError`] at the handler boundary; the
//! `IntoResponse` impl turns every variant into a `{"error": <reason>}` JSON
//! body with the matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::runtime::{ActionError, ElementError, FeatureError, FeatureKind};

#[derive(Debug, PartialEq, Error)]
pub enum ApiError {
    /// Unknown or access-removed action, element, or feature name.
    #[error("{0}")]
    NotFound(String),

    /// Unknown or access-removed action group.
    #[error("{0}")]
    GroupNotFound(String),

    /// Request body or arguments failed validation.
    #[error("{0}")]
    Validation(String),

    /// The feature exists but this device does not have it.
    #[error("device does not have the {0} feature")]
    FeatureUnsupported(FeatureKind),

    /// Invocation or probe failure surfaced to the client.
    #[error("{0}")]
    Unhandled(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_)
            | ApiError::GroupNotFound(_)
            | ApiError::FeatureUnsupported(_) => StatusCode::NOT_FOUND,
            ApiError::Unhandled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ActionError::GroupNotFound(_) => ApiError::GroupNotFound(err.to_string()),
            ActionError::GroupParse { .. } => ApiError::NotFound(err.to_string()),
            ActionError::Validation(message) => ApiError::Validation(message),
            ActionError::Failed(message) => ApiError::Unhandled(message),
        }
    }
}

impl From<FeatureError> for ApiError {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::Unsupported(kind) => ApiError::FeatureUnsupported(kind),
            FeatureError::Unknown(_) | FeatureError::NotWatchable(_) => {
                ApiError::NotFound(err.to_string())
            }
            FeatureError::Probe { .. } => ApiError::Unhandled(err.to_string()),
        }
    }
}

impl From<ElementError> for ApiError {
    fn from(err: ElementError) -> Self {
        match err {
            ElementError::UnknownElement(_) => ApiError::NotFound(err.to_string()),
            ElementError::UnknownProperty { .. } => ApiError::Validation(err.to_string()),
        }
    }
}
