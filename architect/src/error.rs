use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::gate::GateRejection;

/// Failures returned before any stream is opened, as `{ "error": message }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid JSON in request body")]
    InvalidJson,

    #[error("Description is required")]
    MissingDescription,

    #[error(transparent)]
    Rejected(#[from] GateRejection),

    #[error("{0}")]
    BadRequest(String),

    /// An agent stage of a chained call failed; the message names the stage.
    #[error("{0}")]
    AgentFailed(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Rejected(GateRejection::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidJson
            | ApiError::MissingDescription
            | ApiError::Rejected(_)
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AgentFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!("internal error: {detail}");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_maps_to_429() {
        let err = ApiError::from(GateRejection::RateLimited {
            max_requests: 10,
            window_secs: 60,
        });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded. Maximum 10 requests per 60 seconds."
        );
    }

    #[test]
    fn test_validation_failures_are_400() {
        assert_eq!(ApiError::MissingDescription.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidJson.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(GateRejection::InvalidPrompt("no".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = ApiError::Internal("regex blew up".to_string());
        assert_eq!(err.to_string(), "Internal server error");
    }
}
