use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::debug;

/// Detail returned when no upstream status or error body was ever obtained.
pub const CONNECTION_ERROR_DETAIL: &str = "Server Connection Error";

/// Reason surfaced for both unknown and forbidden models, so callers cannot tell which models exist.
pub const MODEL_NOT_FOUND: &str = "Model not found";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("access to model denied")]
    AccessDenied,
    #[error("model {0} is not served by any endpoint")]
    ModelNotFound(String),
    #[error("upstream returned {status}: {detail:?}")]
    Upstream {
        status: StatusCode,
        detail: Option<String>,
    },
    #[error("upstream connection failed: {0}")]
    Connection(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not authenticated")]
    Unauthorized,
    #[error("insufficient permissions")]
    Forbidden,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AccessDenied => StatusCode::FORBIDDEN,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::Connection(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
        }
    }

    /// The client-visible detail. Access failures are deliberately vague, upstream failures carry
    /// whatever the upstream told us.
    pub fn detail(&self) -> String {
        match self {
            GatewayError::AccessDenied | GatewayError::ModelNotFound(_) => {
                MODEL_NOT_FOUND.to_string()
            }
            GatewayError::Upstream { detail, .. } => detail
                .clone()
                .unwrap_or_else(|| CONNECTION_ERROR_DETAIL.to_string()),
            GatewayError::Connection(_) => CONNECTION_ERROR_DETAIL.to_string(),
            GatewayError::BadRequest(reason) => reason.clone(),
            GatewayError::Unauthorized => "Not authenticated".to_string(),
            GatewayError::Forbidden => {
                "Your account does not have permission to access this resource".to_string()
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        debug!("Responding with error: {}", self);
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}
