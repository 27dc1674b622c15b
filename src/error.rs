use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::subscription::{EntitlementError, UsageResource};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Plan limit reached for {resource} ({current} of {limit})")]
    LimitExceeded {
        resource: UsageResource,
        current: f64,
        limit: f64,
    },

    #[error(transparent)]
    CorruptPreferences(#[from] EntitlementError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::LimitExceeded { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::CorruptPreferences(e) => {
                tracing::error!(error = %e, "Stored subscription is unreadable");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Subscription data is unreadable".into(),
                )
            }
            AppError::Upstream(msg) => {
                tracing::warn!(error = %msg, "Upstream service failed");
                (StatusCode::BAD_GATEWAY, "Upstream service unavailable".into())
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        let mut body = json!({
            "error": {
                "message": message,
                "code": status.as_u16(),
            }
        });

        if let AppError::LimitExceeded { resource, current, limit } = &self {
            body["error"]["reason"] = json!("limit_exceeded");
            body["error"]["resource"] = json!(resource);
            body["error"]["current"] = json!(current);
            body["error"]["limit"] = json!(limit);
        }

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

pub type AppResult<T> = Result<T, AppError>;
