//! API error taxonomy and status-code mapping.
//!
//! Every error renders as `{"detail": <message>}` with the appropriate
//! status code, matching what clients of the admission-webhook contract
//! already expect.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use keel_admission::AdmissionError;
use keel_store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Schema validation failure or a missing reconciler on CREATE.
    #[error("{0}")]
    BadRequest(String),

    /// An admission webhook denied the write.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, or hard delete blocked by finalizers.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("not found".to_string()),
            StoreError::DuplicateName(name) => {
                ApiError::Conflict(format!("'{name}' already exists"))
            }
            StoreError::FinalizersPresent => {
                ApiError::Conflict("finalizers present; resource cannot be deleted".to_string())
            }
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Transient(msg) | StoreError::Decode(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Denied(message) => ApiError::Forbidden(message),
            AdmissionError::Store(store) => store.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_the_documented_codes() {
        assert_eq!(
            ApiError::from(StoreError::NotFound).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::DuplicateName("r1".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::FinalizersPresent).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(StoreError::Transient("db down".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn admission_denial_is_forbidden() {
        let err = ApiError::from(AdmissionError::Denied("no".into()));
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "no");
    }
}
