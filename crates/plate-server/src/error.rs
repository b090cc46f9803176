//! HTTP error mapping.
//!
//! Every failure leaves the API as a JSON body with `status`, `error`,
//! `message`, `path` and `timestamp`. Handlers do not know the request
//! path, so [`attach_path`] fills it in on the way out.

use crate::metrics;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use plate_core::model::now_millis;
use plate_core::{DispatchError, FanoutError, RegistryError, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),

    /// Talking to the remote server failed.
    #[error("{0}")]
    Protocol(String),

    #[error("An unexpected error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Protocol(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "Not Found",
            ApiError::Conflict(_) => "Conflict",
            ApiError::Validation(_) => "Validation Failed",
            ApiError::Protocol(_) => "Protocol Error",
            ApiError::Internal(_) => "Internal Server Error",
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RegistryError::AlreadyExists(_) => ApiError::Conflict(err.to_string()),
            RegistryError::Provisioning(_) | RegistryError::Connection(_) => {
                ApiError::Protocol(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::SenderUnknown(_)
            | DispatchError::RecipientUnknown(_)
            | DispatchError::UnknownPrincipal(_)
            | DispatchError::MessageNotFound(_) => ApiError::NotFound(err.to_string()),
            DispatchError::Protocol(_) => ApiError::Protocol(err.to_string()),
            DispatchError::Store(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<FanoutError> for ApiError {
    fn from(err: FanoutError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

/// JSON error body.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: &'static str,
    pub message: String,
    pub path: String,
    pub timestamp: u64,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
            metrics::record_error(self.label());
        } else {
            warn!(error = %self, "Request rejected");
        }

        let body = ErrorBody {
            status: status.as_u16(),
            error: self.label(),
            message: self.to_string(),
            path: String::new(),
            timestamp: now_millis(),
        };
        let mut response = (status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        response
    }
}

/// Middleware writing the request path into error bodies.
pub async fn attach_path(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    match response.extensions().get::<ErrorBody>().cloned() {
        Some(body) => {
            let status = response.status();
            (status, Json(ErrorBody { path, ..body })).into_response()
        }
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(RegistryError::NotFound("34ABC123".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(RegistryError::AlreadyExists("34ABC123".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(DispatchError::RecipientUnknown("06XY42".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DispatchError::MessageNotFound(7)),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(DispatchError::Protocol("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::Validation("plateNumber: invalid".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status);
        }
    }

    #[test]
    fn test_protocol_errors_are_labelled() {
        let err = ApiError::from(DispatchError::Protocol("boom".into()));
        assert_eq!(err.label(), "Protocol Error");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
