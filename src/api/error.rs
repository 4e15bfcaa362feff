use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::errors::{DomainError, ServiceError, SyncError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("External dependency error: {0}")]
    External(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }
}

impl From<DomainError> for AppError {
    fn from(error: DomainError) -> Self {
        match &error {
            DomainError::Validation(_) | DomainError::InvalidUuid(_) => {
                Self::BadRequest(error.to_string())
            }
            DomainError::EntityNotFound(_, _) | DomainError::DeletedEntity(_, _) => {
                Self::NotFound(error.to_string())
            }
            DomainError::AuthorizationFailed(_) => Self::Forbidden(error.to_string()),
            DomainError::Sync(sync) => match sync {
                SyncError::AlreadyResolved(_) => Self::Conflict(error.to_string()),
                SyncError::UnknownEntityType(_)
                | SyncError::UnsupportedAction(_)
                | SyncError::MissingEntityId
                | SyncError::MissingVersion => Self::BadRequest(error.to_string()),
                SyncError::DeliveryFailed(_)
                | SyncError::DeliveryTimeout
                | SyncError::UnknownTargetService(_) => Self::External(error.to_string()),
                SyncError::Other(_) => Self::Internal(error.to_string()),
            },
            _ => Self::Internal(error.to_string()),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Domain(domain) => Self::from(domain),
            ServiceError::PermissionDenied(m) => Self::Forbidden(m),
            ServiceError::Authentication(m) => Self::Unauthorized(m),
            ServiceError::Network(m) | ServiceError::ExternalService(m) => Self::External(m),
            ServiceError::Configuration(m) => Self::Internal(m),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
