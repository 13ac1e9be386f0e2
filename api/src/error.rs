//! Error handling and custom error types for the API
//!
//! Every handler returns [`ApiResult`]; errors render as a structured
//! [`ErrorResponse`] with a machine-readable code and the matching HTTP status.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use marketplace_core::MarketplaceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, warn};

/// Main API error type that encompasses all possible errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Missing or invalid credentials
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Authenticated caller may not touch the resource
    #[error("Authorization error: {message}")]
    Authorization { message: String },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// State machine violations and uniqueness conflicts
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Rate limiting errors
    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    /// Backing store failures
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// External service errors
    #[error("External service error: {service} - {message}")]
    ExternalService { service: String, message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },
}

impl ApiError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S, field: Option<S>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(|f| f.into()),
        }
    }

    /// Create a rate limit error
    pub fn rate_limit<S: Into<String>>(message: S) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    /// Create an internal server error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Get the appropriate HTTP status code for the error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Config { .. } | ApiError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Auth { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Authorization { .. } => StatusCode::FORBIDDEN,
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Config { .. } => "CONFIG_ERROR",
            ApiError::Auth { .. } => "AUTH_ERROR",
            ApiError::Authorization { .. } => "AUTHORIZATION_ERROR",
            ApiError::Validation { .. } => "VALIDATION_ERROR",
            ApiError::Conflict { .. } => "CONFLICT",
            ApiError::RateLimit { .. } => "RATE_LIMIT_ERROR",
            ApiError::Storage { .. } => "STORAGE_ERROR",
            ApiError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            ApiError::Internal { .. } => "INTERNAL_ERROR",
            ApiError::NotFound { .. } => "NOT_FOUND",
        }
    }

    /// Check if the error is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Log the error appropriately based on type
    pub fn log_error(&self) {
        match self {
            ApiError::Config { message } => {
                error!("Configuration error: {}", message);
            }
            ApiError::Storage { message } => {
                error!("Storage error: {}", message);
            }
            ApiError::Internal { message } => {
                error!("Internal server error: {}", message);
            }
            ApiError::ExternalService { service, message } => {
                error!("External service {} error: {}", service, message);
            }
            ApiError::RateLimit { message } => {
                warn!("Rate limit exceeded: {}", message);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }
    }

    /// Convert to a structured error response
    pub fn to_error_response(&self, request_id: Option<String>) -> ErrorResponse {
        self.log_error();

        let mut details = HashMap::new();
        if let ApiError::Validation {
            field: Some(field_name),
            ..
        } = self
        {
            details.insert("field".to_string(), field_name.clone().into());
        }

        // Storage and internal failures do not leak backend detail to callers.
        let message = if self.is_server_error() && !matches!(self, ApiError::ExternalService { .. })
        {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message,
                details,
            },
            request_id,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Structured error response for API clients
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,

    /// Request ID for tracing
    pub request_id: Option<String>,

    /// Response timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Detailed error information
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    pub details: HashMap<String, serde_json::Value>,
}

/// Custom result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Axum response implementation for API errors
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = self.to_error_response(None);

        tracing::debug!(
            "API Error Response: status={}, code={}, message={}",
            status_code,
            error_response.error.code,
            error_response.error.message
        );

        (status_code, Json(error_response)).into_response()
    }
}

impl From<MarketplaceError> for ApiError {
    fn from(err: MarketplaceError) -> Self {
        match err {
            MarketplaceError::Unauthorized(message) => ApiError::Auth { message },
            MarketplaceError::Forbidden(message) => ApiError::Authorization { message },
            MarketplaceError::NotFound(resource) => ApiError::NotFound { resource },
            MarketplaceError::Validation(message) => ApiError::Validation {
                message,
                field: None,
            },
            MarketplaceError::InvalidTransition(message) | MarketplaceError::Conflict(message) => {
                ApiError::Conflict { message }
            }
            MarketplaceError::Storage(message) => ApiError::Storage { message },
            MarketplaceError::Delivery(message) => ApiError::ExternalService {
                service: "webhook".to_string(),
                message,
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation {
            message: rejection.body_text(),
            field: None,
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation {
            message: rejection.body_text(),
            field: None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal {
            message: format!("Serialization error: {}", err),
        }
    }
}
