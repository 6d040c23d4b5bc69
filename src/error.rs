//! Error types for the ODIS service.
//!
//! All errors implement `ResponseError` for Actix-web integration,
//! converting domain errors into HTTP status codes and a machine-readable
//! JSON body. Signers and the combiner share the same body shape so the
//! combiner can classify signer rejections without guessing.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DomainState;

/// Machine-readable code for rate-limit rejections.
pub const CODE_RATE_LIMITED: &str = "RATE_LIMITED";
/// Machine-readable code for disabled-domain rejections.
pub const CODE_DOMAIN_DISABLED: &str = "DOMAIN_DISABLED";

/// Service error type with structured error responses.
#[derive(Error, Debug)]
pub enum OdisError {
    // Validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid key version: {0}")]
    InvalidKeyVersion(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("API unavailable: {0}")]
    ApiUnavailable(String),

    // Rejections by design
    #[error("{}", rate_limited_message(*.not_before))]
    RateLimited {
        not_before: Option<u64>,
        status: Option<DomainState>,
    },

    #[error("Domain is disabled")]
    DomainDisabled { status: Option<DomainState> },

    // Persistence failures (fail closed, retryable)
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Domain state changed concurrently {attempts} times; retry the request")]
    CommitConflict { attempts: u32 },

    // Signing capability
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid partial signature from signer {signer}: {reason}")]
    InvalidPartialSignature { signer: usize, reason: String },

    #[error("Aggregation failed: {0}")]
    AggregationFailed(String),

    // Combiner errors
    #[error("Endpoint {0} has no signer counterpart")]
    UnmappedEndpoint(String),

    #[error("Insufficient signer responses: need {needed}, have {have}")]
    InsufficientSigners { needed: usize, have: usize },

    #[error("Signers rejected the request with status {status}")]
    SignersRejected { status: u16 },

    #[error("Signer unreachable: {0}")]
    SignerUnreachable(String),

    #[error("Invalid signer response: {0}")]
    InvalidSignerResponse(String),

    #[error("Invalid threshold: t={threshold} must be in 1..={total}")]
    InvalidThreshold { threshold: usize, total: usize },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn rate_limited_message(not_before: Option<u64>) -> String {
    match not_before {
        Some(t) => format!("Rate limited: retry at or after {t}"),
        None => "Rate limited: quota exhausted".to_string(),
    }
}

/// JSON error response body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub version: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DomainState>,
}

impl OdisError {
    /// Get the error code for structured error responses.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInput(_) => Some("INVALID_INPUT"),
            Self::InvalidDomain(_) => Some("INVALID_DOMAIN"),
            Self::InvalidKeyVersion(_) => Some("INVALID_KEY_VERSION"),
            Self::Unauthorized => Some("UNAUTHORIZED"),
            Self::ApiUnavailable(_) => Some("API_UNAVAILABLE"),
            Self::RateLimited { .. } => Some(CODE_RATE_LIMITED),
            Self::DomainDisabled { .. } => Some(CODE_DOMAIN_DISABLED),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::CommitConflict { .. } => Some("COMMIT_CONFLICT"),
            Self::SigningFailed(_) => Some("SIGNING_FAILED"),
            Self::InvalidPartialSignature { .. } => Some("INVALID_PARTIAL_SIGNATURE"),
            Self::AggregationFailed(_) => Some("AGGREGATION_FAILED"),
            Self::UnmappedEndpoint(_) => Some("UNMAPPED_ENDPOINT"),
            Self::InsufficientSigners { .. } => Some("INSUFFICIENT_SIGNERS"),
            Self::SignersRejected { .. } => Some("SIGNERS_REJECTED"),
            Self::SignerUnreachable(_) => Some("SIGNER_UNREACHABLE"),
            Self::InvalidSignerResponse(_) => Some("INVALID_SIGNER_RESPONSE"),
            Self::InvalidThreshold { .. } => Some("INVALID_THRESHOLD"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Config(_) => Some("CONFIG_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }

    /// Whether the client may retry the same request later.
    ///
    /// Validation errors and disabled domains are terminal; rate limits are
    /// retryable after `not_before`; infrastructure failures are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidDomain(_)
            | Self::InvalidKeyVersion(_)
            | Self::Unauthorized
            | Self::ApiUnavailable(_)
            | Self::DomainDisabled { .. }
            | Self::UnmappedEndpoint(_)
            | Self::InvalidThreshold { .. }
            | Self::Deserialization(_)
            | Self::Config(_) => false,
            Self::RateLimited { not_before, .. } => not_before.is_some(),
            Self::SignersRejected { status } => *status >= 500,
            Self::Storage(_)
            | Self::CommitConflict { .. }
            | Self::SigningFailed(_)
            | Self::InvalidPartialSignature { .. }
            | Self::AggregationFailed(_)
            | Self::InsufficientSigners { .. }
            | Self::SignerUnreachable(_)
            | Self::InvalidSignerResponse(_)
            | Self::Serialization(_)
            | Self::Internal(_) => true,
        }
    }

    /// Build the JSON body for this error.
    pub fn to_response_body(&self) -> ErrorResponse {
        let (not_before, status) = match self {
            Self::RateLimited { not_before, status } => (*not_before, *status),
            Self::DomainDisabled { status } => (None, *status),
            _ => (None, None),
        };

        ErrorResponse {
            success: false,
            version: env!("CARGO_PKG_VERSION").to_string(),
            error: self.to_string(),
            code: self.error_code().map(String::from),
            retryable: self.is_retryable(),
            not_before,
            status,
        }
    }
}

impl ResponseError for OdisError {
    fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request - Client errors
            Self::InvalidInput(_)
            | Self::InvalidDomain(_)
            | Self::InvalidKeyVersion(_)
            | Self::Deserialization(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            Self::Unauthorized => StatusCode::UNAUTHORIZED,

            // 403 Forbidden - waiting will not help
            Self::DomainDisabled { .. } => StatusCode::FORBIDDEN,

            // 429 Too Many Requests
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 501 Not Implemented - API switched off on this node
            Self::ApiUnavailable(_) => StatusCode::NOT_IMPLEMENTED,

            // Propagated majority status from the signers
            Self::SignersRejected { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            // 502 Bad Gateway - Downstream errors
            Self::SignerUnreachable(_)
            | Self::InvalidSignerResponse(_)
            | Self::InvalidPartialSignature { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable - retryable infrastructure conditions
            Self::InsufficientSigners { .. } | Self::CommitConflict { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error - Everything else
            Self::Storage(_)
            | Self::SigningFailed(_)
            | Self::AggregationFailed(_)
            | Self::UnmappedEndpoint(_)
            | Self::InvalidThreshold { .. }
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_response_body())
    }
}

// Conversion from common error types

impl From<std::io::Error> for OdisError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OdisError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<redb::Error> for OdisError {
    fn from(err: redb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for OdisError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for OdisError {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for OdisError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for OdisError {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for OdisError {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for OdisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::SignerUnreachable(format!("Request timed out: {err}"))
        } else if err.is_connect() {
            Self::SignerUnreachable(format!("Connection failed: {err}"))
        } else if err.is_decode() {
            Self::InvalidSignerResponse(err.to_string())
        } else {
            Self::SignerUnreachable(err.to_string())
        }
    }
}

/// Result type alias for service operations.
pub type OdisResult<T> = Result<T, OdisError>;
