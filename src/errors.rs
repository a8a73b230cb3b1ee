use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::storage::StoreError;

/// Coarse classification used by the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Authentication,
    Infrastructure,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProvisionError {
    #[error("Invalid request: {0}")]
    #[diagnostic(code(provisioner::validation))]
    Validation(String),

    #[error("Unauthenticated: {0}")]
    #[diagnostic(code(provisioner::unauthenticated))]
    Unauthenticated(String),

    #[error("Device `{0}` is not registered")]
    #[diagnostic(
        code(provisioner::device_not_registered),
        help("Devices must call /register before requesting activation codes or tokens")
    )]
    DeviceNotRegistered(String),

    #[error("Invalid or expired activation code")]
    #[diagnostic(code(provisioner::invalid_code))]
    InvalidCode,

    #[error("Device already claimed by another user")]
    #[diagnostic(code(provisioner::already_claimed))]
    AlreadyClaimed,

    #[error("Device locked until {locked_until} after too many failed claim attempts")]
    #[diagnostic(code(provisioner::device_locked))]
    DeviceLocked { locked_until: i64 },

    #[error("Timestamp outside the accepted window")]
    #[diagnostic(code(provisioner::invalid_timestamp))]
    InvalidTimestamp,

    #[error("Invalid signature")]
    #[diagnostic(code(provisioner::invalid_signature))]
    InvalidSignature,

    #[error("Device `{0}` was modified concurrently")]
    #[diagnostic(code(provisioner::concurrent_modification))]
    ConcurrentModification(String),

    #[error("Store error: {0}")]
    #[diagnostic(code(provisioner::store))]
    Store(#[from] StoreError),

    #[error("Random number generator failure: {0}")]
    #[diagnostic(code(provisioner::rng))]
    Rng(#[from] rand::Error),

    #[error("Cryptographic failure: {0}")]
    #[diagnostic(code(provisioner::crypto))]
    Crypto(String),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(provisioner::jose))]
    Jose(String),

    #[error("Config error: {0}")]
    #[diagnostic(code(provisioner::config))]
    Config(String),
}

impl From<josekit::JoseError> for ProvisionError {
    fn from(value: josekit::JoseError) -> Self {
        ProvisionError::Jose(value.to_string())
    }
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Validation(_) => ErrorKind::Validation,
            ProvisionError::DeviceNotRegistered(_) | ProvisionError::InvalidCode => {
                ErrorKind::NotFound
            }
            ProvisionError::AlreadyClaimed | ProvisionError::DeviceLocked { .. } => {
                ErrorKind::Conflict
            }
            ProvisionError::Unauthenticated(_)
            | ProvisionError::InvalidTimestamp
            | ProvisionError::InvalidSignature => ErrorKind::Authentication,
            ProvisionError::ConcurrentModification(_)
            | ProvisionError::Store(_)
            | ProvisionError::Rng(_)
            | ProvisionError::Crypto(_)
            | ProvisionError::Jose(_)
            | ProvisionError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// Message safe to hand back to callers. Infrastructure details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "invalid request",
            ProvisionError::Unauthenticated(_) => "missing user identity",
            ProvisionError::DeviceNotRegistered(_) => "device not registered - call /register first",
            ProvisionError::InvalidCode => "invalid activation code",
            ProvisionError::AlreadyClaimed => "device already claimed by another user",
            ProvisionError::DeviceLocked { .. } => {
                "device locked due to too many failed attempts - contact support"
            }
            ProvisionError::InvalidTimestamp => "timestamp expired or invalid",
            ProvisionError::InvalidSignature => "invalid signature",
            _ => "internal error",
        }
    }
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::FORBIDDEN,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        if kind == ErrorKind::Infrastructure {
            tracing::error!(error = %self, "request failed");
        }
        let message = match &self {
            // Validation messages describe the caller's own input
            ProvisionError::Validation(detail) => detail.clone(),
            other => other.public_message().to_string(),
        };
        (kind.status(), Json(json!({ "error": message }))).into_response()
    }
}
