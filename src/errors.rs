//! Error taxonomy shared by the engine and destinations.
//!
//! Every failure surfaced to a caller is an [`ActionError`]. The variant
//! decides whether the dispatcher may retry:
//!
//! - `PayloadValidation`: bad or missing input data. Never retried.
//! - `Integration`: business-rule rejection with a code. Never retried.
//! - `Retryable`: explicit transient failure. Always retried.
//! - `Api`: raw HTTP failure. Retried for 408, 423, 429 and 5xx except 501.
//! - `InvalidAuthentication`: credentials rejected after a refresh attempt.

use std::fmt;

pub const PAYLOAD_VALIDATION_FAILED: &str = "PAYLOAD_VALIDATION_FAILED";
pub const INVALID_AUTHENTICATION: &str = "INVALID_AUTHENTICATION";
pub const RETRYABLE_ERROR: &str = "RETRYABLE_ERROR";
pub const OAUTH_REFRESH_FAILED: &str = "OAUTH_REFRESH_FAILED";
pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";

/// Statuses whose failures are transient.
const RETRYABLE_STATUSES: [u16; 3] = [408, 423, 429];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PayloadValidation,
    Integration,
    Retryable,
    Api,
    InvalidAuthentication,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PayloadValidation => "PayloadValidationError",
            ErrorKind::Integration => "IntegrationError",
            ErrorKind::Retryable => "RetryableError",
            ErrorKind::Api => "APIError",
            ErrorKind::InvalidAuthentication => "InvalidAuthenticationError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    PayloadValidation {
        message: String,
    },
    Integration {
        message: String,
        code: String,
        status: u16,
    },
    Retryable {
        message: String,
        status: u16,
    },
    Api {
        message: String,
        status: u16,
    },
    InvalidAuthentication {
        message: String,
        code: String,
    },
}

impl ActionError {
    pub fn payload_validation(message: impl Into<String>) -> Self {
        ActionError::PayloadValidation {
            message: message.into(),
        }
    }

    pub fn integration(message: impl Into<String>, code: impl Into<String>, status: u16) -> Self {
        ActionError::Integration {
            message: message.into(),
            code: code.into(),
            status,
        }
    }

    /// Transient failure with the default status (500).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::retryable_with_status(message, 500)
    }

    pub fn retryable_with_status(message: impl Into<String>, status: u16) -> Self {
        ActionError::Retryable {
            message: message.into(),
            status,
        }
    }

    pub fn api(message: impl Into<String>, status: u16) -> Self {
        ActionError::Api {
            message: message.into(),
            status,
        }
    }

    pub fn invalid_authentication(message: impl Into<String>) -> Self {
        ActionError::InvalidAuthentication {
            message: message.into(),
            code: INVALID_AUTHENTICATION.to_string(),
        }
    }

    pub fn invalid_authentication_with_code(
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        ActionError::InvalidAuthentication {
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::PayloadValidation { .. } => ErrorKind::PayloadValidation,
            ActionError::Integration { .. } => ErrorKind::Integration,
            ActionError::Retryable { .. } => ErrorKind::Retryable,
            ActionError::Api { .. } => ErrorKind::Api,
            ActionError::InvalidAuthentication { .. } => ErrorKind::InvalidAuthentication,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ActionError::PayloadValidation { message }
            | ActionError::Integration { message, .. }
            | ActionError::Retryable { message, .. }
            | ActionError::Api { message, .. }
            | ActionError::InvalidAuthentication { message, .. } => message,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ActionError::PayloadValidation { .. } => 400,
            ActionError::Integration { status, .. }
            | ActionError::Retryable { status, .. }
            | ActionError::Api { status, .. } => *status,
            ActionError::InvalidAuthentication { .. } => 401,
        }
    }

    pub fn code(&self) -> String {
        match self {
            ActionError::PayloadValidation { .. } => PAYLOAD_VALIDATION_FAILED.to_string(),
            ActionError::Integration { code, .. } | ActionError::InvalidAuthentication { code, .. } => {
                code.clone()
            }
            ActionError::Retryable { .. } => RETRYABLE_ERROR.to_string(),
            ActionError::Api { status, .. } => http_error_code(*status).to_string(),
        }
    }

    /// Whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ActionError::Retryable { .. } => true,
            ActionError::Api { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind(), self.code(), self.message())
    }
}

impl std::error::Error for ActionError {}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status) || (status >= 500 && status != 501)
}

/// Canonical code for an HTTP status.
pub fn http_error_code(status: u16) -> &'static str {
    match status {
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        402 => "PAYMENT_REQUIRED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        405 => "METHOD_NOT_ALLOWED",
        408 => "REQUEST_TIMEOUT",
        409 => "CONFLICT",
        410 => "GONE",
        413 => "PAYLOAD_TOO_LARGE",
        415 => "UNSUPPORTED_MEDIA_TYPE",
        422 => "UNPROCESSABLE_ENTITY",
        423 => "LOCKED",
        429 => "TOO_MANY_REQUESTS",
        500 => "INTERNAL_SERVER_ERROR",
        501 => "NOT_IMPLEMENTED",
        502 => "BAD_GATEWAY",
        503 => "SERVICE_UNAVAILABLE",
        504 => "GATEWAY_TIMEOUT",
        _ if status >= 500 => "SERVER_ERROR",
        _ => "UNKNOWN_ERROR",
    }
}
