// Error types shared by the token provider, the worker pool and the coordinator

use std::any::Any;

use thiserror::Error;

use crate::types::RateResult;

// Failure of a single vendor rate call. Always local to one hotel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VendorError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Vendor timeout after {0}ms")]
    Timeout(u64),

    #[error("Vendor rejected token")]
    TokenRejected,

    #[error("API error: {status_code} - {message}")]
    ApiResponseError { status_code: u16, message: String },

    #[error("No availability for hotel {0}")]
    NoAvailability(String),

    #[error("Invalid vendor response: {0}")]
    InvalidResponse(String),

    #[error("Vendor call panicked: {0}")]
    Panicked(String),
}

// Failure to obtain an authentication token
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication rejected: {status_code} - {message}")]
    Rejected { status_code: u16, message: String },

    #[error("Invalid auth response: {0}")]
    InvalidResponse(String),

    #[error("Authenticator panicked: {0}")]
    Panicked(String),

    #[error("Token provider stopped")]
    ProviderStopped,
}

// Why a single job did not produce a rate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RateFailure {
    #[error("vendor error: {0}")]
    Vendor(#[from] VendorError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("request cancelled")]
    Cancelled,

    #[error("worker pool is shutting down")]
    ShutdownInProgress,
}

// Request-level errors surfaced by the coordinator
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("No hotel ids in request")]
    NoHotels,

    #[error("Invalid stay: check-out {check_out} is not after check-in {check_in}")]
    InvalidStay { check_in: String, check_out: String },

    #[error("No rates found for {} hotels", .failures.len())]
    NoRatesFound { failures: Vec<RateResult> },

    #[error("Worker pool is shutting down")]
    ShutdownInProgress,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParseError(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArchiveError {
    #[error("Archive backend error: {0}")]
    Backend(String),

    #[error("Archive sink closed")]
    Closed,
}

// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
