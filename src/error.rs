//! Error types for mail intake.
//!
//! Only faults live here. "Not configured" and "not yet authorized" are
//! ordinary results carried by `ProviderBatch`, never errors.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Transport-level failures talking to a mail source.
///
/// These propagate to the caller; an HTTP shell would map them to a 5xx.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Failed to connect to {provider}: {reason}")]
    Connect { provider: String, reason: String },

    #[error("Protocol error from {provider}: {reason}")]
    Protocol { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to read batch file {path}: {reason}")]
    BatchFile { path: String, reason: String },

    #[error("Fetch from {provider} was cancelled")]
    Cancelled { provider: String },

    #[error("Fetch from {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// OAuth credential lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("OAuth client credentials are not configured")]
    NotConfigured,

    #[error("Authorization code rejected: {0}")]
    InvalidCode(String),

    #[error("Token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Refresh token was revoked or has expired")]
    InvalidGrant,
}

/// A single message could not be turned into a normalized record.
///
/// Recovered locally: the message is skipped and counted.
#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("Message {id} is not a parseable RFC 5322 message")]
    Unparseable { id: String },

    #[error("Message {id} has no source bytes")]
    MissingSource { id: String },

    #[error("Message {id} body part could not be decoded: {reason}")]
    BodyDecode { id: String, reason: String },
}
