//! Failure data carried by [`ErrorResult`](crate::models::ErrorResult).
//!
//! These errors describe why a single request failed. They travel to error
//! handlers as part of an outcome and never abort a run.

use std::fmt;

use thiserror::Error;

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Request timed out.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Server answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Server answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// The request could not be built.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// The pool executing the request stopped reporting completions.
    #[error("pool {pool} lost the request")]
    PoolLost {
        /// Name of the pool that went away
        pool: String,
    },
}

impl ExecutionError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a pool lost error.
    pub fn pool_lost(pool: impl Into<String>) -> Self {
        Self::PoolLost { pool: pool.into() }
    }

    /// HTTP status attached to the failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }

    /// Whether resubmitting the same request could plausibly succeed.
    ///
    /// Handlers use this to decide whether to call the retry hook. Client
    /// errors and malformed requests are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::PoolLost { .. } => true,
            Self::ClientError { status_code, .. } => *status_code == 429,
            Self::InvalidRequest { .. } => false,
        }
    }

    /// Returns the category for logging.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Network { .. } => ErrorCategory::Network,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ClientError { .. } => ErrorCategory::Client,
            Self::ServerError { .. } => ErrorCategory::Server,
            Self::InvalidRequest { .. } => ErrorCategory::Request,
            Self::PoolLost { .. } => ErrorCategory::Pool,
        }
    }
}

/// Coarse classification of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity problems.
    Network,
    /// Timeouts.
    Timeout,
    /// HTTP 4xx.
    Client,
    /// HTTP 5xx.
    Server,
    /// Malformed request.
    Request,
    /// Pool failure.
    Pool,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Request => write!(f, "request"),
            Self::Pool => write!(f, "pool"),
        }
    }
}
