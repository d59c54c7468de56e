//! Error types for dispatcher operations.
//!
//! These are faults in how the engine is used or driven: bad configuration,
//! store access while the store is disabled, staging during a run, retry
//! requests past the bound and supervision failures. Failures of individual
//! requests are not faults; they travel to handlers as
//! [`ExecutionError`](volley_core::ExecutionError) data.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Faults raised by the dispatch engine.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Invalid dispatcher configuration or missing setup.
    #[error("invalid dispatcher configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A feature was used while it is disabled.
    #[error("{feature} is disabled for this dispatcher")]
    Capability {
        /// Name of the disabled feature
        feature: &'static str,
    },

    /// A pool refused a submission because its connection budget is spent.
    #[error("pool {pool} is at capacity ({limit} connections)")]
    Capacity {
        /// Name of the saturated pool
        pool: String,
        /// Connection budget of the pool
        limit: usize,
    },

    /// Work was staged while a run is in progress.
    #[error("pending queue is closed while a run is in progress")]
    QueueClosed,

    /// The retry hook was called past the retry bound.
    #[error("retry limit reached after {attempts} attempts")]
    RetryLimit {
        /// Attempts already made for the item
        attempts: u32,
    },

    /// A controller task panicked.
    #[error("controller {controller_id} panicked: {error}")]
    ControllerPanic {
        /// Controller identifier
        controller_id: usize,
        /// Panic message
        error: String,
    },

    /// Controllers did not stop within the shutdown timeout.
    #[error("controllers did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A pool failed to set up or was used before setup.
    #[error("request pool error: {message}")]
    Pool {
        /// Pool error message
        message: String,
    },
}

impl DispatchError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a capability error for a disabled feature.
    pub fn capability(feature: &'static str) -> Self {
        Self::Capability { feature }
    }

    /// Creates a capacity error.
    pub fn capacity(pool: impl Into<String>, limit: usize) -> Self {
        Self::Capacity { pool: pool.into(), limit }
    }

    /// Creates a retry limit error.
    pub fn retry_limit(attempts: u32) -> Self {
        Self::RetryLimit { attempts }
    }

    /// Creates a controller panic error.
    pub fn controller_panic(controller_id: usize, error: impl Into<String>) -> Self {
        Self::ControllerPanic { controller_id, error: error.into() }
    }

    /// Creates a pool error.
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool { message: message.into() }
    }

    /// Returns the category for logging.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::Capability { .. } => ErrorCategory::Usage,
            Self::QueueClosed | Self::RetryLimit { .. } => ErrorCategory::Staging,
            Self::Capacity { .. } | Self::Pool { .. } => ErrorCategory::Pool,
            Self::ControllerPanic { .. } | Self::ShutdownTimeout { .. } => {
                ErrorCategory::Supervision
            },
        }
    }
}

/// Category of dispatcher error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Misuse of the public API.
    Usage,
    /// Pending queue and retry bookkeeping.
    Staging,
    /// Pool setup and submission.
    Pool,
    /// Controller supervision.
    Supervision,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage => write!(f, "usage"),
            Self::Staging => write!(f, "staging"),
            Self::Pool => write!(f, "pool"),
            Self::Supervision => write!(f, "supervision"),
        }
    }
}
