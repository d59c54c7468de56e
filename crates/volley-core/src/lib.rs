//! Core request types and time primitives.
//!
//! Provides the work item staged by callers, the outcome a pool reports for
//! it, the failure data carried by error outcomes and the clock used for
//! pacing. The dispatch engine and every pool implementation build on these
//! types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{ErrorCategory, ExecutionError};
pub use models::{ErrorResult, EventKind, Outcome, Request, RequestId, Response};
pub use time::{Clock, RealClock, TestClock};
