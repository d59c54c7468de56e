//! Work items and the outcomes they complete with.
//!
//! A [`Request`] is staged by the caller and handed to exactly one pool. The
//! pool answers with an [`Outcome`], which is either a [`Response`] or an
//! [`ErrorResult`]; the engine routes it to the handlers registered for its
//! [`EventKind`].

use std::{collections::HashMap, fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExecutionError;

/// Strongly-typed request identifier.
///
/// Assigned when the request is built and kept across retries, so handlers
/// can correlate every attempt of the same work item.
///
/// # Example
///
/// ```
/// use volley_core::models::RequestId;
/// let id = RequestId::new();
/// println!("staging request {id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Creates a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A unit of outbound work.
///
/// The engine never inspects the fields; they are interpreted by the pool
/// that executes the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Identifier shared by every attempt of this work item.
    pub id: RequestId,
    /// HTTP method name, e.g. `GET`.
    pub method: String,
    /// Target URL.
    pub url: String,
    /// Extra request headers.
    pub headers: HashMap<String, String>,
    /// Query string fields appended to the URL.
    pub fields: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
    /// 1-based attempt number, incremented on every retry.
    pub attempt: u32,
}

impl Request {
    /// Creates a request for `method` and `url` with no headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            fields: Vec::new(),
            body: Bytes::new(),
            attempt: 1,
        }
    }

    /// Creates a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// Creates a `POST` request carrying `body`.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", url).with_body(body)
    }

    /// Replaces the generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Appends a query field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns a copy of this request for its next attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self { attempt: self.attempt.saturating_add(1), ..self.clone() }
    }
}

/// Successful completion of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request this response answers.
    pub request_id: RequestId,
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lower-cased names.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
    /// Time between submission and completion.
    pub duration: Duration,
    /// Attempt number that produced this response.
    pub attempt: u32,
}

impl Response {
    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failed completion of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResult {
    /// Request that failed.
    pub request_id: RequestId,
    /// What went wrong.
    pub error: ExecutionError,
    /// Time between submission and failure.
    pub duration: Duration,
    /// Attempt number that failed.
    pub attempt: u32,
}

impl ErrorResult {
    /// Creates an error result for `request`.
    pub fn new(request: &Request, error: ExecutionError, duration: Duration) -> Self {
        Self { request_id: request.id, error, duration, attempt: request.attempt }
    }
}

/// What a pool reports when a request finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The request completed.
    Response(Response),
    /// The request failed.
    Error(ErrorResult),
}

impl Outcome {
    /// Event kind used to route this outcome to handlers.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Response(_) => EventKind::Response,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Identifier of the request this outcome belongs to.
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Response(response) => response.request_id,
            Self::Error(error) => error.request_id,
        }
    }

    /// Attempt number of the request this outcome belongs to.
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Response(response) => response.attempt,
            Self::Error(error) => error.attempt,
        }
    }

    /// Returns the response, if this outcome is one.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            Self::Error(_) => None,
        }
    }

    /// Returns the error, if this outcome is one.
    pub fn as_error(&self) -> Option<&ErrorResult> {
        match self {
            Self::Response(_) => None,
            Self::Error(error) => Some(error),
        }
    }
}

/// Event kinds handlers can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request produced a response.
    Response,
    /// A request failed.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response => write!(f, "response"),
            Self::Error => write!(f, "error"),
        }
    }
}
