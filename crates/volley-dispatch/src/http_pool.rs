//! `reqwest`-backed request pool.
//!
//! Each [`HttpPool`] owns one HTTP client with its own proxy, default headers
//! and optional static credential, so several pools can spread the same
//! workload over distinct identities. Requests run as spawned tasks and
//! report back on the pool's completion feed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use volley_core::{ErrorResult, ExecutionError, Outcome, Request, Response};

use crate::{
    error::{DispatchError, Result},
    pool::{completion_channel, CompletionFeed, CompletionSender, RequestPool},
};

const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Where a pool's static credential goes on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum PoolAuth {
    /// Sent as a request header.
    Header {
        /// Header name
        name: String,
        /// Header value
        value: String,
    },
    /// Appended as a query field.
    Query {
        /// Field name
        name: String,
        /// Field value
        value: String,
    },
}

/// Configuration for one [`HttpPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPoolConfig {
    /// Name used in logs.
    pub name: String,
    /// Pools with the same group share a controller.
    pub group: Option<String>,
    /// Overrides the dispatcher's per-pool connection budget.
    pub max_connections: Option<usize>,
    /// Timeout for a whole request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Headers sent with every request.
    pub headers: HashMap<String, String>,
    /// Proxy URL; `http://`, `https://` and `socks5://` schemes are supported.
    pub proxy: Option<String>,
    /// Static credential.
    pub auth: Option<PoolAuth>,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Report 4xx/5xx responses as errors instead of responses.
    pub error_for_status: bool,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            group: None,
            max_connections: None,
            timeout: Duration::from_secs(30),
            user_agent: concat!("volley/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: HashMap::new(),
            proxy: None,
            auth: None,
            max_redirects: 5,
            verify_tls: true,
            error_for_status: true,
        }
    }
}

impl HttpPoolConfig {
    /// Creates a configuration named `name` with defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }
}

#[derive(Debug)]
struct Execution {
    pool: String,
    auth: Option<PoolAuth>,
    timeout: Duration,
    error_for_status: bool,
}

/// Request pool executing HTTP requests with `reqwest`.
#[derive(Debug)]
pub struct HttpPool {
    config: HttpPoolConfig,
    client: Option<reqwest::Client>,
    completions: Option<CompletionSender>,
    execution: Arc<Execution>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    cancellation_token: CancellationToken,
}

impl HttpPool {
    /// Creates a pool; the HTTP client is built at setup.
    pub fn new(config: HttpPoolConfig) -> Self {
        let execution = Arc::new(Execution {
            pool: config.name.clone(),
            auth: config.auth.clone(),
            timeout: config.timeout,
            error_for_status: config.error_for_status,
        });
        Self {
            config,
            client: None,
            completions: None,
            execution,
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity: 0,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &HttpPoolConfig {
        &self.config
    }

    fn build_client(&self, max_connections: usize) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(&self.config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(self.config.max_redirects))
            .danger_accept_invalid_certs(!self.config.verify_tls)
            .pool_max_idle_per_host(max_connections)
            .default_headers(default_headers(&self.config)?);

        if let Some(proxy) = &self.config.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                DispatchError::pool(format!("invalid proxy for pool {}: {e}", self.config.name))
            })?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(|e| {
            DispatchError::pool(format!(
                "failed to build HTTP client for pool {}: {e}",
                self.config.name
            ))
        })
    }
}

#[async_trait::async_trait]
impl RequestPool for HttpPool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn group(&self) -> Option<&str> {
        self.config.group.as_deref()
    }

    async fn setup(&mut self, pool_hint: usize, max_connections: usize) -> Result<CompletionFeed> {
        let capacity = self.config.max_connections.unwrap_or(max_connections).max(1);
        let client = self.build_client(capacity)?;
        let (sender, feed) = completion_channel();

        self.client = Some(client);
        self.completions = Some(sender);
        self.capacity = capacity;
        self.cancellation_token = CancellationToken::new();

        info!(
            pool = %self.config.name,
            group = ?self.config.group,
            pool_hint,
            capacity,
            proxied = self.config.proxy.is_some(),
            "http pool ready"
        );
        Ok(feed)
    }

    fn remaining_tasks(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn submit(&mut self, request: Request) -> Result<()> {
        let (Some(client), Some(completions)) = (&self.client, &self.completions) else {
            return Err(DispatchError::pool(format!(
                "pool {} used before setup",
                self.config.name
            )));
        };
        if self.remaining_tasks() >= self.capacity {
            return Err(DispatchError::capacity(&self.config.name, self.capacity));
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let client = client.clone();
        let completions = completions.clone();
        let execution = self.execution.clone();
        let in_flight = self.in_flight.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = execute(&client, request, &execution) => Some(outcome),
                () = token.cancelled() => None,
            };
            in_flight.fetch_sub(1, Ordering::AcqRel);
            if let Some(outcome) = outcome {
                let _ = completions.send(outcome);
            }
        });
        Ok(())
    }

    async fn teardown(&mut self) {
        self.cancellation_token.cancel();
        self.completions = None;
        self.client = None;
        debug!(pool = %self.config.name, "http pool torn down");
    }
}

fn default_headers(config: &HttpPoolConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let mut insert = |name: &str, value: &str| -> Result<()> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            DispatchError::pool(format!("invalid header name {name} for pool {}: {e}", config.name))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            DispatchError::pool(format!("invalid value for header {name} in pool {}: {e}", config.name))
        })?;
        headers.insert(header_name, header_value);
        Ok(())
    };

    for (name, value) in &config.headers {
        insert(name, value)?;
    }
    if let Some(PoolAuth::Header { name, value }) = &config.auth {
        insert(name, value)?;
    }
    Ok(headers)
}

async fn execute(client: &reqwest::Client, request: Request, execution: &Execution) -> Outcome {
    let start_time = Instant::now();
    let span = info_span!(
        "pool_request",
        pool = %execution.pool,
        request_id = %request.id,
        url = %request.url,
        attempt = request.attempt
    );

    async move {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                let error = ExecutionError::invalid_request(format!(
                    "invalid method {}: {e}",
                    request.method
                ));
                return Outcome::Error(ErrorResult::new(&request, error, start_time.elapsed()));
            },
        };

        let mut http_request = client.request(method, &request.url);
        if !request.fields.is_empty() {
            http_request = http_request.query(&request.fields);
        }
        if let Some(PoolAuth::Query { name, value }) = &execution.auth {
            http_request = http_request.query(&[(name, value)]);
        }
        for (key, value) in &request.headers {
            if !is_managed_header(key) {
                http_request = http_request.header(key, value);
            }
        }
        if !request.body.is_empty() {
            http_request = http_request.body(request.body.clone());
        }

        let response = match http_request.send().await {
            Ok(response) => response,
            Err(e) => {
                let duration = start_time.elapsed();
                warn!(duration_ms = duration.as_millis(), "request failed: {}", e);
                let error = if e.is_timeout() {
                    ExecutionError::timeout(
                        u64::try_from(execution.timeout.as_millis()).unwrap_or(u64::MAX),
                    )
                } else if e.is_builder() {
                    ExecutionError::invalid_request(e.to_string())
                } else if e.is_connect() {
                    ExecutionError::network(format!("connection failed: {e}"))
                } else {
                    ExecutionError::network(e.to_string())
                };
                return Outcome::Error(ErrorResult::new(&request, error, duration));
            },
        };

        let status = response.status().as_u16();
        let headers = extract_headers(response.headers());
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let error = ExecutionError::network(format!("failed to read response body: {e}"));
                return Outcome::Error(ErrorResult::new(&request, error, start_time.elapsed()));
            },
        };
        let duration = start_time.elapsed();
        debug!(status, duration_ms = duration.as_millis(), "received response");

        if execution.error_for_status && status >= 400 {
            let text = truncate_body(&body);
            let error = if status >= 500 {
                ExecutionError::server_error(status, text)
            } else {
                ExecutionError::client_error(status, text)
            };
            return Outcome::Error(ErrorResult::new(&request, error, duration));
        }

        Outcome::Response(Response {
            request_id: request.id,
            status,
            headers,
            body,
            duration,
            attempt: request.attempt,
        })
    }
    .instrument(span)
    .await
}

fn truncate_body(body: &[u8]) -> String {
    if body.len() > MAX_ERROR_BODY_SIZE {
        let truncated = String::from_utf8_lossy(&body[..MAX_ERROR_BODY_SIZE]);
        format!("{truncated}... (truncated)")
    } else {
        String::from_utf8_lossy(body).into_owned()
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Headers the transport sets itself and requests may not override.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
