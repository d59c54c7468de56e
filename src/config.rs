//! Configuration for the `volley` command.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use volley_core::Request;
use volley_dispatch::{DispatcherConfig, HttpPoolConfig, PoolAuth};

const CONFIG_FILE: &str = "volley.toml";
const ENV_PREFIX: &str = "VOLLEY_";

/// Complete command configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `VOLLEY_` (highest priority)
/// 2. Configuration file (`volley.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Nested keys use a double underscore, e.g. `VOLLEY_RATE=25` or
/// `VOLLEY_USE_STORE=false`. Pools and targets are best declared in the
/// file:
///
/// ```toml
/// rate = 10.0
///
/// [[pools]]
/// name = "primary"
/// proxy = "socks5://127.0.0.1:9050"
/// auth = { strategy = "query", name = "api_key", value = "secret" }
///
/// [[targets]]
/// url = "https://api.example.com/items"
/// repeat = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Global admission rate in requests per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Distinct connection pools a transport may keep.
    #[serde(default = "default_pool_hint")]
    pub pool_hint: usize,
    /// Per-pool connection budget; defaults to `ceil(rate)`.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Allocate the shared store.
    #[serde(default = "default_enabled")]
    pub use_store: bool,
    /// Track throughput.
    #[serde(default = "default_enabled")]
    pub use_rps: bool,
    /// Retries allowed per target request.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry failures that could succeed on another attempt.
    #[serde(default = "default_enabled")]
    pub retry_failures: bool,
    /// Controller poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds to wait for controllers once a run has ended.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    /// Request pools.
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolSettings>,
    /// Requests to dispatch.
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// One HTTP pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Pool name used in logs.
    pub name: String,
    /// Pools with the same group share a controller.
    #[serde(default)]
    pub group: Option<String>,
    /// Overrides the global per-pool connection budget.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// `http://`, `https://` or `socks5://` proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Static credential.
    #[serde(default)]
    pub auth: Option<PoolAuth>,
    /// Verify TLS certificates.
    #[serde(default = "default_enabled")]
    pub verify_tls: bool,
}

/// One request to stage, possibly several times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Target URL.
    pub url: String,
    /// Extra headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Query fields.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Request body.
    #[serde(default)]
    pub body: Option<String>,
    /// How many independent requests to stage.
    #[serde(default = "default_repeat")]
    pub repeat: usize,
}

impl Config {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    /// Extracts and validates configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the dispatcher's configuration.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::new(self.rate);
        config.pool_hint = self.pool_hint;
        config.max_connections = self.max_connections;
        config.use_store = self.use_store;
        config.use_rps = self.use_rps;
        config.max_retries = self.max_retries;
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_seconds);
        config
    }

    /// Convert to one configuration per HTTP pool.
    pub fn to_pool_configs(&self) -> Vec<HttpPoolConfig> {
        self.pools.iter().map(PoolSettings::to_pool_config).collect()
    }

    /// Expands the targets into requests, `repeat` copies each.
    pub fn requests(&self) -> Vec<Request> {
        self.targets
            .iter()
            .flat_map(|target| (0..target.repeat).map(move |_| target.to_request()))
            .collect()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            anyhow::bail!("rate must be a positive number");
        }

        if self.pool_hint == 0 {
            anyhow::bail!("pool_hint must be greater than 0");
        }

        if self.max_connections == Some(0) {
            anyhow::bail!("max_connections must be greater than 0");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.pools.is_empty() {
            anyhow::bail!("at least one pool must be configured");
        }

        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                anyhow::bail!("pool names must not be empty");
            }
            if pool.max_connections == Some(0) {
                anyhow::bail!("pool {} max_connections must be greater than 0", pool.name);
            }
            if pool.timeout_seconds == 0 {
                anyhow::bail!("pool {} timeout_seconds must be greater than 0", pool.name);
            }
        }

        for target in &self.targets {
            if target.url.trim().is_empty() {
                anyhow::bail!("target urls must not be empty");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            pool_hint: default_pool_hint(),
            max_connections: None,
            use_store: true,
            use_rps: true,
            max_retries: default_max_retries(),
            retry_failures: true,
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            pools: default_pools(),
            targets: Vec::new(),
        }
    }
}

impl PoolSettings {
    /// Creates settings for a pool named `name` with defaults elsewhere.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            max_connections: None,
            timeout_seconds: default_timeout_seconds(),
            proxy: None,
            headers: HashMap::new(),
            auth: None,
            verify_tls: true,
        }
    }

    /// Convert to the pool's configuration.
    pub fn to_pool_config(&self) -> HttpPoolConfig {
        HttpPoolConfig {
            group: self.group.clone(),
            max_connections: self.max_connections,
            timeout: Duration::from_secs(self.timeout_seconds),
            headers: self.headers.clone(),
            proxy: self.proxy.clone(),
            auth: self.auth.clone(),
            verify_tls: self.verify_tls,
            ..HttpPoolConfig::named(self.name.clone())
        }
    }
}

impl Target {
    /// Builds one request for this target.
    pub fn to_request(&self) -> Request {
        let mut request = Request::new(self.method.to_uppercase(), self.url.clone());
        for (name, value) in &self.headers {
            request = request.with_header(name.clone(), value.clone());
        }
        for (name, value) in &self.query {
            request = request.with_field(name.clone(), value.clone());
        }
        if let Some(body) = &self.body {
            request = request.with_body(body.clone());
        }
        request
    }
}

fn default_rate() -> f64 {
    10.0
}

fn default_pool_hint() -> usize {
    volley_dispatch::DEFAULT_POOL_HINT
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_pools() -> Vec<PoolSettings> {
    vec![PoolSettings::named("default")]
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_repeat() -> usize {
    1
}
