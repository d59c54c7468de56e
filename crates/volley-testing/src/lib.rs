//! Test infrastructure for the dispatch engine.
//!
//! Provides a scripted in-memory pool, handlers that record their
//! invocations and small fixture helpers, so engine behavior can be tested
//! without network access.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::time::Duration;

use volley_dispatch::DispatcherConfig;

pub mod handlers;
pub mod pool;

pub use handlers::{Invocation, InvocationLog, RecordingHandler};
pub use pool::{MockPool, MockPoolProbe, MockReply};
pub use volley_core::{Request, TestClock};

/// Creates `count` GET requests against distinct paths of `base_url`.
pub fn requests(base_url: &str, count: usize) -> Vec<Request> {
    (0..count).map(|index| Request::get(format!("{base_url}/items/{index}"))).collect()
}

/// Dispatcher configuration tuned for fast tests.
///
/// Short poll interval and telemetry refresh, and a shutdown timeout that
/// fails a hung test quickly.
pub fn fast_config(rate: f64) -> DispatcherConfig {
    let mut config = DispatcherConfig::new(rate);
    config.poll_interval = Duration::from_millis(2);
    config.telemetry_refresh = Duration::from_millis(20);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}
