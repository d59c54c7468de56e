//! Wires a [`Config`] into a dispatcher run.

use anyhow::{Context as _, Result};
use serde_json::{json, Value};
use tracing::{info, warn};
use volley_core::EventKind;
use volley_dispatch::{Dispatcher, HttpPool, RequestPool, RunReport, StoreMap};

use crate::config::Config;

/// What one invocation of the command produced.
#[derive(Debug, Clone)]
pub struct Summary {
    /// Dispatcher report.
    pub report: RunReport,
    /// Counters collected by the logging handlers, keyed by `status.<code>`
    /// and `error.<category>`. Empty when the store is disabled.
    pub counters: StoreMap,
}

impl Summary {
    /// Renders the summary as JSON for printing.
    pub fn to_json(&self) -> Value {
        let report = &self.report;
        json!({
            "outcome": format!("{:?}", report.outcome),
            "staged": report.staged,
            "admitted": report.admitted,
            "responses": report.responses,
            "errors": report.errors,
            "retries": report.retries,
            "abandoned": report.abandoned,
            "tickets_emitted": report.tickets_emitted,
            "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "rates": report.rates.map(|rates| json!({
                "average": rates.average,
                "last_second": rates.last_second,
                "last_ten_seconds": rates.last_ten_seconds,
                "total": rates.total,
            })),
            "counters": self.counters,
        })
    }
}

/// Builds a dispatcher with one HTTP pool per configured pool and the
/// logging handlers registered.
pub fn build_dispatcher(config: &Config) -> Result<Dispatcher> {
    let pools: Vec<Box<dyn RequestPool>> = config
        .to_pool_configs()
        .into_iter()
        .map(|pool| Box::new(HttpPool::new(pool)) as Box<dyn RequestPool>)
        .collect();
    let mut dispatcher = Dispatcher::new(config.to_dispatcher_config(), pools)
        .context("Failed to create dispatcher")?;

    dispatcher.on_fn(EventKind::Response, |outcome, ctx| {
        let Some(response) = outcome.as_response() else {
            return;
        };
        let rates = ctx.rates().unwrap_or_default();
        info!(
            request_id = %response.request_id,
            status = response.status,
            attempt = response.attempt,
            duration_ms = response.duration.as_millis(),
            last_second = rates.last_second,
            average = rates.average,
            "response received"
        );
        if let Ok(store) = ctx.store() {
            bump(store, format!("status.{}", response.status));
        }
    });

    let retry_failures = config.retry_failures;
    dispatcher.on_fn(EventKind::Error, move |outcome, ctx| {
        let Some(failure) = outcome.as_error() else {
            return;
        };
        let category = failure.error.category();
        warn!(
            request_id = %failure.request_id,
            attempt = failure.attempt,
            %category,
            error = %failure.error,
            "request failed"
        );
        if let Ok(store) = ctx.store() {
            bump(store, format!("error.{category}"));
        }
        if retry_failures && failure.error.is_retryable() {
            if let Err(error) = ctx.retry() {
                warn!(request_id = %failure.request_id, error = %error, "giving up on request");
            }
        }
    });

    Ok(dispatcher)
}

/// Stages every configured target and runs the dispatcher once.
pub async fn run(config: &Config) -> Result<Summary> {
    let mut dispatcher = build_dispatcher(config)?;
    let staged = dispatcher.stage_all(config.requests()).context("Failed to stage targets")?;
    info!(staged, pools = dispatcher.pool_count(), rate = config.rate, "targets staged");

    let report = dispatcher.run().await.context("Dispatcher run failed")?;
    let counters = match dispatcher.store() {
        Ok(store) => store.snapshot().await,
        Err(_) => StoreMap::new(),
    };
    Ok(Summary { report, counters })
}

fn bump(store: &mut StoreMap, key: String) {
    let count = store.get(&key).and_then(Value::as_u64).unwrap_or(0);
    store.insert(key, Value::from(count + 1));
}
