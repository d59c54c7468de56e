//! Outcome handlers and the context they run with.
//!
//! Handlers are registered per [`EventKind`] and run in registration order,
//! one completion at a time per controller. Each invocation receives a fresh
//! [`Context`] exposing the latest rate snapshot, the shared store (already
//! locked for the whole batch) and the retry and exit hooks.

use std::{collections::HashMap, fmt, sync::Arc};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use volley_core::{EventKind, Outcome, Request};

use crate::{
    error::{DispatchError, Result},
    retry::{RetryDecision, RetryLimit},
    store::StoreMap,
    telemetry::RateSnapshot,
};

/// Reacts to request outcomes.
///
/// # Example
///
/// ```
/// use volley_core::Outcome;
/// use volley_dispatch::callback::{Context, Handler};
///
/// struct CountResponses;
///
/// #[async_trait::async_trait]
/// impl Handler for CountResponses {
///     async fn handle(&self, _outcome: &Outcome, ctx: &mut Context<'_>) {
///         if let Ok(store) = ctx.store() {
///             let seen = store.get("seen").and_then(|v| v.as_u64()).unwrap_or(0);
///             store.insert("seen".into(), (seen + 1).into());
///         }
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Handles one outcome.
    async fn handle(&self, outcome: &Outcome, ctx: &mut Context<'_>);
}

/// Adapts a synchronous closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&Outcome, &mut Context<'_>) + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Outcome, &mut Context<'_>) + Send + Sync,
{
    async fn handle(&self, outcome: &Outcome, ctx: &mut Context<'_>) {
        (self.0)(outcome, ctx);
    }
}

/// Per-invocation view handed to a [`Handler`].
pub struct Context<'a> {
    request: &'a Request,
    rates: Option<RateSnapshot>,
    store: Option<&'a mut StoreMap>,
    retry_limit: RetryLimit,
    retry_requested: bool,
    abort: &'a CancellationToken,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        request: &'a Request,
        rates: Option<RateSnapshot>,
        store: Option<&'a mut StoreMap>,
        retry_limit: RetryLimit,
        abort: &'a CancellationToken,
    ) -> Self {
        Self { request, rates, store, retry_limit, retry_requested: false, abort }
    }

    /// The request this outcome belongs to.
    pub fn request(&self) -> &Request {
        self.request
    }

    /// Attempt number of the request, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.request.attempt
    }

    /// Latest throughput figures, or `None` when telemetry is disabled.
    pub fn rates(&self) -> Option<RateSnapshot> {
        self.rates
    }

    /// Direct access to the locked store map.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub fn store(&mut self) -> Result<&mut StoreMap> {
        self.store.as_deref_mut().ok_or_else(|| DispatchError::capability("shared store"))
    }

    /// Reads a value from the shared store.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub fn get(&self, key: &str) -> Result<Option<&Value>> {
        self.store
            .as_deref()
            .map(|store| store.get(key))
            .ok_or_else(|| DispatchError::capability("shared store"))
    }

    /// Writes a value to the shared store and returns the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        Ok(self.store()?.insert(key.into(), value.into()))
    }

    /// Asks for the request to be staged again once its handlers finish.
    ///
    /// The item keeps its identifier and counts as the same work item for
    /// the drain barrier. Calling this more than once per completion has no
    /// further effect.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::RetryLimit`] when the item has used all its
    /// retries; nothing is re-staged in that case.
    pub fn retry(&mut self) -> Result<()> {
        match self.retry_limit.decide(self.request.attempt) {
            RetryDecision::Requeue { next_attempt } => {
                debug!(request_id = %self.request.id, next_attempt, "retry requested");
                self.retry_requested = true;
                Ok(())
            },
            RetryDecision::GiveUp { reason } => {
                debug!(request_id = %self.request.id, %reason, "retry refused");
                Err(DispatchError::retry_limit(self.request.attempt))
            },
        }
    }

    /// Stops the run: no further admissions, in-flight requests still
    /// complete and the remaining pending items are abandoned.
    pub fn exit(&self) {
        self.abort.cancel();
    }

    /// Whether the run has been asked to stop.
    pub fn is_exiting(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub(crate) fn retry_requested(&self) -> bool {
        self.retry_requested
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request.id)
            .field("attempt", &self.request.attempt)
            .field("rates", &self.rates)
            .field("store_enabled", &self.store.is_some())
            .field("retry_requested", &self.retry_requested)
            .finish()
    }
}

/// Handlers per event kind, in registration order.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn Handler>>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the handlers for `kind`.
    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn Handler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Handlers registered for `kind`, in registration order.
    pub fn handlers_for(&self, kind: EventKind) -> &[Arc<dyn Handler>] {
        self.handlers.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers_for(kind).len()
    }

    /// Whether no handler is registered at all.
    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("response", &self.handler_count(EventKind::Response))
            .field("error", &self.handler_count(EventKind::Error))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use volley_core::{ErrorResult, ExecutionError};

    use super::*;

    fn error_outcome(request: &Request) -> Outcome {
        Outcome::Error(ErrorResult::new(
            request,
            ExecutionError::network("reset"),
            std::time::Duration::ZERO,
        ))
    }

    #[test]
    fn registry_keeps_registration_order_per_kind() {
        let mut registry = CallbackRegistry::new();
        assert!(registry.is_empty());

        let first: Arc<dyn Handler> = Arc::new(FnHandler::new(|_: &Outcome, _: &mut Context<'_>| {}));
        let second: Arc<dyn Handler> = Arc::new(FnHandler::new(|_: &Outcome, _: &mut Context<'_>| {}));
        registry.register(EventKind::Error, first.clone());
        registry.register(EventKind::Error, second.clone());

        let handlers = registry.handlers_for(EventKind::Error);
        assert!(Arc::ptr_eq(&handlers[0], &first));
        assert!(Arc::ptr_eq(&handlers[1], &second));
        assert_eq!(registry.handler_count(EventKind::Response), 0);
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn closure_handler_reads_and_writes_store() {
        let request = Request::get("http://localhost/a");
        let token = CancellationToken::new();
        let mut map = StoreMap::new();
        map.insert("seen".into(), json!(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            FnHandler::new(move |_: &Outcome, ctx: &mut Context<'_>| {
                calls.fetch_add(1, Ordering::SeqCst);
                let seen = ctx.get("seen").unwrap().and_then(Value::as_u64).unwrap_or(0);
                ctx.set("seen", seen + 1).unwrap();
            })
        };

        let mut ctx = Context::new(&request, None, Some(&mut map), RetryLimit::default(), &token);
        handler.handle(&error_outcome(&request), &mut ctx).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(map.get("seen"), Some(&json!(2)));
    }

    #[test]
    fn disabled_store_is_a_capability_error() {
        let request = Request::get("http://localhost/a");
        let token = CancellationToken::new();
        let mut ctx = Context::new(&request, None, None, RetryLimit::default(), &token);

        assert!(matches!(ctx.get("k"), Err(DispatchError::Capability { .. })));
        assert!(matches!(ctx.set("k", 1), Err(DispatchError::Capability { .. })));
        assert!(matches!(ctx.store(), Err(DispatchError::Capability { .. })));
    }

    #[test]
    fn retry_is_bounded_by_the_limit() {
        let token = CancellationToken::new();
        let fresh = Request::get("http://localhost/a");
        let mut ctx = Context::new(&fresh, None, None, RetryLimit::new(1), &token);
        assert!(ctx.retry().is_ok());
        assert!(ctx.retry_requested());

        let retried = fresh.next_attempt();
        let mut ctx = Context::new(&retried, None, None, RetryLimit::new(1), &token);
        assert!(matches!(ctx.retry(), Err(DispatchError::RetryLimit { attempts: 2 })));
        assert!(!ctx.retry_requested());
    }

    #[test]
    fn exit_cancels_the_run_token() {
        let request = Request::get("http://localhost/a");
        let token = CancellationToken::new();
        let ctx = Context::new(&request, None, None, RetryLimit::default(), &token);

        ctx.exit();

        assert!(ctx.is_exiting());
        assert!(token.is_cancelled());
    }
}
