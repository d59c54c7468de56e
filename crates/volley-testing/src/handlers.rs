//! Handlers that record what they were called with.

use std::{sync::Arc, time::Duration};

use tokio::sync::RwLock;
use volley_core::{EventKind, Outcome, RequestId};
use volley_dispatch::{Context, Handler, RateSnapshot};

/// One handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Kind of the outcome.
    pub kind: EventKind,
    /// Request the outcome belongs to.
    pub request_id: RequestId,
    /// Attempt number of the request.
    pub attempt: u32,
    /// Rates visible to the handler.
    pub rates: Option<RateSnapshot>,
}

/// Shared list of invocations.
#[derive(Debug, Clone, Default)]
pub struct InvocationLog {
    entries: Arc<RwLock<Vec<Invocation>>>,
}

impl InvocationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler appending to this log.
    pub fn handler(&self) -> RecordingHandler {
        RecordingHandler { log: self.clone(), delay: Duration::ZERO }
    }

    /// Handler appending to this log after sleeping for `delay`.
    pub fn slow_handler(&self, delay: Duration) -> RecordingHandler {
        RecordingHandler { log: self.clone(), delay }
    }

    /// All invocations in the order they happened.
    pub async fn entries(&self) -> Vec<Invocation> {
        self.entries.read().await.clone()
    }

    /// Number of invocations.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing was recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Number of invocations for `request_id`.
    pub async fn count_for(&self, request_id: RequestId) -> usize {
        self.entries.read().await.iter().filter(|entry| entry.request_id == request_id).count()
    }

    /// Number of invocations of `kind`.
    pub async fn count_kind(&self, kind: EventKind) -> usize {
        self.entries.read().await.iter().filter(|entry| entry.kind == kind).count()
    }
}

/// Handler recording every outcome into an [`InvocationLog`].
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    log: InvocationLog,
    delay: Duration,
}

#[async_trait::async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, outcome: &Outcome, ctx: &mut Context<'_>) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.entries.write().await.push(Invocation {
            kind: outcome.kind(),
            request_id: outcome.request_id(),
            attempt: outcome.attempt(),
            rates: ctx.rates(),
        });
    }
}
