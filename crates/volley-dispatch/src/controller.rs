//! Per-group admission and completion loop.
//!
//! A controller owns one or more pools for the duration of a run. Every
//! iteration it tries to turn a ticket into one admitted request, reaps the
//! completions its pools reported, runs the handlers for them and, if
//! nothing happened, waits for the next ticket, completion or poll tick.
//! It stops once it has nothing in flight and the pending queue is empty, or
//! once the run was aborted and its in-flight requests have completed.

use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{
    future,
    stream::{self, BoxStream, SelectAll},
    FutureExt, StreamExt,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use volley_core::{Clock, ErrorResult, EventKind, ExecutionError, Outcome, Request, RequestId};

use crate::{
    callback::{CallbackRegistry, Context},
    error::{DispatchError, Result},
    pool::{least_loaded, RequestPool},
    queue::WorkQueue,
    retry::RetryLimit,
    store::SharedStore,
    telemetry::TelemetryHandle,
    ticket::{Ticket, TicketReceiver},
};

/// Counters for one run, shared by every controller.
#[derive(Debug, Default)]
pub struct RunStats {
    admitted: AtomicU64,
    responses: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
}

impl RunStats {
    /// Requests handed to a pool, retries included.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Acquire)
    }

    /// Outcomes dispatched to response handlers.
    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Acquire)
    }

    /// Outcomes dispatched to error handlers.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    /// Items re-staged through the retry hook.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    fn record_outcome(&self, kind: EventKind) {
        let counter = match kind {
            EventKind::Response => &self.responses,
            EventKind::Error => &self.errors,
        };
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Everything a controller shares with the rest of the run.
#[derive(Debug, Clone)]
pub(crate) struct RunShared {
    pub queue: Arc<WorkQueue>,
    pub registry: Arc<CallbackRegistry>,
    pub store: Option<SharedStore>,
    pub telemetry: Option<TelemetryHandle>,
    pub retry_limit: RetryLimit,
    pub abort: CancellationToken,
    pub stats: Arc<RunStats>,
    pub clock: Arc<dyn Clock>,
    pub poll_interval: Duration,
    pub pool_hint: usize,
    pub max_connections: usize,
}

/// How a controller ended.
#[derive(Debug)]
pub enum ControllerStatus {
    /// Ran until its exit condition.
    Finished,
    /// A pool failed to set up.
    Failed(DispatchError),
    /// The controller task panicked; its pools are gone.
    Panicked(String),
}

/// What a controller hands back when it stops.
#[derive(Debug)]
pub struct ControllerExit {
    /// Controller identifier.
    pub controller_id: usize,
    /// Pools with their declaration index, ready for the next run.
    pub pools: Vec<(usize, Box<dyn RequestPool>)>,
    /// Items the controller had dequeued but not finished.
    pub held: usize,
    /// How the controller ended.
    pub status: ControllerStatus,
}

struct OwnedPool {
    index: usize,
    pool: Box<dyn RequestPool>,
    alive: bool,
}

struct InFlight {
    position: usize,
    request: Request,
    submitted_at: Instant,
}

enum FeedEvent {
    Completed(Outcome),
    Closed(usize),
}

enum Wake {
    Ticket,
    TicketsClosed,
    Completion(FeedEvent),
    Aborted,
    Idle,
}

/// Drives the pools of one group.
pub struct Controller {
    id: usize,
    pools: Vec<OwnedPool>,
    feeds: SelectAll<BoxStream<'static, FeedEvent>>,
    tickets: TicketReceiver,
    tickets_open: bool,
    held_ticket: Option<Ticket>,
    in_flight: HashMap<RequestId, Vec<InFlight>>,
    held: Arc<AtomicUsize>,
    shared: RunShared,
}

impl Controller {
    pub(crate) fn new(
        id: usize,
        pools: Vec<(usize, Box<dyn RequestPool>)>,
        tickets: TicketReceiver,
        shared: RunShared,
    ) -> Self {
        Self {
            id,
            pools: pools
                .into_iter()
                .map(|(index, pool)| OwnedPool { index, pool, alive: true })
                .collect(),
            feeds: SelectAll::new(),
            tickets,
            tickets_open: true,
            held_ticket: None,
            in_flight: HashMap::new(),
            held: Arc::new(AtomicUsize::new(0)),
            shared,
        }
    }

    /// Controller identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn held_counter(&self) -> Arc<AtomicUsize> {
        self.held.clone()
    }

    /// Sets up the pools, runs the loop and hands the pools back.
    pub async fn run(mut self) -> ControllerExit {
        let status = match self.setup().await {
            Ok(()) => {
                self.drive().await;
                ControllerStatus::Finished
            },
            Err(error) => {
                error!(controller_id = self.id, error = %error, "pool setup failed");
                ControllerStatus::Failed(error)
            },
        };

        for owned in &mut self.pools {
            owned.pool.teardown().await;
        }

        ControllerExit {
            controller_id: self.id,
            held: self.held.load(Ordering::Acquire),
            pools: self.pools.into_iter().map(|owned| (owned.index, owned.pool)).collect(),
            status,
        }
    }

    async fn setup(&mut self) -> Result<()> {
        for (position, owned) in self.pools.iter_mut().enumerate() {
            let feed = owned.pool.setup(self.shared.pool_hint, self.shared.max_connections).await?;
            let events = UnboundedReceiverStream::new(feed)
                .map(FeedEvent::Completed)
                .chain(stream::once(future::ready(FeedEvent::Closed(position))))
                .boxed();
            self.feeds.push(events);
        }
        Ok(())
    }

    async fn drive(&mut self) {
        info!(
            controller_id = self.id,
            pools = self.pools.len(),
            capacity = self.pools.iter().map(|owned| owned.pool.capacity()).sum::<usize>(),
            "controller starting"
        );

        loop {
            let admitted = self.admit();
            let reaped = self.reap().await;
            if self.should_exit() {
                break;
            }
            if !admitted && reaped == 0 {
                self.wait().await;
            }
        }

        info!(controller_id = self.id, "controller stopped");
    }

    fn should_exit(&self) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }
        self.shared.abort.is_cancelled()
            || self.shared.queue.is_empty()
            || !self.pools.iter().any(|owned| owned.alive)
    }

    fn refresh_ticket(&mut self) {
        if !self.tickets_open {
            return;
        }
        match self.tickets.has_changed() {
            Ok(true) => self.held_ticket = self.tickets.borrow_and_update().clone(),
            Ok(false) => {},
            Err(_) => self.tickets_open = false,
        }
    }

    fn admit(&mut self) -> bool {
        if self.shared.abort.is_cancelled() {
            return false;
        }
        self.refresh_ticket();

        let Some(ticket) = self.held_ticket.take() else {
            return false;
        };
        if ticket.is_claimed() || self.shared.queue.is_empty() {
            return false;
        }

        let loads = self
            .pools
            .iter()
            .map(|owned| (owned.pool.remaining_tasks(), owned.alive && owned.pool.has_capacity()));
        let Some(position) = least_loaded(loads) else {
            self.held_ticket = Some(ticket);
            return false;
        };

        if !ticket.claim() {
            return false;
        }
        let Some(request) = self.shared.queue.try_pop() else {
            debug!(controller_id = self.id, "pending queue emptied before pop, ticket wasted");
            return false;
        };
        self.held.fetch_add(1, Ordering::AcqRel);
        self.submit(position, request)
    }

    fn submit(&mut self, position: usize, request: Request) -> bool {
        let owned = &mut self.pools[position];
        match owned.pool.submit(request.clone()) {
            Ok(()) => {
                debug!(
                    controller_id = self.id,
                    pool = owned.pool.name(),
                    request_id = %request.id,
                    attempt = request.attempt,
                    "request admitted"
                );
                self.shared.stats.admitted.fetch_add(1, Ordering::AcqRel);
                let submitted_at = self.shared.clock.now();
                self.in_flight.entry(request.id).or_default().push(InFlight {
                    position,
                    request,
                    submitted_at,
                });
                true
            },
            Err(error) => {
                warn!(
                    controller_id = self.id,
                    pool = owned.pool.name(),
                    error = %error,
                    "pool refused submission, request re-staged"
                );
                self.shared.queue.requeue(request);
                self.held.fetch_sub(1, Ordering::AcqRel);
                false
            },
        }
    }

    async fn reap(&mut self) -> usize {
        let limit = self.pools.len().max(1);
        let mut reaped = 0;
        while reaped < limit {
            let Some(Some(event)) = self.feeds.next().now_or_never() else {
                break;
            };
            self.handle_event(event).await;
            reaped += 1;
        }
        reaped
    }

    async fn wait(&mut self) {
        let abort_pending = !self.shared.abort.is_cancelled();
        let wake = tokio::select! {
            changed = self.tickets.changed(), if self.tickets_open => {
                if changed.is_ok() { Wake::Ticket } else { Wake::TicketsClosed }
            },
            Some(event) = self.feeds.next() => Wake::Completion(event),
            () = self.shared.abort.cancelled(), if abort_pending => Wake::Aborted,
            () = self.shared.clock.sleep(self.shared.poll_interval) => Wake::Idle,
        };

        match wake {
            Wake::Ticket => self.held_ticket = self.tickets.borrow_and_update().clone(),
            Wake::TicketsClosed => self.tickets_open = false,
            Wake::Completion(event) => self.handle_event(event).await,
            Wake::Aborted | Wake::Idle => {},
        }
    }

    async fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Completed(outcome) => self.complete(outcome).await,
            FeedEvent::Closed(position) => self.pool_lost(position).await,
        }
    }

    /// Takes the in-flight entry an outcome belongs to. Items staged with the
    /// same identifier share a slot; the entry with the matching attempt wins,
    /// otherwise the oldest one.
    fn take_in_flight(&mut self, id: RequestId, attempt: u32) -> Option<InFlight> {
        let entries = self.in_flight.get_mut(&id)?;
        let index =
            entries.iter().position(|entry| entry.request.attempt == attempt).unwrap_or(0);
        let entry = entries.remove(index);
        if entries.is_empty() {
            self.in_flight.remove(&id);
        }
        Some(entry)
    }

    async fn complete(&mut self, outcome: Outcome) {
        let Some(entry) = self.take_in_flight(outcome.request_id(), outcome.attempt()) else {
            warn!(
                controller_id = self.id,
                request_id = %outcome.request_id(),
                "completion for unknown request ignored"
            );
            return;
        };
        self.finish(entry, outcome).await;
    }

    async fn finish(&mut self, entry: InFlight, outcome: Outcome) {
        if let Some(telemetry) = &self.shared.telemetry {
            telemetry.notify();
        }
        self.shared.stats.record_outcome(outcome.kind());

        let retry = dispatch_outcome(&self.shared, self.id, &outcome, &entry.request).await;
        if retry {
            self.shared.stats.retries.fetch_add(1, Ordering::AcqRel);
            self.shared.queue.requeue(entry.request.next_attempt());
        } else {
            self.shared.queue.acknowledge(1);
        }
        self.held.fetch_sub(1, Ordering::AcqRel);
    }

    async fn pool_lost(&mut self, position: usize) {
        let owned = &mut self.pools[position];
        owned.alive = false;
        let name = owned.pool.name().to_string();

        let mut lost = Vec::new();
        self.in_flight.retain(|_, entries| {
            let (gone, kept): (Vec<InFlight>, Vec<InFlight>) =
                entries.drain(..).partition(|entry| entry.position == position);
            lost.extend(gone);
            *entries = kept;
            !entries.is_empty()
        });
        if lost.is_empty() {
            warn!(controller_id = self.id, pool = %name, "pool completion feed closed");
            return;
        }
        error!(
            controller_id = self.id,
            pool = %name,
            lost = lost.len(),
            "pool completion feed closed with requests in flight"
        );

        let now = self.shared.clock.now();
        for entry in lost {
            let outcome = Outcome::Error(ErrorResult::new(
                &entry.request,
                ExecutionError::pool_lost(&name),
                now.saturating_duration_since(entry.submitted_at),
            ));
            self.finish(entry, outcome).await;
        }
    }
}

/// Runs every handler registered for the outcome's kind while holding the
/// store lock, and reports whether any of them asked for a retry.
async fn dispatch_outcome(
    shared: &RunShared,
    controller_id: usize,
    outcome: &Outcome,
    request: &Request,
) -> bool {
    let handlers = shared.registry.handlers_for(outcome.kind());
    if handlers.is_empty() {
        return false;
    }

    let rates = shared.telemetry.as_ref().map(TelemetryHandle::snapshot);
    let mut store = match &shared.store {
        Some(store) => Some(store.lock().await),
        None => None,
    };

    let mut retry = false;
    for (position, handler) in handlers.iter().enumerate() {
        let mut ctx =
            Context::new(request, rates, store.as_deref_mut(), shared.retry_limit, &shared.abort);
        let result = AssertUnwindSafe(handler.handle(outcome, &mut ctx)).catch_unwind().await;
        retry |= ctx.retry_requested();
        if let Err(panic) = result {
            error!(
                controller_id,
                request_id = %request.id,
                kind = %outcome.kind(),
                handler = position,
                panic = %panic_message(&*panic),
                "handler panicked"
            );
        }
    }
    retry
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
