//! Public entry point of the dispatch engine.
//!
//! A [`Dispatcher`] owns the pools, the pending queue, the handler registry
//! and the shared store. [`Dispatcher::run`] drains everything staged so far:
//!
//! ```text
//! stage ──▶ WorkQueue ──▶ Controller (one per group) ──▶ RequestPool
//!                              ▲                              │
//!               TicketGenerator┘        completion feed ◀─────┘
//!                                             │
//!                         handlers ◀── store lock, telemetry
//! ```
//!
//! A run ends when every staged item has been dispatched to its handlers
//! (the drain barrier), when a handler calls the exit hook, or when no
//! controller is left to make progress.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use volley_core::{Clock, EventKind, Outcome, RealClock, Request, RequestId};

use crate::{
    callback::{CallbackRegistry, Context, FnHandler, Handler},
    controller::{Controller, ControllerExit, ControllerStatus, RunShared, RunStats},
    controller_set::ControllerSet,
    error::{DispatchError, Result},
    pool::RequestPool,
    queue::WorkQueue,
    retry::{RetryLimit, DEFAULT_MAX_RETRIES},
    store::SharedStore,
    telemetry::{RateSnapshot, TelemetryService},
    ticket::{emission_period, ticket_channel, TicketGenerator, MAX_PERIOD},
};

/// Configuration for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Global admission rate in requests per second.
    pub rate: f64,

    /// How many distinct connection pools a pool's transport may keep.
    #[serde(default = "default_pool_hint")]
    pub pool_hint: usize,

    /// Per-pool connection budget; defaults to `ceil(rate)`.
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Allocate the shared store.
    #[serde(default = "default_enabled")]
    pub use_store: bool,

    /// Run the throughput telemetry service.
    #[serde(default = "default_enabled")]
    pub use_rps: bool,

    /// Retries a handler may request per work item.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Longest a controller waits when it has nothing to do.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// How often telemetry re-prunes its window without notifications.
    #[serde(default = "default_telemetry_refresh")]
    pub telemetry_refresh: Duration,

    /// Maximum time to wait for controllers after the run ended.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_pool_hint() -> usize {
    crate::DEFAULT_POOL_HINT
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_telemetry_refresh() -> Duration {
    Duration::from_millis(250)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl DispatcherConfig {
    /// Creates a configuration for `rate` requests per second with defaults
    /// elsewhere.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            pool_hint: default_pool_hint(),
            max_connections: None,
            use_store: true,
            use_rps: true,
            max_retries: default_max_retries(),
            poll_interval: default_poll_interval(),
            telemetry_refresh: default_telemetry_refresh(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    /// Per-pool connection budget handed to pools at setup.
    pub fn connection_budget(&self) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let from_rate = self.rate.ceil() as usize;
        self.max_connections.unwrap_or(from_rate).max(1)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] describing the first invalid
    /// setting.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(DispatchError::configuration(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if emission_period(self.rate).is_none() {
            return Err(DispatchError::configuration(format!(
                "rate {} gives a ticket period outside 1ns..={}s",
                self.rate,
                MAX_PERIOD.as_secs()
            )));
        }
        if self.pool_hint == 0 {
            return Err(DispatchError::configuration("pool_hint must be greater than 0"));
        }
        if self.max_connections == Some(0) {
            return Err(DispatchError::configuration("max_connections must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(DispatchError::configuration("poll_interval must be greater than 0"));
        }
        if self.telemetry_refresh.is_zero() {
            return Err(DispatchError::configuration("telemetry_refresh must be greater than 0"));
        }
        Ok(())
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every staged item was dispatched.
    Drained,
    /// A handler called the exit hook.
    Exited,
    /// Every controller stopped before the queue drained.
    Stalled,
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Why the run ended.
    pub outcome: RunOutcome,
    /// Items pending when the run started.
    pub staged: usize,
    /// Submissions to pools, retries included.
    pub admitted: u64,
    /// Outcomes dispatched to response handlers.
    pub responses: u64,
    /// Outcomes dispatched to error handlers.
    pub errors: u64,
    /// Items re-staged by the retry hook.
    pub retries: u64,
    /// Items dropped without being dispatched.
    pub abandoned: usize,
    /// Tickets emitted by the generator.
    pub tickets_emitted: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Final telemetry figures, if telemetry was enabled.
    pub rates: Option<RateSnapshot>,
}

impl RunReport {
    /// Outcomes dispatched to any handler.
    pub fn dispatched(&self) -> u64 {
        self.responses + self.errors
    }
}

/// Cloneable handle for staging work from other tasks.
#[derive(Debug, Clone)]
pub struct Stager {
    queue: Arc<WorkQueue>,
}

impl Stager {
    /// Stages `request` for the next run.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] while a run is in progress.
    pub fn stage(&self, request: Request) -> Result<RequestId> {
        let id = request.id;
        self.queue.stage(request)?;
        Ok(id)
    }
}

/// Rate-limited dispatcher over a set of request pools.
pub struct Dispatcher {
    config: DispatcherConfig,
    pools: Vec<Box<dyn RequestPool>>,
    queue: Arc<WorkQueue>,
    registry: CallbackRegistry,
    store: Option<SharedStore>,
    clock: Arc<dyn Clock>,
    last_rates: Option<RateSnapshot>,
}

impl Dispatcher {
    /// Creates a dispatcher over `pools`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if the configuration is
    /// invalid or `pools` is empty.
    pub fn new(config: DispatcherConfig, pools: Vec<Box<dyn RequestPool>>) -> Result<Self> {
        Self::with_clock(config, pools, Arc::new(RealClock::new()))
    }

    /// Creates a dispatcher reading time from `clock`.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::new`].
    pub fn with_clock(
        config: DispatcherConfig,
        pools: Vec<Box<dyn RequestPool>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        if pools.is_empty() {
            return Err(DispatchError::configuration("at least one request pool is required"));
        }

        let store = config.use_store.then(SharedStore::new);
        Ok(Self {
            config,
            pools,
            queue: Arc::new(WorkQueue::new()),
            registry: CallbackRegistry::new(),
            store,
            clock,
            last_rates: None,
        })
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Number of pools available for the next run.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Items waiting for the next run.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stages `request` for the next run.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] while a run is in progress.
    pub fn stage(&self, request: Request) -> Result<RequestId> {
        self.stager().stage(request)
    }

    /// Stages every request in `requests` and returns how many were staged.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] while a run is in progress.
    pub fn stage_all<I>(&self, requests: I) -> Result<usize>
    where
        I: IntoIterator<Item = Request>,
    {
        let mut staged = 0;
        for request in requests {
            self.queue.stage(request)?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Returns a staging handle that can be moved to other tasks.
    pub fn stager(&self) -> Stager {
        Stager { queue: self.queue.clone() }
    }

    /// Registers `handler` for outcomes of `kind`.
    pub fn on<H>(&mut self, kind: EventKind, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.registry.register(kind, Arc::new(handler));
        self
    }

    /// Registers a synchronous closure for outcomes of `kind`.
    pub fn on_fn<F>(&mut self, kind: EventKind, f: F) -> &mut Self
    where
        F: Fn(&Outcome, &mut Context<'_>) + Send + Sync + 'static,
    {
        self.on(kind, FnHandler::new(f))
    }

    /// Handle to the shared store.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub fn store(&self) -> Result<SharedStore> {
        self.store.clone().ok_or_else(|| DispatchError::capability("shared store"))
    }

    /// Reads a value from the shared store.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.store()?.get(key).await)
    }

    /// Writes a value to the shared store and returns the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capability`] when the store is disabled.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<Option<Value>> {
        Ok(self.store()?.set(key, value).await)
    }

    /// Final telemetry figures of the most recent run.
    ///
    /// `None` before the first run and whenever telemetry is disabled.
    pub fn rates(&self) -> Option<RateSnapshot> {
        self.last_rates
    }

    /// Dispatches every staged item and returns once the run has ended.
    ///
    /// Staging is refused while the run is in progress. Pools are handed
    /// back at the end, so the dispatcher can stage more work and run again.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] when no handler is
    /// registered or no pool is left, the setup error of a pool that failed
    /// to set up, [`DispatchError::ControllerPanic`] when a controller task
    /// panicked (its pools are dropped) and
    /// [`DispatchError::ShutdownTimeout`] when controllers did not stop in
    /// time.
    pub async fn run(&mut self) -> Result<RunReport> {
        if self.registry.is_empty() {
            return Err(DispatchError::configuration(
                "register at least one handler before running",
            ));
        }
        if self.pools.is_empty() {
            return Err(DispatchError::configuration("no request pools left to run with"));
        }

        let started_at = self.clock.now();
        self.queue.close();
        let staged = self.queue.outstanding();
        let abort = CancellationToken::new();
        let stats = Arc::new(RunStats::default());

        let telemetry_token = CancellationToken::new();
        let (telemetry, telemetry_task) = if self.config.use_rps {
            let (handle, service) =
                TelemetryService::new(self.clock.clone(), self.config.telemetry_refresh);
            (Some(handle), Some(tokio::spawn(service.run(telemetry_token.clone()))))
        } else {
            (None, None)
        };

        let shared = RunShared {
            queue: self.queue.clone(),
            registry: Arc::new(self.registry.clone()),
            store: self.store.clone(),
            telemetry,
            retry_limit: RetryLimit::new(self.config.max_retries),
            abort: abort.clone(),
            stats: stats.clone(),
            clock: self.clock.clone(),
            poll_interval: self.config.poll_interval,
            pool_hint: self.config.pool_hint,
            max_connections: self.config.connection_budget(),
        };

        let mut controllers = ControllerSet::new(abort.clone());
        let mut senders = Vec::new();
        for (controller_id, pools) in self.take_partitions().into_iter().enumerate() {
            let (sender, receiver) = ticket_channel();
            senders.push(sender);
            controllers.spawn(Controller::new(controller_id, pools, receiver, shared.clone()));
        }
        drop(shared);

        info!(
            rate = self.config.rate,
            staged,
            controllers = senders.len(),
            use_store = self.config.use_store,
            use_rps = self.config.use_rps,
            "run starting"
        );

        let ticket_token = CancellationToken::new();
        let generator =
            TicketGenerator::new(self.config.rate, senders, self.clock.clone(), ticket_token.clone());
        let ticket_task = tokio::spawn(generator.run());

        let mut supervision = Supervision::default();
        let outcome = loop {
            tokio::select! {
                biased;
                () = self.queue.wait_drained() => break RunOutcome::Drained,
                () = abort.cancelled() => break RunOutcome::Exited,
                exit = controllers.join_next(), if !controllers.is_empty() => {
                    if let Some(exit) = exit {
                        supervision.record(exit, &self.queue, &abort);
                    }
                    if controllers.is_empty() {
                        break if self.queue.outstanding() == 0 {
                            RunOutcome::Drained
                        } else {
                            RunOutcome::Stalled
                        };
                    }
                },
            }
        };

        ticket_token.cancel();
        let tickets_emitted = ticket_task.await.unwrap_or_else(|join_error| {
            warn!(error = %join_error, "ticket generator did not complete");
            0
        });

        match controllers.shutdown(self.config.shutdown_timeout).await {
            Ok(exits) => {
                for exit in exits {
                    supervision.record(exit, &self.queue, &abort);
                }
            },
            Err(error) => supervision.fail(error),
        }

        supervision.abandoned += self.queue.discard_pending();
        let unaccounted = self.queue.outstanding();
        if unaccounted > 0 {
            warn!(unaccounted, "items lost with their controllers");
            self.queue.acknowledge(unaccounted);
            supervision.abandoned += unaccounted;
        }

        telemetry_token.cancel();
        let rates = match telemetry_task {
            Some(task) => task.await.ok(),
            None => None,
        };
        self.last_rates = rates;

        self.pools = supervision.reclaim_pools();
        self.queue.reopen();

        let report = RunReport {
            outcome,
            staged,
            admitted: stats.admitted(),
            responses: stats.responses(),
            errors: stats.errors(),
            retries: stats.retries(),
            abandoned: supervision.abandoned,
            tickets_emitted,
            elapsed: self.clock.now().saturating_duration_since(started_at),
            rates,
        };

        info!(
            outcome = ?report.outcome,
            responses = report.responses,
            errors = report.errors,
            retries = report.retries,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis(),
            "run finished"
        );

        match supervision.failure {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    fn take_partitions(&mut self) -> Vec<Vec<(usize, Box<dyn RequestPool>)>> {
        let layout = partition_indices(self.pools.iter().map(|pool| pool.group()));
        let mut slots: Vec<Option<Box<dyn RequestPool>>> =
            std::mem::take(&mut self.pools).into_iter().map(Some).collect();

        let mut partitions = Vec::with_capacity(layout.len());
        for indices in layout {
            let mut members = Vec::with_capacity(indices.len());
            for index in indices {
                if let Some(pool) = slots[index].take() {
                    members.push((index, pool));
                }
            }
            partitions.push(members);
        }
        partitions
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .field("pending", &self.queue.len())
            .field("registry", &self.registry)
            .field("store_enabled", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Supervision {
    pools: Vec<(usize, Box<dyn RequestPool>)>,
    abandoned: usize,
    failure: Option<DispatchError>,
}

impl Supervision {
    fn record(&mut self, exit: ControllerExit, queue: &WorkQueue, abort: &CancellationToken) {
        match exit.status {
            ControllerStatus::Finished => {},
            ControllerStatus::Failed(error) => {
                abort.cancel();
                self.fail(error);
            },
            ControllerStatus::Panicked(message) => {
                error!(
                    controller_id = exit.controller_id,
                    lost_items = exit.held,
                    "controller lost, its in-flight items are abandoned"
                );
                queue.acknowledge(exit.held);
                self.abandoned += exit.held;
                self.fail(DispatchError::controller_panic(exit.controller_id, message));
            },
        }
        self.pools.extend(exit.pools);
    }

    fn fail(&mut self, error: DispatchError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn reclaim_pools(&mut self) -> Vec<Box<dyn RequestPool>> {
        let mut pools = std::mem::take(&mut self.pools);
        pools.sort_by_key(|(index, _)| *index);
        pools.into_iter().map(|(_, pool)| pool).collect()
    }
}

/// Groups pool indices into controller partitions.
///
/// Ungrouped pools get a partition each; pools sharing a group id share one.
/// Partitions are ordered by their first member's declaration index.
fn partition_indices<'a, I>(groups: I) -> Vec<Vec<usize>>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut partitions: Vec<(Option<&'a str>, Vec<usize>)> = Vec::new();
    for (index, group) in groups.into_iter().enumerate() {
        if let Some(name) = group {
            if let Some((_, members)) =
                partitions.iter_mut().find(|(existing, _)| *existing == Some(name))
            {
                members.push(index);
                continue;
            }
        }
        partitions.push((group, vec![index]));
    }
    partitions.into_iter().map(|(_, members)| members).collect()
}
