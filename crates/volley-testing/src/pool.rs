//! Scripted request pool.
//!
//! [`MockPool`] completes requests after a fixed latency with a reply chosen
//! by a script, records every submission and can simulate a crash. A
//! [`MockPoolProbe`] keeps observing the pool after it has been moved into a
//! dispatcher.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use tracing::debug;
use volley_core::{ErrorResult, ExecutionError, Outcome, Request, Response};
use volley_dispatch::{
    completion_channel, CompletionFeed, CompletionSender, DispatchError, RequestPool, Result,
};

/// What a [`MockPool`] answers for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Complete with a response carrying this status.
    Respond(u16),
    /// Complete with this error.
    Fail(ExecutionError),
}

type Script = Arc<dyn Fn(&Request) -> MockReply + Send + Sync>;

#[derive(Debug, Default)]
struct ProbeState {
    submitted: Mutex<Vec<Request>>,
    setups: Mutex<Vec<(usize, usize)>>,
    teardowns: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Observer handle for a [`MockPool`].
#[derive(Debug, Clone, Default)]
pub struct MockPoolProbe {
    state: Arc<ProbeState>,
}

impl MockPoolProbe {
    /// Every request submitted so far, in submission order.
    pub fn submissions(&self) -> Vec<Request> {
        lock(&self.state.submitted).clone()
    }

    /// Number of submissions so far.
    pub fn submission_count(&self) -> usize {
        lock(&self.state.submitted).len()
    }

    /// `(pool_hint, max_connections)` of every setup call.
    pub fn setups(&self) -> Vec<(usize, usize)> {
        lock(&self.state.setups).clone()
    }

    /// Number of teardown calls.
    pub fn teardown_count(&self) -> usize {
        self.state.teardowns.load(Ordering::Acquire)
    }

    /// Requests currently executing.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of requests executing at once.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::Acquire)
    }
}

/// In-memory pool with scripted replies.
pub struct MockPool {
    name: String,
    group: Option<String>,
    latency: Duration,
    capacity_override: Option<usize>,
    baseline: usize,
    crash_after: Option<usize>,
    fail_setup: bool,
    panic_on_submit: bool,
    hang_on_teardown: bool,
    script: Script,
    probe: MockPoolProbe,
    completions: Option<CompletionSender>,
    capacity: usize,
}

impl MockPool {
    /// Creates a pool answering `200` after 10ms.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            latency: Duration::from_millis(10),
            capacity_override: None,
            baseline: 0,
            crash_after: None,
            fail_setup: false,
            panic_on_submit: false,
            hang_on_teardown: false,
            script: Arc::new(|_| MockReply::Respond(200)),
            probe: MockPoolProbe::default(),
            completions: None,
            capacity: 0,
        }
    }

    /// Puts the pool in `group`.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets how long each request takes.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fixes the connection budget instead of taking the dispatcher's.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity_override = Some(capacity);
        self
    }

    /// Reports `outstanding` extra tasks that never complete.
    #[must_use]
    pub fn with_outstanding(mut self, outstanding: usize) -> Self {
        self.baseline = outstanding;
        self
    }

    /// Fails every request with `error`.
    #[must_use]
    pub fn failing_with(self, error: ExecutionError) -> Self {
        self.with_script(move |_| MockReply::Fail(error.clone()))
    }

    /// Chooses each reply with `script`.
    #[must_use]
    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&Request) -> MockReply + Send + Sync + 'static,
    {
        self.script = Arc::new(script);
        self
    }

    /// Completes the first `completed` submissions, then swallows the next
    /// one and closes the completion feed.
    #[must_use]
    pub fn crash_after(mut self, completed: usize) -> Self {
        self.crash_after = Some(completed);
        self
    }

    /// Makes setup fail with a pool error.
    #[must_use]
    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    /// Panics inside `submit`, taking the owning controller down with it.
    #[must_use]
    pub fn panicking_on_submit(mut self) -> Self {
        self.panic_on_submit = true;
        self
    }

    /// Never returns from `teardown`, so the owning controller cannot stop.
    #[must_use]
    pub fn hanging_on_teardown(mut self) -> Self {
        self.hang_on_teardown = true;
        self
    }

    /// Observer handle that outlives moving the pool.
    pub fn probe(&self) -> MockPoolProbe {
        self.probe.clone()
    }

    /// Boxes the pool for [`Dispatcher::new`](volley_dispatch::Dispatcher::new).
    pub fn boxed(self) -> Box<dyn RequestPool> {
        Box::new(self)
    }
}

impl fmt::Debug for MockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPool")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("latency", &self.latency)
            .field("capacity", &self.capacity)
            .field("baseline", &self.baseline)
            .field("in_flight", &self.probe.in_flight())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl RequestPool for MockPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    async fn setup(&mut self, pool_hint: usize, max_connections: usize) -> Result<CompletionFeed> {
        lock(&self.probe.state.setups).push((pool_hint, max_connections));
        if self.fail_setup {
            return Err(DispatchError::pool(format!("mock pool {} refused to start", self.name)));
        }
        let (sender, feed) = completion_channel();
        self.completions = Some(sender);
        self.capacity = self.capacity_override.unwrap_or(max_connections);
        Ok(feed)
    }

    fn remaining_tasks(&self) -> usize {
        self.baseline + self.probe.in_flight()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn submit(&mut self, request: Request) -> Result<()> {
        let Some(completions) = self.completions.clone() else {
            return Err(DispatchError::pool(format!("mock pool {} is not running", self.name)));
        };
        if !self.has_capacity() {
            return Err(DispatchError::capacity(&self.name, self.capacity));
        }
        if self.panic_on_submit {
            panic!("mock pool {} panicked on submit", self.name);
        }

        let state = self.probe.state.clone();
        let in_flight = state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        state.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        let submitted = {
            let mut submitted = lock(&state.submitted);
            submitted.push(request.clone());
            submitted.len()
        };

        if self.crash_after.is_some_and(|completed| submitted > completed) {
            debug!(pool = %self.name, request_id = %request.id, "mock pool crashing");
            self.completions = None;
            return Ok(());
        }

        let reply = (self.script)(&request);
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let outcome = match reply {
                MockReply::Respond(status) => Outcome::Response(Response {
                    request_id: request.id,
                    status,
                    headers: Default::default(),
                    body: Bytes::from_static(b"ok"),
                    duration: latency,
                    attempt: request.attempt,
                }),
                MockReply::Fail(error) => Outcome::Error(ErrorResult::new(&request, error, latency)),
            };
            state.in_flight.fetch_sub(1, Ordering::AcqRel);
            let _ = completions.send(outcome);
        });
        Ok(())
    }

    async fn teardown(&mut self) {
        self.completions = None;
        self.probe.state.teardowns.fetch_add(1, Ordering::AcqRel);
        if self.hang_on_teardown {
            std::future::pending::<()>().await;
        }
    }
}
