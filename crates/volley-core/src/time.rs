//! Clock abstraction for pacing and rate measurement.
//!
//! The ticket generator and the telemetry window read time through
//! [`Clock`] so tests can drive them with a [`TestClock`] instead of waiting
//! on the wall clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Source of monotonic time and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`; a test clock may
    /// advance virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by [`Instant::now`] and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for deterministic tests.
///
/// Time only moves through [`TestClock::advance`] or [`Clock::sleep`], which
/// advances by the requested duration and yields once. Clones share the same
/// timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock positioned at the current instant.
    pub fn new() -> Self {
        Self { elapsed_ns: Arc::new(AtomicU64::new(0)), base_instant: Instant::now() }
    }

    /// Advances the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        let duration_ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(duration_ns, Ordering::AcqRel);
    }

    /// Returns elapsed virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Returns the instant `offset` after the clock's origin.
    ///
    /// Handy for feeding pre-computed timestamps into time-based state.
    pub fn at(&self, offset: Duration) -> Instant {
        self.base_instant + offset
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
