//! Completion throughput measurement.
//!
//! Controllers notify the [`TelemetryService`] after every completion. The
//! service stamps each notification, keeps a two-tier sliding window and
//! publishes a [`RateSnapshot`] through atomics that any handler can read
//! without locking.
//!
//! Window tiers:
//! - `recent` holds completions at most 1s old (exactly 1.0s stays),
//! - `aging` holds completions older than 1s and at most 10s old (exactly
//!   10.0s stays).

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use volley_core::Clock;

/// Age limit of the 1s tier.
pub const RECENT_WINDOW: Duration = Duration::from_secs(1);

/// Age limit of the 10s tier.
pub const AGING_WINDOW: Duration = Duration::from_secs(10);

/// Throughput figures at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RateSnapshot {
    /// Completions per second since the run started.
    pub average: f64,
    /// Completions during the last second.
    pub last_second: usize,
    /// Completions during the last ten seconds.
    pub last_ten_seconds: usize,
    /// Completions since the run started.
    pub total: u64,
}

/// Two-tier sliding window over completion instants.
#[derive(Debug, Clone)]
pub struct RateWindow {
    started_at: Instant,
    total: u64,
    recent: VecDeque<Instant>,
    aging: VecDeque<Instant>,
}

impl RateWindow {
    /// Creates an empty window for a run that started at `started_at`.
    pub fn new(started_at: Instant) -> Self {
        Self { started_at, total: 0, recent: VecDeque::new(), aging: VecDeque::new() }
    }

    /// Records a completion at `at` and returns the refreshed figures.
    ///
    /// Completions must be recorded in time order.
    pub fn record(&mut self, at: Instant) -> RateSnapshot {
        self.total += 1;
        self.recent.push_back(at);
        self.observe(at)
    }

    /// Prunes the window as seen from `now` and returns the figures.
    pub fn observe(&mut self, now: Instant) -> RateSnapshot {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) <= RECENT_WINDOW {
                break;
            }
            self.recent.pop_front();
            self.aging.push_back(oldest);
        }
        while let Some(&oldest) = self.aging.front() {
            if now.saturating_duration_since(oldest) <= AGING_WINDOW {
                break;
            }
            self.aging.pop_front();
        }

        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let average = if elapsed > 0.0 { self.total as f64 / elapsed } else { 0.0 };

        RateSnapshot {
            average,
            last_second: self.recent.len(),
            last_ten_seconds: self.recent.len() + self.aging.len(),
            total: self.total,
        }
    }
}

/// Lock-free publication point for the latest snapshot.
#[derive(Debug, Default)]
pub struct RateGauge {
    average_bits: AtomicU64,
    last_second: AtomicUsize,
    last_ten_seconds: AtomicUsize,
    total: AtomicU64,
}

impl RateGauge {
    fn publish(&self, snapshot: &RateSnapshot) {
        self.average_bits.store(snapshot.average.to_bits(), Ordering::Release);
        self.last_second.store(snapshot.last_second, Ordering::Release);
        self.last_ten_seconds.store(snapshot.last_ten_seconds, Ordering::Release);
        self.total.store(snapshot.total, Ordering::Release);
    }

    /// Reads the latest published figures.
    ///
    /// Fields are published individually, so a reader racing an update may
    /// combine values from two adjacent snapshots.
    pub fn snapshot(&self) -> RateSnapshot {
        RateSnapshot {
            average: f64::from_bits(self.average_bits.load(Ordering::Acquire)),
            last_second: self.last_second.load(Ordering::Acquire),
            last_ten_seconds: self.last_ten_seconds.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
        }
    }
}

/// Handle controllers use to report completions and read rates.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    sender: mpsc::UnboundedSender<()>,
    gauge: Arc<RateGauge>,
}

impl TelemetryHandle {
    /// Reports one completion.
    pub fn notify(&self) {
        // The service only goes away after every controller has stopped.
        let _ = self.sender.send(());
    }

    /// Latest published figures.
    pub fn snapshot(&self) -> RateSnapshot {
        self.gauge.snapshot()
    }
}

/// Run-scoped task that owns the [`RateWindow`].
#[derive(Debug)]
pub struct TelemetryService {
    receiver: mpsc::UnboundedReceiver<()>,
    gauge: Arc<RateGauge>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
}

impl TelemetryService {
    /// Creates the service and the handle controllers report through.
    pub fn new(clock: Arc<dyn Clock>, refresh_interval: Duration) -> (TelemetryHandle, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let gauge = Arc::new(RateGauge::default());
        let handle = TelemetryHandle { sender, gauge: gauge.clone() };
        (handle, Self { receiver, gauge, clock, refresh_interval })
    }

    /// Processes notifications until cancelled and returns the final figures.
    ///
    /// Besides notifications, the window is re-pruned every refresh interval
    /// so rates decay while no completion arrives.
    pub async fn run(mut self, cancellation_token: CancellationToken) -> RateSnapshot {
        let mut window = RateWindow::new(self.clock.now());
        let mut latest = RateSnapshot::default();
        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(refresh_ms = self.refresh_interval.as_millis(), "telemetry starting");

        loop {
            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => break,
                notification = self.receiver.recv() => match notification {
                    Some(()) => latest = window.record(self.clock.now()),
                    None => break,
                },
                _ = refresh.tick() => latest = window.observe(self.clock.now()),
            }
            self.gauge.publish(&latest);
        }

        // Count notifications that raced the cancellation.
        while let Ok(()) = self.receiver.try_recv() {
            latest = window.record(self.clock.now());
        }
        latest = window.observe(self.clock.now());
        self.gauge.publish(&latest);

        debug!(total = latest.total, average = latest.average, "telemetry stopped");
        latest
    }
}
