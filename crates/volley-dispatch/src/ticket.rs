//! Global pacing through admission tickets.
//!
//! A single [`TicketGenerator`] emits at most one ticket per `1 / rate`
//! seconds and broadcasts it to every controller. A controller may admit one
//! request per ticket it manages to [`claim`](Ticket::claim). Claiming is a
//! compare-and-swap on state shared by every copy of the broadcast, so each
//! emission admits at most one request across all controllers and the
//! aggregate admission rate never exceeds `rate`.
//!
//! Each controller's ticket channel holds a single slot. A ticket the
//! controller has not looked at yet is replaced by the next emission.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use volley_core::Clock;

/// Permission to admit one request.
#[derive(Debug, Clone)]
pub struct Ticket {
    sequence: u64,
    claimed: Arc<AtomicBool>,
}

impl Ticket {
    fn new(sequence: u64) -> Self {
        Self { sequence, claimed: Arc::new(AtomicBool::new(false)) }
    }

    /// Position of this ticket in the emission order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Claims the ticket. Returns `true` for exactly one caller across all
    /// copies of the broadcast.
    pub fn claim(&self) -> bool {
        self.claimed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Whether some controller already claimed this ticket.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Sending half of a controller's ticket slot.
pub type TicketSender = watch::Sender<Option<Ticket>>;

/// Receiving half of a controller's ticket slot.
pub type TicketReceiver = watch::Receiver<Option<Ticket>>;

/// Creates an empty single-slot ticket channel.
pub fn ticket_channel() -> (TicketSender, TicketReceiver) {
    watch::channel(None)
}

/// Longest accepted spacing between two tickets.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Spacing between two tickets for `rate` tickets per second.
///
/// Returns `None` when the period is not a positive [`Duration`] of at most
/// [`MAX_PERIOD`].
pub fn emission_period(rate: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / rate)
        .ok()
        .filter(|period| !period.is_zero() && *period <= MAX_PERIOD)
}

/// Emits tickets at the configured rate until cancelled.
#[derive(Debug)]
pub struct TicketGenerator {
    period: Duration,
    senders: Vec<TicketSender>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl TicketGenerator {
    /// Creates a generator broadcasting to `senders`.
    ///
    /// Rates without an [`emission_period`] are clamped to [`MAX_PERIOD`];
    /// the dispatcher rejects them before a run starts.
    pub fn new(
        rate: f64,
        senders: Vec<TicketSender>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            period: emission_period(rate).unwrap_or(MAX_PERIOD),
            senders,
            clock,
            cancellation_token,
        }
    }

    /// Minimum spacing between two emissions.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs the emission loop and returns the number of tickets emitted.
    ///
    /// The first ticket goes out immediately. Afterwards a ticket is emitted
    /// once strictly more than one period has passed since the previous one.
    /// Between emissions the loop sleeps until the next one is due or the
    /// token is cancelled, and nothing is sent after cancellation.
    pub async fn run(self) -> u64 {
        info!(
            controllers = self.senders.len(),
            period_ms = self.period.as_secs_f64() * 1000.0,
            "ticket generator starting"
        );

        let mut last_emitted: Option<Instant> = None;
        let mut emitted = 0u64;

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let now = self.clock.now();
            let wait = match last_emitted {
                None => Duration::ZERO,
                Some(last) => {
                    let since = now.saturating_duration_since(last);
                    if since > self.period {
                        Duration::ZERO
                    } else {
                        // Strictly past the period, so the next pass emits.
                        self.period - since + Duration::from_nanos(1)
                    }
                },
            };

            if wait.is_zero() {
                self.broadcast(Ticket::new(emitted));
                last_emitted = Some(now);
                emitted += 1;
                continue;
            }

            tokio::select! {
                () = self.clock.sleep(wait) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(emitted, "ticket generator stopped");
        emitted
    }

    fn broadcast(&self, ticket: Ticket) {
        debug!(sequence = ticket.sequence(), "emitting ticket");
        for sender in &self.senders {
            sender.send_replace(Some(ticket.clone()));
        }
    }
}
