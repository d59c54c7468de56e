//! Pending work queue with completion accounting.
//!
//! Staged requests sit in a multi-producer multi-consumer channel that every
//! controller pops from without blocking. Next to it, an outstanding counter
//! tracks items that were staged but whose handlers have not finished yet.
//! The counter reaching zero is the drain barrier the dispatcher waits on.
//! Retries put an item back into the channel without touching the counter,
//! so every staged item is accounted for exactly once.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::Notify;
use volley_core::Request;

use crate::error::{DispatchError, Result};

/// Pending requests plus the drain barrier.
#[derive(Debug)]
pub struct WorkQueue {
    sender: Sender<Request>,
    receiver: Receiver<Request>,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl WorkQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Appends a request and counts it as outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::QueueClosed`] while a run is in progress.
    pub fn stage(&self, request: Request) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DispatchError::QueueClosed);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        // Both channel halves live in `self`, so sending cannot disconnect.
        let _ = self.sender.send(request);
        Ok(())
    }

    /// Puts an already counted request back for another attempt.
    pub(crate) fn requeue(&self, request: Request) {
        let _ = self.sender.send(request);
    }

    /// Pops the next request without blocking.
    pub fn try_pop(&self) -> Option<Request> {
        self.receiver.try_recv().ok()
    }

    /// Whether no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Number of requests waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Number of staged requests whose handlers have not finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Marks `count` outstanding requests as finished.
    pub(crate) fn acknowledge(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            })
            .unwrap_or(0);
        debug_assert!(previous >= count, "acknowledged more requests than were staged");
        if previous <= count {
            self.drained.notify_waiters();
        }
    }

    /// Waits until every staged request has been acknowledged.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drops every waiting request, acknowledging each, and returns how many
    /// were dropped.
    pub(crate) fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        self.acknowledge(discarded);
        discarded
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Whether staging is currently refused.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
