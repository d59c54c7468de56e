//! The execution pool boundary.
//!
//! A [`RequestPool`] executes requests asynchronously on behalf of one
//! controller and reports every result on its completion feed. The engine
//! only relies on the operations below; transport, credentials and payload
//! handling are the pool's business.

use tokio::sync::mpsc;
use volley_core::{Outcome, Request};

use crate::error::Result;

/// Receiving side of a pool's completions.
///
/// The pool keeps the sending side for as long as it can still complete
/// requests. The feed closing while requests are in flight means the pool
/// has failed.
pub type CompletionFeed = mpsc::UnboundedReceiver<Outcome>;

/// Sending side of a pool's completions.
pub type CompletionSender = mpsc::UnboundedSender<Outcome>;

/// Creates a completion channel.
pub fn completion_channel() -> (CompletionSender, CompletionFeed) {
    mpsc::unbounded_channel()
}

/// An execution context with its own connection budget.
#[async_trait::async_trait]
pub trait RequestPool: Send + Sync + std::fmt::Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Pools sharing a group are driven by one controller and one ticket
    /// stream. `None` gives the pool a controller of its own.
    fn group(&self) -> Option<&str> {
        None
    }

    /// Prepares the pool for a run and returns its completion feed.
    ///
    /// Called once per run before any submission. `pool_hint` is how many
    /// distinct connection pools the transport may keep; `max_connections`
    /// is the per-pool connection budget.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Pool`](crate::DispatchError::Pool) when the
    /// transport cannot be built.
    async fn setup(&mut self, pool_hint: usize, max_connections: usize) -> Result<CompletionFeed>;

    /// Number of submitted requests that have not completed yet.
    fn remaining_tasks(&self) -> usize;

    /// Connection budget for the current run.
    fn capacity(&self) -> usize;

    /// Whether another submission fits in the budget.
    fn has_capacity(&self) -> bool {
        self.remaining_tasks() < self.capacity()
    }

    /// Starts executing `request` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Capacity`](crate::DispatchError::Capacity)
    /// when the budget is exhausted and
    /// [`DispatchError::Pool`](crate::DispatchError::Pool) when the pool was
    /// not set up.
    fn submit(&mut self, request: Request) -> Result<()>;

    /// Releases run-scoped resources. Called once per run after the last
    /// completion was reaped.
    async fn teardown(&mut self) {}
}

/// Index of the least-loaded pool that still has capacity.
///
/// `loads` yields `(remaining_tasks, has_capacity)` per pool in declaration
/// order. Ties go to the earliest pool.
pub fn least_loaded<I>(loads: I) -> Option<usize>
where
    I: IntoIterator<Item = (usize, bool)>,
{
    loads
        .into_iter()
        .enumerate()
        .filter(|(_, (_, has_capacity))| *has_capacity)
        .min_by_key(|(_, (remaining, _))| *remaining)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_minimum_outstanding() {
        assert_eq!(least_loaded([(3, true), (1, true), (4, true)]), Some(1));
    }

    #[test]
    fn ties_go_to_first_declared() {
        assert_eq!(least_loaded([(2, true), (1, true), (1, true)]), Some(1));
        assert_eq!(least_loaded([(0, true), (0, true)]), Some(0));
    }

    #[test]
    fn skips_pools_without_capacity() {
        assert_eq!(least_loaded([(1, false), (5, true)]), Some(1));
        assert_eq!(least_loaded([(1, false), (5, false)]), None);
        assert_eq!(least_loaded(std::iter::empty()), None);
    }
}
