//! Supervision of the controllers of one run.
//!
//! Every controller runs as its own task. The set catches controller panics
//! so the dispatcher always learns which controller stopped and how many
//! dequeued items went down with it.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    controller::{panic_message, Controller, ControllerExit, ControllerStatus},
    error::{DispatchError, Result},
};

/// Running controllers of one run.
pub struct ControllerSet {
    controllers: JoinSet<ControllerExit>,
    cancellation_token: CancellationToken,
}

impl ControllerSet {
    /// Creates an empty set. `cancellation_token` is the run's abort token.
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self { controllers: JoinSet::new(), cancellation_token }
    }

    /// Spawns `controller` on the runtime.
    pub fn spawn(&mut self, controller: Controller) {
        let controller_id = controller.id();
        let held = controller.held_counter();
        self.controllers.spawn(supervise(controller_id, held, controller));
    }

    /// Number of controllers that have not been joined yet.
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    /// Whether every controller has been joined.
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Waits for the next controller to stop.
    ///
    /// Returns `None` once every controller has been joined.
    pub async fn join_next(&mut self) -> Option<ControllerExit> {
        loop {
            match self.controllers.join_next().await? {
                Ok(exit) => return Some(exit),
                // Panics are caught inside the task; this only happens when
                // the task was aborted, which leaves nothing to hand back.
                Err(join_error) => {
                    warn!(error = %join_error, "controller task did not complete");
                },
            }
        }
    }

    /// Joins every remaining controller within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShutdownTimeout`] if controllers are still
    /// running after `timeout`; they are aborted and their pools are lost.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<Vec<ControllerExit>> {
        info!(
            remaining = self.controllers.len(),
            timeout_seconds = timeout.as_secs(),
            "joining controllers"
        );

        let mut exits = Vec::new();
        let joined = tokio::time::timeout(timeout, async {
            while let Some(exit) = self.join_next().await {
                exits.push(exit);
            }
        })
        .await;

        match joined {
            Ok(()) => Ok(exits),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    remaining = self.controllers.len(),
                    "controllers did not stop in time, aborting them"
                );
                self.cancellation_token.cancel();
                self.controllers.abort_all();
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for ControllerSet {
    fn drop(&mut self) {
        if !self.controllers.is_empty() && !self.cancellation_token.is_cancelled() {
            error!(
                active_controllers = self.controllers.len(),
                "controller set dropped with active controllers, cancelling the run"
            );
            self.cancellation_token.cancel();
        }
    }
}

async fn supervise(
    controller_id: usize,
    held: Arc<AtomicUsize>,
    controller: Controller,
) -> ControllerExit {
    match AssertUnwindSafe(controller.run()).catch_unwind().await {
        Ok(exit) => {
            if let ControllerStatus::Failed(error) = &exit.status {
                error!(controller_id, error = %error, "controller stopped with error");
            }
            exit
        },
        Err(panic) => {
            let message = panic_message(&*panic);
            let held = held.load(Ordering::Acquire);
            error!(controller_id, held, panic = %message, "controller panicked");
            ControllerExit {
                controller_id,
                pools: Vec::new(),
                held,
                status: ControllerStatus::Panicked(message),
            }
        },
    }
}
