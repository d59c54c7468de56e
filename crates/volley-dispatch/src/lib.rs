//! Rate-limited dispatch of outbound requests across multiple pools.
//!
//! Callers stage requests on a [`Dispatcher`], register handlers for
//! response and error outcomes, and run it. The dispatcher paces admissions
//! with a global ticket stream, spreads them over the least-loaded pools and
//! invokes the handlers as completions arrive.
//!
//! # Architecture
//!
//! 1. **Tickets** - one generator emits at most `rate` tickets per second
//!    and broadcasts each to every controller; one controller claims it
//! 2. **Controllers** - one per pool group; admit a request per claimed
//!    ticket into the least-loaded pool and reap completions
//! 3. **Handlers** - run in registration order with the store locked for the
//!    whole batch, and may ask for a retry or stop the run
//! 4. **Telemetry** - sliding-window completion rates readable from handlers
//!
//! # Example
//!
//! ```no_run
//! use volley_core::{EventKind, Request};
//! use volley_dispatch::{Dispatcher, DispatcherConfig, HttpPool, HttpPoolConfig, RequestPool};
//!
//! # async fn example() -> volley_dispatch::Result<()> {
//! let pools: Vec<Box<dyn RequestPool>> =
//!     vec![Box::new(HttpPool::new(HttpPoolConfig::named("primary")))];
//! let mut dispatcher = Dispatcher::new(DispatcherConfig::new(10.0), pools)?;
//!
//! dispatcher.on_fn(EventKind::Response, |outcome, ctx| {
//!     println!("{} done at {:?}", outcome.request_id(), ctx.rates());
//! });
//! dispatcher.stage(Request::get("https://api.example.com/items/1"))?;
//!
//! let report = dispatcher.run().await?;
//! println!("dispatched {} outcomes", report.dispatched());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod callback;
pub mod controller;
pub mod controller_set;
pub mod dispatcher;
pub mod error;
pub mod http_pool;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod ticket;

pub use callback::{CallbackRegistry, Context, FnHandler, Handler};
pub use dispatcher::{Dispatcher, DispatcherConfig, RunOutcome, RunReport, Stager};
pub use error::{DispatchError, Result};
pub use http_pool::{HttpPool, HttpPoolConfig, PoolAuth};
pub use pool::{completion_channel, CompletionFeed, CompletionSender, RequestPool};
pub use store::{SharedStore, StoreMap};
pub use telemetry::RateSnapshot;

/// Default number of distinct connection pools a transport may keep.
pub const DEFAULT_POOL_HINT: usize = 8;
