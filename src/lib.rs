//! Command-line front end for the volley dispatcher.
//!
//! Loads a [`config::Config`], builds one HTTP pool per configured pool,
//! stages the configured targets and runs them at the configured rate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod app;
pub mod config;

pub use app::{build_dispatcher, run, Summary};
pub use config::{Config, PoolSettings, Target};
