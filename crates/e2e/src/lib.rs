//! End-to-end harness for Fleet agent management and metricbeat scenarios.
//!
//! The interesting part is [`poll`]: remote state (agent status, datastreams,
//! metrics files) converges eventually, and every check is expressed as a
//! predicate polled with exponential backoff until it holds or a deadline
//! passes.

pub mod checks;
pub mod config;
pub mod fleet;
pub mod installer;
pub mod logging;
pub mod metricbeat;
pub mod poll;
pub mod scenario;
pub mod services;

pub use config::{SuiteConfig, load_config};
pub use poll::{BackoffPolicy, Outcome, PollError, PollReport, poll_until};
