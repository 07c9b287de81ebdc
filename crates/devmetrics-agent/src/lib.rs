//! Metrics reporting agent.
//!
//! Sampling loops fill a shared [`reporter::MetricSet`]; the report loop
//! signs its snapshot, splits it into chunks and pushes every chunk through
//! a [`transport::Transport`] (HTTP or gRPC).

pub mod config;
pub mod reporter;
pub mod runner;
pub mod transport;
