//! Gauge samplers for the devmetrics agent.
//!
//! Each [`Collector`] reads one family of statistics (the agent process
//! itself, or the host) and returns named gauge samples. The agent merges
//! them into its gauge set on every poll.

pub mod runtime;
pub mod system;

use anyhow::Result;

/// A single named reading, always reported as a gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub name: String,
    pub value: f64,
}

impl GaugeSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A statistics source polled by the agent's sampling loops.
///
/// The trait requires `Send + Sync` so collectors can be moved into
/// spawned tasks.
pub trait Collector: Send + Sync {
    /// Returns the collector name (e.g., `"runtime"`), used for logging.
    fn name(&self) -> &str;

    /// Takes a fresh reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying system API call fails.
    fn collect(&mut self) -> Result<Vec<GaugeSample>>;
}
