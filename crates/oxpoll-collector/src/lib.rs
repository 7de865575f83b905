//! Collector lifecycle: every collector implements the four poll
//! operations and embeds a shared [`base::CollectorBase`] carrying its
//! template, working matrix, metadata matrix, schedule and plugins.
//! [`base::run`] drives a collector on its own worker until shutdown.

pub mod base;
pub mod client;
pub mod perf;
pub mod plugin;
pub mod plugins;
pub mod probe;
pub mod recorder;
pub mod rest;
pub mod restperf;
pub mod schedule;
pub mod template;
pub mod zapi;
pub mod zapiperf;

use async_trait::async_trait;
use oxpoll_common::error::Result;
use oxpoll_matrix::Matrix;

/// Instance-set change reported by a PollInstance cycle, fed into the
/// collector's self-metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceDiff {
    pub added: u64,
    pub removed: u64,
}

#[async_trait]
pub trait Collector: Send {
    fn base(&self) -> &base::CollectorBase;

    fn base_mut(&mut self) -> &mut base::CollectorBase;

    /// Collector class, e.g. `Rest` or `ZapiPerf`.
    fn class(&self) -> &str {
        &self.base().class
    }

    /// Observed object, e.g. `Volume`.
    fn object(&self) -> &str {
        &self.base().object
    }

    /// Validates the template and builds the initial matrix columns.
    async fn init(&mut self) -> Result<()>;

    /// Refreshes the instance set of the working matrix.
    async fn poll_instance(&mut self) -> Result<InstanceDiff>;

    /// Refreshes counter metadata. A no-op for inventory collectors.
    async fn poll_counter(&mut self) -> Result<()>;

    /// Performs one sample and returns the matrices for this cycle.
    /// Perf collectors return nothing on the priming sample.
    async fn poll_data(&mut self) -> Result<Vec<Matrix>>;
}
