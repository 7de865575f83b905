//! Exporters publish matrices produced by collectors: a pull-based
//! Prometheus scrape endpoint and a push-based InfluxDB line-protocol
//! writer. Exporters only ever see snapshots; they never reach back
//! into collector state.

pub mod influx;
pub mod prometheus;
pub mod render;

use async_trait::async_trait;
use oxpoll_common::error::Result;
use oxpoll_matrix::Matrix;

#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Publishes one cycle's matrices. Implementations must not block on
    /// collector state; failures are reported, never fatal.
    async fn export(&self, matrices: &[Matrix]) -> Result<()>;
}
