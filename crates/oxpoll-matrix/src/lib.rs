//! In-memory sample of one observed object: a sparse table of
//! instances × metrics with labels, global labels and export flags,
//! plus the counter arithmetic used to turn successive samples of
//! monotonic counters into deltas, rates, averages and percentages.

mod instance;
mod matrix;
mod metric;

#[cfg(test)]
mod tests;

pub use instance::Instance;
pub use matrix::{ExportOptions, Matrix, With};
pub use metric::{CounterMeta, Metric, Property};
