//! Post-processing shared by the performance collectors: deltas against
//! the previous sample, rates normalized by elapsed time, averages and
//! percentages against denominator counters, and the latency floor for
//! quiet instances. The cache holds exactly one previous sample.

use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_matrix::{CounterMeta, Matrix, Metric, Property, With};
use std::collections::HashMap;

pub const TIMESTAMP_METRIC: &str = "timestamp";
pub const DEFAULT_LATENCY_IO_REQD: f64 = 10.0;

/// Outcome of one post-processing pass, fed into self-metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfStats {
    /// Cells cleared because a counter wrapped.
    pub wraps: usize,
}

/// Counter metadata plus the previous raw sample of one perf collector.
pub struct PerfCache {
    pub counters: HashMap<String, CounterMeta>,
    pub latency_io_reqd: f64,
    previous: Option<Matrix>,
}

impl Default for PerfCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCache {
    pub fn new() -> Self {
        PerfCache {
            counters: HashMap::new(),
            latency_io_reqd: DEFAULT_LATENCY_IO_REQD,
            previous: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_none()
    }

    /// Drops the previous sample; the next cycle primes afresh. Called
    /// whenever the counter schema changes between cycles.
    pub fn discard(&mut self) {
        self.previous = None;
    }

    /// Metadata for a metric; array buckets (`name#bucket`) share their
    /// parent counter's metadata.
    pub fn counter_for(&self, metric: &Metric) -> Option<&CounterMeta> {
        let key = metric.key();
        let name = if metric.is_array() {
            key.rsplit_once('#').map_or(key, |(name, _)| name)
        } else {
            key
        };
        self.counters.get(name)
    }

    /// Runs the perf pipeline over a freshly filled raw sample.
    ///
    /// The first sample only primes the cache and yields nothing. Later
    /// samples are processed in place: denominator-free metrics first so
    /// denominators are already deltified, the synthetic timestamp delta
    /// before everything else, rates deferred to a second pass so they
    /// divide by elapsed time only after averages used the plain deltas.
    /// The cache ends up holding the pre-processing clone of the sample.
    pub fn process(&mut self, mut sample: Matrix) -> Result<Option<(Matrix, PerfStats)>> {
        let Some(previous) = self.previous.take() else {
            self.previous = Some(sample);
            return Ok(None);
        };

        if schema_changed(&previous, &sample) {
            tracing::info!(
                object = sample.object(),
                "Counter schema changed, discarding previous sample"
            );
            self.previous = Some(sample);
            return Ok(None);
        }

        let cached = sample.clone_with(With::all());
        let mut stats = PerfStats::default();

        // denominator-free metrics first, then the ones that divide by them
        let mut plain = Vec::new();
        let mut with_base = Vec::new();
        for key in sample.metric_keys() {
            if key == TIMESTAMP_METRIC {
                continue;
            }
            let Some(metric) = sample.get_metric(&key) else {
                continue;
            };
            let Some(meta) = self.counter_for(metric) else {
                tracing::warn!(metric = %key, "No counter metadata, skipping");
                continue;
            };
            if meta.denominator.is_none() {
                plain.push(key);
            } else {
                with_base.push(key);
            }
        }
        plain.sort();
        with_base.sort();

        sample.delta(TIMESTAMP_METRIC, &previous)?;

        let mut rates = Vec::new();
        for key in plain.into_iter().chain(with_base) {
            let metric = sample
                .get_metric(&key)
                .ok_or_else(|| Error::missing("metric", key.clone()))?;
            let meta = self
                .counter_for(metric)
                .ok_or_else(|| Error::missing("counter metadata", key.clone()))?;
            let property = meta.property;
            let denominator = meta.denominator.clone();
            let is_latency = metric.name().ends_with("latency");

            if property == Property::Raw {
                continue;
            }

            stats.wraps += sample.delta(&key, &previous)?;

            match property {
                Property::Delta => {}
                Property::Rate => rates.push(key),
                Property::Average | Property::Percent => {
                    let denominator = denominator.ok_or_else(|| {
                        Error::Protocol(format!("{key}: {property} counter without denominator"))
                    })?;
                    if is_latency {
                        sample.divide_with_threshold(&key, &denominator, self.latency_io_reqd)?;
                    } else {
                        sample.divide(&key, &denominator)?;
                    }
                    if property == Property::Percent {
                        sample.multiply_by_scalar(&key, 100.0)?;
                    }
                }
                Property::Raw => unreachable!("raw counters skip post-processing"),
            }
        }

        for key in rates {
            sample.divide(&key, TIMESTAMP_METRIC)?;
        }

        self.previous = Some(cached);
        Ok(Some((sample, stats)))
    }
}

/// Whether the metric set of two consecutive samples diverged, which
/// invalidates positional deltas and any cached counter assumptions.
pub fn schema_changed(previous: &Matrix, current: &Matrix) -> bool {
    previous.metric_len() != current.metric_len()
        || current
            .get_metrics()
            .any(|(key, _)| previous.get_metric(key).is_none())
}

/// Registers the synthetic per-instance timestamp column: raw so the
/// pipeline never touches it, hidden from export.
pub fn ensure_timestamp_metric(matrix: &mut Matrix, counters: &mut HashMap<String, CounterMeta>) {
    if matrix.get_metric(TIMESTAMP_METRIC).is_none() {
        if let Ok(metric) = matrix.new_metric_float64(TIMESTAMP_METRIC) {
            metric.set_exportable(false);
            metric.set_property(Property::Raw);
        }
    }
    counters
        .entry(TIMESTAMP_METRIC.to_string())
        .or_insert_with(|| CounterMeta {
            name: TIMESTAMP_METRIC.to_string(),
            property: Property::Raw,
            ..CounterMeta::default()
        });
}

/// Workload-detail objects decompose `service_time` and `wait_time` into
/// one synthetic latency column per resource layer named by the
/// template's `resource_map`; `visits` is suppressed from export but
/// donates its counter metadata to a synthetic `ops` column that serves
/// as every layer's denominator.
pub fn init_workload_columns(
    matrix: &mut Matrix,
    counters: &mut HashMap<String, CounterMeta>,
    params: &Node,
) -> Result<()> {
    let resource_map = params
        .get_child("resource_map")
        .ok_or_else(|| Error::Config("workload-detail template has no resource_map".to_string()))?;

    for required in ["service_time", "wait_time", "visits"] {
        if matrix.get_metric(required).is_none() {
            return Err(Error::Protocol(format!(
                "workload counter {required} missing from schema"
            )));
        }
    }

    let visits_meta = counters
        .get("visits")
        .cloned()
        .ok_or_else(|| Error::missing("counter metadata", "visits"))?;
    let service_meta = counters
        .get("service_time")
        .cloned()
        .ok_or_else(|| Error::missing("counter metadata", "service_time"))?;

    if matrix.get_metric("ops").is_none() {
        matrix.new_metric_float64("ops")?;
        counters.insert(
            "ops".to_string(),
            CounterMeta {
                name: "ops".to_string(),
                description: String::new(),
                property: visits_meta.property,
                unit: visits_meta.unit.clone(),
                denominator: None,
            },
        );
    }

    for hidden in ["service_time", "wait_time", "visits"] {
        if let Some(metric) = matrix.get_metric_mut(hidden) {
            metric.set_exportable(false);
        }
    }

    for layer in resource_map.iter_children() {
        let name = layer.name();
        let resource = layer.content();
        if matrix.get_metric(name).is_some() {
            continue;
        }
        let metric = matrix.new_metric_float64(name)?;
        metric.set_name("resource_latency");
        metric.set_label(resource);
        metric.set_array(true);
        counters.insert(
            name.to_string(),
            CounterMeta {
                name: "resource_latency".to_string(),
                description: String::new(),
                property: service_meta.property,
                unit: service_meta.unit.clone(),
                denominator: Some("ops".to_string()),
            },
        );
    }
    Ok(())
}
