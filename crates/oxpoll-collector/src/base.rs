//! Shared collector state and the worker loop that drives a collector's
//! schedule wheel: pick the earliest-due task, run it, record
//! self-metrics, deliver the cycle's matrices to the exporters, and back
//! off on consecutive transient failures.

use crate::plugin::Plugin;
use crate::schedule::{parse_duration, Schedule};
use crate::{Collector, InstanceDiff};
use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_exporter::Exporter;
use oxpoll_matrix::{ExportOptions, Matrix};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const TASK_INSTANCE: &str = "instance";
pub const TASK_COUNTER: &str = "counter";
pub const TASK_DATA: &str = "data";

const DEFAULT_DATA_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_INSTANCE_INTERVAL: Duration = Duration::from_secs(600);
const DEFAULT_COUNTER_INTERVAL: Duration = Duration::from_secs(1200);

/// State every collector embeds: identity, template, working matrix,
/// metadata matrix, schedule and plugins. Concrete collectors reach in
/// directly; there is no inheritance.
pub struct CollectorBase {
    pub poller: String,
    pub class: String,
    pub object: String,
    pub params: Node,
    pub matrix: Matrix,
    pub metadata: Matrix,
    pub schedule: Schedule,
    pub plugins: Vec<Box<dyn Plugin>>,
    errors: HashMap<String, u64>,
}

impl CollectorBase {
    pub fn new(
        poller: impl Into<String>,
        class: impl Into<String>,
        object: impl Into<String>,
        params: Node,
    ) -> Result<Self> {
        let poller = poller.into();
        let class = class.into();
        let object = object.into();

        let uuid = format!("{poller}.{class}.{object}");
        let mut matrix = Matrix::new(uuid, object.to_lowercase());
        if let Some(display) = params.get_child_content("object") {
            if !display.is_empty() {
                matrix.set_object(display);
            }
        }

        let metadata = build_metadata(&poller, &class, &object)?;
        let schedule = build_schedule(&params)?;

        Ok(CollectorBase {
            poller,
            class,
            object,
            params,
            matrix,
            metadata,
            schedule,
            plugins: Vec::new(),
            errors: HashMap::new(),
        })
    }

    /// Applies poller-wide labels to the working and metadata matrices.
    pub fn set_global_labels(&mut self, labels: &[(String, String)]) {
        for (name, value) in labels {
            self.matrix.set_global_label(name.clone(), value.clone());
            self.metadata.set_global_label(name.clone(), value.clone());
        }
    }

    /// Records the timings of one completed cycle on the metadata matrix.
    /// Durations are exported in microseconds.
    pub fn record_cycle(
        &mut self,
        task: &str,
        api: Duration,
        parse: Duration,
        calc: Duration,
        count: u64,
    ) {
        let _ = self
            .metadata
            .set_value("api_time", task, api.as_micros() as f64);
        let _ = self
            .metadata
            .set_value("parse_time", task, parse.as_micros() as f64);
        let _ = self
            .metadata
            .set_value("calc_time", task, calc.as_micros() as f64);
        let _ = self.metadata.set_value("count", task, count as f64);
    }

    pub fn record_poll_time(&mut self, task: &str, elapsed: Duration) {
        let _ = self
            .metadata
            .set_value("poll_time", task, elapsed.as_micros() as f64);
    }

    pub fn record_instance_diff(&mut self, diff: InstanceDiff) {
        let _ = self
            .metadata
            .set_value("instances_added", TASK_INSTANCE, diff.added as f64);
        let _ = self
            .metadata
            .set_value("instances_removed", TASK_INSTANCE, diff.removed as f64);
    }

    /// A failing cycle publishes an unreadable api_time, a zero count and
    /// a bumped error counter.
    pub fn record_error(&mut self, task: &str) {
        let errors = self.errors.entry(task.to_string()).or_insert(0);
        *errors += 1;
        let total = *errors;
        let _ = self.metadata.set_value("api_time", task, f64::NAN);
        let _ = self.metadata.set_value("parse_time", task, f64::NAN);
        let _ = self.metadata.set_value("count", task, 0.0);
        let _ = self.metadata.set_value("errors", task, total as f64);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }
}

fn build_metadata(poller: &str, class: &str, object: &str) -> Result<Matrix> {
    let mut metadata = Matrix::new(
        format!("{poller}.{class}.{object}:metadata"),
        "metadata_collector",
    );
    metadata.set_global_label("poller", poller);
    metadata.set_global_label("collector", class);
    metadata.set_global_label("target_object", object);

    for key in [
        "api_time",
        "parse_time",
        "calc_time",
        "poll_time",
        "count",
        "instances_added",
        "instances_removed",
        "errors",
    ] {
        let metric = metadata.new_metric_float64(key)?;
        if key.ends_with("_time") {
            metric.set_unit("microseconds");
        }
    }

    for task in [TASK_INSTANCE, TASK_COUNTER, TASK_DATA] {
        let instance = metadata.new_instance(task)?;
        instance.set_label("task", task);
    }

    metadata.set_export_options(ExportOptions {
        instance_keys: vec!["task".to_string()],
        instance_labels: Vec::new(),
        include_all_labels: false,
    });
    Ok(metadata)
}

fn build_schedule(params: &Node) -> Result<Schedule> {
    let mut schedule = Schedule::new();
    let mut intervals = [
        (TASK_INSTANCE, DEFAULT_INSTANCE_INTERVAL),
        (TASK_COUNTER, DEFAULT_COUNTER_INTERVAL),
        (TASK_DATA, DEFAULT_DATA_INTERVAL),
    ];

    if let Some(section) = params.get_child("schedule") {
        for entry in intervals.iter_mut() {
            if let Some(raw) = section.get_child_content(entry.0) {
                entry.1 = parse_duration(raw)?;
            }
        }
    }

    for (name, interval) in intervals {
        schedule.add_task(name, interval)?;
    }
    Ok(schedule)
}

/// Per-collector health published for the status line and liveness
/// surface.
#[derive(Debug, Clone, Default)]
pub struct CollectorHealth {
    pub status: String,
    pub errors: u64,
    pub last_task: String,
    pub last_poll_ms: u64,
    pub instances: u64,
}

#[derive(Clone, Default)]
pub struct HealthBoard {
    inner: Arc<Mutex<HashMap<String, CollectorHealth>>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, key: &str, health: CollectorHealth) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.insert(key.to_string(), health);
    }

    pub fn snapshot(&self) -> Vec<(String, CollectorHealth)> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<_> = inner.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Drives one collector until shutdown. PollInstance happens-before
/// PollCounter happens-before PollData within a cycle ordering because
/// only one task runs at a time on this worker.
pub async fn run(
    mut collector: Box<dyn Collector>,
    exporters: Vec<Arc<dyn Exporter>>,
    health: HealthBoard,
    mut shutdown: watch::Receiver<bool>,
) {
    let key = format!("{}:{}", collector.class(), collector.object());

    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some((task, wait)) = collector.base().schedule.next_due() else {
            tracing::error!(collector = %key, "Schedule is empty, stopping worker");
            break;
        };
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }

        let started = Instant::now();
        let outcome = match task.as_str() {
            TASK_INSTANCE => match collector.poll_instance().await {
                Ok(diff) => {
                    collector.base_mut().record_instance_diff(diff);
                    Ok(Vec::new())
                }
                Err(e) => Err(e),
            },
            TASK_COUNTER => collector.poll_counter().await.map(|()| Vec::new()),
            TASK_DATA => collector.poll_data().await,
            other => {
                tracing::error!(collector = %key, task = other, "Unknown schedule task");
                Ok(Vec::new())
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(mut matrices) => {
                collector.base_mut().schedule.record_success();
                collector.base_mut().record_poll_time(&task, elapsed);

                if !matrices.is_empty() {
                    let extras = run_plugins(collector.as_mut(), &mut matrices).await;
                    matrices.extend(extras);
                    matrices.push(collector.base().metadata.clone());
                    deliver(&key, &exporters, &matrices).await;
                } else if task == TASK_DATA {
                    // priming cycle of a perf collector: metadata only
                    let metadata = vec![collector.base().metadata.clone()];
                    deliver(&key, &exporters, &metadata).await;
                }
            }
            Err(e) => {
                match &e {
                    Error::NoInstance(_) => {
                        tracing::info!(collector = %key, task = %task, "No instances on remote");
                    }
                    _ => {
                        collector.base_mut().record_error(&task);
                        tracing::warn!(collector = %key, task = %task, error = %e, "Cycle failed");
                    }
                }
                if e.triggers_backoff() {
                    collector.base_mut().schedule.record_failure();
                }
                let metadata = vec![collector.base().metadata.clone()];
                deliver(&key, &exporters, &metadata).await;
            }
        }

        collector.base_mut().schedule.complete(&task);

        let base = collector.base();
        health.update(
            &key,
            CollectorHealth {
                status: if base.schedule.in_standby() {
                    "standby".to_string()
                } else {
                    "up".to_string()
                },
                errors: base.error_count(),
                last_task: task,
                last_poll_ms: elapsed.as_millis() as u64,
                instances: base.matrix.instance_len() as u64,
            },
        );
    }

    tracing::info!(collector = %key, "Worker stopped");
}

async fn run_plugins(collector: &mut dyn Collector, matrices: &mut [Matrix]) -> Vec<Matrix> {
    let mut extras = Vec::new();
    let Some(primary) = matrices.first_mut() else {
        return extras;
    };
    let base = collector.base_mut();
    for plugin in &mut base.plugins {
        match plugin.run(primary).await {
            Ok(mut produced) => extras.append(&mut produced),
            Err(e) => {
                tracing::warn!(plugin = plugin.name(), error = %e, "Plugin failed");
            }
        }
    }
    extras
}

async fn deliver(key: &str, exporters: &[Arc<dyn Exporter>], matrices: &[Matrix]) {
    for exporter in exporters {
        if let Err(e) = exporter.export(matrices).await {
            tracing::warn!(
                collector = %key,
                exporter = exporter.name(),
                error = %e,
                "Export failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxpoll_common::tree::Node;

    #[test]
    fn metadata_matrix_has_task_rows() {
        let base =
            CollectorBase::new("p1", "Rest", "Volume", Node::new("template")).unwrap();
        assert_eq!(base.metadata.instance_len(), 3);
        assert!(base.metadata.get_metric("api_time").is_some());
        assert!(base.metadata.get_metric("errors").is_some());
        assert_eq!(base.matrix.uuid(), "p1.Rest.Volume");
        assert_eq!(base.matrix.object(), "volume");
    }

    #[test]
    fn template_schedule_overrides_defaults() {
        let params = Node::from_yaml_str(
            "t",
            "schedule:\n  data: 30s\n  instance: 5m\n",
        )
        .unwrap();
        let base = CollectorBase::new("p1", "Rest", "Volume", params).unwrap();
        assert_eq!(
            base.schedule.effective_interval(TASK_DATA).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            base.schedule.effective_interval(TASK_INSTANCE).unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            base.schedule.effective_interval(TASK_COUNTER).unwrap(),
            DEFAULT_COUNTER_INTERVAL
        );
    }

    #[test]
    fn errors_accumulate_per_task() {
        let mut base =
            CollectorBase::new("p1", "Rest", "Volume", Node::new("template")).unwrap();
        base.record_error(TASK_DATA);
        base.record_error(TASK_DATA);
        base.record_error(TASK_COUNTER);
        assert_eq!(base.error_count(), 3);
        assert_eq!(base.metadata.value("errors", TASK_DATA), Some(2.0));
        assert_eq!(base.metadata.value("count", TASK_DATA), Some(0.0));
    }
}
