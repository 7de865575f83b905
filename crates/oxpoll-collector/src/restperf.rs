//! REST performance collector. PollCounter negotiates the counter
//! schema with the remote (registering hidden denominator columns),
//! PollData fills a raw sample including array-counter buckets and runs
//! the shared perf pipeline against the previous sample. The qos
//! workload-detail objects decompose their latency counters per
//! resource layer and borrow the parent object's ops counter as
//! denominator.

use crate::base::{CollectorBase, TASK_COUNTER, TASK_DATA, TASK_INSTANCE};
use crate::client::rest::{build_href, json_path, json_to_string, RestClient};
use crate::perf::{self, PerfCache, TIMESTAMP_METRIC};
use crate::template::{parse_counters, parse_export_options, CounterDef, CounterKind};
use crate::{Collector, InstanceDiff};
use async_trait::async_trait;
use oxpoll_common::error::{Error, Result};
use oxpoll_matrix::{CounterMeta, Matrix, Property, With};
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};

const QOS_QUERY: &str = "api/cluster/counter/tables/qos";
const QOS_VOLUME_QUERY: &str = "api/cluster/counter/tables/qos_volume";
const QOS_DETAIL_QUERY: &str = "api/cluster/counter/tables/qos_detail";
const QOS_DETAIL_VOLUME_QUERY: &str = "api/cluster/counter/tables/qos_detail_volume";
const QOS_WORKLOAD_QUERY: &str = "api/storage/qos/workloads";

fn is_workload_object(query: &str) -> bool {
    query == QOS_QUERY || query == QOS_VOLUME_QUERY
}

fn is_workload_detail_object(query: &str) -> bool {
    query == QOS_DETAIL_QUERY || query == QOS_DETAIL_VOLUME_QUERY
}

pub struct RestPerf {
    pub(crate) base: CollectorBase,
    pub(crate) client: RestClient,
    pub(crate) query: String,
    pub(crate) counters: Vec<CounterDef>,
    pub(crate) perf: PerfCache,
    qos_labels: Vec<(String, String)>,
}

impl RestPerf {
    pub fn new(base: CollectorBase, client: RestClient) -> Result<Self> {
        let query = base
            .params
            .get_child_content("query")
            .filter(|q| !q.is_empty())
            .ok_or_else(|| Error::Config(format!("{}: template has no query", base.object)))?
            .to_string();
        let counters = parse_counters(&base.params)?;

        let mut perf = PerfCache::new();
        if let Some(raw) = base.params.get_child_content("latency_io_reqd") {
            perf.latency_io_reqd = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid latency_io_reqd {raw:?}")))?;
        }

        let qos_labels = if is_workload_object(&query) || is_workload_detail_object(&query) {
            let section = base.params.get_child("qos_labels").ok_or_else(|| {
                Error::Config(format!("{}: workload template has no qos_labels", base.object))
            })?;
            section
                .get_all_child_content()
                .into_iter()
                .filter(|l| !l.is_empty())
                .map(|label| match label.split_once("=>") {
                    Some((source, display)) => {
                        (source.trim().to_string(), display.trim().to_string())
                    }
                    None => (label.to_string(), label.replace('-', "_")),
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(RestPerf {
            base,
            client,
            query,
            counters,
            perf,
            qos_labels,
        })
    }

    fn requested_metrics(&self) -> Vec<&CounterDef> {
        self.counters
            .iter()
            .filter(|c| c.kind == CounterKind::Metric)
            .collect()
    }

    fn display_for(&self, name: &str) -> String {
        self.requested_metrics()
            .iter()
            .find(|def| def.path == name)
            .map(|def| def.display.clone())
            .unwrap_or_else(|| name.to_string())
    }

    fn instance_key(&self, record: &Value) -> Option<String> {
        let mut key = String::new();
        for def in self.counters.iter().filter(|c| c.kind == CounterKind::Key) {
            key.push_str(&json_to_string(parse_property(record, &def.path)?));
        }
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// Counter metadata refresh, including the denominators the template
    /// never asked for: they are collected but hidden from export.
    async fn refresh_counter_schema(&mut self) -> Result<u64> {
        let href = build_href(&self.query, &[], &[]);
        let records = self.client.fetch_records(&href).await?;
        let schemas = records
            .first()
            .and_then(|r| r.get("counter_schemas"))
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::Protocol(format!("{}: response has no counter_schemas", self.query))
            })?;

        let mut wanted: HashSet<String> = self
            .requested_metrics()
            .iter()
            .map(|def| def.path.clone())
            .collect();

        // denominators of requested counters join the set, unexported
        for schema in schemas {
            let name = schema.get("name").map(json_to_string).unwrap_or_default();
            if !wanted.contains(&name) {
                continue;
            }
            let denominator = json_path(schema, "denominator.name")
                .map(json_to_string)
                .unwrap_or_default();
            if !denominator.is_empty() && !wanted.contains(&denominator) {
                if self.base.matrix.get_metric(&denominator).is_none() {
                    let metric = self.base.matrix.new_metric_float64(denominator.clone())?;
                    metric.set_exportable(false);
                }
                wanted.insert(denominator);
            }
        }

        let mut count = 0u64;
        for schema in schemas {
            let name = schema.get("name").map(json_to_string).unwrap_or_default();
            if !wanted.contains(&name) || self.perf.counters.contains_key(&name) {
                continue;
            }
            let raw_property = schema.get("type").map(json_to_string).unwrap_or_default();
            let property = self.override_for(&name).unwrap_or(raw_property);
            let property: Property = match property.parse() {
                Ok(p) => p,
                Err(_) => {
                    tracing::warn!(counter = %name, property = %property, "Unknown counter type, treating as raw");
                    Property::Raw
                }
            };
            self.perf.counters.insert(
                name.clone(),
                CounterMeta {
                    name: name.clone(),
                    description: schema.get("description").map(json_to_string).unwrap_or_default(),
                    property,
                    unit: schema.get("unit").map(json_to_string).unwrap_or_default(),
                    denominator: json_path(schema, "denominator.name")
                        .map(json_to_string)
                        .filter(|d| !d.is_empty()),
                },
            );
            count += 1;
        }
        Ok(count)
    }

    fn override_for(&self, counter: &str) -> Option<String> {
        self.base
            .params
            .get_child("override")
            .and_then(|o| o.get_child_content(counter))
            .map(str::to_string)
    }

    /// The parent object's ops counter backs the per-layer latency
    /// columns of a workload-detail object; it is fetched separately
    /// because this collector only sees the detail rows.
    async fn fetch_parent_ops(&mut self, data: &mut Matrix) -> Result<()> {
        if data.get_metric("ops").is_none() {
            return Err(Error::missing("metric", "ops"));
        }
        let parent_query = if self.query == QOS_DETAIL_QUERY {
            QOS_QUERY
        } else {
            QOS_VOLUME_QUERY
        };
        let href = build_href(
            &format!("{parent_query}/rows"),
            &["*".to_string()],
            &["counters.name=ops".to_string()],
        );
        let records = self.client.fetch_records(&href).await?;
        if records.is_empty() {
            return Err(Error::NoInstance(format!("no {parent_query} rows on cluster")));
        }

        for record in &records {
            let Some(key) = parse_property(record, "name").map(json_to_string) else {
                continue;
            };
            if data.get_instance(&key).is_none() {
                continue;
            }
            if let Some(CounterValue::Scalar(value)) = counter_value(record, "ops") {
                if let Err(e) = data.set_value_string("ops", &key, &value) {
                    tracing::warn!(instance = %key, error = %e, "Parent ops value rejected");
                }
            }
        }
        Ok(())
    }

    fn sync_instances(&mut self, records: &[Value], workload: bool) -> Result<InstanceDiff> {
        let mut stale: HashSet<String> = self.base.matrix.instance_keys().into_iter().collect();
        let mut added = 0u64;

        for record in records {
            let key = if workload {
                let field = if is_workload_detail_object(&self.query) {
                    "name"
                } else {
                    "uuid"
                };
                record.get(field).map(json_to_string).filter(|k| !k.is_empty())
            } else {
                self.instance_key(record)
            };
            let Some(key) = key else {
                tracing::warn!(object = %self.base.object, "Skipping record without key fields");
                continue;
            };

            if stale.remove(&key) {
                continue;
            }
            let qos_labels = self.qos_labels.clone();
            let instance = self.base.matrix.new_instance(key)?;
            added += 1;
            if workload {
                for (source, display) in &qos_labels {
                    match json_path(record, source) {
                        Some(value) => instance.set_label(display.clone(), json_to_string(value)),
                        None => tracing::warn!(label = %source, "Missing qos label"),
                    }
                }
            }
        }

        let removed = stale.len() as u64;
        for key in stale {
            self.base.matrix.remove_instance(&key);
        }
        Ok(InstanceDiff { added, removed })
    }
}

#[async_trait]
impl Collector for RestPerf {
    fn base(&self) -> &CollectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CollectorBase {
        &mut self.base
    }

    async fn init(&mut self) -> Result<()> {
        for def in self.counters.clone() {
            if def.kind != CounterKind::Metric {
                continue;
            }
            let metric = self.base.matrix.new_metric_float64(def.path.clone())?;
            metric.set_name(def.display.clone());
        }
        perf::ensure_timestamp_metric(&mut self.base.matrix, &mut self.perf.counters);
        let options = parse_export_options(&self.base.params);
        self.base.matrix.set_export_options(options);
        tracing::debug!(
            object = %self.base.object,
            metrics = self.base.matrix.metric_len(),
            "Initialized perf cache"
        );
        Ok(())
    }

    async fn poll_counter(&mut self) -> Result<()> {
        let api_start = Instant::now();
        let count = self.refresh_counter_schema().await?;
        let api_elapsed = api_start.elapsed();

        let parse_start = Instant::now();
        perf::ensure_timestamp_metric(&mut self.base.matrix, &mut self.perf.counters);
        if is_workload_detail_object(&self.query) {
            perf::init_workload_columns(
                &mut self.base.matrix,
                &mut self.perf.counters,
                &self.base.params,
            )?;
        }
        self.base.record_cycle(
            TASK_COUNTER,
            api_elapsed,
            parse_start.elapsed(),
            Duration::ZERO,
            count,
        );
        Ok(())
    }

    async fn poll_instance(&mut self) -> Result<InstanceDiff> {
        let workload =
            is_workload_object(&self.query) || is_workload_detail_object(&self.query);

        let api_start = Instant::now();
        let records = if workload {
            let class = if self.query == QOS_VOLUME_QUERY || self.query == QOS_DETAIL_VOLUME_QUERY
            {
                "workload-class=autovolume"
            } else {
                "workload-class=user_defined"
            };
            let href = build_href(QOS_WORKLOAD_QUERY, &["*".to_string()], &[class.to_string()]);
            self.client.fetch_records(&href).await?
        } else {
            let href = build_href(&format!("{}/rows", self.query), &["*".to_string()], &[]);
            self.client.fetch_records(&href).await?
        };
        let api_elapsed = api_start.elapsed();

        if records.is_empty() {
            return Err(Error::NoInstance(format!(
                "no {} instances on cluster",
                self.base.object
            )));
        }

        let parse_start = Instant::now();
        let diff = self.sync_instances(&records, workload)?;
        if self.base.matrix.instance_len() == 0 {
            return Err(Error::NoInstance(format!(
                "no {} instances on cluster",
                self.base.object
            )));
        }

        self.base.record_cycle(
            TASK_INSTANCE,
            api_elapsed,
            parse_start.elapsed(),
            Duration::ZERO,
            records.len() as u64,
        );
        Ok(diff)
    }

    async fn poll_data(&mut self) -> Result<Vec<Matrix>> {
        let mut data = self.base.matrix.clone_with(With {
            data: false,
            metrics: true,
            instances: true,
            export_instances: true,
        });
        if data.get_metric(TIMESTAMP_METRIC).is_none() {
            return Err(Error::Config("timestamp metric missing from cache".to_string()));
        }
        let workload_detail = is_workload_detail_object(&self.query);

        let api_start = Instant::now();
        let href = build_href(&format!("{}/rows", self.query), &["*".to_string()], &[]);
        let timestamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as f64
            / 1e9;
        let records = self.client.fetch_records(&href).await?;
        let api_elapsed = api_start.elapsed();

        if records.is_empty() {
            return Err(Error::NoInstance(format!(
                "no {} instances on cluster",
                self.base.object
            )));
        }

        let parse_start = Instant::now();
        let mut count = 0u64;
        let counters = self.counters.clone();
        // every scalar column of the cache is sampled, including hidden
        // denominators; array buckets spawn from their parent counter
        let metric_names: Vec<String> = data
            .metric_keys()
            .into_iter()
            .filter(|k| k != TIMESTAMP_METRIC && !k.contains('#'))
            .collect();

        for record in &records {
            let Some(raw_key) = self.instance_key(record) else {
                continue;
            };

            // detail rows arrive as workload.layer; the layer addresses
            // the per-resource latency column
            let (key, layer) = if workload_detail {
                match raw_key.split_once('.') {
                    Some((key, layer)) => (key.to_string(), Some(layer.to_string())),
                    None => {
                        tracing::warn!(key = %raw_key, "Detail key has unexpected format");
                        continue;
                    }
                }
            } else {
                (raw_key, None)
            };

            if let Some(layer) = &layer {
                if data.get_metric(layer).is_none() {
                    tracing::debug!(layer = %layer, "Resource layer missing from cache");
                    continue;
                }
            }
            if data.get_instance(&key).is_none() {
                tracing::debug!(key = %key, "Skipping instance not in cache");
                continue;
            }

            for def in &counters {
                if def.kind != CounterKind::Label {
                    continue;
                }
                if let Some(value) = parse_property(record, &def.path) {
                    if let Some(instance) = data.get_instance_mut(&key) {
                        instance.set_label(def.display.clone(), json_to_string(value));
                        count += 1;
                    }
                }
            }

            for name in &metric_names {
                let Some(value) = counter_value(record, name) else {
                    continue;
                };

                if workload_detail {
                    if name == "service_time" || name == "wait_time" {
                        if let (Some(layer), CounterValue::Scalar(text)) = (&layer, &value) {
                            match text.parse::<f64>() {
                                Ok(number) => {
                                    data.add_value(layer, &key, number)?;
                                    count += 1;
                                }
                                Err(_) => tracing::warn!(
                                    counter = %name,
                                    value = %text,
                                    "Unparseable resource latency"
                                ),
                            }
                        }
                        continue;
                    }
                    // visits only shapes the ops counter metadata
                    if name == "visits" {
                        continue;
                    }
                }

                match value {
                    CounterValue::Scalar(text) => {
                        match data.set_value_string(name, &key, &text) {
                            Ok(()) => count += 1,
                            Err(Error::Parse { .. }) => {
                                tracing::debug!(metric = %name, "Unparseable cell skipped");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    CounterValue::Array(pairs) => {
                        for (bucket, text) in pairs {
                            let column = format!("{name}#{bucket}");
                            if data.get_metric(&column).is_none() {
                                let display = self.display_for(name);
                                let exportable = data
                                    .get_metric(name)
                                    .map(|m| m.is_exportable())
                                    .unwrap_or(true);
                                let metric = data.new_metric_float64(column.clone())?;
                                metric.set_name(display);
                                metric.set_label(bucket);
                                metric.set_array(true);
                                metric.set_exportable(exportable);
                            }
                            match data.set_value_string(&column, &key, &text) {
                                Ok(()) => count += 1,
                                Err(Error::Parse { .. }) => {
                                    tracing::debug!(metric = %column, "Unparseable cell skipped");
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
            }

            data.set_value(TIMESTAMP_METRIC, &key, timestamp)?;
        }

        if workload_detail {
            self.fetch_parent_ops(&mut data).await?;
        }
        let parse_elapsed = parse_start.elapsed();

        let calc_start = Instant::now();
        let processed = self.perf.process(data)?;
        self.base.record_cycle(
            TASK_DATA,
            api_elapsed,
            parse_elapsed,
            calc_start.elapsed(),
            count,
        );

        match processed {
            None => {
                tracing::debug!(
                    object = %self.base.object,
                    "Previous sample empty, postponing post-processing"
                );
                Ok(Vec::new())
            }
            Some((matrix, stats)) => {
                if stats.wraps > 0 {
                    tracing::debug!(wraps = stats.wraps, "Counter wraps this cycle");
                }
                Ok(vec![matrix])
            }
        }
    }
}

/// A perf row holds its fields in a `properties` array; `id` is the one
/// top-level exception.
fn parse_property<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    if name == "id" {
        return record.get("id");
    }
    record
        .get("properties")
        .and_then(Value::as_array)?
        .iter()
        .find(|p| p.get("name").and_then(Value::as_str) == Some(name))?
        .get("value")
}

enum CounterValue {
    Scalar(String),
    Array(Vec<(String, String)>),
}

/// A counter arrives as `{name, value}` or, for array counters, as
/// `{name, values, labels}` with aligned element order.
fn counter_value(record: &Value, name: &str) -> Option<CounterValue> {
    let counter = record
        .get("counters")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("name").and_then(Value::as_str) == Some(name))?;

    if let Some(value) = counter.get("value") {
        return Some(CounterValue::Scalar(json_to_string(value)));
    }

    let values = counter.get("values").and_then(Value::as_array)?;
    let labels = counter.get("labels").and_then(Value::as_array)?;
    if values.len() != labels.len() {
        tracing::warn!(counter = name, "Labels do not match parsed values");
        return None;
    }
    Some(CounterValue::Array(
        labels
            .iter()
            .map(json_to_string)
            .zip(values.iter().map(json_to_string))
            .collect(),
    ))
}
