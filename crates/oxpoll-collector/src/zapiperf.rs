//! XML performance collector. The counter schema comes from
//! `perf-object-counter-list-info`, samples from
//! `perf-object-get-instances`; post-processing is shared with the REST
//! perf collector.

use crate::base::{CollectorBase, TASK_COUNTER, TASK_DATA, TASK_INSTANCE};
use crate::client::zapi::ZapiClient;
use crate::perf::{self, PerfCache, TIMESTAMP_METRIC};
use crate::template::{parse_counters, parse_export_options, CounterDef, CounterKind};
use crate::{Collector, InstanceDiff};
use async_trait::async_trait;
use oxpoll_common::error::{Error, Result};
use oxpoll_common::tree::Node;
use oxpoll_matrix::{CounterMeta, Matrix, Property, With};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const BATCH_SIZE: &str = "500";

pub struct ZapiPerf {
    pub(crate) base: CollectorBase,
    pub(crate) client: ZapiClient,
    pub(crate) query: String,
    pub(crate) counters: Vec<CounterDef>,
    pub(crate) perf: PerfCache,
    instance_key_field: String,
}

impl ZapiPerf {
    pub fn new(base: CollectorBase, client: ZapiClient) -> Result<Self> {
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

        let instance_key_field = base
            .params
            .get_child_content("instance_key")
            .filter(|k| !k.is_empty())
            .unwrap_or("uuid")
            .to_string();

        Ok(ZapiPerf {
            base,
            client,
            query,
            counters,
            perf,
            instance_key_field,
        })
    }

    fn requested_metrics(&self) -> HashSet<String> {
        self.counters
            .iter()
            .filter(|c| c.kind == CounterKind::Metric)
            .map(|c| c.path.clone())
            .collect()
    }

    fn display_for(&self, name: &str) -> String {
        self.counters
            .iter()
            .find(|def| def.kind == CounterKind::Metric && def.path == name)
            .map(|def| def.display.clone())
            .unwrap_or_else(|| name.to_string())
    }

    fn is_workload_detail(&self) -> bool {
        self.base.params.has_child("resource_map")
    }

    fn override_for(&self, counter: &str) -> Option<String> {
        self.base
            .params
            .get_child("override")
            .and_then(|o| o.get_child_content(counter))
            .map(str::to_string)
    }
}

/// The schema lists properties as a comma list (`"average,no-display"`);
/// the post-processing class is the first token that names one.
fn parse_property_list(raw: &str) -> Option<Property> {
    raw.split(',')
        .map(str::trim)
        .find_map(|token| token.parse::<Property>().ok())
}

#[async_trait]
impl Collector for ZapiPerf {
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
        Ok(())
    }

    async fn poll_counter(&mut self) -> Result<()> {
        let api_start = Instant::now();
        let mut request = Node::new("perf-object-counter-list-info");
        request.new_child("objectname", self.query.clone());
        let results = self.client.invoke(&request).await?;
        let api_elapsed = api_start.elapsed();

        let parse_start = Instant::now();
        let schema = results
            .get_child("counters")
            .ok_or_else(|| Error::Protocol(format!("{}: response has no counters", self.query)))?;

        let mut wanted = self.requested_metrics();

        // denominators of requested counters join the set, unexported
        for info in schema.iter_children() {
            let name = info.get_child_content("name").unwrap_or_default();
            if !wanted.contains(name) {
                continue;
            }
            let base_counter = info.get_child_content("base-counter").unwrap_or_default();
            if !base_counter.is_empty() && !wanted.contains(base_counter) {
                if self.base.matrix.get_metric(base_counter).is_none() {
                    let metric = self.base.matrix.new_metric_float64(base_counter)?;
                    metric.set_exportable(false);
                }
                wanted.insert(base_counter.to_string());
            }
        }

        let mut count = 0u64;
        for info in schema.iter_children() {
            let name = info.get_child_content("name").unwrap_or_default().to_string();
            if !wanted.contains(&name) || self.perf.counters.contains_key(&name) {
                continue;
            }
            let properties = self
                .override_for(&name)
                .unwrap_or_else(|| info.get_child_content("properties").unwrap_or_default().to_string());
            let property = match parse_property_list(&properties) {
                Some(p) => p,
                None => {
                    tracing::warn!(counter = %name, properties = %properties, "Unknown counter type, treating as raw");
                    Property::Raw
                }
            };
            self.perf.counters.insert(
                name.clone(),
                CounterMeta {
                    name: name.clone(),
                    description: info.get_child_content("desc").unwrap_or_default().to_string(),
                    property,
                    unit: info.get_child_content("unit").unwrap_or_default().to_string(),
                    denominator: info
                        .get_child_content("base-counter")
                        .filter(|b| !b.is_empty())
                        .map(str::to_string),
                },
            );
            count += 1;
        }

        perf::ensure_timestamp_metric(&mut self.base.matrix, &mut self.perf.counters);
        if self.is_workload_detail() {
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
        let api_start = Instant::now();
        let mut names = Vec::new();
        let mut tag: Option<String> = None;
        loop {
            let mut request = Node::new("perf-object-instance-list-info-iter");
            request.new_child("objectname", self.query.clone());
            request.new_child("max-records", BATCH_SIZE);
            if let Some(t) = &tag {
                request.new_child("tag", t.clone());
            }
            let results = self.client.invoke(&request).await?;
            if let Some(list) = results.get_child("attributes-list") {
                for info in list.iter_children() {
                    if let Some(key) = info.get_child_content(&self.instance_key_field) {
                        names.push(key.to_string());
                    }
                }
            }
            tag = results
                .get_child_content("next-tag")
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if tag.is_none() {
                break;
            }
        }
        let api_elapsed = api_start.elapsed();

        if names.is_empty() {
            return Err(Error::NoInstance(format!(
                "no {} instances on cluster",
                self.base.object
            )));
        }

        let parse_start = Instant::now();
        let mut stale: HashSet<String> = self.base.matrix.instance_keys().into_iter().collect();
        let mut added = 0u64;
        for key in &names {
            if !stale.remove(key) {
                self.base.matrix.new_instance(key.clone())?;
                added += 1;
            }
        }
        let removed = stale.len() as u64;
        for key in stale {
            self.base.matrix.remove_instance(&key);
        }

        self.base.record_cycle(
            TASK_INSTANCE,
            api_elapsed,
            parse_start.elapsed(),
            Duration::ZERO,
            names.len() as u64,
        );
        Ok(InstanceDiff { added, removed })
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
        let workload_detail = self.is_workload_detail();

        let api_start = Instant::now();
        let mut request = Node::new("perf-object-get-instances");
        request.new_child("objectname", self.query.clone());
        request.new_child("max-records", BATCH_SIZE);
        let timestamp = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default() as f64
            / 1e9;
        let results = self.client.invoke(&request).await?;
        let api_elapsed = api_start.elapsed();

        let instances = results
            .get_child("instances")
            .ok_or_else(|| Error::Protocol(format!("{}: response has no instances", self.query)))?;
        if instances.children_len() == 0 {
            return Err(Error::NoInstance(format!(
                "no {} instances on cluster",
                self.base.object
            )));
        }

        let parse_start = Instant::now();
        let mut count = 0u64;

        for instance_data in instances.iter_children() {
            let Some(raw_key) = instance_data.get_child_content(&self.instance_key_field) else {
                tracing::warn!(object = %self.base.object, "Skipping instance without key");
                continue;
            };

            let (key, layer) = if workload_detail {
                match raw_key.split_once('.') {
                    Some((key, layer)) => (key.to_string(), Some(layer.to_string())),
                    None => {
                        tracing::warn!(key = %raw_key, "Detail key has unexpected format");
                        continue;
                    }
                }
            } else {
                (raw_key.to_string(), None)
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

            let Some(counters) = instance_data.get_child("counters") else {
                continue;
            };
            for counter in counters.iter_children() {
                let name = counter.get_child_content("name").unwrap_or_default();
                let Some(value) = counter.get_child_content("value") else {
                    continue;
                };
                if name == TIMESTAMP_METRIC {
                    continue;
                }

                if workload_detail {
                    if name == "service_time" || name == "wait_time" {
                        if let (Some(layer), Ok(number)) = (&layer, value.parse::<f64>()) {
                            data.add_value(layer, &key, number)?;
                            count += 1;
                        }
                        continue;
                    }
                    if name == "visits" {
                        continue;
                    }
                }

                if data.get_metric(name).is_none() && !self.perf.counters.contains_key(name) {
                    continue;
                }

                match counter.get_child_content("labels").filter(|l| !l.is_empty()) {
                    None => match data.set_value_string(name, &key, value) {
                        Ok(()) => count += 1,
                        Err(Error::Parse { .. }) => {
                            tracing::debug!(metric = %name, "Unparseable cell skipped");
                        }
                        Err(Error::Missing { .. }) => {}
                        Err(e) => return Err(e),
                    },
                    Some(labels) => {
                        // array counter: aligned comma lists of buckets
                        // and values
                        let buckets: Vec<&str> = labels.split(',').map(str::trim).collect();
                        let values: Vec<&str> = value.split(',').map(str::trim).collect();
                        if buckets.len() != values.len() {
                            tracing::warn!(counter = %name, "Labels do not match parsed values");
                            continue;
                        }
                        for (bucket, text) in buckets.iter().zip(values) {
                            let column = format!("{name}#{bucket}");
                            if data.get_metric(&column).is_none() {
                                let display = self.display_for(name);
                                let metric = data.new_metric_float64(column.clone())?;
                                metric.set_name(display);
                                metric.set_label(*bucket);
                                metric.set_array(true);
                            }
                            match data.set_value_string(&column, &key, text) {
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
            Some((matrix, _stats)) => Ok(vec![matrix]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_lists_take_the_first_known_class() {
        assert_eq!(parse_property_list("rate"), Some(Property::Rate));
        assert_eq!(
            parse_property_list("average,no-zero-values"),
            Some(Property::Average)
        );
        assert_eq!(parse_property_list("string,no-display"), None);
    }
}
